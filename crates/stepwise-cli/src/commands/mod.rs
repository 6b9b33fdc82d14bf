//! CLI command implementations.

pub mod check;
pub mod checkpoints;
pub mod config;

pub use check::run_check;
pub use checkpoints::run_checkpoints;
pub use config::run_config;
