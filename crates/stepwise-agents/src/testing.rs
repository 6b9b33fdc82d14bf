//! Test doubles shared by unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::environment::{EnvironmentError, ExecOutput, ExecutionEnvironment};

/// Environment that serves canned content and counts operations.
#[derive(Default)]
pub struct MockEnvironment {
    reads: AtomicUsize,
    execs: AtomicUsize,
}

impl MockEnvironment {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionEnvironment for MockEnvironment {
    async fn read_file(&self, path: &Path) -> Result<String, EnvironmentError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("contents of {}", path.display()))
    }

    async fn glob(&self, _pattern: &str, _base: &Path) -> Result<Vec<PathBuf>, EnvironmentError> {
        Ok(vec![])
    }

    async fn exec(&self, command: &str, _cwd: &Path) -> Result<ExecOutput, EnvironmentError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        Ok(ExecOutput {
            stdout: format!("ran {command}"),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn get_cwd(&self) -> Result<PathBuf, EnvironmentError> {
        Ok(PathBuf::from("/workspace"))
    }
}
