//! Execution environment contract.
//!
//! Tools never touch the filesystem or spawn processes directly. They go
//! through an [`ExecutionEnvironment`], which may be local, a container, or
//! a remote sandbox. The security gate decides whether a call is allowed;
//! the environment only performs it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::glob;

/// Maximum entries returned by a single glob.
const MAX_GLOB_RESULTS: usize = 1000;

/// Environment errors.
#[derive(Error, Debug)]
pub enum EnvironmentError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The environment cannot serve the request.
    #[error("Environment unavailable: {0}")]
    Unavailable(String),
}

/// Output of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code; -1 if killed by a signal.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Filesystem and process operations available to tools.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Read a UTF-8 file.
    async fn read_file(&self, path: &Path) -> Result<String, EnvironmentError>;

    /// Paths under `base` whose relative path matches `pattern`.
    async fn glob(&self, pattern: &str, base: &Path) -> Result<Vec<PathBuf>, EnvironmentError>;

    /// Run a shell command in `cwd`.
    async fn exec(&self, command: &str, cwd: &Path) -> Result<ExecOutput, EnvironmentError>;

    /// Working directory of the environment.
    async fn get_cwd(&self) -> Result<PathBuf, EnvironmentError>;
}

/// Environment backed by the local machine.
#[derive(Debug, Clone)]
pub struct LocalEnvironment {
    cwd: PathBuf,
}

impl LocalEnvironment {
    /// Create an environment rooted at `cwd`.
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    /// Create an environment at the process working directory.
    ///
    /// # Errors
    ///
    /// Returns error if the working directory cannot be read.
    pub fn current() -> Result<Self, EnvironmentError> {
        Ok(Self::new(std::env::current_dir()?))
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalEnvironment {
    async fn read_file(&self, path: &Path) -> Result<String, EnvironmentError> {
        Ok(tokio::fs::read_to_string(self.cwd.join(path)).await?)
    }

    async fn glob(&self, pattern: &str, base: &Path) -> Result<Vec<PathBuf>, EnvironmentError> {
        let base = self.cwd.join(base);
        let mut matched = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path.clone());
                }

                let Ok(relative) = path.strip_prefix(&base) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                if glob::matches(&relative, pattern) {
                    matched.push(path);
                    if matched.len() >= MAX_GLOB_RESULTS {
                        tracing::debug!(pattern, "Glob result limit reached");
                        matched.sort();
                        return Ok(matched);
                    }
                }
            }
        }

        matched.sort();
        Ok(matched)
    }

    async fn exec(&self, command: &str, cwd: &Path) -> Result<ExecOutput, EnvironmentError> {
        let cwd = self.cwd.join(cwd);
        tracing::debug!(command, cwd = %cwd.display(), "Executing command");

        #[cfg(windows)]
        let mut cmd = {
            let mut c = tokio::process::Command::new("cmd");
            c.arg("/C").arg(command);
            c
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(command);
            c
        };

        let output = cmd.current_dir(&cwd).kill_on_drop(true).output().await?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn get_cwd(&self) -> Result<PathBuf, EnvironmentError> {
        Ok(self.cwd.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_file_relative_to_cwd() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("notes.txt"), "hello").unwrap();

        let env = LocalEnvironment::new(temp.path());
        assert_eq!(env.read_file(Path::new("notes.txt")).await.unwrap(), "hello");
        assert!(env.read_file(Path::new("missing.txt")).await.is_err());
    }

    #[tokio::test]
    async fn test_glob_recurses() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src/nested")).unwrap();
        std::fs::write(temp.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(temp.path().join("src/nested/mod.rs"), "").unwrap();
        std::fs::write(temp.path().join("README.md"), "").unwrap();

        let env = LocalEnvironment::new(temp.path());
        let found = env.glob("*.rs", Path::new(".")).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.extension().is_some_and(|e| e == "rs")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_captures_output() {
        let temp = tempdir().unwrap();
        let env = LocalEnvironment::new(temp.path());

        let ok = env.exec("echo hi", Path::new(".")).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hi");

        let failed = env.exec("exit 3", Path::new(".")).await.unwrap();
        assert_eq!(failed.exit_code, 3);
    }

    #[tokio::test]
    async fn test_get_cwd() {
        let env = LocalEnvironment::new("/work");
        assert_eq!(env.get_cwd().await.unwrap(), PathBuf::from("/work"));
    }
}
