//! Execution backends
//!
//! A backend binds command execution and filesystem access to a place where
//! they happen: the host ([`LocalBackend`]) or a container reached through
//! the sandbox protocol ([`SandboxBackend`]). Tools only see the [`Backend`]
//! and [`Filesystem`] traits, so filesystem semantics are identical on both.

pub mod fs;
pub mod local;
pub mod process;
pub mod sandbox;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::sandbox::SandboxConfig;

pub use self::fs::HostFilesystem;
pub use self::local::LocalBackend;
pub use self::process::ExecLimits;
pub use self::sandbox::{ConnectionState, SandboxBackend};

/// Where commands run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Sandbox,
}

/// Configuration for a backend; immutable once the backend is built
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Default working directory; relative paths resolve against it
    pub workdir: PathBuf,
    /// Wall-clock limit for one exec
    pub timeout_secs: u64,
    /// Per-stream cap on captured exec output
    pub max_output_bytes: usize,
    /// Maximum matches returned by glob and grep
    pub max_search_results: usize,
    pub sandbox: SandboxConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            workdir: PathBuf::from("."),
            timeout_secs: 120,
            max_output_bytes: 100 * 1024,
            max_search_results: 1000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn exec_limits(&self) -> ExecLimits {
        ExecLimits {
            timeout: self.timeout(),
            max_output_bytes: self.max_output_bytes,
        }
    }
}

/// Readiness of a backend, reported through the event sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum BackendStatus {
    Starting,
    Ready,
    Failed(String),
    Stopped,
}

impl BackendStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, BackendStatus::Ready)
    }
}

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Some output was dropped because it exceeded the cap
    #[serde(default)]
    pub truncated: bool,
    /// The command was killed at the deadline
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecOutput {
    /// Text handed back to the model
    pub fn render(&self) -> String {
        let mut text = format!(
            "Exit code: {}\nStdout:\n{}\nStderr:\n{}",
            self.exit_code, self.stdout, self.stderr
        );
        if self.truncated {
            text.push_str("\n(Output truncated)");
        }
        if self.timed_out {
            text.push_str("\n(Execution timed out)");
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Bounded search result; `truncated` is set iff the bound was reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult<T> {
    pub matches: Vec<T>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    /// 1-based line number
    pub line: usize,
    pub text: String,
}

/// Failure of a filesystem operation itself
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("old_text not found in {0}")]
    EditTextNotFound(String),
    #[error("invalid pattern: {0}")]
    Pattern(String),
    #[error("io error: {0}")]
    Io(String),
    /// Error reported by the in-sandbox server, already rendered
    #[error("{0}")]
    Remote(String),
}

impl FsError {
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            _ => FsError::Io(format!("{}: {}", path, err)),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error(transparent)]
    Fs(#[from] FsError),
    /// Command could not be started
    #[error("exec failed: {0}")]
    Exec(String),
    /// No execution path could reach the backend
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn ls(&self, path: &str) -> Result<Vec<FileEntry>, BackendError>;

    /// Read a file, optionally a window of `limit` lines starting at line `offset` (0-based)
    async fn read(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, BackendError>;

    async fn write(&self, path: &str, content: &str) -> Result<(), BackendError>;

    /// Replace the first literal occurrence of `old_text`
    async fn edit(&self, path: &str, old_text: &str, new_text: &str) -> Result<(), BackendError>;

    async fn glob(&self, pattern: &str, path: Option<&str>) -> Result<SearchResult<String>, BackendError>;

    async fn grep(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<SearchResult<GrepMatch>, BackendError>;
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &BackendConfig;

    /// Run `command` through a shell, bounded by the configured timeout and output cap
    async fn exec(&self, command: &str, workdir: Option<&str>) -> Result<ExecOutput, BackendError>;

    fn filesystem(&self) -> &dyn Filesystem;

    fn status(&self) -> BackendStatus {
        BackendStatus::Ready
    }

    /// Launch progress updates, for backends that start asynchronously
    fn watch_status(&self) -> Option<watch::Receiver<BackendStatus>> {
        None
    }
}
