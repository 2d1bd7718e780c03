//! Backend executing directly on the host

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::fs::HostFilesystem;
use super::process::run_shell;
use super::{Backend, BackendConfig, BackendError, ExecOutput, Filesystem};

pub struct LocalBackend {
    name: String,
    config: BackendConfig,
    fs: HostFilesystem,
}

impl LocalBackend {
    pub fn new(config: BackendConfig) -> Self {
        let fs = HostFilesystem::new(config.workdir.clone(), config.max_search_results);
        Self {
            name: "local".to_string(),
            config,
            fs,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn workdir(&self, workdir: Option<&str>) -> PathBuf {
        match workdir {
            Some(dir) => self.fs.resolve(dir),
            None => self.config.workdir.clone(),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn exec(&self, command: &str, workdir: Option<&str>) -> Result<ExecOutput, BackendError> {
        let dir = self.workdir(workdir);
        debug!(backend = %self.name, workdir = %dir.display(), "Executing command");
        run_shell(command, &dir, self.config.exec_limits())
            .await
            .map_err(|e| BackendError::Exec(e.to_string()))
    }

    fn filesystem(&self) -> &dyn Filesystem {
        &self.fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &std::path::Path) -> LocalBackend {
        LocalBackend::new(BackendConfig {
            workdir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_exec_and_filesystem_share_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        backend.filesystem().write("hello.txt", "hi there").await.unwrap();
        let out = backend.exec("cat hello.txt", None).await.unwrap();
        assert_eq!(out.stdout, "hi there");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_exec_relative_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let backend = backend(dir.path());
        let out = backend.exec("pwd", Some("sub")).await.unwrap();
        assert!(out.stdout.trim_end().ends_with("sub"));
    }

    #[tokio::test]
    async fn test_missing_workdir_is_exec_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let err = backend.exec("true", Some("nope")).await.unwrap_err();
        assert!(matches!(err, BackendError::Exec(_)));
    }
}
