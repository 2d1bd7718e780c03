//! Sandbox handle - one container and its protocol endpoint
//!
//! The handle exists from the moment a launch is requested; the container id
//! and endpoint are filled in as the launch progresses.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::DockerClient;
use crate::backend::sandbox::SandboxRuntime;
use crate::backend::{BackendError, ExecOutput};

pub struct SandboxHandle {
    /// Name the sandbox is tracked by
    pub name: String,
    docker: Arc<DockerClient>,
    container_id: RwLock<Option<String>>,
    endpoint: RwLock<Option<SocketAddr>>,
    workdir: String,
    created_at: Instant,
}

impl SandboxHandle {
    pub fn new(name: impl Into<String>, docker: Arc<DockerClient>, workdir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docker,
            container_id: RwLock::new(None),
            endpoint: RwLock::new(None),
            workdir: workdir.into(),
            created_at: Instant::now(),
        }
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id.read().map(|id| id.clone()).unwrap_or_default()
    }

    pub(crate) fn set_container_id(&self, id: String) {
        if let Ok(mut slot) = self.container_id.write() {
            *slot = Some(id);
        }
    }

    pub(crate) fn set_endpoint(&self, addr: Option<SocketAddr>) {
        if let Ok(mut slot) = self.endpoint.write() {
            *slot = addr;
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[async_trait]
impl SandboxRuntime for SandboxHandle {
    fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint.read().map(|addr| *addr).unwrap_or(None)
    }

    async fn exec(&self, argv: &[String], deadline: Duration) -> Result<ExecOutput, BackendError> {
        let Some(id) = self.container_id() else {
            return Err(BackendError::Unavailable(format!(
                "sandbox {} has no container",
                self.name
            )));
        };
        let output = tokio::time::timeout(deadline, self.docker.exec(&id, argv, Some(&self.workdir)))
            .await
            .map_err(|_| BackendError::Unavailable(format!("container exec timed out after {:?}", deadline)))?
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.exit_code as i32,
            truncated: false,
            timed_out: false,
        })
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("name", &self.name)
            .field("container_id", &self.container_id())
            .field("endpoint", &self.endpoint())
            .field("age", &self.age())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_without_container_is_unavailable() {
        let handle = SandboxHandle::new("sb", Arc::new(DockerClient::new("/nonexistent.sock")), "/workspace");
        assert!(handle.endpoint().is_none());
        let err = handle
            .exec(&["true".to_string()], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[test]
    fn test_fields_fill_in() {
        let handle = SandboxHandle::new("sb", Arc::new(DockerClient::new("/nonexistent.sock")), "/workspace");
        handle.set_container_id("abc".into());
        handle.set_endpoint(Some("127.0.0.1:4000".parse().unwrap()));
        assert_eq!(handle.container_id().as_deref(), Some("abc"));
        assert_eq!(handle.endpoint(), Some("127.0.0.1:4000".parse().unwrap()));
    }
}
