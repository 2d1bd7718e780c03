//! Sandbox Manager - creates, tracks and destroys sandboxes by name
//!
//! The SandboxManager is responsible for:
//! - Creating containers with the server binary mounted and its port published
//! - Launching in the background while handing out a backend immediately
//! - Reporting launch progress through a status watch channel
//! - Stop / restart / remove, and tearing everything down on shutdown

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::docker::ContainerSpec;
use super::{DockerClient, DockerError, SandboxHandle, AGENT_MOUNT_PATH};
use crate::backend::sandbox::SandboxRuntime;
use crate::backend::{BackendConfig, BackendStatus, SandboxBackend};
use crate::metrics::SANDBOXES_ACTIVE;
use crate::protocol::ProtocolClient;

/// Seconds a container gets to stop before it is killed
const STOP_GRACE_SECS: u64 = 5;

/// Delay between readiness probes of the in-sandbox server
const PROBE_INTERVAL_MS: u64 = 200;

struct SandboxEntry {
    handle: Arc<SandboxHandle>,
    backend: Arc<SandboxBackend>,
    status: watch::Sender<BackendStatus>,
    launch: Option<JoinHandle<()>>,
}

pub struct SandboxManager {
    docker: Arc<DockerClient>,
    config: BackendConfig,
    sandboxes: Mutex<HashMap<String, SandboxEntry>>,
}

impl SandboxManager {
    /// # Arguments
    /// * `config` - Backend settings every sandbox is created with
    pub fn new(config: BackendConfig) -> Self {
        let docker = Arc::new(DockerClient::new(config.sandbox.docker_socket.clone()));
        Self {
            docker,
            config,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// A fresh sandbox name using the configured prefix
    pub fn generate_name(&self) -> String {
        let id = Uuid::now_v7().simple().to_string();
        format!("{}-{}", self.config.sandbox.name_prefix, &id[id.len() - 12..])
    }

    /// Request a sandbox, returning its backend immediately
    ///
    /// The container is created and started in the background. The backend's
    /// status moves from `Starting` to `Ready` or `Failed`; calls made before
    /// then wait for the outcome. Launching a name that is already tracked
    /// returns the existing backend.
    pub async fn launch(&self, name: &str) -> Arc<SandboxBackend> {
        let mut sandboxes = self.sandboxes.lock().await;
        if let Some(entry) = sandboxes.get(name) {
            return entry.backend.clone();
        }

        let handle = Arc::new(SandboxHandle::new(
            name,
            self.docker.clone(),
            self.config.sandbox.container_workdir.clone(),
        ));
        let (status_tx, status_rx) = watch::channel(BackendStatus::Starting);
        let runtime: Arc<dyn SandboxRuntime> = handle.clone();
        let backend = Arc::new(SandboxBackend::new(name, self.config.clone(), runtime, status_rx));

        let launch = tokio::spawn(
            launch_container(
                self.docker.clone(),
                handle.clone(),
                self.config.clone(),
                status_tx.clone(),
            )
            .instrument(info_span!("sandbox_launch", sandbox = %name, otel.name = "sandbox_launch")),
        );

        sandboxes.insert(
            name.to_string(),
            SandboxEntry {
                handle,
                backend: backend.clone(),
                status: status_tx,
                launch: Some(launch),
            },
        );
        SANDBOXES_ACTIVE.inc();
        backend
    }

    pub async fn get(&self, name: &str) -> Option<Arc<SandboxBackend>> {
        self.sandboxes.lock().await.get(name).map(|e| e.backend.clone())
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sandboxes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn status(&self, name: &str) -> Option<BackendStatus> {
        self.sandboxes
            .lock()
            .await
            .get(name)
            .map(|e| e.status.borrow().clone())
    }

    pub async fn stop(&self, name: &str) -> Result<(), DockerError> {
        let (handle, status) = self.entry_parts(name).await?;
        let id = container_id(&handle)?;
        self.docker.stop_container(&id, STOP_GRACE_SECS).await?;
        handle.set_endpoint(None);
        status.send_replace(BackendStatus::Stopped);
        info!(sandbox = %name, "Sandbox stopped");
        Ok(())
    }

    /// Restart the container and wait for its server to come back
    pub async fn restart(&self, name: &str) -> Result<(), DockerError> {
        let (handle, status) = self.entry_parts(name).await?;
        let id = container_id(&handle)?;
        status.send_replace(BackendStatus::Starting);
        let result = async {
            self.docker.restart_container(&id, STOP_GRACE_SECS).await?;
            await_server(&self.docker, &handle, &self.config).await
        }
        .await;
        match &result {
            Ok(()) => {
                status.send_replace(BackendStatus::Ready);
                info!(sandbox = %name, "Sandbox restarted");
            }
            Err(e) => {
                status.send_replace(BackendStatus::Failed(e.to_string()));
            }
        }
        result
    }

    /// Stop tracking a sandbox and force-remove its container
    pub async fn remove(&self, name: &str) -> Result<(), DockerError> {
        let entry = self
            .sandboxes
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| DockerError::NotFound(name.to_string()))?;
        SANDBOXES_ACTIVE.dec();
        self.teardown(name, entry).await
    }

    /// Remove every sandbox this manager created
    pub async fn shutdown(&self) {
        let entries: Vec<(String, SandboxEntry)> = self.sandboxes.lock().await.drain().collect();
        if !entries.is_empty() {
            info!(count = entries.len(), "Removing sandboxes");
        }
        for (name, entry) in entries {
            SANDBOXES_ACTIVE.dec();
            if let Err(e) = self.teardown(&name, entry).await {
                warn!(sandbox = %name, error = %e, "Failed to remove sandbox");
            }
        }
    }

    async fn teardown(&self, name: &str, mut entry: SandboxEntry) -> Result<(), DockerError> {
        if let Some(launch) = entry.launch.take() {
            launch.abort();
        }
        entry.handle.set_endpoint(None);
        entry.status.send_replace(BackendStatus::Stopped);
        // A launch aborted before create leaves nothing to remove
        let target = entry.handle.container_id().unwrap_or_else(|| name.to_string());
        self.docker.remove_container(&target).await?;
        info!(sandbox = %name, "Sandbox removed");
        Ok(())
    }

    async fn entry_parts(
        &self,
        name: &str,
    ) -> Result<(Arc<SandboxHandle>, watch::Sender<BackendStatus>), DockerError> {
        self.sandboxes
            .lock()
            .await
            .get(name)
            .map(|e| (e.handle.clone(), e.status.clone()))
            .ok_or_else(|| DockerError::NotFound(name.to_string()))
    }
}

fn container_id(handle: &SandboxHandle) -> Result<String, DockerError> {
    handle
        .container_id()
        .ok_or_else(|| DockerError::NotFound(handle.name.clone()))
}

/// Container spec for a sandbox running the server binary as its main process
pub fn container_spec(config: &BackendConfig) -> Result<ContainerSpec, DockerError> {
    let sandbox = &config.sandbox;
    let agent = absolute(&sandbox.agent_binary)?;
    let mut binds = vec![format!("{}:{}:ro", agent, AGENT_MOUNT_PATH)];
    if sandbox.mount_workdir {
        binds.push(format!("{}:{}", absolute(&config.workdir)?, sandbox.container_workdir));
    }
    Ok(ContainerSpec {
        image: sandbox.image.clone(),
        cmd: vec![
            AGENT_MOUNT_PATH.to_string(),
            "--listen".to_string(),
            format!("0.0.0.0:{}", sandbox.protocol_port),
            "--root".to_string(),
            sandbox.container_workdir.clone(),
            "--timeout-secs".to_string(),
            config.timeout_secs.to_string(),
            "--max-output-bytes".to_string(),
            config.max_output_bytes.to_string(),
            "--max-results".to_string(),
            config.max_search_results.to_string(),
        ],
        workdir: sandbox.container_workdir.clone(),
        binds,
        publish_port: sandbox.protocol_port,
    })
}

fn absolute(path: &Path) -> Result<String, DockerError> {
    std::fs::canonicalize(path)
        .map(|p| p.display().to_string())
        .map_err(|e| DockerError::Config(format!("{}: {}", path.display(), e)))
}

async fn launch_container(
    docker: Arc<DockerClient>,
    handle: Arc<SandboxHandle>,
    config: BackendConfig,
    status: watch::Sender<BackendStatus>,
) {
    let start_time = Instant::now();
    let result = async {
        let spec = container_spec(&config)?;
        let id = docker.create_container(&handle.name, &spec).await?;
        handle.set_container_id(id.clone());
        docker.start_container(&id).await?;
        await_server(&docker, &handle, &config).await
    }
    .await;

    match result {
        Ok(()) => {
            info!(
                sandbox = %handle.name,
                launch_secs = start_time.elapsed().as_secs_f64(),
                "Sandbox ready"
            );
            status.send_replace(BackendStatus::Ready);
        }
        Err(e) => {
            warn!(sandbox = %handle.name, error = %e, "Sandbox launch failed");
            status.send_replace(BackendStatus::Failed(e.to_string()));
        }
    }
}

/// Resolve the published endpoint and wait until the server accepts connections
async fn await_server(
    docker: &DockerClient,
    handle: &SandboxHandle,
    config: &BackendConfig,
) -> Result<(), DockerError> {
    let id = container_id(handle)?;
    let deadline = Duration::from_secs(config.sandbox.launch_timeout_secs);
    let attempts = (deadline.as_millis() as u64 / PROBE_INTERVAL_MS).max(1) as u32;

    let addr = docker
        .published_port(&id, config.sandbox.protocol_port)
        .await?
        .ok_or_else(|| DockerError::Decode(format!("container {} has no published protocol port", id)))?;
    handle.set_endpoint(Some(addr));

    ProtocolClient::connect_with_retry(addr, attempts, PROBE_INTERVAL_MS)
        .await
        .map_err(|e| DockerError::Connection(format!("sandbox server at {} not reachable: {}", addr, e)))?;
    Ok(())
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        if let Ok(sandboxes) = self.sandboxes.try_lock() {
            for entry in sandboxes.values() {
                if let Some(launch) = &entry.launch {
                    launch.abort();
                }
            }
        }
    }
}
