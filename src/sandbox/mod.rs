//! Container sandboxes
//!
//! This module manages the containers behind sandboxed backends:
//! - Container daemon client over its Unix socket
//! - Per-sandbox handle (container id, published protocol endpoint)
//! - Registry of sandboxes by name with asynchronous launch

pub mod docker;
pub mod handle;
pub mod manager;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::DockerClient;
pub use handle::SandboxHandle;
pub use manager::SandboxManager;

/// Where the server binary is mounted inside every sandbox
pub const AGENT_MOUNT_PATH: &str = "/opt/agentvisor/sandbox_agent";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container image sandboxes are created from
    pub image: String,
    /// Prefix of generated sandbox names
    pub name_prefix: String,
    /// Port the in-sandbox server listens on
    pub protocol_port: u16,
    /// How long the fast path is skipped after it fails
    pub degrade_cooldown_secs: u64,
    /// Upper bound on container start plus server readiness
    pub launch_timeout_secs: u64,
    /// Host path of the `sandbox_agent` binary
    pub agent_binary: PathBuf,
    /// Container daemon API socket
    pub docker_socket: PathBuf,
    /// Working directory inside the container
    pub container_workdir: String,
    /// Bind-mount the backend workdir at `container_workdir`
    pub mount_workdir: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            name_prefix: "agentvisor".to_string(),
            protocol_port: crate::protocol::DEFAULT_PORT,
            degrade_cooldown_secs: 30,
            launch_timeout_secs: 60,
            agent_binary: PathBuf::from("./target/release/sandbox_agent"),
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            container_workdir: "/workspace".to_string(),
            mount_workdir: true,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DockerError {
    #[error("daemon connection failed: {0}")]
    Connection(String),
    #[error("daemon returned {status} for {endpoint}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("unexpected daemon response: {0}")]
    Decode(String),
    #[error("{0}")]
    Config(String),
}
