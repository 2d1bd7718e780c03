//! Backend executing inside a container sandbox
//!
//! Every call first tries the persistent protocol connection (fast path).
//! Any transport failure falls back to running the server binary in one-shot
//! mode through container exec, and the connection moves to
//! [`ConnectionState::Degraded`] so later calls skip the fast path until the
//! cooldown elapses.
//!
//! ```text
//!              fast ok                        fast fails
//! Available ───────────► Available   Available ─────────► Degraded(now + cooldown)
//! Degraded  ──(expired, probe ok)──► Available
//! any       ──(fast and fallback both fail)──► Unavailable ──(next call probes)──►
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{
    Backend, BackendConfig, BackendError, BackendStatus, ExecOutput, FileEntry, Filesystem, FsError,
    GrepMatch, SearchResult,
};
use crate::metrics::{SANDBOX_FALLBACKS, SANDBOX_FAST_PATH};
use crate::protocol::{
    EditArgs, ExecArgs, GlobArgs, GrepArgs, LsArgs, Op, ProtocolClient, ProtocolError, ReadArgs,
    Request, Response, WriteArgs,
};
use crate::sandbox::AGENT_MOUNT_PATH;

/// Deadline for one filesystem round trip
const FS_DEADLINE: Duration = Duration::from_secs(30);

/// Extra time an exec round trip gets beyond the command timeout
const EXEC_GRACE: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// What the backend needs from a running sandbox
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Host address of the in-sandbox server, once published
    fn endpoint(&self) -> Option<SocketAddr>;

    /// Run `argv` inside the sandbox without a shell
    async fn exec(&self, argv: &[String], deadline: Duration) -> Result<ExecOutput, BackendError>;
}

/// Whether the fast protocol path is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Available,
    /// Skip the fast path until the instant passes
    Degraded { until: Instant },
    /// Both paths failed on the last call
    Unavailable,
}

impl ConnectionState {
    fn should_attempt(&self, now: Instant) -> bool {
        match self {
            ConnectionState::Available | ConnectionState::Unavailable => true,
            ConnectionState::Degraded { until } => now >= *until,
        }
    }
}

struct FastPath {
    state: ConnectionState,
    client: Option<ProtocolClient>,
}

pub struct SandboxBackend {
    name: String,
    config: BackendConfig,
    runtime: Arc<dyn SandboxRuntime>,
    status: watch::Receiver<BackendStatus>,
    fast: Mutex<FastPath>,
    cooldown: Duration,
}

impl SandboxBackend {
    /// # Arguments
    /// * `name` - Sandbox name
    /// * `config` - Backend limits and sandbox settings
    /// * `runtime` - The sandbox's endpoint and exec channel
    /// * `status` - Launch progress; calls wait until it leaves `Starting`
    pub fn new(
        name: impl Into<String>,
        config: BackendConfig,
        runtime: Arc<dyn SandboxRuntime>,
        status: watch::Receiver<BackendStatus>,
    ) -> Self {
        let cooldown = Duration::from_secs(config.sandbox.degrade_cooldown_secs);
        Self {
            name: name.into(),
            config,
            runtime,
            status,
            fast: Mutex::new(FastPath {
                state: ConnectionState::Available,
                client: None,
            }),
            cooldown,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.fast.lock().await.state
    }

    async fn wait_ready(&self) -> Result<(), BackendError> {
        let launch_timeout = Duration::from_secs(self.config.sandbox.launch_timeout_secs);
        let mut rx = self.status.clone();
        let status = timeout(
            launch_timeout,
            rx.wait_for(|s| !matches!(s, BackendStatus::Starting)),
        )
        .await
        .map(|r| r.map(|s| s.clone()));

        match status {
            Ok(Ok(BackendStatus::Ready)) => Ok(()),
            Ok(Ok(BackendStatus::Failed(reason))) => Err(BackendError::Unavailable(format!(
                "sandbox {} failed to start: {}",
                self.name, reason
            ))),
            Ok(Ok(_)) => Err(BackendError::Unavailable(format!("sandbox {} is stopped", self.name))),
            Ok(Err(_)) => Err(BackendError::Unavailable(format!(
                "sandbox {} is no longer managed",
                self.name
            ))),
            Err(_) => Err(BackendError::Unavailable(format!(
                "sandbox {} not ready after {:?}",
                self.name, launch_timeout
            ))),
        }
    }

    /// Run one request through the fast path, falling back when it fails
    ///
    /// The fast-path lock is held for the whole round trip, so calls on one
    /// sandbox's connection run one at a time; a long `exec` delays a `read`
    /// issued alongside it. Both paths failing is reported as
    /// [`BackendError::Unavailable`].
    async fn call(&self, request: Request, deadline: Duration) -> Result<Response, BackendError> {
        self.wait_ready().await?;

        {
            let mut fast = self.fast.lock().await;
            if fast.state.should_attempt(Instant::now()) {
                match self.call_fast(&mut fast, &request, deadline).await {
                    Ok(response) => {
                        if fast.state != ConnectionState::Available {
                            info!(sandbox = %self.name, "Sandbox fast path restored");
                        }
                        fast.state = ConnectionState::Available;
                        SANDBOX_FAST_PATH.with_label_values(&["ok"]).inc();
                        return Ok(response);
                    }
                    Err(e) => {
                        warn!(sandbox = %self.name, op = %request.op, error = %e, "Sandbox fast path failed, falling back");
                        fast.client = None;
                        fast.state = ConnectionState::Degraded {
                            until: Instant::now() + self.cooldown,
                        };
                        SANDBOX_FAST_PATH.with_label_values(&["failed"]).inc();
                    }
                }
            } else {
                SANDBOX_FAST_PATH.with_label_values(&["skipped"]).inc();
            }
        }

        SANDBOX_FALLBACKS.with_label_values(&[request.op.as_str()]).inc();
        match self.call_fallback(&request, deadline).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(sandbox = %self.name, op = %request.op, error = %e, "Sandbox fallback failed");
                self.fast.lock().await.state = ConnectionState::Unavailable;
                Err(match e {
                    BackendError::Unavailable(message) => BackendError::Unavailable(message),
                    other => BackendError::Unavailable(format!(
                        "sandbox {} unreachable on both paths: {}",
                        self.name, other
                    )),
                })
            }
        }
    }

    async fn call_fast(
        &self,
        fast: &mut FastPath,
        request: &Request,
        deadline: Duration,
    ) -> Result<Response, ProtocolError> {
        // Out of the slot until a full response is read; a call dropped
        // mid-exchange leaves no half-used connection behind
        let mut client = match fast.client.take() {
            Some(client) => client,
            None => {
                let addr = self
                    .runtime
                    .endpoint()
                    .ok_or_else(|| ProtocolError::Io("sandbox endpoint not published".into()))?;
                ProtocolClient::connect(addr, CONNECT_TIMEOUT).await?
            }
        };
        let response = client.call(request, deadline).await?;
        fast.client = Some(client);
        Ok(response)
    }

    /// Arguments for a one-shot run of the server binary
    fn one_shot_argv(&self, request: &Request) -> Result<Vec<String>, BackendError> {
        let line = serde_json::to_string(request)
            .map_err(|e| BackendError::Exec(format!("failed to encode request: {}", e)))?;
        Ok(vec![
            AGENT_MOUNT_PATH.to_string(),
            "--root".to_string(),
            self.config.sandbox.container_workdir.clone(),
            "--timeout-secs".to_string(),
            self.config.timeout_secs.to_string(),
            "--max-output-bytes".to_string(),
            self.config.max_output_bytes.to_string(),
            "--max-results".to_string(),
            self.config.max_search_results.to_string(),
            "--request".to_string(),
            line,
        ])
    }

    async fn call_fallback(&self, request: &Request, deadline: Duration) -> Result<Response, BackendError> {
        let argv = self.one_shot_argv(request)?;
        let output = self.runtime.exec(&argv, deadline).await?;
        let line = output
            .stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();
        serde_json::from_str(line).map_err(|_| {
            BackendError::Unavailable(format!(
                "fallback returned no response (exit code {}): {}",
                output.exit_code,
                output.stderr.trim()
            ))
        })
    }

    async fn fs_request<A: Serialize, T: DeserializeOwned>(&self, op: Op, args: &A) -> Result<T, BackendError> {
        let request =
            Request::new(op, args).map_err(|e| BackendError::Fs(FsError::InvalidInput(e.to_string())))?;
        debug!(sandbox = %self.name, op = %op, "Sandbox filesystem call");
        self.call(request, FS_DEADLINE)
            .await?
            .into_result()
            .map_err(|e| BackendError::Fs(FsError::Remote(e.to_string())))
    }
}

#[async_trait]
impl Backend for SandboxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn exec(&self, command: &str, workdir: Option<&str>) -> Result<ExecOutput, BackendError> {
        let args = ExecArgs {
            command: command.to_string(),
            workdir: workdir.map(str::to_string),
            timeout_secs: Some(self.config.timeout_secs),
        };
        let request = Request::new(Op::Exec, &args).map_err(|e| BackendError::Exec(e.to_string()))?;
        self.call(request, self.config.timeout() + EXEC_GRACE)
            .await?
            .into_result()
            .map_err(|e| BackendError::Exec(e.to_string()))
    }

    fn filesystem(&self) -> &dyn Filesystem {
        self
    }

    fn status(&self) -> BackendStatus {
        self.status.borrow().clone()
    }

    fn watch_status(&self) -> Option<watch::Receiver<BackendStatus>> {
        Some(self.status.clone())
    }
}

#[async_trait]
impl Filesystem for SandboxBackend {
    async fn ls(&self, path: &str) -> Result<Vec<FileEntry>, BackendError> {
        self.fs_request(Op::Ls, &LsArgs { path: path.to_string() }).await
    }

    async fn read(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, BackendError> {
        let args = ReadArgs {
            path: path.to_string(),
            offset,
            limit,
        };
        self.fs_request(Op::Read, &args).await
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), BackendError> {
        let args = WriteArgs {
            path: path.to_string(),
            content: content.to_string(),
        };
        self.fs_request(Op::Write, &args).await
    }

    async fn edit(&self, path: &str, old_text: &str, new_text: &str) -> Result<(), BackendError> {
        let args = EditArgs {
            path: path.to_string(),
            old_text: old_text.to_string(),
            new_text: new_text.to_string(),
        };
        self.fs_request(Op::Edit, &args).await
    }

    async fn glob(&self, pattern: &str, path: Option<&str>) -> Result<SearchResult<String>, BackendError> {
        let args = GlobArgs {
            pattern: pattern.to_string(),
            path: path.map(str::to_string),
        };
        self.fs_request(Op::Glob, &args).await
    }

    async fn grep(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<SearchResult<GrepMatch>, BackendError> {
        let args = GrepArgs {
            pattern: pattern.to_string(),
            path: path.map(str::to_string),
            glob: glob.map(str::to_string),
        };
        self.fs_request(Op::Grep, &args).await
    }
}
