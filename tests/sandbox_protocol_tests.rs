//! Sandbox backend against a real protocol server
//!
//! The container is replaced by a runtime whose endpoint points at a loopback
//! `SandboxServer` and whose exec runs the server in one-shot mode, the same
//! way the container exec path invokes the server binary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentvisor::backend::sandbox::SandboxRuntime;
use agentvisor::backend::{
    Backend, BackendConfig, BackendError, BackendStatus, ConnectionState, ExecLimits, ExecOutput,
    Filesystem, FsError, SandboxBackend,
};
use agentvisor::protocol::SandboxServer;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

struct LoopbackRuntime {
    endpoint: Option<SocketAddr>,
    server: SandboxServer,
    exec_works: bool,
    endpoint_calls: AtomicUsize,
    execs: AtomicUsize,
}

impl LoopbackRuntime {
    fn new(endpoint: Option<SocketAddr>, server: SandboxServer) -> Self {
        Self {
            endpoint,
            server,
            exec_works: true,
            endpoint_calls: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
        }
    }

    fn broken_exec(mut self) -> Self {
        self.exec_works = false;
        self
    }

    fn endpoint_calls(&self) -> usize {
        self.endpoint_calls.load(Ordering::SeqCst)
    }

    fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRuntime for LoopbackRuntime {
    fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint_calls.fetch_add(1, Ordering::SeqCst);
        self.endpoint
    }

    async fn exec(&self, argv: &[String], _deadline: Duration) -> Result<ExecOutput, BackendError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if !self.exec_works {
            return Err(BackendError::Exec("container exec refused".into()));
        }
        let line = argv
            .iter()
            .position(|arg| arg == "--request")
            .and_then(|i| argv.get(i + 1))
            .ok_or_else(|| BackendError::Exec("missing --request".into()))?;
        let response = self.server.one_shot(line).await;
        Ok(ExecOutput {
            stdout: format!("{}\n", response),
            ..Default::default()
        })
    }
}

fn server(root: &TempDir, max_results: usize) -> SandboxServer {
    SandboxServer::new(
        root.path(),
        ExecLimits {
            timeout: Duration::from_secs(10),
            max_output_bytes: 64 * 1024,
        },
        max_results,
    )
}

/// Serve on an ephemeral loopback port; returns its address
async fn spawn_server(server: SandboxServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// An address nothing listens on
async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn backend(root: &TempDir, runtime: Arc<LoopbackRuntime>) -> SandboxBackend {
    let mut config = BackendConfig::default();
    config.workdir = root.path().to_path_buf();
    config.timeout_secs = 10;
    config.sandbox.launch_timeout_secs = 5;
    let (_tx, rx) = watch::channel(BackendStatus::Ready);
    SandboxBackend::new("sb-test", config, runtime, rx)
}

#[tokio::test]
async fn test_fast_path_serves_filesystem_and_exec() {
    let dir = TempDir::new().unwrap();
    let addr = spawn_server(server(&dir, 100)).await;
    let runtime = Arc::new(LoopbackRuntime::new(Some(addr), server(&dir, 100)));
    let backend = backend(&dir, runtime.clone());

    backend.filesystem().write("notes/a.txt", "hello").await.unwrap();
    assert_eq!(backend.filesystem().read("notes/a.txt", None, None).await.unwrap(), "hello");
    assert!(dir.path().join("notes/a.txt").exists());

    let output = backend.exec("echo hi", None).await.unwrap();
    assert_eq!(output.stdout, "hi\n");
    assert_eq!(output.exit_code, 0);

    assert_eq!(runtime.execs(), 0);
    assert_eq!(runtime.endpoint_calls(), 1);
    assert_eq!(backend.connection_state().await, ConnectionState::Available);
}

#[tokio::test]
async fn test_fallback_matches_fast_path_output() {
    let dir = TempDir::new().unwrap();
    let addr = spawn_server(server(&dir, 100)).await;
    let fast = backend(&dir, Arc::new(LoopbackRuntime::new(Some(addr), server(&dir, 100))));
    let slow_runtime = Arc::new(LoopbackRuntime::new(Some(refused_addr().await), server(&dir, 100)));
    let slow = backend(&dir, slow_runtime.clone());

    let command = "echo out; echo err >&2; exit 3";
    let via_fast = fast.exec(command, None).await.unwrap();
    let via_fallback = slow.exec(command, None).await.unwrap();

    assert_eq!(via_fast, via_fallback);
    assert_eq!(via_fallback.exit_code, 3);
    assert_eq!(via_fallback.stderr, "err\n");
    assert_eq!(slow_runtime.execs(), 1);
    assert!(matches!(slow.connection_state().await, ConnectionState::Degraded { .. }));
}

#[tokio::test]
async fn test_degraded_skips_fast_path_until_cooldown() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(LoopbackRuntime::new(Some(refused_addr().await), server(&dir, 100)));
    let backend = backend(&dir, runtime.clone()).with_cooldown(Duration::from_millis(200));

    backend.filesystem().write("a.txt", "one").await.unwrap();
    assert_eq!(runtime.endpoint_calls(), 1);
    assert!(matches!(backend.connection_state().await, ConnectionState::Degraded { .. }));

    // Within the cooldown the fast path is not even attempted
    assert_eq!(backend.filesystem().read("a.txt", None, None).await.unwrap(), "one");
    assert_eq!(runtime.endpoint_calls(), 1);
    assert_eq!(runtime.execs(), 2);

    tokio::time::sleep(Duration::from_millis(250)).await;
    backend.filesystem().ls(".").await.unwrap();
    assert_eq!(runtime.endpoint_calls(), 2);
    assert_eq!(runtime.execs(), 3);
}

#[tokio::test]
async fn test_both_paths_failing_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(LoopbackRuntime::new(Some(refused_addr().await), server(&dir, 100)).broken_exec());
    let backend = backend(&dir, runtime.clone());

    let err = backend.exec("true", None).await.unwrap_err();
    assert!(matches!(err, BackendError::Unavailable(ref m) if m.contains("refused")), "{:?}", err);
    assert_eq!(backend.connection_state().await, ConnectionState::Unavailable);

    // Unavailable still probes the fast path on the next call
    let _ = backend.filesystem().ls(".").await;
    assert_eq!(runtime.endpoint_calls(), 2);
}

#[tokio::test]
async fn test_abandoned_call_does_not_shift_later_responses() {
    let dir = TempDir::new().unwrap();
    let addr = spawn_server(server(&dir, 100)).await;
    let runtime = Arc::new(LoopbackRuntime::new(Some(addr), server(&dir, 100)));
    let backend = backend(&dir, runtime.clone());

    let abandoned =
        tokio::time::timeout(Duration::from_millis(200), backend.exec("sleep 1; echo first", None)).await;
    assert!(abandoned.is_err());

    let second = backend.exec("echo second", None).await.unwrap();
    assert_eq!(second.stdout, "second\n");
    let third = backend.exec("echo third", None).await.unwrap();
    assert_eq!(third.stdout, "third\n");

    // The abandoned connection is discarded and a fresh one opened
    assert_eq!(runtime.endpoint_calls(), 2);
    assert_eq!(runtime.execs(), 0);
    assert_eq!(backend.connection_state().await, ConnectionState::Available);
}

#[tokio::test]
async fn test_operation_failure_does_not_fall_back() {
    let dir = TempDir::new().unwrap();
    let addr = spawn_server(server(&dir, 100)).await;
    let runtime = Arc::new(LoopbackRuntime::new(Some(addr), server(&dir, 100)));
    let backend = backend(&dir, runtime.clone());
    let fs = backend.filesystem();

    fs.write("config.toml", "x = 1\n").await.unwrap();
    fs.edit("config.toml", "x = 1", "x = 2").await.unwrap();
    let err = fs.edit("config.toml", "x = 1", "x = 2").await.unwrap_err();
    match err {
        BackendError::Fs(FsError::Remote(message)) => assert!(message.contains("not found"), "{}", message),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(fs.read("config.toml", None, None).await.unwrap(), "x = 2\n");

    assert_eq!(runtime.execs(), 0);
    assert_eq!(backend.connection_state().await, ConnectionState::Available);
}

#[tokio::test]
async fn test_search_bound_survives_the_wire() {
    let dir = TempDir::new().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(dir.path().join(name), "needle\n").unwrap();
    }
    let addr = spawn_server(server(&dir, 2)).await;
    let backend = backend(&dir, Arc::new(LoopbackRuntime::new(Some(addr), server(&dir, 2))));

    let found = backend.filesystem().glob("*.txt", None).await.unwrap();
    assert_eq!(found.matches.len(), 2);
    assert!(found.truncated);

    let hits = backend.filesystem().grep("needle", None, None).await.unwrap();
    assert_eq!(hits.matches.len(), 2);
    assert!(hits.truncated);
}
