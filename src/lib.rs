//! agentvisor - agent execution engine with local and sandboxed backends
//!
//! An agent loop alternates model calls and tool calls until the model
//! answers without tools. Hooks wrap every phase; tools run on a backend
//! that is either the host or a container reached through a small
//! newline-delimited JSON protocol.
//!
//! # Modules
//!
//! - `agent` - Loop, state, events, thread store and the service facade
//! - `hooks` - Hook pipeline and the built-in hooks
//! - `backend` - Backend abstraction with local and sandboxed implementations
//! - `protocol` - Sandbox protocol frames, host client and in-sandbox server
//! - `sandbox` - Container lifecycle over the daemon's Unix socket
//! - `ollama` - Ollama chat client implementing the model capability
//! - `config` - Aggregated configuration
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - Logging and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use agentvisor::agent::{Agent, AgentService, ProviderSpec, RetryPolicy, ThreadStore};
//! use agentvisor::backend::{BackendConfig, LocalBackend};
//! use agentvisor::hooks::FilesystemHook;
//!
//! let model = ProviderSpec::parse("ollama:qwen3")?.build(RetryPolicy::default())?;
//! let backend = Arc::new(LocalBackend::new(BackendConfig::default()));
//! let agent = Agent::builder(model).hook(Arc::new(FilesystemHook::new(backend))).build()?;
//! let service = AgentService::new(Arc::new(agent), Arc::new(ThreadStore::with_ttl(ttl)));
//! let result = service.invoke("thread-1", "list the files", CancellationToken::new()).await;
//! ```

pub mod agent;
pub mod backend;
pub mod config;
pub mod hooks;
pub mod metrics;
pub mod ollama;
pub mod protocol;
pub mod sandbox;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, AgentService, AgentState, RunOutcome};
pub use backend::{Backend, BackendConfig, LocalBackend, SandboxBackend};
pub use config::AppConfig;
pub use sandbox::SandboxManager;
