//! agentvisor - run a tool-using agent against a local or sandboxed backend
//!
//! Messages come from the command line or, one per line, from stdin. Each is
//! sent on the same thread, so later messages see the earlier conversation.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use agentvisor::agent::{Agent, AgentEvent, AgentService, ProviderSpec, TerminalStatus, ThreadStore};
use agentvisor::backend::local::LocalBackend;
use agentvisor::backend::{Backend, BackendKind, BackendStatus};
use agentvisor::config::AppConfig;
use agentvisor::hooks::{
    FilesystemHook, LogSpanCollector, MemoryHook, SkillsHook, SummarizationHook, TodoListHook,
    TracingHook,
};
use agentvisor::sandbox::SandboxManager;
use agentvisor::telemetry::{self, LogFormat};
use agentvisor::metrics;
use clap::Parser;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "agentvisor", version, about = "Agent execution engine")]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "AGENTVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Model as provider:model[@base_url], e.g. ollama:qwen3
    #[arg(long, env = "AGENTVISOR_MODEL")]
    model: Option<String>,

    /// Where tools execute
    #[arg(long, value_enum, env = "AGENTVISOR_BACKEND")]
    backend: Option<BackendKind>,

    /// Working directory for tools
    #[arg(long, env = "AGENTVISOR_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Container image for the sandbox backend
    #[arg(long, env = "AGENTVISOR_IMAGE")]
    image: Option<String>,

    #[arg(long, env = "AGENTVISOR_MAX_ITERATIONS")]
    max_iterations: Option<usize>,

    /// Conversation to continue
    #[arg(long, default_value = "default")]
    thread: String,

    /// OTLP collector endpoint for trace export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Print every event as a JSON line instead of plain text
    #[arg(long)]
    events: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Write Prometheus metrics to this file on exit
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    /// Message to send; read from stdin when absent
    message: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<(AppConfig, RunOptions), BoxError> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        if let Some(workdir) = self.workdir {
            config.backend.workdir = workdir;
        }
        if let Some(image) = self.image {
            config.backend.sandbox.image = image;
        }
        if let Some(max) = self.max_iterations {
            config.agent.max_iterations = max;
        }
        if self.otlp_endpoint.is_some() {
            config.otlp_endpoint = self.otlp_endpoint;
        }
        config.validate()?;

        let options = RunOptions {
            thread: self.thread,
            events: self.events,
            log_format: if self.log_json { LogFormat::Json } else { LogFormat::Text },
            metrics_out: self.metrics_out,
            message: self.message,
        };
        Ok((config, options))
    }
}

struct RunOptions {
    thread: String,
    events: bool,
    log_format: LogFormat,
    metrics_out: Option<PathBuf>,
    message: Option<String>,
}

/// Backend plus whatever must be torn down with it
struct BackendSetup {
    backend: Arc<dyn Backend>,
    manager: Option<SandboxManager>,
}

async fn build_backend(config: &AppConfig) -> BackendSetup {
    match config.backend.kind {
        BackendKind::Local => BackendSetup {
            backend: Arc::new(LocalBackend::new(config.backend.clone())),
            manager: None,
        },
        BackendKind::Sandbox => {
            let manager = SandboxManager::new(config.backend.clone());
            let name = manager.generate_name();
            let backend = manager.launch(&name).await;
            BackendSetup {
                backend,
                manager: Some(manager),
            }
        }
    }
}

fn build_agent(config: &AppConfig, backend: &Arc<dyn Backend>) -> Result<Agent, BoxError> {
    let model = ProviderSpec::parse(&config.model)?.build(config.retry.clone())?;
    let hooks = &config.hooks;

    let mut builder = Agent::builder(model.clone()).config(config.agent.clone());
    if hooks.tracing {
        builder = builder.hook(Arc::new(TracingHook::new()));
    }
    if hooks.filesystem {
        builder = builder.hook(Arc::new(FilesystemHook::new(backend.clone())));
    }
    if !hooks.memory_files.is_empty() {
        builder = builder.hook(Arc::new(MemoryHook::new(backend.clone(), hooks.memory_files.clone())));
    }
    if !hooks.skill_dirs.is_empty() {
        builder = builder.hook(Arc::new(SkillsHook::new(backend.clone(), hooks.skill_dirs.clone())));
    }
    if hooks.todolist {
        builder = builder.hook(Arc::new(TodoListHook::new()));
    }
    if hooks.summarization {
        builder = builder.hook(Arc::new(SummarizationHook::new(model, config.summarization.clone())));
    }
    Ok(builder.build()?)
}

/// Stream one request to stdout; returns how the run ended
async fn run_message(
    service: &AgentService,
    thread: &str,
    message: String,
    cancel: CancellationToken,
    as_events: bool,
) -> Result<Option<TerminalStatus>, BoxError> {
    let mut stdout = tokio::io::stdout();
    let mut stream = service.stream(thread, message, cancel);
    let mut terminal = None;

    while let Some(event) = stream.next().await {
        if let AgentEvent::LoopFinished { status, .. } = &event {
            terminal = Some(*status);
        }
        if as_events {
            let line = serde_json::to_string(&event)?;
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            continue;
        }
        match event {
            AgentEvent::ModelDelta { text } => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            AgentEvent::ToolCallStarted { name, .. } => {
                eprintln!("[tool] {}", name);
            }
            AgentEvent::BackendStatus { backend, status } => match status {
                BackendStatus::Failed(reason) => eprintln!("[backend] {} failed: {}", backend, reason),
                other => eprintln!("[backend] {} {:?}", backend, other),
            },
            AgentEvent::Error { kind, message, .. } => {
                eprintln!("[error] {:?}: {}", kind, message);
            }
            AgentEvent::LoopFinished { .. } => {
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            _ => {}
        }
    }
    Ok(terminal)
}

#[tokio::main]
async fn main() -> Result<ExitCode, BoxError> {
    let (config, options) = Cli::parse().into_config()?;

    telemetry::init_tracing("agentvisor", config.otlp_endpoint.as_deref(), options.log_format)?;
    metrics::init();

    let setup = build_backend(&config).await;
    let agent = build_agent(&config, &setup.backend)?;
    info!(
        model = %agent.model_name(),
        backend = %setup.backend.name(),
        tools = ?agent.tools().names(),
        "Agent ready"
    );

    let threads = Arc::new(ThreadStore::new(&config.threads));
    let sweeper = threads.clone().start_sweeper(config.threads.sweep_interval());

    let mut service = AgentService::new(Arc::new(agent), threads);
    if config.hooks.tracing {
        service = service.with_span_collector(Arc::new(LogSpanCollector));
    }
    if let Some(rx) = setup.backend.watch_status() {
        service = service.with_backend_status(setup.backend.name().to_string(), rx);
    }

    // Ctrl+C cancels the request in flight and stops reading input
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                shutdown.cancel();
            }
        });
    }

    let mut failed = false;
    let outcome: Result<(), BoxError> = async {
        match options.message.clone() {
            Some(message) => {
                let status =
                    run_message(&service, &options.thread, message, shutdown.child_token(), options.events)
                        .await?;
                failed = status != Some(TerminalStatus::Done);
            }
            None => {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                loop {
                    let line = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        line = lines.next_line() => line?,
                    };
                    let Some(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let status =
                        run_message(&service, &options.thread, line, shutdown.child_token(), options.events)
                            .await?;
                    failed |= status != Some(TerminalStatus::Done);
                }
            }
        }
        Ok(())
    }
    .await;

    sweeper.abort();
    if let Some(manager) = setup.manager {
        manager.shutdown().await;
    }
    if let Some(path) = &options.metrics_out {
        if let Err(e) = tokio::fs::write(path, metrics::encode()).await {
            warn!(path = %path.display(), error = %e, "Failed to write metrics");
        }
    }
    telemetry::shutdown_tracing();

    outcome?;
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
