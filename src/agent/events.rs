//! Lifecycle events emitted while a run executes
//!
//! Each event maps one-to-one onto a frame a transport can stream out; the
//! engine itself does not know about the transport.

use serde::Serialize;
use tokio::sync::mpsc;

use super::error::ErrorKind;
use super::state::Message;
use crate::backend::BackendStatus;

/// Terminal status as reported in `loop_finished`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Done,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStarted {
        thread_id: String,
        trace_id: String,
    },
    /// Sandbox launch progress for the agent's backend
    BackendStatus {
        backend: String,
        status: BackendStatus,
    },
    ModelCallStarted {
        iteration: usize,
    },
    ModelDelta {
        text: String,
    },
    ToolCallStarted {
        call_id: String,
        name: String,
    },
    ToolCallFinished {
        call_id: String,
        name: String,
        is_error: bool,
        duration_ms: f64,
    },
    TurnAppended {
        message: Message,
    },
    Error {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    LoopFinished {
        status: TerminalStatus,
        iterations: usize,
    },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::RunStarted { .. } => "run_started",
            AgentEvent::BackendStatus { .. } => "backend_status",
            AgentEvent::ModelCallStarted { .. } => "model_call_started",
            AgentEvent::ModelDelta { .. } => "model_delta",
            AgentEvent::ToolCallStarted { .. } => "tool_call_started",
            AgentEvent::ToolCallFinished { .. } => "tool_call_finished",
            AgentEvent::TurnAppended { .. } => "turn_appended",
            AgentEvent::Error { .. } => "error",
            AgentEvent::LoopFinished { .. } => "loop_finished",
        }
    }
}

/// Sending half of a run's event sequence
///
/// A sink without a receiver drops events; that is how [`RunContext`]s
/// created for non-streaming calls behave.
///
/// [`RunContext`]: super::context::RunContext
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the consumer disconnected; the run is
            // being torn down through cancellation.
            let _ = tx.send(event);
        }
    }
}
