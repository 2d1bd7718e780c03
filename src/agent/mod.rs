//! Agent execution engine
//!
//! # Architecture
//!
//! ```text
//! AgentService.stream(thread_id, message)
//!        ↓
//! ThreadStore.acquire(thread_id) → exclusive Thread
//!        ↓
//! Agent.run ─► BeforeAgent hooks
//!        ↓
//!   ┌─► ModifyRequest hooks → WrapModelCall chain → ModelClient
//!   │        ↓ tool calls?
//!   │   WrapToolCall chain → Tool → Backend (local | sandbox protocol)
//!   │        ↓
//!   └── commit turns to AgentState
//!        ↓
//! Done | Error | Cancelled → events streamed to the caller
//! ```

pub mod context;
pub mod controller;
pub mod error;
pub mod events;
pub mod model;
pub mod service;
pub mod sessions;
pub mod state;
pub mod tool;

pub use context::{InMemorySpans, RunContext, SpanCollector, SpanRecord, TraceContext};
pub use controller::{
    Agent, AgentBuilder, AgentConfig, RunOutcome, RunStatus, DEFAULT_SYSTEM_PROMPT,
};
pub use error::{AgentError, ErrorKind};
pub use events::{AgentEvent, EventSink, TerminalStatus};
pub use model::{
    ModelClient, ModelError, ModelRequest, ModelResponse, ProviderSpec, RetryPolicy,
    RetryingModel, ToolSchema,
};
pub use service::{AgentService, EventStream, InvokeResult};
pub use sessions::{Thread, ThreadGuard, ThreadStore, ThreadStoreConfig};
pub use state::{AgentState, Message, Role, StateUpdate, Todo, TodoStatus, ToolCall, ToolResult};
pub use tool::{Tool, ToolError, ToolOutput, ToolRegistry};
