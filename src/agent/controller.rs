//! Agent loop - drives model calls and tool calls until a stopping condition
//!
//! One call to [`Agent::run`] moves through
//! `Init → AwaitingModel → (ExecutingTools → AwaitingModel)* → Done | Error | Cancelled`.
//! The thread's [`AgentState`] is only written at the end of an iteration, so an
//! error or cancellation in the middle of one leaves it at the last completed turn.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::context::RunContext;
use super::error::AgentError;
use super::events::{AgentEvent, TerminalStatus};
use super::model::{ModelClient, ModelRequest};
use super::state::{AgentState, Message, StateUpdate, ToolCall, ToolResult};
use super::tool::{Tool, ToolError, ToolRegistry};
use crate::hooks::{Hook, HookPipeline};
use crate::metrics::{AGENT_ITERATIONS, AGENT_RUNS, MODEL_CALL_DURATION, TOOL_CALLS};

/// Default system prompt for a tool-using agent
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful assistant with access to tools.

Guidelines:
- Use tools to inspect files and run commands rather than guessing
- If a tool call fails, read the error message and adapt
- When the task is complete, respond with your final answer in plain text"#;

/// Configuration for the agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent name used in logs
    pub name: String,
    /// Maximum number of model calls per request
    pub max_iterations: usize,
    /// Run the tool calls of one iteration concurrently
    pub parallel_tool_calls: bool,
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "agent".to_string(),
            max_iterations: 25,
            parallel_tool_calls: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone)]
pub enum RunStatus {
    Done,
    Error(AgentError),
    Cancelled,
}

impl RunStatus {
    pub fn terminal(&self) -> TerminalStatus {
        match self {
            RunStatus::Done => TerminalStatus::Done,
            RunStatus::Error(_) => TerminalStatus::Error,
            RunStatus::Cancelled => TerminalStatus::Cancelled,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RunStatus::Done => "done",
            RunStatus::Error(_) => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of an agent run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Number of model calls made
    pub iterations: usize,
    /// Final assistant content when the run finished with `Done`
    pub final_response: Option<String>,
    pub trace_id: String,
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self.status, RunStatus::Done)
    }

    pub fn error(&self) -> Option<&AgentError> {
        match &self.status {
            RunStatus::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Collapse into a `Result`; cancellation maps to `AgentError::Cancelled`
    pub fn into_result(self) -> Result<Option<String>, AgentError> {
        match self.status {
            RunStatus::Done => Ok(self.final_response),
            RunStatus::Error(e) => Err(e),
            RunStatus::Cancelled => Err(AgentError::Cancelled),
        }
    }
}

/// Builder wiring a model, tools and hooks into an [`Agent`]
pub struct AgentBuilder {
    model: Arc<dyn ModelClient>,
    config: AgentConfig,
    tools: Vec<Arc<dyn Tool>>,
    hooks: HookPipeline,
}

impl AgentBuilder {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            config: AgentConfig::default(),
            tools: Vec::new(),
            hooks: HookPipeline::new(),
        }
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Register a hook; hooks run in registration order and the first one is
    /// the outermost wrapper around model and tool calls
    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        if self.config.max_iterations == 0 {
            return Err(AgentError::Validation("max_iterations must be at least 1".into()));
        }

        let mut registry = ToolRegistry::new();
        for tool in self.tools.into_iter().chain(self.hooks.tools()) {
            registry.register(tool)?;
        }

        debug!(
            agent = %self.config.name,
            tools = ?registry.names(),
            hooks = ?self.hooks.names(),
            "Agent built"
        );

        Ok(Agent {
            config: self.config,
            model: self.model,
            tools: registry,
            hooks: self.hooks,
        })
    }
}

/// A model, its tools and its hook pipeline
pub struct Agent {
    config: AgentConfig,
    model: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    hooks: HookPipeline,
}

/// Turns produced by one iteration, written to the state together
struct Commit {
    /// Replacement history produced by a request hook
    history: Option<Vec<Message>>,
    turns: Vec<Message>,
    updates: Vec<StateUpdate>,
}

impl Agent {
    pub fn builder(model: Arc<dyn ModelClient>) -> AgentBuilder {
        AgentBuilder::new(model)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Run the loop for one user message
    ///
    /// # Arguments
    /// * `state` - The thread's state; completed turns are appended to it
    /// * `user_message` - The new user message
    /// * `ctx` - Request context carrying cancellation, events and trace
    ///
    /// # Returns
    /// RunOutcome with the terminal status. Completed turns stay in `state`
    /// for every status.
    pub async fn run(
        &self,
        state: &mut AgentState,
        user_message: impl Into<String>,
        ctx: &RunContext,
    ) -> RunOutcome {
        let root_span = info_span!(
            "agent_run",
            trace_id = %ctx.trace_id,
            thread_id = %ctx.thread_id,
            agent = %self.config.name,
            model = %self.model.model_name(),
            otel.name = "agent_run"
        );

        async {
            info!(trace_id = %ctx.trace_id, thread_id = %ctx.thread_id, "Starting agent run");
            ctx.emit(AgentEvent::RunStarted {
                thread_id: ctx.thread_id.clone(),
                trace_id: ctx.trace_id.clone(),
            });

            let mut iterations = 0;
            let status = match self
                .drive(state, Message::user(user_message), ctx, &mut iterations)
                .await
            {
                Ok(()) => RunStatus::Done,
                Err(AgentError::Cancelled) => RunStatus::Cancelled,
                Err(e) => RunStatus::Error(e),
            };

            match &status {
                RunStatus::Done => {
                    info!(trace_id = %ctx.trace_id, iterations, "Agent run completed");
                }
                RunStatus::Cancelled => {
                    info!(trace_id = %ctx.trace_id, iterations, "Agent run cancelled");
                }
                RunStatus::Error(e) => {
                    warn!(trace_id = %ctx.trace_id, iterations, error = %e, "Agent run failed");
                    ctx.emit(AgentEvent::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }

            AGENT_RUNS.with_label_values(&[status.label()]).inc();
            AGENT_ITERATIONS.observe(iterations as f64);
            ctx.emit(AgentEvent::LoopFinished {
                status: status.terminal(),
                iterations,
            });

            let final_response = match status {
                RunStatus::Done => state.last_assistant_text().map(str::to_string),
                _ => None,
            };

            RunOutcome {
                status,
                iterations,
                final_response,
                trace_id: ctx.trace_id.clone(),
            }
        }
        .instrument(root_span)
        .await
    }

    async fn drive(
        &self,
        state: &mut AgentState,
        user_message: Message,
        ctx: &RunContext,
        iterations: &mut usize,
    ) -> Result<(), AgentError> {
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        // The user turn is held back until the first iteration commits
        let mut pending = vec![user_message];

        self.hooks.before_agent(state, ctx).await?;

        for iteration in 1..=self.config.max_iterations {
            *iterations = iteration;

            let history: Vec<Message> = state.messages.iter().chain(&pending).cloned().collect();
            let mut request =
                ModelRequest::new(self.config.system_prompt.clone(), history, self.tools.schemas());
            self.hooks.modify_request(&mut request, ctx).await?;
            let rewritten = request.history_rewritten().then(|| request.messages.clone());

            ctx.emit(AgentEvent::ModelCallStarted { iteration });
            let model_span = info_span!(
                "model_call",
                trace_id = %ctx.trace_id,
                iteration,
                model = %self.model.model_name(),
                otel.name = "model_call"
            );
            let call_start = Instant::now();
            let response = ctx
                .until_cancelled(
                    self.hooks
                        .call_model(self.model.as_ref(), request, ctx)
                        .instrument(model_span),
                )
                .await
                .ok_or(AgentError::Cancelled)?;
            let call_secs = call_start.elapsed().as_secs_f64();
            MODEL_CALL_DURATION
                .with_label_values(&[self.model.model_name()])
                .observe(call_secs);
            let response = response?;

            debug!(
                trace_id = %ctx.trace_id,
                iteration,
                duration_ms = call_secs * 1000.0,
                tool_calls = response.tool_calls.len(),
                "Model call completed"
            );

            if response.tool_calls.is_empty() {
                self.commit(
                    state,
                    &mut pending,
                    Commit {
                        history: rewritten,
                        turns: vec![Message::assistant(response.content)],
                        updates: Vec::new(),
                    },
                    ctx,
                );
                return Ok(());
            }

            let calls: Vec<ToolCall> = response
                .tool_calls
                .into_iter()
                .map(|mut call| {
                    if call.id.is_empty() {
                        call.id = Uuid::new_v4().to_string();
                    }
                    call
                })
                .collect();

            let executed = self.execute_tools(&calls, ctx).await?;

            let mut turns = Vec::with_capacity(calls.len() + 1);
            turns.push(Message::assistant_with_calls(response.content, calls));
            let mut updates = Vec::new();
            for (result, update) in executed {
                turns.push(Message::tool(result));
                updates.extend(update);
            }

            self.commit(
                state,
                &mut pending,
                Commit {
                    history: rewritten,
                    turns,
                    updates,
                },
                ctx,
            );
        }

        warn!(
            trace_id = %ctx.trace_id,
            max_iterations = self.config.max_iterations,
            "Max iterations reached"
        );
        Err(AgentError::LoopLimitExceeded {
            max_iterations: self.config.max_iterations,
        })
    }

    /// Execute the calls of one iteration, returning results in call order
    async fn execute_tools(
        &self,
        calls: &[ToolCall],
        ctx: &RunContext,
    ) -> Result<Vec<(ToolResult, Option<StateUpdate>)>, AgentError> {
        let batch = async {
            if self.config.parallel_tool_calls && calls.len() > 1 {
                join_all(calls.iter().map(|call| self.execute_tool(call.clone(), ctx)))
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()
            } else {
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    results.push(self.execute_tool(call.clone(), ctx).await?);
                }
                Ok(results)
            }
        };

        ctx.until_cancelled(batch)
            .await
            .ok_or(AgentError::Cancelled)?
    }

    async fn execute_tool(
        &self,
        call: ToolCall,
        ctx: &RunContext,
    ) -> Result<(ToolResult, Option<StateUpdate>), AgentError> {
        let span = info_span!(
            "tool_call",
            trace_id = %ctx.trace_id,
            tool = %call.name,
            call_id = %call.id,
            otel.name = "tool_call"
        );
        let call_id = call.id.clone();
        let name = call.name.clone();

        match self.hooks.call_tool(&self.tools, call, ctx).instrument(span).await {
            Ok(output) => {
                TOOL_CALLS.with_label_values(&[&name, "ok"]).inc();
                Ok((ToolResult::success(call_id, output.content), output.update))
            }
            Err(ToolError::BackendUnavailable(message)) => {
                TOOL_CALLS.with_label_values(&[&name, "unavailable"]).inc();
                Err(AgentError::BackendUnavailable(message))
            }
            Err(e) => {
                TOOL_CALLS.with_label_values(&[&name, "error"]).inc();
                info!(trace_id = %ctx.trace_id, tool = %name, error = %e, "Tool call failed");
                Ok((ToolResult::failure(call_id, e.to_string()), None))
            }
        }
    }

    fn commit(
        &self,
        state: &mut AgentState,
        pending: &mut Vec<Message>,
        commit: Commit,
        ctx: &RunContext,
    ) {
        let mut appended: Vec<Message> = Vec::with_capacity(pending.len() + commit.turns.len());
        match commit.history {
            // A rewritten history already contains the pending turns
            Some(history) => {
                state.messages = history;
                pending.clear();
            }
            None => appended.append(pending),
        }
        appended.extend(commit.turns);

        for message in appended {
            ctx.emit(AgentEvent::TurnAppended {
                message: message.clone(),
            });
            state.messages.push(message);
        }
        for update in commit.updates {
            state.apply(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::model::{ModelError, ModelResponse};
    use crate::agent::state::Role;
    use crate::agent::tool::ToolOutput;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<ModelResponse, ModelError>>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<ModelResponse, ModelError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(ModelResponse::text("done")))
        }
    }

    struct Fails;

    #[async_trait]
    impl Tool for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _args: Value, _ctx: &RunContext) -> Result<ToolOutput, ToolError> {
            Err(ToolError::Execution("boom".into()))
        }
    }

    #[test]
    fn test_build_rejects_zero_iterations() {
        let result = Agent::builder(Scripted::new(vec![])).max_iterations(0).build();
        assert!(matches!(result, Err(AgentError::Validation(_))));
    }

    #[test]
    fn test_build_rejects_duplicate_tools() {
        let result = Agent::builder(Scripted::new(vec![]))
            .tool(Arc::new(Fails))
            .tool(Arc::new(Fails))
            .build();
        assert!(matches!(result, Err(AgentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_tool_failure_is_fed_back() {
        let model = Scripted::new(vec![
            Ok(ModelResponse::with_calls(vec![ToolCall::new("c1", "fails", json!({}))])),
            Ok(ModelResponse::text("gave up")),
        ]);
        let agent = Agent::builder(model).tool(Arc::new(Fails)).build().unwrap();
        let mut state = AgentState::new();

        let outcome = agent.run(&mut state, "try", &RunContext::new("t")).await;

        assert!(outcome.is_done());
        assert_eq!(outcome.final_response.as_deref(), Some("gave up"));
        let result = state.messages[2].tool_result.as_ref().unwrap();
        assert_eq!(result.call_id, "c1");
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_model_error_leaves_state_untouched() {
        let model = Scripted::new(vec![Err(ModelError::Status {
            status: 400,
            body: "bad request".into(),
        })]);
        let agent = Agent::builder(model).build().unwrap();
        let mut state = AgentState::new();
        state.messages.push(Message::user("earlier"));
        state.messages.push(Message::assistant("reply"));

        let outcome = agent.run(&mut state, "next", &RunContext::new("t")).await;

        assert!(matches!(outcome.error(), Some(AgentError::ModelCall(_))));
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_call_ids_are_generated() {
        let model = Scripted::new(vec![
            Ok(ModelResponse::with_calls(vec![ToolCall::new("", "fails", json!({}))])),
            Ok(ModelResponse::text("ok")),
        ]);
        let agent = Agent::builder(model).tool(Arc::new(Fails)).build().unwrap();
        let mut state = AgentState::new();

        agent.run(&mut state, "go", &RunContext::new("t")).await;

        let call_id = &state.messages[1].tool_calls[0].id;
        assert!(!call_id.is_empty());
        assert_eq!(state.messages[2].role, Role::Tool);
        assert_eq!(&state.messages[2].tool_result.as_ref().unwrap().call_id, call_id);
        assert!(state.dangling_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let agent = Agent::builder(Scripted::new(vec![])).build().unwrap();
        let ctx = RunContext::new("t");
        ctx.cancellation().cancel();
        let mut state = AgentState::new();

        let outcome = agent.run(&mut state, "hi", &ctx).await;

        assert!(matches!(outcome.status, RunStatus::Cancelled));
        assert!(state.messages.is_empty());
    }
}
