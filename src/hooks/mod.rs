//! Hook pipeline wrapping every model and tool call
//!
//! A hook may take part in four phases. Every phase has a no-op default, so a
//! hook only implements what it changes.
//!
//! ```text
//! before_agent     once per run, registration order
//! modify_request   once per iteration, registration order
//! wrap_model_call  onion: hooks[0] ─► hooks[1] ─► ... ─► ModelClient
//! wrap_tool_call   onion: hooks[0] ─► hooks[1] ─► ... ─► Tool::execute
//! ```

pub mod filesystem;
pub mod memory;
pub mod skills;
pub mod summarization;
pub mod todolist;
pub mod tracing;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::context::RunContext;
use crate::agent::error::AgentError;
use crate::agent::events::AgentEvent;
use crate::agent::model::{ModelClient, ModelError, ModelRequest, ModelResponse};
use crate::agent::state::{AgentState, ToolCall};
use crate::agent::tool::{Tool, ToolError, ToolOutput, ToolRegistry};

pub use self::filesystem::FilesystemHook;
pub use self::memory::MemoryHook;
pub use self::skills::SkillsHook;
pub use self::summarization::{SummarizationConfig, SummarizationHook};
pub use self::todolist::TodoListHook;
pub use self::tracing::{LogSpanCollector, TracingHook};

/// Failure inside a hook's own logic
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Tools this hook contributes to the agent
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }

    async fn before_agent(&self, _state: &AgentState, _ctx: &RunContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn modify_request(
        &self,
        _request: &mut ModelRequest,
        _ctx: &RunContext,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        ctx: &RunContext,
        next: ModelNext<'_>,
    ) -> Result<ModelResponse, ModelError> {
        next.run(request, ctx).await
    }

    async fn wrap_tool_call(
        &self,
        call: ToolCall,
        ctx: &RunContext,
        next: ToolNext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        next.run(call, ctx).await
    }
}

/// Remainder of the model-call chain below the current hook
#[derive(Clone, Copy)]
pub struct ModelNext<'a> {
    hooks: &'a [Arc<dyn Hook>],
    model: &'a dyn ModelClient,
}

impl<'a> ModelNext<'a> {
    pub async fn run(
        self,
        request: ModelRequest,
        ctx: &RunContext,
    ) -> Result<ModelResponse, ModelError> {
        match self.hooks.split_first() {
            Some((hook, rest)) => {
                let next = ModelNext {
                    hooks: rest,
                    model: self.model,
                };
                hook.wrap_model_call(request, ctx, next).await
            }
            None => {
                let on_delta = |text: &str| {
                    if !text.is_empty() {
                        ctx.emit(AgentEvent::ModelDelta {
                            text: text.to_string(),
                        });
                    }
                };
                self.model.send_streaming(&request, &on_delta).await
            }
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }
}

/// Remainder of the tool-call chain below the current hook
#[derive(Clone, Copy)]
pub struct ToolNext<'a> {
    hooks: &'a [Arc<dyn Hook>],
    registry: &'a ToolRegistry,
}

impl<'a> ToolNext<'a> {
    pub async fn run(self, call: ToolCall, ctx: &RunContext) -> Result<ToolOutput, ToolError> {
        match self.hooks.split_first() {
            Some((hook, rest)) => {
                let next = ToolNext {
                    hooks: rest,
                    registry: self.registry,
                };
                hook.wrap_tool_call(call, ctx, next).await
            }
            None => {
                let tool = self.registry.validate(&call.name, &call.arguments)?;
                tool.execute(call.arguments, ctx).await
            }
        }
    }
}

/// Ordered set of hooks for one agent
#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn with(mut self, hook: Arc<dyn Hook>) -> Self {
        self.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    /// Tools contributed by all hooks, in hook order
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.hooks.iter().flat_map(|h| h.tools()).collect()
    }

    pub async fn before_agent(&self, state: &AgentState, ctx: &RunContext) -> Result<(), AgentError> {
        for hook in &self.hooks {
            hook.before_agent(state, ctx)
                .await
                .map_err(|e| hook_failure(hook.as_ref(), e))?;
        }
        Ok(())
    }

    pub async fn modify_request(
        &self,
        request: &mut ModelRequest,
        ctx: &RunContext,
    ) -> Result<(), AgentError> {
        for hook in &self.hooks {
            hook.modify_request(request, ctx)
                .await
                .map_err(|e| hook_failure(hook.as_ref(), e))?;
        }
        Ok(())
    }

    pub async fn call_model(
        &self,
        model: &dyn ModelClient,
        request: ModelRequest,
        ctx: &RunContext,
    ) -> Result<ModelResponse, ModelError> {
        ModelNext {
            hooks: &self.hooks,
            model,
        }
        .run(request, ctx)
        .await
    }

    /// Run one tool call through the chain, emitting start/finish events
    pub async fn call_tool(
        &self,
        registry: &ToolRegistry,
        call: ToolCall,
        ctx: &RunContext,
    ) -> Result<ToolOutput, ToolError> {
        let call_id = call.id.clone();
        let name = call.name.clone();
        ctx.emit(AgentEvent::ToolCallStarted {
            call_id: call_id.clone(),
            name: name.clone(),
        });
        let start = Instant::now();

        let outcome = ToolNext {
            hooks: &self.hooks,
            registry,
        }
        .run(call, ctx)
        .await;

        ctx.emit(AgentEvent::ToolCallFinished {
            call_id,
            name,
            is_error: outcome.is_err(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        });
        outcome
    }
}

fn hook_failure(hook: &dyn Hook, err: HookError) -> AgentError {
    AgentError::Hook {
        hook: hook.name().to_string(),
        message: err.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::Message;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Hook for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn before_agent(&self, _state: &AgentState, _ctx: &RunContext) -> Result<(), HookError> {
            self.log.lock().unwrap().push(format!("{}:before_agent", self.name));
            Ok(())
        }

        async fn modify_request(
            &self,
            request: &mut ModelRequest,
            _ctx: &RunContext,
        ) -> Result<(), HookError> {
            request.append_system(&self.name);
            Ok(())
        }

        async fn wrap_model_call(
            &self,
            request: ModelRequest,
            ctx: &RunContext,
            next: ModelNext<'_>,
        ) -> Result<ModelResponse, ModelError> {
            self.log.lock().unwrap().push(format!("{}:enter", self.name));
            let response = next.run(request, ctx).await;
            self.log.lock().unwrap().push(format!("{}:exit", self.name));
            response
        }
    }

    struct Echo;

    #[async_trait]
    impl ModelClient for Echo {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            Ok(ModelResponse::text(request.system.clone()))
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Hook for ShortCircuit {
        fn name(&self) -> &str {
            "short"
        }

        async fn wrap_tool_call(
            &self,
            call: ToolCall,
            _ctx: &RunContext,
            _next: ToolNext<'_>,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(format!("blocked {}", call.name)))
        }
    }

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase text"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }

        async fn execute(&self, args: Value, _ctx: &RunContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(args["text"].as_str().unwrap_or("").to_uppercase()))
        }
    }

    fn pipeline(log: &Arc<Mutex<Vec<String>>>) -> HookPipeline {
        HookPipeline::new()
            .with(Arc::new(Recorder { name: "a".into(), log: log.clone() }))
            .with(Arc::new(Recorder { name: "b".into(), log: log.clone() }))
    }

    #[tokio::test]
    async fn test_sequential_phases_follow_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(&log);
        let ctx = RunContext::new("t");

        pipeline.before_agent(&AgentState::new(), &ctx).await.unwrap();
        let mut request = ModelRequest::new("sys", vec![Message::user("hi")], vec![]);
        pipeline.modify_request(&mut request, &ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a:before_agent", "b:before_agent"]);
        assert_eq!(request.system, "sys\n\na\n\nb");
    }

    #[tokio::test]
    async fn test_model_wrappers_form_an_onion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(&log);
        let ctx = RunContext::new("t");

        let response = pipeline
            .call_model(&Echo, ModelRequest::new("sys", vec![], vec![]), &ctx)
            .await
            .unwrap();

        assert_eq!(response.content, "sys");
        assert_eq!(*log.lock().unwrap(), vec!["a:enter", "b:enter", "b:exit", "a:exit"]);
    }

    #[tokio::test]
    async fn test_tool_chain_validates_and_executes() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper)).unwrap();
        let ctx = RunContext::new("t");
        let pipeline = HookPipeline::new();

        let out = pipeline
            .call_tool(&registry, ToolCall::new("1", "upper", json!({"text": "hi"})), &ctx)
            .await
            .unwrap();
        assert_eq!(out.content, "HI");

        let err = pipeline
            .call_tool(&registry, ToolCall::new("2", "upper", json!({})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let err = pipeline
            .call_tool(&registry, ToolCall::new("3", "missing", json!({})), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_hook_can_short_circuit_tool_call() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper)).unwrap();
        let pipeline = HookPipeline::new().with(Arc::new(ShortCircuit));

        let out = pipeline
            .call_tool(
                &registry,
                ToolCall::new("1", "upper", json!({"text": "hi"})),
                &RunContext::new("t"),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "blocked upper");
    }
}
