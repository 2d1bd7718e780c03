//! Timing spans around model and tool calls
//!
//! Spans go to the collector of the run's [`TraceContext`]. A run without
//! one is passed through untouched.
//!
//! [`TraceContext`]: crate::agent::context::TraceContext

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{Hook, ModelNext, ToolNext};
use crate::agent::context::{RunContext, SpanCollector, SpanRecord};
use crate::agent::model::{ModelError, ModelRequest, ModelResponse};
use crate::agent::state::ToolCall;
use crate::agent::tool::{ToolError, ToolOutput};

/// Collector that writes finished spans to the log
#[derive(Debug, Default)]
pub struct LogSpanCollector;

impl SpanCollector for LogSpanCollector {
    fn record(&self, span: SpanRecord) {
        info!(
            trace_id = %span.trace_id,
            span = %span.name,
            duration_ms = span.duration_ms(),
            metadata = ?span.metadata,
            "Span finished"
        );
    }
}

#[derive(Debug, Default)]
pub struct TracingHook;

impl TracingHook {
    pub fn new() -> Self {
        Self
    }
}

fn status<T, E>(outcome: &Result<T, E>) -> String {
    match outcome {
        Ok(_) => "ok".to_string(),
        Err(_) => "error".to_string(),
    }
}

#[async_trait]
impl Hook for TracingHook {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        ctx: &RunContext,
        next: ModelNext<'_>,
    ) -> Result<ModelResponse, ModelError> {
        let Some(trace) = ctx.trace() else {
            return next.run(request, ctx).await;
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("model".to_string(), next.model_name().to_string());
        metadata.insert("thread_id".to_string(), ctx.thread_id.clone());
        metadata.insert("messages".to_string(), request.messages.len().to_string());

        let start = Utc::now();
        let outcome = next.run(request, ctx).await;
        metadata.insert("status".to_string(), status(&outcome));
        if let Ok(response) = &outcome {
            metadata.insert("tool_calls".to_string(), response.tool_calls.len().to_string());
        }

        trace.record(SpanRecord {
            name: "model_call".to_string(),
            trace_id: trace.trace_id.clone(),
            start,
            end: Utc::now(),
            metadata,
        });
        outcome
    }

    async fn wrap_tool_call(
        &self,
        call: ToolCall,
        ctx: &RunContext,
        next: ToolNext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let Some(trace) = ctx.trace() else {
            return next.run(call, ctx).await;
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("tool".to_string(), call.name.clone());
        metadata.insert("call_id".to_string(), call.id.clone());

        let start = Utc::now();
        let outcome = next.run(call, ctx).await;
        metadata.insert("status".to_string(), status(&outcome));

        trace.record(SpanRecord {
            name: "tool_call".to_string(),
            trace_id: trace.trace_id.clone(),
            start,
            end: Utc::now(),
            metadata,
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::{InMemorySpans, TraceContext};
    use crate::agent::model::ModelClient;
    use crate::hooks::HookPipeline;
    use std::sync::Arc;

    struct Fixed;

    #[async_trait]
    impl ModelClient for Fixed {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn send(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            Ok(ModelResponse::text("hi"))
        }
    }

    #[tokio::test]
    async fn test_records_model_span_when_traced() {
        let spans = Arc::new(InMemorySpans::new());
        let ctx = RunContext::new("t").with_trace(TraceContext::new("trace-1", spans.clone()));
        let pipeline = HookPipeline::new().with(Arc::new(TracingHook::new()));

        let response = pipeline.call_model(&Fixed, ModelRequest::default(), &ctx).await.unwrap();
        assert_eq!(response.content, "hi");

        let recorded = spans.spans();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].name, "model_call");
        assert_eq!(recorded[0].trace_id, "trace-1");
        assert_eq!(recorded[0].metadata["model"], "fixed");
        assert_eq!(recorded[0].metadata["status"], "ok");
        assert!(recorded[0].duration_ms() >= 0);
    }

    #[tokio::test]
    async fn test_without_trace_is_a_no_op() {
        let pipeline = HookPipeline::new().with(Arc::new(TracingHook::new()));
        let response = pipeline
            .call_model(&Fixed, ModelRequest::default(), &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(response.content, "hi");
    }
}
