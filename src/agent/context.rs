//! Request-scoped context threaded through every call of a run
//!
//! Cancellation, the event sink and the optional trace context travel as an
//! explicit parameter instead of ambient lookups.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{AgentEvent, EventSink};

/// A timed, labeled interval handed to an external collector
#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub name: String,
    pub trace_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl SpanRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

/// Receiver of finished spans
pub trait SpanCollector: Send + Sync {
    fn record(&self, span: SpanRecord);
}

/// Collector that keeps spans in memory
#[derive(Debug, Default)]
pub struct InMemorySpans {
    spans: Mutex<Vec<SpanRecord>>,
}

impl InMemorySpans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl SpanCollector for InMemorySpans {
    fn record(&self, span: SpanRecord) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(span);
        }
    }
}

/// Trace a run belongs to, when the caller supplied one
#[derive(Clone)]
pub struct TraceContext {
    pub trace_id: String,
    collector: Arc<dyn SpanCollector>,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>, collector: Arc<dyn SpanCollector>) -> Self {
        Self {
            trace_id: trace_id.into(),
            collector,
        }
    }

    pub fn record(&self, span: SpanRecord) {
        self.collector.record(span);
    }
}

impl std::fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceContext")
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub thread_id: String,
    /// Correlates logs, spans and events of one run
    pub trace_id: String,
    cancel: CancellationToken,
    events: EventSink,
    trace: Option<TraceContext>,
}

impl RunContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            trace_id: Uuid::now_v7().to_string(),
            cancel: CancellationToken::new(),
            events: EventSink::disabled(),
            trace: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Attach a caller-supplied trace; its id replaces the generated one
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace_id = trace.trace_id.clone();
        self.trace = Some(trace);
        self
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emit(&self, event: AgentEvent) {
        self.events.emit(event);
    }

    /// Drive `fut` unless the run is cancelled first; `None` on cancellation
    pub async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_until_cancelled_completes() {
        let ctx = RunContext::new("t");
        assert_eq!(ctx.until_cancelled(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_until_cancelled_interrupts_pending_work() {
        let token = CancellationToken::new();
        let ctx = RunContext::new("t").with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let out = ctx
            .until_cancelled(tokio::time::sleep(Duration::from_secs(30)))
            .await;
        assert!(out.is_none());
        assert!(ctx.is_cancelled());
        canceller.await.unwrap();
    }

    #[test]
    fn test_trace_overrides_trace_id() {
        let spans = Arc::new(InMemorySpans::new());
        let ctx = RunContext::new("t").with_trace(TraceContext::new("abc", spans.clone()));
        assert_eq!(ctx.trace_id, "abc");
        let now = Utc::now();
        ctx.trace().unwrap().record(SpanRecord {
            name: "x".into(),
            trace_id: "abc".into(),
            start: now,
            end: now,
            metadata: BTreeMap::new(),
        });
        assert_eq!(spans.spans().len(), 1);
    }
}
