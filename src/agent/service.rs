//! Engine facade combining an agent with the thread store
//!
//! [`AgentService::stream`] is the transport-facing entry point: a lazy event
//! sequence per request. Dropping the sequence cancels the request.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::context::{RunContext, SpanCollector, TraceContext};
use super::controller::{Agent, RunOutcome};
use super::events::{AgentEvent, EventSink};
use super::sessions::ThreadStore;
use super::state::AgentState;
use crate::backend::BackendStatus;

/// Lazy, finite event sequence of one request
pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// Outcome of a non-streaming request
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub outcome: RunOutcome,
    /// Thread state after the request
    pub state: AgentState,
}

/// Status source of the backend an agent runs against
#[derive(Clone)]
struct BackendWatch {
    name: String,
    rx: watch::Receiver<BackendStatus>,
}

#[derive(Clone)]
pub struct AgentService {
    agent: Arc<Agent>,
    threads: Arc<ThreadStore>,
    collector: Option<Arc<dyn SpanCollector>>,
    backend: Option<BackendWatch>,
}

enum Step {
    Event(AgentEvent),
    Status(Option<BackendStatus>),
    Finished,
}

impl AgentService {
    pub fn new(agent: Arc<Agent>, threads: Arc<ThreadStore>) -> Self {
        Self {
            agent,
            threads,
            collector: None,
            backend: None,
        }
    }

    /// Record spans of every request into `collector`
    pub fn with_span_collector(mut self, collector: Arc<dyn SpanCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Report launch progress of a backend in every request's event stream
    pub fn with_backend_status(
        mut self,
        name: impl Into<String>,
        rx: watch::Receiver<BackendStatus>,
    ) -> Self {
        self.backend = Some(BackendWatch {
            name: name.into(),
            rx,
        });
        self
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn threads(&self) -> &Arc<ThreadStore> {
        &self.threads
    }

    fn context(&self, thread_id: &str, cancel: CancellationToken, events: EventSink) -> RunContext {
        let ctx = RunContext::new(thread_id)
            .with_cancellation(cancel)
            .with_events(events);
        match &self.collector {
            Some(collector) => {
                let trace = TraceContext::new(ctx.trace_id.clone(), collector.clone());
                ctx.with_trace(trace)
            }
            None => ctx,
        }
    }

    /// Run one request on a thread while holding it exclusively
    async fn run_on_thread(&self, message: String, ctx: &RunContext) -> (RunOutcome, AgentState) {
        let mut thread = self.threads.acquire(&ctx.thread_id).await;
        let outcome = self.agent.run(&mut thread.state, message, ctx).await;
        if outcome.is_done() {
            thread.touch();
        }
        (outcome, thread.state.clone())
    }

    /// Run a request to completion without streaming
    ///
    /// # Arguments
    /// * `thread_id` - Conversation to continue (created on first use)
    /// * `message` - The new user message
    /// * `cancel` - Cancels the request at the next suspension point
    pub async fn invoke(
        &self,
        thread_id: &str,
        message: impl Into<String>,
        cancel: CancellationToken,
    ) -> InvokeResult {
        let ctx = self.context(thread_id, cancel, EventSink::disabled());
        let (outcome, state) = self.run_on_thread(message.into(), &ctx).await;
        InvokeResult { outcome, state }
    }

    /// Start a request and return its event sequence
    ///
    /// Nothing runs until the sequence is polled. Dropping it cancels the
    /// request; `cancel` does the same from the caller's side.
    pub fn stream(
        &self,
        thread_id: impl Into<String>,
        message: impl Into<String>,
        cancel: CancellationToken,
    ) -> EventStream {
        let service = self.clone();
        let thread_id = thread_id.into();
        let message = message.into();

        Box::pin(async_stream::stream! {
            // Cancel in-flight work when the consumer goes away
            let token = cancel.child_token();
            let _cancel_on_drop = token.clone().drop_guard();

            let (sink, mut rx) = EventSink::channel();
            let ctx = service.context(&thread_id, token, sink);

            let mut backend = service.backend.clone();
            if let Some(watch) = backend.as_mut() {
                let status = watch.rx.borrow_and_update().clone();
                yield AgentEvent::BackendStatus { backend: watch.name.clone(), status };
            }

            let run = service.run_on_thread(message, &ctx);
            tokio::pin!(run);

            loop {
                let step = tokio::select! {
                    biased;
                    Some(event) = rx.recv() => Step::Event(event),
                    status = next_status(&mut backend), if backend.is_some() => Step::Status(status),
                    _ = &mut run => Step::Finished,
                };
                match step {
                    Step::Event(event) => {
                        yield event;
                    }
                    Step::Status(Some(status)) => {
                        let name = backend.as_ref().map(|b| b.name.clone()).unwrap_or_default();
                        yield AgentEvent::BackendStatus { backend: name, status };
                    }
                    Step::Status(None) => backend = None,
                    Step::Finished => break,
                }
            }

            // Events emitted right before the run returned
            while let Ok(event) = rx.try_recv() {
                yield event;
            }
        })
    }
}

async fn next_status(backend: &mut Option<BackendWatch>) -> Option<BackendStatus> {
    let watch = backend.as_mut()?;
    watch.rx.changed().await.ok()?;
    let status = watch.rx.borrow_and_update().clone();
    Some(status)
}
