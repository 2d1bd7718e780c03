//! Model client capability
//!
//! The loop only ever talks to a model through [`ModelClient`]: send the
//! conversation plus tool schemas, get back content and tool calls. Provider
//! wire formats live behind implementations of this trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::state::{Message, ToolCall};
use crate::ollama::ChatClient;

/// Tool description handed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
}

/// Outgoing request for one model call
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// System preamble, kept apart from the message list
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    history_rewritten: bool,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, messages: Vec<Message>, tools: Vec<ToolSchema>) -> Self {
        Self {
            system: system.into(),
            messages,
            tools,
            history_rewritten: false,
        }
    }

    /// Replace the conversation history itself, not just this request's view
    /// of it. The loop persists the replacement when the iteration commits.
    pub fn replace_history(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.history_rewritten = true;
    }

    pub fn history_rewritten(&self) -> bool {
        self.history_rewritten
    }

    /// Append a block to the system preamble
    pub fn append_system(&mut self, block: &str) {
        if block.is_empty() {
            return;
        }
        if !self.system.is_empty() {
            self.system.push_str("\n\n");
        }
        self.system.push_str(block);
    }
}

/// Model reply: final content, or tool calls to execute
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
        }
    }
}

/// Typed provider failure
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("request error: {0}")]
    Request(String),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty response from provider")]
    EmptyResponse,
    #[error("invalid model configuration: {0}")]
    Config(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Request(_) | ModelError::EmptyResponse => true,
            ModelError::Status { status, .. } => *status == 429 || *status >= 500,
            ModelError::Parse(_) | ModelError::Config(_) => false,
        }
    }
}

/// Callback receiving partial content while a response streams in
pub type DeltaSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier used in logs and metrics
    fn model_name(&self) -> &str;

    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Streaming variant; clients that cannot stream return the whole reply
    async fn send_streaming(
        &self,
        request: &ModelRequest,
        _on_delta: DeltaSink<'_>,
    ) -> Result<ModelResponse, ModelError> {
        self.send(request).await
    }
}

/// Strategy for retrying transient model failures with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first request
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Cap for later retries
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given retry index (1-based)
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let shift = retry_index.saturating_sub(1).min(31);
        let multiplier = 1u32 << shift;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Retries retryable errors of the wrapped client
///
/// A streamed attempt that already delivered partial content is not retried;
/// its error is returned as is so consumers never see the same text twice.
pub struct RetryingModel {
    inner: Arc<dyn ModelClient>,
    policy: RetryPolicy,
}

impl RetryingModel {
    pub fn new(inner: Arc<dyn ModelClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ModelClient for RetryingModel {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.send_streaming(request, &|_: &str| {}).await
    }

    async fn send_streaming(
        &self,
        request: &ModelRequest,
        on_delta: DeltaSink<'_>,
    ) -> Result<ModelResponse, ModelError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let streamed = AtomicBool::new(false);
        let forward = |text: &str| {
            if !text.is_empty() {
                streamed.store(true, Ordering::SeqCst);
            }
            on_delta(text);
        };
        let mut attempt = 1;
        loop {
            match self.inner.send_streaming(request, &forward).await {
                Ok(response) => return Ok(response),
                Err(e) if streamed.load(Ordering::SeqCst) => {
                    warn!(
                        model = self.inner.model_name(),
                        attempt,
                        error = %e,
                        "Model stream failed after partial output, not retrying"
                    );
                    return Err(e);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(
                        model = self.inner.model_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Model call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Textual provider selection: `provider:model[@base_url]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl ProviderSpec {
    pub fn parse(spec: &str) -> Result<Self, ModelError> {
        let (provider, rest) = spec
            .split_once(':')
            .ok_or_else(|| ModelError::Config(format!("expected provider:model, got '{}'", spec)))?;
        let (model, base_url) = match rest.split_once('@') {
            Some((model, url)) => (model, Some(url.to_string())),
            None => (rest, None),
        };
        if provider.is_empty() || model.is_empty() {
            return Err(ModelError::Config(format!(
                "provider and model must be non-empty in '{}'",
                spec
            )));
        }
        Ok(Self {
            provider: provider.to_lowercase(),
            model: model.to_string(),
            base_url,
        })
    }

    /// Build the client this spec names, wrapped in the retry policy
    pub fn build(&self, retry: RetryPolicy) -> Result<Arc<dyn ModelClient>, ModelError> {
        let client: Arc<dyn ModelClient> = match self.provider.as_str() {
            "ollama" => {
                let base_url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| crate::ollama::DEFAULT_OLLAMA_URL.to_string());
                Arc::new(ChatClient::new(base_url, self.model.clone()))
            }
            other => {
                return Err(ModelError::Config(format!("unknown model provider '{}'", other)));
            }
        };
        Ok(Arc::new(RetryingModel::new(client, retry)))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
        error: ModelError,
    }

    #[async_trait]
    impl ModelClient for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(ModelResponse::text("ok"))
        }
    }

    /// Streams `partial` and then fails on the first call; succeeds after that
    struct BreaksMidStream {
        calls: AtomicU32,
        partial: &'static str,
    }

    #[async_trait]
    impl ModelClient for BreaksMidStream {
        fn model_name(&self) -> &str {
            "breaks-mid-stream"
        }

        async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            self.send_streaming(request, &|_: &str| {}).await
        }

        async fn send_streaming(
            &self,
            _request: &ModelRequest,
            on_delta: DeltaSink<'_>,
        ) -> Result<ModelResponse, ModelError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                on_delta(self.partial);
                return Err(ModelError::Request("connection reset".into()));
            }
            on_delta("complete answer");
            Ok(ModelResponse::text("complete answer"))
        }
    }

    fn collect_deltas() -> (Arc<std::sync::Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync) {
        let deltas = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = {
            let deltas = deltas.clone();
            move |text: &str| deltas.lock().unwrap().push(text.to_string())
        };
        (deltas, sink)
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
            error: ModelError::Status { status: 503, body: "busy".into() },
        });
        let model = RetryingModel::new(flaky.clone(), policy(3));
        let response = model.send(&ModelRequest::default()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
            error: ModelError::Request("refused".into()),
        });
        let model = RetryingModel::new(flaky.clone(), policy(2));
        assert!(model.send(&ModelRequest::default()).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_fatal_errors() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
            error: ModelError::Status { status: 400, body: "bad".into() },
        });
        let model = RetryingModel::new(flaky.clone(), policy(5));
        assert!(model.send(&ModelRequest::default()).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_stream_is_not_replayed() {
        let inner = Arc::new(BreaksMidStream {
            calls: AtomicU32::new(0),
            partial: "compl",
        });
        let model = RetryingModel::new(inner.clone(), policy(3));
        let (deltas, sink) = collect_deltas();

        let err = model.send_streaming(&ModelRequest::default(), &sink).await.unwrap_err();
        assert!(matches!(err, ModelError::Request(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*deltas.lock().unwrap(), vec!["compl".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_before_any_delta_is_retried() {
        let inner = Arc::new(BreaksMidStream {
            calls: AtomicU32::new(0),
            partial: "",
        });
        let model = RetryingModel::new(inner.clone(), policy(3));
        let (deltas, sink) = collect_deltas();

        let response = model.send_streaming(&ModelRequest::default(), &sink).await.unwrap();
        assert_eq!(response.content, "complete answer");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(deltas.lock().unwrap().concat(), "complete answer");
    }

    #[test]
    fn test_provider_spec_parse() {
        let spec = ProviderSpec::parse("ollama:qwen3").unwrap();
        assert_eq!(spec.provider, "ollama");
        assert_eq!(spec.model, "qwen3");
        assert!(spec.base_url.is_none());

        let spec = ProviderSpec::parse("Ollama:llama3.2@http://gpu:11434").unwrap();
        assert_eq!(spec.provider, "ollama");
        assert_eq!(spec.base_url.as_deref(), Some("http://gpu:11434"));

        assert!(ProviderSpec::parse("qwen3").is_err());
        assert!(ProviderSpec::parse(":qwen3").is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let spec = ProviderSpec::parse("acme:big-model").unwrap();
        assert!(matches!(spec.build(RetryPolicy::default()), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_replace_history_marks_request() {
        let mut request = ModelRequest::new("sys", vec![Message::user("a")], vec![]);
        assert!(!request.history_rewritten());
        request.append_system("more");
        assert_eq!(request.system, "sys\n\nmore");
        request.replace_history(vec![]);
        assert!(request.history_rewritten());
    }
}
