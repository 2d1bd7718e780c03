//! Ollama chat client implementing [`ModelClient`]

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::tool_use::{parse_tool_calls_from_text, ChatMessage, ChatResponse, FunctionCall, Tool};
use crate::agent::model::{DeltaSink, ModelClient, ModelError, ModelRequest, ModelResponse};
use crate::agent::state::ToolCall;

/// Client for Ollama's /api/chat endpoint with tool support
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl ChatClient {
    /// Create a new chat client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Ollama server (e.g., "http://localhost:11434")
    /// * `model` - The model name (e.g., "qwen3")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    fn body(&self, request: &ModelRequest, stream: bool) -> serde_json::Value {
        let tool_names: HashMap<&str, &str> = request
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .map(|c| (c.id.as_str(), c.name.as_str()))
            .collect();

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(ChatMessage::system(request.system.clone()));
        }
        messages.extend(request.messages.iter().map(|m| {
            ChatMessage::from_message(m, |id| tool_names.get(id).map(|n| n.to_string()))
        }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
            "options": {
                "temperature": 0.0
            }
        });
        if !request.tools.is_empty() {
            let tools: Vec<Tool> = request.tools.iter().map(Tool::from).collect();
            body["tools"] = json!(tools);
        }
        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ModelError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Turn accumulated content and native calls into a response
    fn finish(&self, request: &ModelRequest, content: String, calls: Vec<FunctionCall>) -> ModelResponse {
        let calls = if calls.is_empty() {
            let known: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
            let parsed = parse_tool_calls_from_text(&content, &known);
            if !parsed.is_empty() {
                debug!(count = parsed.len(), "Recovered tool calls from text content");
            }
            parsed
        } else {
            calls
        };
        ModelResponse {
            content,
            tool_calls: calls
                .into_iter()
                .map(|c| ToolCall::new(Uuid::new_v4().to_string(), c.name, c.arguments))
                .collect(),
        }
    }
}

#[async_trait]
impl ModelClient for ChatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let text = self
            .post(&self.body(request, false))
            .await?
            .text()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;
        if text.is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        let chat: ChatResponse =
            serde_json::from_str(&text).map_err(|e| ModelError::Parse(e.to_string()))?;
        if let Some(error) = chat.error {
            return Err(ModelError::Request(error));
        }
        let calls = chat
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.function)
            .collect();
        Ok(self.finish(request, chat.message.content, calls))
    }

    async fn send_streaming(
        &self,
        request: &ModelRequest,
        on_delta: DeltaSink<'_>,
    ) -> Result<ModelResponse, ModelError> {
        let mut bytes_stream = self.post(&self.body(request, true)).await?.bytes_stream();

        let mut buffer: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut calls = Vec::new();
        let mut done = false;

        // Responses are newline-delimited JSON; a chunk may hold partial lines
        while let Some(chunk) = bytes_stream.next().await {
            let chunk = chunk.map_err(|e| ModelError::Request(e.to_string()))?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                done |= self.apply_line(&line, &mut content, &mut calls, on_delta)?;
            }
        }
        if !buffer.is_empty() {
            done |= self.apply_line(&buffer, &mut content, &mut calls, on_delta)?;
        }

        if !done && content.is_empty() && calls.is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(self.finish(request, content, calls))
    }
}

impl ChatClient {
    /// Fold one streamed line into the accumulators; returns whether it was final
    fn apply_line(
        &self,
        line: &[u8],
        content: &mut String,
        calls: &mut Vec<FunctionCall>,
        on_delta: DeltaSink<'_>,
    ) -> Result<bool, ModelError> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(false);
        }
        let chunk: ChatResponse =
            serde_json::from_slice(line).map_err(|e| ModelError::Parse(e.to_string()))?;
        if let Some(error) = chunk.error {
            return Err(ModelError::Request(error));
        }
        if !chunk.message.content.is_empty() {
            on_delta(&chunk.message.content);
            content.push_str(&chunk.message.content);
        }
        if let Some(tool_calls) = chunk.message.tool_calls {
            calls.extend(tool_calls.into_iter().map(|c| c.function));
        }
        Ok(chunk.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::model::ToolSchema;
    use crate::agent::state::{Message, ToolResult};

    fn request() -> ModelRequest {
        ModelRequest::new(
            "be brief",
            vec![
                Message::user("add 2 and 3"),
                Message::assistant_with_calls("", vec![ToolCall::new("c1", "add", json!({"a": 2, "b": 3}))]),
                Message::tool(ToolResult::success("c1", "5")),
            ],
            vec![ToolSchema {
                name: "add".into(),
                description: "Add numbers".into(),
                parameters: json!({"type": "object"}),
            }],
        )
    }

    #[test]
    fn test_body_layout() {
        let client = ChatClient::new("http://localhost:11434/", "qwen3");
        let body = client.body(&request(), true);
        assert_eq!(body["model"], "qwen3");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][3]["tool_name"], "add");
        assert_eq!(body["tools"][0]["function"]["name"], "add");
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_streamed_lines_accumulate() {
        let client = ChatClient::new("http://x", "m");
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |t: &str| seen.lock().unwrap().push(t.to_string());
        let mut content = String::new();
        let mut calls = Vec::new();

        let lines = [
            r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"lo"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"add","arguments":{"a":1}}}]},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true}"#,
        ];
        let mut done = false;
        for line in lines {
            done |= client
                .apply_line(line.as_bytes(), &mut content, &mut calls, &sink)
                .unwrap();
        }
        assert!(done);
        assert_eq!(content, "Hello");
        assert_eq!(*seen.lock().unwrap(), vec!["Hel", "lo"]);

        let response = client.finish(&request(), content, calls);
        assert_eq!(response.tool_calls.len(), 1);
        assert!(!response.tool_calls[0].id.is_empty());
    }

    #[test]
    fn test_text_tool_calls_get_ids() {
        let client = ChatClient::new("http://x", "m");
        let response = client.finish(
            &request(),
            r#"{"name": "add", "arguments": {"a": 1, "b": 1}}"#.to_string(),
            Vec::new(),
        );
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "add");
        assert_ne!(response.tool_calls[0].id, "");
    }

    #[test]
    fn test_error_line() {
        let client = ChatClient::new("http://x", "m");
        let err = client
            .apply_line(br#"{"error":"model not found"}"#, &mut String::new(), &mut Vec::new(), &|_: &str| {})
            .unwrap_err();
        assert!(matches!(err, ModelError::Request(m) if m == "model not found"));
    }
}
