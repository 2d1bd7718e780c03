//! Ollama `/api/chat` wire types with tool calling support
//!
//! Conversions between the engine's messages and Ollama's chat format, plus
//! recovery of tool calls that a model wrote into its text content.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::model::ToolSchema;
use crate::agent::state::{Message, Role};

/// A message in a chat conversation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Name of the tool a "tool" message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            ..Default::default()
        }
    }

    /// Convert an engine message; `tool_name` resolves a result's call id
    pub fn from_message(message: &Message, tool_name: impl Fn(&str) -> Option<String>) -> Self {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| ToolCall {
                        function: FunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };
        let tool_name = match (&message.role, &message.tool_result) {
            (Role::Tool, Some(result)) => tool_name(&result.call_id),
            _ => None,
        };
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            tool_calls,
            tool_name,
        }
    }
}

/// A tool call from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

/// Function call details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

impl From<&ToolSchema> for Tool {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.parameters.clone(),
            },
        }
    }
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

/// One response object from /api/chat; a streamed reply is a sequence of these
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
    #[serde(default)]
    pub eval_duration: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Try to parse tool calls from the response content text
///
/// This handles models that output tool calls as JSON in the text instead of
/// using the native tool_calls field. Only names in `known` are accepted.
pub fn parse_tool_calls_from_text(content: &str, known: &[&str]) -> Vec<FunctionCall> {
    let content = content.trim();

    // Try parsing the entire content as a tool call
    if let Some(call) = try_parse_tool_call(content, known) {
        return vec![call];
    }

    // Look for balanced {...} spans that might be tool calls
    let mut tool_calls = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(call) = try_parse_tool_call(&content[s..=i], known) {
                            tool_calls.push(call);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    tool_calls
}

fn try_parse_tool_call(json_str: &str, known: &[&str]) -> Option<FunctionCall> {
    let value = serde_json::from_str::<Value>(json_str).ok()?;
    let name = value.get("name").and_then(|n| n.as_str())?;
    if !known.contains(&name) {
        return None;
    }

    // Some models use "parameters" instead of "arguments"
    let arguments = value
        .get("arguments")
        .or_else(|| value.get("parameters"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    // Arguments occasionally arrive as a JSON-encoded string
    let arguments = match arguments {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    };

    Some(FunctionCall {
        name: name.to_string(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::{ToolCall as EngineCall, ToolResult};
    use serde_json::json;

    #[test]
    fn test_parse_whole_content() {
        let calls = parse_tool_calls_from_text(
            r#"{"name": "read", "arguments": {"path": "a.txt"}}"#,
            &["read"],
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"path": "a.txt"}));
    }

    #[test]
    fn test_parse_embedded_and_filters_unknown() {
        let text = r#"I'll look first. {"name": "ls", "parameters": {"path": ""}} then
            {"name": "rm_rf", "arguments": {}} and {"name": "exec", "arguments": "{\"command\": \"pwd\"}"}"#;
        let calls = parse_tool_calls_from_text(text, &["ls", "exec"]);
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ls", "exec"]);
        assert_eq!(calls[1].arguments, json!({"command": "pwd"}));
    }

    #[test]
    fn test_plain_text_has_no_calls() {
        assert!(parse_tool_calls_from_text("The answer is 5 } {", &["exec"]).is_empty());
    }

    #[test]
    fn test_tool_message_carries_tool_name() {
        let msg = Message::tool(ToolResult::success("c1", "5"));
        let chat = ChatMessage::from_message(&msg, |id| (id == "c1").then(|| "add".to_string()));
        assert_eq!(chat.role, "tool");
        assert_eq!(chat.tool_name.as_deref(), Some("add"));

        let call = Message::assistant_with_calls("", vec![EngineCall::new("c1", "add", json!({"a": 2}))]);
        let chat = ChatMessage::from_message(&call, |_| None);
        let json = serde_json::to_value(&chat).unwrap();
        assert_eq!(json["tool_calls"][0]["function"]["name"], "add");
    }
}
