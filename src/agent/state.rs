//! Conversation data model
//!
//! Messages are stored in the order the loop produced them and are never
//! reordered. A tool call and its result are joined by the call id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Generated by the model client, join key to the result
    pub id: String,
    pub name: String,
    /// Argument map (always a JSON object)
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the ToolCall this answers
    pub call_id: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text handed back to the model for this result
    pub fn model_text(&self) -> String {
        match &self.error {
            Some(err) if self.output.is_empty() => format!("Error: {}", err),
            Some(err) => format!("{}\nError: {}", self.output, err),
            None => self.output.clone(),
        }
    }
}

/// A single conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Assistant turn that requests tool calls
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Tool turn carrying one result
    pub fn tool(result: ToolResult) -> Self {
        Self {
            content: result.model_text(),
            tool_result: Some(result),
            ..Self::with_role(Role::Tool, "")
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Status of a todo entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// Auxiliary task-list entry, written only by the todo tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
}

/// Mutation a tool asks the loop to apply to the state at commit time
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Replace the todo list wholesale
    Todos(Vec<Todo>),
}

/// Everything persisted for one thread
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub todos: Vec<Todo>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Todos(todos) => self.todos = todos,
        }
    }

    /// Ids of tool calls that have no result appended after them
    pub fn dangling_tool_calls(&self) -> Vec<String> {
        let mut open: Vec<String> = Vec::new();
        for message in &self.messages {
            for call in &message.tool_calls {
                open.push(call.id.clone());
            }
            if let Some(result) = &message.tool_result {
                open.retain(|id| id != &result.call_id);
            }
        }
        open
    }

    /// Content of the last assistant turn, if any
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_message_carries_result_text() {
        let msg = Message::tool(ToolResult::success("call-1", "5"));
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.content, "5");
        assert_eq!(msg.tool_result.as_ref().map(|r| r.call_id.as_str()), Some("call-1"));
    }

    #[test]
    fn test_failed_result_text() {
        let result = ToolResult::failure("c", "file not found");
        assert!(result.is_error());
        assert_eq!(result.model_text(), "Error: file not found");
    }

    #[test]
    fn test_dangling_tool_calls() {
        let mut state = AgentState::new();
        state.messages.push(Message::user("add"));
        state.messages.push(Message::assistant_with_calls(
            "",
            vec![
                ToolCall::new("a", "add", json!({})),
                ToolCall::new("b", "add", json!({})),
            ],
        ));
        state.messages.push(Message::tool(ToolResult::success("a", "1")));
        assert_eq!(state.dangling_tool_calls(), vec!["b".to_string()]);

        state.messages.push(Message::tool(ToolResult::success("b", "2")));
        assert!(state.dangling_tool_calls().is_empty());
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_result"));
    }

    #[test]
    fn test_todo_update_replaces_list() {
        let mut state = AgentState::new();
        state.apply(StateUpdate::Todos(vec![Todo {
            content: "one".into(),
            status: TodoStatus::Pending,
        }]));
        state.apply(StateUpdate::Todos(vec![]));
        assert!(state.todos.is_empty());
    }
}
