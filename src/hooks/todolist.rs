//! Todo list tool: replaces the thread's task list wholesale

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Hook, HookError};
use crate::agent::context::RunContext;
use crate::agent::model::ModelRequest;
use crate::agent::state::{StateUpdate, Todo, TodoStatus};
use crate::agent::tool::{Tool, ToolError, ToolOutput};

pub const WRITE_TODOS: &str = "write_todos";

const GUIDANCE: &str = "# Todo list\n\nFor tasks with several steps, keep a todo list with `write_todos`. \
Each call replaces the whole list, so always send every item with its current status \
(pending, in_progress or completed). Mark an item completed as soon as it is done.";

#[derive(Debug, Deserialize)]
struct WriteTodosArgs {
    todos: Vec<Todo>,
}

struct WriteTodosTool;

#[async_trait]
impl Tool for WriteTodosTool {
    fn name(&self) -> &str {
        WRITE_TODOS
    }

    fn description(&self) -> &str {
        "Replace the todo list with the given items."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": {"type": "string"},
                            "status": {"type": "string", "enum": ["pending", "in_progress", "completed"]}
                        },
                        "required": ["content", "status"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &RunContext) -> Result<ToolOutput, ToolError> {
        let args: WriteTodosArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let summary = summarize(&args.todos);
        Ok(ToolOutput::with_update(summary, StateUpdate::Todos(args.todos)))
    }
}

fn summarize(todos: &[Todo]) -> String {
    if todos.is_empty() {
        return "Todo list cleared".to_string();
    }
    let mut text = format!("Todo list updated ({} items):", todos.len());
    for todo in todos {
        let mark = match todo.status {
            TodoStatus::Pending => "[ ]",
            TodoStatus::InProgress => "[~]",
            TodoStatus::Completed => "[x]",
        };
        text.push_str(&format!("\n{} {}", mark, todo.content));
    }
    text
}

#[derive(Debug, Default)]
pub struct TodoListHook;

impl TodoListHook {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Hook for TodoListHook {
    fn name(&self) -> &str {
        "todolist"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![Arc::new(WriteTodosTool)]
    }

    async fn modify_request(&self, request: &mut ModelRequest, _ctx: &RunContext) -> Result<(), HookError> {
        request.append_system(GUIDANCE);
        Ok(())
    }
}
