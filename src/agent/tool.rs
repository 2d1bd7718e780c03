//! Tool capability and registry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::context::RunContext;
use super::error::AgentError;
use super::model::ToolSchema;
use super::state::StateUpdate;

/// Failure of a single tool call
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Arguments did not match the tool's schema; the tool never ran
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The tool ran and failed; fed back to the model
    #[error("{0}")]
    Execution(String),
    /// No execution path could reach the backend; aborts the run
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// What a tool returns on success
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    /// State mutation applied when the iteration commits
    pub update: Option<StateUpdate>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            update: None,
        }
    }

    pub fn with_update(content: impl Into<String>, update: StateUpdate) -> Self {
        Self {
            content: content.into(),
            update: Some(update),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object
    fn parameters(&self) -> Value;

    /// Run with arguments that already passed schema validation
    async fn execute(&self, args: Value, ctx: &RunContext) -> Result<ToolOutput, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Tools available to one agent, in registration order
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(AgentError::Validation(format!("tool '{}' registered twice", name)));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    /// Resolve `name` and check `args` against its schema
    pub fn validate(&self, name: &str, args: &Value) -> Result<&Arc<dyn Tool>, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::Execution(format!("unknown tool '{}'", name)))?;
        validate_arguments(&tool.parameters(), args)?;
        Ok(tool)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.names()).finish()
    }
}

/// Check `args` against the `required` list and property types of `schema`
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let obj = args
        .as_object()
        .ok_or_else(|| ToolError::InvalidArguments("arguments must be a JSON object".into()))?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            match obj.get(key) {
                None | Some(Value::Null) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "missing required argument '{}'",
                        key
                    )));
                }
                Some(_) => {}
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let matches = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(ToolError::InvalidArguments(format!(
                    "argument '{}' must be of type {}",
                    key, expected
                )));
            }
        }
    }

    Ok(())
}

/// Required string argument
pub fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{}' must be a string", key)))
}

pub fn arg_opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

pub fn arg_opt_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}
