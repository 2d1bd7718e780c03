//! Filesystem and shell tools bound to the active backend

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{Hook, HookError};
use crate::agent::context::RunContext;
use crate::agent::model::ModelRequest;
use crate::agent::tool::{arg_opt_str, arg_opt_u64, arg_str, Tool, ToolError, ToolOutput};
use crate::backend::{Backend, BackendError, GrepMatch, SearchResult};

/// Operations exposed as tools, in the order they are registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsOp {
    Ls,
    Read,
    Write,
    Edit,
    Glob,
    Grep,
    Exec,
}

impl FsOp {
    const ALL: [FsOp; 7] = [
        FsOp::Ls,
        FsOp::Read,
        FsOp::Write,
        FsOp::Edit,
        FsOp::Glob,
        FsOp::Grep,
        FsOp::Exec,
    ];

    fn name(self) -> &'static str {
        match self {
            FsOp::Ls => "ls",
            FsOp::Read => "read",
            FsOp::Write => "write",
            FsOp::Edit => "edit",
            FsOp::Glob => "glob",
            FsOp::Grep => "grep",
            FsOp::Exec => "exec",
        }
    }

    fn description(self) -> &'static str {
        match self {
            FsOp::Ls => "List the entries of a directory. Directories are shown with a trailing '/'.",
            FsOp::Read => "Read a text file. Use offset (0-based line) and limit to read a window of a large file.",
            FsOp::Write => "Create or overwrite a file with the given content. Parent directories are created.",
            FsOp::Edit => "Replace the first occurrence of old_text with new_text in a file. Fails if old_text is not present.",
            FsOp::Glob => "Find files whose path matches a glob pattern such as '**/*.rs'.",
            FsOp::Grep => "Search file contents with a regular expression. Results are 'path:line: text'.",
            FsOp::Exec => "Run a shell command and return its exit code, stdout and stderr.",
        }
    }

    fn parameters(self) -> Value {
        match self {
            FsOp::Ls => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory to list, relative to the working directory"}
                }
            }),
            FsOp::Read => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer", "description": "First line to return (0-based)"},
                    "limit": {"type": "integer", "description": "Maximum number of lines"}
                },
                "required": ["path"]
            }),
            FsOp::Write => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
            FsOp::Edit => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_text": {"type": "string"},
                    "new_text": {"type": "string"}
                },
                "required": ["path", "old_text", "new_text"]
            }),
            FsOp::Glob => json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "Directory to search from"}
                },
                "required": ["pattern"]
            }),
            FsOp::Grep => json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression"},
                    "path": {"type": "string", "description": "File or directory to search"},
                    "glob": {"type": "string", "description": "Only search files matching this glob"}
                },
                "required": ["pattern"]
            }),
            FsOp::Exec => json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "workdir": {"type": "string", "description": "Directory to run in"}
                },
                "required": ["command"]
            }),
        }
    }
}

/// One backend operation exposed as a tool
struct FsTool {
    op: FsOp,
    backend: Arc<dyn Backend>,
}

#[async_trait]
impl Tool for FsTool {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn description(&self) -> &str {
        self.op.description()
    }

    fn parameters(&self) -> Value {
        self.op.parameters()
    }

    async fn execute(&self, args: Value, ctx: &RunContext) -> Result<ToolOutput, ToolError> {
        debug!(
            trace_id = %ctx.trace_id,
            backend = %self.backend.name(),
            op = self.op.name(),
            "Backend tool call"
        );
        let fs = self.backend.filesystem();
        let text = match self.op {
            FsOp::Ls => {
                let path = arg_opt_str(&args, "path").unwrap_or("");
                let entries = fs.ls(path).await.map_err(tool_error)?;
                if entries.is_empty() {
                    "(empty directory)".to_string()
                } else {
                    entries
                        .iter()
                        .map(|e| if e.is_dir { format!("{}/", e.name) } else { e.name.clone() })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            FsOp::Read => {
                let path = arg_str(&args, "path")?;
                let offset = arg_opt_u64(&args, "offset").map(|n| n as usize);
                let limit = arg_opt_u64(&args, "limit").map(|n| n as usize);
                fs.read(path, offset, limit).await.map_err(tool_error)?
            }
            FsOp::Write => {
                let path = arg_str(&args, "path")?;
                let content = arg_str(&args, "content")?;
                fs.write(path, content).await.map_err(tool_error)?;
                format!("Wrote {} bytes to {}", content.len(), path)
            }
            FsOp::Edit => {
                let path = arg_str(&args, "path")?;
                fs.edit(path, arg_str(&args, "old_text")?, arg_str(&args, "new_text")?)
                    .await
                    .map_err(tool_error)?;
                format!("Edited {}", path)
            }
            FsOp::Glob => {
                let result = fs
                    .glob(arg_str(&args, "pattern")?, arg_opt_str(&args, "path"))
                    .await
                    .map_err(tool_error)?;
                render_search(&result, |m| m.clone())
            }
            FsOp::Grep => {
                let result = fs
                    .grep(
                        arg_str(&args, "pattern")?,
                        arg_opt_str(&args, "path"),
                        arg_opt_str(&args, "glob"),
                    )
                    .await
                    .map_err(tool_error)?;
                render_search(&result, |m: &GrepMatch| format!("{}:{}: {}", m.path, m.line, m.text))
            }
            FsOp::Exec => {
                let output = self
                    .backend
                    .exec(arg_str(&args, "command")?, arg_opt_str(&args, "workdir"))
                    .await
                    .map_err(tool_error)?;
                output.render()
            }
        };
        Ok(ToolOutput::text(text))
    }
}

fn render_search<T>(result: &SearchResult<T>, line: impl Fn(&T) -> String) -> String {
    if result.matches.is_empty() {
        return "(no matches)".to_string();
    }
    let mut text = result.matches.iter().map(line).collect::<Vec<_>>().join("\n");
    if result.truncated {
        text.push_str(&format!(
            "\n(results truncated at {} matches; narrow the search)",
            result.matches.len()
        ));
    }
    text
}

fn tool_error(err: BackendError) -> ToolError {
    match err {
        BackendError::Unavailable(msg) => ToolError::BackendUnavailable(msg),
        other => ToolError::Execution(other.to_string()),
    }
}

/// Exposes `ls/read/write/edit/glob/grep/exec` bound to one backend
pub struct FilesystemHook {
    backend: Arc<dyn Backend>,
    describe_workdir: bool,
}

impl FilesystemHook {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            describe_workdir: true,
        }
    }

    /// Leave the system preamble untouched
    pub fn without_system_note(mut self) -> Self {
        self.describe_workdir = false;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

#[async_trait]
impl Hook for FilesystemHook {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        FsOp::ALL
            .iter()
            .map(|&op| {
                Arc::new(FsTool {
                    op,
                    backend: self.backend.clone(),
                }) as Arc<dyn Tool>
            })
            .collect()
    }

    async fn modify_request(&self, request: &mut ModelRequest, _ctx: &RunContext) -> Result<(), HookError> {
        if self.describe_workdir {
            request.append_system(&format!(
                "Files and commands run on the '{}' backend. Relative paths resolve against {}.",
                self.backend.name(),
                self.backend.config().workdir.display()
            ));
        }
        Ok(())
    }
}
