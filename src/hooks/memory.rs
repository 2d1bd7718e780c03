//! Reference files loaded once and injected into the system preamble

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{Hook, HookError};
use crate::agent::context::RunContext;
use crate::agent::model::ModelRequest;
use crate::agent::state::AgentState;
use crate::backend::{Backend, BackendError, FsError};

/// A loaded reference file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFile {
    pub path: String,
    pub content: String,
}

pub struct MemoryHook {
    backend: Arc<dyn Backend>,
    paths: Vec<String>,
    loaded: OnceCell<Vec<MemoryFile>>,
}

impl MemoryHook {
    /// # Arguments
    /// * `backend` - Backend the files are read through
    /// * `paths` - Files to load, relative to the backend's working directory
    pub fn new(backend: Arc<dyn Backend>, paths: Vec<String>) -> Self {
        Self {
            backend,
            paths,
            loaded: OnceCell::new(),
        }
    }

    /// Files loaded so far; empty until the first run starts
    pub fn files(&self) -> &[MemoryFile] {
        self.loaded.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Read every configured file; missing files are skipped, any other
    /// failure aborts the load so it is attempted again on the next run
    async fn load(&self) -> Result<Vec<MemoryFile>, BackendError> {
        let mut files = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            match self.backend.filesystem().read(path, None, None).await {
                Ok(content) => files.push(MemoryFile {
                    path: path.clone(),
                    content,
                }),
                Err(BackendError::Fs(FsError::NotFound(_))) => {
                    debug!(path = %path, "Memory file not present, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(loaded = files.len(), requested = self.paths.len(), "Memory loaded");
        Ok(files)
    }
}

/// Render loaded files as one preamble block
pub fn render_memory(files: &[MemoryFile]) -> String {
    if files.is_empty() {
        return String::new();
    }
    let mut block = String::from("# Memory\n\nReference material loaded for this agent:");
    for file in files {
        block.push_str(&format!("\n\n## {}\n\n{}", file.path, file.content.trim_end()));
    }
    block
}

#[async_trait]
impl Hook for MemoryHook {
    fn name(&self) -> &str {
        "memory"
    }

    async fn before_agent(&self, _state: &AgentState, _ctx: &RunContext) -> Result<(), HookError> {
        if let Err(e) = self.loaded.get_or_try_init(|| self.load()).await {
            warn!(error = %e, "Failed to load memory files, retrying on the next run");
        }
        Ok(())
    }

    async fn modify_request(&self, request: &mut ModelRequest, _ctx: &RunContext) -> Result<(), HookError> {
        request.append_system(&render_memory(self.files()));
        Ok(())
    }
}
