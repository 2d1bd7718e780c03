//! Skill catalog injected into the system preamble
//!
//! A skill is a directory holding a `SKILL.md` document whose YAML front
//! matter names and describes it. Only the catalog is injected; the model
//! fetches a skill's full text with the `read` tool when it needs it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{Hook, HookError};
use crate::agent::context::RunContext;
use crate::agent::model::ModelRequest;
use crate::agent::state::AgentState;
use crate::backend::Backend;

/// File name that marks a skill directory
pub const SKILL_FILE: &str = "SKILL.md";

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Path the model passes to `read`
    pub path: String,
}

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    name: Option<String>,
    description: Option<String>,
}

/// Parse a skill document; the name defaults to its directory name
pub fn parse_skill(path: &str, document: &str) -> Option<Skill> {
    let (yaml, body) = split_front_matter(document);
    let front = yaml
        .and_then(|yaml| match serde_yaml::from_str::<FrontMatter>(yaml) {
            Ok(front) => Some(front),
            Err(e) => {
                warn!(path = %path, error = %e, "Invalid skill front matter");
                None
            }
        })
        .unwrap_or_default();

    let name = front.name.filter(|n| !n.trim().is_empty()).or_else(|| {
        Path::new(path)
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    })?;

    let description = front
        .description
        .map(|d| d.trim().to_string())
        .or_else(|| first_paragraph_line(body))
        .unwrap_or_default();

    Some(Skill {
        name: name.trim().to_string(),
        description,
        path: path.to_string(),
    })
}

/// Split a leading `---` delimited YAML block from the document body
fn split_front_matter(document: &str) -> (Option<&str>, &str) {
    let Some(rest) = document
        .strip_prefix("---\n")
        .or_else(|| document.strip_prefix("---\r\n"))
    else {
        return (None, document);
    };
    match rest.find("\n---") {
        Some(end) => {
            let after = &rest[end + 4..];
            let body = after.split_once('\n').map(|(_, b)| b).unwrap_or("");
            (Some(&rest[..end]), body)
        }
        None => (None, document),
    }
}

fn first_paragraph_line(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
}

/// Render the catalog block
pub fn render_catalog(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let mut block = String::from(
        "# Skills\n\nThe following skills are available. When one applies, call `read` on its path \
         to load the full instructions before acting.\n",
    );
    for skill in skills {
        block.push_str(&format!("\n- **{}**: {} ({})", skill.name, skill.description, skill.path));
    }
    block
}

pub struct SkillsHook {
    backend: Arc<dyn Backend>,
    dirs: Vec<String>,
    catalog: OnceCell<Vec<Skill>>,
}

impl SkillsHook {
    /// # Arguments
    /// * `backend` - Backend the skill directories live on
    /// * `dirs` - Directories whose immediate subdirectories are skills
    pub fn new(backend: Arc<dyn Backend>, dirs: Vec<String>) -> Self {
        Self {
            backend,
            dirs,
            catalog: OnceCell::new(),
        }
    }

    pub fn skills(&self) -> &[Skill] {
        self.catalog.get().map(Vec::as_slice).unwrap_or(&[])
    }

    async fn discover(&self) -> Vec<Skill> {
        let fs = self.backend.filesystem();
        let mut skills = Vec::new();
        for dir in &self.dirs {
            let found = match fs.glob(&format!("*/{}", SKILL_FILE), Some(dir)).await {
                Ok(found) => found.matches,
                Err(e) => {
                    debug!(dir = %dir, error = %e, "Skill directory not searchable");
                    continue;
                }
            };
            for path in found {
                match fs.read(&path, None, None).await {
                    Ok(document) => skills.extend(parse_skill(&path, &document)),
                    Err(e) => warn!(path = %path, error = %e, "Failed to read skill"),
                }
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills.dedup_by(|a, b| a.name == b.name);
        debug!(count = skills.len(), "Skills discovered");
        skills
    }
}

#[async_trait]
impl Hook for SkillsHook {
    fn name(&self) -> &str {
        "skills"
    }

    async fn before_agent(&self, _state: &AgentState, _ctx: &RunContext) -> Result<(), HookError> {
        self.catalog.get_or_init(|| self.discover()).await;
        Ok(())
    }

    async fn modify_request(&self, request: &mut ModelRequest, _ctx: &RunContext) -> Result<(), HookError> {
        request.append_system(&render_catalog(self.skills()));
        Ok(())
    }
}
