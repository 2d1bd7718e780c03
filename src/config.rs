//! Application configuration
//!
//! Every subsystem owns its config struct with documented defaults;
//! [`AppConfig`] aggregates them. Values come from an optional YAML file and
//! are then overridden by command-line flags and environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::controller::AgentConfig;
use crate::agent::model::RetryPolicy;
use crate::agent::sessions::ThreadStoreConfig;
use crate::backend::BackendConfig;
use crate::hooks::SummarizationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which built-in hooks an agent gets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Expose backend tools (ls, read, write, edit, glob, grep, exec)
    pub filesystem: bool,
    pub todolist: bool,
    /// Compact long conversations
    pub summarization: bool,
    /// Record spans of model and tool calls
    pub tracing: bool,
    /// Reference files injected into the system preamble
    pub memory_files: Vec<String>,
    /// Directories searched for `*/SKILL.md`
    pub skill_dirs: Vec<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            filesystem: true,
            todolist: true,
            summarization: true,
            tracing: false,
            memory_files: vec!["AGENTS.md".to_string()],
            skill_dirs: vec!["skills".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Provider selection, `provider:model[@base_url]`
    pub model: String,
    /// OTLP collector endpoint; tracing stays local when unset
    pub otlp_endpoint: Option<String>,
    pub agent: AgentConfig,
    pub retry: RetryPolicy,
    pub backend: BackendConfig,
    pub threads: ThreadStoreConfig,
    pub summarization: SummarizationConfig,
    pub hooks: HooksConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: "ollama:qwen3".to_string(),
            otlp_endpoint: None,
            agent: AgentConfig::default(),
            retry: RetryPolicy::default(),
            backend: BackendConfig::default(),
            threads: ThreadStoreConfig::default(),
            summarization: SummarizationConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a YAML file; missing sections take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: AppConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse { path: display, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::Invalid("agent.max_iterations must be at least 1".into()));
        }
        if self.backend.timeout_secs == 0 {
            return Err(ConfigError::Invalid("backend.timeout_secs must be at least 1".into()));
        }
        if self.threads.idle_ttl_secs == 0 {
            return Err(ConfigError::Invalid("threads.idle_ttl_secs must be at least 1".into()));
        }
        Ok(())
    }
}
