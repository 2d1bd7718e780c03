//! Conversation compaction
//!
//! Before each model call the conversation size is estimated. Past the
//! budget, everything except the most recent turns is replaced by one
//! synthesized summary turn. The system preamble and the recent turns are
//! kept verbatim, and a tool result is never separated from the assistant
//! turn that requested it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Hook, HookError};
use crate::agent::context::RunContext;
use crate::agent::model::{ModelClient, ModelRequest};
use crate::agent::state::{Message, Role};

const SUMMARY_PROMPT: &str = "You compress conversation transcripts. Summarize the transcript \
below so the conversation can continue without it. Keep the user's goals, decisions made, \
files touched, commands run with their outcomes, and any open questions. Reply with the \
summary only.";

/// Prefix marking a synthesized summary turn
pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    /// Estimated token count above which history is compacted
    pub max_tokens: usize,
    /// Most recent turns kept verbatim
    pub keep_recent: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 12_000,
            keep_recent: 6,
        }
    }
}

/// Rough token estimate: four characters per token
pub fn estimate_tokens(request: &ModelRequest) -> usize {
    let chars: usize = request.system.len()
        + request
            .messages
            .iter()
            .map(|m| {
                m.content.len()
                    + m.tool_calls
                        .iter()
                        .map(|c| c.name.len() + c.arguments.to_string().len())
                        .sum::<usize>()
            })
            .sum::<usize>();
    chars / 4
}

/// Index of the first kept message, or `None` when there is nothing to fold
pub fn split_point(messages: &[Message], keep_recent: usize) -> Option<usize> {
    let len = messages.len();
    let mut split = len.saturating_sub(keep_recent);
    while split > 0 && split < len && messages[split].role == Role::Tool {
        split -= 1;
    }
    (split > 0).then_some(split)
}

fn transcript(messages: &[Message]) -> String {
    let mut text = String::new();
    for m in messages {
        text.push_str(&format!("[{}] {}\n", m.role.as_str(), m.content));
        for call in &m.tool_calls {
            text.push_str(&format!("  -> {}({})\n", call.name, call.arguments));
        }
    }
    text
}

pub struct SummarizationHook {
    model: Arc<dyn ModelClient>,
    config: SummarizationConfig,
}

impl SummarizationHook {
    /// # Arguments
    /// * `model` - Client used to write summaries, usually the agent's own
    /// * `config` - Budget and number of turns kept verbatim
    pub fn new(model: Arc<dyn ModelClient>, config: SummarizationConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &SummarizationConfig {
        &self.config
    }
}

#[async_trait]
impl Hook for SummarizationHook {
    fn name(&self) -> &str {
        "summarization"
    }

    async fn modify_request(&self, request: &mut ModelRequest, ctx: &RunContext) -> Result<(), HookError> {
        let estimated = estimate_tokens(request);
        if estimated <= self.config.max_tokens {
            return Ok(());
        }
        let Some(split) = split_point(&request.messages, self.config.keep_recent) else {
            return Ok(());
        };

        let summary_request = ModelRequest::new(
            SUMMARY_PROMPT,
            vec![Message::user(transcript(&request.messages[..split]))],
            Vec::new(),
        );
        let summary = match ctx.until_cancelled(self.model.send(&summary_request)).await {
            Some(Ok(response)) if !response.content.trim().is_empty() => response.content,
            Some(Ok(_)) => {
                warn!(trace_id = %ctx.trace_id, "Summary was empty, keeping full history");
                return Ok(());
            }
            Some(Err(e)) => {
                warn!(trace_id = %ctx.trace_id, error = %e, "Summarization failed, keeping full history");
                return Ok(());
            }
            None => return Ok(()),
        };

        let mut history = Vec::with_capacity(request.messages.len() - split + 1);
        history.push(Message::system(format!("{}\n{}", SUMMARY_PREFIX, summary.trim())));
        history.extend(request.messages[split..].iter().cloned());

        info!(
            trace_id = %ctx.trace_id,
            thread_id = %ctx.thread_id,
            estimated_tokens = estimated,
            folded = split,
            kept = history.len() - 1,
            "Conversation summarized"
        );
        request.replace_history(history);
        Ok(())
    }
}
