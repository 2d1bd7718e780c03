//! Terminal errors of an agent run

use serde::Serialize;
use thiserror::Error;

use super::model::ModelError;

/// Coarse classification a caller can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ModelCall,
    BackendUnavailable,
    LoopLimitExceeded,
    Cancelled,
    Hook,
}

/// Error that ends a run
///
/// Tool failures are not represented here: they are absorbed into the
/// conversation as tool results and never abort the loop.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Malformed input or configuration, rejected before anything ran
    #[error("validation error: {0}")]
    Validation(String),
    /// Provider failure after the client exhausted its retries
    #[error("model call failed: {0}")]
    ModelCall(#[from] ModelError),
    /// Neither the fast nor the fallback execution path could serve a call
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Safety cap on model iterations reached
    #[error("loop limit exceeded after {max_iterations} iterations")]
    LoopLimitExceeded { max_iterations: usize },
    #[error("run cancelled")]
    Cancelled,
    #[error("hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Validation(_) => ErrorKind::Validation,
            AgentError::ModelCall(_) => ErrorKind::ModelCall,
            AgentError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            AgentError::LoopLimitExceeded { .. } => ErrorKind::LoopLimitExceeded,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Hook { .. } => ErrorKind::Hook,
        }
    }

    /// Whether resubmitting the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::ModelCall(e) => e.is_retryable(),
            AgentError::BackendUnavailable(_) | AgentError::Cancelled => true,
            AgentError::Validation(_)
            | AgentError::LoopLimitExceeded { .. }
            | AgentError::Hook { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_retryability() {
        let err = AgentError::LoopLimitExceeded { max_iterations: 3 };
        assert_eq!(err.kind(), ErrorKind::LoopLimitExceeded);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "loop limit exceeded after 3 iterations");

        let err = AgentError::from(ModelError::Request("connection reset".into()));
        assert_eq!(err.kind(), ErrorKind::ModelCall);
        assert!(err.is_retryable());

        assert!(AgentError::BackendUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::BackendUnavailable).unwrap();
        assert_eq!(json, "\"backend_unavailable\"");
    }
}
