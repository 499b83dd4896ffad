//! Error taxonomy for the analysis core.
//!
//! Fatal errors ([`AnalysisError`]) are returned before any chain run starts.
//! Stage-level problems never surface here; they are contained in the run's
//! `StageResult` list.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal errors returned to callers of the analysis and recommendation engines.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unknown goal '{goal}'")]
    UnknownGoal { goal: String },

    #[error("insufficient data for goal '{goal}': {reason}")]
    InsufficientData { goal: String, reason: String },

    #[error("token budget exhausted before goal '{goal}' could start")]
    BudgetExhausted { goal: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl AnalysisError {
    /// Stable kind label, used in logs and exit messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::UnknownGoal { .. } => "unknown_goal",
            AnalysisError::InsufficientData { .. } => "insufficient_data",
            AnalysisError::BudgetExhausted { .. } => "budget_exhausted",
            AnalysisError::Configuration(_) => "configuration_error",
        }
    }
}

/// Malformed goal or template definitions. Raised at load time only.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read goal file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("goal file YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid definition for goal '{goal}': {message}")]
    Invalid { goal: String, message: String },
}

impl ConfigurationError {
    pub fn invalid(goal: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            goal: goal.into(),
            message: message.into(),
        }
    }
}

/// Failure of a single model invocation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("model call timed out after {}s", after.as_secs_f64())]
    Timeout { after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("model API rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed model API response: {0}")]
    Malformed(String),
}

impl InvocationError {
    /// Transient failures are retried with backoff; the rest fail the stage at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InvocationError::Timeout { .. } | InvocationError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(InvocationError::Timeout {
            after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(InvocationError::Transport("reset".to_string()).is_transient());
        assert!(!InvocationError::Rejected {
            status: 400,
            body: "bad".to_string()
        }
        .is_transient());
        assert!(!InvocationError::Malformed("eof".to_string()).is_transient());
    }

    #[test]
    fn test_error_kind_and_display() {
        let err = AnalysisError::UnknownGoal {
            goal: "not_a_real_goal".to_string(),
        };
        assert_eq!(err.kind(), "unknown_goal");
        assert_eq!(err.to_string(), "unknown goal 'not_a_real_goal'");

        let err: AnalysisError = ConfigurationError::invalid("g", "empty chain").into();
        assert_eq!(err.kind(), "configuration_error");
        assert!(err.to_string().contains("empty chain"));
    }
}
