use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("backend unavailable: {operation} failed after {attempts} attempt(s): {last_error}")]
    BackendUnavailable {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("answer generation failed for {question_id} after {attempts} attempt(s): {reason}")]
    AnswerGenerationFailed {
        question_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("dataset integrity error: {0}")]
    DatasetIntegrity(String),

    #[error("persistence error at {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("run cancelled")]
    Cancelled,
}

impl BenchError {
    pub fn persistence(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Self::Persistence {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type BenchResult<T> = Result<T, BenchError>;

/// Failure of a single call to an external collaborator (memory service or oracle).
///
/// `Transient` covers network errors, timeouts, rate limits and 5xx responses and
/// is retried by [`crate::BackoffPolicy`]. `Permanent` is returned immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl CallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}
