//! Scheduler error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the scheduling core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Quality grade outside 0..=5.
    #[error("Invalid grade: {0} (expected 0-5)")]
    InvalidGrade(i64),

    /// Unknown learner or card reference.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage collaborator exceeded its deadline.
    #[error("Storage operation timed out")]
    Timeout,

    /// Concurrent update detected and not resolved.
    #[error("Conflicting update: {0}")]
    Conflict(String),

    /// A review with this id is already in the log.
    #[error("Review {0} was already recorded")]
    DuplicateReview(Uuid),

    /// Daily goal must be positive.
    #[error("Invalid daily goal: {0}")]
    InvalidGoal(u32),

    /// Backend failure that a retry will not fix.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SchedulerError {
    /// Whether the queue manager may retry the operation with fresh reads.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Conflict(_))
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result type for scheduling operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SchedulerError::Timeout.is_retryable());
        assert!(SchedulerError::Conflict("card w1".into()).is_retryable());
        assert!(!SchedulerError::InvalidGrade(7).is_retryable());
        assert!(!SchedulerError::NotFound("learner 42".into()).is_retryable());
        assert!(!SchedulerError::Storage("disk full".into()).is_retryable());
        assert!(!SchedulerError::DuplicateReview(Uuid::nil()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::InvalidGrade(-1);
        assert!(err.to_string().contains("Invalid grade: -1"));

        let err = SchedulerError::NotFound("card w3".into());
        assert_eq!(err.to_string(), "Not found: card w3");
    }
}
