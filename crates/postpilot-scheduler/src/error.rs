use thiserror::Error;

use postpilot_core::PostStatus;

/// Errors that can occur within the scheduling subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The request was rejected before touching the store.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No post with the given ID exists in the store.
    #[error("Post not found: {id}")]
    PostNotFound { id: String },

    /// The lifecycle has no edge between the two states.
    #[error("Post {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: PostStatus,
        to: PostStatus,
    },

    /// The post is in a state where the requested operation does not apply.
    #[error("Post {id} is {status}; cannot {action}")]
    InvalidState {
        id: String,
        status: PostStatus,
        action: &'static str,
    },

    /// A compare-and-transition lost the race: the status changed under us.
    #[error("Post {id} changed concurrently (expected {expected}, found {found})")]
    Conflict {
        id: String,
        expected: PostStatus,
        found: PostStatus,
    },

    /// A stored or supplied timestamp could not be parsed.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A stored row could not be decoded into a post.
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding the store connection.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl SchedulerError {
    /// Short error code string for CLI and log output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::PostNotFound { .. } => "POST_NOT_FOUND",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::InvalidState { .. } => "INVALID_STATE",
            SchedulerError::Conflict { .. } => "CONFLICT",
            SchedulerError::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
            SchedulerError::CorruptRecord { .. } => "CORRUPT_RECORD",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::LockPoisoned => "LOCK_POISONED",
        }
    }

    /// Errors that mean the store itself is unhealthy, as opposed to a
    /// per-post condition.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::LockPoisoned
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
