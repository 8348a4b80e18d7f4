use crate::models::conversation::ConversationStatus;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChatError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidStateTransition {
        from: ConversationStatus,
        to: ConversationStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient i/o failure: {0}")]
    TransientIo(String),

    #[error("permanent i/o failure: {0}")]
    PermanentIo(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Returns whether this error is retryable. Validation, permission,
    /// state-machine, and not-found errors surface synchronously and are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::TransientIo(_))
    }
}
