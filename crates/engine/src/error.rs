//! Error types for the upload engine.

use chunklift_protocol::AdapterError;

use crate::store::StoreError;

/// Errors produced by the upload engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Programmer error: bad inputs to a constructor or API call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested state transition is not in the task's table.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// A resumed file does not match the persisted record.
    #[error("{0}")]
    FileMismatch(String),

    /// The task with the given id is not in the registry.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Failure surfaced by the transport adapter.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Failure surfaced by the progress store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure reading the file source.
    #[error("source read failed: {0}")]
    Source(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_message_is_verbatim() {
        let e = EngineError::FileMismatch("File size mismatch: expected 10, got 20".into());
        assert_eq!(e.to_string(), "File size mismatch: expected 10, got 20");
    }

    #[test]
    fn adapter_error_converts() {
        let e: EngineError = AdapterError::TokenExpired.into();
        assert!(matches!(e, EngineError::Adapter(_)));
    }
}
