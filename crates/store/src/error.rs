//! Error types for the storage engine and upload service.

use chunklift_protocol::AdapterError;

/// Failures surfaced by the upload service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("upload token is not valid")]
    TokenInvalid,

    #[error("upload token expired")]
    TokenExpired,

    /// Delivered bytes do not hash to the claimed digest.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    /// Backend (blob or metadata) failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<ServiceError> for AdapterError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Integrity(msg) => AdapterError::Integrity(msg),
            ServiceError::TokenExpired => AdapterError::TokenExpired,
            ServiceError::Storage(msg) => AdapterError::Network(msg),
            other => AdapterError::Protocol(other.to_string()),
        }
    }
}
