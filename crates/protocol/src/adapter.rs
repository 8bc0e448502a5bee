//! The transport capability the upload engine is driven through.
//!
//! The engine never talks to a network itself; it consumes a
//! [`RequestAdapter`] selected at construction. Adapter implementers
//! own transport-level concerns (serialization, timeouts, TLS,
//! transport retries); the engine layers application-level retry on
//! top of the errors surfaced here.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::messages::{
    CreateFileRequest, CreateFileResponse, MergeRequest, MergeResponse, UploadChunkRequest,
    UploadChunkResponse, VerifyRequest, VerifyResponse,
};

/// Boxed future returned by adapter calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure surfaced by an adapter call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// Transport-level failure (connection refused, timeout, 5xx, ...).
    #[error("network error: {0}")]
    Network(String),

    /// The server rejected the chunk because its digest did not match
    /// the delivered bytes.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The request was malformed or violated the protocol contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The upload token has expired; the session cannot continue.
    #[error("upload token expired")]
    TokenExpired,
}

impl AdapterError {
    /// Whether the engine's per-chunk retry loop should try again.
    ///
    /// Network failures are transient by definition; integrity
    /// failures are treated the same (a corrupted frame re-sent
    /// cleanly succeeds). Protocol violations and expired tokens
    /// cannot be retried into success.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Network(_) | AdapterError::Integrity(_))
    }
}

/// The four protocol calls, each idempotent on identical inputs.
pub trait RequestAdapter: Send + Sync {
    /// Opens an upload session; the server may override the preferred
    /// chunk size.
    fn create_file(
        &self,
        req: CreateFileRequest,
    ) -> BoxFuture<'_, Result<CreateFileResponse, AdapterError>>;

    /// Queries for instant-upload and already-present chunks.
    fn verify_hash(&self, req: VerifyRequest)
        -> BoxFuture<'_, Result<VerifyResponse, AdapterError>>;

    /// Delivers one chunk's bytes; the server validates the digest.
    fn upload_chunk(
        &self,
        req: UploadChunkRequest,
        bytes: Bytes,
    ) -> BoxFuture<'_, Result<UploadChunkResponse, AdapterError>>;

    /// Finalizes the file from its ordered chunk hashes.
    fn merge_file(&self, req: MergeRequest) -> BoxFuture<'_, Result<MergeResponse, AdapterError>>;
}
