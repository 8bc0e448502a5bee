//! Wire contract for the chunklift upload platform.
//!
//! This crate defines everything both sides of the protocol agree on:
//! the request/response messages, the upload token session handle, the
//! numeric protocol constants, and the [`RequestAdapter`] capability a
//! client engine drives its transport through.
//!
//! Transports (HTTP, loopback, anything else) live elsewhere; this
//! crate is serialization-only and carries no I/O.

pub mod adapter;
pub mod constants;
pub mod messages;
pub mod token;

pub use adapter::{AdapterError, BoxFuture, RequestAdapter};
pub use messages::{
    CreateFileRequest, CreateFileResponse, HealthResponse, MergeRequest, MergeResponse,
    UploadChunkRequest, UploadChunkResponse, VerifyRequest, VerifyResponse,
};
pub use token::{generate_token, validate_token, UploadToken};
