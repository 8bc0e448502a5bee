//! Server-side content-addressed chunk store.
//!
//! Chunks are stored once per unique content hash and shared across
//! every file that references them; files are logical manifests over
//! ordered chunk hashes, completed by a merge that moves no bytes.
//! Reads assemble the ordered chunks on the fly, with byte-range
//! support.
//!
//! The storage backends are capabilities: [`BlobStore`] for chunk
//! bytes and [`MetadataStore`] for manifests and tokens, each with a
//! filesystem and an in-memory implementation.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod blob;
pub mod error;
pub mod local;
pub mod meta;
pub mod service;
pub mod stream;

pub use blob::{check_hash, BlobError, BlobStore, FsBlobStore, MemoryBlobStore};
pub use error::ServiceError;
pub use local::LocalAdapter;
pub use meta::{
    JsonMetadataStore, Manifest, ManifestStatus, MemoryMetadataStore, MetaError, MetadataStore,
};
pub use service::{StoreConfig, UploadService};
pub use stream::{parse_range, ByteRange, FileStream, ACCEPT_RANGES};

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
