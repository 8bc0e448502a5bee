//! Client-side upload engine.
//!
//! Drives large files through the chunklift protocol: slices a file
//! into a dense chunk plan, uploads chunks in parallel with streaming
//! the content hash, adapts the chunk size to observed network
//! performance, persists progress for resume, and exposes a per-task
//! state machine with typed lifecycle events.
//!
//! The engine owns no transport: it is handed a
//! [`chunklift_protocol::RequestAdapter`] at construction and treats
//! everything behind it as a capability.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod adjuster;
pub mod digest;
pub mod error;
pub mod events;
pub mod limiter;
pub mod manager;
pub mod plugins;
pub mod progress;
pub mod store;
pub mod task;

#[cfg(test)]
pub(crate) mod testutil;

pub use adjuster::{
    recommended_initial_size, AdjusterConfig, ChunkSizeAdjuster, CongestionPhase, TcpChunkAdjuster,
};
pub use digest::{hash_bytes, hash_source, plan_chunks, ChunkSpan, DiskSource, FileSource, MemorySource};
pub use error::EngineError;
pub use events::{EventBus, EventHandler, EventKind, HandlerId, TaskEvent};
pub use limiter::{Limiter, LimiterError};
pub use manager::{ManagerStats, Plugin, UploadManager};
pub use plugins::{LoggerConfig, LoggerPlugin, StatsPlugin, UploadStats};
pub use progress::{ByteRate, TaskProgress};
pub use store::{
    JsonRecordStore, MemoryRecordStore, RecordPatch, RecordStore, StoreError, UploadRecord,
};
pub use task::{FileInfo, ResumeSeed, TaskOptions, TaskStatus, UploadTask};

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
