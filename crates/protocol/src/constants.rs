//! Protocol-wide numeric contract.
//!
//! Both the client engine and the server negotiate within these bounds;
//! the server clamps any client preference into `[MIN_CHUNK_SIZE,
//! MAX_CHUNK_SIZE]`.

/// Smallest negotiable chunk size: 256 KiB.
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// Largest negotiable chunk size: 10 MiB.
pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Default initial chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Target per-chunk upload time the client adjuster steers toward.
pub const DEFAULT_TARGET_TIME_MS: u64 = 3_000;

/// Default number of chunk uploads in flight per task.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Lower bound on per-task concurrency.
pub const MIN_CONCURRENCY: usize = 1;

/// Upper bound on per-task concurrency.
pub const MAX_CONCURRENCY: usize = 10;

/// Default retry attempts per chunk upload (beyond the first try).
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Base delay for exponential chunk-retry backoff.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Content digests are 32 lowercase hex characters (128-bit).
pub const HASH_HEX_LEN: usize = 32;

/// Upload tokens are 32 lowercase hex characters (16 CSPRNG bytes).
pub const TOKEN_HEX_LEN: usize = 32;

/// Default upload-token lifetime: 24 hours.
pub const DEFAULT_TOKEN_TTL_MS: u64 = 24 * 60 * 60 * 1_000;
