//! Content hashing and byte-range slicing.
//!
//! Digests are 128-bit MD5 rendered as 32 lowercase hex characters.
//! Whole-file hashing streams in bounded windows and reports progress
//! in 0–100 increments; per-chunk hashing digests a byte view in one
//! pass. Same bytes always produce the same digest regardless of how
//! the view was constructed.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};

/// Read window for streaming whole-file hashes: 2 MiB.
pub const HASH_WINDOW_SIZE: u64 = 2 * 1024 * 1024;

/// Computes the digest of `data` and returns the hex-encoded result.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// A contiguous byte span of the chunk plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Dense 0-based index within the plan.
    pub index: u32,
    /// Start offset, inclusive.
    pub start: u64,
    /// End offset, exclusive.
    pub end: u64,
}

impl ChunkSpan {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Splits `[0, file_size)` into dense fixed-size spans.
///
/// The last span carries the remainder; an empty file yields an empty
/// plan. `chunk_size` must be positive for non-empty files.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    if file_size == 0 {
        return Vec::new();
    }
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut spans = Vec::with_capacity(file_size.div_ceil(chunk_size) as usize);
    let mut start = 0u64;
    let mut index = 0u32;
    while start < file_size {
        let end = (start + chunk_size).min(file_size);
        spans.push(ChunkSpan { index, start, end });
        start = end;
        index += 1;
    }
    spans
}

/// A readable byte source of known length.
///
/// `read_range` returns the `[start, end)` view of the underlying
/// bytes. Implementations are cheap to share behind an `Arc`; disk
/// sources should be driven through `spawn_blocking`.
pub trait FileSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Returns the bytes in `[start, end)`.
    ///
    /// Fails with `InvalidInput` when the range is out of bounds or
    /// inverted.
    fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for dyn FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileSource(len={})", self.len())
    }
}

fn check_range(len: u64, start: u64, end: u64) -> io::Result<()> {
    if start > end || end > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("range [{start}, {end}) out of bounds for source of {len} bytes"),
        ));
    }
    Ok(())
}

/// In-memory source; slicing is zero-copy.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl FileSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes> {
        check_range(self.len(), start, end)?;
        Ok(self.data.slice(start as usize..end as usize))
    }
}

/// Disk-backed source; each read opens a fresh handle so the source
/// stays shareable without interior locking.
#[derive(Debug)]
pub struct DiskSource {
    path: PathBuf,
    len: u64,
}

impl DiskSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = std::fs::metadata(&path)?.len();
        Ok(Self { path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileSource for DiskSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes> {
        check_range(self.len, start, end)?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Streams the whole source through the digest in bounded windows.
///
/// `on_progress` receives integer percentages 0–100, monotonic and
/// ending at 100; empty sources report 100 immediately and yield the
/// canonical empty digest. Each window is read off-runtime.
pub async fn hash_source<F>(source: Arc<dyn FileSource>, mut on_progress: F) -> io::Result<String>
where
    F: FnMut(u8) + Send,
{
    let total = source.len();
    let mut hasher = Md5::new();
    let mut offset = 0u64;
    let mut last_pct = 0u8;
    on_progress(0);

    while offset < total {
        let end = (offset + HASH_WINDOW_SIZE).min(total);
        let src = Arc::clone(&source);
        let window = tokio::task::spawn_blocking(move || src.read_range(offset, end))
            .await
            .map_err(|e| io::Error::other(format!("hash window task failed: {e}")))??;
        hasher.update(&window);
        offset = end;

        let pct = ((offset as f64 / total as f64) * 100.0).floor() as u8;
        if pct > last_pct {
            last_pct = pct;
            on_progress(pct.min(100));
        }
    }

    if last_pct < 100 {
        on_progress(100);
    }
    Ok(hex::encode(hasher.finalize()))
}
