//! Content-addressed blob storage.
//!
//! One physical blob per unique content hash, regardless of how many
//! files reference it. Blobs are immutable and never deleted; `put` is
//! idempotent by hash, so concurrent writers need no locking —
//! last-writer-wins is equivalent to first-writer-wins.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;

use chunklift_protocol::constants::HASH_HEX_LEN;

/// Errors produced by a blob store.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Returns `Ok` when `hash` is 32 lowercase hex characters.
pub fn check_hash(hash: &str) -> Result<(), BlobError> {
    let ok = hash.len() == HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(BlobError::InvalidHash(hash.into()))
    }
}

/// Storage capability for content-addressed chunks.
///
/// The trait is synchronous; the upload service drives it through
/// `spawn_blocking` so disk latency stays off the async runtime.
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `hash`. Idempotent: an already-present
    /// hash is success without a write. Implementations must make the
    /// bytes durable before returning.
    fn put(&self, hash: &str, bytes: &[u8]) -> Result<(), BlobError>;

    fn has(&self, hash: &str) -> Result<bool, BlobError>;

    /// Byte length of the stored blob.
    fn len(&self, hash: &str) -> Result<u64, BlobError>;

    /// Reads the blob, optionally restricted to `[start, end)`.
    fn read(&self, hash: &str, range: Option<(u64, u64)>) -> Result<Bytes, BlobError>;
}

fn slice_range(len: u64, range: Option<(u64, u64)>) -> Result<(u64, u64), BlobError> {
    match range {
        None => Ok((0, len)),
        Some((start, end)) => {
            if start > end || end > len {
                return Err(BlobError::InvalidRange(format!(
                    "[{start}, {end}) out of bounds for blob of {len} bytes"
                )));
            }
            Ok((start, end))
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// Volatile blob store for tests and embedded use.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, hash: &str, bytes: &[u8]) -> Result<(), BlobError> {
        check_hash(hash)?;
        self.blobs
            .lock()
            .unwrap()
            .entry(hash.to_string())
            .or_insert_with(|| Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn has(&self, hash: &str) -> Result<bool, BlobError> {
        check_hash(hash)?;
        Ok(self.blobs.lock().unwrap().contains_key(hash))
    }

    fn len(&self, hash: &str) -> Result<u64, BlobError> {
        check_hash(hash)?;
        self.blobs
            .lock()
            .unwrap()
            .get(hash)
            .map(|b| b.len() as u64)
            .ok_or_else(|| BlobError::NotFound(hash.into()))
    }

    fn read(&self, hash: &str, range: Option<(u64, u64)>) -> Result<Bytes, BlobError> {
        check_hash(hash)?;
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get(hash)
            .ok_or_else(|| BlobError::NotFound(hash.into()))?;
        let (start, end) = slice_range(blob.len() as u64, range)?;
        Ok(blob.slice(start as usize..end as usize))
    }
}

// ---------------------------------------------------------------------------
// FsBlobStore
// ---------------------------------------------------------------------------

/// Filesystem blob store: `root/<aa>/<hash>` with two-hex-char shard
/// directories. Writes go to a temp file, are fsynced, then renamed
/// into place so a crash never leaves a half-written blob under its
/// final name.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2]).join(hash)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, hash: &str, bytes: &[u8]) -> Result<(), BlobError> {
        check_hash(hash)?;
        let path = self.blob_path(hash);
        if path.is_file() {
            return Ok(());
        }
        let shard = path.parent().expect("blob path always has a shard parent");
        fs::create_dir_all(shard)?;

        let tmp = shard.join(format!(".{}.{}.tmp", hash, std::process::id()));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn has(&self, hash: &str) -> Result<bool, BlobError> {
        check_hash(hash)?;
        Ok(self.blob_path(hash).is_file())
    }

    fn len(&self, hash: &str) -> Result<u64, BlobError> {
        check_hash(hash)?;
        match fs::metadata(self.blob_path(hash)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(hash.into())),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, hash: &str, range: Option<(u64, u64)>) -> Result<Bytes, BlobError> {
        check_hash(hash)?;
        let mut file = match File::open(self.blob_path(hash)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(hash.into()))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let (start, end) = slice_range(len, range)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(data: &[u8]) -> String {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    fn exercise(store: &dyn BlobStore) {
        let data = b"content-addressed bytes";
        let hash = digest(data);

        assert!(!store.has(&hash).unwrap());
        store.put(&hash, data).unwrap();
        assert!(store.has(&hash).unwrap());
        assert_eq!(store.len(&hash).unwrap(), data.len() as u64);

        // Full and partial reads.
        assert_eq!(&store.read(&hash, None).unwrap()[..], data);
        assert_eq!(&store.read(&hash, Some((8, 17))).unwrap()[..], b"addressed");

        // Idempotent: second put with the same hash is a no-op.
        store.put(&hash, data).unwrap();
        assert_eq!(&store.read(&hash, None).unwrap()[..], data);
    }

    #[test]
    fn memory_store_basics() {
        exercise(&MemoryBlobStore::new());
    }

    #[test]
    fn fs_store_basics() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsBlobStore::new(dir.path()));
    }

    #[test]
    fn fs_store_shards_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let data = b"sharded";
        let hash = digest(data);
        store.put(&hash, data).unwrap();
        assert!(dir.path().join(&hash[..2]).join(&hash).is_file());
    }

    #[test]
    fn content_address_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        for payload in [&b"alpha"[..], b"beta", b"\x00\x01\x02", b""] {
            let hash = digest(payload);
            store.put(&hash, payload).unwrap();
            let back = store.read(&hash, None).unwrap();
            assert_eq!(digest(&back), hash);
        }
    }

    #[test]
    fn rejects_malformed_hashes() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.put("short", b"x"),
            Err(BlobError::InvalidHash(_))
        ));
        assert!(matches!(
            store.put("ZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZ", b"x"),
            Err(BlobError::InvalidHash(_))
        ));
        assert!(matches!(
            store.has("../../../etc/passwd"),
            Err(BlobError::InvalidHash(_))
        ));
    }

    #[test]
    fn read_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let hash = digest(b"never stored");
        assert!(matches!(
            store.read(&hash, None),
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(store.len(&hash), Err(BlobError::NotFound(_))));
    }

    #[test]
    fn out_of_bounds_range_rejected() {
        let store = MemoryBlobStore::new();
        let data = b"0123456789";
        let hash = digest(data);
        store.put(&hash, data).unwrap();
        assert!(matches!(
            store.read(&hash, Some((5, 20))),
            Err(BlobError::InvalidRange(_))
        ));
        assert!(matches!(
            store.read(&hash, Some((7, 3))),
            Err(BlobError::InvalidRange(_))
        ));
    }

    #[test]
    fn first_write_wins_on_duplicate_hash() {
        let store = MemoryBlobStore::new();
        let data = b"original";
        let hash = digest(data);
        store.put(&hash, data).unwrap();
        // A second put under the same hash never mutates the blob.
        store.put(&hash, b"impostor").unwrap();
        assert_eq!(&store.read(&hash, None).unwrap()[..], data);
        assert_eq!(store.blob_count(), 1);
    }
}
