//! Manifest and token metadata.
//!
//! A manifest is the logical file: an ordered list of chunk-hash slots
//! plus identity metadata. Completion never moves bytes — merging a
//! file only flips the manifest to `Completed` and binds its content
//! hash. Deleting a file removes the manifest alone; the chunks it
//! referenced live on for dedup.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use chunklift_protocol::UploadToken;

/// Errors produced by a metadata store.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("manifest not found: {0}")]
    NotFound(String),

    #[error("metadata corrupt: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Completion state of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Pending,
    Completed,
}

/// Server-side description of one logical file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    /// Chunk size negotiated for the session; fixes every chunk's
    /// byte span except the final remainder.
    pub chunk_size: u64,
    /// One slot per chunk index; filled as chunks arrive.
    pub chunks: Vec<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub status: ManifestStatus,
    pub created_at: u64,
}

impl Manifest {
    /// Creates a pending manifest with one empty slot per expected
    /// chunk.
    pub fn pending(
        file_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        chunk_size: u64,
        created_at: u64,
    ) -> Self {
        let expected = if file_size == 0 {
            0
        } else {
            file_size.div_ceil(chunk_size.max(1)) as usize
        };
        Self {
            file_id,
            file_name,
            file_size,
            mime_type,
            chunk_size,
            chunks: vec![None; expected],
            file_hash: None,
            status: ManifestStatus::Pending,
            created_at,
        }
    }

    pub fn received_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ManifestStatus::Completed
    }

    /// Byte span `[start, end)` of chunk `index` within the file.
    pub fn chunk_span(&self, index: usize) -> (u64, u64) {
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        (start, end)
    }
}

/// Metadata capability: manifests and issued tokens.
///
/// `update_manifest` is the only mutation path for existing manifests
/// and must be atomic — a concurrent reader sees the manifest before
/// or after the closure, never in between.
pub trait MetadataStore: Send + Sync {
    fn put_manifest(&self, manifest: &Manifest) -> Result<(), MetaError>;
    fn get_manifest(&self, file_id: &str) -> Result<Option<Manifest>, MetaError>;
    fn update_manifest(
        &self,
        file_id: &str,
        apply: &mut dyn FnMut(&mut Manifest),
    ) -> Result<Manifest, MetaError>;
    /// Any completed manifest whose bound file hash matches.
    fn find_completed_by_hash(&self, file_hash: &str) -> Result<Option<Manifest>, MetaError>;
    /// Removes the manifest only; returns whether one existed.
    fn delete_manifest(&self, file_id: &str) -> Result<bool, MetaError>;
    fn list_manifests(&self) -> Result<Vec<Manifest>, MetaError>;

    fn put_token(&self, token: &UploadToken) -> Result<(), MetaError>;
    fn get_token(&self, token_str: &str) -> Result<Option<UploadToken>, MetaError>;
}

// ---------------------------------------------------------------------------
// MemoryMetadataStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    manifests: HashMap<String, Manifest>,
    tokens: HashMap<String, UploadToken>,
}

/// Volatile metadata store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn put_manifest(&self, manifest: &Manifest) -> Result<(), MetaError> {
        self.inner
            .lock()
            .unwrap()
            .manifests
            .insert(manifest.file_id.clone(), manifest.clone());
        Ok(())
    }

    fn get_manifest(&self, file_id: &str) -> Result<Option<Manifest>, MetaError> {
        Ok(self.inner.lock().unwrap().manifests.get(file_id).cloned())
    }

    fn update_manifest(
        &self,
        file_id: &str,
        apply: &mut dyn FnMut(&mut Manifest),
    ) -> Result<Manifest, MetaError> {
        let mut inner = self.inner.lock().unwrap();
        let manifest = inner
            .manifests
            .get_mut(file_id)
            .ok_or_else(|| MetaError::NotFound(file_id.into()))?;
        apply(manifest);
        Ok(manifest.clone())
    }

    fn find_completed_by_hash(&self, file_hash: &str) -> Result<Option<Manifest>, MetaError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .manifests
            .values()
            .find(|m| m.is_completed() && m.file_hash.as_deref() == Some(file_hash))
            .cloned())
    }

    fn delete_manifest(&self, file_id: &str) -> Result<bool, MetaError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .manifests
            .remove(file_id)
            .is_some())
    }

    fn list_manifests(&self) -> Result<Vec<Manifest>, MetaError> {
        let mut all: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .manifests
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn put_token(&self, token: &UploadToken) -> Result<(), MetaError> {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .insert(token.token.clone(), token.clone());
        Ok(())
    }

    fn get_token(&self, token_str: &str) -> Result<Option<UploadToken>, MetaError> {
        Ok(self.inner.lock().unwrap().tokens.get(token_str).cloned())
    }
}

// ---------------------------------------------------------------------------
// JsonMetadataStore
// ---------------------------------------------------------------------------

/// Durable metadata store: one JSON file per manifest and per token,
/// written via temp file + rename. A process-wide mutex serializes
/// read-modify-write so updates stay atomic.
pub struct JsonMetadataStore {
    manifests_dir: PathBuf,
    tokens_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, MetaError> {
        let root = root.into();
        let manifests_dir = root.join("manifests");
        let tokens_dir = root.join("tokens");
        fs::create_dir_all(&manifests_dir)?;
        fs::create_dir_all(&tokens_dir)?;
        Ok(Self {
            manifests_dir,
            tokens_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), MetaError> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| MetaError::Corrupt(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<Option<T>, MetaError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| MetaError::Corrupt(format!("{}: {e}", path.display())))
    }

    fn manifest_path(&self, file_id: &str) -> PathBuf {
        self.manifests_dir.join(format!("{file_id}.json"))
    }

    fn token_path(&self, token_str: &str) -> PathBuf {
        self.tokens_dir.join(format!("{token_str}.json"))
    }
}

impl MetadataStore for JsonMetadataStore {
    fn put_manifest(&self, manifest: &Manifest) -> Result<(), MetaError> {
        let _guard = self.write_lock.lock().unwrap();
        Self::write_json(&self.manifest_path(&manifest.file_id), manifest)
    }

    fn get_manifest(&self, file_id: &str) -> Result<Option<Manifest>, MetaError> {
        Self::read_json(&self.manifest_path(file_id))
    }

    fn update_manifest(
        &self,
        file_id: &str,
        apply: &mut dyn FnMut(&mut Manifest),
    ) -> Result<Manifest, MetaError> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.manifest_path(file_id);
        let mut manifest: Manifest =
            Self::read_json(&path)?.ok_or_else(|| MetaError::NotFound(file_id.into()))?;
        apply(&mut manifest);
        Self::write_json(&path, &manifest)?;
        Ok(manifest)
    }

    fn find_completed_by_hash(&self, file_hash: &str) -> Result<Option<Manifest>, MetaError> {
        Ok(self
            .list_manifests()?
            .into_iter()
            .find(|m| m.is_completed() && m.file_hash.as_deref() == Some(file_hash)))
    }

    fn delete_manifest(&self, file_id: &str) -> Result<bool, MetaError> {
        let _guard = self.write_lock.lock().unwrap();
        match fs::remove_file(self.manifest_path(file_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_manifests(&self) -> Result<Vec<Manifest>, MetaError> {
        let mut all = Vec::new();
        for entry in fs::read_dir(&self.manifests_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match Self::read_json::<Manifest>(&path)? {
                    Some(manifest) => all.push(manifest),
                    None => {}
                }
            }
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn put_token(&self, token: &UploadToken) -> Result<(), MetaError> {
        let _guard = self.write_lock.lock().unwrap();
        Self::write_json(&self.token_path(&token.token), token)
    }

    fn get_token(&self, token_str: &str) -> Result<Option<UploadToken>, MetaError> {
        if token_str.is_empty() || !token_str.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(None);
        }
        Self::read_json(&self.token_path(token_str))
    }
}
