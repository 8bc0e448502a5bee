//! Server-side upload service: session lifecycle, chunk intake with
//! dedup, logical merge, and ranged reads.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chunklift_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_TOKEN_TTL_MS, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use chunklift_protocol::{
    generate_token, validate_token, CreateFileRequest, CreateFileResponse, HealthResponse,
    MergeRequest, MergeResponse, UploadChunkRequest, UploadChunkResponse, UploadToken,
    VerifyRequest, VerifyResponse,
};

use crate::blob::BlobStore;
use crate::error::ServiceError;
use crate::meta::{ManifestStatus, MetadataStore};
use crate::now_ms;
use crate::stream::{parse_range, FileStream};

fn digest_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Negotiation bounds and token lifetime.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub default_chunk_size: u64,
    pub token_ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            token_ttl_ms: DEFAULT_TOKEN_TTL_MS,
        }
    }
}

/// The server half of the protocol, generic over its two storage
/// capabilities.
pub struct UploadService {
    blob: Arc<dyn BlobStore>,
    meta: Arc<dyn MetadataStore>,
    config: StoreConfig,
    started: Instant,
}

impl UploadService {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        meta: Arc<dyn MetadataStore>,
        config: StoreConfig,
    ) -> Self {
        Self {
            blob,
            meta,
            config,
            started: Instant::now(),
        }
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blob
    }

    pub fn metadata_store(&self) -> &Arc<dyn MetadataStore> {
        &self.meta
    }

    /// Looks up and validates the presented token.
    fn authenticate(&self, presented: &UploadToken) -> Result<UploadToken, ServiceError> {
        let stored = self
            .meta
            .get_token(&presented.token)
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .ok_or(ServiceError::TokenInvalid)?;
        if !validate_token(&presented.token, &stored.token) || stored.file_id != presented.file_id {
            return Err(ServiceError::TokenInvalid);
        }
        if stored.is_expired(now_ms()) {
            return Err(ServiceError::TokenExpired);
        }
        Ok(stored)
    }

    /// Mints a file id and session token, persists a pending manifest,
    /// and returns the negotiated chunk size (client preference
    /// clamped into the configured bounds).
    pub async fn create_file(
        &self,
        req: CreateFileRequest,
    ) -> Result<CreateFileResponse, ServiceError> {
        if req.file_name.is_empty() {
            return Err(ServiceError::InvalidArgument("fileName is required".into()));
        }

        let chunk_size = req
            .preferred_chunk_size
            .unwrap_or(self.config.default_chunk_size)
            .clamp(self.config.min_chunk_size, self.config.max_chunk_size);

        let file_id = Uuid::new_v4().to_string();
        let token = UploadToken {
            token: generate_token(),
            file_id: file_id.clone(),
            chunk_size,
            expires_at: now_ms() + self.config.token_ttl_ms,
        };

        let manifest = crate::meta::Manifest::pending(
            file_id.clone(),
            req.file_name,
            req.file_size,
            req.file_type,
            chunk_size,
            now_ms(),
        );
        self.meta
            .put_manifest(&manifest)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        self.meta
            .put_token(&token)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        info!(
            file_id = %file_id,
            size = manifest.file_size,
            chunk_size,
            chunks = manifest.chunks.len(),
            "upload session created"
        );
        Ok(CreateFileResponse {
            upload_token: token,
            negotiated_chunk_size: chunk_size,
        })
    }

    /// Answers instant-upload and chunk-presence queries.
    ///
    /// With chunk hashes, known chunks are also recorded into the
    /// session's manifest at the supplied indices (dedup
    /// short-circuit), so a resumed session can merge without
    /// re-sending bytes the store already holds.
    pub async fn verify_hash(&self, req: VerifyRequest) -> Result<VerifyResponse, ServiceError> {
        let token = self.authenticate(&req.upload_token)?;

        if let Some(file_hash) = &req.file_hash {
            if let Some(manifest) = self
                .meta
                .find_completed_by_hash(file_hash)
                .map_err(|e| ServiceError::Storage(e.to_string()))?
            {
                debug!(file_hash = %file_hash, existing = %manifest.file_id, "instant upload hit");
                return Ok(VerifyResponse {
                    file_exists: true,
                    file_url: Some(format!("/files/{}", manifest.file_id)),
                    existing_chunks: vec![],
                    missing_chunks: vec![],
                });
            }
        }

        let mut existing = Vec::new();
        let mut missing = Vec::new();
        if let Some(hashes) = &req.chunk_hashes {
            for (i, hash) in hashes.iter().enumerate() {
                let blob = Arc::clone(&self.blob);
                let hash_owned = hash.clone();
                let present = tokio::task::spawn_blocking(move || blob.has(&hash_owned))
                    .await
                    .map_err(|e| ServiceError::Storage(e.to_string()))?
                    .map_err(|e| ServiceError::Storage(e.to_string()))?;
                if present {
                    existing.push(i as u32);
                } else {
                    missing.push(i as u32);
                }
            }

            if !existing.is_empty() {
                let hashes = hashes.clone();
                let existing = existing.clone();
                self.meta
                    .update_manifest(&token.file_id, &mut |manifest| {
                        for &i in &existing {
                            if let Some(slot) = manifest.chunks.get_mut(i as usize) {
                                *slot = Some(hashes[i as usize].clone());
                            }
                        }
                    })
                    .map_err(|e| ServiceError::Storage(e.to_string()))?;
            }
        }

        Ok(VerifyResponse {
            file_exists: false,
            file_url: None,
            existing_chunks: existing,
            missing_chunks: missing,
        })
    }

    /// Validates and stores one chunk, recording its hash in the
    /// session manifest. Idempotent for identical (hash, bytes)
    /// deliveries.
    pub async fn upload_chunk(
        &self,
        req: UploadChunkRequest,
        bytes: Bytes,
    ) -> Result<UploadChunkResponse, ServiceError> {
        let token = self.authenticate(&req.upload_token)?;

        let manifest = self
            .meta
            .get_manifest(&token.file_id)
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .ok_or_else(|| ServiceError::NotFound(token.file_id.clone()))?;
        if req.chunk_index as usize >= manifest.chunks.len() {
            return Err(ServiceError::InvalidArgument(format!(
                "chunk index {} out of range for {} chunks",
                req.chunk_index,
                manifest.chunks.len()
            )));
        }

        // The claimed digest must match the delivered bytes.
        let actual = digest_hex(&bytes);
        if actual != req.chunk_hash {
            return Err(ServiceError::Integrity(format!(
                "chunk {} claims {} but hashes to {actual}",
                req.chunk_index, req.chunk_hash
            )));
        }

        let blob = Arc::clone(&self.blob);
        let hash = req.chunk_hash.clone();
        let stored = tokio::task::spawn_blocking(move || -> Result<bool, ServiceError> {
            // Content-addressed: skip the write when the blob exists.
            if blob
                .has(&hash)
                .map_err(|e| ServiceError::Storage(e.to_string()))?
            {
                return Ok(false);
            }
            blob.put(&hash, &bytes)
                .map_err(|e| ServiceError::Storage(e.to_string()))?;
            Ok(true)
        })
        .await
        .map_err(|e| ServiceError::Storage(e.to_string()))??;

        self.meta
            .update_manifest(&token.file_id, &mut |manifest| {
                if let Some(slot) = manifest.chunks.get_mut(req.chunk_index as usize) {
                    *slot = Some(req.chunk_hash.clone());
                }
            })
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        debug!(
            file_id = %token.file_id,
            chunk = req.chunk_index,
            deduplicated = !stored,
            "chunk accepted"
        );
        Ok(UploadChunkResponse {
            success: true,
            chunk_hash: req.chunk_hash,
        })
    }

    /// Logical merge: verifies the manifest holds exactly the supplied
    /// hash sequence, then marks it completed and binds the file hash.
    /// No bytes move.
    pub async fn merge_file(&self, req: MergeRequest) -> Result<MergeResponse, ServiceError> {
        let token = self.authenticate(&req.upload_token)?;

        let manifest = self
            .meta
            .get_manifest(&token.file_id)
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .ok_or_else(|| ServiceError::NotFound(token.file_id.clone()))?;

        if req.chunk_hashes.len() != manifest.chunks.len() {
            return Err(ServiceError::InvalidArgument(format!(
                "merge names {} chunks but the session expects {}",
                req.chunk_hashes.len(),
                manifest.chunks.len()
            )));
        }
        for (i, expected) in req.chunk_hashes.iter().enumerate() {
            match &manifest.chunks[i] {
                Some(received) if received == expected => {}
                Some(received) => {
                    return Err(ServiceError::InvalidArgument(format!(
                        "chunk {i} was received as {received} but merge names {expected}"
                    )));
                }
                None => {
                    return Err(ServiceError::InvalidArgument(format!(
                        "chunk {i} was never received"
                    )));
                }
            }
        }

        self.meta
            .update_manifest(&token.file_id, &mut |manifest| {
                manifest.status = ManifestStatus::Completed;
                manifest.file_hash = Some(req.file_hash.clone());
            })
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        info!(file_id = %token.file_id, chunks = req.chunk_hashes.len(), "file merged");
        Ok(MergeResponse {
            success: true,
            file_url: format!("/files/{}", token.file_id),
            file_id: token.file_id,
        })
    }

    /// Opens a (optionally ranged) stream over a completed file.
    ///
    /// `range` is the raw `bytes=start-end` spec; invalid specs fail
    /// with `RangeNotSatisfiable`, incomplete or unknown files with
    /// `NotFound`.
    pub async fn get_file_stream(
        &self,
        file_id: &str,
        range: Option<&str>,
    ) -> Result<FileStream, ServiceError> {
        let manifest = self
            .meta
            .get_manifest(file_id)
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .filter(|m| m.is_completed())
            .ok_or_else(|| ServiceError::NotFound(file_id.into()))?;

        let range = range
            .map(|spec| parse_range(spec, manifest.file_size))
            .transpose()?;
        FileStream::plan(Arc::clone(&self.blob), &manifest, range)
    }

    /// Removes the file's manifest. Chunk blobs are shared across
    /// files and are never deleted.
    pub async fn delete_file(&self, file_id: &str) -> Result<(), ServiceError> {
        let existed = self
            .meta
            .delete_manifest(file_id)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if !existed {
            return Err(ServiceError::NotFound(file_id.into()));
        }
        warn!(file_id = %file_id, "manifest deleted; chunks retained for dedup");
        Ok(())
    }

    /// Liveness probe.
    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".into(),
            timestamp: now_ms(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}
