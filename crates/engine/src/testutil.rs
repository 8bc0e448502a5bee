//! In-process mock adapter shared by the engine's tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use chunklift_protocol::{
    generate_token, AdapterError, BoxFuture, CreateFileRequest, CreateFileResponse, MergeRequest,
    MergeResponse, RequestAdapter, UploadChunkRequest, UploadChunkResponse, UploadToken,
    VerifyRequest, VerifyResponse,
};

use crate::digest::hash_bytes;

/// Scriptable fake server for driving the engine without a transport.
pub(crate) struct MockAdapter {
    chunk_size: u64,
    create_calls: AtomicUsize,
    delay_ms: AtomicU64,
    known_files: Mutex<HashMap<String, String>>,
    known_chunks: Mutex<HashSet<String>>,
    uploads: Mutex<Vec<(u32, String)>>,
    attempts: Mutex<HashMap<u32, u32>>,
    fail_always: Mutex<HashSet<u32>>,
    fail_fatal: Mutex<HashSet<u32>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    merges: Mutex<Vec<MergeRequest>>,
}

impl MockAdapter {
    pub(crate) fn with_chunk_size(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            create_calls: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            known_files: Mutex::new(HashMap::new()),
            known_chunks: Mutex::new(HashSet::new()),
            uploads: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            fail_always: Mutex::new(HashSet::new()),
            fail_fatal: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            merges: Mutex::new(Vec::new()),
        }
    }

    /// Pretends a completed file with this hash already exists.
    pub(crate) fn mark_file_known(&self, file_hash: &str, url: &str) {
        self.known_files
            .lock()
            .unwrap()
            .insert(file_hash.into(), url.into());
    }

    /// Pretends a chunk blob with this hash already exists.
    pub(crate) fn mark_chunk_known(&self, chunk_hash: &str) {
        self.known_chunks.lock().unwrap().insert(chunk_hash.into());
    }

    /// Accepts a caller-minted token (resume tests).
    pub(crate) fn adopt_token(&self, _token: &UploadToken) {}

    /// Every upload of this chunk index fails with a retryable error.
    pub(crate) fn fail_chunk_always(&self, index: u32) {
        self.fail_always.lock().unwrap().insert(index);
    }

    /// Every upload of this chunk index fails with a fatal error.
    pub(crate) fn fail_chunk_fatal(&self, index: u32) {
        self.fail_fatal.lock().unwrap().insert(index);
    }

    /// Adds per-chunk latency so tests can observe in-flight state.
    pub(crate) fn set_chunk_delay_ms(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn uploaded_chunk_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub(crate) fn chunk_attempts(&self, index: u32) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn last_merge(&self) -> Option<MergeRequest> {
        self.merges.lock().unwrap().last().cloned()
    }
}

impl RequestAdapter for MockAdapter {
    fn create_file(
        &self,
        req: CreateFileRequest,
    ) -> BoxFuture<'_, Result<CreateFileResponse, AdapterError>> {
        Box::pin(async move {
            let _ = req;
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let token = UploadToken {
                token: generate_token(),
                file_id: uuid::Uuid::new_v4().to_string(),
                chunk_size: self.chunk_size,
                expires_at: u64::MAX,
            };
            Ok(CreateFileResponse {
                negotiated_chunk_size: token.chunk_size,
                upload_token: token,
            })
        })
    }

    fn verify_hash(
        &self,
        req: VerifyRequest,
    ) -> BoxFuture<'_, Result<VerifyResponse, AdapterError>> {
        Box::pin(async move {
            if let Some(file_hash) = &req.file_hash {
                if let Some(url) = self.known_files.lock().unwrap().get(file_hash) {
                    return Ok(VerifyResponse {
                        file_exists: true,
                        file_url: Some(url.clone()),
                        existing_chunks: vec![],
                        missing_chunks: vec![],
                    });
                }
            }
            let mut existing = Vec::new();
            let mut missing = Vec::new();
            if let Some(hashes) = &req.chunk_hashes {
                let known = self.known_chunks.lock().unwrap();
                for (i, hash) in hashes.iter().enumerate() {
                    if known.contains(hash) {
                        existing.push(i as u32);
                    } else {
                        missing.push(i as u32);
                    }
                }
            }
            Ok(VerifyResponse {
                file_exists: false,
                file_url: None,
                existing_chunks: existing,
                missing_chunks: missing,
            })
        })
    }

    fn upload_chunk(
        &self,
        req: UploadChunkRequest,
        bytes: Bytes,
    ) -> BoxFuture<'_, Result<UploadChunkResponse, AdapterError>> {
        Box::pin(async move {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(req.chunk_index)
                .or_insert(0) += 1;

            if self.fail_fatal.lock().unwrap().contains(&req.chunk_index) {
                return Err(AdapterError::Protocol(format!(
                    "chunk {} rejected",
                    req.chunk_index
                )));
            }
            if self.fail_always.lock().unwrap().contains(&req.chunk_index) {
                return Err(AdapterError::Network(format!(
                    "chunk {} connection reset",
                    req.chunk_index
                )));
            }

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if hash_bytes(&bytes) != req.chunk_hash {
                return Err(AdapterError::Integrity(format!(
                    "chunk {} hash mismatch",
                    req.chunk_index
                )));
            }

            self.known_chunks
                .lock()
                .unwrap()
                .insert(req.chunk_hash.clone());
            self.uploads
                .lock()
                .unwrap()
                .push((req.chunk_index, req.chunk_hash.clone()));
            Ok(UploadChunkResponse {
                success: true,
                chunk_hash: req.chunk_hash,
            })
        })
    }

    fn merge_file(&self, req: MergeRequest) -> BoxFuture<'_, Result<MergeResponse, AdapterError>> {
        Box::pin(async move {
            let file_id = req.upload_token.file_id.clone();
            let file_url = format!("/files/{file_id}");
            self.known_files
                .lock()
                .unwrap()
                .insert(req.file_hash.clone(), file_url.clone());
            self.merges.lock().unwrap().push(req);
            Ok(MergeResponse {
                success: true,
                file_url,
                file_id,
            })
        })
    }
}
