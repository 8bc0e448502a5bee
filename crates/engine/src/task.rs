//! Per-file upload task: state machine, hash/upload scheduler, retry
//! policy, progress emission.
//!
//! A task drives one file through the protocol: `create_file` for a
//! token, then two parallel activities — streaming the file hash and
//! uploading chunks through the concurrency limiter. A positive
//! `verify_hash` short-circuits to success (instant upload); otherwise
//! the task merges once every chunk is confirmed and the hash is
//! known.
//!
//! ```text
//! idle ─start→ uploading ─pause→ paused ─resume→ uploading
//! uploading ─(chunks + merge ok)→ success
//! uploading ─(retries exhausted / fatal)→ error
//! uploading|paused ─cancel→ cancelled
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chunklift_protocol::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY_MS, MAX_CONCURRENCY,
    MIN_CONCURRENCY,
};
use chunklift_protocol::{
    CreateFileRequest, MergeRequest, RequestAdapter, UploadChunkRequest, UploadToken, VerifyRequest,
};

use crate::adjuster::{AdjusterConfig, ChunkSizeAdjuster};
use crate::digest::{hash_bytes, hash_source, plan_chunks, ChunkSpan, FileSource};
use crate::error::EngineError;
use crate::events::{EventBus, EventHandler, EventKind, HandlerId, TaskEvent};
use crate::limiter::{Limiter, LimiterError};
use crate::now_ms;
use crate::progress::{ByteRate, TaskProgress};
use crate::store::{RecordPatch, RecordStore, UploadRecord};

/// Metadata of the file being uploaded. Immutable for the lifetime of
/// the task; the content hash lives in task state once computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// MIME type; may be empty.
    pub mime_type: String,
    /// Epoch milliseconds; informational only.
    pub last_modified: u64,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Hashing,
    Uploading,
    Paused,
    Success,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Hashing => "hashing",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Paused => "paused",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Tunables for one task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Chunk uploads in flight at once, within `[1, 10]`.
    pub concurrency: usize,
    /// Retries per chunk beyond the first attempt.
    pub retry_count: u32,
    /// Base backoff delay; attempt `n` sleeps `retry_delay_ms << n`.
    pub retry_delay_ms: u64,
    /// Offered to the server on `create_file`; the server may override.
    pub preferred_chunk_size: Option<u64>,
    /// Feedback controller configuration.
    pub adjuster: AdjusterConfig,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            preferred_chunk_size: None,
            adjuster: AdjusterConfig::default(),
        }
    }
}

/// State carried over from a persisted record when resuming.
#[derive(Debug, Clone, Default)]
pub struct ResumeSeed {
    pub task_id: String,
    pub upload_token: Option<UploadToken>,
    pub uploaded_chunks: Vec<u32>,
}

struct TaskState {
    status: TaskStatus,
    token: Option<UploadToken>,
    plan: Vec<ChunkSpan>,
    /// Per-plan-index digest, filled as chunks are read.
    chunk_hashes: Vec<Option<String>>,
    /// Confirmed chunk indices (uploaded now, or known server-side).
    uploaded: BTreeSet<u32>,
    uploaded_bytes: u64,
    file_hash: Option<String>,
    file_url: Option<String>,
    /// Whether a progress record exists for this task yet.
    record_written: bool,
    /// Indices excluded from scheduling by resume construction.
    seeded: BTreeSet<u32>,
}

struct TaskInner {
    id: String,
    file: FileInfo,
    source: Arc<dyn FileSource>,
    adapter: Arc<dyn RequestAdapter>,
    store: Arc<dyn RecordStore>,
    opts: TaskOptions,
    bus: EventBus,
    limiter: Limiter,
    adjuster: Mutex<ChunkSizeAdjuster>,
    rate: ByteRate,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<TaskStatus>,
    pause_tx: watch::Sender<bool>,
    hash_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
    /// Serializes progress snapshots with their emission so
    /// `uploaded_bytes` is monotonic across `progress` events.
    progress_emit: Mutex<()>,
}

enum ChunkOutcome {
    Done,
    /// Result intentionally ignored (cancel, instant upload, clear).
    Discarded,
    Fatal(String),
}

/// One file's upload. Cheap to clone; all clones drive the same task.
#[derive(Clone)]
pub struct UploadTask {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask").field("id", &self.inner.id).finish()
    }
}

impl UploadTask {
    /// Builds a fresh task with a generated id.
    pub fn new(
        file: FileInfo,
        source: Arc<dyn FileSource>,
        adapter: Arc<dyn RequestAdapter>,
        store: Arc<dyn RecordStore>,
        opts: TaskOptions,
    ) -> Result<Self, EngineError> {
        Self::build(file, source, adapter, store, opts, None)
    }

    /// Rebuilds a task from persisted state: the id is reused, the
    /// token seeded, and the given chunk indices excluded from
    /// scheduling.
    pub fn with_resume(
        file: FileInfo,
        source: Arc<dyn FileSource>,
        adapter: Arc<dyn RequestAdapter>,
        store: Arc<dyn RecordStore>,
        opts: TaskOptions,
        seed: ResumeSeed,
    ) -> Result<Self, EngineError> {
        Self::build(file, source, adapter, store, opts, Some(seed))
    }

    fn build(
        file: FileInfo,
        source: Arc<dyn FileSource>,
        adapter: Arc<dyn RequestAdapter>,
        store: Arc<dyn RecordStore>,
        opts: TaskOptions,
        seed: Option<ResumeSeed>,
    ) -> Result<Self, EngineError> {
        if source.len() != file.size {
            return Err(EngineError::InvalidArgument(format!(
                "source length {} does not match declared file size {}",
                source.len(),
                file.size
            )));
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&opts.concurrency) {
            return Err(EngineError::InvalidArgument(format!(
                "concurrency {} outside [{MIN_CONCURRENCY}, {MAX_CONCURRENCY}]",
                opts.concurrency
            )));
        }
        let limiter = Limiter::new(opts.concurrency)
            .map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        let adjuster = ChunkSizeAdjuster::new(opts.adjuster)?;

        let seed = seed.unwrap_or_default();
        let id = if seed.task_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            seed.task_id
        };
        let seeded: BTreeSet<u32> = seed.uploaded_chunks.into_iter().collect();

        let (status_tx, _) = watch::channel(TaskStatus::Idle);
        let (pause_tx, _) = watch::channel(false);
        let (hash_tx, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(TaskInner {
                id,
                file,
                source,
                adapter,
                store,
                opts,
                bus: EventBus::new(),
                limiter,
                adjuster: Mutex::new(adjuster),
                rate: ByteRate::new(),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Idle,
                    token: seed.upload_token,
                    plan: Vec::new(),
                    chunk_hashes: Vec::new(),
                    uploaded: BTreeSet::new(),
                    uploaded_bytes: 0,
                    file_hash: None,
                    file_url: None,
                    record_written: false,
                    seeded,
                }),
                status_tx,
                pause_tx,
                hash_tx,
                cancel: CancellationToken::new(),
                progress_emit: Mutex::new(()),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn file(&self) -> &FileInfo {
        &self.inner.file
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Snapshot of byte/chunk counters and recent speed.
    pub fn progress(&self) -> TaskProgress {
        let state = self.inner.state.lock().unwrap();
        snapshot_progress(&self.inner, &state)
    }

    /// Chunk size the adjuster would pick for the next upload; feeds
    /// the preferred size of a future `create_file`.
    pub fn suggested_chunk_size(&self) -> u64 {
        self.inner.adjuster.lock().unwrap().current_size()
    }

    pub fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        self.inner.bus.on(kind, handler)
    }

    pub fn on_any(&self, handler: EventHandler) -> HandlerId {
        self.inner.bus.on_any(handler)
    }

    pub fn off(&self, id: HandlerId) {
        self.inner.bus.off(id)
    }

    /// Begins the upload. Valid only from `Idle`; must be called from
    /// within a tokio runtime (the task drives itself on spawned
    /// futures).
    pub fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.status != TaskStatus::Idle {
                return Err(EngineError::InvalidTransition(format!(
                    "cannot start from {}",
                    state.status.as_str()
                )));
            }
            set_status(&self.inner, &mut state, TaskStatus::Uploading);
        }
        self.inner.bus.emit(&TaskEvent::Start);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_pipeline(inner).await;
        });
        Ok(())
    }

    /// Stops submitting new chunks; in-flight uploads finish and are
    /// recorded. Valid only from `Uploading`.
    pub fn pause(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.status != TaskStatus::Uploading {
                return Err(EngineError::InvalidTransition(format!(
                    "cannot pause from {}",
                    state.status.as_str()
                )));
            }
            set_status(&self.inner, &mut state, TaskStatus::Paused);
        }
        self.inner.pause_tx.send_replace(true);
        self.inner.bus.emit(&TaskEvent::Pause);
        Ok(())
    }

    /// Re-enters `Uploading` and resubmits remaining chunks. Valid
    /// only from `Paused`.
    pub fn resume(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.status != TaskStatus::Paused {
                return Err(EngineError::InvalidTransition(format!(
                    "cannot resume from {}",
                    state.status.as_str()
                )));
            }
            set_status(&self.inner, &mut state, TaskStatus::Uploading);
        }
        self.inner.pause_tx.send_replace(false);
        self.inner.bus.emit(&TaskEvent::Resume);
        Ok(())
    }

    /// Cancels the task: pending work is cleared synchronously,
    /// in-flight uploads run to completion with their results
    /// discarded, and the progress record is deleted.
    pub fn cancel(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !matches!(state.status, TaskStatus::Uploading | TaskStatus::Paused) {
                return Err(EngineError::InvalidTransition(format!(
                    "cannot cancel from {}",
                    state.status.as_str()
                )));
            }
            set_status(&self.inner, &mut state, TaskStatus::Cancelled);
        }
        self.inner.pause_tx.send_replace(false);
        self.inner.cancel.cancel();
        self.inner.limiter.clear_queue();
        if let Err(e) = self.inner.store.delete_record(&self.inner.id) {
            warn!(task = %self.inner.id, error = %e, "failed to delete progress record on cancel");
        }
        self.inner.bus.emit(&TaskEvent::Cancel);
        Ok(())
    }

    /// Waits until the task reaches a terminal status and returns it.
    pub async fn wait(&self) -> TaskStatus {
        let mut rx = self.inner.status_tx.subscribe();
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

fn set_status(inner: &TaskInner, state: &mut TaskState, status: TaskStatus) {
    state.status = status;
    inner.status_tx.send_replace(status);
}

fn snapshot_progress(inner: &TaskInner, state: &TaskState) -> TaskProgress {
    let total = inner.file.size;
    let uploaded = state.uploaded_bytes;
    TaskProgress {
        uploaded_bytes: uploaded,
        total_bytes: total,
        percentage: TaskProgress::compute_percentage(uploaded, total),
        speed: inner.rate.bytes_per_second(),
        remaining_time: inner.rate.estimate_remaining(total.saturating_sub(uploaded)),
        uploaded_chunks: state.uploaded.len() as u32,
        total_chunks: state.plan.len() as u32,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

async fn run_pipeline(inner: Arc<TaskInner>) {
    if let Err(error) = drive(&inner).await {
        fail_task(&inner, error);
    }
}

async fn drive(inner: &Arc<TaskInner>) -> Result<(), String> {
    let token = ensure_token(inner).await?;

    // The negotiated size fixes the plan for the whole task; the
    // adjuster only influences future tasks.
    {
        let mut state = inner.state.lock().unwrap();
        let plan = plan_chunks(inner.file.size, token.chunk_size.max(1));
        state.chunk_hashes = vec![None; plan.len()];
        let seeded = state.seeded.clone();
        for span in &plan {
            if seeded.contains(&span.index) {
                state.uploaded.insert(span.index);
                state.uploaded_bytes += span.size();
            }
        }
        state.plan = plan;
        state.token = Some(token.clone());
    }

    // Hash runs in parallel with the uploads (a positive verify
    // short-circuits unstarted chunks).
    let hash_handle = tokio::spawn(hash_activity(Arc::clone(inner)));

    let resuming = !inner.state.lock().unwrap().seeded.is_empty();
    if resuming {
        preverify_chunks(inner, &token).await?;
    }

    upload_chunks(inner).await;
    if inner.state.lock().unwrap().status.is_terminal() {
        let _ = hash_handle.await;
        return Ok(());
    }

    merge_when_ready(inner, &token).await?;
    let _ = hash_handle.await;
    Ok(())
}

/// Reuses an unexpired seeded token, otherwise opens a fresh session.
async fn ensure_token(inner: &Arc<TaskInner>) -> Result<UploadToken, String> {
    if let Some(token) = inner.state.lock().unwrap().token.clone() {
        if !token.is_expired(now_ms()) {
            debug!(task = %inner.id, file_id = %token.file_id, "reusing seeded upload token");
            return Ok(token);
        }
        debug!(task = %inner.id, "seeded upload token expired; creating a new session");
    }

    let req = CreateFileRequest {
        file_name: inner.file.name.clone(),
        file_size: inner.file.size,
        file_type: inner.file.mime_type.clone(),
        preferred_chunk_size: inner.opts.preferred_chunk_size,
    };
    let resp = inner
        .adapter
        .create_file(req)
        .await
        .map_err(|e| format!("create file failed: {e}"))?;
    if resp.negotiated_chunk_size == 0 {
        return Err("server negotiated a zero chunk size".into());
    }
    Ok(resp.upload_token)
}

/// Hash activity: streams the digest, then asks the server whether the
/// file already exists (instant upload).
async fn hash_activity(inner: Arc<TaskInner>) {
    let bus = inner.bus.clone();
    let status_tx = inner.status_tx.clone();
    let result = hash_source(Arc::clone(&inner.source), move |percent| {
        if !status_tx.borrow().is_terminal() {
            bus.emit(&TaskEvent::HashProgress { percent });
        }
    })
    .await;

    let hash = match result {
        Ok(hash) => hash,
        Err(e) => {
            fail_task(&inner, format!("file hashing failed: {e}"));
            return;
        }
    };

    let token = {
        let mut state = inner.state.lock().unwrap();
        if state.status.is_terminal() {
            return;
        }
        state.file_hash = Some(hash.clone());
        state.token.clone()
    };
    inner.bus.emit(&TaskEvent::HashComplete { hash: hash.clone() });
    inner.hash_tx.send_replace(Some(hash.clone()));

    let Some(token) = token else { return };
    let req = VerifyRequest {
        upload_token: token.clone(),
        file_hash: Some(hash),
        chunk_hashes: None,
    };
    match inner.adapter.verify_hash(req).await {
        Ok(resp) if resp.file_exists => {
            let url = resp
                .file_url
                .unwrap_or_else(|| format!("/files/{}", token.file_id));
            debug!(task = %inner.id, "file already on server; instant upload");
            finish_success(&inner, url);
        }
        Ok(_) => {}
        Err(e) => fail_task(&inner, format!("verify failed: {e}")),
    }
}

/// Resume path: computes every chunk hash up front and prunes chunks
/// the server already has from the pending set.
async fn preverify_chunks(inner: &Arc<TaskInner>, token: &UploadToken) -> Result<(), String> {
    let plan = inner.state.lock().unwrap().plan.clone();
    let mut hashes = Vec::with_capacity(plan.len());
    for span in &plan {
        if inner.cancel.is_cancelled() {
            return Ok(());
        }
        let source = Arc::clone(&inner.source);
        let (start, end) = (span.start, span.end);
        let hash = tokio::task::spawn_blocking(move || {
            source.read_range(start, end).map(|bytes| hash_bytes(&bytes))
        })
        .await
        .map_err(|e| format!("chunk hash task failed: {e}"))?
        .map_err(|e| format!("chunk read failed: {e}"))?;
        hashes.push(hash);
    }

    {
        let mut state = inner.state.lock().unwrap();
        for (i, hash) in hashes.iter().enumerate() {
            state.chunk_hashes[i] = Some(hash.clone());
        }
    }

    let req = VerifyRequest {
        upload_token: token.clone(),
        file_hash: None,
        chunk_hashes: Some(hashes),
    };
    let resp = inner
        .adapter
        .verify_hash(req)
        .await
        .map_err(|e| format!("verify failed: {e}"))?;

    let mut state = inner.state.lock().unwrap();
    let plan = state.plan.clone();
    for index in resp.existing_chunks {
        if let Some(span) = plan.get(index as usize) {
            if state.uploaded.insert(span.index) {
                state.uploaded_bytes += span.size();
            }
        }
    }
    Ok(())
}

/// Dispatcher: submits pending chunks while running and unpaused,
/// bounded by the limiter; reaps completions as they land.
async fn upload_chunks(inner: &Arc<TaskInner>) {
    let pending_spans: Vec<ChunkSpan> = {
        let state = inner.state.lock().unwrap();
        state
            .plan
            .iter()
            .filter(|s| !state.uploaded.contains(&s.index))
            .copied()
            .collect()
    };
    let mut pending: VecDeque<ChunkSpan> = pending_spans.into();
    let mut join_set: JoinSet<ChunkOutcome> = JoinSet::new();
    let mut pause_rx = inner.pause_tx.subscribe();
    let mut status_rx = inner.status_tx.subscribe();
    let mut fatal: Option<String> = None;

    loop {
        if inner.cancel.is_cancelled() || status_rx.borrow().is_terminal() {
            break;
        }

        let paused = *pause_rx.borrow();
        if !paused && join_set.len() < inner.limiter.limit() {
            if let Some(span) = pending.pop_front() {
                let inner = Arc::clone(inner);
                join_set.spawn(async move { chunk_job(inner, span).await });
                continue;
            }
        }
        if pending.is_empty() && join_set.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => {}
            _ = status_rx.changed() => {}
            _ = pause_rx.changed() => {}
            res = join_set.join_next(), if !join_set.is_empty() => {
                match res {
                    Some(Ok(ChunkOutcome::Fatal(error))) => {
                        fatal = Some(error);
                        break;
                    }
                    Some(Ok(_)) | None => {}
                    Some(Err(e)) => {
                        fatal = Some(format!("chunk task failed: {e}"));
                        break;
                    }
                }
            }
        }
    }

    // Fail fast, then let in-flight uploads run to completion; their
    // results are discarded once the status is terminal.
    if let Some(error) = fatal {
        fail_task(inner, error);
    }
    while let Some(res) = join_set.join_next().await {
        if let Ok(ChunkOutcome::Fatal(error)) = res {
            fail_task(inner, error);
        }
    }
}

async fn chunk_job(inner: Arc<TaskInner>, span: ChunkSpan) -> ChunkOutcome {
    match inner.limiter.run(upload_one_chunk(&inner, span)).await {
        Ok(outcome) => outcome,
        Err(LimiterError::Cleared) => ChunkOutcome::Discarded,
        Err(e) => ChunkOutcome::Fatal(e.to_string()),
    }
}

async fn upload_one_chunk(inner: &Arc<TaskInner>, span: ChunkSpan) -> ChunkOutcome {
    if inner.cancel.is_cancelled() {
        return ChunkOutcome::Discarded;
    }

    // Read + digest off-runtime; reuse a hash computed by preverify.
    let known_hash = inner.state.lock().unwrap().chunk_hashes[span.index as usize].clone();
    let source = Arc::clone(&inner.source);
    let (start, end) = (span.start, span.end);
    let read = tokio::task::spawn_blocking(move || {
        source.read_range(start, end).map(|bytes| {
            let hash = known_hash.unwrap_or_else(|| hash_bytes(&bytes));
            (bytes, hash)
        })
    })
    .await;
    let (bytes, hash) = match read {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return ChunkOutcome::Fatal(format!("chunk {} read failed: {e}", span.index)),
        Err(e) => return ChunkOutcome::Fatal(format!("chunk {} read task failed: {e}", span.index)),
    };
    {
        let mut state = inner.state.lock().unwrap();
        state.chunk_hashes[span.index as usize] = Some(hash.clone());
    }

    let Some(token) = inner.state.lock().unwrap().token.clone() else {
        return ChunkOutcome::Fatal("upload token missing".into());
    };

    let mut attempt: u32 = 0;
    loop {
        if inner.cancel.is_cancelled() {
            return ChunkOutcome::Discarded;
        }

        let req = UploadChunkRequest {
            upload_token: token.clone(),
            chunk_index: span.index,
            chunk_hash: hash.clone(),
        };
        let started = Instant::now();
        match inner.adapter.upload_chunk(req, bytes.clone()).await {
            Ok(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                inner.adjuster.lock().unwrap().adjust(elapsed_ms);
                return finalize_chunk_success(inner, span);
            }
            Err(e) => {
                inner.bus.emit(&TaskEvent::ChunkError {
                    chunk_index: span.index,
                    error: e.to_string(),
                });
                if !e.is_retryable() || attempt >= inner.opts.retry_count {
                    return ChunkOutcome::Fatal(format!(
                        "chunk {} failed after {} attempts: {e}",
                        span.index,
                        attempt + 1
                    ));
                }
                let delay = inner.opts.retry_delay_ms << attempt;
                attempt += 1;
                debug!(task = %inner.id, chunk = span.index, attempt, delay_ms = delay, "retrying chunk upload");
                tokio::select! {
                    _ = inner.cancel.cancelled() => return ChunkOutcome::Discarded,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                }
            }
        }
    }
}

/// Records a confirmed chunk and emits `chunkSuccess` + `progress`.
fn finalize_chunk_success(inner: &Arc<TaskInner>, span: ChunkSpan) -> ChunkOutcome {
    // Serializes the snapshot with its emission so progress events
    // stay monotonic in uploaded_bytes.
    let _emit_guard = inner.progress_emit.lock().unwrap();

    let mut state = inner.state.lock().unwrap();
    if state.status.is_terminal() {
        return ChunkOutcome::Discarded;
    }
    if !state.uploaded.insert(span.index) {
        return ChunkOutcome::Done;
    }
    state.uploaded_bytes += span.size();
    inner.rate.record(span.size());

    let uploaded: Vec<u32> = state.uploaded.iter().copied().collect();
    let first_write = !state.record_written;
    state.record_written = true;
    let record = UploadRecord {
        task_id: inner.id.clone(),
        file_name: inner.file.name.clone(),
        file_size: inner.file.size,
        file_type: inner.file.mime_type.clone(),
        last_modified: inner.file.last_modified,
        file_hash: state.file_hash.clone(),
        uploaded_chunks: uploaded.clone(),
        upload_token: state.token.clone(),
        created_at: now_ms(),
        updated_at: now_ms(),
    };
    let patch = RecordPatch {
        uploaded_chunks: Some(uploaded),
        upload_token: state.token.clone(),
        file_hash: state.file_hash.clone(),
    };
    let progress = snapshot_progress(inner, &state);
    drop(state);

    let result = if first_write {
        inner.store.save_record(&record)
    } else {
        inner.store.update_record(&inner.id, patch).map(|_| ())
    };
    if let Err(e) = result {
        // Persistence is best-effort: the upload continues, only
        // resumability degrades.
        warn!(task = %inner.id, chunk = span.index, error = %e, "progress record write failed");
    }

    inner.bus.emit(&TaskEvent::ChunkSuccess {
        chunk_index: span.index,
    });
    inner.bus.emit(&TaskEvent::Progress(progress));
    ChunkOutcome::Done
}

/// Waits for the file hash (and an unpaused task), then merges the
/// ordered chunk hashes.
async fn merge_when_ready(inner: &Arc<TaskInner>, token: &UploadToken) -> Result<(), String> {
    let mut hash_rx = inner.hash_tx.subscribe();
    let mut status_rx = inner.status_tx.subscribe();
    let file_hash = loop {
        let status = *status_rx.borrow();
        if status.is_terminal() {
            return Ok(());
        }
        // A paused task must not slide into success behind the
        // caller's back; merge waits for resume.
        if status == TaskStatus::Uploading {
            if let Some(hash) = hash_rx.borrow().clone() {
                break hash;
            }
        }
        tokio::select! {
            _ = hash_rx.changed() => {}
            _ = status_rx.changed() => {}
        }
    };

    let chunk_hashes: Vec<String> = {
        let state = inner.state.lock().unwrap();
        let mut hashes = Vec::with_capacity(state.chunk_hashes.len());
        for (i, hash) in state.chunk_hashes.iter().enumerate() {
            match hash {
                Some(h) => hashes.push(h.clone()),
                None => return Err(format!("chunk {i} completed without a recorded hash")),
            }
        }
        hashes
    };

    let req = MergeRequest {
        upload_token: token.clone(),
        file_hash,
        chunk_hashes,
    };
    let resp = inner
        .adapter
        .merge_file(req)
        .await
        .map_err(|e| format!("merge failed: {e}"))?;
    finish_success(inner, resp.file_url);
    Ok(())
}

/// Terminal transition to `Success`; fire-once.
fn finish_success(inner: &Arc<TaskInner>, file_url: String) {
    {
        let mut state = inner.state.lock().unwrap();
        if state.status.is_terminal() {
            return;
        }
        state.file_url = Some(file_url.clone());
        set_status(inner, &mut state, TaskStatus::Success);
    }
    inner.limiter.clear_queue();
    if let Err(e) = inner.store.delete_record(&inner.id) {
        warn!(task = %inner.id, error = %e, "failed to delete progress record on success");
    }
    inner.bus.emit(&TaskEvent::Success { file_url });
}

/// Terminal transition to `Error`; fire-once. The progress record is
/// preserved so the upload can be resumed manually.
fn fail_task(inner: &Arc<TaskInner>, error: String) {
    {
        let mut state = inner.state.lock().unwrap();
        if state.status.is_terminal() {
            return;
        }
        set_status(inner, &mut state, TaskStatus::Error);
    }
    inner.limiter.clear_queue();
    inner.bus.emit(&TaskEvent::Error { error });
}
