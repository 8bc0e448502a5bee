//! Persistent upload-progress records.
//!
//! The record store is the only state that survives a restart. It is a
//! key/value table keyed by task id; everything else the engine needs
//! is reconstructed from the re-selected file and the server.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use chunklift_protocol::UploadToken;

use crate::now_ms;

/// Errors produced by the progress store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => StoreError::QuotaExceeded,
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::OperationFailed(e.to_string()),
        }
    }
}

/// One persisted in-flight upload. Serialized camelCase, epoch-ms
/// timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub task_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// MIME type; may be empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,
    pub last_modified: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    /// Indices of chunks the server has confirmed, kept sorted.
    #[serde(default)]
    pub uploaded_chunks: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_token: Option<UploadToken>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Partial update applied by [`RecordStore::update_record`]; absent
/// fields keep their stored value. The task id is immutable.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub file_hash: Option<String>,
    pub uploaded_chunks: Option<Vec<u32>>,
    pub upload_token: Option<UploadToken>,
}

impl RecordPatch {
    fn apply(self, record: &mut UploadRecord) {
        if let Some(hash) = self.file_hash {
            record.file_hash = Some(hash);
        }
        if let Some(mut chunks) = self.uploaded_chunks {
            chunks.sort_unstable();
            chunks.dedup();
            record.uploaded_chunks = chunks;
        }
        if let Some(token) = self.upload_token {
            record.upload_token = Some(token);
        }
        record.updated_at = now_ms();
    }
}

/// Key/value persistence for upload records.
pub trait RecordStore: Send + Sync {
    fn init(&self) -> Result<(), StoreError>;
    fn save_record(&self, record: &UploadRecord) -> Result<(), StoreError>;
    fn get_record(&self, task_id: &str) -> Result<Option<UploadRecord>, StoreError>;
    /// Read-modify-write; stamps `updated_at` and preserves fields the
    /// patch leaves out. Fails `OperationFailed` for unknown ids.
    fn update_record(&self, task_id: &str, patch: RecordPatch) -> Result<UploadRecord, StoreError>;
    fn delete_record(&self, task_id: &str) -> Result<(), StoreError>;
    fn get_all_records(&self) -> Result<Vec<UploadRecord>, StoreError>;
    fn clear_all(&self) -> Result<(), StoreError>;
    fn close(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

/// Volatile store; also the degradation target when a persistent
/// backend is unavailable.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, UploadRecord>>,
    closed: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is closed".into()));
        }
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn init(&self) -> Result<(), StoreError> {
        self.check_open()
    }

    fn save_record(&self, record: &UploadRecord) -> Result<(), StoreError> {
        self.check_open()?;
        self.records
            .lock()
            .unwrap()
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    fn get_record(&self, task_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        Ok(self.records.lock().unwrap().get(task_id).cloned())
    }

    fn update_record(&self, task_id: &str, patch: RecordPatch) -> Result<UploadRecord, StoreError> {
        self.check_open()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| StoreError::OperationFailed(format!("no record for task {task_id}")))?;
        patch.apply(record);
        Ok(record.clone())
    }

    fn delete_record(&self, task_id: &str) -> Result<(), StoreError> {
        self.check_open()?;
        self.records.lock().unwrap().remove(task_id);
        Ok(())
    }

    fn get_all_records(&self) -> Result<Vec<UploadRecord>, StoreError> {
        let mut all: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        self.check_open()?;
        self.records.lock().unwrap().clear();
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonRecordStore
// ---------------------------------------------------------------------------

/// Durable store: one `<task_id>.json` per record under a directory,
/// written via temp file + rename so readers never see a torn record.
pub struct JsonRecordStore {
    dir: PathBuf,
    // Serializes all mutations; read-modify-write stays atomic per id.
    write_lock: Mutex<()>,
}

impl JsonRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        if task_id.is_empty()
            || !task_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(StoreError::OperationFailed(format!(
                "task id {task_id:?} is not storable"
            )));
        }
        Ok(self.dir.join(format!("{task_id}.json")))
    }

    fn write_record(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.task_id)?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_record(&self, task_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        let path = self.record_path(task_id)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::OperationFailed(format!("corrupt record {task_id}: {e}")))
    }
}

impl RecordStore for JsonRecordStore {
    fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.dir.display())))
    }

    fn save_record(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        if !self.dir.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "{} does not exist",
                self.dir.display()
            )));
        }
        self.write_record(record)
    }

    fn get_record(&self, task_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        self.read_record(task_id)
    }

    fn update_record(&self, task_id: &str, patch: RecordPatch) -> Result<UploadRecord, StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut record = self
            .read_record(task_id)?
            .ok_or_else(|| StoreError::OperationFailed(format!("no record for task {task_id}")))?;
        patch.apply(&mut record);
        self.write_record(&record)?;
        Ok(record)
    }

    fn delete_record(&self, task_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.record_path(task_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_all_records(&self) -> Result<Vec<UploadRecord>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut all = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let data = fs::read(&path)?;
                match serde_json::from_slice::<UploadRecord>(&data) {
                    Ok(record) => all.push(record),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping corrupt record");
                    }
                }
            }
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        for record in self.get_all_records()? {
            let path = self.record_path(&record.task_id)?;
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(id: &str) -> UploadRecord {
        UploadRecord {
            task_id: id.into(),
            file_name: "video.mp4".into(),
            file_size: 2_621_440,
            file_type: "video/mp4".into(),
            last_modified: 1_700_000_000_000,
            file_hash: None,
            uploaded_chunks: vec![0, 1],
            upload_token: Some(UploadToken {
                token: "a1b2c3d4e5f6a7b8a1b2c3d4e5f6a7b8".into(),
                file_id: "f1".into(),
                chunk_size: 1_048_576,
                expires_at: u64::MAX,
            }),
            created_at: now_ms(),
            updated_at: now_ms(),
        }
    }

    fn roundtrip(store: &dyn RecordStore) {
        store.init().unwrap();
        let record = sample_record("task-1");
        store.save_record(&record).unwrap();
        let loaded = store.get_record("task-1").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get_record("missing").unwrap().is_none());
    }

    #[test]
    fn memory_save_and_get() {
        roundtrip(&MemoryRecordStore::new());
    }

    #[test]
    fn json_save_and_get() {
        let dir = tempfile::tempdir().unwrap();
        roundtrip(&JsonRecordStore::new(dir.path()));
    }

    fn patch_preserves(store: &dyn RecordStore) {
        store.init().unwrap();
        let record = sample_record("task-1");
        store.save_record(&record).unwrap();

        // Empty patch: everything preserved, updated_at stamped.
        let updated = store.update_record("task-1", RecordPatch::default()).unwrap();
        assert!(updated.updated_at >= record.updated_at);
        assert_eq!(updated.uploaded_chunks, record.uploaded_chunks);
        assert_eq!(updated.file_name, record.file_name);

        // Chunk patch sorts and dedups; other fields preserved.
        let updated = store
            .update_record(
                "task-1",
                RecordPatch {
                    uploaded_chunks: Some(vec![3, 1, 0, 1, 2]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.uploaded_chunks, vec![0, 1, 2, 3]);
        assert_eq!(updated.task_id, "task-1");
        assert!(updated.upload_token.is_some());
    }

    #[test]
    fn memory_update_preserves_fields() {
        patch_preserves(&MemoryRecordStore::new());
    }

    #[test]
    fn json_update_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        patch_preserves(&JsonRecordStore::new(dir.path()));
    }

    #[test]
    fn update_missing_record_fails() {
        let store = MemoryRecordStore::new();
        let err = store.update_record("ghost", RecordPatch::default());
        assert!(matches!(err, Err(StoreError::OperationFailed(_))));
    }

    #[test]
    fn delete_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path());
        store.init().unwrap();
        store.save_record(&sample_record("a")).unwrap();
        store.save_record(&sample_record("b")).unwrap();
        assert_eq!(store.get_all_records().unwrap().len(), 2);

        store.delete_record("a").unwrap();
        assert!(store.get_record("a").unwrap().is_none());
        // Deleting again is a no-op.
        store.delete_record("a").unwrap();

        store.clear_all().unwrap();
        assert!(store.get_all_records().unwrap().is_empty());
    }

    #[test]
    fn json_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonRecordStore::new(dir.path());
            store.init().unwrap();
            store.save_record(&sample_record("task-1")).unwrap();
        }
        let store = JsonRecordStore::new(dir.path());
        let loaded = store.get_record("task-1").unwrap().unwrap();
        assert_eq!(loaded.file_name, "video.mp4");
        assert_eq!(loaded.uploaded_chunks, vec![0, 1]);
    }

    #[test]
    fn json_rejects_hostile_task_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path());
        store.init().unwrap();
        let mut record = sample_record("x");
        record.task_id = "../escape".into();
        assert!(matches!(
            store.save_record(&record),
            Err(StoreError::OperationFailed(_))
        ));
    }

    #[test]
    fn json_unavailable_dir_fails_writes() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let store = JsonRecordStore::new(&missing);
        // No init: backing dir absent.
        assert!(matches!(
            store.save_record(&sample_record("t")),
            Err(StoreError::Unavailable(_))
        ));
        // Reads degrade to empty rather than erroring.
        assert!(store.get_all_records().unwrap().is_empty());
    }

    #[test]
    fn memory_close_fails_writes() {
        let store = MemoryRecordStore::new();
        store.init().unwrap();
        store.save_record(&sample_record("t")).unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.save_record(&sample_record("u")),
            Err(StoreError::Unavailable(_))
        ));
        // Existing records remain readable.
        assert!(store.get_record("t").unwrap().is_some());
    }

    #[test]
    fn corrupt_record_is_skipped_in_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path());
        store.init().unwrap();
        store.save_record(&sample_record("good")).unwrap();
        fs::write(dir.path().join("bad.json"), b"{ not json").unwrap();

        let all = store.get_all_records().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].task_id, "good");
    }
}
