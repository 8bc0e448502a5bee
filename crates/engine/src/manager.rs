//! Multi-task registry: batch operations, restart resume, plugin
//! fan-out.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use chunklift_protocol::RequestAdapter;

use crate::digest::FileSource;
use crate::error::EngineError;
use crate::events::TaskEvent;
use crate::progress::TaskProgress;
use crate::store::{MemoryRecordStore, RecordStore, StoreError, UploadRecord};
use crate::task::{FileInfo, ResumeSeed, TaskOptions, TaskStatus, UploadTask};

/// Hook bundle invoked around task lifecycles. All methods default to
/// no-ops; implement what you need. Hook panics are caught, logged,
/// and swallowed.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once when the plugin is registered.
    fn install(&self, manager: &UploadManager) {}

    fn on_task_created(&self, task: &UploadTask) {}
    fn on_task_start(&self, task: &UploadTask) {}
    fn on_task_progress(&self, task: &UploadTask, progress: &TaskProgress) {}
    fn on_task_success(&self, task: &UploadTask, file_url: &str) {}
    fn on_task_error(&self, task: &UploadTask, error: &str) {}
    fn on_task_pause(&self, task: &UploadTask) {}
    fn on_task_resume(&self, task: &UploadTask) {}
    fn on_task_cancel(&self, task: &UploadTask) {}
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub total: usize,
    pub idle: usize,
    pub uploading: usize,
    pub paused: usize,
    pub success: usize,
    pub error: usize,
    pub cancelled: usize,
}

struct Registry {
    order: Vec<String>,
    tasks: HashMap<String, UploadTask>,
}

/// Owns the task registry; holds no file bytes.
pub struct UploadManager {
    adapter: Arc<dyn RequestAdapter>,
    store: Mutex<Arc<dyn RecordStore>>,
    registry: Mutex<Registry>,
    plugins: Arc<Mutex<Vec<Arc<dyn Plugin>>>>,
    defaults: TaskOptions,
}

impl UploadManager {
    pub fn new(adapter: Arc<dyn RequestAdapter>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            adapter,
            store: Mutex::new(store),
            registry: Mutex::new(Registry {
                order: Vec::new(),
                tasks: HashMap::new(),
            }),
            plugins: Arc::new(Mutex::new(Vec::new())),
            defaults: TaskOptions::default(),
        }
    }

    /// Overrides the options handed to tasks created without explicit
    /// options.
    pub fn with_defaults(mut self, defaults: TaskOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Initializes the progress store. An unavailable backend degrades
    /// to in-memory operation instead of aborting.
    pub fn init(&self) -> Result<(), EngineError> {
        let result = self.store.lock().unwrap().init();
        if let Err(e) = result {
            warn!(error = %e, "progress store unavailable; degrading to in-memory records");
            let memory: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
            if let Err(e) = memory.init() {
                return Err(e.into());
            }
            *self.store.lock().unwrap() = memory;
        }
        Ok(())
    }

    fn current_store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store.lock().unwrap())
    }

    /// Registers a plugin. Invocation order equals registration order;
    /// duplicate names are permitted.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) {
        dispatch_hook(plugin.name(), || plugin.install(self));
        self.plugins.lock().unwrap().push(plugin);
    }

    /// Creates and registers a task for `file`. The task is idle until
    /// `start` is called on it.
    pub fn create_task(
        &self,
        file: FileInfo,
        source: Arc<dyn FileSource>,
        opts: Option<TaskOptions>,
    ) -> Result<UploadTask, EngineError> {
        let mut opts = opts.unwrap_or_else(|| self.defaults.clone());
        if opts.preferred_chunk_size.is_none() {
            // Seed the next negotiation from the freshest adjuster
            // observation.
            opts.preferred_chunk_size = self.latest_suggested_chunk_size();
        }
        let task = UploadTask::new(
            file,
            source,
            Arc::clone(&self.adapter),
            self.current_store(),
            opts,
        )?;
        self.register(task.clone());
        Ok(task)
    }

    fn latest_suggested_chunk_size(&self) -> Option<u64> {
        let registry = self.registry.lock().unwrap();
        registry
            .order
            .last()
            .and_then(|id| registry.tasks.get(id))
            .map(|task| task.suggested_chunk_size())
    }

    fn register(&self, task: UploadTask) {
        {
            let mut registry = self.registry.lock().unwrap();
            registry.order.push(task.id().to_string());
            registry.tasks.insert(task.id().to_string(), task.clone());
        }
        self.wire_plugins(&task);
        let plugins = self.plugins.lock().unwrap().clone();
        for plugin in &plugins {
            dispatch_hook(plugin.name(), || plugin.on_task_created(&task));
        }
    }

    /// Forwards task events to the plugin hooks.
    fn wire_plugins(&self, task: &UploadTask) {
        let plugins = Arc::clone(&self.plugins);
        let task_for_events = task.clone();
        task.on_any(Box::new(move |event| {
            let current = plugins.lock().unwrap().clone();
            for plugin in &current {
                let task = &task_for_events;
                let name = plugin.name();
                match event {
                    TaskEvent::Start => dispatch_hook(name, || plugin.on_task_start(task)),
                    TaskEvent::Progress(p) => {
                        dispatch_hook(name, || plugin.on_task_progress(task, p))
                    }
                    TaskEvent::Success { file_url } => {
                        dispatch_hook(name, || plugin.on_task_success(task, file_url))
                    }
                    TaskEvent::Error { error } => {
                        dispatch_hook(name, || plugin.on_task_error(task, error))
                    }
                    TaskEvent::Pause => dispatch_hook(name, || plugin.on_task_pause(task)),
                    TaskEvent::Resume => dispatch_hook(name, || plugin.on_task_resume(task)),
                    TaskEvent::Cancel => dispatch_hook(name, || plugin.on_task_cancel(task)),
                    TaskEvent::ChunkSuccess { .. }
                    | TaskEvent::ChunkError { .. }
                    | TaskEvent::HashProgress { .. }
                    | TaskEvent::HashComplete { .. } => {}
                }
            }
        }));
    }

    pub fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        self.registry.lock().unwrap().tasks.get(task_id).cloned()
    }

    /// All registered tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<UploadTask> {
        let registry = self.registry.lock().unwrap();
        registry
            .order
            .iter()
            .filter_map(|id| registry.tasks.get(id).cloned())
            .collect()
    }

    /// Cancels the task if it is active, removes it from the registry,
    /// and deletes its progress record best-effort.
    pub fn delete_task(&self, task_id: &str) -> Result<(), EngineError> {
        let task = {
            let mut registry = self.registry.lock().unwrap();
            registry.order.retain(|id| id != task_id);
            registry.tasks.remove(task_id)
        };
        let task = task.ok_or_else(|| EngineError::TaskNotFound(task_id.into()))?;
        if matches!(task.status(), TaskStatus::Uploading | TaskStatus::Paused) {
            let _ = task.cancel();
        }
        if let Err(e) = self.current_store().delete_record(task_id) {
            warn!(task = %task_id, error = %e, "failed to delete progress record");
        }
        Ok(())
    }

    pub fn pause_all(&self) {
        for task in self.all_tasks() {
            let _ = task.pause();
        }
    }

    pub fn resume_all(&self) {
        for task in self.all_tasks() {
            let _ = task.resume();
        }
    }

    pub fn cancel_all(&self) {
        for task in self.all_tasks() {
            let _ = task.cancel();
        }
    }

    /// Drops terminal tasks from the registry and deletes their
    /// records.
    pub fn clear_completed(&self) {
        let finished: Vec<String> = {
            let registry = self.registry.lock().unwrap();
            registry
                .tasks
                .values()
                .filter(|t| t.status().is_terminal())
                .map(|t| t.id().to_string())
                .collect()
        };
        for id in finished {
            if let Err(e) = self.delete_task(&id) {
                warn!(task = %id, error = %e, "failed to clear completed task");
            }
        }
    }

    pub fn statistics(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for task in self.all_tasks() {
            stats.total += 1;
            match task.status() {
                TaskStatus::Idle | TaskStatus::Hashing => stats.idle += 1,
                TaskStatus::Uploading => stats.uploading += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Success => stats.success += 1,
                TaskStatus::Error => stats.error += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Persisted records of uploads that never finished. The original
    /// bytes cannot survive a restart, so the caller must collect a
    /// re-selected file before resuming.
    pub fn unfinished_tasks(&self) -> Result<Vec<UploadRecord>, StoreError> {
        self.current_store().get_all_records()
    }

    /// Rebuilds a task from its persisted record, validating that the
    /// re-selected file matches the stored identity. `last_modified`
    /// is informational only and deliberately not compared.
    pub fn resume_task(
        &self,
        task_id: &str,
        file: FileInfo,
        source: Arc<dyn FileSource>,
        opts: Option<TaskOptions>,
    ) -> Result<UploadTask, EngineError> {
        let store = self.current_store();
        let record = store
            .get_record(task_id)
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.into()))?;

        if record.file_name != file.name {
            return Err(EngineError::FileMismatch(format!(
                "File name mismatch: expected {}, got {}",
                record.file_name, file.name
            )));
        }
        if record.file_size != file.size {
            return Err(EngineError::FileMismatch(format!(
                "File size mismatch: expected {}, got {}",
                record.file_size, file.size
            )));
        }
        if record.file_type != file.mime_type {
            return Err(EngineError::FileMismatch(format!(
                "File type mismatch: expected {}, got {}",
                record.file_type, file.mime_type
            )));
        }

        let seed = ResumeSeed {
            task_id: record.task_id.clone(),
            upload_token: record.upload_token.clone(),
            uploaded_chunks: record.uploaded_chunks.clone(),
        };
        let task = UploadTask::with_resume(
            file,
            source,
            Arc::clone(&self.adapter),
            Arc::clone(&store),
            opts.unwrap_or_else(|| self.defaults.clone()),
            seed,
        )?;

        // A fresh record is written on the first chunk success.
        if let Err(e) = store.delete_record(task_id) {
            warn!(task = %task_id, error = %e, "failed to drop superseded record");
        }
        info!(task = %task_id, uploaded = record.uploaded_chunks.len(), "resuming upload");
        self.register(task.clone());
        Ok(task)
    }

    /// Cancels everything, closes the store, and clears the registry.
    pub fn close(&self) {
        self.cancel_all();
        if let Err(e) = self.current_store().close() {
            warn!(error = %e, "failed to close progress store");
        }
        let mut registry = self.registry.lock().unwrap();
        registry.order.clear();
        registry.tasks.clear();
    }
}

/// Runs one plugin hook, isolating panics.
fn dispatch_hook<F: FnOnce()>(plugin_name: &str, hook: F) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!(plugin = %plugin_name, "plugin hook panicked; continuing");
    }
}
