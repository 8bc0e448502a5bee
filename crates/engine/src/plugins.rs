//! Reference plugins: structured logging and aggregate statistics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{error, info};

use crate::manager::Plugin;
use crate::progress::TaskProgress;
use crate::task::UploadTask;

// ---------------------------------------------------------------------------
// LoggerPlugin
// ---------------------------------------------------------------------------

/// Per-event enable flags for [`LoggerPlugin`].
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub log_created: bool,
    pub log_start: bool,
    /// Progress lines are noisy; off by default.
    pub log_progress: bool,
    pub log_success: bool,
    pub log_error: bool,
    pub log_pause: bool,
    pub log_resume: bool,
    pub log_cancel: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_created: true,
            log_start: true,
            log_progress: false,
            log_success: true,
            log_error: true,
            log_pause: true,
            log_resume: true,
            log_cancel: true,
        }
    }
}

/// Emits one structured log line per lifecycle event.
#[derive(Debug, Default)]
pub struct LoggerPlugin {
    config: LoggerConfig,
}

impl LoggerPlugin {
    pub fn new(config: LoggerConfig) -> Self {
        Self { config }
    }
}

impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        "logger"
    }

    fn on_task_created(&self, task: &UploadTask) {
        if self.config.log_created {
            info!(task = %task.id(), file = %task.file().name, size = task.file().size, "task created");
        }
    }

    fn on_task_start(&self, task: &UploadTask) {
        if self.config.log_start {
            info!(task = %task.id(), file = %task.file().name, "upload started");
        }
    }

    fn on_task_progress(&self, task: &UploadTask, progress: &TaskProgress) {
        if self.config.log_progress {
            info!(
                task = %task.id(),
                uploaded = progress.uploaded_bytes,
                total = progress.total_bytes,
                percent = format_args!("{:.1}", progress.percentage),
                speed = format_args!("{:.0}", progress.speed),
                "upload progress"
            );
        }
    }

    fn on_task_success(&self, task: &UploadTask, file_url: &str) {
        if self.config.log_success {
            info!(task = %task.id(), url = %file_url, "upload succeeded");
        }
    }

    fn on_task_error(&self, task: &UploadTask, error: &str) {
        if self.config.log_error {
            error!(task = %task.id(), error = %error, "upload failed");
        }
    }

    fn on_task_pause(&self, task: &UploadTask) {
        if self.config.log_pause {
            info!(task = %task.id(), "upload paused");
        }
    }

    fn on_task_resume(&self, task: &UploadTask) {
        if self.config.log_resume {
            info!(task = %task.id(), "upload resumed");
        }
    }

    fn on_task_cancel(&self, task: &UploadTask) {
        if self.config.log_cancel {
            info!(task = %task.id(), "upload cancelled");
        }
    }
}

// ---------------------------------------------------------------------------
// StatsPlugin
// ---------------------------------------------------------------------------

/// Aggregated upload statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UploadStats {
    pub total: u64,
    pub successes: u64,
    pub errors: u64,
    pub cancels: u64,
    pub total_bytes: u64,
    pub total_time_ms: u64,
    /// `total_bytes / total_time`, in bytes per second.
    pub average_speed: f64,
    /// `successes / (successes + errors + cancels)`.
    pub success_rate: f64,
}

#[derive(Default)]
struct StatsInner {
    total: u64,
    successes: u64,
    errors: u64,
    cancels: u64,
    total_bytes: u64,
    total_time_ms: u64,
    started_at: HashMap<String, Instant>,
}

/// Counts outcomes and derives average speed and success rate.
/// Tolerates out-of-order events (a `progress` before `start`, a
/// terminal event for an unknown task) without complaint.
#[derive(Default)]
pub struct StatsPlugin {
    inner: Mutex<StatsInner>,
}

impl StatsPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> UploadStats {
        let inner = self.inner.lock().unwrap();
        let finished = inner.successes + inner.errors + inner.cancels;
        UploadStats {
            total: inner.total,
            successes: inner.successes,
            errors: inner.errors,
            cancels: inner.cancels,
            total_bytes: inner.total_bytes,
            total_time_ms: inner.total_time_ms,
            average_speed: if inner.total_time_ms == 0 {
                0.0
            } else {
                inner.total_bytes as f64 / (inner.total_time_ms as f64 / 1_000.0)
            },
            success_rate: if finished == 0 {
                0.0
            } else {
                inner.successes as f64 / finished as f64
            },
        }
    }

    fn finish(&self, task: &UploadTask, outcome: fn(&mut StatsInner)) {
        let mut inner = self.inner.lock().unwrap();
        outcome(&mut inner);
        if let Some(started) = inner.started_at.remove(task.id()) {
            inner.total_time_ms += started.elapsed().as_millis() as u64;
        }
        inner.total_bytes += task.progress().uploaded_bytes;
    }
}

impl Plugin for StatsPlugin {
    fn name(&self) -> &str {
        "statistics"
    }

    fn on_task_created(&self, _task: &UploadTask) {
        self.inner.lock().unwrap().total += 1;
    }

    fn on_task_start(&self, task: &UploadTask) {
        self.inner
            .lock()
            .unwrap()
            .started_at
            .insert(task.id().to_string(), Instant::now());
    }

    fn on_task_success(&self, task: &UploadTask, _file_url: &str) {
        self.finish(task, |s| s.successes += 1);
    }

    fn on_task_error(&self, task: &UploadTask, _error: &str) {
        self.finish(task, |s| s.errors += 1);
    }

    fn on_task_cancel(&self, task: &UploadTask) {
        self.finish(task, |s| s.cancels += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{FileSource, MemorySource};
    use crate::manager::UploadManager;
    use crate::store::{MemoryRecordStore, RecordStore};
    use crate::task::{FileInfo, TaskStatus};
    use crate::testutil::MockAdapter;
    use std::sync::Arc;

    fn file_of(data: &[u8], name: &str) -> (FileInfo, Arc<dyn FileSource>) {
        let info = FileInfo {
            name: name.into(),
            size: data.len() as u64,
            mime_type: "application/octet-stream".into(),
            last_modified: 0,
        };
        (info, Arc::new(MemorySource::new(data.to_vec())))
    }

    #[tokio::test]
    async fn stats_count_successes_and_bytes() {
        let adapter = Arc::new(MockAdapter::with_chunk_size(1024));
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let manager = UploadManager::new(adapter, store);
        manager.init().unwrap();

        let stats = Arc::new(StatsPlugin::new());
        manager.use_plugin(Arc::clone(&stats) as Arc<dyn crate::manager::Plugin>);
        manager.use_plugin(Arc::new(LoggerPlugin::default()));

        let (info, src) = file_of(&vec![1u8; 2048], "s.bin");
        let task = manager.create_task(info, src, None).unwrap();
        task.start().unwrap();
        assert_eq!(task.wait().await, TaskStatus::Success);

        let snap = stats.snapshot();
        assert_eq!(snap.total, 1);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.total_bytes, 2048);
        assert!((snap.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_count_errors() {
        let adapter = Arc::new(MockAdapter::with_chunk_size(1024));
        adapter.fail_chunk_fatal(0);
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let manager = UploadManager::new(adapter, store);
        manager.init().unwrap();

        let stats = Arc::new(StatsPlugin::new());
        manager.use_plugin(Arc::clone(&stats) as Arc<dyn crate::manager::Plugin>);

        let (info, src) = file_of(&vec![1u8; 512], "e.bin");
        let task = manager.create_task(info, src, None).unwrap();
        task.start().unwrap();
        assert_eq!(task.wait().await, TaskStatus::Error);

        let snap = stats.snapshot();
        assert_eq!(snap.errors, 1);
        assert!((snap.success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_tolerate_out_of_order_events() {
        let adapter = Arc::new(MockAdapter::with_chunk_size(1024));
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let (info, src) = file_of(b"x", "o.bin");
        let task = crate::task::UploadTask::new(
            info,
            src,
            adapter,
            store,
            crate::task::TaskOptions::default(),
        )
        .unwrap();

        let stats = StatsPlugin::new();
        // Success before created/start: counters stay coherent.
        stats.on_task_success(&task, "/files/x");
        stats.on_task_progress(&task, &TaskProgress::default());
        let snap = stats.snapshot();
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.total, 0);
        assert_eq!(snap.total_time_ms, 0);
    }

    #[test]
    fn empty_stats_are_zeroed() {
        let stats = StatsPlugin::new();
        let snap = stats.snapshot();
        assert_eq!(snap.average_speed, 0.0);
        assert_eq!(snap.success_rate, 0.0);
    }
}
