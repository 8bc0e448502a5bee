//! In-process transport: a [`RequestAdapter`] wired straight into an
//! [`UploadService`].
//!
//! This is the reference adapter implementation and the harness the
//! end-to-end scenarios run on; an HTTP binding would make the same
//! four calls over the wire.

use std::sync::Arc;

use bytes::Bytes;

use chunklift_protocol::{
    AdapterError, BoxFuture, CreateFileRequest, CreateFileResponse, MergeRequest, MergeResponse,
    RequestAdapter, UploadChunkRequest, UploadChunkResponse, VerifyRequest, VerifyResponse,
};

use crate::service::UploadService;

/// Loopback adapter over an in-process service.
#[derive(Clone)]
pub struct LocalAdapter {
    service: Arc<UploadService>,
}

impl LocalAdapter {
    pub fn new(service: Arc<UploadService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<UploadService> {
        &self.service
    }
}

impl RequestAdapter for LocalAdapter {
    fn create_file(
        &self,
        req: CreateFileRequest,
    ) -> BoxFuture<'_, Result<CreateFileResponse, AdapterError>> {
        Box::pin(async move { self.service.create_file(req).await.map_err(Into::into) })
    }

    fn verify_hash(
        &self,
        req: VerifyRequest,
    ) -> BoxFuture<'_, Result<VerifyResponse, AdapterError>> {
        Box::pin(async move { self.service.verify_hash(req).await.map_err(Into::into) })
    }

    fn upload_chunk(
        &self,
        req: UploadChunkRequest,
        bytes: Bytes,
    ) -> BoxFuture<'_, Result<UploadChunkResponse, AdapterError>> {
        Box::pin(async move {
            self.service
                .upload_chunk(req, bytes)
                .await
                .map_err(Into::into)
        })
    }

    fn merge_file(&self, req: MergeRequest) -> BoxFuture<'_, Result<MergeResponse, AdapterError>> {
        Box::pin(async move { self.service.merge_file(req).await.map_err(Into::into) })
    }
}

// ---------------------------------------------------------------------------
// End-to-end scenarios: client engine against the real store
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobStore, MemoryBlobStore};
    use crate::meta::MemoryMetadataStore;
    use crate::service::StoreConfig;
    use chunklift_engine::{
        hash_bytes, EventKind, FileInfo, FileSource, MemorySource, MemoryRecordStore, RecordStore,
        TaskEvent, TaskOptions, TaskStatus, UploadManager, UploadTask,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const MIB: u64 = 1024 * 1024;

    fn test_service() -> Arc<UploadService> {
        Arc::new(UploadService::new(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryMetadataStore::new()),
            StoreConfig::default(),
        ))
    }

    fn file_of(data: &[u8], name: &str, mime: &str) -> (FileInfo, Arc<dyn FileSource>) {
        let info = FileInfo {
            name: name.into(),
            size: data.len() as u64,
            mime_type: mime.into(),
            last_modified: 1_700_000_000_000,
        };
        (info, Arc::new(MemorySource::new(data.to_vec())))
    }

    fn quick_opts() -> TaskOptions {
        TaskOptions {
            retry_delay_ms: 1,
            ..TaskOptions::default()
        }
    }

    /// Counts upload_chunk calls passing through to the service, with
    /// optional per-chunk latency.
    struct CountingAdapter {
        inner: LocalAdapter,
        chunk_calls: AtomicUsize,
        chunk_delay_ms: u64,
    }

    impl CountingAdapter {
        fn new(service: Arc<UploadService>) -> Self {
            Self::with_delay(service, 0)
        }

        fn with_delay(service: Arc<UploadService>, chunk_delay_ms: u64) -> Self {
            Self {
                inner: LocalAdapter::new(service),
                chunk_calls: AtomicUsize::new(0),
                chunk_delay_ms,
            }
        }
    }

    impl RequestAdapter for CountingAdapter {
        fn create_file(
            &self,
            req: CreateFileRequest,
        ) -> BoxFuture<'_, Result<CreateFileResponse, AdapterError>> {
            self.inner.create_file(req)
        }

        fn verify_hash(
            &self,
            req: VerifyRequest,
        ) -> BoxFuture<'_, Result<VerifyResponse, AdapterError>> {
            self.inner.verify_hash(req)
        }

        fn upload_chunk(
            &self,
            req: UploadChunkRequest,
            bytes: Bytes,
        ) -> BoxFuture<'_, Result<UploadChunkResponse, AdapterError>> {
            self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.chunk_delay_ms;
            Box::pin(async move {
                if delay > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                self.inner.upload_chunk(req, bytes).await
            })
        }

        fn merge_file(
            &self,
            req: MergeRequest,
        ) -> BoxFuture<'_, Result<MergeResponse, AdapterError>> {
            self.inner.merge_file(req)
        }
    }

    /// Fails every upload of one chunk index with a retryable error.
    struct BrokenChunkAdapter {
        inner: LocalAdapter,
        broken_index: u32,
    }

    impl RequestAdapter for BrokenChunkAdapter {
        fn create_file(
            &self,
            req: CreateFileRequest,
        ) -> BoxFuture<'_, Result<CreateFileResponse, AdapterError>> {
            self.inner.create_file(req)
        }

        fn verify_hash(
            &self,
            req: VerifyRequest,
        ) -> BoxFuture<'_, Result<VerifyResponse, AdapterError>> {
            self.inner.verify_hash(req)
        }

        fn upload_chunk(
            &self,
            req: UploadChunkRequest,
            bytes: Bytes,
        ) -> BoxFuture<'_, Result<UploadChunkResponse, AdapterError>> {
            if req.chunk_index == self.broken_index {
                return Box::pin(async {
                    Err(AdapterError::Network("simulated connection reset".into()))
                });
            }
            self.inner.upload_chunk(req, bytes)
        }

        fn merge_file(
            &self,
            req: MergeRequest,
        ) -> BoxFuture<'_, Result<MergeResponse, AdapterError>> {
            self.inner.merge_file(req)
        }
    }

    /// S2: fresh 2.5 MiB chunked upload ends in success with three
    /// ordered chunk hashes merged, and the bytes read back intact.
    #[tokio::test]
    async fn s2_fresh_chunked_upload() {
        let service = test_service();
        let adapter = Arc::new(LocalAdapter::new(Arc::clone(&service)));
        let store = Arc::new(MemoryRecordStore::new());

        let data: Vec<u8> = (0..(5 * MIB / 2)).map(|i| (i % 251) as u8).collect();
        let (info, source) = file_of(&data, "video.mp4", "video/mp4");
        let task = UploadTask::new(info, source, adapter, store, quick_opts()).unwrap();

        let final_progress = Arc::new(Mutex::new(None));
        let fp = Arc::clone(&final_progress);
        task.on(
            EventKind::Progress,
            Box::new(move |event| {
                if let TaskEvent::Progress(p) = event {
                    *fp.lock().unwrap() = Some(p.clone());
                }
            }),
        );
        let success_url = Arc::new(Mutex::new(None));
        let su = Arc::clone(&success_url);
        task.on(
            EventKind::Success,
            Box::new(move |event| {
                if let TaskEvent::Success { file_url } = event {
                    *su.lock().unwrap() = Some(file_url.clone());
                }
            }),
        );

        task.start().unwrap();
        assert_eq!(task.wait().await, TaskStatus::Success);

        let last = final_progress.lock().unwrap().clone().unwrap();
        assert!((last.percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(last.uploaded_chunks, 3);
        assert_eq!(last.total_chunks, 3);

        // The server assembled exactly the original bytes.
        let url = success_url.lock().unwrap().clone().unwrap();
        let file_id = url.strip_prefix("/files/").unwrap();
        let stream = service.get_file_stream(file_id, None).await.unwrap();
        assert_eq!(stream.read_to_end().unwrap(), data);
    }

    /// S1: the server already holds a completed file with the same
    /// content hash; the task succeeds with zero chunk uploads.
    #[tokio::test]
    async fn s1_instant_upload() {
        let service = test_service();

        // First client uploads the file for real.
        let data = vec![0u8; (3 * MIB) as usize];
        {
            let adapter = Arc::new(LocalAdapter::new(Arc::clone(&service)));
            let store = Arc::new(MemoryRecordStore::new());
            let (info, source) = file_of(&data, "zeroes.bin", "");
            let task = UploadTask::new(info, source, adapter, store, quick_opts()).unwrap();
            task.start().unwrap();
            assert_eq!(task.wait().await, TaskStatus::Success);
        }

        // Second client holds identical bytes: instant upload. Chunk
        // latency keeps the single in-flight request busy while the
        // hash + verify short-circuit lands.
        let adapter = Arc::new(CountingAdapter::with_delay(Arc::clone(&service), 100));
        let store = Arc::new(MemoryRecordStore::new());
        let (info, source) = file_of(&data, "zeroes-copy.bin", "");
        let opts = TaskOptions {
            concurrency: 1,
            ..quick_opts()
        };
        let task = UploadTask::new(info, source, adapter.clone(), store, opts).unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        task.on_any(Box::new(move |event| {
            if let TaskEvent::Success { file_url } = event {
                seen.lock().unwrap().push(file_url.clone());
            }
        }));

        task.start().unwrap();
        assert_eq!(task.wait().await, TaskStatus::Success);
        let urls = statuses.lock().unwrap();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].starts_with("/files/"));
        drop(urls);

        // At most the one in-flight straggler travelled; its result
        // was discarded and dedup made it a no-op server-side.
        assert!(adapter.chunk_calls.load(Ordering::SeqCst) <= 1);
    }

    /// S3: crash after two chunks; a new manager resumes from the
    /// persisted record and only the tail chunk travels.
    #[tokio::test]
    async fn s3_resume_after_crash() {
        let service = test_service();
        let record_store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());

        let data: Vec<u8> = (0..(5 * MIB / 2)).map(|i| (i % 83) as u8).collect();

        // "Crashed" session: drive the protocol directly, as the dead
        // client would have: create, upload chunks 0 and 1, persist
        // the record.
        let created = service
            .create_file(CreateFileRequest {
                file_name: "video.mp4".into(),
                file_size: data.len() as u64,
                file_type: "video/mp4".into(),
                preferred_chunk_size: Some(MIB),
            })
            .await
            .unwrap();
        let token = created.upload_token.clone();
        for index in 0..2u32 {
            let span = &data[(index as usize * MIB as usize)..((index as usize + 1) * MIB as usize)];
            service
                .upload_chunk(
                    UploadChunkRequest {
                        upload_token: token.clone(),
                        chunk_index: index,
                        chunk_hash: hash_bytes(span),
                    },
                    Bytes::copy_from_slice(span),
                )
                .await
                .unwrap();
        }
        record_store
            .save_record(&chunklift_engine::UploadRecord {
                task_id: "crashed-task".into(),
                file_name: "video.mp4".into(),
                file_size: data.len() as u64,
                file_type: "video/mp4".into(),
                last_modified: 1_700_000_000_000,
                file_hash: None,
                uploaded_chunks: vec![0, 1],
                upload_token: Some(token),
                created_at: 1,
                updated_at: 1,
            })
            .unwrap();

        // Restart: the manager lists the record, the user re-selects
        // the file, and only chunk 2 is sent.
        let adapter = Arc::new(CountingAdapter::new(Arc::clone(&service)));
        let manager = UploadManager::new(adapter.clone(), Arc::clone(&record_store));
        manager.init().unwrap();

        let unfinished = manager.unfinished_tasks().unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].task_id, "crashed-task");

        let (info, source) = file_of(&data, "video.mp4", "video/mp4");
        let task = manager
            .resume_task("crashed-task", info, source, Some(quick_opts()))
            .unwrap();
        task.start().unwrap();
        assert_eq!(task.wait().await, TaskStatus::Success);
        assert_eq!(adapter.chunk_calls.load(Ordering::SeqCst), 1);

        // The merged file reads back bit-exact.
        let merged = service
            .metadata_store()
            .find_completed_by_hash(&hash_bytes(&data))
            .unwrap()
            .unwrap();
        let stream = service.get_file_stream(&merged.file_id, None).await.unwrap();
        assert_eq!(stream.read_to_end().unwrap(), data);
    }

    /// S4: resume with a file of the wrong size throws the literal
    /// mismatch message and creates no task.
    #[tokio::test]
    async fn s4_resume_size_mismatch() {
        let service = test_service();
        let record_store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        record_store
            .save_record(&chunklift_engine::UploadRecord {
                task_id: "t-1".into(),
                file_name: "a.bin".into(),
                file_size: 1_000,
                file_type: String::new(),
                last_modified: 0,
                file_hash: None,
                uploaded_chunks: vec![],
                upload_token: None,
                created_at: 1,
                updated_at: 1,
            })
            .unwrap();

        let adapter = Arc::new(LocalAdapter::new(service));
        let manager = UploadManager::new(adapter, record_store);
        manager.init().unwrap();

        let (info, source) = file_of(&vec![0u8; 999], "a.bin", "");
        let err = manager.resume_task("t-1", info, source, None).unwrap_err();
        assert_eq!(err.to_string(), "File size mismatch: expected 1000, got 999");
        assert!(manager.all_tasks().is_empty());
    }

    /// S5: one chunk fails four consecutive times with retryCount=3;
    /// the task errors after one chunkError per attempt and the good
    /// chunks stay recorded.
    #[tokio::test]
    async fn s5_chunk_retry_then_fail() {
        let service = test_service();
        let adapter = Arc::new(BrokenChunkAdapter {
            inner: LocalAdapter::new(service),
            broken_index: 2,
        });
        let record_store = Arc::new(MemoryRecordStore::new());

        let data: Vec<u8> = (0..(5 * MIB / 2)).map(|i| (i % 59) as u8).collect();
        let (info, source) = file_of(&data, "flaky.bin", "");
        let task = UploadTask::new(
            info,
            source,
            adapter,
            Arc::clone(&record_store) as Arc<dyn RecordStore>,
            quick_opts(),
        )
        .unwrap();

        let chunk_errors = Arc::new(AtomicUsize::new(0));
        let ce = Arc::clone(&chunk_errors);
        task.on(
            EventKind::ChunkError,
            Box::new(move |_| {
                ce.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let errors = Arc::new(AtomicUsize::new(0));
        let er = Arc::clone(&errors);
        task.on(
            EventKind::Error,
            Box::new(move |_| {
                er.fetch_add(1, Ordering::SeqCst);
            }),
        );

        task.start().unwrap();
        assert_eq!(task.wait().await, TaskStatus::Error);
        assert_eq!(chunk_errors.load(Ordering::SeqCst), 4);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let record = record_store.get_record(task.id()).unwrap().unwrap();
        assert_eq!(record.uploaded_chunks, vec![0, 1]);
    }

    /// S6 twin of the service-level test, driven through the whole
    /// stack: upload via the engine, then ranged read.
    #[tokio::test]
    async fn s6_ranged_read_through_engine() {
        let service = test_service();
        let adapter = Arc::new(LocalAdapter::new(Arc::clone(&service)));
        let record_store = Arc::new(MemoryRecordStore::new());

        let data: Vec<u8> = (0..(3 * MIB)).map(|i| (i % 211) as u8).collect();
        let (info, source) = file_of(&data, "ranged.bin", "application/octet-stream");
        let task = UploadTask::new(info, source, adapter, record_store, quick_opts()).unwrap();
        task.start().unwrap();
        assert_eq!(task.wait().await, TaskStatus::Success);

        let merged = service
            .metadata_store()
            .find_completed_by_hash(&hash_bytes(&data))
            .unwrap()
            .unwrap();
        let stream = service
            .get_file_stream(&merged.file_id, Some("bytes=1048570-1048580"))
            .await
            .unwrap();
        assert_eq!(stream.status_code, 206);
        assert_eq!(
            stream.content_range.as_deref(),
            Some("bytes 1048570-1048580/3145728")
        );
        let body = stream.read_to_end().unwrap();
        assert_eq!(body, &data[1_048_570..=1_048_580]);
        assert_eq!(stream_mime(&service, &merged.file_id).await, "application/octet-stream");
    }

    async fn stream_mime(service: &Arc<UploadService>, file_id: &str) -> String {
        service
            .get_file_stream(file_id, None)
            .await
            .unwrap()
            .mime_type
    }

    /// Content-address invariant across the whole stack: every blob
    /// the engine put on the server hashes back to its key.
    #[tokio::test]
    async fn blob_store_content_addresses_verify() {
        let blob = Arc::new(MemoryBlobStore::new());
        let service = Arc::new(UploadService::new(
            Arc::clone(&blob) as Arc<dyn BlobStore>,
            Arc::new(MemoryMetadataStore::new()),
            StoreConfig::default(),
        ));
        let adapter = Arc::new(LocalAdapter::new(Arc::clone(&service)));
        let record_store = Arc::new(MemoryRecordStore::new());

        let data: Vec<u8> = (0..(2 * MIB + 123)).map(|i| (i % 149) as u8).collect();
        let (info, source) = file_of(&data, "inv.bin", "");
        let task = UploadTask::new(info, source, adapter, record_store, quick_opts()).unwrap();
        task.start().unwrap();
        assert_eq!(task.wait().await, TaskStatus::Success);

        let merged = service
            .metadata_store()
            .find_completed_by_hash(&hash_bytes(&data))
            .unwrap()
            .unwrap();
        for slot in &merged.chunks {
            let hash = slot.clone().unwrap();
            let bytes = blob.read(&hash, None).unwrap();
            assert_eq!(hash_bytes(&bytes), hash);
        }
    }
}
