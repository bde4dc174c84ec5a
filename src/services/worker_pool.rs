use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::models::job::{EditJob, ErrorKind, ImageRef, JobError};
use crate::services::editor::{InferenceError, InferenceHandle};
use crate::services::publisher::{ArtifactMetadata, ArtifactPublisher, PublishError};
use crate::services::source::{self, SourceError, SourceLoader};
use crate::store::JobStore;

const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of permits, i.e. concurrent inference slots.
    pub max_concurrency: usize,
    /// Retries after a transient failure.
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
}

/// Dispatches queued jobs onto a fixed number of inference slots.
pub struct WorkerPool {
    store: Arc<JobStore>,
    inference: Arc<InferenceHandle>,
    loader: Arc<SourceLoader>,
    publisher: Arc<ArtifactPublisher>,
    config: WorkerPoolConfig,
}

/// Running pool. Dropping it without `stop` leaves the dispatcher running.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl WorkerPoolHandle {
    /// Stop claiming jobs and wait for in-flight slots to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "Worker pool dispatcher ended abnormally");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SlotError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl SlotError {
    fn kind(&self) -> ErrorKind {
        match self {
            SlotError::Source(e) => e.kind(),
            SlotError::Inference(e) => e.kind(),
            SlotError::Publish(_) => ErrorKind::Internal,
        }
    }
}

impl WorkerPool {
    pub fn new(
        store: Arc<JobStore>,
        inference: Arc<InferenceHandle>,
        loader: Arc<SourceLoader>,
        publisher: Arc<ArtifactPublisher>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            store,
            inference,
            loader,
            publisher,
            config,
        }
    }

    /// Spawn the dispatcher. Jobs are not claimed until the editor is ready.
    pub fn start(self) -> WorkerPoolHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(self);
        let dispatcher = tokio::spawn(pool.dispatch(shutdown_rx));
        WorkerPoolHandle {
            shutdown,
            dispatcher,
        }
    }

    async fn dispatch(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let slots = self.config.max_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(slots));
        tracing::info!(slots, "Worker pool started");

        tokio::select! {
            _ = self.inference.wait_ready() => {}
            _ = shutdown.changed() => {
                tracing::info!("Worker pool stopped before the editor became ready");
                return;
            }
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let Some(job) = self.next_job(&mut shutdown).await else {
                break;
            };

            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                pool.run_slot(job).await;
                drop(permit);
            });
        }

        tracing::info!("Worker pool draining in-flight jobs");
        let _ = permits.acquire_many(slots as u32).await;
        tracing::info!("Worker pool stopped");
    }

    /// Claim the next job, suspending while the queue is empty.
    async fn next_job(&self, shutdown: &mut watch::Receiver<bool>) -> Option<EditJob> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.store.claim_next() {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {
                    tokio::select! {
                        _ = self.store.wait_for_work() => {}
                        _ = shutdown.changed() => return None,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job, will retry");
                    tokio::select! {
                        _ = sleep(STORE_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => return None,
                    }
                }
            }
        }
    }

    /// Run one job in its own task so a panic fails the job instead of the pool.
    async fn run_slot(self: Arc<Self>, job: EditJob) {
        let id = job.id;
        let upload = match &job.input.image {
            ImageRef::Upload(path) => Some(path.clone()),
            ImageRef::Url(_) => None,
        };
        let pool = Arc::clone(&self);
        let outcome = tokio::spawn(async move { pool.process(job).await }).await;

        if let Err(e) = outcome {
            tracing::error!(job_id = %id, error = %e, "Slot task aborted");
            let error = JobError::new(ErrorKind::Internal, format!("slot task aborted: {e}"));
            if let Err(e) = self.store.fail(id, error) {
                tracing::error!(job_id = %id, error = %e, "Failed to record aborted job");
            }
            metrics::counter!("edit_jobs_failed", "kind" => ErrorKind::Internal.to_string())
                .increment(1);
        }

        // Terminal on both paths.
        if let Some(path) = upload {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(job_id = %id, error = %e, "Upload already removed");
            }
        }
    }

    async fn process(&self, job: EditJob) {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            tracing::info!(job_id = %job.id, attempt, prompt = %job.input.prompt, "Processing edit job");

            match self.attempt(&job).await {
                Ok(artifact) => {
                    if let Err(e) = self.store.complete(job.id, artifact) {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to record completion");
                    }
                    metrics::counter!("edit_jobs_completed").increment(1);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::TransientInference
                    && attempt <= self.config.max_retries =>
                {
                    tracing::warn!(job_id = %job.id, attempt, error = %e, "Transient failure, retrying");
                    metrics::counter!("edit_job_retries_total").increment(1);
                    if let Err(e) = self.store.record_attempt(job.id) {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to record attempt");
                    }
                    sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => {
                    let kind = e.kind();
                    let message = if kind == ErrorKind::TransientInference {
                        format!("failed after {attempt} attempts: {e}")
                    } else {
                        e.to_string()
                    };
                    if let Err(e) = self.store.fail(job.id, JobError::new(kind, message)) {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to record failure");
                    }
                    metrics::counter!("edit_jobs_failed", "kind" => kind.to_string()).increment(1);
                    break;
                }
            }
        }

        metrics::histogram!("edit_processing_seconds").record(started.elapsed().as_secs_f64());
    }

    /// One end-to-end attempt: load, prepare, edit, publish.
    async fn attempt(&self, job: &EditJob) -> Result<String, SlotError> {
        let raw = self.loader.load(&job.input.image).await?;
        let prepared = source::prepare(raw, job.options.resize_long_edge).await?;

        let inference_start = Instant::now();
        let edited = self
            .inference
            .editor()
            .edit(&prepared, &job.input.prompt, &job.options)
            .await?;
        tracing::info!(
            job_id = %job.id,
            inference_ms = inference_start.elapsed().as_millis() as u64,
            "Inference complete"
        );

        let png = source::normalize_png(edited).await?;
        let relative = ArtifactPublisher::relative_path(job.input.directory.as_deref(), job.id);
        let metadata = ArtifactMetadata {
            job_id: job.id,
            created_at: chrono::Utc::now(),
            source: job.source,
            prompt: job.input.prompt.clone(),
        };
        self.publisher.write(&relative, &png, &metadata).await?;
        Ok(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobInput, JobOptions, JobSource, JobState, NewJob};
    use crate::services::editor::ImageEditor;
    use crate::store::natural_key;
    use async_trait::async_trait;
    use image::{ImageBuffer, ImageFormat, Rgba};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn png() -> Vec<u8> {
        let image = ImageBuffer::from_pixel(16, 16, Rgba([200u8, 100, 50, 255]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    /// Fails with the scripted error every time, counting calls.
    struct FailingEditor {
        calls: AtomicU32,
        transient: bool,
    }

    #[async_trait]
    impl ImageEditor for FailingEditor {
        async fn warm_up(&self) -> Result<(), InferenceError> {
            Ok(())
        }

        async fn edit(
            &self,
            _image_png: &[u8],
            _prompt: &str,
            _options: &JobOptions,
        ) -> Result<Vec<u8>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.transient {
                Err(InferenceError::Transient("CUDA out of memory".to_string()))
            } else {
                Err(InferenceError::Permanent("unsupported prompt".to_string()))
            }
        }
    }

    /// Fails transiently once, then succeeds.
    struct RecoveringEditor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ImageEditor for RecoveringEditor {
        async fn warm_up(&self) -> Result<(), InferenceError> {
            Ok(())
        }

        async fn edit(
            &self,
            image_png: &[u8],
            _prompt: &str,
            _options: &JobOptions,
        ) -> Result<Vec<u8>, InferenceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(InferenceError::Transient("backend restarting".to_string()));
            }
            Ok(image_png.to_vec())
        }
    }

    struct PanickingEditor;

    #[async_trait]
    impl ImageEditor for PanickingEditor {
        async fn warm_up(&self) -> Result<(), InferenceError> {
            Ok(())
        }

        async fn edit(
            &self,
            _image_png: &[u8],
            _prompt: &str,
            _options: &JobOptions,
        ) -> Result<Vec<u8>, InferenceError> {
            panic!("pipeline exploded");
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<JobStore>,
        handle: WorkerPoolHandle,
    }

    async fn harness(editor: Arc<dyn ImageEditor>, max_retries: u32) -> (Harness, EditJob) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(&dir.path().join("queue")).unwrap().0);

        let upload = store.uploads_dir().join("source.png");
        std::fs::write(&upload, png()).unwrap();
        let job = store
            .enqueue(NewJob {
                id: None,
                source: JobSource::Api,
                natural_key: natural_key(JobSource::Api, b"source", "edit", None),
                input: JobInput {
                    image: ImageRef::Upload(upload),
                    prompt: "edit".to_string(),
                    directory: Some("outA".to_string()),
                },
                options: JobOptions {
                    resize_long_edge: 1024,
                    use_4bit: false,
                    num_inference_steps: 8,
                },
            })
            .unwrap();

        let inference = Arc::new(InferenceHandle::new(editor));
        inference.initialize(Duration::from_millis(1)).await;
        let pool = WorkerPool::new(
            Arc::clone(&store),
            inference,
            Arc::new(SourceLoader::new(Duration::from_secs(1)).unwrap()),
            Arc::new(ArtifactPublisher::new(dir.path().join("out"), "http://localhost")),
            WorkerPoolConfig {
                max_concurrency: 1,
                max_retries,
                retry_backoff: Duration::from_millis(1),
            },
        );
        let handle = pool.start();
        (
            Harness {
                _dir: dir,
                store,
                handle,
            },
            job,
        )
    }

    async fn wait_terminal(store: &JobStore, id: uuid::Uuid) -> EditJob {
        for _ in 0..500 {
            let job = store.status(id).unwrap();
            if job.state.is_terminal() {
                return job;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_transient_failures_retry_up_to_bound() {
        let editor = Arc::new(FailingEditor {
            calls: AtomicU32::new(0),
            transient: true,
        });
        let (h, job) = harness(editor.clone(), 2).await;

        let job = wait_terminal(&h.store, job.id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(editor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.attempts, 3);
        let error = job.error.unwrap();
        assert_eq!(error.kind, ErrorKind::TransientInference);
        assert!(error.message.contains("out of memory"));
        h.handle.stop().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let editor = Arc::new(FailingEditor {
            calls: AtomicU32::new(0),
            transient: false,
        });
        let (h, job) = harness(editor.clone(), 2).await;

        let job = wait_terminal(&h.store, job.id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(editor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(job.error.unwrap().kind, ErrorKind::PermanentInference);
        h.handle.stop().await;
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let editor = Arc::new(RecoveringEditor {
            calls: AtomicU32::new(0),
        });
        let (h, job) = harness(editor, 2).await;

        let job = wait_terminal(&h.store, job.id).await;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.artifact, Some(format!("outA/{}.png", job.id)));
        h.handle.stop().await;
    }

    #[tokio::test]
    async fn test_panic_in_slot_fails_job_and_pool_survives() {
        let (h, job) = harness(Arc::new(PanickingEditor), 2).await;

        let failed = wait_terminal(&h.store, job.id).await;
        assert_eq!(failed.error.unwrap().kind, ErrorKind::Internal);

        // The aborted slot still removes its persisted upload.
        let ImageRef::Upload(upload) = &job.input.image else {
            panic!("harness enqueues an upload");
        };
        for _ in 0..100 {
            if !upload.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!upload.exists());

        // The dispatcher keeps claiming after a slot panicked.
        let next = h
            .store
            .enqueue(NewJob {
                id: None,
                source: JobSource::Api,
                natural_key: "another".to_string(),
                input: job.input.clone(),
                options: job.options.clone(),
            })
            .unwrap();
        let next = wait_terminal(&h.store, next.id).await;
        assert_eq!(next.state, JobState::Failed);
        h.handle.stop().await;
    }
}
