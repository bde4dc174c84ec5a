//! Test helper utilities: an in-process app, an image origin server and
//! request builders.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::routing::get as route_get;
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use image_edit_queue::app_state::AppState;
use image_edit_queue::config::AppConfig;
use image_edit_queue::models::job::{EditJob, JobState};
use image_edit_queue::routes;
use image_edit_queue::services::editor::{ImageEditor, InferenceHandle};
use image_edit_queue::services::inbox::InboxWatcher;
use image_edit_queue::services::publisher::ArtifactPublisher;
use image_edit_queue::services::source::SourceLoader;
use image_edit_queue::services::worker_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
use image_edit_queue::store::JobStore;

use crate::fixtures;

pub const BASE_URL: &str = "https://edit.example.com";
pub const SECRET: &str = "letmein";

pub struct TestOptions {
    pub max_concurrency: usize,
    pub submit_wait_secs: u64,
    pub max_retries: u32,
    pub ready: bool,
    pub editor: Arc<dyn ImageEditor>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            submit_wait_secs: 10,
            max_retries: 2,
            ready: true,
            editor: Arc::new(fixtures::RecordingEditor::new(Duration::ZERO)),
        }
    }
}

/// A fully wired orchestrator running inside the test's runtime.
pub struct TestApp {
    pub dir: TempDir,
    pub config: AppConfig,
    pub state: AppState,
    pool: WorkerPoolHandle,
}

impl TestApp {
    pub async fn spawn(options: TestOptions) -> Self {
        Self::spawn_in(tempfile::tempdir().unwrap(), options).await
    }

    /// Start on an existing directory, as a restarted process would.
    pub async fn spawn_in(dir: TempDir, options: TestOptions) -> Self {
        let config = AppConfig {
            output_dir: dir.path().join("outputs"),
            queue_dir: dir.path().join("queue"),
            base_url: BASE_URL.to_string(),
            csv_secret: SECRET.to_string(),
            max_concurrency: options.max_concurrency,
            submit_wait_secs: options.submit_wait_secs,
            max_retries: options.max_retries,
            retry_backoff_ms: 1,
            fetch_timeout_secs: 5,
            ..AppConfig::default()
        };

        let (store, _report) = JobStore::open(&config.queue_dir).unwrap();
        let store = Arc::new(store);
        let inference = Arc::new(InferenceHandle::new(options.editor));
        if options.ready {
            inference.initialize(Duration::from_millis(1)).await;
        }
        let publisher = Arc::new(ArtifactPublisher::new(&config.output_dir, &config.base_url));
        let inbox = Arc::new(InboxWatcher::new(
            config.inbox_path(),
            &config.queue_dir,
            Arc::clone(&store),
            config.job_options(None, None),
        ));
        inbox.ensure_ledger().await.unwrap();

        let pool = WorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&inference),
            Arc::new(SourceLoader::new(config.fetch_timeout()).unwrap()),
            Arc::clone(&publisher),
            WorkerPoolConfig {
                max_concurrency: config.max_concurrency,
                max_retries: config.max_retries,
                retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            },
        )
        .start();

        let state = AppState::new(config.clone(), store, inbox, publisher, inference);
        Self {
            dir,
            config,
            state,
            pool,
        }
    }

    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    pub async fn stop(self) -> TempDir {
        self.pool.stop().await;
        self.dir
    }

    /// Poll the store until the job is terminal.
    pub async fn wait_terminal(&self, id: Uuid) -> EditJob {
        for _ in 0..500 {
            let job = self.state.store.status(id).unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    pub fn artifact_path(&self, job: &EditJob) -> std::path::PathBuf {
        assert_eq!(job.state, JobState::Done);
        self.config
            .output_dir
            .join(job.artifact.as_deref().expect("artifact path"))
    }
}

/// Serve fixture images on an ephemeral port, returning its base URL.
///
/// - `/img.png`: a valid PNG
/// - `/broken.png`: 200 with bytes that are not an image
/// - `/missing.png`: 404
pub async fn spawn_image_origin() -> String {
    let png = fixtures::sample_png(64, 48);
    let app = Router::new()
        .route(
            "/img.png",
            route_get(move || {
                let png = png.clone();
                async move { ([(header::CONTENT_TYPE, "image/png")], png) }
            }),
        )
        .route("/broken.png", route_get(|| async { "this is not a png" }))
        .route("/missing.png", route_get(|| async { StatusCode::NOT_FOUND }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub async fn get(app: Router, uri: &str) -> Response {
    app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn delete(app: Router, uri: &str) -> Response {
    app.oneshot(Request::delete(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_text(app: Router, uri: &str, body: &str) -> Response {
    app.oneshot(
        Request::post(uri)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

/// POST a multipart form with text fields and an optional `image_file`.
pub async fn post_form(
    app: Router,
    uri: &str,
    fields: &[(&str, &str)],
    file: Option<&[u8]>,
) -> Response {
    let boundary = "edit-queue-test-boundary";
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
    }
    if let Some(bytes) = file {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"image_file\"; filename=\"in.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    app.oneshot(
        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
