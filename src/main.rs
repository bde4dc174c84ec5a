use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use image_edit_queue::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        editor::{HttpImageEditor, ImageEditor, InferenceHandle, PassthroughEditor},
        inbox::InboxWatcher,
        publisher::ArtifactPublisher,
        source::SourceLoader,
        worker_pool::{WorkerPool, WorkerPoolConfig},
    },
    store::JobStore,
};

const WARM_UP_RETRY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        max_concurrency = config.max_concurrency,
        output_dir = %config.output_dir.display(),
        queue_dir = %config.queue_dir.display(),
        "Initializing image-edit-queue server"
    );

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    std::fs::create_dir_all(&config.output_dir).expect("Failed to create output directory");

    // Open the job store and recover interrupted jobs
    tracing::info!("Opening job store");
    let (store, recovery) = JobStore::open(&config.queue_dir).expect("Failed to open job store");
    tracing::info!(
        replayed = recovery.replayed,
        requeued = recovery.requeued.len(),
        skipped_lines = recovery.skipped_lines,
        "Job store recovered"
    );
    let store = Arc::new(store);

    // Initialize the editor
    let editor: Arc<dyn ImageEditor> = if config.inference_url.is_empty() {
        tracing::warn!("INFERENCE_URL not set, using passthrough editor");
        Arc::new(PassthroughEditor)
    } else {
        tracing::info!(url = %config.inference_url, model_id = %config.model_id, "Using HTTP inference backend");
        Arc::new(
            HttpImageEditor::new(&config.inference_url, &config.model_id)
                .expect("Failed to initialize inference client"),
        )
    };
    let inference = Arc::new(InferenceHandle::new(editor));
    {
        let inference = Arc::clone(&inference);
        tokio::spawn(async move { inference.initialize(WARM_UP_RETRY).await });
    }

    let publisher = Arc::new(ArtifactPublisher::new(&config.output_dir, &config.base_url));
    let loader = Arc::new(
        SourceLoader::new(config.fetch_timeout()).expect("Failed to initialize source loader"),
    );

    // Start the worker pool
    let pool = WorkerPool::new(
        Arc::clone(&store),
        Arc::clone(&inference),
        loader,
        Arc::clone(&publisher),
        WorkerPoolConfig {
            max_concurrency: config.max_concurrency,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        },
    )
    .start();

    // Start the inbox watcher
    let inbox = Arc::new(InboxWatcher::new(
        config.inbox_path(),
        &config.queue_dir,
        Arc::clone(&store),
        config.job_options(None, None),
    ));
    inbox.ensure_ledger().await.expect("Failed to create CSV inbox");
    let (watcher_stop, watcher_rx) = tokio::sync::watch::channel(false);
    let watcher = tokio::spawn(Arc::clone(&inbox).run(config.inbox_poll_interval(), watcher_rx));

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, store, inbox, publisher, inference);

    let app = routes::router(state).route(
        "/metrics",
        get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Stopping inbox watcher");
    watcher_stop.send_replace(true);
    if let Err(e) = watcher.await {
        tracing::error!(error = %e, "Inbox watcher ended abnormally");
    }

    tracing::info!("Stopping worker pool");
    pool.stop().await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for CTRL+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received CTRL+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
