use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::models::job::{ErrorKind, JobOptions};

/// The opaque image editing capability.
///
/// Implementations are not assumed to be reentrant: the worker pool never
/// calls `edit` from more tasks than it has permits.
#[async_trait]
pub trait ImageEditor: Send + Sync {
    /// One-time initialization (model load, sidecar readiness).
    async fn warm_up(&self) -> Result<(), InferenceError>;

    /// Edit a PNG-encoded image according to `prompt`, returning image bytes.
    async fn edit(
        &self,
        image_png: &[u8],
        prompt: &str,
        options: &JobOptions,
    ) -> Result<Vec<u8>, InferenceError>;
}

/// Client for an image-edit inference sidecar speaking JSON over HTTP.
pub struct HttpImageEditor {
    http: Client,
    base_url: String,
    model_id: String,
}

#[derive(Serialize)]
struct EditRequest<'a> {
    model_id: &'a str,
    image: String,
    prompt: &'a str,
    num_inference_steps: u32,
    use_4bit: bool,
}

#[derive(Deserialize)]
struct EditResponse {
    image: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

impl HttpImageEditor {
    pub fn new(base_url: &str, model_id: &str) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(InferenceError::from_reqwest)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_id: model_id.to_string(),
        })
    }
}

#[async_trait]
impl ImageEditor for HttpImageEditor {
    async fn warm_up(&self) -> Result<(), InferenceError> {
        let url = format!("{}/healthz", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(InferenceError::from_reqwest)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(InferenceError::Transient(format!(
                "inference backend not ready: {}",
                response.status()
            )))
        }
    }

    async fn edit(
        &self,
        image_png: &[u8],
        prompt: &str,
        options: &JobOptions,
    ) -> Result<Vec<u8>, InferenceError> {
        let url = format!("{}/edit", self.base_url);
        let body = EditRequest {
            model_id: &self.model_id,
            image: base64::engine::general_purpose::STANDARD.encode(image_png),
            prompt,
            num_inference_steps: options.num_inference_steps,
            use_4bit: options.use_4bit,
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(InferenceError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_default();
            return Err(InferenceError::from_status(status, &message));
        }

        let edited: EditResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Transient(format!("unreadable backend response: {e}")))?;

        base64::engine::general_purpose::STANDARD
            .decode(edited.image)
            .map_err(|e| InferenceError::Permanent(format!("backend returned invalid base64: {e}")))
    }
}

/// Editor used when no inference backend is configured: returns the prepared
/// input unchanged so the queue can run end to end.
pub struct PassthroughEditor;

#[async_trait]
impl ImageEditor for PassthroughEditor {
    async fn warm_up(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn edit(
        &self,
        image_png: &[u8],
        _prompt: &str,
        _options: &JobOptions,
    ) -> Result<Vec<u8>, InferenceError> {
        Ok(image_png.to_vec())
    }
}

/// Owned handle to the single editor instance plus its readiness flag.
pub struct InferenceHandle {
    editor: Arc<dyn ImageEditor>,
    ready: watch::Sender<bool>,
}

impl InferenceHandle {
    pub fn new(editor: Arc<dyn ImageEditor>) -> Self {
        let (ready, _) = watch::channel(false);
        Self { editor, ready }
    }

    /// Run warm-up until it succeeds, then mark the editor ready.
    pub async fn initialize(&self, retry_every: Duration) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.editor.warm_up().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Editor warm-up failed, retrying");
                    tokio::time::sleep(retry_every).await;
                }
            }
        }
        self.ready.send_replace(true);
        tracing::info!(attempts = attempt, "Editor ready");
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn editor(&self) -> &dyn ImageEditor {
        self.editor.as_ref()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("transient inference failure: {0}")]
    Transient(String),

    #[error("inference rejected input: {0}")]
    Permanent(String),
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::Transient(_) => ErrorKind::TransientInference,
            InferenceError::Permanent(_) => ErrorKind::PermanentInference,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_builder() {
            InferenceError::Permanent(e.to_string())
        } else {
            InferenceError::Transient(e.to_string())
        }
    }

    /// 5xx, 429 and out-of-memory reports are worth retrying; other client
    /// errors mean the backend rejected the input.
    pub fn from_status(status: StatusCode, message: &str) -> Self {
        let detail = if message.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {message}")
        };
        let oom = message.to_ascii_lowercase().contains("out of memory");
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || oom {
            InferenceError::Transient(detail)
        } else {
            InferenceError::Permanent(detail)
        }
    }
}
