use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of an edit job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// Queued or processing: the states that block a duplicate submission.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Processing)
    }
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobSource {
    Api,
    CsvRow,
}

/// Reference to the source image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ImageRef {
    Url(String),
    /// Uploaded bytes persisted under the queue directory.
    Upload(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobInput {
    pub image: ImageRef,
    pub prompt: String,
    /// Output sub-directory relative to the output root. `None` means the root.
    pub directory: Option<String>,
}

/// Per-job inference options, defaulted from process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOptions {
    pub resize_long_edge: u32,
    pub use_4bit: bool,
    pub num_inference_steps: u32,
}

pub const DEFAULT_INFERENCE_STEPS: u32 = 8;

/// Classification recorded on a failed job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientInference,
    PermanentInference,
    Internal,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A job as submitted, before the store assigns identity and ordering.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Pre-assigned id, used when upload bytes were persisted under it.
    pub id: Option<Uuid>,
    pub source: JobSource,
    pub input: JobInput,
    pub options: JobOptions,
    pub natural_key: String,
}

/// An image edit job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditJob {
    pub id: Uuid,
    /// Logical arrival counter, the FIFO sort key.
    pub seq: u64,
    pub source: JobSource,
    pub input: JobInput,
    pub options: JobOptions,
    pub natural_key: String,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Artifact path relative to the output root, set on success.
    pub artifact: Option<String>,
    pub error: Option<JobError>,
}
