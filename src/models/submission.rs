use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{EditJob, ErrorKind, JobError, JobSource, JobState};

const MAX_DIRECTORY_LEN: usize = 64;

/// Text fields of a submission, gathered from the multipart form.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct EditRequest {
    #[garde(length(min = 1, max = 2000))]
    pub prompt: String,

    #[garde(custom(validate_optional_url))]
    pub image_url: Option<String>,

    #[garde(custom(validate_optional_directory))]
    pub directory: Option<String>,

    #[garde(range(min = 64, max = 4096))]
    pub resize_long_edge: Option<u32>,

    #[garde(skip)]
    pub use_4bit: Option<bool>,
}

/// One row of the CSV ledger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
pub struct InboxRow {
    #[garde(custom(validate_url))]
    pub image_url: String,

    #[garde(length(min = 1, max = 2000))]
    pub prompt: String,

    #[garde(custom(validate_directory_field))]
    pub directory: String,
}

/// Accept only absolute http(s) URLs with a host part.
pub fn check_url(url: &str) -> Result<(), String> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| format!("unsupported image url scheme: {url}"))?;
    if rest.is_empty() || rest.starts_with('/') || url.chars().any(char::is_whitespace) {
        return Err(format!("malformed image url: {url}"));
    }
    Ok(())
}

/// Output sub-directories must stay beneath the output root.
///
/// Segments are separated by `/` and may only contain ASCII alphanumerics,
/// `.`, `_` and `-`. Empty, `.` and `..` segments are rejected.
pub fn check_directory(directory: &str) -> Result<(), String> {
    if directory.len() > MAX_DIRECTORY_LEN {
        return Err(format!("directory longer than {MAX_DIRECTORY_LEN} characters"));
    }
    for segment in directory.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(format!("invalid directory: {directory:?}"));
        }
        let allowed = segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !allowed {
            return Err(format!("invalid directory: {directory:?}"));
        }
    }
    Ok(())
}

#[allow(clippy::ptr_arg)]
fn validate_url(value: &String, _ctx: &()) -> garde::Result {
    check_url(value).map_err(garde::Error::new)
}

fn validate_optional_url(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(url) => validate_url(url, &()),
        None => Ok(()),
    }
}

#[allow(clippy::ptr_arg)]
fn validate_directory_field(value: &String, _ctx: &()) -> garde::Result {
    if value.is_empty() {
        return Ok(());
    }
    check_directory(value).map_err(garde::Error::new)
}

fn validate_optional_directory(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(directory) => validate_directory_field(directory, &()),
        None => Ok(()),
    }
}

/// Public view of a job returned by the submission and status endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub state: JobState,
    pub source: JobSource,
    pub prompt: String,
    pub directory: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub status_url: String,
}

impl JobView {
    pub fn new(job: &EditJob, artifact_url: Option<String>, status_url: String) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            source: job.source,
            prompt: job.input.prompt.clone(),
            directory: job.input.directory.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            artifact_url,
            error: job.error.clone(),
            status_url,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
