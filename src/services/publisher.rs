use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::models::job::{EditJob, JobSource, JobState};

/// Path segment under which the proxy serves the output root.
pub const FILES_SEGMENT: &str = "files";

/// Metadata written next to each artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMetadata {
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub source: JobSource,
    pub prompt: String,
}

/// Places artifacts under the output root and composes their public URLs.
pub struct ArtifactPublisher {
    output_root: PathBuf,
    base_url: String,
}

impl ArtifactPublisher {
    pub fn new(output_root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            output_root: output_root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `<directory>/<id>.png`, or `<id>.png` for the output root.
    pub fn relative_path(directory: Option<&str>, id: Uuid) -> String {
        match directory.filter(|d| !d.is_empty()) {
            Some(directory) => format!("{}/{id}.png", directory.trim_matches('/')),
            None => format!("{id}.png"),
        }
    }

    pub fn url(&self, relative: &str) -> String {
        format!("{}/{FILES_SEGMENT}/{relative}", self.base_url)
    }

    /// URL of a finished job's artifact, if it has one.
    pub fn artifact_url(&self, job: &EditJob) -> Option<String> {
        match (&job.state, &job.artifact) {
            (JobState::Done, Some(relative)) => Some(self.url(relative)),
            _ => None,
        }
    }

    /// Write the artifact and its metadata sidecar, returning the absolute path.
    pub async fn write(
        &self,
        relative: &str,
        png: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<PathBuf, PublishError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let sidecar = path.with_extension("json");
        let meta = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&sidecar, &meta).await?;
        write_atomic(&path, png).await?;

        tracing::debug!(path = %path.display(), "Artifact written");
        Ok(path)
    }

    /// Join `relative` onto the output root, refusing anything that could
    /// leave it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, PublishError> {
        let rel = Path::new(relative);
        let escapes = rel.as_os_str().is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(PublishError::OutsideRoot(relative.to_string()));
        }
        Ok(self.output_root.join(rel))
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Artifact path escapes the output root: {0}")]
    OutsideRoot(String),

    #[error("Failed to write artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode artifact metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}
