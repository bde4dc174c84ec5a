use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::parse_flag;
use crate::error::{AppError, AppResult};
use crate::models::job::{EditJob, ErrorKind, ImageRef, JobInput, JobSource, JobState, NewJob};
use crate::models::submission::{EditRequest, JobView};
use crate::store::{natural_key, StoreError};

const DEFAULT_API_DIRECTORY: &str = "manual";

/// POST /api/edit: submit an edit and wait (bounded) for its outcome.
///
/// Responds 200 when the job finished, a 4xx/5xx carrying the job when it
/// failed, and 202 with a `status_url` when the wait ran out first.
pub async fn submit_edit(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<JobView>)> {
    let mut request = EditRequest::default();
    let mut upload: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image_file" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                if !data.is_empty() {
                    upload = Some(data.to_vec());
                }
            }
            _ => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                apply_text_field(&mut request, &name, text)?;
            }
        }
    }

    request.validate()?;

    let directory = request
        .directory
        .clone()
        .unwrap_or_else(|| DEFAULT_API_DIRECTORY.to_string());
    let directory = Some(directory).filter(|d| !d.is_empty());
    let options = state
        .config
        .job_options(request.resize_long_edge, request.use_4bit);

    let (new_job, upload_path) = match (request.image_url, upload) {
        (Some(url), _) => {
            let key = natural_key(JobSource::Api, url.as_bytes(), &request.prompt, directory.as_deref());
            let job = NewJob {
                id: None,
                source: JobSource::Api,
                input: JobInput {
                    image: ImageRef::Url(url),
                    prompt: request.prompt,
                    directory,
                },
                options,
                natural_key: key,
            };
            (job, None)
        }
        (None, Some(bytes)) => {
            image::guess_format(&bytes)
                .map_err(|_| AppError::UnsupportedMedia("image_file is not a supported image".to_string()))?;

            let key = natural_key(JobSource::Api, &bytes, &request.prompt, directory.as_deref());
            let id = Uuid::new_v4();
            let path = state.store.uploads_dir().join(id.to_string());
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| AppError::Internal(format!("failed to persist upload: {e}")))?;

            let job = NewJob {
                id: Some(id),
                source: JobSource::Api,
                input: JobInput {
                    image: ImageRef::Upload(path.clone()),
                    prompt: request.prompt,
                    directory,
                },
                options,
                natural_key: key,
            };
            (job, Some(path))
        }
        (None, None) => {
            return Err(AppError::Validation(
                "Either image_url or image_file is required".to_string(),
            ))
        }
    };

    // Subscribe before enqueueing so the terminal update cannot be missed.
    let updates = state.store.subscribe();
    let job = match state.store.enqueue(new_job) {
        Ok(job) => job,
        Err(e) => {
            if let Some(path) = upload_path {
                let _ = tokio::fs::remove_file(path).await;
            }
            return Err(e.into());
        }
    };
    metrics::counter!("edit_jobs_total", "source" => JobSource::Api.to_string()).increment(1);

    let job = await_terminal(&state, updates, job.id, state.config.submit_wait()).await?;
    let status = response_status(&job);
    Ok((status, Json(view(&state, &job))))
}

/// GET /api/jobs/{job_id}
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobView>> {
    let job = state.store.status(job_id)?;
    Ok(Json(view(&state, &job)))
}

/// DELETE /api/jobs/{job_id}: cancel a job that has not been claimed yet.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobView>> {
    let job = state.store.cancel(job_id)?;
    if let ImageRef::Upload(path) = &job.input.image {
        let _ = tokio::fs::remove_file(path).await;
    }
    Ok(Json(view(&state, &job)))
}

fn apply_text_field(request: &mut EditRequest, name: &str, text: String) -> AppResult<()> {
    match name {
        "prompt" => request.prompt = text,
        "image_url" => request.image_url = Some(text).filter(|t| !t.trim().is_empty()),
        "directory" => request.directory = Some(text.trim().to_string()),
        "resize_long_edge" if !text.trim().is_empty() => {
            let value = text
                .trim()
                .parse()
                .map_err(|_| AppError::Validation(format!("resize_long_edge is not a number: {text}")))?;
            request.resize_long_edge = Some(value);
        }
        "use_4bit" if !text.trim().is_empty() => {
            let value = parse_flag(&text)
                .ok_or_else(|| AppError::Validation(format!("use_4bit is not a boolean: {text}")))?;
            request.use_4bit = Some(value);
        }
        other => tracing::debug!(field = other, "Ignoring unknown form field"),
    }
    Ok(())
}

/// Wait for `id` to reach a terminal state, returning its latest view when
/// the wait expires.
async fn await_terminal(
    state: &AppState,
    mut updates: tokio::sync::broadcast::Receiver<EditJob>,
    id: Uuid,
    wait: Duration,
) -> Result<EditJob, StoreError> {
    let store = &state.store;
    let waited = tokio::time::timeout(wait, async {
        loop {
            match updates.recv().await {
                Ok(job) if job.id == id && job.state.is_terminal() => return Ok(job),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %id, skipped, "Update stream lagged, re-reading job");
                    let job = store.status(id)?;
                    if job.state.is_terminal() {
                        return Ok(job);
                    }
                }
                Err(RecvError::Closed) => return store.status(id),
            }
        }
    })
    .await;

    match waited {
        Ok(result) => result,
        Err(_) => {
            tracing::info!(job_id = %id, "Submission wait expired, returning for polling");
            store.status(id)
        }
    }
}

fn response_status(job: &EditJob) -> StatusCode {
    match job.state {
        JobState::Done => StatusCode::OK,
        JobState::Queued | JobState::Processing => StatusCode::ACCEPTED,
        JobState::Failed => match job.error.as_ref().map(|e| e.kind) {
            Some(ErrorKind::Validation | ErrorKind::PermanentInference) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Some(ErrorKind::TransientInference) => StatusCode::BAD_GATEWAY,
            Some(ErrorKind::Cancelled) => StatusCode::CONFLICT,
            Some(ErrorKind::Internal) | None => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn view(state: &AppState, job: &EditJob) -> JobView {
    JobView::new(
        job,
        state.publisher.artifact_url(job),
        format!("/api/jobs/{}", job.id),
    )
}
