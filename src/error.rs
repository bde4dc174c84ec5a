use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::services::inbox::InboxError;
use crate::store::StoreError;

/// Error type for HTTP handlers, rendered as `{ "error", "code" }` JSON.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    UnsupportedMedia(String),

    #[error("Forbidden")]
    Forbidden,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Inbox(#[from] InboxError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut extra = serde_json::Map::new();
        let (status, code, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::UnsupportedMedia(msg) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_MEDIA",
                msg.clone(),
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", "Forbidden".to_string()),
            AppError::Store(StoreError::Duplicate { existing }) => {
                extra.insert("job_id".to_string(), json!(existing));
                (StatusCode::CONFLICT, "DUPLICATE_JOB", self.to_string())
            }
            AppError::Store(StoreError::NotCancellable { id, .. }) => {
                extra.insert("job_id".to_string(), json!(id));
                (StatusCode::CONFLICT, "NOT_CANCELLABLE", self.to_string())
            }
            AppError::Store(StoreError::NotFound(_) | StoreError::UnknownJob(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string())
            }
            AppError::Store(StoreError::Journal(_)) | AppError::Inbox(_) | AppError::Internal(_) => {
                tracing::error!(error = %self, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let mut body = serde_json::Map::new();
        body.insert("error".to_string(), json!(message));
        body.insert("code".to_string(), json!(code));
        body.extend(extra);

        (status, axum::Json(serde_json::Value::Object(body))).into_response()
    }
}
