use axum::extract::{Query, State};
use axum::response::Html;
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::error::{AppError, AppResult};
use crate::services::inbox::ScanReport;

#[derive(Debug, Default, Deserialize)]
pub struct CsvQuery {
    pub secret: Option<String>,
    /// Rows to append when they are not sent as the request body.
    pub lines: Option<String>,
}

fn check_secret(state: &AppState, query: &CsvQuery) -> AppResult<()> {
    match state.config.csv_secret() {
        Some(expected) if query.secret.as_deref() != Some(expected) => {
            tracing::warn!("Rejected CSV request with missing or wrong secret");
            Err(AppError::Forbidden)
        }
        _ => Ok(()),
    }
}

/// GET /csv: raw ledger contents.
pub async fn get_csv(State(state): State<AppState>, Query(query): Query<CsvQuery>) -> AppResult<String> {
    check_secret(&state, &query)?;
    Ok(state.inbox.read_ledger().await?)
}

/// POST /csv/append: append rows from the body (or the `lines` parameter).
pub async fn append_csv(
    State(state): State<AppState>,
    Query(query): Query<CsvQuery>,
    body: String,
) -> AppResult<Json<serde_json::Value>> {
    check_secret(&state, &query)?;
    let lines = if body.trim().is_empty() {
        query.lines.unwrap_or_default()
    } else {
        body
    };
    if lines.trim().is_empty() {
        return Err(AppError::Validation("No rows to append".to_string()));
    }
    state.inbox.append(&lines).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// POST /csv/ingest: scan the ledger now instead of waiting for the watcher.
pub async fn ingest_csv(
    State(state): State<AppState>,
    Query(query): Query<CsvQuery>,
) -> AppResult<Json<ScanReport>> {
    check_secret(&state, &query)?;
    Ok(Json(state.inbox.scan().await?))
}

/// GET /csv/ui: the ledger as an HTML table.
pub async fn csv_ui(State(state): State<AppState>, Query(query): Query<CsvQuery>) -> AppResult<Html<String>> {
    check_secret(&state, &query)?;
    let ledger = state.inbox.read_ledger().await?;
    Ok(Html(render_table(&ledger)))
}

fn render_table(ledger: &str) -> String {
    if ledger.trim().is_empty() {
        return "<html><body><p>Inbox empty</p></body></html>".to_string();
    }

    let mut html = String::from("<html><body><h2>CSV Inbox</h2><table border='1'>");
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(ledger.as_bytes());
    for record in reader.records().flatten() {
        html.push_str("<tr>");
        for cell in record.iter() {
            html.push_str("<td>");
            html.push_str(&escape_html(cell));
            html.push_str("</td>");
        }
        html.push_str("</tr>");
    }
    html.push_str("</table></body></html>");
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
