use garde::Validate;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::models::job::{ImageRef, JobInput, JobOptions, JobSource, NewJob};
use crate::models::submission::InboxRow;
use crate::store::{natural_key, JobStore, StoreError};

pub const LEDGER_HEADER: &str = "image_url,prompt,directory";
const CURSOR_FILE: &str = "inbox.cursor";

/// Outcome of one pass over newly appended ledger rows.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ScanReport {
    pub enqueued: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub job_ids: Vec<Uuid>,
}

/// Tails the append-only CSV ledger and turns new rows into jobs.
pub struct InboxWatcher {
    ledger: PathBuf,
    cursor_path: PathBuf,
    store: Arc<JobStore>,
    defaults: JobOptions,
    /// Serializes ledger appends with cursor advancement.
    lock: Mutex<()>,
}

impl InboxWatcher {
    pub fn new(
        ledger: impl Into<PathBuf>,
        queue_dir: &Path,
        store: Arc<JobStore>,
        defaults: JobOptions,
    ) -> Self {
        Self {
            ledger: ledger.into(),
            cursor_path: queue_dir.join(CURSOR_FILE),
            store,
            defaults,
            lock: Mutex::new(()),
        }
    }

    /// Create the ledger with its header if it does not exist yet.
    pub async fn ensure_ledger(&self) -> Result<(), InboxError> {
        if let Some(parent) = self.ledger.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(&self.ledger).await? {
            return Ok(());
        }
        tokio::fs::write(&self.ledger, format!("{LEDGER_HEADER}\n")).await?;
        tracing::info!(ledger = %self.ledger.display(), "Created CSV inbox");
        Ok(())
    }

    /// Enqueue every complete row appended since the last scan.
    pub async fn scan(&self) -> Result<ScanReport, InboxError> {
        let _guard = self.lock.lock().await;
        let mut report = ScanReport::default();

        let mut cursor = self.read_cursor().await?;
        let mut file = match tokio::fs::File::open(&self.ledger).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < cursor {
            tracing::warn!(cursor, len, "Ledger shrank below the cursor, rescanning from start");
            cursor = 0;
        }

        file.seek(std::io::SeekFrom::Start(cursor)).await?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk).await?;

        // A trailing line without a newline may still be mid-write.
        let Some(end) = chunk.iter().rposition(|b| *b == b'\n') else {
            return Ok(report);
        };
        let data = &chunk[..=end];

        // Records are read straight off the ledger bytes so a quoted field may
        // span lines; the cursor only ever advances past whole records.
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(data);
        let mut record = csv::ByteRecord::new();
        let mut consumed = 0usize;

        loop {
            let record_start = consumed;
            match reader.read_byte_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(offset = cursor + record_start as u64, error = %e, "Stopping scan at unreadable ledger data");
                    break;
                }
            }
            let record_end = (reader.position().byte() as usize).min(data.len());
            let raw = &data[record_start..record_end];
            if record_end == data.len() && raw.iter().filter(|b| **b == b'"').count() % 2 == 1 {
                // Quoted field still open: the rest of the row is not written yet.
                break;
            }
            consumed = record_end;

            let row_start = cursor + record_start as u64;
            if row_start == 0 && is_header(&record) {
                continue;
            }

            match parse_record(&record) {
                Ok(row) => match self.store.enqueue(self.to_job(row)) {
                    Ok(job) => {
                        metrics::counter!("edit_jobs_total", "source" => "csv_row").increment(1);
                        report.enqueued += 1;
                        report.job_ids.push(job.id);
                    }
                    Err(StoreError::Duplicate { existing }) => {
                        tracing::info!(offset = row_start, existing = %existing, "Ledger row duplicates an active job");
                        report.duplicates += 1;
                    }
                    Err(e) => {
                        // Leave the cursor on this row so the next scan retries it.
                        self.write_cursor(row_start).await?;
                        return Err(e.into());
                    }
                },
                Err(reason) => {
                    let row = String::from_utf8_lossy(raw);
                    tracing::warn!(offset = row_start, row = %row.trim_end(), reason = %reason, "Rejecting malformed ledger row");
                    metrics::counter!("inbox_rows_malformed_total").increment(1);
                    report.malformed += 1;
                }
            }
        }

        self.write_cursor(cursor + consumed as u64).await?;
        if report.enqueued > 0 || report.malformed > 0 {
            tracing::info!(
                enqueued = report.enqueued,
                duplicates = report.duplicates,
                malformed = report.malformed,
                "Inbox scan complete"
            );
        }
        Ok(report)
    }

    /// Append rows to the ledger, adding the trailing newline if missing.
    pub async fn append(&self, lines: &str) -> Result<(), InboxError> {
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        if !lines.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }

    pub async fn read_ledger(&self) -> Result<String, InboxError> {
        let _guard = self.lock.lock().await;
        Ok(tokio::fs::read_to_string(&self.ledger).await?)
    }

    /// Scan every `interval` until `shutdown` flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(ledger = %self.ledger.display(), interval_secs = interval.as_secs(), "Inbox watcher started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        tracing::error!(error = %e, "Inbox scan failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Inbox watcher stopped");
    }

    fn to_job(&self, row: InboxRow) -> NewJob {
        let directory = Some(row.directory).filter(|d| !d.is_empty());
        NewJob {
            id: None,
            source: JobSource::CsvRow,
            natural_key: natural_key(
                JobSource::CsvRow,
                row.image_url.as_bytes(),
                &row.prompt,
                directory.as_deref(),
            ),
            input: JobInput {
                image: ImageRef::Url(row.image_url),
                prompt: row.prompt,
                directory,
            },
            options: self.defaults.clone(),
        }
    }

    async fn read_cursor(&self) -> Result<u64, InboxError> {
        match tokio::fs::read_to_string(&self.cursor_path).await {
            Ok(text) => text
                .trim()
                .parse()
                .map_err(|_| InboxError::Cursor(text.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_cursor(&self, offset: u64) -> Result<(), InboxError> {
        let tmp = self.cursor_path.with_extension("cursor.tmp");
        tokio::fs::write(&tmp, offset.to_string()).await?;
        tokio::fs::rename(&tmp, &self.cursor_path).await?;
        Ok(())
    }
}

fn is_header(record: &csv::ByteRecord) -> bool {
    record.len() == 3
        && record
            .iter()
            .zip(LEDGER_HEADER.split(','))
            .all(|(field, name)| String::from_utf8_lossy(field).trim() == name)
}

/// Turn one ledger record into a validated row.
fn parse_record(record: &csv::ByteRecord) -> Result<InboxRow, String> {
    if record.len() != 3 {
        return Err(format!("expected 3 fields, found {}", record.len()));
    }

    let field = |i: usize| {
        std::str::from_utf8(&record[i])
            .map(|f| f.trim().to_string())
            .map_err(|e| format!("field {} is not UTF-8: {e}", i + 1))
    };
    let row = InboxRow {
        image_url: field(0)?,
        prompt: field(1)?,
        directory: field(2)?,
    };
    row.validate().map_err(|e| e.to_string())?;
    Ok(row)
}

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt inbox cursor: {0:?}")]
    Cursor(String),

    #[error("Failed to enqueue ledger row: {0}")]
    Store(#[from] StoreError),
}
