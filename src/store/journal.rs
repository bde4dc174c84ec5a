use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use uuid::Uuid;

use crate::models::job::{EditJob, JobError, JobState};

/// One line of the append-only job journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Full job state. Written on enqueue and by compaction.
    Snapshot { job: EditJob },
    Claimed { id: Uuid, started_at: DateTime<Utc> },
    Attempt { id: Uuid, attempts: u32 },
    Completed {
        id: Uuid,
        finished_at: DateTime<Utc>,
        attempts: u32,
        artifact: String,
    },
    Failed {
        id: Uuid,
        finished_at: DateTime<Utc>,
        attempts: u32,
        error: JobError,
    },
}

/// Result of replaying a journal file.
#[derive(Debug, Default)]
pub struct Replay {
    pub jobs: HashMap<Uuid, EditJob>,
    /// Lines that could not be decoded or referenced an unknown job.
    pub skipped: usize,
}

/// Append-only JSON-lines log of job transitions.
pub struct Journal {
    file: File,
}

impl Journal {
    /// Replay the journal at `path`. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let mut replay = Replay::default();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(replay),
            Err(e) => return Err(e),
        };

        // Raw bytes: a torn tail may end inside a multi-byte character.
        for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let record: JournalRecord = match serde_json::from_slice(&line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(line = index + 1, error = %e, "Skipping undecodable journal line");
                    replay.skipped += 1;
                    continue;
                }
            };
            if !apply(&mut replay.jobs, record) {
                tracing::warn!(line = index + 1, "Skipping journal record for unknown job");
                replay.skipped += 1;
            }
        }

        Ok(replay)
    }

    /// Rewrite the journal as one snapshot per job, then reopen it for appends.
    ///
    /// The new contents go to a sibling temp file that is renamed over the old
    /// journal, so a crash leaves either the old or the new file in place.
    pub fn compact<'a>(
        path: &Path,
        jobs: impl IntoIterator<Item = &'a EditJob>,
    ) -> io::Result<Self> {
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp)?;
            for job in jobs {
                let record = JournalRecord::Snapshot { job: job.clone() };
                let line = serde_json::to_string(&record).map_err(io::Error::other)?;
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Self::open(path)
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Append a record and flush it to stable storage.
    pub fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record).map_err(io::Error::other)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()
    }
}

/// Apply one record to the replayed job map. Returns false if the record
/// references a job that was never snapshotted.
fn apply(jobs: &mut HashMap<Uuid, EditJob>, record: JournalRecord) -> bool {
    match record {
        JournalRecord::Snapshot { job } => {
            jobs.insert(job.id, job);
            true
        }
        JournalRecord::Claimed { id, started_at } => match jobs.get_mut(&id) {
            Some(job) => {
                job.state = JobState::Processing;
                job.started_at = Some(started_at);
                true
            }
            None => false,
        },
        JournalRecord::Attempt { id, attempts } => match jobs.get_mut(&id) {
            Some(job) => {
                job.attempts = attempts;
                true
            }
            None => false,
        },
        JournalRecord::Completed {
            id,
            finished_at,
            attempts,
            artifact,
        } => match jobs.get_mut(&id) {
            Some(job) => {
                job.state = JobState::Done;
                job.finished_at = Some(finished_at);
                job.attempts = attempts;
                job.artifact = Some(artifact);
                true
            }
            None => false,
        },
        JournalRecord::Failed {
            id,
            finished_at,
            attempts,
            error,
        } => match jobs.get_mut(&id) {
            Some(job) => {
                job.state = JobState::Failed;
                job.finished_at = Some(finished_at);
                job.attempts = attempts;
                job.error = Some(error);
                true
            }
            None => false,
        },
    }
}
