//! Durable job store.
//!
//! Job state lives in memory behind a single lock and every transition is
//! appended to a JSON-lines journal before the lock is released. Readers
//! therefore always see each job in exactly one state.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::models::job::{EditJob, ErrorKind, JobError, JobSource, JobState, NewJob};

pub mod journal;

use journal::{Journal, JournalRecord};

const JOURNAL_FILE: &str = "jobs.jsonl";
const UPLOADS_DIR: &str = "uploads";
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Per-state job totals.
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StateCounts {
    pub queued: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.done + self.failed
    }
}

/// What startup recovery found in the journal.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub replayed: usize,
    /// Jobs found mid-processing and put back in the queue.
    pub requeued: Vec<Uuid>,
    pub skipped_lines: usize,
}

struct StoreInner {
    jobs: HashMap<Uuid, EditJob>,
    /// Queued job ids keyed by arrival sequence.
    queued: BTreeMap<u64, Uuid>,
    /// Natural keys of queued and processing jobs.
    active_keys: HashMap<String, Uuid>,
    next_seq: u64,
    journal: Journal,
}

/// Owner of every job state transition.
pub struct JobStore {
    inner: Mutex<StoreInner>,
    work: Notify,
    updates: broadcast::Sender<EditJob>,
    uploads_dir: PathBuf,
}

impl JobStore {
    /// Open the store under `queue_dir`, replaying the journal and re-queuing
    /// jobs that were interrupted mid-processing.
    pub fn open(queue_dir: &Path) -> Result<(Self, RecoveryReport), StoreError> {
        std::fs::create_dir_all(queue_dir)?;
        let uploads_dir = queue_dir.join(UPLOADS_DIR);
        std::fs::create_dir_all(&uploads_dir)?;

        let journal_path = queue_dir.join(JOURNAL_FILE);
        let replay = Journal::replay(&journal_path)?;
        let mut report = RecoveryReport {
            replayed: replay.jobs.len(),
            skipped_lines: replay.skipped,
            ..Default::default()
        };

        let mut jobs = replay.jobs;
        for job in jobs.values_mut() {
            if job.state == JobState::Processing {
                tracing::warn!(
                    job_id = %job.id,
                    reason = "InterruptedAtStartup",
                    "Re-queuing job left in processing"
                );
                job.state = JobState::Queued;
                job.started_at = None;
                report.requeued.push(job.id);
            }
        }

        let mut ordered: Vec<&EditJob> = jobs.values().collect();
        ordered.sort_by_key(|job| job.seq);
        let journal = Journal::compact(&journal_path, ordered)?;

        let mut queued = BTreeMap::new();
        let mut active_keys = HashMap::new();
        let mut next_seq = 0;
        for job in jobs.values() {
            next_seq = next_seq.max(job.seq + 1);
            if job.state == JobState::Queued {
                queued.insert(job.seq, job.id);
            }
            if job.state.is_active() {
                active_keys.insert(job.natural_key.clone(), job.id);
            }
        }

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let store = Self {
            inner: Mutex::new(StoreInner {
                jobs,
                queued,
                active_keys,
                next_seq,
                journal,
            }),
            work: Notify::new(),
            updates,
            uploads_dir,
        };

        if !store.lock().queued.is_empty() {
            store.work.notify_one();
        }

        Ok((store, report))
    }

    /// Persist a new job in the queued state.
    pub fn enqueue(&self, new: NewJob) -> Result<EditJob, StoreError> {
        let job = {
            let mut inner = self.lock();
            if let Some(existing) = inner.active_keys.get(&new.natural_key) {
                return Err(StoreError::Duplicate { existing: *existing });
            }

            let job = EditJob {
                id: new.id.unwrap_or_else(Uuid::new_v4),
                seq: inner.next_seq,
                source: new.source,
                input: new.input,
                options: new.options,
                natural_key: new.natural_key,
                state: JobState::Queued,
                attempts: 0,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                artifact: None,
                error: None,
            };
            if inner.jobs.contains_key(&job.id) {
                return Err(StoreError::Duplicate { existing: job.id });
            }

            inner
                .journal
                .append(&JournalRecord::Snapshot { job: job.clone() })?;
            inner.next_seq += 1;
            inner.queued.insert(job.seq, job.id);
            inner.active_keys.insert(job.natural_key.clone(), job.id);
            inner.jobs.insert(job.id, job.clone());
            job
        };

        tracing::info!(job_id = %job.id, seq = job.seq, source = %job.source, "Job queued");
        self.publish(&job);
        self.work.notify_one();
        Ok(job)
    }

    /// Take the oldest queued job and mark it processing.
    pub fn claim_next(&self) -> Result<Option<EditJob>, StoreError> {
        let job = {
            let mut inner = self.lock();
            let Some((&seq, &id)) = inner.queued.iter().next() else {
                return Ok(None);
            };

            let started_at = Utc::now();
            inner
                .journal
                .append(&JournalRecord::Claimed { id, started_at })?;
            inner.queued.remove(&seq);
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or(StoreError::UnknownJob(id))?;
            job.state = JobState::Processing;
            job.started_at = Some(started_at);
            job.clone()
        };

        tracing::info!(job_id = %job.id, seq = job.seq, "Job claimed");
        self.publish(&job);
        Ok(Some(job))
    }

    /// Record a failed attempt on a processing job that is about to be retried.
    pub fn record_attempt(&self, id: Uuid) -> Result<EditJob, StoreError> {
        let job = {
            let mut inner = self.lock();
            let attempts = match inner.jobs.get(&id) {
                Some(job) if job.state == JobState::Processing => job.attempts + 1,
                _ => return Err(StoreError::UnknownJob(id)),
            };
            inner
                .journal
                .append(&JournalRecord::Attempt { id, attempts })?;
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or(StoreError::UnknownJob(id))?;
            job.attempts = attempts;
            job.clone()
        };
        self.publish(&job);
        Ok(job)
    }

    /// Mark a processing job done with its artifact path.
    pub fn complete(&self, id: Uuid, artifact: String) -> Result<EditJob, StoreError> {
        let job = self.finish(id, |job, finished_at| {
            job.state = JobState::Done;
            job.attempts += 1;
            job.artifact = Some(artifact.clone());
            job.finished_at = Some(finished_at);
            JournalRecord::Completed {
                id,
                finished_at,
                attempts: job.attempts,
                artifact: artifact.clone(),
            }
        })?;
        tracing::info!(job_id = %id, artifact = ?job.artifact, "Job done");
        Ok(job)
    }

    /// Mark a processing job failed.
    pub fn fail(&self, id: Uuid, error: JobError) -> Result<EditJob, StoreError> {
        let job = self.finish(id, |job, finished_at| {
            job.state = JobState::Failed;
            job.attempts += 1;
            job.error = Some(error.clone());
            job.finished_at = Some(finished_at);
            JournalRecord::Failed {
                id,
                finished_at,
                attempts: job.attempts,
                error: error.clone(),
            }
        })?;
        tracing::warn!(job_id = %id, kind = %error.kind, error = %error.message, "Job failed");
        Ok(job)
    }

    /// Remove a queued job before any slot claims it.
    pub fn cancel(&self, id: Uuid) -> Result<EditJob, StoreError> {
        let job = {
            let mut inner = self.lock();
            let (seq, attempts, natural_key) = match inner.jobs.get(&id) {
                None => return Err(StoreError::NotFound(id)),
                Some(job) if job.state != JobState::Queued => {
                    return Err(StoreError::NotCancellable {
                        id,
                        state: job.state,
                    })
                }
                Some(job) => (job.seq, job.attempts, job.natural_key.clone()),
            };

            let finished_at = Utc::now();
            let error = JobError::new(ErrorKind::Cancelled, "cancelled before processing");
            inner.journal.append(&JournalRecord::Failed {
                id,
                finished_at,
                attempts,
                error: error.clone(),
            })?;
            inner.queued.remove(&seq);
            inner.active_keys.remove(&natural_key);
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or(StoreError::NotFound(id))?;
            job.state = JobState::Failed;
            job.finished_at = Some(finished_at);
            job.error = Some(error);
            job.clone()
        };

        tracing::info!(job_id = %id, "Job cancelled");
        self.publish(&job);
        Ok(job)
    }

    pub fn status(&self, id: Uuid) -> Result<EditJob, StoreError> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    pub fn counts(&self) -> StateCounts {
        let inner = self.lock();
        let mut counts = StateCounts::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Processing => counts.processing += 1,
                JobState::Done => counts.done += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Receive every job after each transition.
    pub fn subscribe(&self) -> broadcast::Receiver<EditJob> {
        self.updates.subscribe()
    }

    /// Suspend until a job may be available to claim.
    pub async fn wait_for_work(&self) {
        self.work.notified().await;
    }

    /// Directory where uploaded source images are persisted.
    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    fn finish<F>(&self, id: Uuid, transition: F) -> Result<EditJob, StoreError>
    where
        F: FnOnce(&mut EditJob, chrono::DateTime<Utc>) -> JournalRecord,
    {
        let job = {
            let mut inner = self.lock();
            let mut updated = match inner.jobs.get(&id) {
                Some(job) if job.state == JobState::Processing => job.clone(),
                _ => return Err(StoreError::UnknownJob(id)),
            };

            let record = transition(&mut updated, Utc::now());
            inner.journal.append(&record)?;
            inner.active_keys.remove(&updated.natural_key);
            inner.jobs.insert(id, updated.clone());
            updated
        };
        self.publish(&job);
        Ok(job)
    }

    fn publish(&self, job: &EditJob) {
        // No subscribers is fine.
        let _ = self.updates.send(job.clone());
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A poisoned lock only means another thread panicked mid-transition;
        // the journal was written before any in-memory mutation.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Content hash identifying equivalent submissions.
pub fn natural_key(
    source: JobSource,
    image: &[u8],
    prompt: &str,
    directory: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(image);
    hasher.update([0]);
    hasher.update(prompt.as_bytes());
    hasher.update([0]);
    hasher.update(directory.unwrap_or_default().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("An equivalent job is already queued or processing: {existing}")]
    Duplicate { existing: Uuid },

    #[error("Job {0} is not processing")]
    UnknownJob(Uuid),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id} is {state} and can no longer be cancelled")]
    NotCancellable { id: Uuid, state: JobState },

    #[error("Journal I/O error: {0}")]
    Journal(#[from] std::io::Error),
}
