//! In-memory job queue.
//!
//! The queue is the single source of truth for job state. Every mutation goes
//! through one `parking_lot` mutex; none of the methods await while holding it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::processors::{CaptionSpec, SlideshowSpec};
use crate::{Error, Result};

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is waiting to be claimed.
    Pending,
    /// Job is being executed by a worker.
    Processing,
    /// Job finished successfully.
    Completed,
    /// Job failed; `error` holds the reason.
    Failed,
    /// Job was cancelled before or during execution.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled jobs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    /// Snapshot tier: processing first, then pending, then everything else.
    fn tier(self) -> u8 {
        match self {
            JobStatus::Processing => 0,
            JobStatus::Pending => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does, keyed by job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSpec {
    /// Render N slideshow videos from an image folder.
    Slideshow(SlideshowSpec),
    /// Obtain subtitles for an audio file and render a caption video.
    Caption(CaptionSpec),
    /// Handled by a processor registered for `kind`.
    Custom {
        kind: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl JobSpec {
    pub const SLIDESHOW: &'static str = "slideshow";
    pub const CAPTION: &'static str = "caption";

    /// Job type used to pick a processor.
    pub fn kind(&self) -> &str {
        match self {
            JobSpec::Slideshow(_) => Self::SLIDESHOW,
            JobSpec::Caption(_) => Self::CAPTION,
            JobSpec::Custom { kind, .. } => kind,
        }
    }

    pub fn custom(kind: impl Into<String>) -> Self {
        JobSpec::Custom {
            kind: kind.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// A job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID.
    pub id: String,
    /// Optional human-readable label.
    pub name: Option<String>,
    /// Job configuration; not modified once the job is running.
    pub spec: JobSpec,
    /// Higher runs first.
    pub priority: i32,
    pub status: JobStatus,
    /// Overall progress in percent, 0 to 100.
    pub progress: f64,
    /// What the pipeline is working on right now.
    pub current_item: Option<String>,
    /// Set if and only if `status` is `Failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Output files produced so far.
    pub completed_artifacts: Vec<PathBuf>,
}

impl Job {
    /// Create a new pending job with a random ID.
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: None,
            spec,
            priority: 0,
            status: JobStatus::Pending,
            progress: 0.0,
            current_item: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            completed_artifacts: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn job_type(&self) -> &str {
        self.spec.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Name if set, otherwise the ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Wall-clock run time, once the job has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

/// Partial update applied by the worker pool while a job is processing.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// New overall progress; lower values than the current one are ignored.
    pub progress: Option<f64>,
    pub current_item: Option<String>,
    /// A finished output file.
    pub artifact: Option<PathBuf>,
}

/// Terminal result recorded for a processing job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl JobOutcome {
    fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone)]
pub(crate) enum CancelAction {
    /// The job was pending and is now cancelled.
    Cancelled(Job),
    /// The job is processing; its token has been cancelled.
    Signalled,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_jobs: usize,
    pub jobs_by_status: BTreeMap<JobStatus, usize>,
    /// Lifetime counters, unaffected by removals.
    pub total_added: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_artifacts: u64,
}

/// Pending order: priority descending, then oldest first, then insertion order.
type PendingKey = (Reverse<i32>, DateTime<Utc>, u64, String);

struct Entry {
    job: Job,
    seq: u64,
    token: Option<CancellationToken>,
}

impl Entry {
    fn pending_key(&self) -> PendingKey {
        (
            Reverse(self.job.priority),
            self.job.created_at,
            self.seq,
            self.job.id.clone(),
        )
    }
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<String, Entry>,
    pending: BTreeSet<PendingKey>,
    next_seq: u64,
    total_added: u64,
    total_completed: u64,
    total_failed: u64,
    total_cancelled: u64,
    total_artifacts: u64,
}

impl QueueState {
    fn cancel_pending(&mut self, id: &str) -> Option<Job> {
        let entry = self.entries.get_mut(id)?;
        if entry.job.status != JobStatus::Pending {
            return None;
        }
        self.pending.remove(&entry.pending_key());
        entry.job.status = JobStatus::Cancelled;
        entry.job.completed_at = Some(Utc::now());
        self.total_cancelled += 1;
        Some(entry.job.clone())
    }
}

fn snapshot_order(a: &Entry, b: &Entry) -> Ordering {
    a.job
        .status
        .tier()
        .cmp(&b.job.status.tier())
        .then_with(|| b.job.priority.cmp(&a.job.priority))
        .then_with(|| a.job.created_at.cmp(&b.job.created_at))
        .then_with(|| a.seq.cmp(&b.seq))
}

/// Thread-safe store of all known jobs.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job in the pending state.
    ///
    /// Runtime fields (status, progress, error, timestamps, artifacts) are
    /// reset; identity, spec, name, priority and `created_at` are kept.
    pub fn add_job(&self, mut job: Job) -> Result<String> {
        job.status = JobStatus::Pending;
        job.progress = 0.0;
        job.current_item = None;
        job.error = None;
        job.started_at = None;
        job.completed_at = None;
        job.completed_artifacts.clear();

        let mut state = self.state.lock();
        if state.entries.contains_key(&job.id) {
            return Err(Error::DuplicateId(job.id));
        }

        let id = job.id.clone();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.total_added += 1;

        info!("Enqueued job {} of type {}", id, job.job_type());

        let entry = Entry {
            job,
            seq,
            token: None,
        };
        state.pending.insert(entry.pending_key());
        state.entries.insert(id.clone(), entry);
        Ok(id)
    }

    /// Snapshot of a single job.
    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.state.lock().entries.get(id).map(|e| e.job.clone())
    }

    /// Snapshot of all jobs, optionally filtered by status.
    ///
    /// Processing jobs come first, then pending, then terminal ones; within a
    /// tier higher priority first, then older first.
    pub fn get_all_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let state = self.state.lock();
        let mut entries: Vec<&Entry> = state
            .entries
            .values()
            .filter(|e| status.is_none_or(|s| e.job.status == s))
            .collect();
        entries.sort_by(|a, b| snapshot_order(a, b));
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    /// Apply a partial update to a processing job.
    pub fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;

        if entry.job.status != JobStatus::Processing {
            return Err(Error::validation(format!(
                "Job {} cannot be updated while {}",
                id, entry.job.status
            )));
        }

        if let Some(progress) = update.progress {
            let progress = progress.clamp(0.0, 100.0);
            if progress > entry.job.progress {
                entry.job.progress = progress;
            }
        }
        if let Some(item) = update.current_item {
            entry.job.current_item = Some(item);
        }

        let mut new_artifact = false;
        if let Some(path) = update.artifact
            && !entry.job.completed_artifacts.contains(&path)
        {
            entry.job.completed_artifacts.push(path);
            new_artifact = true;
        }

        let job = entry.job.clone();
        if new_artifact {
            state.total_artifacts += 1;
        }
        Ok(job)
    }

    /// Remove a job regardless of its state.
    ///
    /// A processing job keeps running; cancel it first if that is not wanted.
    pub fn remove_job(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.remove(id) {
            Some(entry) => {
                if entry.job.status == JobStatus::Pending {
                    state.pending.remove(&entry.pending_key());
                }
                debug!("Removed job {}", id);
                true
            }
            None => false,
        }
    }

    /// Remove every job matching `predicate`. Returns the number removed.
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Job) -> bool,
    {
        let mut state = self.state.lock();
        let ids: Vec<String> = state
            .entries
            .values()
            .filter(|e| predicate(&e.job))
            .map(|e| e.job.id.clone())
            .collect();

        for id in &ids {
            if let Some(entry) = state.entries.remove(id)
                && entry.job.status == JobStatus::Pending
            {
                state.pending.remove(&entry.pending_key());
            }
        }
        ids.len()
    }

    /// Cancel a job.
    ///
    /// Pending jobs become cancelled immediately. Processing jobs are
    /// signalled and become cancelled once their pipeline observes the token.
    /// Returns `false` for unknown or already finished jobs.
    pub fn cancel_job(&self, id: &str) -> bool {
        self.cancel(id).is_some()
    }

    pub(crate) fn cancel(&self, id: &str) -> Option<CancelAction> {
        let mut state = self.state.lock();
        let status = state.entries.get(id)?.job.status;
        match status {
            JobStatus::Pending => {
                let job = state.cancel_pending(id)?;
                info!("Cancelled pending job {}", id);
                Some(CancelAction::Cancelled(job))
            }
            JobStatus::Processing => {
                let entry = state.entries.get(id)?;
                if let Some(token) = &entry.token {
                    token.cancel();
                }
                info!("Requested cancellation of running job {}", id);
                Some(CancelAction::Signalled)
            }
            _ => None,
        }
    }

    /// Cancel every pending job. Returns the cancelled jobs.
    pub(crate) fn cancel_all_pending(&self) -> Vec<Job> {
        let mut state = self.state.lock();
        let ids: Vec<String> = state.pending.iter().map(|key| key.3.clone()).collect();
        ids.iter()
            .filter_map(|id| state.cancel_pending(id))
            .collect()
    }

    /// Signal every processing job. Returns their IDs.
    pub(crate) fn signal_all_processing(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|e| e.job.status == JobStatus::Processing)
            .map(|e| {
                if let Some(token) = &e.token {
                    token.cancel();
                }
                e.job.id.clone()
            })
            .collect()
    }

    /// Remove terminal jobs, keeping the `retain_limit` most recently finished.
    ///
    /// Returns the number of jobs removed.
    pub fn clear_completed(&self, retain_limit: Option<usize>) -> usize {
        let mut state = self.state.lock();
        let mut terminal: Vec<(Option<DateTime<Utc>>, u64, String)> = state
            .entries
            .values()
            .filter(|e| e.job.is_terminal())
            .map(|e| (e.job.completed_at, e.seq, e.job.id.clone()))
            .collect();

        // Most recent first.
        terminal.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let keep = retain_limit.unwrap_or(0).min(terminal.len());
        let removed = terminal.len() - keep;
        for (_, _, id) in terminal.into_iter().skip(keep) {
            state.entries.remove(&id);
        }

        if removed > 0 {
            debug!("Cleared {} finished jobs", removed);
        }
        removed
    }

    /// Number of jobs per status; every status is present.
    pub fn count_by_status(&self) -> BTreeMap<JobStatus, usize> {
        let state = self.state.lock();
        let mut counts: BTreeMap<JobStatus, usize> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for entry in state.entries.values() {
            *counts.entry(entry.job.status).or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pending jobs.
    pub fn depth(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn stats(&self) -> QueueStats {
        let jobs_by_status = self.count_by_status();
        let state = self.state.lock();
        QueueStats {
            total_jobs: state.entries.len(),
            jobs_by_status,
            total_added: state.total_added,
            total_completed: state.total_completed,
            total_failed: state.total_failed,
            total_cancelled: state.total_cancelled,
            total_artifacts: state.total_artifacts,
        }
    }

    /// IDs of jobs processing for longer than `threshold`.
    pub fn stuck_jobs(&self, threshold: Duration) -> Vec<String> {
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return Vec::new();
        };
        let now = Utc::now();
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|e| e.job.status == JobStatus::Processing)
            .filter(|e| e.job.started_at.is_some_and(|t| now - t > threshold))
            .map(|e| e.job.id.clone())
            .collect()
    }

    /// Atomically claim the next pending job.
    ///
    /// The job moves to processing and receives a fresh cancellation token.
    pub(crate) fn claim_next(&self) -> Option<(Job, CancellationToken)> {
        let mut state = self.state.lock();
        let key = state.pending.pop_first()?;
        let entry = state.entries.get_mut(&key.3)?;

        let token = CancellationToken::new();
        entry.job.status = JobStatus::Processing;
        entry.job.started_at = Some(Utc::now());
        entry.token = Some(token.clone());

        debug!(job_id = %entry.job.id, "Claimed job");
        Some((entry.job.clone(), token))
    }

    /// Record the terminal state of a processing job.
    pub(crate) fn finish(&self, id: &str, outcome: JobOutcome) -> Result<Job> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;

        let next = outcome.status();
        if !entry.job.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: entry.job.status.to_string(),
                to: next.to_string(),
            });
        }

        entry.job.status = next;
        entry.job.completed_at = Some(Utc::now());
        entry.job.current_item = None;
        entry.token = None;
        match outcome {
            JobOutcome::Completed => {
                entry.job.progress = 100.0;
            }
            JobOutcome::Failed(error) => {
                let error = if error.trim().is_empty() {
                    "Unknown error".to_string()
                } else {
                    error
                };
                entry.job.error = Some(error);
            }
            JobOutcome::Cancelled => {}
        }

        let job = entry.job.clone();
        match next {
            JobStatus::Completed => state.total_completed += 1,
            JobStatus::Failed => state.total_failed += 1,
            _ => state.total_cancelled += 1,
        }
        Ok(job)
    }
}
