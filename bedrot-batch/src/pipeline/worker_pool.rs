//! Worker pool driving job execution.
//!
//! Scheduling is event driven: a pass runs when the pool starts or resumes,
//! when a job is submitted, when the ceiling changes, and after every job
//! finishes. Each claimed job runs on its own task.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{BatchEvent, EventBroadcaster};
use super::job_queue::{CancelAction, Job, JobOutcome, JobQueue, JobStatus, JobUpdate};
use super::processors::{CaptionProcessor, JobContext, Processor, SlideshowProcessor};
use super::progress::{PipelineUpdate, ProgressReporter};
use crate::config::BatchConfig;
use crate::encoder::FfmpegEncoder;
use crate::pairing::InMemoryPairingStore;
use crate::retry::RetryPolicy;
use crate::transcription::ElevenLabsTranscriber;
use crate::{Error, Result};

/// Global run state of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// No jobs are claimed; the initial state.
    #[default]
    Stopped,
    Running,
    /// In-flight jobs finish but no new ones are claimed.
    Paused,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Stopped => write!(f, "stopped"),
            RunState::Running => write!(f, "running"),
            RunState::Paused => write!(f, "paused"),
        }
    }
}

/// Snapshot of pool and queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub total_jobs: usize,
    pub jobs_by_status: BTreeMap<JobStatus, usize>,
    pub active_workers: usize,
    pub max_workers: usize,
    pub run_state: RunState,
    /// Claims are suspended after a failure with `continue_on_error` off.
    pub halted: bool,
    pub total_added: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_artifacts_generated: u64,
    /// Jobs processing for longer than the configured threshold.
    pub stuck_jobs: Vec<String>,
}

struct PoolInner {
    queue: Arc<JobQueue>,
    events: EventBroadcaster,
    processors: Vec<Arc<dyn Processor>>,
    state: Mutex<RunState>,
    max_workers: AtomicUsize,
    active: AtomicUsize,
    /// Serialises claims against completions so `active` never overshoots.
    schedule_lock: Mutex<()>,
    halted: AtomicBool,
    continue_on_error: bool,
    completed_jobs_limit: Option<usize>,
    stuck_threshold: Duration,
    /// Runtime the pool was created on; job tasks are spawned onto it.
    runtime: Option<Handle>,
    tasks: Mutex<JoinSet<()>>,
}

/// Concurrency-bounded executor of queued jobs.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a stopped pool over `queue`.
    ///
    /// Jobs run on the tokio runtime current at construction, so the control
    /// methods may be called from threads outside it. A pool built outside
    /// any runtime spawns onto the runtime of whoever triggers scheduling.
    pub fn new(
        queue: Arc<JobQueue>,
        processors: Vec<Arc<dyn Processor>>,
        config: &BatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue,
                events: EventBroadcaster::with_capacity(config.event_capacity),
                processors,
                state: Mutex::new(RunState::Stopped),
                max_workers: AtomicUsize::new(config.max_workers.max(1)),
                active: AtomicUsize::new(0),
                schedule_lock: Mutex::new(()),
                halted: AtomicBool::new(false),
                continue_on_error: config.continue_on_error,
                completed_jobs_limit: config.completed_jobs_limit,
                stuck_threshold: Duration::from_secs(config.stuck_job_secs),
                runtime: Handle::try_current().ok(),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// A pool with the slideshow and caption processors wired to ffmpeg and
    /// ElevenLabs.
    pub fn with_default_processors(queue: Arc<JobQueue>, config: &BatchConfig) -> Result<Self> {
        let encoder = Arc::new(FfmpegEncoder::from_config(config));
        let transcriber = Arc::new(ElevenLabsTranscriber::new(config.transcription.clone())?);
        let render_retry = RetryPolicy::new(config.max_render_attempts);

        let processors: Vec<Arc<dyn Processor>> = vec![
            Arc::new(SlideshowProcessor::new(encoder.clone(), render_retry)),
            Arc::new(
                CaptionProcessor::new(encoder, transcriber, Arc::new(InMemoryPairingStore::new()))
                    .with_transcript_dir(config.transcript_dir.clone()),
            ),
        ];
        Ok(Self::new(queue, processors, config))
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.inner.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.inner.events.subscribe()
    }

    /// Add a job; it is picked up right away when the pool is running.
    pub fn submit(&self, job: Job) -> Result<String> {
        let id = self.inner.queue.add_job(job)?;
        self.inner.publish(BatchEvent::JobAdded { job_id: id.clone() });
        self.inner.publish(BatchEvent::QueueChanged);
        self.inner.schedule();
        Ok(id)
    }

    /// Alias of [`WorkerPool::submit`].
    pub fn add_job(&self, job: Job) -> Result<String> {
        self.submit(job)
    }

    /// Start claiming jobs, or resume after a pause or a halting failure.
    pub fn start(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), RunState::Running);
        let was_halted = self.inner.halted.swap(false, Ordering::SeqCst);
        if previous != RunState::Running {
            info!("Worker pool {} -> running", previous);
            self.inner.publish(BatchEvent::RunStateChanged {
                state: RunState::Running,
            });
        } else if was_halted {
            info!("Worker pool resumed after a failure");
        }
        self.inner.schedule();
    }

    /// Stop claiming jobs; in-flight jobs run to completion.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        if *state != RunState::Running {
            return;
        }
        *state = RunState::Paused;
        drop(state);

        info!("Worker pool paused");
        self.inner.publish(BatchEvent::RunStateChanged {
            state: RunState::Paused,
        });
    }

    /// Stop the pool.
    ///
    /// Pending jobs are cancelled. With `wait` the in-flight jobs finish
    /// naturally, otherwise they are signalled to cancel. Returns once every
    /// job task has ended.
    pub async fn stop(&self, wait: bool) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), RunState::Stopped);
        if previous != RunState::Stopped {
            info!("Stopping worker pool (wait: {})", wait);
            self.inner.publish(BatchEvent::RunStateChanged {
                state: RunState::Stopped,
            });
        }

        let cancelled = self.inner.queue.cancel_all_pending();
        for job in &cancelled {
            self.inner.publish(BatchEvent::JobCancelled {
                job_id: job.id.clone(),
            });
        }
        if !wait {
            let signalled = self.inner.queue.signal_all_processing();
            debug!("Signalled {} running job(s)", signalled.len());
        }
        if !cancelled.is_empty() {
            self.inner.publish(BatchEvent::QueueChanged);
        }

        // Take the join set out of the mutex before awaiting.
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Job task ended abnormally: {}", e);
            }
        }

        info!("Worker pool stopped");
    }

    /// Change the concurrency ceiling.
    ///
    /// Jobs already running are never preempted; a lower ceiling only
    /// affects future claims.
    pub fn set_max_workers(&self, max_workers: usize) -> Result<()> {
        if max_workers == 0 {
            return Err(Error::validation("max_workers must be at least 1"));
        }
        let previous = self.inner.max_workers.swap(max_workers, Ordering::SeqCst);
        if previous != max_workers {
            info!("Max workers {} -> {}", previous, max_workers);
            self.inner.publish_worker_count();
        }
        self.inner.schedule();
        Ok(())
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers.load(Ordering::SeqCst)
    }

    pub fn get_active_worker_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn run_state(&self) -> RunState {
        *self.inner.state.lock()
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    pub fn get_statistics(&self) -> PoolStatistics {
        let stats = self.inner.queue.stats();
        PoolStatistics {
            total_jobs: stats.total_jobs,
            jobs_by_status: stats.jobs_by_status,
            active_workers: self.get_active_worker_count(),
            max_workers: self.max_workers(),
            run_state: self.run_state(),
            halted: self.is_halted(),
            total_added: stats.total_added,
            total_completed: stats.total_completed,
            total_failed: stats.total_failed,
            total_cancelled: stats.total_cancelled,
            total_artifacts_generated: stats.total_artifacts,
            stuck_jobs: self.inner.queue.stuck_jobs(self.inner.stuck_threshold),
        }
    }

    /// Cancel one job. See [`JobQueue::cancel_job`].
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match self.inner.queue.cancel(job_id) {
            Some(CancelAction::Cancelled(job)) => {
                self.inner.publish(BatchEvent::JobCancelled { job_id: job.id });
                self.inner.publish(BatchEvent::QueueChanged);
                true
            }
            Some(CancelAction::Signalled) => true,
            None => false,
        }
    }

    /// Cancel every pending and processing job. Returns how many were affected.
    pub fn cancel_all_jobs(&self) -> usize {
        let cancelled = self.inner.queue.cancel_all_pending();
        for job in &cancelled {
            self.inner.publish(BatchEvent::JobCancelled {
                job_id: job.id.clone(),
            });
        }
        let signalled = self.inner.queue.signal_all_processing();
        let count = cancelled.len() + signalled.len();
        if count > 0 {
            info!(
                "Cancelled {} pending and signalled {} running job(s)",
                cancelled.len(),
                signalled.len()
            );
            self.inner.publish(BatchEvent::QueueChanged);
        }
        count
    }

    /// Remove finished jobs. See [`JobQueue::clear_completed`].
    pub fn clear_completed(&self, retain_limit: Option<usize>) -> usize {
        let removed = self.inner.queue.clear_completed(retain_limit);
        if removed > 0 {
            self.inner.publish(BatchEvent::QueueChanged);
        }
        removed
    }

    /// Remove a job. A running job should be cancelled first.
    pub fn remove_job(&self, job_id: &str) -> bool {
        let removed = self.inner.queue.remove_job(job_id);
        if removed {
            self.inner.publish(BatchEvent::QueueChanged);
        }
        removed
    }
}

impl PoolInner {
    fn publish(&self, event: BatchEvent) {
        self.events.publish(event);
    }

    fn publish_worker_count(&self) {
        self.publish(BatchEvent::WorkerCountChanged {
            active: self.active.load(Ordering::SeqCst),
            max: self.max_workers.load(Ordering::SeqCst),
        });
    }

    fn can_claim(&self) -> bool {
        *self.state.lock() == RunState::Running
            && !self.halted.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) < self.max_workers.load(Ordering::SeqCst)
    }

    /// Claim pending jobs until the ceiling is reached or none are left.
    fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }

    fn schedule(self: &Arc<Self>) {
        let _guard = self.schedule_lock.lock();
        let mut tasks = self.tasks.lock();

        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!("Job task ended abnormally: {}", e);
            }
        }

        if !self.can_claim() {
            return;
        }
        // Resolved before claiming so a job never turns processing without a task.
        let Some(runtime) = self.runtime() else {
            if self.queue.depth() > 0 {
                error!("No tokio runtime available, leaving {} job(s) pending", self.queue.depth());
            }
            return;
        };

        while self.can_claim() {
            let Some((job, token)) = self.queue.claim_next() else {
                break;
            };
            self.active.fetch_add(1, Ordering::SeqCst);

            info!(job_id = %job.id, "Starting {} job {}", job.job_type(), job.display_name());
            self.publish(BatchEvent::JobStarted {
                job_id: job.id.clone(),
            });
            self.publish_worker_count();

            let inner = Arc::clone(self);
            tasks.spawn_on(async move { inner.run_job(job, token).await }, &runtime);
        }
    }

    async fn run_job(self: Arc<Self>, job: Job, token: CancellationToken) {
        let processor = self
            .processors
            .iter()
            .find(|p| p.can_process(job.job_type()))
            .cloned();

        let outcome = match processor {
            Some(processor) => self.execute(processor, &job, token).await,
            None => {
                warn!(
                    "No processor found for job type: '{}'. Available processors: {:?}",
                    job.job_type(),
                    self.processors.iter().map(|p| p.name()).collect::<Vec<_>>()
                );
                JobOutcome::Failed(format!(
                    "No processor registered for job type {}",
                    job.job_type()
                ))
            }
        };

        self.complete(&job.id, outcome);
    }

    async fn execute(
        &self,
        processor: Arc<dyn Processor>,
        job: &Job,
        token: CancellationToken,
    ) -> JobOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = JobContext::new(job, token.clone(), ProgressReporter::new(&job.id, tx));
        let mut reported: HashSet<PathBuf> = HashSet::new();

        debug!(job_id = %job.id, "Running {}", processor.name());
        let process = AssertUnwindSafe(processor.process(&ctx)).catch_unwind();
        tokio::pin!(process);

        let result = loop {
            tokio::select! {
                biased;
                Some(update) = rx.recv() => self.apply_update(&job.id, update, &mut reported),
                result = &mut process => break result,
            }
        };
        while let Ok(update) = rx.try_recv() {
            self.apply_update(&job.id, update, &mut reported);
        }

        match result {
            Ok(Ok(output)) => {
                for path in output.outputs.into_iter().chain(output.items_produced) {
                    if !reported.contains(&path) {
                        self.apply_update(&job.id, PipelineUpdate::Artifact(path), &mut reported);
                    }
                }
                info!(
                    job_id = %job.id,
                    "{} finished in {:.2}s",
                    processor.name(),
                    output.duration_secs
                );
                JobOutcome::Completed
            }
            Ok(Err(e)) if e.is_cancelled() || token.is_cancelled() => {
                info!(job_id = %job.id, "Job cancelled ({})", e);
                JobOutcome::Cancelled
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, kind = e.kind(), "Job failed: {}", e);
                JobOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job.id, "{} panicked: {}", processor.name(), message);
                JobOutcome::Failed(format!("Processor panicked: {}", message))
            }
        }
    }

    /// Translate a pipeline update into a queue write and an event.
    fn apply_update(&self, job_id: &str, update: PipelineUpdate, reported: &mut HashSet<PathBuf>) {
        match update {
            PipelineUpdate::Progress {
                percent,
                current_item,
            } => {
                let update = JobUpdate {
                    progress: Some(percent),
                    current_item,
                    artifact: None,
                };
                match self.queue.update_job(job_id, update) {
                    Ok(job) => self.publish(BatchEvent::JobProgress {
                        job_id: job.id,
                        percent: job.progress,
                        current_item: job.current_item,
                    }),
                    Err(e) => debug!(job_id = %job_id, "Dropping progress update: {}", e),
                }
            }
            PipelineUpdate::Artifact(path) => {
                if !reported.insert(path.clone()) {
                    return;
                }
                let update = JobUpdate {
                    artifact: Some(path.clone()),
                    ..JobUpdate::default()
                };
                match self.queue.update_job(job_id, update) {
                    Ok(_) => {
                        info!(job_id = %job_id, "Produced {}", path.display());
                        self.publish(BatchEvent::ArtifactCompleted {
                            job_id: job_id.to_string(),
                            path,
                        });
                    }
                    Err(e) => debug!(job_id = %job_id, "Dropping artifact update: {}", e),
                }
            }
        }
    }

    /// Record a job's outcome, free its slot and refill.
    fn complete(self: &Arc<Self>, job_id: &str, outcome: JobOutcome) {
        let failed = matches!(outcome, JobOutcome::Failed(_));
        let result = {
            let _guard = self.schedule_lock.lock();
            let result = self.queue.finish(job_id, outcome);
            self.active.fetch_sub(1, Ordering::SeqCst);
            if failed && !self.continue_on_error && !self.halted.swap(true, Ordering::SeqCst) {
                warn!(job_id = %job_id, "Job failed and continue_on_error is off; halting claims");
            }
            result
        };

        match result {
            Ok(job) => {
                let event = match job.status {
                    JobStatus::Completed => BatchEvent::JobCompleted {
                        job_id: job.id.clone(),
                    },
                    JobStatus::Failed => BatchEvent::JobFailed {
                        job_id: job.id.clone(),
                        error: job.error.clone().unwrap_or_default(),
                    },
                    _ => BatchEvent::JobCancelled {
                        job_id: job.id.clone(),
                    },
                };
                info!(job_id = %job.id, "Job {} ({})", job.status, job.display_name());
                self.publish(event);
            }
            // The job was removed while running.
            Err(e) => warn!(job_id = %job_id, "Could not record job outcome: {}", e),
        }

        self.publish_worker_count();
        self.publish(BatchEvent::QueueChanged);

        if let Some(limit) = self.completed_jobs_limit {
            let removed = self.queue.clear_completed(Some(limit));
            if removed > 0 {
                debug!("Retention removed {} finished job(s)", removed);
            }
        }

        self.schedule();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
