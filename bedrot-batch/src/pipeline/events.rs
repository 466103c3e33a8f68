//! Batch lifecycle events.
//!
//! The worker pool publishes these on a broadcast channel. Consumers (a GUI,
//! the runner binary, tests) subscribe and re-fetch queue snapshots as needed.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

use super::worker_pool::RunState;

/// Events emitted by the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    JobAdded {
        job_id: String,
    },
    /// A worker claimed the job.
    JobStarted {
        job_id: String,
    },
    JobProgress {
        job_id: String,
        percent: f64,
        current_item: Option<String>,
    },
    ArtifactCompleted {
        job_id: String,
        path: PathBuf,
    },
    JobCompleted {
        job_id: String,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
    JobCancelled {
        job_id: String,
    },
    /// Something in the queue changed; re-fetch the snapshot.
    QueueChanged,
    WorkerCountChanged {
        active: usize,
        max: usize,
    },
    RunStateChanged {
        state: RunState,
    },
}

impl BatchEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobAdded { job_id }
            | Self::JobStarted { job_id }
            | Self::JobProgress { job_id, .. }
            | Self::ArtifactCompleted { job_id, .. }
            | Self::JobCompleted { job_id }
            | Self::JobFailed { job_id, .. }
            | Self::JobCancelled { job_id } => Some(job_id.as_str()),
            Self::QueueChanged | Self::WorkerCountChanged { .. } | Self::RunStateChanged { .. } => {
                None
            }
        }
    }

    /// Whether this event marks the end of a job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::JobCompleted { .. } | Self::JobFailed { .. } | Self::JobCancelled { .. }
        )
    }

    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::JobAdded { job_id } => format!("Job added: {}", job_id),
            Self::JobStarted { job_id } => format!("Job started: {}", job_id),
            Self::JobProgress {
                job_id, percent, ..
            } => format!("Job {} progress: {:.1}%", job_id, percent),
            Self::ArtifactCompleted { job_id, path } => {
                format!("Job {} produced {}", job_id, path.display())
            }
            Self::JobCompleted { job_id } => format!("Job completed: {}", job_id),
            Self::JobFailed { job_id, error } => format!("Job failed: {} ({})", job_id, error),
            Self::JobCancelled { job_id } => format!("Job cancelled: {}", job_id),
            Self::QueueChanged => "Queue changed".to_string(),
            Self::WorkerCountChanged { active, max } => {
                format!("Workers: {}/{}", active, max)
            }
            Self::RunStateChanged { state } => format!("Run state: {}", state),
        }
    }
}

/// Default channel capacity for batch events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcaster for batch events.
pub struct EventBroadcaster {
    sender: broadcast::Sender<BatchEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers, 0 when nobody listens.
    pub fn publish(&self, event: BatchEvent) -> usize {
        tracing::trace!("Publishing batch event: {}", event.description());
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
