//! Batch pipeline: the job queue, the worker pool and the job processors.
//!
//! - [`JobQueue`] holds every job and enforces status transitions
//! - [`WorkerPool`] claims pending jobs up to a concurrency ceiling
//! - processors render slideshows and captioned videos
//! - [`EventBroadcaster`] fans lifecycle events out to observers

mod events;
mod job_queue;
pub mod processors;
mod progress;
mod worker_pool;

pub use events::{BatchEvent, EventBroadcaster};
pub use job_queue::{Job, JobQueue, JobSpec, JobStatus, JobUpdate, QueueStats};
pub use processors::{
    CaptionProcessor, CaptionSpec, JobContext, Processor, ProcessorOutput, SlideshowProcessor,
    SlideshowSpec,
};
pub use progress::{PipelineUpdate, ProgressReporter, artifact_progress};
pub use worker_pool::{PoolStatistics, RunState, WorkerPool};
