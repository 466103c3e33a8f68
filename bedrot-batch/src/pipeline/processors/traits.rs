//! Processor trait and related types.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::pipeline::job_queue::{Job, JobSpec};
use crate::pipeline::progress::ProgressReporter;
use crate::{Error, Result};

/// Everything a processor needs to run one job.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub name: Option<String>,
    pub spec: JobSpec,
    /// Fires when the job is cancelled or the pool stops without waiting.
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

impl JobContext {
    pub fn new(job: &Job, cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            spec: job.spec.clone(),
            cancel,
            progress,
        }
    }

    /// A context whose updates go nowhere and which is never cancelled.
    pub fn detached(job: &Job) -> Self {
        Self::new(job, CancellationToken::new(), ProgressReporter::noop(&job.id))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stage boundary check.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Output from a processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorOutput {
    /// Final output files.
    pub outputs: Vec<PathBuf>,
    /// Processing duration in seconds.
    pub duration_secs: f64,
    /// Intermediate files kept for the caller (e.g. generated subtitles).
    pub items_produced: Vec<PathBuf>,
}

/// Trait for pipeline processors.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Get the job types this processor can handle.
    fn job_types(&self) -> Vec<&'static str>;

    /// Check if this processor can handle a job type.
    fn can_process(&self, job_type: &str) -> bool {
        self.job_types().contains(&job_type)
    }

    /// Run the job.
    ///
    /// Progress and finished artifacts are reported through
    /// `ctx.progress`. Implementations check `ctx.cancel` between stages and
    /// return [`Error::Cancelled`] once they observe it; any external process
    /// they started must be gone by then.
    async fn process(&self, ctx: &JobContext) -> Result<ProcessorOutput>;

    /// Get the processor name.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Processor for Noop {
        fn job_types(&self) -> Vec<&'static str> {
            vec!["noop", "other"]
        }

        async fn process(&self, _ctx: &JobContext) -> Result<ProcessorOutput> {
            Ok(ProcessorOutput::default())
        }

        fn name(&self) -> &'static str {
            "Noop"
        }
    }

    #[test]
    fn test_can_process() {
        assert!(Noop.can_process("noop"));
        assert!(Noop.can_process("other"));
        assert!(!Noop.can_process("slideshow"));
    }

    #[test]
    fn test_context_cancellation() {
        let job = Job::new(JobSpec::custom("noop")).with_name("ctx");
        let ctx = JobContext::detached(&job);
        assert_eq!(ctx.job_id, job.id);
        assert_eq!(ctx.name.as_deref(), Some("ctx"));
        assert!(ctx.check_cancelled().is_ok());

        ctx.cancel.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check_cancelled(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_processor_output_default() {
        let output = ProcessorOutput::default();
        assert!(output.outputs.is_empty());
        assert_eq!(output.duration_secs, 0.0);
        assert!(output.items_produced.is_empty());
    }
}
