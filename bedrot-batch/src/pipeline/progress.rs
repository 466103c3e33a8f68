use std::path::PathBuf;
use tokio::sync::mpsc;

/// Update sent from a running pipeline to the worker pool.
///
/// Pipelines never touch the queue; the pool applies these updates.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineUpdate {
    Progress {
        percent: f64,
        current_item: Option<String>,
    },
    Artifact(PathBuf),
}

#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    tx: mpsc::UnboundedSender<PipelineUpdate>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, tx: mpsc::UnboundedSender<PipelineUpdate>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    pub fn noop(job_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel::<PipelineUpdate>();
        Self::new(job_id, tx)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn progress(&self, percent: f64) {
        self.send(PipelineUpdate::Progress {
            percent,
            current_item: None,
        });
    }

    pub fn progress_with_item(&self, percent: f64, item: impl Into<String>) {
        self.send(PipelineUpdate::Progress {
            percent,
            current_item: Some(item.into()),
        });
    }

    /// Report a finished output file.
    pub fn artifact(&self, path: impl Into<PathBuf>) {
        self.send(PipelineUpdate::Artifact(path.into()));
    }

    fn send(&self, update: PipelineUpdate) {
        // The receiver is gone once the pool has recorded the job's outcome.
        let _ = self.tx.send(update);
    }
}

/// Overall progress of a job producing `total` artifacts.
///
/// `fraction` is the progress of the artifact currently in flight (0 to 1).
pub fn artifact_progress(completed: usize, fraction: f64, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let fraction = fraction.clamp(0.0, 1.0);
    ((completed as f64 + fraction) / total as f64 * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_sends_updates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new("job-1", tx);

        reporter.progress_with_item(12.5, "Video 1 of 4");
        reporter.artifact("/out/a.mp4");

        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineUpdate::Progress {
                percent: 12.5,
                current_item: Some("Video 1 of 4".to_string()),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineUpdate::Artifact(PathBuf::from("/out/a.mp4"))
        );
    }

    #[test]
    fn test_noop_reporter_does_not_panic() {
        let reporter = ProgressReporter::noop("job-1");
        reporter.progress(50.0);
        assert_eq!(reporter.job_id(), "job-1");
    }

    #[test]
    fn test_artifact_progress() {
        assert_eq!(artifact_progress(0, 0.0, 4), 0.0);
        assert_eq!(artifact_progress(1, 0.0, 4), 25.0);
        assert_eq!(artifact_progress(1, 0.5, 4), 37.5);
        assert_eq!(artifact_progress(4, 0.0, 4), 100.0);
        assert_eq!(artifact_progress(3, 7.0, 4), 100.0);
        assert_eq!(artifact_progress(0, 0.0, 0), 100.0);
    }
}
