use anyhow::Context;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use bedrot_batch::config::BatchConfig;
use bedrot_batch::logging::{LOG_RETENTION_DAYS, cleanup_old_logs, init_logging};
use bedrot_batch::pipeline::{BatchEvent, Job, JobQueue, JobSpec, JobStatus, WorkerPool};

/// One entry of the jobs file.
#[derive(Debug, Deserialize)]
struct JobRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(flatten)]
    spec: JobSpec,
}

impl From<JobRequest> for Job {
    fn from(request: JobRequest) -> Self {
        let job = Job::new(request.spec).with_priority(request.priority);
        match request.name {
            Some(name) => job.with_name(name),
            None => job,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = BatchConfig::from_env()?;
    let (_logging, _guard) = init_logging(&config)?;

    if let Some(dir) = &config.log_dir
        && let Err(e) = cleanup_old_logs(dir, LOG_RETENTION_DAYS).await
    {
        warn!("Failed to clean up old logs: {}", e);
    }

    let jobs_path = std::env::args()
        .nth(1)
        .context("usage: bedrot-batch <jobs.json>")?;
    let content = tokio::fs::read_to_string(&jobs_path)
        .await
        .with_context(|| format!("Failed to read jobs file {}", jobs_path))?;
    let requests: Vec<JobRequest> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid jobs file {}", jobs_path))?;

    if requests.is_empty() {
        info!("No jobs in {}", jobs_path);
        return Ok(());
    }

    let queue = Arc::new(JobQueue::new());
    let pool = WorkerPool::with_default_processors(queue.clone(), &config)?;
    let mut events = pool.subscribe();

    for request in requests {
        let id = pool.submit(request.into())?;
        debug!("Queued job {}", id);
    }

    info!(
        "Starting batch of {} job(s) with {} worker(s)",
        queue.len(),
        pool.max_workers()
    );
    pool.start();

    let all_finished = |queue: &JobQueue| queue.get_all_jobs(None).iter().all(|j| j.is_terminal());

    loop {
        if all_finished(&queue) {
            break;
        }

        tokio::select! {
            event = events.recv() => match event {
                Ok(BatchEvent::JobProgress { .. }) | Ok(BatchEvent::QueueChanged) => {}
                Ok(BatchEvent::JobFailed { job_id, error: reason }) => {
                    error!("Job {} failed: {}", job_id, reason);
                }
                Ok(event) => info!("{}", event.description()),
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} event(s)", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling running jobs");
                pool.stop(false).await;
                break;
            }
        }

        // A halted pool never claims the remaining jobs.
        if pool.is_halted() && pool.get_active_worker_count() == 0 {
            warn!("Stopping after a failed job");
            break;
        }
    }

    pool.stop(true).await;

    let stats = pool.get_statistics();
    info!(
        "Batch finished: {} completed, {} failed, {} cancelled, {} artifact(s)",
        stats.total_completed,
        stats.total_failed,
        stats.total_cancelled,
        stats.total_artifacts_generated
    );
    for job in queue.get_all_jobs(Some(JobStatus::Completed)) {
        for artifact in &job.completed_artifacts {
            info!("{}: {}", job.display_name(), artifact.display());
        }
    }

    if stats.total_failed > 0 {
        anyhow::bail!("{} job(s) failed", stats.total_failed);
    }
    Ok(())
}
