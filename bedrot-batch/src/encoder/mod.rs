//! External video encoder.
//!
//! Pipelines describe an invocation as an [`EncodeJob`]; the [`Encoder`] runs
//! it, streams progress, and maps the process result onto the error taxonomy.

pub mod command;
pub mod ffmpeg_parser;

use async_trait::async_trait;
use process_utils::{RunOutcome, run_cancellable, tokio_command};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::BatchConfig;
use crate::{Error, Result};

use ffmpeg_parser::{parse_duration_header, parse_progress};

/// One encoder invocation.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    /// Short description for logs.
    pub label: String,
    /// Job-specific arguments, output path last.
    pub args: Vec<String>,
    /// The file the invocation must produce.
    pub output: PathBuf,
    /// Expected output length; when unknown the first input duration is used.
    pub expected_duration: Option<f64>,
}

/// Runs encode jobs.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Run `job` to completion.
    ///
    /// `on_progress` receives the encoded fraction (0 to 1). Fails with
    /// `Cancelled` when `cancel` fires, after the process has been killed.
    async fn encode(
        &self,
        job: &EncodeJob,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<()>;
}

/// [`Encoder`] backed by the ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
    tail_lines: usize,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            tail_lines: 10,
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.ffmpeg_path.clone()).with_tail_lines(config.stderr_tail_lines)
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

async fn remove_partial_output(job: &EncodeJob) {
    if tokio::fs::try_exists(&job.output).await.unwrap_or(false) {
        match tokio::fs::remove_file(&job.output).await {
            Ok(()) => debug!("Removed partial output {}", job.output.display()),
            Err(e) => warn!(
                "Failed to remove partial output {}: {}",
                job.output.display(),
                e
            ),
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        job: &EncodeJob,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<()> {
        let mut cmd = tokio_command(&self.program);
        cmd.args(["-hide_banner", "-nostdin", "-y"]).args(&job.args);

        debug!("Running ffmpeg for {}: {:?}", job.label, job.args);

        let mut duration = job.expected_duration;
        let outcome = run_cancellable(cmd, cancel, self.tail_lines, |line| {
            trace!("ffmpeg: {}", line);
            if duration.is_none() {
                duration = parse_duration_header(line);
                return;
            }
            if let Some(progress) = parse_progress(line)
                && let Some(fraction) = duration.and_then(|total| progress.fraction_of(total))
            {
                on_progress(fraction);
            }
        })
        .await;

        match outcome {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::config(format!(
                "Encoder binary not found: {}",
                self.program
            ))),
            Err(e) => Err(Error::Io(e)),
            Ok(RunOutcome::Cancelled) => {
                remove_partial_output(job).await;
                Err(Error::Cancelled)
            }
            Ok(RunOutcome::Exited {
                code: Some(0), ..
            }) => {
                if tokio::fs::try_exists(&job.output).await.unwrap_or(false) {
                    on_progress(1.0);
                    Ok(())
                } else {
                    Err(Error::external(
                        "ffmpeg",
                        Some(0),
                        format!(
                            "exited successfully but produced no output file: {}",
                            job.output.display()
                        ),
                    ))
                }
            }
            Ok(RunOutcome::Exited { code, stderr_tail }) => {
                remove_partial_output(job).await;
                let detail = if stderr_tail.is_empty() {
                    "no error output".to_string()
                } else {
                    stderr_tail.join("\n")
                };
                Err(Error::external("ffmpeg", code, detail))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records jobs and writes their output file; the first `failures` calls fail.
    #[derive(Default)]
    pub(crate) struct FakeEncoder {
        pub calls: AtomicU32,
        pub failures: u32,
        pub jobs: Mutex<Vec<EncodeJob>>,
    }

    impl FakeEncoder {
        pub fn failing(failures: u32) -> Self {
            Self {
                failures,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn encode(
            &self,
            job: &EncodeJob,
            _cancel: &CancellationToken,
            on_progress: &(dyn Fn(f64) + Send + Sync),
        ) -> Result<()> {
            self.jobs.lock().push(job.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::external("ffmpeg", Some(1), "Conversion failed!"));
            }
            on_progress(0.5);
            tokio::fs::write(&job.output, b"media").await?;
            on_progress(1.0);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn job(output: PathBuf) -> EncodeJob {
        EncodeJob {
            label: "test".to_string(),
            args: vec![],
            output,
            expected_duration: Some(10.0),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let encoder = FfmpegEncoder::new("definitely-not-ffmpeg");
        let err = encoder
            .encode(
                &job(PathBuf::from("/tmp/none.mp4")),
                &CancellationToken::new(),
                &|_: f64| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    /// Writes an executable shell script standing in for ffmpeg.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ffmpeg(
            dir.path(),
            "echo 'line one' >&2\necho 'Conversion failed!' >&2\nexit 1",
        );
        let encoder = FfmpegEncoder::new(program).with_tail_lines(1);

        let err = encoder
            .encode(
                &job(dir.path().join("out.mp4")),
                &CancellationToken::new(),
                &|_: f64| {},
            )
            .await
            .unwrap_err();

        match err {
            Error::ExternalTool { tool, code, detail } => {
                assert_eq!(tool, "ffmpeg");
                assert_eq!(code, Some(1));
                assert_eq!(detail, "Conversion failed!");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_without_output_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ffmpeg(dir.path(), "exit 0");
        let encoder = FfmpegEncoder::new(program);

        let err = encoder
            .encode(
                &job(dir.path().join("out.mp4")),
                &CancellationToken::new(),
                &|_: f64| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalTool { code: Some(0), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_progress_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        // The output path is the last argument.
        let program = fake_ffmpeg(
            dir.path(),
            "printf 'frame=10 size=1kB time=00:00:05.00 speed=1x\\r' >&2\nfor last; do :; done\ntouch \"$last\"",
        );
        let encoder = FfmpegEncoder::new(program);
        let mut encode_job = job(output.clone());
        encode_job.args = vec![output.to_string_lossy().into_owned()];

        let seen = Mutex::new(Vec::new());
        encoder
            .encode(&encode_job, &CancellationToken::new(), &|f: f64| {
                seen.lock().push(f)
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![0.5, 1.0]);
        assert!(output.exists());
    }
}
