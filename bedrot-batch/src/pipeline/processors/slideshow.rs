//! Slideshow processor: renders N randomised image slideshows.

use async_trait::async_trait;
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::traits::{JobContext, Processor, ProcessorOutput};
use super::utils::{ensure_output_dir, list_images, safe_name, timestamp_tag};
use crate::encoder::command::{AspectRatio, VideoQuality, concat_list, slideshow_args};
use crate::encoder::{EncodeJob, Encoder};
use crate::pipeline::job_queue::JobSpec;
use crate::pipeline::progress::artifact_progress;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::{Error, Result};

/// Shortest time a single image is shown.
const MIN_IMAGE_SECS: f64 = 0.05;

/// Configuration of a slideshow job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideshowSpec {
    pub image_folder: PathBuf,
    pub output_folder: PathBuf,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default = "default_num_videos")]
    pub num_videos: u32,
    /// Total video length in seconds, chosen uniformly per video.
    #[serde(default = "default_duration_range")]
    pub duration_range: (f64, f64),
    /// Time each image is shown, chosen uniformly per video.
    #[serde(default = "default_image_duration_range")]
    pub image_duration_range: (f64, f64),
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub quality: VideoQuality,
}

fn default_num_videos() -> u32 {
    1
}

fn default_duration_range() -> (f64, f64) {
    (12.0, 17.8)
}

fn default_image_duration_range() -> (f64, f64) {
    (0.05, 0.45)
}

fn default_fps() -> u32 {
    30
}

/// Longest video a slideshow job may request, in seconds.
pub const MAX_VIDEO_SECS: f64 = 3600.0;

impl SlideshowSpec {
    pub fn new(image_folder: impl Into<PathBuf>, output_folder: impl Into<PathBuf>) -> Self {
        Self {
            image_folder: image_folder.into(),
            output_folder: output_folder.into(),
            aspect_ratio: AspectRatio::default(),
            num_videos: default_num_videos(),
            duration_range: default_duration_range(),
            image_duration_range: default_image_duration_range(),
            fps: default_fps(),
            quality: VideoQuality::default(),
        }
    }

    /// Parameter checks that need no filesystem access.
    pub fn validate(&self) -> Result<()> {
        if self.num_videos == 0 {
            return Err(Error::validation("Number of videos must be at least 1"));
        }
        check_range("Duration", self.duration_range)?;
        if self.duration_range.1 > MAX_VIDEO_SECS {
            return Err(Error::validation(format!(
                "Duration maximum ({}) exceeds {} seconds",
                self.duration_range.1, MAX_VIDEO_SECS
            )));
        }
        check_range("Image duration", self.image_duration_range)?;
        if self.fps == 0 {
            return Err(Error::validation("FPS must be at least 1"));
        }
        Ok(())
    }
}

fn check_range(what: &str, (min, max): (f64, f64)) -> Result<()> {
    if !min.is_finite() || !max.is_finite() || min <= 0.0 {
        return Err(Error::validation(format!(
            "{} range must be positive: {} to {}",
            what, min, max
        )));
    }
    if min > max {
        return Err(Error::validation(format!(
            "{} range minimum ({}) exceeds maximum ({})",
            what, min, max
        )));
    }
    Ok(())
}

/// Randomised parameters of one video.
#[derive(Debug, Clone, PartialEq)]
struct VideoPlan {
    total_secs: f64,
    per_image: f64,
    images: Vec<PathBuf>,
}

fn plan_video<R: Rng + ?Sized>(rng: &mut R, spec: &SlideshowSpec, images: &[PathBuf]) -> VideoPlan {
    let (min, max) = spec.duration_range;
    let total_secs = rng.random_range(min..=max);
    let (min, max) = spec.image_duration_range;
    let per_image = rng.random_range(min..=max).max(MIN_IMAGE_SECS);
    let count = ((total_secs / per_image).ceil() as usize).max(1);

    let mut picked: Vec<PathBuf> = if images.len() >= count {
        images.choose_multiple(rng, count).cloned().collect()
    } else {
        (0..count).filter_map(|_| images.choose(rng).cloned()).collect()
    };
    picked.shuffle(rng);

    VideoPlan {
        total_secs,
        per_image,
        images: picked,
    }
}

/// Processor for slideshow jobs.
pub struct SlideshowProcessor {
    encoder: Arc<dyn Encoder>,
    retry: RetryPolicy,
}

impl SlideshowProcessor {
    pub fn new(encoder: Arc<dyn Encoder>, retry: RetryPolicy) -> Self {
        Self { encoder, retry }
    }

    #[allow(clippy::too_many_arguments)]
    async fn render(
        &self,
        ctx: &JobContext,
        spec: &SlideshowSpec,
        plan: &VideoPlan,
        output: &Path,
        index: usize,
        total: usize,
        label: &str,
    ) -> Result<()> {
        let concat = tempfile::Builder::new()
            .prefix("bedrot-slideshow-")
            .suffix(".txt")
            .tempfile()?;
        tokio::fs::write(concat.path(), concat_list(&plan.images, plan.per_image)).await?;

        let job = EncodeJob {
            label: label.to_string(),
            args: slideshow_args(
                concat.path(),
                output,
                spec.aspect_ratio,
                spec.fps,
                spec.quality,
                plan.total_secs,
            ),
            output: output.to_path_buf(),
            expected_duration: Some(plan.total_secs),
        };

        let reporter = ctx.progress.clone();
        let item = label.to_string();
        let on_progress = move |fraction: f64| {
            reporter.progress_with_item(artifact_progress(index, fraction, total), &item);
        };

        retry_with_backoff(label, self.retry, &ctx.cancel, Error::is_retryable, |_| {
            self.encoder.encode(&job, &ctx.cancel, &on_progress)
        })
        .await
    }
}

#[async_trait]
impl Processor for SlideshowProcessor {
    fn job_types(&self) -> Vec<&'static str> {
        vec![JobSpec::SLIDESHOW]
    }

    async fn process(&self, ctx: &JobContext) -> Result<ProcessorOutput> {
        let start = Instant::now();
        let JobSpec::Slideshow(spec) = &ctx.spec else {
            return Err(Error::validation(format!(
                "Slideshow processor cannot run {} jobs",
                ctx.spec.kind()
            )));
        };

        spec.validate()?;
        let images = list_images(&spec.image_folder).await?;
        if images.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No images found in {}", spec.image_folder.display()),
            )));
        }
        ensure_output_dir(&spec.output_folder).await?;

        let prefix = ctx
            .name
            .as_deref()
            .map(safe_name)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "slideshow".to_string());
        let total = spec.num_videos as usize;

        info!(
            job_id = %ctx.job_id,
            "Rendering {} slideshow(s) from {} images in {}",
            total,
            images.len(),
            spec.image_folder.display()
        );

        let mut outputs = Vec::with_capacity(total);
        for index in 0..total {
            ctx.check_cancelled()?;

            let label = format!("Video {} of {}", index + 1, total);
            ctx.progress
                .progress_with_item(artifact_progress(index, 0.0, total), &label);

            let plan = {
                let mut rng = rand::rng();
                plan_video(&mut rng, spec, &images)
            };
            let output = spec.output_folder.join(format!(
                "{}_{}_{:03}_{}.mp4",
                prefix,
                spec.aspect_ratio.file_tag(),
                index + 1,
                timestamp_tag()
            ));
            debug!(
                job_id = %ctx.job_id,
                "{}: {:.2}s, {} images at {:.3}s",
                label,
                plan.total_secs,
                plan.images.len(),
                plan.per_image
            );

            self.render(ctx, spec, &plan, &output, index, total, &label)
                .await?;

            ctx.progress.artifact(&output);
            ctx.progress
                .progress_with_item(artifact_progress(index + 1, 0.0, total), &label);
            outputs.push(output);
        }

        let duration = start.elapsed().as_secs_f64();
        info!(
            job_id = %ctx.job_id,
            "Rendered {} slideshow(s) in {:.2}s",
            outputs.len(),
            duration
        );

        Ok(ProcessorOutput {
            outputs,
            duration_secs: duration,
            items_produced: vec![],
        })
    }

    fn name(&self) -> &'static str {
        "SlideshowProcessor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::FakeEncoder;
    use crate::pipeline::job_queue::Job;
    use crate::pipeline::progress::{PipelineUpdate, ProgressReporter};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts).with_delays(Duration::from_millis(1), Duration::from_millis(2))
    }

    fn image_dir(count: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..count {
            std::fs::write(dir.path().join(format!("img{i}.jpg")), b"jpg").unwrap();
        }
        dir
    }

    fn context(
        spec: SlideshowSpec,
        name: Option<&str>,
    ) -> (JobContext, mpsc::UnboundedReceiver<PipelineUpdate>) {
        let mut job = Job::new(JobSpec::Slideshow(spec));
        if let Some(name) = name {
            job = job.with_name(name);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = JobContext::new(&job, CancellationToken::new(), ProgressReporter::new(&job.id, tx));
        (ctx, rx)
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let mut spec = SlideshowSpec::new("/in", "/out");
        assert!(spec.validate().is_ok());

        spec.num_videos = 0;
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));

        let mut spec = SlideshowSpec::new("/in", "/out");
        spec.duration_range = (20.0, 10.0);
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));

        let mut spec = SlideshowSpec::new("/in", "/out");
        spec.image_duration_range = (0.0, 0.4);
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_caps_video_length() {
        let mut spec = SlideshowSpec::new("/in", "/out");
        spec.duration_range = (10.0, MAX_VIDEO_SECS);
        assert!(spec.validate().is_ok());

        spec.duration_range = (10.0, 1e12);
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: SlideshowSpec =
            serde_json::from_str(r#"{"image_folder":"/in","output_folder":"/out","aspect_ratio":"9:16"}"#)
                .unwrap();
        assert_eq!(spec.aspect_ratio, AspectRatio::Portrait);
        assert_eq!(spec.num_videos, 1);
        assert_eq!(spec.duration_range, (12.0, 17.8));
        assert_eq!(spec.fps, 30);
    }

    #[test]
    fn test_plan_covers_duration() {
        let images: Vec<PathBuf> = (0..500).map(|i| PathBuf::from(format!("/img/{i}.jpg"))).collect();
        let spec = SlideshowSpec::new("/img", "/out");
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..20 {
            let plan = plan_video(&mut rng, &spec, &images);
            assert!((12.0..=17.8).contains(&plan.total_secs));
            assert!((0.05..=0.45).contains(&plan.per_image));
            assert!(plan.images.len() as f64 * plan.per_image >= plan.total_secs - 1e-9);

            let mut unique = plan.images.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), plan.images.len());
        }
    }

    #[test]
    fn test_plan_reuses_images_when_short() {
        let images = vec![PathBuf::from("/img/only.jpg")];
        let mut spec = SlideshowSpec::new("/img", "/out");
        spec.duration_range = (2.0, 2.0);
        spec.image_duration_range = (0.5, 0.5);
        let plan = plan_video(&mut StdRng::seed_from_u64(1), &spec, &images);
        assert_eq!(plan.images.len(), 4);
        assert!(plan.images.iter().all(|p| p == &images[0]));
    }

    #[tokio::test]
    async fn test_renders_each_video_and_reports_progress() {
        let images = image_dir(3);
        let out = tempfile::tempdir().unwrap();
        let mut spec = SlideshowSpec::new(images.path(), out.path());
        spec.num_videos = 2;

        let encoder = Arc::new(FakeEncoder::default());
        let processor = SlideshowProcessor::new(encoder.clone(), fast_retry(1));
        let (ctx, mut rx) = context(spec, Some("My Batch!"));

        let output = processor.process(&ctx).await.unwrap();
        assert_eq!(output.outputs.len(), 2);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
        for (i, path) in output.outputs.iter().enumerate() {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(&format!("My_Batch_16x9_{:03}_", i + 1)), "{name}");
            assert!(name.ends_with(".mp4"));
            assert!(path.exists());
        }

        drop(ctx);
        let mut artifacts = Vec::new();
        let mut last_percent = 0.0;
        while let Ok(update) = rx.try_recv() {
            match update {
                PipelineUpdate::Progress { percent, .. } => {
                    assert!(percent >= last_percent);
                    last_percent = percent;
                }
                PipelineUpdate::Artifact(path) => artifacts.push(path),
            }
        }
        assert_eq!(artifacts, output.outputs);
        assert_eq!(last_percent, 100.0);
    }

    #[tokio::test]
    async fn test_render_failure_is_retried() {
        let images = image_dir(2);
        let out = tempfile::tempdir().unwrap();
        let spec = SlideshowSpec::new(images.path(), out.path());

        let encoder = Arc::new(FakeEncoder::failing(2));
        let processor = SlideshowProcessor::new(encoder.clone(), fast_retry(3));
        let (ctx, _rx) = context(spec, None);

        let output = processor.process(&ctx).await.unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 3);
        let name = output.outputs[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("slideshow_16x9_001_"));
    }

    #[tokio::test]
    async fn test_render_gives_up_after_attempts() {
        let images = image_dir(2);
        let out = tempfile::tempdir().unwrap();
        let spec = SlideshowSpec::new(images.path(), out.path());

        let encoder = Arc::new(FakeEncoder::failing(u32::MAX));
        let processor = SlideshowProcessor::new(encoder.clone(), fast_retry(2));
        let (ctx, _rx) = context(spec, None);

        let err = processor.process(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_or_empty_image_folder_is_io_error() {
        let out = tempfile::tempdir().unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        let processor = SlideshowProcessor::new(encoder.clone(), fast_retry(1));

        let (ctx, _rx) = context(SlideshowSpec::new("/nonexistent/images", out.path()), None);
        assert!(matches!(processor.process(&ctx).await, Err(Error::Io(_))));

        let empty = image_dir(0);
        let (ctx, _rx) = context(SlideshowSpec::new(empty.path(), out.path()), None);
        assert!(matches!(processor.process(&ctx).await, Err(Error::Io(_))));
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_video() {
        let images = image_dir(2);
        let out = tempfile::tempdir().unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        let processor = SlideshowProcessor::new(encoder.clone(), fast_retry(1));
        let (ctx, _rx) = context(SlideshowSpec::new(images.path(), out.path()), None);

        ctx.cancel.cancel();
        assert!(matches!(processor.process(&ctx).await, Err(Error::Cancelled)));
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
    }
}
