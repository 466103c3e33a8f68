//! Caption processor.
//!
//! Two stages: obtain subtitles for an audio file (supplied, paired from an
//! earlier run, or transcribed), then render them over a plain background
//! together with the audio.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::traits::{JobContext, Processor, ProcessorOutput};
use super::utils::{ensure_output_dir, file_stem, has_extension};
use crate::encoder::command::{CaptionStyle, audio_to_mp3_args, caption_args};
use crate::encoder::{EncodeJob, Encoder};
use crate::pairing::{FileIdentity, PairingSource, PairingStore};
use crate::pipeline::job_queue::JobSpec;
use crate::transcription::subtitles::{MAX_SEGMENT_SECS, transform_srt, words_to_segments, write_srt};
use crate::transcription::Transcriber;
use crate::{Error, Result};

/// Audio formats the transcription stage accepts; all but mp3 are converted first.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "flac", "aac"];

pub const MAX_WORDS_PER_SEGMENT: usize = 20;

// Share of the job's progress taken by each step.
const CONVERT_END: f64 = 10.0;
const SUBTITLES_END: f64 = 40.0;

/// Configuration of a caption job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionSpec {
    pub audio_path: PathBuf,
    /// Use this subtitle file instead of looking one up or transcribing.
    #[serde(default)]
    pub subtitle_path: Option<PathBuf>,
    pub output_folder: PathBuf,
    /// Where generated subtitles go; defaults to the engine's transcript
    /// folder, then the output folder.
    #[serde(default)]
    pub transcript_folder: Option<PathBuf>,
    #[serde(default = "default_max_words")]
    pub max_words_per_segment: usize,
    #[serde(default = "default_language_code")]
    pub language_code: String,
    #[serde(default)]
    pub style: CaptionStyle,
}

fn default_max_words() -> usize {
    8
}

fn default_language_code() -> String {
    "eng".to_string()
}

impl CaptionSpec {
    pub fn new(audio_path: impl Into<PathBuf>, output_folder: impl Into<PathBuf>) -> Self {
        Self {
            audio_path: audio_path.into(),
            subtitle_path: None,
            output_folder: output_folder.into(),
            transcript_folder: None,
            max_words_per_segment: default_max_words(),
            language_code: default_language_code(),
            style: CaptionStyle::default(),
        }
    }

    pub fn with_subtitles(mut self, path: impl Into<PathBuf>) -> Self {
        self.subtitle_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_WORDS_PER_SEGMENT).contains(&self.max_words_per_segment) {
            return Err(Error::validation(format!(
                "Max words per segment must be between 1 and {}, got {}",
                MAX_WORDS_PER_SEGMENT, self.max_words_per_segment
            )));
        }
        if self.style.width == 0 || self.style.height == 0 || self.style.fps == 0 {
            return Err(Error::validation("Caption resolution and fps must be positive"));
        }
        Ok(())
    }
}

/// Subtitles resolved by stage one.
#[derive(Debug)]
struct SubtitleSource {
    path: PathBuf,
    /// Produced by this job rather than supplied or reused.
    generated: bool,
}

/// Processor for caption jobs.
pub struct CaptionProcessor {
    encoder: Arc<dyn Encoder>,
    transcriber: Arc<dyn Transcriber>,
    pairings: Arc<dyn PairingStore>,
    transcript_dir: Option<PathBuf>,
}

impl CaptionProcessor {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        transcriber: Arc<dyn Transcriber>,
        pairings: Arc<dyn PairingStore>,
    ) -> Self {
        Self {
            encoder,
            transcriber,
            pairings,
            transcript_dir: None,
        }
    }

    pub fn with_transcript_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.transcript_dir = dir;
        self
    }

    fn transcript_folder(&self, spec: &CaptionSpec) -> PathBuf {
        spec.transcript_folder
            .clone()
            .or_else(|| self.transcript_dir.clone())
            .unwrap_or_else(|| spec.output_folder.clone())
    }

    async fn resolve_subtitles(&self, ctx: &JobContext, spec: &CaptionSpec) -> Result<SubtitleSource> {
        ctx.check_cancelled()?;

        if let Some(path) = &spec.subtitle_path {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(Error::missing_file("Subtitle file", path));
            }
            let identity = FileIdentity::of(&spec.audio_path).await;
            if let Err(e) = self
                .pairings
                .record(&identity, path, PairingSource::UserProvided)
                .await
            {
                warn!(job_id = %ctx.job_id, "Failed to record pairing: {}", e);
            }
            return Ok(SubtitleSource {
                path: path.clone(),
                generated: false,
            });
        }

        let identity = FileIdentity::of(&spec.audio_path).await;
        if let Some(path) = self.pairings.find(&identity).await {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                info!(job_id = %ctx.job_id, "Reusing paired subtitles {}", path.display());
                return Ok(SubtitleSource {
                    path,
                    generated: false,
                });
            }
            debug!(job_id = %ctx.job_id, "Paired subtitles {} no longer exist", path.display());
        }

        let path = self.transcribe(ctx, spec).await?;
        if let Err(e) = self
            .pairings
            .record(&identity, &path, PairingSource::AutoTranscribed)
            .await
        {
            warn!(job_id = %ctx.job_id, "Failed to record pairing: {}", e);
        }
        Ok(SubtitleSource {
            path,
            generated: true,
        })
    }

    async fn transcribe(&self, ctx: &JobContext, spec: &CaptionSpec) -> Result<PathBuf> {
        let audio = &spec.audio_path;
        if !AUDIO_EXTENSIONS.iter().any(|ext| has_extension(audio, ext)) {
            return Err(Error::validation(format!(
                "Unsupported audio format: {}",
                audio.display()
            )));
        }

        // Converted audio lives in a scratch folder dropped after transcription.
        let scratch = tempfile::Builder::new().prefix("bedrot-audio-").tempdir()?;
        let upload = if has_extension(audio, "mp3") {
            audio.clone()
        } else {
            ctx.progress.progress_with_item(0.0, "Converting audio");
            let mp3 = scratch
                .path()
                .join(format!("{}.mp3", file_stem(audio, "audio")));
            let job = EncodeJob {
                label: "audio conversion".to_string(),
                args: audio_to_mp3_args(audio, &mp3),
                output: mp3.clone(),
                expected_duration: None,
            };
            let reporter = ctx.progress.clone();
            let on_progress = move |f: f64| reporter.progress(f * CONVERT_END);
            self.encoder.encode(&job, &ctx.cancel, &on_progress).await?;
            mp3
        };

        ctx.check_cancelled()?;
        ctx.progress.progress_with_item(CONVERT_END, "Transcribing");
        let words = self
            .transcriber
            .transcribe(&upload, &spec.language_code, &ctx.cancel)
            .await?;
        drop(scratch);

        let segments = words_to_segments(&words, spec.max_words_per_segment, MAX_SEGMENT_SECS);
        if segments.is_empty() {
            return Err(Error::external(
                "transcription",
                None,
                format!("no speech found in {}", audio.display()),
            ));
        }

        let srt = self
            .transcript_folder(spec)
            .join(format!("{}.srt", file_stem(audio, "audio")));
        write_srt(&srt, &segments).await?;
        info!(
            job_id = %ctx.job_id,
            "Wrote {} subtitle segments to {}",
            segments.len(),
            srt.display()
        );
        Ok(srt)
    }

    async fn render(&self, ctx: &JobContext, spec: &CaptionSpec, subtitles: &Path) -> Result<PathBuf> {
        ctx.check_cancelled()?;
        ctx.progress.progress_with_item(SUBTITLES_END, "Rendering captions");

        let transformed = if spec.style.needs_text_transform() {
            let content = tokio::fs::read_to_string(subtitles).await?;
            let file = tempfile::Builder::new()
                .prefix("bedrot-captions-")
                .suffix(".srt")
                .tempfile()?;
            tokio::fs::write(
                file.path(),
                transform_srt(&content, spec.style.all_caps, spec.style.strip_punctuation),
            )
            .await?;
            Some(file)
        } else {
            None
        };
        let source = transformed.as_ref().map_or(subtitles, |f| f.path());

        ensure_output_dir(&spec.output_folder).await?;
        let output = spec.output_folder.join(format!(
            "{}_captions.{}",
            file_stem(&spec.audio_path, "audio"),
            spec.style.output_extension()
        ));

        let job = EncodeJob {
            label: "caption render".to_string(),
            args: caption_args(source, &spec.audio_path, &output, &spec.style),
            output: output.clone(),
            expected_duration: None,
        };
        let reporter = ctx.progress.clone();
        let on_progress = move |f: f64| {
            reporter.progress(SUBTITLES_END + f * (100.0 - SUBTITLES_END));
        };

        // A failed render is reported as is; only transcription retries.
        self.encoder.encode(&job, &ctx.cancel, &on_progress).await?;

        Ok(output)
    }
}

#[async_trait]
impl Processor for CaptionProcessor {
    fn job_types(&self) -> Vec<&'static str> {
        vec![JobSpec::CAPTION]
    }

    async fn process(&self, ctx: &JobContext) -> Result<ProcessorOutput> {
        let start = Instant::now();
        let JobSpec::Caption(spec) = &ctx.spec else {
            return Err(Error::validation(format!(
                "Caption processor cannot run {} jobs",
                ctx.spec.kind()
            )));
        };

        spec.validate()?;
        if !tokio::fs::try_exists(&spec.audio_path).await.unwrap_or(false) {
            return Err(Error::missing_file("Audio file", &spec.audio_path));
        }

        let subtitles = self.resolve_subtitles(ctx, spec).await?;
        let mut items_produced = Vec::new();
        if subtitles.generated {
            // Reported before rendering so a render failure still leaves it visible.
            ctx.progress.artifact(&subtitles.path);
            items_produced.push(subtitles.path.clone());
        }
        ctx.progress.progress(SUBTITLES_END);

        let output = self.render(ctx, spec, &subtitles.path).await?;
        ctx.progress.artifact(&output);

        let duration = start.elapsed().as_secs_f64();
        info!(
            job_id = %ctx.job_id,
            "Rendered {} in {:.2}s",
            output.display(),
            duration
        );

        Ok(ProcessorOutput {
            outputs: vec![output],
            duration_secs: duration,
            items_produced,
        })
    }

    fn name(&self) -> &'static str {
        "CaptionProcessor"
    }
}
