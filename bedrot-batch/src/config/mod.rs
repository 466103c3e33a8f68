//! Batch engine configuration.
//!
//! Every field has a default; the runner overlays environment variables
//! (optionally loaded from a `.env` file) on top of those defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

pub const ENV_MAX_WORKERS: &str = "BEDROT_MAX_WORKERS";
pub const ENV_CONTINUE_ON_ERROR: &str = "BEDROT_CONTINUE_ON_ERROR";
pub const ENV_COMPLETED_JOBS_LIMIT: &str = "BEDROT_COMPLETED_JOBS_LIMIT";
pub const ENV_MAX_RENDER_ATTEMPTS: &str = "BEDROT_MAX_RENDER_ATTEMPTS";
pub const ENV_STUCK_JOB_SECS: &str = "BEDROT_STUCK_JOB_SECS";
pub const ENV_FFMPEG_PATH: &str = "FFMPEG_PATH";
pub const ENV_STDERR_TAIL_LINES: &str = "BEDROT_STDERR_TAIL_LINES";
pub const ENV_ELEVENLABS_API_KEY: &str = "ELEVENLABS_API_KEY";
pub const ENV_ELEVENLABS_BASE_URL: &str = "ELEVENLABS_BASE_URL";
pub const ENV_TRANSCRIPTION_RETRIES: &str = "BEDROT_TRANSCRIPTION_RETRIES";
pub const ENV_TRANSCRIPT_DIR: &str = "BEDROT_TRANSCRIPT_DIR";
pub const ENV_LOG_DIR: &str = "BEDROT_LOG_DIR";
pub const ENV_LOG_FILTER: &str = "BEDROT_LOG_FILTER";

/// Speech-to-text client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// API key. Transcription fails with a configuration error when unset.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model_id: String,
    /// Retries after the first attempt for rate limiting and server errors.
    pub max_retries: u32,
    pub request_timeout_secs: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.elevenlabs.io".to_string(),
            model_id: "scribe_v1".to_string(),
            max_retries: 2,
            request_timeout_secs: 300,
        }
    }
}

/// Configuration for the batch engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Ceiling on concurrently processing jobs.
    pub max_workers: usize,
    /// Keep claiming jobs after one fails.
    pub continue_on_error: bool,
    /// Terminal jobs kept after each completion; `None` keeps everything.
    pub completed_jobs_limit: Option<usize>,
    /// Attempts per rendered artifact before the job fails.
    pub max_render_attempts: u32,
    /// Processing time after which a job is reported as stuck.
    pub stuck_job_secs: u64,
    pub ffmpeg_path: String,
    /// stderr lines attached to an external tool failure.
    pub stderr_tail_lines: usize,
    /// Default folder for generated subtitles.
    pub transcript_dir: Option<PathBuf>,
    pub transcription: TranscriptionConfig,
    pub log_dir: Option<PathBuf>,
    pub log_filter: Option<String>,
    /// Capacity of the batch event channel.
    pub event_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            continue_on_error: true,
            completed_jobs_limit: None,
            max_render_attempts: 3,
            stuck_job_secs: 600,
            ffmpeg_path: "ffmpeg".to_string(),
            stderr_tail_lines: 10,
            transcript_dir: None,
            transcription: TranscriptionConfig::default(),
            log_dir: None,
            log_filter: None,
            event_capacity: 256,
        }
    }
}

impl BatchConfig {
    /// Build a configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_MAX_WORKERS) {
            config.max_workers = parse_value(ENV_MAX_WORKERS, &v)?;
        }
        if let Some(v) = get(ENV_CONTINUE_ON_ERROR) {
            config.continue_on_error = parse_bool(ENV_CONTINUE_ON_ERROR, &v)?;
        }
        if let Some(v) = get(ENV_COMPLETED_JOBS_LIMIT) {
            config.completed_jobs_limit = Some(parse_value(ENV_COMPLETED_JOBS_LIMIT, &v)?);
        }
        if let Some(v) = get(ENV_MAX_RENDER_ATTEMPTS) {
            config.max_render_attempts = parse_value(ENV_MAX_RENDER_ATTEMPTS, &v)?;
        }
        if let Some(v) = get(ENV_STUCK_JOB_SECS) {
            config.stuck_job_secs = parse_value(ENV_STUCK_JOB_SECS, &v)?;
        }
        if let Some(v) = get(ENV_FFMPEG_PATH) {
            config.ffmpeg_path = v;
        }
        if let Some(v) = get(ENV_STDERR_TAIL_LINES) {
            config.stderr_tail_lines = parse_value(ENV_STDERR_TAIL_LINES, &v)?;
        }
        if let Some(v) = get(ENV_ELEVENLABS_API_KEY) {
            config.transcription.api_key = Some(v.trim().to_string());
        }
        if let Some(v) = get(ENV_ELEVENLABS_BASE_URL) {
            config.transcription.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get(ENV_TRANSCRIPTION_RETRIES) {
            config.transcription.max_retries = parse_value(ENV_TRANSCRIPTION_RETRIES, &v)?;
        }
        if let Some(v) = get(ENV_TRANSCRIPT_DIR) {
            config.transcript_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_LOG_DIR) {
            config.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_LOG_FILTER) {
            config.log_filter = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::config("max_workers must be at least 1"));
        }
        if self.max_render_attempts == 0 {
            return Err(Error::config("max_render_attempts must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event_capacity must be at least 1"));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::config(format!("{} has an invalid value: {}", key, raw)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "{} has an invalid value: {}",
            key, raw
        ))),
    }
}
