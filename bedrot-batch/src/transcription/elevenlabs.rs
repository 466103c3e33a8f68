//! ElevenLabs speech-to-text client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{TranscribedWord, Transcriber};
use crate::config::TranscriptionConfig;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::{Error, Result};

const TOOL: &str = "elevenlabs";
const SPEECH_TO_TEXT_PATH: &str = "/v1/speech-to-text";
const API_KEY_HEADER: &str = "xi-api-key";

#[derive(Debug, Deserialize)]
struct ApiWord {
    text: String,
    start: Option<f64>,
    end: Option<f64>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    words: Vec<ApiWord>,
}

/// [`Transcriber`] backed by the ElevenLabs speech-to-text API.
#[derive(Debug, Clone)]
pub struct ElevenLabsTranscriber {
    client: Client,
    config: TranscriptionConfig,
    retry: RetryPolicy,
}

impl ElevenLabsTranscriber {
    pub fn new(config: TranscriptionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let retry = RetryPolicy::new(config.max_retries.saturating_add(1));
        Ok(Self {
            client,
            config,
            retry,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            SPEECH_TO_TEXT_PATH
        )
    }

    async fn request_once(
        &self,
        api_key: &str,
        file_name: &str,
        audio: &[u8],
        language_code: &str,
    ) -> Result<Vec<TranscribedWord>> {
        let part = Part::bytes(audio.to_vec())
            .file_name(file_name.to_string())
            .mime_str("audio/mpeg")?;
        let form = Form::new()
            .text("model_id", self.config.model_id.clone())
            .text("tag_audio_events", "true")
            .text("language_code", language_code.to_string())
            .text("diarize", "true")
            .text("timestamps_granularity", "word")
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint())
            .header(API_KEY_HEADER, api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::external(
                TOOL,
                Some(i32::from(status.as_u16())),
                format!("{} - {}", status, body.trim()),
            ));
        }

        let body: ApiResponse = response.json().await?;
        Ok(collect_words(body))
    }
}

fn collect_words(body: ApiResponse) -> Vec<TranscribedWord> {
    body.words
        .into_iter()
        .filter_map(|w| {
            Some(TranscribedWord {
                start: w.start?,
                end: w.end?,
                text: w.text,
                kind: w.kind,
            })
        })
        .collect()
}

/// Rate limiting, server errors and transport failures are worth another try.
fn is_transient(err: &Error) -> bool {
    match err {
        Error::ExternalTool { code: Some(code), .. } => *code == 429 || *code >= 500,
        Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        _ => false,
    }
}

#[async_trait]
impl Transcriber for ElevenLabsTranscriber {
    async fn transcribe(
        &self,
        audio: &Path,
        language_code: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranscribedWord>> {
        let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Err(Error::config("ElevenLabs API key is not configured"));
        };
        if !tokio::fs::try_exists(audio).await.unwrap_or(false) {
            return Err(Error::missing_file("Audio file", audio));
        }

        let bytes = tokio::fs::read(audio).await?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());

        info!("Transcribing {} ({} bytes)", audio.display(), bytes.len());

        let words = retry_with_backoff("transcription", self.retry, cancel, is_transient, |_| {
            let bytes = &bytes;
            let file_name = &file_name;
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    result = self.request_once(api_key, file_name, bytes, language_code) => result,
                }
            }
        })
        .await?;

        if words.is_empty() {
            return Err(Error::external(TOOL, None, "no words returned"));
        }

        debug!("Received {} tokens for {}", words.len(), audio.display());
        Ok(words)
    }
}
