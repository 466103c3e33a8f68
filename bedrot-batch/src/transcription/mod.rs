//! Speech-to-text and subtitle generation.

pub mod elevenlabs;
pub mod subtitles;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use elevenlabs::ElevenLabsTranscriber;
pub use subtitles::{SubtitleSegment, format_srt_time, to_srt, transform_srt, words_to_segments, write_srt};

/// A single timed token from a transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribedWord {
    pub text: String,
    pub start: f64,
    pub end: f64,
    /// Token type reported by the service (`word`, `spacing`, `audio_event`).
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl TranscribedWord {
    /// Spoken words, including untyped tokens.
    pub fn is_word(&self) -> bool {
        self.kind.as_deref().is_none_or(|k| k == "word")
    }
}

/// Turns an audio file into timed words.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        language_code: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranscribedWord>>;
}
