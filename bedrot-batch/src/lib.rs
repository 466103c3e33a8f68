//! bedrot-batch library crate.
//!
//! A batch engine that renders slideshow videos from image folders and
//! captioned videos from audio, with transcription through ElevenLabs.

pub mod config;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod pairing;
pub mod pipeline;
pub mod retry;
pub mod transcription;

pub use error::{Error, Result};
