//! Audio to subtitle pairings.
//!
//! A pairing remembers which subtitle file was produced (or supplied) for an
//! audio file so repeated caption jobs can skip transcription.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::Result;

/// Where a paired subtitle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingSource {
    AutoTranscribed,
    UserProvided,
}

/// Identity of an input file, used as the pairing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Normalised path.
    pub path: PathBuf,
    /// Hex SHA-256 of the content, when readable.
    pub hash: Option<String>,
    pub file_name: String,
    pub size: Option<u64>,
}

impl FileIdentity {
    /// Fingerprint the file at `path`.
    ///
    /// Unreadable files still get an identity keyed by path alone.
    pub async fn of(path: &Path) -> Self {
        let normalised = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = tokio::fs::metadata(path).await.ok().map(|m| m.len());
        let hash = match hash_file(path).await {
            Ok(hash) => Some(hash),
            Err(e) => {
                debug!("Could not hash {}: {}", path.display(), e);
                None
            }
        };

        Self {
            path: normalised,
            hash,
            file_name,
            size,
        }
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A recorded audio/subtitle association.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pairing {
    pub audio: FileIdentity,
    pub subtitle: PathBuf,
    pub source: PairingSource,
    pub created_at: DateTime<Utc>,
}

impl Pairing {
    fn matches_path(&self, key: &FileIdentity) -> bool {
        self.audio.path == key.path
    }

    fn matches_hash(&self, key: &FileIdentity) -> bool {
        matches!((&self.audio.hash, &key.hash), (Some(a), Some(b)) if a == b)
    }

    fn matches_name_and_size(&self, key: &FileIdentity) -> bool {
        !key.file_name.is_empty()
            && self.audio.file_name == key.file_name
            && key.size.is_some()
            && self.audio.size == key.size
    }
}

/// Lookup store for previously produced subtitles.
#[async_trait]
pub trait PairingStore: Send + Sync {
    /// The subtitle previously associated with `audio`, if any.
    async fn find(&self, audio: &FileIdentity) -> Option<PathBuf>;

    /// Associate `subtitle` with `audio`, replacing any earlier pairing.
    async fn record(&self, audio: &FileIdentity, subtitle: &Path, source: PairingSource)
    -> Result<()>;
}

/// Process-local [`PairingStore`].
#[derive(Debug, Default)]
pub struct InMemoryPairingStore {
    pairings: Mutex<Vec<Pairing>>,
}

impl InMemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pairings(&self) -> Vec<Pairing> {
        self.pairings.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.pairings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairings.lock().is_empty()
    }
}

#[async_trait]
impl PairingStore for InMemoryPairingStore {
    async fn find(&self, audio: &FileIdentity) -> Option<PathBuf> {
        let pairings = self.pairings.lock();
        // Most specific match wins: path, then content, then name and size.
        pairings
            .iter()
            .find(|p| p.matches_path(audio))
            .or_else(|| pairings.iter().find(|p| p.matches_hash(audio)))
            .or_else(|| pairings.iter().find(|p| p.matches_name_and_size(audio)))
            .map(|p| p.subtitle.clone())
    }

    async fn record(
        &self,
        audio: &FileIdentity,
        subtitle: &Path,
        source: PairingSource,
    ) -> Result<()> {
        let mut pairings = self.pairings.lock();
        pairings.retain(|p| !p.matches_path(audio) && !p.matches_hash(audio));
        pairings.push(Pairing {
            audio: audio.clone(),
            subtitle: subtitle.to_path_buf(),
            source,
            created_at: Utc::now(),
        });
        Ok(())
    }
}
