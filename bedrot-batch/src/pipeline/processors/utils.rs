//! Utility functions for processors.

use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// Image extensions accepted by the slideshow pipeline.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp", "tiff"];

const MAX_SAFE_NAME_LEN: usize = 50;

/// Reduce a free-form label to something usable in a file name.
///
/// Keeps alphanumerics, spaces, `-` and `_`; spaces become underscores.
pub fn safe_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    kept.trim()
        .replace(' ', "_")
        .chars()
        .take(MAX_SAFE_NAME_LEN)
        .collect()
}

/// Millisecond timestamp for output file names.
pub fn timestamp_tag() -> String {
    Local::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// File name without extension, falling back to `fallback`.
pub fn file_stem(path: &Path, fallback: &str) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn extension_matches(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Create `dir` if needed and make sure files can be written into it.
pub async fn ensure_output_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let marker = dir.join(format!(".write_check_{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&marker, b"").await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Output folder is not writable: {} ({})", dir.display(), e),
        ))
    })?;
    if let Err(e) = tokio::fs::remove_file(&marker).await {
        debug!("Failed to remove write check file {}: {}", marker.display(), e);
    }
    Ok(())
}

/// Images directly inside `folder`, sorted by path.
pub async fn list_images(folder: &Path) -> Result<Vec<PathBuf>> {
    if !tokio::fs::try_exists(folder).await.unwrap_or(false) {
        return Err(Error::missing_file("Image folder", folder));
    }

    let mut images = Vec::new();
    let mut entries = tokio::fs::read_dir(folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && extension_matches(&path, IMAGE_EXTENSIONS) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

pub fn has_extension(path: &Path, ext: &str) -> bool {
    extension_matches(path, &[ext])
}
