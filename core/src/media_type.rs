//! Extension-based media classification.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "heif", "heic", "gif", "bmp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "webm", "mkv"];
/// Still formats the `image` crate cannot read; these are decoded through
/// the video backend instead.
pub const BACKEND_STILL_EXTENSIONS: &[&str] = &["heif", "heic"];

/// Result of classifying a path by its extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Video,
    Other,
}

/// The two kinds of media the catalog stores. Call sites that need
/// kind-specific behaviour match on this exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaType {
    pub fn kind(self) -> Option<MediaKind> {
        match self {
            Self::Image => Some(MediaKind::Image),
            Self::Video => Some(MediaKind::Video),
            Self::Other => None,
        }
    }
}

impl MediaKind {
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

pub fn classify(path: &Path) -> MediaType {
    let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
        return MediaType::Other;
    };
    let lower = extension.to_lowercase();
    if IMAGE_EXTENSIONS.contains(&lower.as_str()) {
        MediaType::Image
    } else if VIDEO_EXTENSIONS.contains(&lower.as_str()) {
        MediaType::Video
    } else {
        MediaType::Other
    }
}

/// True for images that must be decoded by the video backend.
pub fn needs_backend_decoder(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| BACKEND_STILL_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
