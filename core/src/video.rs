//! Video probing and frame extraction.
//!
//! Video containers are handled through the `ffprobe` and `ffmpeg`
//! executables. The [`VideoBackend`] trait is the seam the metadata
//! extractor and the thumbnail cache call through, so either tool can be
//! replaced (tests use an in-process stub).

use image::DynamicImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub trait VideoBackend: Send + Sync {
    /// Describes the container and its first video stream.
    fn probe(&self, path: &Path) -> Result<ProbeReport, VideoError>;

    /// Decodes one frame that represents the clip, already turned to its
    /// display orientation.
    fn representative_frame(&self, path: &Path) -> Result<DynamicImage, VideoError>;

    /// Decodes a still image the `image` crate has no codec for (HEIF).
    fn still_image(&self, path: &Path) -> Result<DynamicImage, VideoError>;
}

/// Shells out to `ffprobe`/`ffmpeg` found on `PATH` (or at explicit locations).
#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self {
            ffprobe: PathBuf::from("ffprobe"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegBackend {
    pub fn with_binaries(ffprobe: PathBuf, ffmpeg: PathBuf) -> Self {
        Self { ffprobe, ffmpeg }
    }
}

impl VideoBackend for FfmpegBackend {
    fn probe(&self, path: &Path) -> Result<ProbeReport, VideoError> {
        debug!(path = %path.display(), "probing video");
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_streams",
                "-show_format",
                "-print_format",
                "json",
            ])
            .arg(path)
            .output()
            .map_err(|source| VideoError::Spawn {
                program: self.ffprobe.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(VideoError::Failed {
                program: self.ffprobe.clone(),
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        ProbeReport::from_json(&output.stdout)
    }

    fn representative_frame(&self, path: &Path) -> Result<DynamicImage, VideoError> {
        self.decode_png(path, &["-vf", "thumbnail"])
    }

    fn still_image(&self, path: &Path) -> Result<DynamicImage, VideoError> {
        debug!(path = %path.display(), "decoding still through ffmpeg");
        self.decode_png(path, &[])
    }
}

impl FfmpegBackend {
    /// Runs ffmpeg over `path` and reads back its first output frame as PNG.
    fn decode_png(&self, path: &Path, filters: &[&str]) -> Result<DynamicImage, VideoError> {
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(filters)
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"])
            .output()
            .map_err(|source| VideoError::Spawn {
                program: self.ffmpeg.clone(),
                source,
            })?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(VideoError::Failed {
                program: self.ffmpeg.clone(),
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        image::load_from_memory_with_format(&output.stdout, image::ImageFormat::Png)
            .map_err(VideoError::Decode)
    }
}

/// Subset of `ffprobe -print_format json` output used by the catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: Option<ProbeFormat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub side_data_list: Vec<SideData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SideData {
    #[serde(default)]
    pub side_data_type: Option<String>,
    #[serde(default)]
    pub rotation: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl ProbeReport {
    pub fn from_json(bytes: &[u8]) -> Result<Self, VideoError> {
        serde_json::from_slice(bytes).map_err(VideoError::Parse)
    }

    /// First stream that is a video stream (or has dimensions when the
    /// codec type was not reported).
    pub fn video_stream(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|stream| match &stream.codec_type {
            Some(kind) => kind == "video",
            None => stream.width.is_some() && stream.height.is_some(),
        })
    }
}

impl ProbeStream {
    /// Display rotation in degrees, normalised to `0..360`. The display
    /// matrix side data wins over the legacy `rotate` tag.
    pub fn rotation_degrees(&self) -> u32 {
        let matrix = self
            .side_data_list
            .iter()
            .filter(|side| {
                side.side_data_type
                    .as_deref()
                    .map(|kind| kind.eq_ignore_ascii_case("Display Matrix"))
                    .unwrap_or(true)
            })
            .find_map(|side| side.rotation);
        let tag = || {
            self.tags
                .get("rotate")
                .and_then(|value| value.trim().parse::<f64>().ok())
        };
        let degrees = matrix.or_else(tag).unwrap_or(0.0).round() as i64;
        degrees.rem_euclid(360) as u32
    }
}

#[derive(Debug)]
pub enum VideoError {
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    Failed {
        program: PathBuf,
        path: PathBuf,
        stderr: String,
    },
    Parse(serde_json::Error),
    Decode(image::ImageError),
}

impl Display for VideoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { program, source } => {
                write!(f, "unable to run {}: {}", program.display(), source)
            }
            Self::Failed {
                program,
                path,
                stderr,
            } => write!(
                f,
                "{} failed for {}: {}",
                program.display(),
                path.display(),
                stderr
            ),
            Self::Parse(error) => write!(f, "unreadable probe output: {}", error),
            Self::Decode(error) => write!(f, "unreadable video frame: {}", error),
        }
    }
}

impl Error for VideoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Parse(error) => Some(error),
            Self::Decode(error) => Some(error),
            Self::Failed { .. } => None,
        }
    }
}
