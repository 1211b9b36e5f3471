//! Per-kind metadata extraction.
//!
//! Extraction fails soft: the caller receives a [`MetadataError`], skips the
//! file and keeps walking.

use crate::media_type::{needs_backend_decoder, MediaKind};
use crate::video::{ProbeReport, VideoBackend, VideoError};
use exif::{In, Reader, Tag, Value};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

/// Where a capture timestamp came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// EXIF timestamp with an explicit UTC offset.
    ExifWithOffset,
    /// EXIF timestamp without an offset, read as UTC.
    ExifUtc,
    /// Container `creation_time` tag.
    StreamTag,
    /// Oldest of the file's creation and modification times.
    FileTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureTime {
    pub epoch: i64,
    pub source: CaptureSource,
}

/// Non-zero pixel dimensions in display orientation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self { width, height })
    }

    pub fn swapped(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    pub fn aspect_ratio(self) -> f64 {
        f64::from(self.width) / f64::from(self.height)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageMetadata {
    pub size_bytes: u64,
    pub dimensions: Dimensions,
    pub captured_at: Option<CaptureTime>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoMetadata {
    pub size_bytes: u64,
    /// Already swapped when the stream is turned by 90 or 270 degrees.
    pub dimensions: Dimensions,
    pub captured_at: Option<CaptureTime>,
    pub duration: Option<String>,
    /// Rotation the container asks players to apply, for reference only.
    pub stream_rotation: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MediaMetadata {
    Image(ImageMetadata),
    Video(VideoMetadata),
}

impl MediaMetadata {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Image(_) => MediaKind::Image,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Image(image) => image.size_bytes,
            Self::Video(video) => video.size_bytes,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        match self {
            Self::Image(image) => image.dimensions,
            Self::Video(video) => video.dimensions,
        }
    }

    pub fn captured_at(&self) -> Option<CaptureTime> {
        match self {
            Self::Image(image) => image.captured_at,
            Self::Video(video) => video.captured_at,
        }
    }

    pub fn duration(&self) -> Option<&str> {
        match self {
            Self::Image(_) => None,
            Self::Video(video) => video.duration.as_deref(),
        }
    }
}

/// Reads metadata for `path`, dispatching on `kind`.
pub fn extract(
    path: &Path,
    kind: MediaKind,
    video: &dyn VideoBackend,
) -> Result<MediaMetadata, MetadataError> {
    let file_info = fs::metadata(path).map_err(|source| MetadataError::Io {
        source,
        path: path.to_path_buf(),
    })?;

    match kind {
        MediaKind::Image => image_metadata(path, &file_info, video).map(MediaMetadata::Image),
        MediaKind::Video => {
            let report = video.probe(path).map_err(|source| MetadataError::Video {
                source,
                path: path.to_path_buf(),
            })?;
            video_metadata(path, &report, file_info.len(), file_time(&file_info))
                .map(MediaMetadata::Video)
        }
    }
}

fn image_metadata(
    path: &Path,
    file_info: &fs::Metadata,
    video: &dyn VideoBackend,
) -> Result<ImageMetadata, MetadataError> {
    let (width, height) = if needs_backend_decoder(path) {
        let still = video.still_image(path).map_err(|source| MetadataError::Video {
            source,
            path: path.to_path_buf(),
        })?;
        (still.width(), still.height())
    } else {
        image::ImageReader::open(path)
            .map_err(|source| MetadataError::Io {
                source,
                path: path.to_path_buf(),
            })?
            .with_guessed_format()
            .map_err(|source| MetadataError::Io {
                source,
                path: path.to_path_buf(),
            })?
            .into_dimensions()
            .map_err(|source| MetadataError::Image {
                source,
                path: path.to_path_buf(),
            })?
    };

    let dimensions = Dimensions::new(width, height)
        .ok_or_else(|| MetadataError::ZeroDimensions(path.to_path_buf()))?;

    Ok(ImageMetadata {
        size_bytes: file_info.len(),
        dimensions,
        captured_at: read_exif_capture_time(path).or_else(|| file_time(file_info)),
    })
}

/// Builds video metadata from a probe report. `fallback` is used when the
/// container carries no creation time.
pub fn video_metadata(
    path: &Path,
    report: &ProbeReport,
    size_bytes: u64,
    fallback: Option<CaptureTime>,
) -> Result<VideoMetadata, MetadataError> {
    let stream = report
        .video_stream()
        .ok_or_else(|| MetadataError::NoVideoStream(path.to_path_buf()))?;
    let raw = stream
        .width
        .zip(stream.height)
        .and_then(|(width, height)| Dimensions::new(width, height))
        .ok_or_else(|| MetadataError::ZeroDimensions(path.to_path_buf()))?;

    let stream_rotation = stream.rotation_degrees();
    let dimensions = match stream_rotation {
        90 | 270 => raw.swapped(),
        _ => raw,
    };

    let format = report.format.as_ref();
    let creation_tag = stream
        .tags
        .get("creation_time")
        .or_else(|| format.and_then(|format| format.tags.get("creation_time")));
    let captured_at = creation_tag
        .and_then(|value| OffsetDateTime::parse(value.trim(), &Rfc3339).ok())
        .map(|moment| CaptureTime {
            epoch: moment.unix_timestamp(),
            source: CaptureSource::StreamTag,
        })
        .or(fallback);

    let duration = stream
        .duration
        .clone()
        .or_else(|| format.and_then(|format| format.duration.clone()));

    Ok(VideoMetadata {
        size_bytes,
        dimensions,
        captured_at,
        duration,
        stream_rotation,
    })
}

fn file_time(file_info: &fs::Metadata) -> Option<CaptureTime> {
    [file_info.created().ok(), file_info.modified().ok()]
        .into_iter()
        .flatten()
        .min()
        .map(|oldest| CaptureTime {
            epoch: OffsetDateTime::from(oldest).unix_timestamp(),
            source: CaptureSource::FileTime,
        })
}

fn read_exif_capture_time(path: &Path) -> Option<CaptureTime> {
    let file = File::open(path).ok()?;
    let mut buffer = BufReader::new(file);
    let exif = Reader::new().read_from_container(&mut buffer).ok()?;

    let timestamp = ascii_field(&exif, Tag::DateTimeOriginal)
        .or_else(|| ascii_field(&exif, Tag::DateTime))?;
    let offset = ascii_field(&exif, Tag::OffsetTimeOriginal)
        .or_else(|| ascii_field(&exif, Tag::OffsetTime));
    capture_time_from_exif(timestamp, offset)
}

fn ascii_field(exif: &exif::Exif, tag: Tag) -> Option<&[u8]> {
    match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Ascii(values) => values.first().map(Vec::as_slice),
        _ => None,
    }
}

/// Converts an EXIF `YYYY:MM:DD HH:MM:SS` timestamp to epoch seconds, using
/// the `±HH:MM` offset when one parses and UTC otherwise.
pub fn capture_time_from_exif(timestamp: &[u8], offset: Option<&[u8]>) -> Option<CaptureTime> {
    let mut parsed = exif::DateTime::from_ascii(timestamp).ok()?;
    if let Some(offset) = offset {
        if parsed.parse_offset(offset).is_err() {
            parsed.offset = None;
        }
    }

    let month = Month::try_from(parsed.month).ok()?;
    let date = Date::from_calendar_date(i32::from(parsed.year), month, parsed.day).ok()?;
    let clock = Time::from_hms(parsed.hour, parsed.minute, parsed.second).ok()?;
    let local = PrimitiveDateTime::new(date, clock);

    match parsed.offset {
        Some(minutes) => {
            let offset = UtcOffset::from_whole_seconds(i32::from(minutes) * 60).ok()?;
            Some(CaptureTime {
                epoch: local.assume_offset(offset).unix_timestamp(),
                source: CaptureSource::ExifWithOffset,
            })
        }
        None => Some(CaptureTime {
            epoch: local.assume_utc().unix_timestamp(),
            source: CaptureSource::ExifUtc,
        }),
    }
}

/// Errors that make a file unsupported for cataloguing.
#[derive(Debug)]
pub enum MetadataError {
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    Image {
        source: image::ImageError,
        path: PathBuf,
    },
    Video {
        source: VideoError,
        path: PathBuf,
    },
    NoVideoStream(PathBuf),
    ZeroDimensions(PathBuf),
}

impl Display for MetadataError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { source, path } => write!(f, "io error for {}: {}", path.display(), source),
            Self::Image { source, path } => {
                write!(f, "unreadable image {}: {}", path.display(), source)
            }
            Self::Video { source, path } => {
                write!(f, "video backend failed for {}: {}", path.display(), source)
            }
            Self::NoVideoStream(path) => write!(f, "no video stream in {}", path.display()),
            Self::ZeroDimensions(path) => {
                write!(f, "missing or zero dimensions for {}", path.display())
            }
        }
    }
}

impl Error for MetadataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Image { source, .. } => Some(source),
            Self::Video { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thumbnails::tests::StubVideo;
    use crate::video::FfmpegBackend;
    use exif::experimental::Writer;
    use exif::Field;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    /// Encodes a small JPEG whose APP1 segment carries the given ASCII tags.
    fn jpeg_with_exif(path: &Path, tags: &[(Tag, &str)]) {
        let fields = tags
            .iter()
            .map(|(tag, value)| Field {
                tag: *tag,
                ifd_num: In::PRIMARY,
                value: Value::Ascii(vec![value.as_bytes().to_vec()]),
            })
            .collect::<Vec<_>>();
        let mut writer = Writer::new();
        for field in &fields {
            writer.push_field(field);
        }
        let mut tiff = Cursor::new(Vec::new());
        writer.write(&mut tiff, false).unwrap();
        let tiff = tiff.into_inner();

        let mut jpeg = Cursor::new(Vec::new());
        RgbImage::new(32, 24)
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .unwrap();
        let jpeg = jpeg.into_inner();

        let segment_len = u16::try_from(2 + 6 + tiff.len()).unwrap();
        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(b"Exif\0\0");
        out.extend_from_slice(&tiff);
        out.extend_from_slice(&jpeg[2..]);
        fs::write(path, out).unwrap();
    }

    #[test]
    fn original_exif_time_and_offset_win_over_fallback_tags() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        jpeg_with_exif(
            &path,
            &[
                (Tag::DateTimeOriginal, "2023:05:01 12:00:00"),
                (Tag::DateTime, "2000:01:01 00:00:00"),
                (Tag::OffsetTimeOriginal, "+02:00"),
                (Tag::OffsetTime, "-05:00"),
            ],
        );

        let metadata = extract(&path, MediaKind::Image, &FfmpegBackend::default()).unwrap();
        assert_eq!(metadata.dimensions(), Dimensions::new(32, 24).unwrap());
        assert_eq!(
            metadata.captured_at(),
            Some(CaptureTime {
                epoch: 1_682_935_200,
                source: CaptureSource::ExifWithOffset
            })
        );
    }

    #[test]
    fn exif_datetime_and_offset_are_used_without_originals() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edited.jpg");
        jpeg_with_exif(
            &path,
            &[
                (Tag::DateTime, "2023:05:01 12:00:00"),
                (Tag::OffsetTime, "+02:00"),
            ],
        );
        let metadata = extract(&path, MediaKind::Image, &FfmpegBackend::default()).unwrap();
        assert_eq!(
            metadata.captured_at(),
            Some(CaptureTime {
                epoch: 1_682_935_200,
                source: CaptureSource::ExifWithOffset
            })
        );

        let bare = dir.path().join("bare.jpg");
        jpeg_with_exif(&bare, &[(Tag::DateTimeOriginal, "2023:05:01 12:00:00")]);
        let metadata = extract(&bare, MediaKind::Image, &FfmpegBackend::default()).unwrap();
        assert_eq!(
            metadata.captured_at(),
            Some(CaptureTime {
                epoch: 1_682_942_400,
                source: CaptureSource::ExifUtc
            })
        );
    }

    #[test]
    fn heic_dimensions_come_from_the_backend_still() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("IMG_0001.heic");
        fs::write(&path, b"ftypheic not decodable by the image crate").unwrap();

        let video = StubVideo::new("{}", (4032, 3024));
        let metadata = extract(&path, MediaKind::Image, &video).unwrap();
        assert_eq!(metadata.kind(), MediaKind::Image);
        assert_eq!(metadata.dimensions(), Dimensions::new(4032, 3024).unwrap());
        assert_eq!(
            metadata.captured_at().map(|time| time.source),
            Some(CaptureSource::FileTime)
        );
        assert_eq!(video.stills_served.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exif_offset_converts_to_utc() {
        let captured =
            capture_time_from_exif(b"2023:05:01 12:00:00", Some(&b"+02:00"[..])).unwrap();
        assert_eq!(captured.source, CaptureSource::ExifWithOffset);
        assert_eq!(captured.epoch, 1_682_935_200);
    }

    #[test]
    fn exif_without_offset_is_utc() {
        let captured = capture_time_from_exif(b"2023:05:01 12:00:00", None).unwrap();
        assert_eq!(captured.source, CaptureSource::ExifUtc);
        assert_eq!(captured.epoch, 1_682_942_400);

        let unreadable_offset =
            capture_time_from_exif(b"2023:05:01 12:00:00", Some(&b"garbage"[..])).unwrap();
        assert_eq!(unreadable_offset, captured);
    }

    #[test]
    fn malformed_exif_timestamp_is_ignored() {
        assert!(capture_time_from_exif(b"not a date", None).is_none());
        assert!(capture_time_from_exif(b"2023:13:01 12:00:00", None).is_none());
    }

    #[test]
    fn image_without_exif_falls_back_to_file_time() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        RgbImage::new(800, 600).save(&path).unwrap();

        let metadata = extract(&path, MediaKind::Image, &FfmpegBackend::default()).unwrap();
        assert_eq!(metadata.kind(), MediaKind::Image);
        assert_eq!(metadata.dimensions(), Dimensions::new(800, 600).unwrap());
        assert!((metadata.dimensions().aspect_ratio() - 4.0 / 3.0).abs() < 1e-9);
        assert!(metadata.size_bytes() > 0);
        assert_eq!(
            metadata.captured_at().map(|time| time.source),
            Some(CaptureSource::FileTime)
        );
        assert_eq!(metadata.duration(), None);
    }

    #[test]
    fn corrupt_image_is_unsupported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"definitely not a png").unwrap();
        let result = extract(&path, MediaKind::Image, &FfmpegBackend::default());
        assert!(result.is_err());
    }

    #[test]
    fn rotated_stream_swaps_dimensions() {
        let json = r#"{
            "streams": [{
                "codec_type": "video", "width": 1080, "height": 1920,
                "duration": "3.000000",
                "side_data_list": [{ "side_data_type": "Display Matrix", "rotation": 90 }]
            }],
            "format": { "tags": { "creation_time": "2021-01-01T00:00:00Z" } }
        }"#;
        let report = ProbeReport::from_json(json.as_bytes()).unwrap();
        let metadata = video_metadata(Path::new("clip.mp4"), &report, 10, None).unwrap();
        assert_eq!(metadata.dimensions, Dimensions::new(1920, 1080).unwrap());
        assert_eq!(metadata.stream_rotation, 90);
        assert_eq!(metadata.duration.as_deref(), Some("3.000000"));
        assert_eq!(
            metadata.captured_at,
            Some(CaptureTime {
                epoch: 1_609_459_200,
                source: CaptureSource::StreamTag
            })
        );
    }

    #[test]
    fn unrotated_stream_keeps_dimensions_and_uses_fallback_time() {
        let json = r#"{"streams":[{"codec_type":"video","width":640,"height":480}],
                       "format":{"duration":"1.5"}}"#;
        let report = ProbeReport::from_json(json.as_bytes()).unwrap();
        let fallback = CaptureTime {
            epoch: 42,
            source: CaptureSource::FileTime,
        };
        let metadata = video_metadata(Path::new("a.mov"), &report, 1, Some(fallback)).unwrap();
        assert_eq!(metadata.dimensions, Dimensions::new(640, 480).unwrap());
        assert_eq!(metadata.captured_at, Some(fallback));
        assert_eq!(metadata.duration.as_deref(), Some("1.5"));
    }

    #[test]
    fn stream_without_dimensions_is_rejected() {
        let json = r#"{"streams":[{"codec_type":"video","width":0,"height":480}]}"#;
        let report = ProbeReport::from_json(json.as_bytes()).unwrap();
        assert!(matches!(
            video_metadata(Path::new("a.mov"), &report, 1, None),
            Err(MetadataError::ZeroDimensions(_))
        ));
    }
}
