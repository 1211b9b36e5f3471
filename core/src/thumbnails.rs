use crate::hasher::ContentHash;
use crate::media_type::{needs_backend_decoder, MediaKind};
use crate::video::{VideoBackend, VideoError};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const RENDITION_EXTENSION: &str = "jpg";
const JPEG_QUALITY: u8 = 85;

static PARTIAL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Content-addressed store of resized renditions.
///
/// A rendition for hash `h` at size `s` lives at
/// `root/h[0..2]/h[2..4]/h[4..]-s.jpg`. Whether that file exists is the
/// only cache-hit signal, so the layout must stay stable across releases.
#[derive(Clone, Debug)]
pub struct ThumbnailCache {
    root: PathBuf,
}

/// Outcome of [`ThumbnailCache::ensure`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendition {
    pub path: PathBuf,
    /// False when the rendition already existed and nothing was encoded.
    pub generated: bool,
}

impl ThumbnailCache {
    pub fn new(root: PathBuf) -> Result<Self, ThumbnailError> {
        fs::create_dir_all(&root).map_err(|source| ThumbnailError::Io {
            source,
            path: root.clone(),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rendition_path(&self, hash: &ContentHash, size: u32) -> PathBuf {
        let (first, second, rest) = hash.buckets();
        self.root
            .join(first)
            .join(second)
            .join(format!("{}-{}.{}", rest, size, RENDITION_EXTENSION))
    }

    pub fn ensure(
        &self,
        hash: &ContentHash,
        source: &Path,
        kind: MediaKind,
        size: u32,
        video: &dyn VideoBackend,
    ) -> Result<Rendition, ThumbnailError> {
        let target = self.rendition_path(hash, size);
        if target.exists() {
            return Ok(Rendition {
                path: target,
                generated: false,
            });
        }

        let frame = match kind {
            MediaKind::Image if needs_backend_decoder(source) => {
                video
                    .still_image(source)
                    .map_err(|error| ThumbnailError::Video {
                        source: error,
                        path: source.to_path_buf(),
                    })?
            }
            MediaKind::Image => decode_image(source)?,
            MediaKind::Video => {
                video
                    .representative_frame(source)
                    .map_err(|error| ThumbnailError::Video {
                        source: error,
                        path: source.to_path_buf(),
                    })?
            }
        };

        write_rendition(&scale_to_shorter_side(frame, size), &target)?;
        debug!(target = %target.display(), "rendition written");
        Ok(Rendition {
            path: target,
            generated: true,
        })
    }
}

/// Decodes by content rather than extension, so a mislabelled file still
/// renders.
fn decode_image(source: &Path) -> Result<DynamicImage, ThumbnailError> {
    let io_error = |error| ThumbnailError::Io {
        source: error,
        path: source.to_path_buf(),
    };
    ImageReader::open(source)
        .map_err(io_error)?
        .with_guessed_format()
        .map_err(io_error)?
        .decode()
        .map_err(|error| ThumbnailError::Decode {
            source: error,
            path: source.to_path_buf(),
        })
}

/// Scales so the shorter side equals `size`, keeping the aspect ratio.
/// Sources whose shorter side is already within `size` are left as is.
pub fn scale_to_shorter_side(image: DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let shorter = width.min(height).max(1);
    let size = size.max(1);
    if shorter <= size {
        return image;
    }

    let scale = f64::from(size) / f64::from(shorter);
    let new_width = ((f64::from(width) * scale).round() as u32).max(1);
    let new_height = ((f64::from(height) * scale).round() as u32).max(1);
    image.resize_exact(new_width, new_height, FilterType::Triangle)
}

fn write_rendition(image: &DynamicImage, target: &Path) -> Result<(), ThumbnailError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| ThumbnailError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
    }

    // Encode beside the target and rename into place; a half-written file
    // must never be mistaken for a cache hit. Concurrent writers of the same
    // rendition each get their own partial file.
    let sequence = PARTIAL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let partial = target.with_extension(format!(
        "{}.{}-{}.partial",
        RENDITION_EXTENSION,
        std::process::id(),
        sequence
    ));
    let result = File::create(&partial)
        .map_err(|source| ThumbnailError::Io {
            source,
            path: partial.clone(),
        })
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
            DynamicImage::ImageRgb8(image.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(|source| ThumbnailError::Encode {
                    source,
                    path: target.to_path_buf(),
                })?;
            writer.flush().map_err(|source| ThumbnailError::Io {
                source,
                path: partial.clone(),
            })
        })
        .and_then(|()| {
            fs::rename(&partial, target).map_err(|source| ThumbnailError::Io {
                source,
                path: target.to_path_buf(),
            })
        });

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

#[derive(Debug)]
pub enum ThumbnailError {
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    Decode {
        source: image::ImageError,
        path: PathBuf,
    },
    Encode {
        source: image::ImageError,
        path: PathBuf,
    },
    Video {
        source: VideoError,
        path: PathBuf,
    },
}

impl Display for ThumbnailError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { source, path } => write!(f, "io error for {}: {}", path.display(), source),
            Self::Decode { source, path } => {
                write!(f, "unable to decode {}: {}", path.display(), source)
            }
            Self::Encode { source, path } => {
                write!(f, "unable to encode {}: {}", path.display(), source)
            }
            Self::Video { source, path } => {
                write!(f, "no frame from {}: {}", path.display(), source)
            }
        }
    }
}

impl Error for ThumbnailError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Decode { source, .. } => Some(source),
            Self::Encode { source, .. } => Some(source),
            Self::Video { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::video::ProbeReport;
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    /// Stands in for ffmpeg: probes from canned JSON and renders a flat frame.
    pub(crate) struct StubVideo {
        pub probe_json: String,
        pub frame: (u32, u32),
        pub frames_served: AtomicUsize,
        pub stills_served: AtomicUsize,
    }

    impl StubVideo {
        pub(crate) fn new(probe_json: &str, frame: (u32, u32)) -> Self {
            Self {
                probe_json: probe_json.to_string(),
                frame,
                frames_served: AtomicUsize::new(0),
                stills_served: AtomicUsize::new(0),
            }
        }
    }

    impl VideoBackend for StubVideo {
        fn probe(&self, _path: &Path) -> Result<ProbeReport, VideoError> {
            ProbeReport::from_json(self.probe_json.as_bytes())
        }

        fn representative_frame(&self, _path: &Path) -> Result<DynamicImage, VideoError> {
            self.frames_served.fetch_add(1, Ordering::SeqCst);
            Ok(DynamicImage::new_rgb8(self.frame.0, self.frame.1))
        }

        fn still_image(&self, _path: &Path) -> Result<DynamicImage, VideoError> {
            self.stills_served.fetch_add(1, Ordering::SeqCst);
            Ok(DynamicImage::new_rgb8(self.frame.0, self.frame.1))
        }
    }

    fn hash(value: &str) -> ContentHash {
        ContentHash::parse(value).unwrap()
    }

    #[test]
    fn rendition_path_uses_two_bucket_levels() {
        let dir = tempdir().unwrap();
        let cache = ThumbnailCache::new(dir.path().to_path_buf()).unwrap();
        let path = cache.rendition_path(&hash("abcdef0123"), 256);
        assert_eq!(path, dir.path().join("ab").join("cd").join("ef0123-256.jpg"));
    }

    #[test]
    fn ensure_creates_rendition_once() {
        let image_dir = tempdir().unwrap();
        let thumb_dir = tempdir().unwrap();
        let source = image_dir.path().join("image.png");
        RgbaImage::from_pixel(1024, 768, Rgba([120, 20, 220, 128]))
            .save(&source)
            .unwrap();

        let cache = ThumbnailCache::new(thumb_dir.path().to_path_buf()).unwrap();
        let video = StubVideo::new("{}", (1, 1));
        let key = hash("0123456789abcdef");
        let first = cache
            .ensure(&key, &source, MediaKind::Image, 256, &video)
            .unwrap();
        assert!(first.generated);
        assert!(first.path.exists());

        let rendition = image::open(&first.path).unwrap();
        assert_eq!((rendition.width(), rendition.height()), (341, 256));
        assert!(!rendition.color().has_alpha());

        let second = cache
            .ensure(&key, &source, MediaKind::Image, 256, &video)
            .unwrap();
        assert!(!second.generated);
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn existing_rendition_is_a_hit_even_if_source_is_gone() {
        let thumb_dir = tempdir().unwrap();
        let cache = ThumbnailCache::new(thumb_dir.path().to_path_buf()).unwrap();
        let key = hash("feedface00");
        let target = cache.rendition_path(&key, 128);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"cached").unwrap();

        let video = StubVideo::new("{}", (1, 1));
        let rendition = cache
            .ensure(&key, Path::new("/missing/source.jpg"), MediaKind::Image, 128, &video)
            .unwrap();
        assert!(!rendition.generated);
    }

    #[test]
    fn video_renditions_come_from_the_backend_frame() {
        let thumb_dir = tempdir().unwrap();
        let cache = ThumbnailCache::new(thumb_dir.path().to_path_buf()).unwrap();
        let video = StubVideo::new("{}", (1920, 1080));
        let rendition = cache
            .ensure(&hash("aabbccddee"), Path::new("clip.mp4"), MediaKind::Video, 360, &video)
            .unwrap();
        assert!(rendition.generated);
        let decoded = image::open(&rendition.path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
        assert_eq!(video.frames_served.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn undecodable_source_fails_without_leaving_files() {
        let image_dir = tempdir().unwrap();
        let thumb_dir = tempdir().unwrap();
        let source = image_dir.path().join("broken.jpg");
        fs::write(&source, b"nope").unwrap();
        let cache = ThumbnailCache::new(thumb_dir.path().to_path_buf()).unwrap();
        let key = hash("1234567890");
        let result = cache.ensure(&key, &source, MediaKind::Image, 64, &StubVideo::new("{}", (1, 1)));
        assert!(matches!(result, Err(ThumbnailError::Decode { .. })));
        assert!(!cache.rendition_path(&key, 64).exists());
    }

    #[test]
    fn heic_renditions_are_decoded_by_the_backend() {
        let image_dir = tempdir().unwrap();
        let thumb_dir = tempdir().unwrap();
        let source = image_dir.path().join("IMG_0001.HEIC");
        fs::write(&source, b"ftypheic").unwrap();

        let cache = ThumbnailCache::new(thumb_dir.path().to_path_buf()).unwrap();
        let video = StubVideo::new("{}", (4032, 3024));
        let rendition = cache
            .ensure(&hash("0a0b0c0d0e"), &source, MediaKind::Image, 300, &video)
            .unwrap();
        assert!(rendition.generated);
        let decoded = image::open(&rendition.path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (400, 300));
        assert_eq!(video.stills_served.load(Ordering::SeqCst), 1);
        assert_eq!(video.frames_served.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mislabelled_image_is_decoded_by_content() {
        let image_dir = tempdir().unwrap();
        let thumb_dir = tempdir().unwrap();
        let png = image_dir.path().join("real.png");
        RgbaImage::from_pixel(200, 100, Rgba([1, 2, 3, 255]))
            .save(&png)
            .unwrap();
        let source = image_dir.path().join("actually-png.jpg");
        fs::rename(&png, &source).unwrap();

        let cache = ThumbnailCache::new(thumb_dir.path().to_path_buf()).unwrap();
        let rendition = cache
            .ensure(&hash("5555aaaa11"), &source, MediaKind::Image, 50, &StubVideo::new("{}", (1, 1)))
            .unwrap();
        let decoded = image::open(&rendition.path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
    }

    #[test]
    fn small_sources_are_not_upscaled() {
        let scaled = scale_to_shorter_side(DynamicImage::new_rgb8(100, 50), 256);
        assert_eq!((scaled.width(), scaled.height()), (100, 50));
    }
}
