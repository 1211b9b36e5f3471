//! Library configuration loaded from TOML.
//!
//! Relative paths are resolved against the directory holding the config
//! file, so a library can be moved as a whole.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DATABASE_FILE: &str = "gallery.db";
pub const THUMBNAIL_DIR: &str = "thumbnails";

const DEFAULT_THUMBNAIL_SIZE: u32 = 256;
const DEFAULT_COMMIT_BATCH_SIZE: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_media_dir")]
    pub media: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data: PathBuf,
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            media: default_media_dir(),
            data: default_data_dir(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSection {
    /// Rendition sizes in pixels along the shorter side.
    #[serde(default = "default_thumbnail_sizes")]
    pub thumbnail_size: Vec<u32>,
}

fn default_thumbnail_sizes() -> Vec<u32> {
    vec![DEFAULT_THUMBNAIL_SIZE]
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            thumbnail_size: default_thumbnail_sizes(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_commit_batch_size")]
    pub commit_batch_size: usize,
}

fn default_commit_batch_size() -> usize {
    DEFAULT_COMMIT_BATCH_SIZE
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            commit_batch_size: default_commit_batch_size(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSection {
    /// Worker threads; 0 lets rayon decide.
    #[serde(default)]
    pub threads: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub media: MediaSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub ingest: IngestSection,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    base_dir: PathBuf,
}

impl LibraryConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            source,
            path: path.to_path_buf(),
        })?;
        config.base_dir = config_dir(path);
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists; otherwise returns defaults resolved
    /// against the directory `path` would live in.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        Ok(Self {
            base_dir: config_dir(path),
            ..Self::default()
        })
    }

    /// `config/config.toml` in the working directory, else the per-user
    /// config location when one exists there.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(DEFAULT_CONFIG_PATH);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join("galleria").join("config.toml"))
            .filter(|candidate| candidate.exists())
            .unwrap_or(local)
    }

    pub fn media_root(&self) -> PathBuf {
        self.resolve(&self.paths.media)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.paths.data)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE)
    }

    pub fn thumbnail_root(&self) -> PathBuf {
        self.data_dir().join(THUMBNAIL_DIR)
    }

    /// Configured sizes, deduplicated and ascending.
    pub fn thumbnail_sizes(&self) -> Vec<u32> {
        let mut sizes = self.media.thumbnail_size.clone();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    pub fn commit_batch_size(&self) -> usize {
        self.database.commit_batch_size
    }

    pub fn worker_threads(&self) -> Option<usize> {
        (self.ingest.threads > 0).then_some(self.ingest.threads)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.media.thumbnail_size.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "media.thumbnail_size must list at least one size",
            )));
        }
        if self.media.thumbnail_size.contains(&0) {
            return Err(ConfigError::Invalid(String::from(
                "media.thumbnail_size entries must be positive",
            )));
        }
        if self.database.commit_batch_size == 0 {
            return Err(ConfigError::Invalid(String::from(
                "database.commit_batch_size must be positive",
            )));
        }
        Ok(())
    }
}

fn config_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { source, path } => {
                write!(f, "unable to read config {}: {}", path.display(), source)
            }
            Self::Parse { source, path } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
            Self::Invalid(message) => write!(f, "invalid config: {}", message),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn full_config_resolves_relative_to_its_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[paths]
media = "photos"
data = "/var/lib/galleria"

[media]
thumbnail_size = [512, 256, 512]

[database]
commit_batch_size = 50

[ingest]
threads = 4
"#,
        )
        .unwrap();

        let config = LibraryConfig::load(&path).unwrap();
        assert_eq!(config.media_root(), dir.path().join("photos"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/galleria/gallery.db")
        );
        assert_eq!(
            config.thumbnail_root(),
            PathBuf::from("/var/lib/galleria/thumbnails")
        );
        assert_eq!(config.thumbnail_sizes(), vec![256, 512]);
        assert_eq!(config.commit_batch_size(), 50);
        assert_eq!(config.worker_threads(), Some(4));
    }

    #[test]
    fn missing_sections_use_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[paths]\nmedia = \"m\"\n").unwrap();

        let config = LibraryConfig::load(&path).unwrap();
        assert_eq!(config.thumbnail_sizes(), vec![256]);
        assert_eq!(config.commit_batch_size(), 500);
        assert_eq!(config.worker_threads(), None);
        assert_eq!(config.data_dir(), dir.path().join("data"));
    }

    #[test]
    fn absent_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = LibraryConfig::load_or_default(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.media_root(), dir.path().join("media"));
        assert!(matches!(
            LibraryConfig::load(dir.path().join("nope.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[database]\ncommit_batch_size = 0\n").unwrap();
        assert!(matches!(
            LibraryConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        fs::write(&path, "[media]\nthumbnail_size = \"big\"\n").unwrap();
        assert!(matches!(
            LibraryConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
