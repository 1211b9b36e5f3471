use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Recursive file enumeration under a media root.
///
/// Every call to [`MediaWalker::files`] starts a fresh walk; nothing is
/// memoised between calls.
#[derive(Clone, Debug)]
pub struct MediaWalker {
    root: PathBuf,
}

impl MediaWalker {
    /// Canonicalises `root` so every produced path is absolute.
    pub fn new(root: &Path) -> std::io::Result<Self> {
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily yields files below the root. Entries are sorted by name within
    /// each directory, so the order is stable across runs. Symlinks that
    /// resolve to files are yielded under their own path.
    pub fn files(&self) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.into_path()),
                Err(error) => {
                    warn!(%error, "skipping unreadable entry");
                    None
                }
            })
            .filter(|path| path.is_file())
    }
}

/// Counts the files a walk of `root` would yield. Used to size progress bars.
pub fn count_files(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .count() as u64
}
