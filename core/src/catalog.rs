//! Read-side context shared by the CLI commands.

use crate::config::LibraryConfig;
use crate::hasher::ContentHash;
use crate::query::{MediaQuery, MediaRow};
use crate::store::{MediaStore, StoreError};
use crate::thumbnails::{ThumbnailCache, ThumbnailError};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Catalog {
    database: PathBuf,
    thumbnails: ThumbnailCache,
    sizes: Vec<u32>,
}

/// Answer to "where is the rendition of `hash` at `size`?".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenditionLookup {
    Ready(PathBuf),
    /// The media is catalogued but this rendition was never written (or
    /// has been removed); the path is where it would live.
    NotRendered(PathBuf),
    UnknownMedia,
    UnsupportedSize,
}

impl Catalog {
    pub fn new(database: PathBuf, thumbnails: ThumbnailCache, sizes: Vec<u32>) -> Self {
        let mut sizes = sizes;
        sizes.sort_unstable();
        sizes.dedup();
        Self {
            database,
            thumbnails,
            sizes,
        }
    }

    pub fn from_config(config: &LibraryConfig) -> Result<Self, ThumbnailError> {
        Ok(Self::new(
            config.database_path(),
            ThumbnailCache::new(config.thumbnail_root())?,
            config.thumbnail_sizes(),
        ))
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    pub fn thumbnails(&self) -> &ThumbnailCache {
        &self.thumbnails
    }

    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    pub fn default_size(&self) -> Option<u32> {
        self.sizes.first().copied()
    }

    /// Opens the catalog for ingestion, creating it on first use.
    pub fn open_store(&self) -> Result<MediaStore, StoreError> {
        MediaStore::open(&self.database)
    }

    /// Opens the catalog for every other command; fails if nothing has been
    /// ingested yet.
    pub fn open_existing(&self) -> Result<MediaStore, StoreError> {
        MediaStore::open_existing(&self.database)
    }

    pub fn query(&self, query: &MediaQuery) -> Result<Vec<MediaRow>, StoreError> {
        self.open_existing()?.query(query)
    }

    pub fn rendition(&self, hash: &ContentHash, size: u32) -> Result<RenditionLookup, StoreError> {
        if !self.sizes.contains(&size) {
            return Ok(RenditionLookup::UnsupportedSize);
        }
        if !self.open_existing()?.contains_hash(hash)? {
            return Ok(RenditionLookup::UnknownMedia);
        }
        let path = self.thumbnails.rendition_path(hash, size);
        if path.is_file() {
            Ok(RenditionLookup::Ready(path))
        } else {
            Ok(RenditionLookup::NotRendered(path))
        }
    }
}
