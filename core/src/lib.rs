//! Core catalog engine for Galleria.
//!
//! Walks a media root, records every distinct image and video once by
//! content hash (with every path it was seen at), keeps bucketed thumbnail
//! renditions on disk, and answers tag and path queries over the catalog.
//! The records exposed here (`MediaContent`, `MediaRow`, `IngestReport`)
//! are plain data and serialisable for downstream consumers.

pub mod catalog;
pub mod config;
pub mod hasher;
pub mod media_type;
pub mod metadata;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod reporting;
pub mod store;
pub mod tags;
pub mod thumbnails;
pub mod video;
pub mod walker;

pub use catalog::{Catalog, RenditionLookup};
pub use config::{ConfigError, LibraryConfig, DEFAULT_CONFIG_PATH};
pub use hasher::{hash_file, ContentHash, InvalidHash};
pub use media_type::{classify, MediaKind, MediaType};
pub use metadata::{
    extract, CaptureSource, CaptureTime, Dimensions, MediaMetadata, MetadataError,
};
pub use pipeline::{ingest, IngestError, IngestOptions, IngestReport, ThreadingMode};
pub use query::{MediaQuery, MediaRow, QueryError, SortOrder, TypeToken};
pub use reporting::{print_ingest_report, print_rows, write_json, ReportingError};
pub use store::{
    CatalogCounts, MediaContent, MediaPath, MediaStore, RotateDirection, Rotation, StoreError,
};
pub use tags::{RenameStats, TagError, TagStore};
pub use thumbnails::{Rendition, ThumbnailCache, ThumbnailError};
pub use video::{FfmpegBackend, VideoBackend, VideoError};
pub use walker::{count_files, MediaWalker};
