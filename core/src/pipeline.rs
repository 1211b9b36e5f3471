//! Ingestion: walk a media root, analyse each file, and record it in the
//! catalog.
//!
//! Files are analysed by a rayon pool (or inline when running sequentially)
//! and handed over a bounded channel to a single committer, which owns the
//! database connection and writes in batches.

use crate::hasher::{hash_file, ContentHash};
use crate::media_type::{classify, MediaKind};
use crate::metadata;
use crate::store::{MediaContent, MediaPath, MediaStore, StagedRow, StoreError};
use crate::thumbnails::ThumbnailCache;
use crate::video::VideoBackend;
use crate::walker::MediaWalker;
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::ProgressBar;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadingMode {
    Parallel,
    Sequential,
}

#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub thumbnail_sizes: Vec<u32>,
    pub commit_batch_size: usize,
    pub threading: ThreadingMode,
    /// Pool size for parallel mode; `None` uses rayon's default.
    pub workers: Option<usize>,
}

impl IngestOptions {
    pub fn new(thumbnail_sizes: Vec<u32>, commit_batch_size: usize) -> Self {
        Self {
            thumbnail_sizes,
            commit_batch_size: commit_batch_size.max(1),
            threading: ThreadingMode::Parallel,
            workers: None,
        }
    }

    pub fn with_threading(mut self, threading: ThreadingMode) -> Self {
        self.threading = threading;
        self
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }
}

/// Everything the committer needs to know about one analysed file.
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub path: String,
    pub content: MediaContent,
    pub thumbnails_generated: usize,
    pub thumbnail_failures: usize,
}

#[derive(Debug)]
enum FileOutcome {
    Record(FileRecord),
    /// Not an image or video by extension.
    Ignored,
    Unsupported,
    HashFailed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub scanned: usize,
    pub unsupported: usize,
    pub hash_failures: usize,
    pub content_inserted: usize,
    pub paths_inserted: usize,
    pub hash_duplicates: usize,
    pub path_duplicates: usize,
    pub thumbnails_generated: usize,
    pub thumbnail_failures: usize,
    pub batches_committed: usize,
}

pub fn ingest(
    root: &Path,
    store: &mut MediaStore,
    cache: &ThumbnailCache,
    video: &dyn VideoBackend,
    options: &IngestOptions,
    progress_bar: &ProgressBar,
) -> Result<IngestReport, IngestError> {
    let walker = MediaWalker::new(root).map_err(|source| IngestError::Root {
        source,
        path: root.to_path_buf(),
    })?;
    info!(root = %walker.root().display(), "ingesting");

    let mut committer = Committer::seeded(store, options.commit_batch_size)?;
    match options.threading {
        ThreadingMode::Sequential => {
            for path in walker.files() {
                let outcome = analyse(&path, cache, video, options, progress_bar);
                committer.accept(outcome)?;
            }
        }
        ThreadingMode::Parallel => {
            let pool = build_pool(options.workers)?;
            let (sender, receiver) = bounded(CHANNEL_CAPACITY);
            thread::scope(|scope| {
                scope.spawn(|| {
                    pool.install(|| produce(&walker, sender, cache, video, options, progress_bar))
                });
                drain(&mut committer, receiver)
            })?;
        }
    }

    let report = committer.finish()?;
    info!(
        scanned = report.scanned,
        content = report.content_inserted,
        paths = report.paths_inserted,
        batches = report.batches_committed,
        "ingestion finished"
    );
    Ok(report)
}

fn build_pool(workers: Option<usize>) -> Result<rayon::ThreadPool, IngestError> {
    let mut builder =
        rayon::ThreadPoolBuilder::new().thread_name(|index| format!("ingest-{}", index));
    if let Some(workers) = workers {
        builder = builder.num_threads(workers);
    }
    builder.build().map_err(IngestError::Pool)
}

fn produce(
    walker: &MediaWalker,
    sender: Sender<FileOutcome>,
    cache: &ThumbnailCache,
    video: &dyn VideoBackend,
    options: &IngestOptions,
    progress_bar: &ProgressBar,
) {
    // A closed channel means the committer gave up; stop walking.
    let _ = walker.files().par_bridge().try_for_each(|path| {
        sender
            .send(analyse(&path, cache, video, options, progress_bar))
            .map_err(|_| ())
    });
}

fn drain(
    committer: &mut Committer<'_>,
    receiver: Receiver<FileOutcome>,
) -> Result<(), IngestError> {
    for outcome in receiver {
        committer.accept(outcome)?;
    }
    Ok(())
}

fn analyse(
    path: &Path,
    cache: &ThumbnailCache,
    video: &dyn VideoBackend,
    options: &IngestOptions,
    progress_bar: &ProgressBar,
) -> FileOutcome {
    progress_bar.inc(1);
    progress_bar.set_message(format!("Ingesting: {}", path.display()));

    let Some(kind) = classify(path).kind() else {
        return FileOutcome::Ignored;
    };

    let metadata = match metadata::extract(path, kind, video) {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!(path = %path.display(), %error, "skipping unsupported file");
            return FileOutcome::Unsupported;
        }
    };

    let hash = match hash_file(path) {
        Ok(hash) => hash,
        Err(error) => {
            warn!(path = %path.display(), %error, "unable to hash file");
            return FileOutcome::HashFailed;
        }
    };

    let (thumbnails_generated, thumbnail_failures) =
        render_thumbnails(path, &hash, kind, cache, video, &options.thumbnail_sizes);

    debug!(path = %path.display(), %hash, "analysed");
    FileOutcome::Record(FileRecord {
        path: path.to_string_lossy().into_owned(),
        content: MediaContent::from_metadata(hash, &metadata),
        thumbnails_generated,
        thumbnail_failures,
    })
}

fn render_thumbnails(
    path: &Path,
    hash: &ContentHash,
    kind: MediaKind,
    cache: &ThumbnailCache,
    video: &dyn VideoBackend,
    sizes: &[u32],
) -> (usize, usize) {
    let mut generated = 0;
    let mut failures = 0;
    for &size in sizes {
        match cache.ensure(hash, path, kind, size, video) {
            Ok(rendition) if rendition.generated => generated += 1,
            Ok(_) => {}
            Err(error) => {
                warn!(path = %path.display(), size, %error, "thumbnail failed");
                failures += 1;
            }
        }
    }
    (generated, failures)
}

/// Owns the store during ingestion and turns records into batched writes.
struct Committer<'a> {
    store: &'a mut MediaStore,
    batch_size: usize,
    known_hashes: FxHashSet<String>,
    known_paths: FxHashSet<String>,
    staged: Vec<StagedRow>,
    report: IngestReport,
}

impl<'a> Committer<'a> {
    fn seeded(store: &'a mut MediaStore, batch_size: usize) -> Result<Self, IngestError> {
        let known_hashes = store.known_hashes()?;
        let known_paths = store.known_paths()?;
        debug!(
            hashes = known_hashes.len(),
            paths = known_paths.len(),
            "seeded from catalog"
        );
        Ok(Self {
            store,
            batch_size: batch_size.max(1),
            known_hashes,
            known_paths,
            staged: Vec::with_capacity(batch_size.max(1)),
            report: IngestReport::default(),
        })
    }

    fn accept(&mut self, outcome: FileOutcome) -> Result<(), IngestError> {
        self.report.scanned += 1;
        let record = match outcome {
            FileOutcome::Record(record) => record,
            FileOutcome::Ignored => return Ok(()),
            FileOutcome::Unsupported => {
                self.report.unsupported += 1;
                return Ok(());
            }
            FileOutcome::HashFailed => {
                self.report.hash_failures += 1;
                return Ok(());
            }
        };

        self.report.thumbnails_generated += record.thumbnails_generated;
        self.report.thumbnail_failures += record.thumbnail_failures;

        let FileRecord { path, content, .. } = record;
        let hash = content.hash.clone();
        if self.known_hashes.insert(hash.as_str().to_string()) {
            self.staged.push(StagedRow::Content(content));
        } else {
            self.report.hash_duplicates += 1;
        }
        if self.known_paths.insert(path.clone()) {
            self.staged.push(StagedRow::Path(MediaPath { path, hash }));
        } else {
            self.report.path_duplicates += 1;
        }

        if self.staged.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IngestError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let outcome = self.store.commit_batch(&self.staged)?;
        self.report.content_inserted += outcome.content_inserted;
        self.report.paths_inserted += outcome.paths_inserted;
        self.report.batches_committed += 1;
        info!(
            rows = self.staged.len(),
            content = outcome.content_inserted,
            paths = outcome.paths_inserted,
            "batch committed"
        );
        self.staged.clear();
        Ok(())
    }

    fn finish(mut self) -> Result<IngestReport, IngestError> {
        self.flush()?;
        Ok(self.report)
    }
}

#[derive(Debug)]
pub enum IngestError {
    Root {
        source: std::io::Error,
        path: PathBuf,
    },
    Pool(rayon::ThreadPoolBuildError),
    Store(StoreError),
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root { source, path } => {
                write!(f, "unable to open media root {}: {}", path.display(), source)
            }
            Self::Pool(error) => write!(f, "unable to start worker pool: {}", error),
            Self::Store(error) => write!(f, "catalog write failed: {}", error),
        }
    }
}

impl Error for IngestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Root { source, .. } => Some(source),
            Self::Pool(error) => Some(error),
            Self::Store(error) => Some(error),
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}
