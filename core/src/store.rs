//! SQLite-backed catalog: one `media` row per distinct content hash, one
//! `media_path` row per path, and the `media_tag` relation.

use crate::hasher::{ContentHash, InvalidHash};
use crate::metadata::MediaMetadata;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const MIGRATIONS: &[(&str, &str)] = &[("001_initial", INITIAL_SCHEMA)];

const INITIAL_SCHEMA: &str = "
CREATE TABLE media (
    hash         TEXT PRIMARY KEY NOT NULL,
    captured_at  INTEGER,
    size_bytes   INTEGER NOT NULL,
    width        INTEGER NOT NULL,
    height       INTEGER NOT NULL,
    aspect_ratio REAL NOT NULL,
    is_video     INTEGER NOT NULL,
    duration     TEXT,
    rotation     INTEGER NOT NULL DEFAULT 0 CHECK (rotation IN (0, 90, 180, 270))
);

CREATE TABLE media_path (
    path TEXT PRIMARY KEY NOT NULL,
    hash TEXT NOT NULL REFERENCES media(hash)
);
CREATE INDEX media_path_hash ON media_path(hash);

CREATE TABLE media_tag (
    hash TEXT NOT NULL REFERENCES media(hash),
    tag  TEXT NOT NULL,
    PRIMARY KEY (hash, tag)
);
CREATE INDEX media_tag_tag ON media_tag(tag);
";

/// Columns of `media`, in the order [`content_from_row`] expects.
pub(crate) const CONTENT_COLUMNS: &str = "m.hash, m.captured_at, m.size_bytes, m.width, \
     m.height, m.aspect_ratio, m.is_video, m.duration, m.rotation";

/// User-applied display rotation, serialised as degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotateDirection {
    Clockwise,
    CounterClockwise,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    pub fn from_degrees(degrees: i64) -> Option<Self> {
        match degrees {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    /// Quarter turn in `direction`, wrapping around.
    pub fn turned(self, direction: RotateDirection) -> Self {
        match (self, direction) {
            (Self::Deg0, RotateDirection::Clockwise) => Self::Deg90,
            (Self::Deg90, RotateDirection::Clockwise) => Self::Deg180,
            (Self::Deg180, RotateDirection::Clockwise) => Self::Deg270,
            (Self::Deg270, RotateDirection::Clockwise) => Self::Deg0,
            (Self::Deg0, RotateDirection::CounterClockwise) => Self::Deg270,
            (Self::Deg90, RotateDirection::CounterClockwise) => Self::Deg0,
            (Self::Deg180, RotateDirection::CounterClockwise) => Self::Deg90,
            (Self::Deg270, RotateDirection::CounterClockwise) => Self::Deg180,
        }
    }
}

impl From<Rotation> for u32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

impl TryFrom<u32> for Rotation {
    type Error = String;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        Self::from_degrees(i64::from(degrees))
            .ok_or_else(|| format!("rotation must be 0, 90, 180 or 270, got {}", degrees))
    }
}

impl ToSql for Rotation {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.degrees())))
    }
}

impl FromSql for Rotation {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let degrees = value.as_i64()?;
        Self::from_degrees(degrees).ok_or(FromSqlError::OutOfRange(degrees))
    }
}

impl ToSql for ContentHash {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ContentHash {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        ContentHash::parse(text).map_err(|error: InvalidHash| FromSqlError::Other(Box::new(error)))
    }
}

/// One row of `media`. Created once per hash; only `rotation` changes later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaContent {
    pub hash: ContentHash,
    pub captured_at: Option<i64>,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub is_video: bool,
    pub duration: Option<String>,
    pub rotation: Rotation,
}

impl MediaContent {
    pub fn from_metadata(hash: ContentHash, metadata: &MediaMetadata) -> Self {
        let dimensions = metadata.dimensions();
        Self {
            hash,
            captured_at: metadata.captured_at().map(|time| time.epoch),
            size_bytes: metadata.size_bytes(),
            width: dimensions.width,
            height: dimensions.height,
            aspect_ratio: dimensions.aspect_ratio(),
            is_video: metadata.kind().is_video(),
            duration: metadata.duration().map(str::to_string),
            rotation: Rotation::Deg0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPath {
    pub path: String,
    pub hash: ContentHash,
}

/// A row waiting for the next batch commit.
#[derive(Clone, Debug, PartialEq)]
pub enum StagedRow {
    Content(MediaContent),
    Path(MediaPath),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub content_inserted: usize,
    pub paths_inserted: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub media: u64,
    pub paths: u64,
    pub tags: u64,
}

pub struct MediaStore {
    conn: Connection,
}

impl MediaStore {
    /// Opens (creating if needed) the catalog at `path` and applies pending
    /// migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a catalog that must already exist. Nothing is created when the
    /// file is missing.
    pub fn open_existing(path: &Path) -> Result<Self, StoreError> {
        if !path.is_file() {
            return Err(StoreError::MissingCatalog(path.to_path_buf()));
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Self::from_connection(Connection::open_with_flags(path, flags)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn known_hashes(&self) -> Result<FxHashSet<String>, StoreError> {
        self.column_set("SELECT hash FROM media")
    }

    pub fn known_paths(&self) -> Result<FxHashSet<String>, StoreError> {
        self.column_set("SELECT path FROM media_path")
    }

    fn column_set(&self, sql: &str) -> Result<FxHashSet<String>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let values = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<FxHashSet<_>>>()?;
        Ok(values)
    }

    pub fn contains_hash(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare_cached("SELECT 1 FROM media WHERE hash = ?1")?;
        Ok(stmt.exists([hash])?)
    }

    pub fn contains_path(&self, path: &str) -> Result<bool, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM media_path WHERE path = ?1")?;
        Ok(stmt.exists([path])?)
    }

    /// Writes one batch in a single transaction. Content rows go first so
    /// path rows staged in the same batch can reference them. Any failure
    /// rolls the whole batch back.
    pub fn commit_batch(&mut self, rows: &[StagedRow]) -> Result<BatchOutcome, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut outcome = BatchOutcome::default();
        {
            let mut insert_content = tx.prepare_cached(
                "INSERT INTO media (hash, captured_at, size_bytes, width, height, aspect_ratio,
                                    is_video, duration, rotation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(hash) DO NOTHING",
            )?;
            for content in rows.iter().filter_map(|row| match row {
                StagedRow::Content(content) => Some(content),
                StagedRow::Path(_) => None,
            }) {
                outcome.content_inserted += insert_content.execute(params![
                    content.hash,
                    content.captured_at,
                    content.size_bytes as i64,
                    content.width,
                    content.height,
                    content.aspect_ratio,
                    content.is_video,
                    content.duration,
                    content.rotation,
                ])?;
            }

            let mut insert_path = tx.prepare_cached(
                "INSERT INTO media_path (path, hash) VALUES (?1, ?2)
                 ON CONFLICT(path) DO NOTHING",
            )?;
            for path in rows.iter().filter_map(|row| match row {
                StagedRow::Path(path) => Some(path),
                StagedRow::Content(_) => None,
            }) {
                outcome.paths_inserted += insert_path.execute(params![path.path, path.hash])?;
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    pub fn media(&self, hash: &ContentHash) -> Result<Option<MediaContent>, StoreError> {
        let sql = format!("SELECT {} FROM media m WHERE m.hash = ?1", CONTENT_COLUMNS);
        let content = self
            .conn
            .query_row(&sql, [hash], |row| content_from_row(row, 0))
            .optional()?;
        Ok(content)
    }

    pub fn paths_for(&self, hash: &ContentHash) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT path FROM media_path WHERE hash = ?1 ORDER BY path")?;
        let paths = stmt
            .query_map([hash], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
    }

    /// Turns the stored display rotation of `hash` by a quarter.
    pub fn rotate(
        &mut self,
        hash: &ContentHash,
        direction: RotateDirection,
    ) -> Result<Rotation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Rotation = tx
            .query_row("SELECT rotation FROM media WHERE hash = ?1", [hash], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| StoreError::UnknownMedia(hash.to_string()))?;
        let next = current.turned(direction);
        tx.execute(
            "UPDATE media SET rotation = ?1 WHERE hash = ?2",
            params![next, hash],
        )?;
        tx.commit()?;
        Ok(next)
    }

    pub fn counts(&self) -> Result<CatalogCounts, StoreError> {
        let count = |sql: &str| -> Result<u64, StoreError> {
            let value: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(value as u64)
        };
        Ok(CatalogCounts {
            media: count("SELECT COUNT(*) FROM media")?,
            paths: count("SELECT COUNT(*) FROM media_path")?,
            tags: count("SELECT COUNT(*) FROM media_tag")?,
        })
    }
}

/// Reads the [`CONTENT_COLUMNS`] starting at column `offset`.
pub(crate) fn content_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<MediaContent> {
    Ok(MediaContent {
        hash: row.get(offset)?,
        captured_at: row.get(offset + 1)?,
        size_bytes: row.get::<_, i64>(offset + 2)? as u64,
        width: row.get(offset + 3)?,
        height: row.get(offset + 4)?,
        aspect_ratio: row.get(offset + 5)?,
        is_video: row.get(offset + 6)?,
        duration: row.get(offset + 7)?,
        rotation: row.get(offset + 8)?,
    })
}

fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS __schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    for (version, sql) in MIGRATIONS {
        let already_applied = {
            let mut stmt = conn.prepare("SELECT 1 FROM __schema_migrations WHERE version = ?1")?;
            stmt.exists([version])?
        };

        if !already_applied {
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO __schema_migrations (version) VALUES (?1)",
                (version,),
            )?;
            tx.commit()?;
            info!(version, "applied catalog migration");
        }
    }

    Ok(())
}

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    UnknownMedia(String),
    MissingCatalog(PathBuf),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(error) => write!(f, "catalog error: {}", error),
            Self::Io { source, path } => write!(f, "io error for {}: {}", path.display(), source),
            Self::UnknownMedia(hash) => write!(f, "no media with hash {}", hash),
            Self::MissingCatalog(path) => write!(
                f,
                "no catalog at {}; run `galleria ingest` first",
                path.display()
            ),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(error) => Some(error),
            Self::Io { source, .. } => Some(source),
            Self::UnknownMedia(_) | Self::MissingCatalog(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Sqlite(error)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) fn sample_content(hash: &str) -> MediaContent {
        MediaContent {
            hash: ContentHash::parse(hash).unwrap(),
            captured_at: Some(1_700_000_000),
            size_bytes: 2048,
            width: 800,
            height: 600,
            aspect_ratio: 800.0 / 600.0,
            is_video: false,
            duration: None,
            rotation: Rotation::Deg0,
        }
    }

    pub(crate) fn sample_path(path: &str, hash: &str) -> MediaPath {
        MediaPath {
            path: path.to_string(),
            hash: ContentHash::parse(hash).unwrap(),
        }
    }

    #[test]
    fn batch_commit_inserts_content_then_paths() {
        let mut store = MediaStore::open_in_memory().unwrap();
        let outcome = store
            .commit_batch(&[
                StagedRow::Path(sample_path("/m/a.jpg", "aaaaa1")),
                StagedRow::Content(sample_content("aaaaa1")),
                StagedRow::Path(sample_path("/m/copy/a.jpg", "aaaaa1")),
            ])
            .unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                content_inserted: 1,
                paths_inserted: 2
            }
        );
        let counts = store.counts().unwrap();
        assert_eq!((counts.media, counts.paths, counts.tags), (1, 2, 0));

        let hash = ContentHash::parse("aaaaa1").unwrap();
        assert_eq!(store.media(&hash).unwrap(), Some(sample_content("aaaaa1")));
        assert_eq!(
            store.paths_for(&hash).unwrap(),
            vec!["/m/a.jpg".to_string(), "/m/copy/a.jpg".to_string()]
        );
    }

    #[test]
    fn recommitting_existing_rows_writes_nothing() {
        let mut store = MediaStore::open_in_memory().unwrap();
        let rows = [
            StagedRow::Content(sample_content("bbbbb2")),
            StagedRow::Path(sample_path("/m/b.jpg", "bbbbb2")),
        ];
        store.commit_batch(&rows).unwrap();
        let again = store.commit_batch(&rows).unwrap();
        assert_eq!(again, BatchOutcome::default());
    }

    #[test]
    fn failed_batch_rolls_back_entirely() {
        let mut store = MediaStore::open_in_memory().unwrap();
        let result = store.commit_batch(&[
            StagedRow::Content(sample_content("ccccc3")),
            StagedRow::Path(sample_path("/m/orphan.jpg", "ddddd4")),
        ]);
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        let counts = store.counts().unwrap();
        assert_eq!((counts.media, counts.paths), (0, 0));
    }

    #[test]
    fn rotation_wraps_in_both_directions() {
        let mut store = MediaStore::open_in_memory().unwrap();
        let mut content = sample_content("eeeee5");
        content.rotation = Rotation::Deg270;
        store.commit_batch(&[StagedRow::Content(content)]).unwrap();
        let hash = ContentHash::parse("eeeee5").unwrap();

        assert_eq!(
            store.rotate(&hash, RotateDirection::Clockwise).unwrap(),
            Rotation::Deg0
        );
        assert_eq!(
            store.rotate(&hash, RotateDirection::CounterClockwise).unwrap(),
            Rotation::Deg270
        );
        assert_eq!(store.media(&hash).unwrap().unwrap().rotation, Rotation::Deg270);
    }

    #[test]
    fn rotating_unknown_media_fails() {
        let mut store = MediaStore::open_in_memory().unwrap();
        let hash = ContentHash::parse("fffff6").unwrap();
        assert!(matches!(
            store.rotate(&hash, RotateDirection::Clockwise),
            Err(StoreError::UnknownMedia(_))
        ));
    }

    #[test]
    fn rotation_column_rejects_odd_angles() {
        let store = MediaStore::open_in_memory().unwrap();
        let result = store.conn().execute(
            "INSERT INTO media (hash, size_bytes, width, height, aspect_ratio, is_video, rotation)
             VALUES ('abcab', 1, 1, 1, 1.0, 0, 45)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn reopening_keeps_data_and_skips_applied_migrations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("gallery.db");
        {
            let mut store = MediaStore::open(&path).unwrap();
            store
                .commit_batch(&[StagedRow::Content(sample_content("12345a"))])
                .unwrap();
        }
        let store = MediaStore::open(&path).unwrap();
        assert!(store
            .contains_hash(&ContentHash::parse("12345a").unwrap())
            .unwrap());
        assert!(!store.contains_path("/nowhere").unwrap());
        assert_eq!(store.known_hashes().unwrap().len(), 1);
        assert!(store.known_paths().unwrap().is_empty());
    }

    #[test]
    fn open_existing_refuses_to_create_a_catalog() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("gallery.db");
        assert!(matches!(
            MediaStore::open_existing(&path),
            Err(StoreError::MissingCatalog(_))
        ));
        assert!(!path.parent().unwrap().exists());

        MediaStore::open(&path).unwrap();
        assert!(MediaStore::open_existing(&path).is_ok());
    }

    #[test]
    fn concurrent_rotations_serialise() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gallery.db");
        MediaStore::open(&path)
            .unwrap()
            .commit_batch(&[StagedRow::Content(sample_content("abc123"))])
            .unwrap();
        let hash = ContentHash::parse("abc123").unwrap();

        std::thread::scope(|scope| {
            for turns in [5, 2] {
                let (path, hash) = (&path, &hash);
                scope.spawn(move || {
                    let mut store = MediaStore::open_existing(path).unwrap();
                    for _ in 0..turns {
                        store.rotate(hash, RotateDirection::Clockwise).unwrap();
                    }
                });
            }
        });

        let store = MediaStore::open_existing(&path).unwrap();
        assert_eq!(store.media(&hash).unwrap().unwrap().rotation, Rotation::Deg270);
    }
}
