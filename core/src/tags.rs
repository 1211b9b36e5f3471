//! Hash ↔ tag relation. Every mutation runs in one transaction and either
//! applies completely or not at all.

use crate::hasher::ContentHash;
use crate::store::MediaStore;
use rusqlite::{params, Connection, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Characters reserved by the filter-string encoding.
pub const FORBIDDEN_TAG_CHARS: &[char] = &['&', '=', ','];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenameStats {
    /// Rows whose tag name was rewritten in place.
    pub renamed: usize,
    /// Rows dropped because the hash already carried the new name.
    pub merged: usize,
}

pub struct TagStore<'a> {
    conn: &'a mut Connection,
}

impl MediaStore {
    pub fn tags(&mut self) -> TagStore<'_> {
        TagStore {
            conn: self.conn_mut(),
        }
    }
}

impl TagStore<'_> {
    /// Tags every hash with every tag, skipping pairs that already exist.
    /// Returns the number of new rows.
    pub fn add<S: AsRef<str>>(
        &mut self,
        tags: &[S],
        hashes: &[ContentHash],
    ) -> Result<usize, TagError> {
        for tag in tags {
            validate_tag(tag.as_ref())?;
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO media_tag (hash, tag) VALUES (?1, ?2)
                 ON CONFLICT(hash, tag) DO NOTHING",
            )?;
            for tag in tags {
                for hash in hashes {
                    inserted += insert.execute(params![hash, tag.as_ref()])?;
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Deletes every row carrying one of `tags`. Returns the number removed.
    pub fn remove<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<usize, TagError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        {
            let mut delete = tx.prepare_cached("DELETE FROM media_tag WHERE tag = ?1")?;
            for tag in tags {
                removed += delete.execute([tag.as_ref()])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Renames `old` to `new` on every hash. Where a hash already carries
    /// `new`, its `old` row is dropped instead of rewritten.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<RenameStats, TagError> {
        validate_tag(new)?;
        if old == new {
            return Ok(RenameStats::default());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let merged = tx.execute(
            "DELETE FROM media_tag
             WHERE tag = ?1
               AND hash IN (SELECT hash FROM media_tag WHERE tag = ?2)",
            params![old, new],
        )?;
        let renamed = tx.execute(
            "UPDATE media_tag SET tag = ?2 WHERE tag = ?1",
            params![old, new],
        )?;
        tx.commit()?;
        Ok(RenameStats { renamed, merged })
    }

    /// Distinct tag names in use, sorted.
    pub fn list(&self) -> Result<Vec<String>, TagError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT DISTINCT tag FROM media_tag ORDER BY tag")?;
        let tags = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tags)
    }

    pub fn tags_for(&self, hash: &ContentHash) -> Result<Vec<String>, TagError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT tag FROM media_tag WHERE hash = ?1 ORDER BY tag")?;
        let tags = stmt
            .query_map([hash], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tags)
    }
}

pub fn validate_tag(tag: &str) -> Result<(), TagError> {
    if tag.trim().is_empty() || tag.contains(FORBIDDEN_TAG_CHARS) {
        return Err(TagError::InvalidName(tag.to_string()));
    }
    Ok(())
}

#[derive(Debug)]
pub enum TagError {
    InvalidName(String),
    Database(rusqlite::Error),
}

impl Display for TagError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(tag) => write!(
                f,
                "invalid tag {:?}: tags must be non-empty and may not contain & = ,",
                tag
            ),
            Self::Database(error) => write!(f, "tag update failed: {}", error),
        }
    }
}

impl Error for TagError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Database(error) => Some(error),
            Self::InvalidName(_) => None,
        }
    }
}

impl From<rusqlite::Error> for TagError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Database(error)
    }
}
