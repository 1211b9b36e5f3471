//! Conjunctive filtering over the catalog.
//!
//! Each filter is compiled into an independent predicate on the
//! `media_path ⋈ media` join, so the result never depends on the order in
//! which filters were added.

use crate::store::{content_from_row, MediaContent, MediaStore, StoreError, CONTENT_COLUMNS};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Path,
    /// Oldest first; rows without a capture time go last. Ties break on path.
    CaptureTime,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeToken {
    Image,
    Video,
    /// Lowercase extension without the leading dot.
    Extension(String),
}

impl TypeToken {
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim().trim_start_matches('.').to_lowercase();
        match token.as_str() {
            "" => None,
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => Some(Self::Extension(token)),
        }
    }

    fn as_filter_token(&self) -> &str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Extension(extension) => extension,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaQuery {
    pub path_prefix: Option<String>,
    pub tags_include: BTreeSet<String>,
    pub tags_exclude: BTreeSet<String>,
    pub types: BTreeSet<TypeToken>,
    pub order: SortOrder,
}

/// A catalog entry joined with one of its paths.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MediaRow {
    pub path: String,
    pub name: String,
    #[serde(flatten)]
    pub content: MediaContent,
}

impl MediaQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn including(mut self, tag: impl Into<String>) -> Self {
        self.tags_include.insert(tag.into());
        self
    }

    pub fn excluding(mut self, tag: impl Into<String>) -> Self {
        self.tags_exclude.insert(tag.into());
        self
    }

    pub fn with_type(mut self, token: TypeToken) -> Self {
        self.types.insert(token);
        self
    }

    pub fn ordered_by(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Parses `path=P&tag=A&tag=B&itag=C&types=video,jpg&sort=date`.
    /// `tag` and `itag` may repeat or carry comma-separated lists.
    pub fn from_filter_string(filter: &str) -> Result<Self, QueryError> {
        let mut query = Self::new();
        for field in filter.trim_start_matches('?').split('&') {
            if field.is_empty() {
                continue;
            }
            let (name, value) = field
                .split_once('=')
                .ok_or_else(|| QueryError::Malformed(field.to_string()))?;
            let list = || value.split(',').filter(|item| !item.is_empty());
            match name {
                "path" => query.path_prefix = Some(value.to_string()),
                "tag" => query.tags_include.extend(list().map(str::to_string)),
                "itag" => query.tags_exclude.extend(list().map(str::to_string)),
                "types" => query.types.extend(list().filter_map(TypeToken::parse)),
                "sort" => {
                    query.order = match value {
                        "path" => SortOrder::Path,
                        "date" => SortOrder::CaptureTime,
                        other => return Err(QueryError::UnknownSort(other.to_string())),
                    }
                }
                other => return Err(QueryError::UnknownField(other.to_string())),
            }
        }
        Ok(query)
    }

    pub fn to_filter_string(&self) -> String {
        let mut fields = Vec::new();
        if let Some(prefix) = &self.path_prefix {
            fields.push(format!("path={}", prefix));
        }
        fields.extend(self.tags_include.iter().map(|tag| format!("tag={}", tag)));
        fields.extend(self.tags_exclude.iter().map(|tag| format!("itag={}", tag)));
        if !self.types.is_empty() {
            let tokens: Vec<_> = self.types.iter().map(TypeToken::as_filter_token).collect();
            fields.push(format!("types={}", tokens.join(",")));
        }
        if self.order == SortOrder::CaptureTime {
            fields.push(String::from("sort=date"));
        }
        fields.join("&")
    }

    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = format!(
            "SELECT p.path, {} FROM media_path p JOIN media m ON m.hash = p.hash WHERE 1 = 1",
            CONTENT_COLUMNS
        );
        let mut values = Vec::new();

        if let Some(prefix) = &self.path_prefix {
            sql.push_str(" AND substr(p.path, 1, ?) = ?");
            values.push(Value::Integer(prefix.chars().count() as i64));
            values.push(Value::Text(prefix.clone()));
        }

        if !self.types.is_empty() {
            let clauses: Vec<String> = self
                .types
                .iter()
                .map(|token| match token {
                    TypeToken::Image => String::from("m.is_video = 0"),
                    TypeToken::Video => String::from("m.is_video = 1"),
                    TypeToken::Extension(extension) => {
                        let suffix = format!(".{}", extension);
                        values.push(Value::Integer(suffix.chars().count() as i64));
                        values.push(Value::Text(suffix));
                        String::from("lower(substr(p.path, -?)) = ?")
                    }
                })
                .collect();
            sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
        }

        if !self.tags_include.is_empty() {
            sql.push_str(&format!(
                " AND m.hash IN (SELECT hash FROM media_tag WHERE tag IN ({}) \
                 GROUP BY hash HAVING COUNT(DISTINCT tag) = ?)",
                placeholders(self.tags_include.len())
            ));
            values.extend(self.tags_include.iter().cloned().map(Value::Text));
            values.push(Value::Integer(self.tags_include.len() as i64));
        }

        if !self.tags_exclude.is_empty() {
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM media_tag t WHERE t.hash = m.hash AND t.tag IN ({}))",
                placeholders(self.tags_exclude.len())
            ));
            values.extend(self.tags_exclude.iter().cloned().map(Value::Text));
        }

        sql.push_str(match self.order {
            SortOrder::Path => " ORDER BY p.path ASC",
            SortOrder::CaptureTime => {
                " ORDER BY m.captured_at IS NULL, m.captured_at ASC, p.path ASC"
            }
        });
        (sql, values)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub fn query(conn: &Connection, query: &MediaQuery) -> Result<Vec<MediaRow>, StoreError> {
    let (sql, values) = query.to_sql();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            let path: String = row.get(0)?;
            let name = Path::new(&path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone());
            Ok(MediaRow {
                path,
                name,
                content: content_from_row(row, 1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

impl MediaStore {
    pub fn query(&self, filter: &MediaQuery) -> Result<Vec<MediaRow>, StoreError> {
        query(self.conn(), filter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    Malformed(String),
    UnknownField(String),
    UnknownSort(String),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(field) => write!(f, "filter field {:?} has no value", field),
            Self::UnknownField(name) => write!(f, "unknown filter field {:?}", name),
            Self::UnknownSort(order) => write!(f, "unknown sort order {:?}", order),
        }
    }
}

impl Error for QueryError {}
