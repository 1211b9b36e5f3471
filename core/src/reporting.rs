use crate::pipeline::IngestReport;
use crate::query::MediaRow;
use crate::store::CatalogCounts;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Serialize)]
struct QueryExport<'a> {
    filter: &'a str,
    count: usize,
    media: &'a [MediaRow],
}

#[derive(Debug)]
pub enum ReportingError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl Display for ReportingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io error: {}", error),
            Self::Serialization(error) => write!(f, "serialization error: {}", error),
        }
    }
}

impl Error for ReportingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            Self::Serialization(error) => Some(error),
        }
    }
}

pub fn print_ingest_report(report: &IngestReport, counts: &CatalogCounts) {
    println!("Scanned files:        {}", report.scanned);
    println!("New media:            {}", report.content_inserted);
    println!("New paths:            {}", report.paths_inserted);
    println!("Known content:        {}", report.hash_duplicates);
    println!("Known paths:          {}", report.path_duplicates);
    println!("Unsupported files:    {}", report.unsupported);
    if report.hash_failures > 0 {
        println!("Unreadable files:     {}", report.hash_failures);
    }
    println!(
        "Thumbnails written:   {} ({} failed)",
        report.thumbnails_generated, report.thumbnail_failures
    );
    println!(
        "Catalog now holds {} media across {} paths, {} tag assignments",
        counts.media, counts.paths, counts.tags
    );
}

pub fn print_rows(rows: &[MediaRow]) {
    for row in rows {
        let kind = if row.content.is_video { "video" } else { "image" };
        println!(
            "{}  {:>5}x{:<5}  {}  {}",
            row.content.hash,
            row.content.width,
            row.content.height,
            kind,
            row.path
        );
    }
}

/// Writes the rows as pretty JSON, together with the filter that selected them.
pub fn write_json(
    rows: &[MediaRow],
    filter: &str,
    output_path: &Path,
) -> Result<(), ReportingError> {
    let file = File::create(output_path).map_err(ReportingError::Io)?;
    let mut writer = BufWriter::new(file);
    write_rows(rows, filter, &mut writer)?;
    writer.flush().map_err(ReportingError::Io)
}

fn write_rows<W: Write>(rows: &[MediaRow], filter: &str, writer: W) -> Result<(), ReportingError> {
    let export = QueryExport {
        filter,
        count: rows.len(),
        media: rows,
    };
    serde_json::to_writer_pretty(writer, &export).map_err(ReportingError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_content;
    use tempfile::tempdir;

    #[test]
    fn json_export_flattens_content_into_each_row() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("rows.json");
        let rows = vec![MediaRow {
            path: String::from("/media/a.jpg"),
            name: String::from("a.jpg"),
            content: sample_content("abcdef01"),
        }];

        write_json(&rows, "tag=beach", &output).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(value["filter"], "tag=beach");
        assert_eq!(value["count"], 1);
        assert_eq!(value["media"][0]["path"], "/media/a.jpg");
        assert_eq!(value["media"][0]["hash"], "abcdef01");
        assert_eq!(value["media"][0]["width"], 800);
        assert_eq!(value["media"][0]["rotation"], 0);
    }
}
