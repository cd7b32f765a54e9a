//! CloudKit Dashboard export files as a record source.
//!
//! An export file is a JSON object `{"records": [...]}` with records in the
//! same shape the query API returns. The configured path may be a single file
//! or a directory whose `*.json` files are all read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::source::{RecordSource, SourceRecord};

/// Configuration for export file import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Export file or directory of export files.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ExportFile {
    #[serde(default)]
    records: Vec<SourceRecord>,
}

/// Reads records from export files.
pub struct ExportFileSource {
    config: ExportConfig,
}

impl ExportFileSource {
    /// Creates a new export file source.
    #[must_use]
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    /// Lists the export files, sorted by name.
    fn files(&self) -> Result<Vec<PathBuf>> {
        let path = &self.config.path;
        if path.is_file() {
            return Ok(vec![path.clone()]);
        }
        if !path.is_dir() {
            return Err(Error::SourceRead(format!(
                "export path '{}' does not exist",
                path.display()
            )));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    fn read_file(path: &Path) -> Result<Vec<SourceRecord>> {
        let file = File::open(path).map_err(|e| {
            Error::SourceRead(format!("cannot open export file '{}': {}", path.display(), e))
        })?;
        let parsed: ExportFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::SourceRead(format!(
                "failed to parse export file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(parsed.records)
    }
}

#[async_trait]
impl RecordSource for ExportFileSource {
    fn source_type(&self) -> &'static str {
        "export"
    }

    async fn fetch_all(&self, record_type: &str) -> Result<Vec<SourceRecord>> {
        let mut records = Vec::new();
        for path in self.files()? {
            let matching: Vec<_> = Self::read_file(&path)?
                .into_iter()
                .filter(|r| r.record_type == record_type)
                .collect();
            debug!(
                "{}: {} {} records",
                path.display(),
                matching.len(),
                record_type
            );
            records.extend(matching);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const EXPORT: &str = r#"{"records": [
        {"recordName": "p1", "recordType": "HRProduct", "fields": {"name": {"type": "STRING", "value": "Sofa"}}},
        {"recordName": "c1", "recordType": "HRCity", "fields": {}},
        {"recordName": "p2", "recordType": "HRProduct", "fields": {}}
    ]}"#;

    #[tokio::test]
    async fn test_single_file_filters_by_type() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(EXPORT.as_bytes()).unwrap();

        let source = ExportFileSource::new(ExportConfig {
            path: file.path().to_path_buf(),
        });
        let products = source.fetch_all("HRProduct").await.unwrap();

        assert_eq!(products.len(), 2);
        assert_eq!(products[0].record_name, "p1");
        assert_eq!(products[1].record_name, "p2");
        assert_eq!(source.fetch_all("HRCity").await.unwrap().len(), 1);
        assert!(source.fetch_all("HROrder").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_reads_json_files_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), EXPORT).unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"{"records": [{"recordName": "p3", "recordType": "HRProduct"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = ExportFileSource::new(ExportConfig {
            path: dir.path().to_path_buf(),
        });
        let products = source.fetch_all("HRProduct").await.unwrap();

        let names: Vec<_> = products.iter().map(|r| r.record_name.as_str()).collect();
        assert_eq!(names, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_missing_path() {
        let source = ExportFileSource::new(ExportConfig {
            path: PathBuf::from("/nonexistent/export"),
        });
        let err = source.fetch_all("HRProduct").await.unwrap_err();
        assert!(matches!(err, Error::SourceRead(ref msg) if msg.contains("/nonexistent/export")));
        assert!(!err.is_fatal());
        assert_eq!(source.source_type(), "export");
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        let source = ExportFileSource::new(ExportConfig {
            path: file.path().to_path_buf(),
        });
        let err = source.fetch_all("HRProduct").await.unwrap_err();
        assert!(matches!(err, Error::SourceRead(ref msg) if msg.contains("failed to parse")));
        assert!(!err.is_fatal());
    }
}
