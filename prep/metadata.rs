//! Per-project sample metadata: reading the table, normalizing its join key, and
//! aligning it to the columns of a matrix.

use crate::types::SampleTable;
use ahash::AHashSet;
use csv::ReaderBuilder;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Sample metadata file was not found at {0}")]
    NotFound(PathBuf),
    #[error("Sample metadata file {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("Failed to parse sample metadata: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extensions stripped from metadata keys so they match loader sample ids.
const KEY_EXTENSIONS: [&str; 4] = [".txt", ".tsv", ".csv", ".parquet"];

/// `metadata_dir/<PROJECT>/<PROJECT>_metadata.csv`
pub fn project_metadata_path(metadata_dir: &Path, project: &str) -> PathBuf {
    metadata_dir
        .join(project)
        .join(format!("{project}_metadata.csv"))
}

/// Removes one trailing file extension from a sample key, looking through a
/// trailing `.gz` first. Sample files are named with the same rule.
pub fn normalize_sample_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix(".gz").unwrap_or(trimmed);
    KEY_EXTENSIONS
        .iter()
        .find_map(|ext| trimmed.strip_suffix(ext))
        .unwrap_or(trimmed)
        .to_string()
}

/// Reads a metadata table keyed by `key_column`.
///
/// Tab-delimited when the file ends in `.tsv` or `.txt`, comma-delimited otherwise.
/// Rows with a blank key are skipped and repeated keys keep their first row.
pub fn load_sample_table(path: &Path, key_column: &str) -> Result<SampleTable, MetadataError> {
    if !path.is_file() {
        return Err(MetadataError::NotFound(path.to_path_buf()));
    }
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some("tsv") | Some("txt") => b'\t',
        _ => b',',
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(File::open(path)?);

    let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let key_index = columns
        .iter()
        .position(|c| c == key_column)
        .ok_or_else(|| MetadataError::MissingColumn {
            path: path.to_path_buf(),
            column: key_column.to_string(),
        })?;

    let mut table = SampleTable::with_columns(columns);
    let mut seen: AHashSet<String> = AHashSet::new();
    let mut duplicates = 0usize;
    for record in reader.records() {
        let record = record?;
        let Some(raw_key) = record.get(key_index) else {
            continue;
        };
        let key = normalize_sample_key(raw_key);
        if key.is_empty() {
            continue;
        }
        if !seen.insert(key.clone()) {
            duplicates += 1;
            continue;
        }
        table.push(key, record.iter().map(str::to_string).collect());
    }

    if duplicates > 0 {
        log::warn!(
            "{} repeated sample keys in {} were ignored",
            duplicates,
            path.display()
        );
    }
    log::debug!("Read metadata for {} samples from {}", table.len(), path.display());
    Ok(table)
}

/// Returns the platform string of every row, in row order.
pub fn platform_values<'a>(
    table: &'a SampleTable,
    column: &str,
    path: &Path,
) -> Result<Vec<&'a str>, MetadataError> {
    table
        .column_values(column)
        .ok_or_else(|| MetadataError::MissingColumn {
            path: path.to_path_buf(),
            column: column.to_string(),
        })
}

/// Keeps the rows whose key appears in `sample_ids`, in the order of `sample_ids`.
/// Ids without a metadata row are dropped from the result.
pub fn align_metadata(table: &SampleTable, sample_ids: &[String]) -> SampleTable {
    let index = table.index();
    let rows: Vec<usize> = sample_ids
        .iter()
        .filter_map(|id| index.get(id.as_str()).copied())
        .collect();
    if rows.len() < sample_ids.len() {
        log::warn!(
            "{} samples have no metadata row",
            sample_ids.len() - rows.len()
        );
    }
    table.select(&rows)
}
