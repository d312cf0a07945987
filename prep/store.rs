// ========================================================================================
//
//                                  ON-DISK ARTIFACTS
//
// ========================================================================================
//
// A matrix artifact is a stem plus three sibling files:
//
//   <stem>.parquet   samples × features; the first column `sample_id`, then one Float64
//                    column per feature with nulls for missing values.
//   <stem>.obs.tsv   per-sample metadata keyed by `sample_id`, rows in matrix order.
//   <stem>.toml      provenance (project artifacts only).
//
// In memory matrices are features × samples, so both directions transpose.

use crate::cohort::Cohort;
use crate::process::ProcessedProject;
use crate::types::{ArrayType, FeatureMatrix, MatrixShapeError, SampleTable};
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SAMPLE_ID_COLUMN: &str = "sample_id";
pub const PROJECT_MATRIX_SUFFIX: &str = "_gene_matrix";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Artifact {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("Artifact {path} is inconsistent: {source}")]
    Shape {
        path: PathBuf,
        source: MatrixShapeError,
    },
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Failed to read or write a metadata table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to parse provenance TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize provenance TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Describes how a project artifact was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProvenance {
    pub project: String,
    pub array_type: ArrayType,
    pub n_samples: usize,
    pub n_genes: usize,
    pub tool_version: String,
}

/// The three sibling files of one artifact stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub matrix: PathBuf,
    pub obs: PathBuf,
    pub provenance: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, stem: &str) -> Self {
        Self {
            matrix: dir.join(format!("{stem}.parquet")),
            obs: dir.join(format!("{stem}.obs.tsv")),
            provenance: dir.join(format!("{stem}.toml")),
        }
    }

    /// Paths belonging to a `<stem>.parquet` matrix file.
    pub fn from_matrix_path(matrix: &Path) -> Self {
        let dir = matrix.parent().unwrap_or_else(|| Path::new("."));
        let stem = matrix
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(dir, &stem)
    }

    /// Artifact stem of a project.
    pub fn for_project(dir: &Path, project: &str) -> Self {
        Self::new(dir, &format!("{project}{PROJECT_MATRIX_SUFFIX}"))
    }
}

// ========================================================================================
//                                   MATRIX PARQUET
// ========================================================================================

pub fn write_feature_matrix(path: &Path, matrix: &FeatureMatrix) -> Result<(), StoreError> {
    let mut columns: Vec<Column> = Vec::with_capacity(matrix.n_features() + 1);
    columns.push(Series::new(SAMPLE_ID_COLUMN.into(), matrix.samples.clone()).into());
    for (feature, row) in matrix.features.iter().zip(matrix.values.rows()) {
        let values: Vec<Option<f64>> = row
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect();
        columns.push(Series::new(feature.as_str().into(), values).into());
    }

    let mut df = DataFrame::new(columns)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    ParquetWriter::new(File::create(path)?).finish(&mut df)?;
    log::debug!(
        "Wrote {}x{} matrix to {}",
        matrix.n_samples(),
        matrix.n_features(),
        path.display()
    );
    Ok(())
}

pub fn read_feature_matrix(path: &Path) -> Result<FeatureMatrix, StoreError> {
    let df = ParquetReader::new(File::open(path)?).finish()?;
    let missing_id = || StoreError::MissingColumn {
        path: path.to_path_buf(),
        column: SAMPLE_ID_COLUMN.to_string(),
    };
    if !df.get_column_names_str().contains(&SAMPLE_ID_COLUMN) {
        return Err(missing_id());
    }

    let samples: Vec<String> = df
        .column(SAMPLE_ID_COLUMN)?
        .cast(&DataType::String)?
        .str()?
        .into_iter()
        .map(|id| id.unwrap_or_default().to_string())
        .collect();

    let feature_columns: Vec<&Column> = df
        .get_columns()
        .iter()
        .filter(|c| c.name().as_str() != SAMPLE_ID_COLUMN)
        .collect();
    let mut values = Array2::from_elem((feature_columns.len(), samples.len()), f64::NAN);
    let mut features = Vec::with_capacity(feature_columns.len());
    for (row, column) in feature_columns.into_iter().enumerate() {
        features.push(column.name().to_string());
        let column = column.cast(&DataType::Float64)?;
        for (col, value) in column.f64()?.into_iter().enumerate() {
            values[[row, col]] = value.unwrap_or(f64::NAN);
        }
    }

    FeatureMatrix::new(features, samples, values).map_err(|source| StoreError::Shape {
        path: path.to_path_buf(),
        source,
    })
}

// ========================================================================================
//                                 METADATA TABLES
// ========================================================================================

pub fn write_sample_table(path: &Path, table: &SampleTable) -> Result<(), StoreError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let header = std::iter::once(SAMPLE_ID_COLUMN).chain(table.columns.iter().map(String::as_str));
    writer.write_record(header)?;
    for (id, row) in table.sample_ids.iter().zip(&table.rows) {
        writer.write_record(std::iter::once(id.as_str()).chain(row.iter().map(String::as_str)))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_sample_table(path: &Path) -> Result<SampleTable, StoreError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if header.first().map(String::as_str) != Some(SAMPLE_ID_COLUMN) {
        return Err(StoreError::MissingColumn {
            path: path.to_path_buf(),
            column: SAMPLE_ID_COLUMN.to_string(),
        });
    }

    let mut table = SampleTable::with_columns(header[1..].to_vec());
    for record in reader.records() {
        let record = record?;
        let mut fields = record.iter().map(str::to_string);
        let id = fields.next().unwrap_or_default();
        table.push(id, fields.collect());
    }
    Ok(table)
}

// ========================================================================================
//                                     PROVENANCE
// ========================================================================================

pub fn write_provenance(path: &Path, provenance: &ProjectProvenance) -> Result<(), StoreError> {
    fs::write(path, toml::to_string_pretty(provenance)?)?;
    Ok(())
}

pub fn read_provenance(path: &Path) -> Result<ProjectProvenance, StoreError> {
    let text = fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

// ========================================================================================
//                                  ARTIFACT WRITERS
// ========================================================================================

/// Persists a processed project as `<dir>/<PROJECT>_gene_matrix.*`.
pub fn write_processed_project(
    dir: &Path,
    processed: &ProcessedProject,
) -> Result<ArtifactPaths, StoreError> {
    fs::create_dir_all(dir)?;
    let paths = ArtifactPaths::for_project(dir, &processed.project);
    write_feature_matrix(&paths.matrix, &processed.genes)?;
    write_sample_table(&paths.obs, &processed.metadata)?;
    write_provenance(
        &paths.provenance,
        &ProjectProvenance {
            project: processed.project.clone(),
            array_type: processed.array_type,
            n_samples: processed.genes.n_samples(),
            n_genes: processed.genes.n_features(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )?;
    log::info!(
        "Saved {} ({} samples × {} genes) to {}",
        processed.project,
        processed.genes.n_samples(),
        processed.genes.n_features(),
        paths.matrix.display()
    );
    Ok(paths)
}

/// Persists a cohort or split as `<dir>/<name>.parquet` and `<dir>/<name>.obs.tsv`.
pub fn write_cohort(dir: &Path, name: &str, cohort: &Cohort) -> Result<ArtifactPaths, StoreError> {
    fs::create_dir_all(dir)?;
    let paths = ArtifactPaths::new(dir, name);
    write_feature_matrix(&paths.matrix, &cohort.matrix)?;
    write_sample_table(&paths.obs, &cohort.obs)?;
    log::info!(
        "Saved {} ({} samples × {} genes) to {}",
        name,
        cohort.matrix.n_samples(),
        cohort.matrix.n_features(),
        paths.matrix.display()
    );
    Ok(paths)
}
