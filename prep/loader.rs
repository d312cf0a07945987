// ========================================================================================
//
//                              PER-SAMPLE BETA-VALUE LOADING
//
// ========================================================================================
//
// Every sample of a project arrives as its own file mapping probe identifiers to beta
// values. Files are parsed independently on a bounded worker pool and then outer-joined
// on the probe identifier into one dense probes × samples matrix. Probes a sample does
// not report are missing (`NaN`) in that sample's column.

use crate::metadata::normalize_sample_key;
use crate::progress::LoadProgressObserver;
use crate::types::FeatureMatrix;
use ahash::{AHashMap, AHashSet};
use csv::ReaderBuilder;
use flate2::read::MultiGzDecoder;
use ndarray::Array2;
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Raw data directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("Raw data directory contains no sample files: {0}")]
    EmptyDirectory(PathBuf),
    #[error("Invalid beta value '{value}' for probe '{probe}' in {path}")]
    InvalidBeta {
        path: PathBuf,
        probe: String,
        value: String,
    },
    #[error("Probe '{probe}' appears more than once in {path}")]
    DuplicateProbe { path: PathBuf, probe: String },
    #[error("Sample id '{0}' is produced by more than one file")]
    DuplicateSample(String),
    #[error("Malformed sample file {path}: {reason}")]
    MalformedFile { path: PathBuf, reason: String },
    #[error("Failed to build the file-loading thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to parse delimited text: {0}")]
    Csv(#[from] csv::Error),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The contents of one sample file.
#[derive(Debug, Clone, PartialEq)]
pub struct BetaColumn {
    pub sample_id: String,
    pub probes: Vec<String>,
    /// Parallel to `probes`; `NaN` marks a missing value.
    pub values: Vec<f64>,
}

impl BetaColumn {
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

const MISSING_TOKENS: [&str; 6] = ["", "NA", "NaN", "nan", "null", "NULL"];
const SAMPLE_EXTENSIONS: [&str; 4] = ["txt", "tsv", "gz", "parquet"];
const GDC_BETA_SUFFIX: &str = ".level3betas.txt";

/// Sample identity of a file: its name without the format extension.
pub fn sample_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    normalize_sample_key(&name)
}

fn is_sample_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    let known = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SAMPLE_EXTENSIONS.contains(&e));
    path.is_file() && known && !hidden
}

/// Lists the sample files directly inside `dir`, sorted by path.
pub fn list_sample_files(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::DirectoryNotFound(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_sample_file(&path) {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(LoadError::EmptyDirectory(dir.to_path_buf()));
    }
    files.sort();
    Ok(files)
}

// ========================================================================================
//                                 SINGLE-FILE READERS
// ========================================================================================

/// Reads one sample file, dispatching on its extension.
pub fn read_beta_file(path: &Path) -> Result<BetaColumn, LoadError> {
    let sample_id = sample_id_from_path(path);
    let (probes, values) = match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => read_parquet_pairs(path)?,
        Some("gz") => {
            let file = File::open(path)?;
            read_text_pairs(MultiGzDecoder::new(BufReader::new(file)), path)?
        }
        _ => read_text_pairs(BufReader::new(File::open(path)?), path)?,
    };

    let mut seen: AHashSet<&str> = AHashSet::with_capacity(probes.len());
    for (probe, value) in probes.iter().zip(&values) {
        if !seen.insert(probe.as_str()) {
            return Err(LoadError::DuplicateProbe {
                path: path.to_path_buf(),
                probe: probe.clone(),
            });
        }
        if !value.is_nan() && !(0.0..=1.0).contains(value) {
            return Err(LoadError::InvalidBeta {
                path: path.to_path_buf(),
                probe: probe.clone(),
                value: value.to_string(),
            });
        }
    }

    Ok(BetaColumn {
        sample_id,
        probes,
        values,
    })
}

fn is_missing_token(field: &str) -> bool {
    MISSING_TOKENS.contains(&field)
}

// Illumina CpG, non-CpG and SNP probe prefixes.
const PROBE_ID_PREFIXES: [&str; 3] = ["cg", "ch", "rs"];

fn looks_like_probe_id(field: &str) -> bool {
    PROBE_ID_PREFIXES.iter().any(|prefix| {
        field
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit() || c == '.'))
    })
}

/// Parses a two-column tab-delimited stream. A first row whose value field is
/// neither a number nor a missing token is taken to be a header, unless its
/// first field is shaped like a probe identifier.
fn read_text_pairs<R: Read>(
    reader: R,
    path: &Path,
) -> Result<(Vec<String>, Vec<f64>), LoadError> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .flexible(true)
        .from_reader(reader);

    let mut probes = Vec::new();
    let mut values = Vec::new();
    let mut first = true;
    for record in csv_reader.records() {
        let record = record?;
        let probe = record.get(0).map(str::trim).unwrap_or_default();
        let field = record.get(1).map(str::trim).unwrap_or_default();
        let is_first = std::mem::replace(&mut first, false);
        if probe.is_empty() {
            continue;
        }

        let value = if is_missing_token(field) {
            f64::NAN
        } else {
            match lexical_core::parse::<f64>(field.as_bytes()) {
                Ok(v) if v.is_finite() => v,
                Ok(_) => {
                    return Err(LoadError::InvalidBeta {
                        path: path.to_path_buf(),
                        probe: probe.to_string(),
                        value: field.to_string(),
                    });
                }
                Err(_) if is_first && !looks_like_probe_id(probe) => continue,
                Err(_) => {
                    return Err(LoadError::InvalidBeta {
                        path: path.to_path_buf(),
                        probe: probe.to_string(),
                        value: field.to_string(),
                    });
                }
            }
        };
        probes.push(probe.to_string());
        values.push(value);
    }
    Ok((probes, values))
}

/// Reads `probe_id` and `beta_value`, or failing those the first two columns.
fn read_parquet_pairs(path: &Path) -> Result<(Vec<String>, Vec<f64>), LoadError> {
    let df = ParquetReader::new(File::open(path)?).finish()?;
    let names = df.get_column_names_str();
    if names.len() < 2 {
        return Err(LoadError::MalformedFile {
            path: path.to_path_buf(),
            reason: format!("expected two columns, found {}", names.len()),
        });
    }
    let probe_name = if names.contains(&"probe_id") {
        "probe_id"
    } else {
        names[0]
    };
    let value_name = if names.contains(&"beta_value") {
        "beta_value"
    } else {
        names[1]
    };

    let probe_column = df.column(probe_name)?.cast(&DataType::String)?;
    let value_column = df.column(value_name)?.cast(&DataType::Float64)?;

    let mut probes = Vec::with_capacity(df.height());
    let mut values = Vec::with_capacity(df.height());
    for (probe, value) in probe_column.str()?.into_iter().zip(value_column.f64()?) {
        let Some(probe) = probe.map(str::trim).filter(|p| !p.is_empty()) else {
            continue;
        };
        probes.push(probe.to_string());
        values.push(value.unwrap_or(f64::NAN));
    }
    Ok((probes, values))
}

// ========================================================================================
//                                  PARALLEL OUTER JOIN
// ========================================================================================

/// Loads every file on a pool of `workers` threads and outer-joins the results.
///
/// Rows are sorted by probe identifier and columns by sample id.
pub fn load_beta_matrix(
    files: &[PathBuf],
    workers: usize,
    observer: &dyn LoadProgressObserver,
) -> Result<FeatureMatrix, LoadError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()?;

    observer.on_start(files.len());
    let loaded: Result<Vec<BetaColumn>, LoadError> = pool.install(|| {
        files
            .par_iter()
            .map(|path| {
                let column = read_beta_file(path)?;
                observer.on_file_loaded(&column.sample_id);
                Ok(column)
            })
            .collect()
    });
    observer.on_finish();
    let mut columns = loaded?;

    columns.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));
    if let Some(pair) = columns
        .windows(2)
        .find(|pair| pair[0].sample_id == pair[1].sample_id)
    {
        return Err(LoadError::DuplicateSample(pair[0].sample_id.clone()));
    }

    let probe_set: BTreeSet<&str> = columns
        .iter()
        .flat_map(|c| c.probes.iter().map(String::as_str))
        .collect();
    let probes: Vec<String> = probe_set.into_iter().map(str::to_string).collect();
    let row_of: AHashMap<&str, usize> = probes
        .iter()
        .enumerate()
        .map(|(row, probe)| (probe.as_str(), row))
        .collect();

    let mut values = Array2::from_elem((probes.len(), columns.len()), f64::NAN);
    for (col, column) in columns.iter().enumerate() {
        for (probe, &value) in column.probes.iter().zip(&column.values) {
            values[[row_of[probe.as_str()], col]] = value;
        }
    }

    let samples: Vec<String> = columns.into_iter().map(|c| c.sample_id).collect();
    log::info!(
        "Loaded {} samples covering {} distinct probes",
        samples.len(),
        probes.len()
    );
    Ok(FeatureMatrix {
        features: probes,
        samples,
        values,
    })
}

/// Lists and loads every sample file of a directory.
pub fn load_project_directory(
    dir: &Path,
    workers: usize,
    observer: &dyn LoadProgressObserver,
) -> Result<FeatureMatrix, LoadError> {
    let files = list_sample_files(dir)?;
    load_beta_matrix(&files, workers, observer)
}

// ========================================================================================
//                              GDC DOWNLOAD LAYOUT CLEANUP
// ========================================================================================

fn collect_gdc_files(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), LoadError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_gdc_files(&path, found)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(GDC_BETA_SUFFIX))
        {
            found.push(path);
        }
    }
    Ok(())
}

/// Flattens a GDC download directory.
///
/// Every `*.level3betas.txt` file found at any depth is rewritten as
/// `<dir>/<name>.parquet` with `probe_id` and `beta_value` columns, the text file is
/// deleted, and all subdirectories are removed once every file has been converted.
/// Returns the number of converted files.
pub fn clean_raw_directory(dir: &Path) -> Result<usize, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::DirectoryNotFound(dir.to_path_buf()));
    }
    let mut found = Vec::new();
    collect_gdc_files(dir, &mut found)?;
    found.sort();

    for path in &found {
        let (probes, values) = read_text_pairs(BufReader::new(File::open(path)?), path)?;
        let beta: Vec<Option<f32>> = values
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v as f32) })
            .collect();
        let mut df = DataFrame::new(vec![
            Series::new("probe_id".into(), probes).into(),
            Series::new("beta_value".into(), beta).into(),
        ])?;

        let target = dir.join(format!("{}.parquet", sample_id_from_path(path)));
        ParquetWriter::new(File::create(&target)?).finish(&mut df)?;
        fs::remove_file(path)?;
        log::debug!("Converted {} to {}", path.display(), target.display());
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        }
    }
    log::info!("Converted {} sample files in {}", found.len(), dir.display());
    Ok(found.len())
}
