// ========================================================================================
//
//                       CORE DATA TYPES FOR THE METHYLPREP PIPELINE
//
// ========================================================================================
//
// This module is the shared dictionary of the pipeline: the array generations, the
// labelled matrices that flow between stages, and the per-sample metadata table that
// travels alongside them. Types used by a single stage live in that stage's module.

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use ahash::AHashMap;
use std::fmt;
use thiserror::Error;

// ========================================================================================
//                                  ARRAY GENERATIONS
// ========================================================================================

/// The three Illumina methylation array generations found in TCGA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayType {
    Hm27,
    Hm450,
    Epic,
}

impl ArrayType {
    /// Resolution order used when a project mixes generations: highest first.
    pub const PRECEDENCE: [ArrayType; 3] = [ArrayType::Epic, ArrayType::Hm450, ArrayType::Hm27];

    /// The platform string reported in GDC sample metadata.
    pub const fn platform_label(self) -> &'static str {
        match self {
            Self::Hm27 => "Illumina Human Methylation 27",
            Self::Hm450 => "Illumina Human Methylation 450",
            Self::Epic => "Illumina Human Methylation EPIC",
        }
    }

    /// File name of the canonical probe manifest inside the annotation directory.
    pub const fn manifest_file_name(self) -> &'static str {
        match self {
            Self::Hm27 => "illumina27k_annotation_hg19.csv",
            Self::Hm450 => "illumina450k_annotation_hg19.csv",
            Self::Epic => "illuminaEPIC_annotation_hg19.csv",
        }
    }

    /// Parses a metadata platform string. Matching ignores case and surrounding
    /// whitespace; anything else is not a recognized platform.
    pub fn from_platform(platform: &str) -> Option<Self> {
        let trimmed = platform.trim();
        Self::PRECEDENCE
            .into_iter()
            .find(|array| array.platform_label().eq_ignore_ascii_case(trimmed))
    }
}

impl fmt::Display for ArrayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.platform_label())
    }
}

// ========================================================================================
//                                  LABELLED MATRICES
// ========================================================================================

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "matrix has shape {rows}x{cols} but {features} feature labels and {samples} sample labels were supplied"
)]
pub struct MatrixShapeError {
    pub rows: usize,
    pub cols: usize,
    pub features: usize,
    pub samples: usize,
}

/// A dense features × samples matrix of beta values with row and column labels.
///
/// Rows are probes before aggregation and genes after it. Missing values are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub features: Vec<String>,
    pub samples: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn new(
        features: Vec<String>,
        samples: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, MatrixShapeError> {
        let (rows, cols) = values.dim();
        if rows != features.len() || cols != samples.len() {
            return Err(MatrixShapeError {
                rows,
                cols,
                features: features.len(),
                samples: samples.len(),
            });
        }
        Ok(Self {
            features,
            samples,
            values,
        })
    }

    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty() || self.samples.is_empty()
    }

    /// Returns the row belonging to `feature`, if present.
    pub fn feature_row(&self, feature: &str) -> Option<ArrayView1<'_, f64>> {
        self.features
            .iter()
            .position(|name| name == feature)
            .map(|row| self.values.row(row))
    }

    /// Keeps the given rows, in the given order.
    pub fn select_features(&self, rows: &[usize]) -> Self {
        Self {
            features: rows.iter().map(|&r| self.features[r].clone()).collect(),
            samples: self.samples.clone(),
            values: self.values.select(Axis(0), rows),
        }
    }

    /// Keeps the given columns, in the given order.
    pub fn select_samples(&self, cols: &[usize]) -> Self {
        Self {
            features: self.features.clone(),
            samples: cols.iter().map(|&c| self.samples[c].clone()).collect(),
            values: self.values.select(Axis(1), cols),
        }
    }

    /// Fraction of missing entries in every row.
    pub fn missing_fraction_by_feature(&self) -> Vec<f64> {
        missing_fractions(&self.values, Axis(0))
    }

    /// Fraction of missing entries in every column.
    pub fn missing_fraction_by_sample(&self) -> Vec<f64> {
        missing_fractions(&self.values, Axis(1))
    }

    pub fn count_missing(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }
}

fn missing_fractions(values: &Array2<f64>, axis: Axis) -> Vec<f64> {
    values
        .axis_iter(axis)
        .map(|lane| {
            if lane.is_empty() {
                return 0.0;
            }
            let missing = lane.iter().filter(|v| v.is_nan()).count();
            missing as f64 / lane.len() as f64
        })
        .collect()
}

/// Summary of the observed (non-missing) values of a lane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservedStats {
    pub count: usize,
    pub mean: f64,
    /// Population variance (divides by `count`).
    pub variance: f64,
}

impl ObservedStats {
    /// Returns `None` when no value is observed.
    pub fn from_values<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        // Welford keeps the variance stable for values clustered near 0 or 1.
        let mut count = 0usize;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for value in values.into_iter().filter(|v| !v.is_nan()) {
            count += 1;
            let delta = value - mean;
            mean += delta / count as f64;
            m2 += delta * (value - mean);
        }
        if count == 0 {
            return None;
        }
        Some(Self {
            count,
            mean,
            variance: m2 / count as f64,
        })
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

// ========================================================================================
//                                 PER-SAMPLE METADATA
// ========================================================================================

/// A string-valued metadata table with one row per sample.
///
/// `sample_ids[i]` is the join key of `rows[i]`; the key is stored apart from
/// `columns` so that it can be normalized without touching the source values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleTable {
    pub columns: Vec<String>,
    pub sample_ids: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SampleTable {
    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            columns,
            sample_ids: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    /// Appends a row, padding or truncating it to the column count.
    pub fn push(&mut self, sample_id: String, mut row: Vec<String>) {
        row.resize(self.columns.len(), String::new());
        self.sample_ids.push(sample_id);
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column_index(column)?;
        self.rows.get(row).map(|r| r[col].as_str())
    }

    pub fn column_values(&self, column: &str) -> Option<Vec<&str>> {
        let col = self.column_index(column)?;
        Some(self.rows.iter().map(|r| r[col].as_str()).collect())
    }

    /// Index from sample id to row position.
    pub fn index(&self) -> AHashMap<&str, usize> {
        self.sample_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect()
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            sample_ids: rows.iter().map(|&r| self.sample_ids[r].clone()).collect(),
            rows: rows.iter().map(|&r| self.rows[r].clone()).collect(),
        }
    }

    /// Appends a column; `values` must hold one entry per row.
    pub fn add_column(&mut self, name: &str, values: Vec<String>) {
        debug_assert_eq!(values.len(), self.rows.len());
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn platform_strings_resolve_case_insensitively() {
        assert_eq!(
            ArrayType::from_platform(" illumina human methylation epic "),
            Some(ArrayType::Epic)
        );
        assert_eq!(
            ArrayType::from_platform("Illumina Human Methylation 450"),
            Some(ArrayType::Hm450)
        );
        assert_eq!(ArrayType::from_platform("Illumina Human Methylation 850"), None);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let err = FeatureMatrix::new(
            vec!["cg1".into()],
            vec!["s1".into(), "s2".into()],
            Array2::zeros((2, 2)),
        )
        .unwrap_err();
        assert_eq!(err.rows, 2);
        assert_eq!(err.features, 1);
    }

    #[test]
    fn missing_fractions_follow_axes() {
        let matrix = FeatureMatrix::new(
            vec!["cg1".into(), "cg2".into()],
            vec!["s1".into(), "s2".into()],
            array![[0.1, f64::NAN], [f64::NAN, f64::NAN]],
        )
        .unwrap();
        assert_eq!(matrix.missing_fraction_by_feature(), vec![0.5, 1.0]);
        assert_eq!(matrix.missing_fraction_by_sample(), vec![0.5, 1.0]);
        assert_eq!(matrix.count_missing(), 3);
    }

    #[test]
    fn observed_stats_skip_missing_values() {
        let stats = ObservedStats::from_values([0.2, f64::NAN, 0.4]).unwrap();
        assert_eq!(stats.count, 2);
        assert_abs_diff_eq!(stats.mean, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.variance, 0.01, epsilon = 1e-12);
        assert!(ObservedStats::from_values([f64::NAN]).is_none());
    }

    #[test]
    fn sample_table_rows_are_padded() {
        let mut table = SampleTable::with_columns(vec!["platform".into(), "gender".into()]);
        table.push("s1".into(), vec!["Illumina Human Methylation 27".into()]);
        assert_eq!(table.value(0, "gender"), Some(""));
        table.add_column("batch", vec!["TCGA-BRCA".into()]);
        assert_eq!(table.value(0, "batch"), Some("TCGA-BRCA"));
    }

    #[test]
    fn sample_index_maps_ids_to_rows() {
        let mut table = SampleTable::with_columns(vec!["gender".into()]);
        table.push("s1".into(), vec!["female".into()]);
        table.push("s2".into(), vec!["male".into()]);
        let index = table.index();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("s2").copied(), Some(1));
        assert_eq!(index.get("s3"), None);
    }
}
