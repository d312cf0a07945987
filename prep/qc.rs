// ========================================================================================
//
//                              PROBE AND SAMPLE QUALITY CONTROL
//
// ========================================================================================
//
// Both filters only ever remove whole rows (probes) or whole columns (samples); no value
// inside a kept lane is altered. Each returns the filtered matrix together with a report
// that accounts for every removed lane exactly once.

use crate::annotation::AnnotationTable;
use crate::types::{FeatureMatrix, ObservedStats};
use ndarray::Axis;
use ndarray::parallel::prelude::*;

/// Canonical prefix of CpG-site probe identifiers.
pub const PROBE_PREFIX: &str = "cg";

/// Width of the acceptance band of the sample outlier rule, in standard deviations.
pub const OUTLIER_SD_MULTIPLIER: f64 = 3.0;

const BAND_TOLERANCE: f64 = 1e-9;

// ========================================================================================
//                                       PROBE QC
// ========================================================================================

/// Why a probe was removed. Checks run in declaration order and the first failure
/// is the one recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeRejection {
    NotCpgSite,
    Unannotated,
    Flagged,
    TooMissing,
    Invariant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeQcReport {
    pub input: usize,
    pub not_cpg_site: usize,
    pub unannotated: usize,
    pub flagged: usize,
    pub too_missing: usize,
    pub invariant: usize,
    pub kept: usize,
}

impl ProbeQcReport {
    fn record(&mut self, rejection: Option<ProbeRejection>) {
        match rejection {
            None => self.kept += 1,
            Some(ProbeRejection::NotCpgSite) => self.not_cpg_site += 1,
            Some(ProbeRejection::Unannotated) => self.unannotated += 1,
            Some(ProbeRejection::Flagged) => self.flagged += 1,
            Some(ProbeRejection::TooMissing) => self.too_missing += 1,
            Some(ProbeRejection::Invariant) => self.invariant += 1,
        }
    }

    pub fn removed(&self) -> usize {
        self.input - self.kept
    }
}

/// Keeps the probes that pass every check.
///
/// A probe survives when its identifier starts with `cg`, it has a manifest record with
/// no quality flag set and a chromosome other than X or Y, at most `max_missing` of its
/// values are missing, and its observed values have non-zero population variance. A
/// probe with fewer than two observed values is not variable.
pub fn probe_qc(
    matrix: &FeatureMatrix,
    annotation: &AnnotationTable,
    max_missing: f64,
) -> (FeatureMatrix, ProbeQcReport) {
    let n_samples = matrix.n_samples();
    let verdicts: Vec<Option<ProbeRejection>> = matrix
        .values
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(matrix.features.par_iter())
        .map(|(row, probe_id)| {
            if !probe_id.starts_with(PROBE_PREFIX) {
                return Some(ProbeRejection::NotCpgSite);
            }
            let Some(record) = annotation.get(probe_id) else {
                return Some(ProbeRejection::Unannotated);
            };
            if record.flags.any_set() || record.on_sex_chromosome() {
                return Some(ProbeRejection::Flagged);
            }
            let missing = row.iter().filter(|v| v.is_nan()).count();
            if n_samples > 0 && missing as f64 / n_samples as f64 > max_missing {
                return Some(ProbeRejection::TooMissing);
            }
            match ObservedStats::from_values(row.iter().copied()) {
                Some(stats) if stats.count >= 2 && stats.variance > 0.0 => None,
                _ => Some(ProbeRejection::Invariant),
            }
        })
        .collect();

    let mut report = ProbeQcReport {
        input: matrix.n_features(),
        ..ProbeQcReport::default()
    };
    let mut keep = Vec::with_capacity(verdicts.len());
    for (row, verdict) in verdicts.into_iter().enumerate() {
        report.record(verdict);
        if verdict.is_none() {
            keep.push(row);
        }
    }

    log::info!(
        "Probe QC kept {}/{} probes ({} not CpG sites, {} unannotated, {} flagged, {} too missing, {} invariant)",
        report.kept,
        report.input,
        report.not_cpg_site,
        report.unannotated,
        report.flagged,
        report.too_missing,
        report.invariant
    );
    (matrix.select_features(&keep), report)
}

// ========================================================================================
//                                      SAMPLE QC
// ========================================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleQcReport {
    pub input: usize,
    /// Samples above the missingness threshold or with no observed value.
    pub too_missing: usize,
    pub outliers: usize,
    /// Number of outlier passes that removed at least one sample.
    pub outlier_rounds: usize,
    pub kept: usize,
}

/// Keeps the samples that pass the missingness check and the distribution-shape
/// outlier rule.
///
/// A sample is an outlier when its mean, or its standard deviation, lies more than
/// three population standard deviations away from the cross-sample mean of that
/// statistic. Outliers are removed and the rule is reapplied to the remaining samples
/// until it removes nothing, so filtering an already-filtered matrix is a no-op.
pub fn sample_qc(matrix: &FeatureMatrix, max_missing: f64) -> (FeatureMatrix, SampleQcReport) {
    let n_features = matrix.n_features();
    let stats: Vec<Option<ObservedStats>> = matrix
        .values
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| ObservedStats::from_values(column.iter().copied()))
        .collect();

    let mut report = SampleQcReport {
        input: matrix.n_samples(),
        ..SampleQcReport::default()
    };

    let mut kept: Vec<usize> = Vec::with_capacity(stats.len());
    for (col, stat) in stats.iter().enumerate() {
        let passes = match stat {
            Some(s) => {
                let missing = n_features - s.count;
                n_features == 0 || missing as f64 / n_features as f64 <= max_missing
            }
            None => false,
        };
        if passes {
            kept.push(col);
        } else {
            report.too_missing += 1;
        }
    }

    loop {
        let current: Vec<ObservedStats> = kept.iter().filter_map(|&c| stats[c]).collect();
        let means: Vec<f64> = current.iter().map(|s| s.mean).collect();
        let stds: Vec<f64> = current.iter().map(ObservedStats::std_dev).collect();
        let mean_band = Band::of(&means);
        let std_band = Band::of(&stds);

        let before = kept.len();
        kept.retain(|&c| {
            stats[c].is_some_and(|s| mean_band.contains(s.mean) && std_band.contains(s.std_dev()))
        });
        let removed = before - kept.len();
        if removed == 0 {
            break;
        }
        report.outliers += removed;
        report.outlier_rounds += 1;
    }

    report.kept = kept.len();
    log::info!(
        "Sample QC kept {}/{} samples ({} too missing, {} outliers over {} rounds)",
        report.kept,
        report.input,
        report.too_missing,
        report.outliers,
        report.outlier_rounds
    );
    (matrix.select_samples(&kept), report)
}

/// The acceptance band `center ± 3·sd` of one per-sample statistic.
struct Band {
    center: f64,
    half_width: f64,
}

impl Band {
    fn of(values: &[f64]) -> Self {
        match ObservedStats::from_values(values.iter().copied()) {
            Some(stats) => Self {
                center: stats.mean,
                half_width: OUTLIER_SD_MULTIPLIER * stats.std_dev(),
            },
            None => Self {
                center: 0.0,
                half_width: f64::INFINITY,
            },
        }
    }

    fn contains(&self, value: f64) -> bool {
        // Samples that agree up to rounding must never be split apart.
        (value - self.center).abs() <= self.half_width + BAND_TOLERANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{ProbeAnnotation, ProbeFlags};
    use ndarray::{Array2, array};

    fn labels(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    fn annotated(ids: &[&str]) -> AnnotationTable {
        AnnotationTable::from_records(
            ids.iter()
                .map(|id| ProbeAnnotation {
                    probe_id: id.to_string(),
                    chr: Some("1".to_string()),
                    genes: vec!["GENE".to_string()],
                    ..ProbeAnnotation::default()
                })
                .collect(),
        )
    }

    fn base_matrix() -> FeatureMatrix {
        FeatureMatrix::new(
            vec!["cg1".into(), "cg2".into(), "cg3".into()],
            labels("s", 4),
            array![
                [0.1, 0.2, 0.3, 0.4],
                [0.5, 0.6, 0.7, 0.8],
                [0.2, 0.4, 0.6, 0.8],
            ],
        )
        .unwrap()
    }

    #[test]
    fn clean_probes_all_survive() {
        let matrix = base_matrix();
        let (kept, report) = probe_qc(&matrix, &annotated(&["cg1", "cg2", "cg3"]), 0.0);
        assert_eq!(kept.features, matrix.features);
        assert_eq!(report.kept, 3);
        assert_eq!(report.removed(), 0);
    }

    #[test]
    fn each_condition_removes_exactly_its_probe() {
        let ids = ["cg1", "cg2", "cg3"];

        // Missingness on cg1.
        let mut matrix = base_matrix();
        matrix.values[[0, 0]] = f64::NAN;
        let (kept, report) = probe_qc(&matrix, &annotated(&ids), 0.0);
        assert_eq!(kept.features, vec!["cg2", "cg3"]);
        assert_eq!(report.too_missing, 1);

        // Constant cg2.
        let mut matrix = base_matrix();
        matrix.values.row_mut(1).fill(0.5);
        let (kept, report) = probe_qc(&matrix, &annotated(&ids), 0.0);
        assert_eq!(kept.features, vec!["cg1", "cg3"]);
        assert_eq!(report.invariant, 1);

        // Cross-reactive cg3.
        let matrix = base_matrix();
        let mut records: Vec<ProbeAnnotation> = annotated(&ids).records().to_vec();
        records[2].flags = ProbeFlags {
            is_cross_reactive: true,
            ..ProbeFlags::default()
        };
        let (kept, report) = probe_qc(&matrix, &AnnotationTable::from_records(records), 0.0);
        assert_eq!(kept.features, vec!["cg1", "cg2"]);
        assert_eq!(report.flagged, 1);

        // cg1 on chromosome X.
        let mut records: Vec<ProbeAnnotation> = annotated(&ids).records().to_vec();
        records[0].chr = Some("chrX".to_string());
        let (kept, _) = probe_qc(&matrix, &AnnotationTable::from_records(records), 0.0);
        assert_eq!(kept.features, vec!["cg2", "cg3"]);

        // Non-CpG identifier and missing manifest record.
        let mut matrix = base_matrix();
        matrix.features[0] = "ch.1.123".to_string();
        let (kept, report) = probe_qc(&matrix, &annotated(&["cg2"]), 0.0);
        assert_eq!(kept.features, vec!["cg2"]);
        assert_eq!(report.not_cpg_site, 1);
        assert_eq!(report.unannotated, 1);
    }

    #[test]
    fn missing_threshold_is_inclusive() {
        let mut matrix = base_matrix();
        matrix.values[[0, 0]] = f64::NAN;
        let (kept, _) = probe_qc(&matrix, &annotated(&["cg1", "cg2", "cg3"]), 0.25);
        assert_eq!(kept.n_features(), 3);
    }

    #[test]
    fn single_observation_is_not_variable() {
        let matrix = FeatureMatrix::new(
            vec!["cg1".into()],
            labels("s", 3),
            array![[0.4, f64::NAN, f64::NAN]],
        )
        .unwrap();
        let (kept, report) = probe_qc(&matrix, &annotated(&["cg1"]), 1.0);
        assert!(kept.features.is_empty());
        assert_eq!(report.invariant, 1);
    }

    // Twenty ordinary samples with means spread around 0.5 and a common spread,
    // plus sample s20 whose ten values come from `outlier`.
    fn cohort_with(outlier: impl Fn(usize) -> f64) -> FeatureMatrix {
        let n_probes = 10;
        let mut values = Array2::<f64>::zeros((n_probes, 21));
        for col in 0..20 {
            let shift = (col as f64 - 10.0) * 0.002;
            for row in 0..n_probes {
                values[[row, col]] = 0.5 + shift + 0.01 * (row as f64 - 4.5);
            }
        }
        for row in 0..n_probes {
            values[[row, 20]] = outlier(row);
        }
        FeatureMatrix::new(labels("cg", n_probes), labels("s", 21), values).unwrap()
    }

    fn cohort_with_outlier() -> FeatureMatrix {
        // Mean 0.95 and a much tighter spread than the rest.
        cohort_with(|row| 0.93 + 0.004 * row as f64)
    }

    #[test]
    fn distributional_outlier_is_removed() {
        let (kept, report) = sample_qc(&cohort_with_outlier(), 0.0);
        assert_eq!(kept.n_samples(), 20);
        assert!(!kept.samples.contains(&"s20".to_string()));
        assert_eq!(report.outliers, 1);
        assert_eq!(report.too_missing, 0);
    }

    #[test]
    fn spread_alone_marks_an_outlier() {
        // Mean exactly 0.5, standard deviation 0.45.
        let matrix = cohort_with(|row| if row % 2 == 0 { 0.05 } else { 0.95 });
        let (kept, report) = sample_qc(&matrix, 0.0);
        assert_eq!(kept.n_samples(), 20, "wide-spread sample survived");
        assert!(!kept.samples.contains(&"s20".to_string()));
        assert_eq!(report.outliers, 1);
    }

    #[test]
    fn location_alone_marks_an_outlier() {
        // Same spread as every other sample, shifted up to mean 0.9.
        let matrix = cohort_with(|row| 0.9 + 0.01 * (row as f64 - 4.5));
        let (kept, report) = sample_qc(&matrix, 0.0);
        assert_eq!(kept.n_samples(), 20, "shifted sample survived");
        assert!(!kept.samples.contains(&"s20".to_string()));
        assert_eq!(report.outliers, 1);
    }

    #[test]
    fn sample_qc_is_idempotent() {
        let mut matrix = cohort_with_outlier();
        matrix.values[[0, 3]] = f64::NAN;
        let (once, first) = sample_qc(&matrix, 0.05);
        assert_eq!(first.too_missing, 1);
        let (twice, second) = sample_qc(&once, 0.05);
        assert_eq!(second.kept, second.input);
        assert_eq!(once.samples, twice.samples);
    }

    #[test]
    fn empty_samples_are_dropped() {
        let matrix = FeatureMatrix::new(
            labels("cg", 2),
            labels("s", 3),
            array![[0.1, f64::NAN, 0.2], [0.3, f64::NAN, 0.4]],
        )
        .unwrap();
        let (kept, report) = sample_qc(&matrix, 1.0);
        assert_eq!(kept.samples, vec!["s0", "s2"]);
        assert_eq!(report.too_missing, 1);
    }
}
