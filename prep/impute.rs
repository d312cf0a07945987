//! Row-mean imputation of missing beta values.

use crate::types::{FeatureMatrix, ObservedStats};
use ndarray::Axis;
use ndarray::parallel::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ImputeError {
    #[error(
        "Probe '{0}' has no observed value in any sample; filter probes by missingness before imputing."
    )]
    AllMissingProbe(String),
}

/// Replaces every missing value with the mean of the observed values of its row.
///
/// Returns the number of values filled in. Fails without modifying the matrix if any
/// row has no observed value at all.
pub fn impute_probe_means(matrix: &mut FeatureMatrix) -> Result<usize, ImputeError> {
    let means: Vec<Option<f64>> = matrix
        .values
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| ObservedStats::from_values(row.iter().copied()).map(|s| s.mean))
        .collect();

    if let Some(row) = means.iter().position(Option::is_none) {
        return Err(ImputeError::AllMissingProbe(matrix.features[row].clone()));
    }

    let filled: usize = matrix
        .values
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(means.par_iter())
        .map(|(mut row, mean)| {
            let fill = mean.unwrap_or(f64::NAN);
            let mut count = 0;
            for value in row.iter_mut().filter(|v| v.is_nan()) {
                *value = fill;
                count += 1;
            }
            count
        })
        .sum();

    log::info!("Imputed {filled} missing values with probe means");
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn missing_values_take_row_means() {
        let mut matrix = FeatureMatrix::new(
            vec!["cg1".into(), "cg2".into()],
            vec!["a".into(), "b".into(), "c".into()],
            array![[0.2, f64::NAN, 0.4], [0.5, 0.6, 0.7]],
        )
        .unwrap();
        let filled = impute_probe_means(&mut matrix).unwrap();
        assert_eq!(filled, 1);
        assert_eq!(matrix.count_missing(), 0);
        assert_abs_diff_eq!(matrix.values[[0, 1]], 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(matrix.values[[1, 1]], 0.6, epsilon = 1e-12);
    }

    #[test]
    fn all_missing_row_is_an_error() {
        let mut matrix = FeatureMatrix::new(
            vec!["cg1".into(), "cg2".into()],
            vec!["a".into(), "b".into()],
            array![[0.2, f64::NAN], [f64::NAN, f64::NAN]],
        )
        .unwrap();
        let before = matrix.clone();
        let err = impute_probe_means(&mut matrix).unwrap_err();
        assert_eq!(err, ImputeError::AllMissingProbe("cg2".to_string()));
        assert_eq!(matrix.count_missing(), before.count_missing());
    }
}
