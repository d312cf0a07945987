// ========================================================================================
//
//                           PROBE-TO-GENE AGGREGATION AND CLIPPING
//
// ========================================================================================
//
// Aggregation turns a probes × samples matrix into a genes × samples matrix. Each probe
// contributes once to every distinct gene symbol its manifest record lists; a gene's
// value in a sample is the arithmetic mean of its contributing probes that are observed
// in that sample. Clipping then keeps every value strictly inside the open unit interval
// so downstream logit-style transforms stay finite.

use crate::annotation::AnnotationTable;
use crate::types::FeatureMatrix;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Axis};
use std::collections::BTreeMap;

/// Lower clipping bound for aggregated beta values.
pub const BETA_FLOOR: f64 = 1e-5;
/// Upper clipping bound for aggregated beta values.
pub const BETA_CEILING: f64 = 1.0 - 1e-5;

/// Groups probe rows by gene symbol. Genes come out sorted; probes without a manifest
/// record or without a gene contribute to nothing.
pub fn gene_membership(probes: &[String], annotation: &AnnotationTable) -> BTreeMap<String, Vec<usize>> {
    let mut members: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (row, probe) in probes.iter().enumerate() {
        let Some(record) = annotation.get(probe) else {
            continue;
        };
        for gene in &record.genes {
            let rows = members.entry(gene.clone()).or_default();
            if rows.last() != Some(&row) {
                rows.push(row);
            }
        }
    }
    members
}

/// Averages probe rows into gene rows, skipping missing values.
///
/// A gene with no observed contributing probe in a sample is missing there.
pub fn aggregate_to_genes(matrix: &FeatureMatrix, annotation: &AnnotationTable) -> FeatureMatrix {
    let membership = gene_membership(&matrix.features, annotation);
    let n_samples = matrix.n_samples();
    let mut values = Array2::from_elem((membership.len(), n_samples), f64::NAN);

    let groups: Vec<&Vec<usize>> = membership.values().collect();
    values
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(groups.par_iter())
        .for_each(|(mut out, rows)| {
            for (col, slot) in out.iter_mut().enumerate() {
                let mut sum = 0.0;
                let mut count = 0usize;
                for &row in rows.iter() {
                    let value = matrix.values[[row, col]];
                    if !value.is_nan() {
                        sum += value;
                        count += 1;
                    }
                }
                if count > 0 {
                    *slot = sum / count as f64;
                }
            }
        });

    let contributing: usize = {
        let mut rows: Vec<usize> = groups.iter().flat_map(|g| g.iter().copied()).collect();
        rows.sort_unstable();
        rows.dedup();
        rows.len()
    };
    log::info!(
        "Aggregated {} of {} probes into {} genes",
        contributing,
        matrix.n_features(),
        membership.len()
    );

    FeatureMatrix {
        features: membership.into_keys().collect(),
        samples: matrix.samples.clone(),
        values,
    }
}

/// Clamps one value into `[BETA_FLOOR, BETA_CEILING]`; a missing value stays missing.
pub fn clip_value(value: f64) -> f64 {
    if value.is_nan() {
        value
    } else {
        value.clamp(BETA_FLOOR, BETA_CEILING)
    }
}

/// Clamps every value of the matrix in place.
pub fn clip_values(matrix: &mut FeatureMatrix) {
    matrix.values.par_mapv_inplace(clip_value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::ProbeAnnotation;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn record(id: &str, genes: &[&str]) -> ProbeAnnotation {
        ProbeAnnotation {
            probe_id: id.to_string(),
            genes: genes.iter().map(|g| g.to_string()).collect(),
            ..ProbeAnnotation::default()
        }
    }

    #[test]
    fn one_probe_per_gene_is_identity() {
        let matrix = FeatureMatrix::new(
            vec!["cg1".into(), "cg2".into()],
            vec!["s1".into(), "s2".into()],
            array![[0.1, 0.2], [0.3, f64::NAN]],
        )
        .unwrap();
        let annotation =
            AnnotationTable::from_records(vec![record("cg1", &["A"]), record("cg2", &["B"])]);
        let genes = aggregate_to_genes(&matrix, &annotation);
        assert_eq!(genes.features, vec!["A", "B"]);
        assert_eq!(genes.values[[0, 0]], 0.1);
        assert_eq!(genes.values[[0, 1]], 0.2);
        assert_eq!(genes.values[[1, 0]], 0.3);
        assert!(genes.values[[1, 1]].is_nan());
    }

    #[test]
    fn shared_gene_takes_probe_mean() {
        let matrix = FeatureMatrix::new(
            vec!["cg001".into(), "cg002".into(), "cg003".into()],
            vec!["s1".into(), "s2".into()],
            array![[0.2, 0.4], [0.4, f64::NAN], [0.9, 0.9]],
        )
        .unwrap();
        let annotation = AnnotationTable::from_records(vec![
            record("cg001", &["X"]),
            record("cg002", &["X", "Y"]),
            record("cg003", &[]),
        ]);
        let genes = aggregate_to_genes(&matrix, &annotation);
        assert_eq!(genes.features, vec!["X", "Y"]);
        assert_abs_diff_eq!(genes.values[[0, 0]], 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(genes.values[[0, 1]], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(genes.values[[1, 0]], 0.4, epsilon = 1e-12);
        assert!(genes.values[[1, 1]].is_nan());
    }

    #[test]
    fn clipping_respects_bounds_and_missing() {
        let mut matrix = FeatureMatrix::new(
            vec!["A".into()],
            vec!["s1".into(), "s2".into(), "s3".into(), "s4".into()],
            array![[0.0, 1.0, 0.5, f64::NAN]],
        )
        .unwrap();
        clip_values(&mut matrix);
        assert_eq!(matrix.values[[0, 0]], BETA_FLOOR);
        assert_eq!(matrix.values[[0, 1]], BETA_CEILING);
        assert_eq!(matrix.values[[0, 2]], 0.5);
        assert!(matrix.values[[0, 3]].is_nan());
    }
}
