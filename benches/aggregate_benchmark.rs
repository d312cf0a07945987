// ========================================================================================
//
//                     METHYLPREP GENE AGGREGATION BENCHMARK
//
// ========================================================================================
//
// Measures probe-to-gene aggregation and clipping on synthetic matrices shaped like one
// TCGA project: a few hundred samples and probes grouped several to a gene, with a
// sprinkling of missing values.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use methylprep::FeatureMatrix;
use methylprep::aggregate::{aggregate_to_genes, clip_values};
use methylprep::annotation::{AnnotationTable, ProbeAnnotation};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// --- Benchmark Tuning Parameters ---

/// Samples per synthetic project.
const NUM_SAMPLES: usize = 400;
/// Probe counts to test; the x-axis of the report.
const PROBE_COUNTS: [usize; 3] = [10_000, 50_000, 200_000];
/// Probes mapped to each gene.
const PROBES_PER_GENE: usize = 8;
/// Share of entries left missing.
const MISSING_RATE: f64 = 0.01;

fn synthetic_project(num_probes: usize, seed: u64) -> (FeatureMatrix, AnnotationTable) {
    let mut rng = StdRng::seed_from_u64(seed);
    let probes: Vec<String> = (0..num_probes).map(|i| format!("cg{i:08}")).collect();
    let samples: Vec<String> = (0..NUM_SAMPLES).map(|i| format!("sample{i:04}")).collect();
    let values = Array2::from_shape_fn((num_probes, NUM_SAMPLES), |_| {
        if rng.gen_bool(MISSING_RATE) {
            f64::NAN
        } else {
            rng.r#gen::<f64>()
        }
    });

    let records = probes
        .iter()
        .enumerate()
        .map(|(i, probe)| ProbeAnnotation {
            probe_id: probe.clone(),
            chr: Some(format!("{}", 1 + i % 22)),
            // Every tenth probe also belongs to a neighbouring gene.
            genes: if i % 10 == 0 {
                vec![
                    format!("GENE{}", i / PROBES_PER_GENE),
                    format!("GENE{}", i / PROBES_PER_GENE + 1),
                ]
            } else {
                vec![format!("GENE{}", i / PROBES_PER_GENE)]
            },
            ..ProbeAnnotation::default()
        })
        .collect();

    let matrix = FeatureMatrix {
        features: probes,
        samples,
        values,
    };
    (matrix, AnnotationTable::from_records(records))
}

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_to_genes");
    group.sample_size(10);

    for &num_probes in &PROBE_COUNTS {
        let (matrix, annotation) = synthetic_project(num_probes, 42);
        group.throughput(Throughput::Elements((num_probes * NUM_SAMPLES) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_probes),
            &(matrix, annotation),
            |b, (matrix, annotation)| {
                b.iter(|| aggregate_to_genes(black_box(matrix), black_box(annotation)))
            },
        );
    }
    group.finish();
}

fn bench_clipping(c: &mut Criterion) {
    let mut group = c.benchmark_group("clip_values");
    group.sample_size(10);

    for &num_probes in &PROBE_COUNTS {
        let (matrix, annotation) = synthetic_project(num_probes, 7);
        let genes = aggregate_to_genes(&matrix, &annotation);
        group.throughput(Throughput::Elements(genes.values.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(num_probes), &genes, |b, genes| {
            b.iter_batched(
                || genes.clone(),
                |mut genes| {
                    clip_values(&mut genes);
                    black_box(genes)
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_aggregation, bench_clipping);
criterion_main!(benches);
