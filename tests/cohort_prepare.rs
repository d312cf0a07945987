use std::fs;
use std::path::Path;
use std::process::Command;

use methylprep::cohort::reconcile::PROJECT_COLUMN;
use methylprep::cohort::{ReconcileError, reconcile_directory, split_cohort};
use methylprep::config::JoinPolicy;
use methylprep::process::{ProcessedProject, ProcessingReport};
use methylprep::store::{read_feature_matrix, read_sample_table, write_processed_project};
use methylprep::{ArrayType, FeatureMatrix, SampleTable};
use ndarray::Array2;
use tempfile::tempdir;

fn project(name: &str, array_type: ArrayType, genes: &[&str], n_samples: usize) -> ProcessedProject {
    let samples: Vec<String> = (0..n_samples).map(|i| format!("{name}-s{i:02}")).collect();
    let values = Array2::from_shape_fn((genes.len(), n_samples), |(g, s)| {
        0.1 + 0.02 * g as f64 + 0.01 * s as f64
    });
    let mut metadata = SampleTable::with_columns(vec!["gender".to_string()]);
    for (i, sample) in samples.iter().enumerate() {
        let gender = if i % 2 == 0 { "female" } else { "male" };
        metadata.push(sample.clone(), vec![gender.to_string()]);
    }
    ProcessedProject {
        project: name.to_string(),
        array_type,
        genes: FeatureMatrix::new(genes.iter().map(|g| g.to_string()).collect(), samples, values)
            .expect("consistent shape"),
        metadata,
        report: ProcessingReport::default(),
    }
}

fn write_two_projects(dir: &Path) {
    write_processed_project(dir, &project("TCGA-AAA", ArrayType::Hm450, &["A", "B"], 10))
        .expect("write first project");
    write_processed_project(dir, &project("TCGA-BBB", ArrayType::Epic, &["B", "C"], 20))
        .expect("write second project");
}

#[test]
fn outer_join_keeps_every_gene() {
    let tmp = tempdir().expect("temporary directory");
    write_two_projects(tmp.path());

    let cohort = reconcile_directory(tmp.path(), JoinPolicy::Outer).expect("reconcile");
    assert_eq!(cohort.matrix.features, vec!["A", "B", "C"]);
    assert_eq!(cohort.n_samples(), 30);

    // Gene C was never measured for the first project.
    let c = cohort.matrix.feature_row("C").expect("gene C");
    assert!(c.iter().take(10).all(|v| v.is_nan()));
    assert!(c.iter().skip(10).all(|v| !v.is_nan()));

    assert_eq!(cohort.obs.value(0, PROJECT_COLUMN), Some("TCGA-AAA"));
    assert_eq!(cohort.obs.value(29, PROJECT_COLUMN), Some("TCGA-BBB"));
    let epic = ArrayType::Epic.to_string();
    assert_eq!(cohort.obs.value(29, "array_type"), Some(epic.as_str()));
    assert_eq!(cohort.obs.value(1, "gender"), Some("male"));
}

#[test]
fn inner_join_keeps_shared_genes() {
    let tmp = tempdir().expect("temporary directory");
    write_two_projects(tmp.path());

    let cohort = reconcile_directory(tmp.path(), JoinPolicy::Inner).expect("reconcile");
    assert_eq!(cohort.matrix.features, vec!["B"]);
    assert_eq!(cohort.matrix.count_missing(), 0);
}

#[test]
fn repeated_sample_across_projects_is_rejected() {
    let tmp = tempdir().expect("temporary directory");
    write_processed_project(tmp.path(), &project("TCGA-AAA", ArrayType::Hm450, &["A"], 3))
        .expect("write project");
    let mut clash = project("TCGA-CCC", ArrayType::Hm450, &["A"], 3);
    clash.genes.samples[0] = "TCGA-AAA-s00".to_string();
    clash.metadata.sample_ids[0] = "TCGA-AAA-s00".to_string();
    write_processed_project(tmp.path(), &clash).expect("write clashing project");

    let err = reconcile_directory(tmp.path(), JoinPolicy::Outer).unwrap_err();
    assert!(matches!(err, ReconcileError::DuplicateSample { .. }));
}

#[test]
fn split_is_stratified_by_project() {
    let tmp = tempdir().expect("temporary directory");
    write_two_projects(tmp.path());
    let cohort = reconcile_directory(tmp.path(), JoinPolicy::Outer).expect("reconcile");

    let split = split_cohort(&cohort, 42).expect("split");
    let (train, validation, test) = split.apply(&cohort);
    assert_eq!(
        (train.n_samples(), validation.n_samples(), test.n_samples()),
        (18, 6, 6)
    );
    for part in [&train, &validation, &test] {
        let first = part.projects.iter().filter(|p| *p == "TCGA-AAA").count();
        assert_eq!(first * 3, part.n_samples());
    }
}

#[test]
fn prepare_command_writes_cohort_and_splits() {
    let tmp = tempdir().expect("temporary directory");
    let processed = tmp.path().join("processed");
    write_two_projects(&processed);
    fs::write(
        tmp.path().join("config.toml"),
        "seed = 42\n\n[paths]\nprocessed_dir = \"processed\"\ntraining_dir = \"training\"\n",
    )
    .expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_methylprep"))
        .arg("prepare")
        .arg("--config")
        .arg(tmp.path().join("config.toml"))
        .output()
        .expect("run methylprep prepare");
    assert!(
        output.status.success(),
        "prepare failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let training = tmp.path().join("training");
    let expected = [
        ("tcga_cohort_gene_matrix", 30),
        ("tcga_train_gene_matrix", 18),
        ("tcga_val_gene_matrix", 6),
        ("tcga_test_gene_matrix", 6),
    ];
    for (stem, n_samples) in expected {
        let matrix = read_feature_matrix(&training.join(format!("{stem}.parquet")))
            .unwrap_or_else(|e| panic!("{stem} matrix: {e}"));
        assert_eq!(matrix.n_samples(), n_samples, "{stem}");
        assert_eq!(matrix.features, vec!["A", "B", "C"]);

        let obs = read_sample_table(&training.join(format!("{stem}.obs.tsv")))
            .unwrap_or_else(|e| panic!("{stem} metadata: {e}"));
        assert_eq!(obs.sample_ids, matrix.samples);
    }
}

#[test]
fn prepare_without_artifacts_exits_with_error() {
    let tmp = tempdir().expect("temporary directory");
    fs::create_dir_all(tmp.path().join("processed")).expect("processed dir");
    fs::write(
        tmp.path().join("config.toml"),
        "[paths]\nprocessed_dir = \"processed\"\ntraining_dir = \"training\"\n",
    )
    .expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_methylprep"))
        .args(["prepare", "--config"])
        .arg(tmp.path().join("config.toml"))
        .output()
        .expect("run methylprep prepare");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No project gene matrix artifacts"), "{stderr}");
}

#[test]
fn default_config_round_trips() {
    let output = Command::new(env!("CARGO_BIN_EXE_methylprep"))
        .arg("default-config")
        .output()
        .expect("run methylprep default-config");
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout).expect("utf-8 output");
    let parsed = methylprep::PipelineConfig::from_toml_str(&text).expect("parse printed config");
    assert_eq!(parsed, methylprep::PipelineConfig::default());
}
