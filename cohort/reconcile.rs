// ========================================================================================
//
//                                  COHORT RECONCILIATION
//
// ========================================================================================
//
// Per-project gene matrices are stacked along the sample axis into one cohort. Projects
// measured on different array generations cover different genes; the join policy decides
// whether the cohort keeps the union of gene sets (genes a project lacks are missing for
// its samples) or only the genes every project covers.

use crate::config::JoinPolicy;
use crate::store::{
    ArtifactPaths, PROJECT_MATRIX_SUFFIX, ProjectProvenance, StoreError, read_feature_matrix,
    read_provenance, read_sample_table,
};
use crate::types::{FeatureMatrix, SampleTable};
use ahash::{AHashMap, AHashSet};
use ndarray::Array2;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Metadata column holding the project label used for stratification.
pub const PROJECT_COLUMN: &str = "tcga_project";
/// Metadata column naming the artifact each sample came from.
pub const BATCH_COLUMN: &str = "batch";
/// Metadata column holding the array generation of each sample's project.
pub const ARRAY_TYPE_COLUMN: &str = "array_type";

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Processed data directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("No project gene matrix artifacts found in {0}")]
    NoArtifacts(PathBuf),
    #[error("Sample '{sample}' appears in both {first} and {second}")]
    DuplicateSample {
        sample: String,
        first: String,
        second: String,
    },
    #[error("The projects share no gene under the {0:?} join policy")]
    EmptyGeneIntersection(JoinPolicy),
    #[error("Project artifact is missing its provenance file {0}")]
    MissingProvenance(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Gene matrix of a whole cohort with its per-sample metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Cohort {
    /// Genes × samples.
    pub matrix: FeatureMatrix,
    /// One row per matrix column, in the same order.
    pub obs: SampleTable,
    /// Project label of every sample, in column order.
    pub projects: Vec<String>,
}

impl Cohort {
    pub fn n_samples(&self) -> usize {
        self.matrix.n_samples()
    }

    /// Keeps the given samples, in the given order.
    pub fn subset(&self, samples: &[usize]) -> Self {
        Self {
            matrix: self.matrix.select_samples(samples),
            obs: self.obs.select(samples),
            projects: samples.iter().map(|&s| self.projects[s].clone()).collect(),
        }
    }
}

/// A loaded project artifact.
#[derive(Debug, Clone)]
pub struct ProjectArtifact {
    pub project: String,
    pub matrix: FeatureMatrix,
    pub obs: SampleTable,
    pub provenance: ProjectProvenance,
}

/// Project label of an artifact: its file stem up to the first underscore.
pub fn project_label_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.split('_').next().unwrap_or_default().to_string()
}

/// Lists `*_gene_matrix.parquet` files in `dir`, sorted by name.
pub fn discover_project_artifacts(dir: &Path) -> Result<Vec<PathBuf>, ReconcileError> {
    if !dir.is_dir() {
        return Err(ReconcileError::DirectoryNotFound(dir.to_path_buf()));
    }
    let suffix = format!("{PROJECT_MATRIX_SUFFIX}.parquet");
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&suffix));
        if matches && path.is_file() {
            found.push(path);
        }
    }
    if found.is_empty() {
        return Err(ReconcileError::NoArtifacts(dir.to_path_buf()));
    }
    found.sort();
    Ok(found)
}

/// Loads the matrix, metadata, and provenance of one artifact.
pub fn load_project_artifact(matrix_path: &Path) -> Result<ProjectArtifact, ReconcileError> {
    let paths = ArtifactPaths::from_matrix_path(matrix_path);
    if !paths.provenance.is_file() {
        return Err(ReconcileError::MissingProvenance(paths.provenance));
    }
    let project = project_label_from_path(matrix_path);
    let provenance = read_provenance(&paths.provenance)?;
    if provenance.project != project {
        log::warn!(
            "Artifact {} is labelled {} but its provenance names {}",
            matrix_path.display(),
            project,
            provenance.project
        );
    }

    let matrix = read_feature_matrix(matrix_path)?;
    let obs = if paths.obs.is_file() {
        read_sample_table(&paths.obs)?
    } else {
        log::warn!("Artifact {} has no metadata table", matrix_path.display());
        SampleTable::default()
    };
    Ok(ProjectArtifact {
        project,
        matrix,
        obs,
        provenance,
    })
}

fn cohort_genes(artifacts: &[ProjectArtifact], join: JoinPolicy) -> Vec<String> {
    let mut sets = artifacts
        .iter()
        .map(|a| a.matrix.features.iter().cloned().collect::<BTreeSet<String>>());
    let Some(first) = sets.next() else {
        return Vec::new();
    };
    let genes = sets.fold(first, |acc, set| match join {
        JoinPolicy::Outer => acc.union(&set).cloned().collect(),
        JoinPolicy::Inner => acc.intersection(&set).cloned().collect(),
    });
    genes.into_iter().collect()
}

/// Stacks project artifacts, in the given order, into one cohort.
pub fn reconcile_projects(
    artifacts: &[ProjectArtifact],
    join: JoinPolicy,
) -> Result<Cohort, ReconcileError> {
    let genes = cohort_genes(artifacts, join);
    if genes.is_empty() {
        return Err(ReconcileError::EmptyGeneIntersection(join));
    }
    let gene_row: AHashMap<&str, usize> = genes
        .iter()
        .enumerate()
        .map(|(row, gene)| (gene.as_str(), row))
        .collect();

    let mut owner: AHashMap<&str, &str> = AHashMap::new();
    for artifact in artifacts {
        for sample in &artifact.matrix.samples {
            if let Some(first) = owner.insert(sample.as_str(), artifact.project.as_str()) {
                return Err(ReconcileError::DuplicateSample {
                    sample: sample.clone(),
                    first: first.to_string(),
                    second: artifact.project.clone(),
                });
            }
        }
    }

    let mut columns: Vec<String> = Vec::new();
    let mut known: AHashSet<&str> = AHashSet::new();
    let reserved = [PROJECT_COLUMN, BATCH_COLUMN, ARRAY_TYPE_COLUMN];
    for artifact in artifacts {
        for column in &artifact.obs.columns {
            if !reserved.contains(&column.as_str()) && known.insert(column.as_str()) {
                columns.push(column.clone());
            }
        }
    }
    columns.extend(reserved.iter().map(|c| c.to_string()));

    let n_samples: usize = artifacts.iter().map(|a| a.matrix.n_samples()).sum();
    let mut values = Array2::from_elem((genes.len(), n_samples), f64::NAN);
    let mut samples = Vec::with_capacity(n_samples);
    let mut projects = Vec::with_capacity(n_samples);
    let mut obs = SampleTable::with_columns(columns.clone());

    let mut offset = 0;
    for artifact in artifacts {
        for (source_row, gene) in artifact.matrix.features.iter().enumerate() {
            let Some(&target_row) = gene_row.get(gene.as_str()) else {
                continue;
            };
            let source = artifact.matrix.values.row(source_row);
            for (col, &value) in source.iter().enumerate() {
                values[[target_row, offset + col]] = value;
            }
        }

        let obs_index = artifact.obs.index();
        let array_type = artifact.provenance.array_type.to_string();
        for sample in &artifact.matrix.samples {
            let source_row = obs_index.get(sample.as_str()).copied();
            let row: Vec<String> = columns
                .iter()
                .map(|column| match column.as_str() {
                    PROJECT_COLUMN | BATCH_COLUMN => artifact.project.clone(),
                    ARRAY_TYPE_COLUMN => array_type.clone(),
                    other => source_row
                        .and_then(|r| artifact.obs.value(r, other))
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect();
            obs.push(sample.clone(), row);
            samples.push(sample.clone());
            projects.push(artifact.project.clone());
        }
        log::info!(
            "Added {} samples × {} genes from {}",
            artifact.matrix.n_samples(),
            artifact.matrix.n_features(),
            artifact.project
        );
        offset += artifact.matrix.n_samples();
    }

    log::info!(
        "Reconciled {} projects into {} samples × {} genes ({:?} join)",
        artifacts.len(),
        n_samples,
        genes.len(),
        join
    );
    Ok(Cohort {
        matrix: FeatureMatrix {
            features: genes,
            samples,
            values,
        },
        obs,
        projects,
    })
}

/// Discovers, loads, and reconciles every project artifact in `dir`.
pub fn reconcile_directory(dir: &Path, join: JoinPolicy) -> Result<Cohort, ReconcileError> {
    let artifacts = discover_project_artifacts(dir)?
        .iter()
        .map(|path| load_project_artifact(path))
        .collect::<Result<Vec<_>, _>>()?;
    reconcile_projects(&artifacts, join)
}
