// ========================================================================================
//
//                                 PER-PROJECT PROCESSING
//
// ========================================================================================
//
// Runs every stage for one project in a fixed order:
//
//   metadata → annotation → loading → probe QC → sample QC → imputation
//            → gene aggregation → clipping → metadata alignment
//
// Nothing is written to disk here; persistence belongs to `store`.

use crate::aggregate::{aggregate_to_genes, clip_values};
use crate::annotation::{AnnotationError, load_annotation};
use crate::config::PipelineConfig;
use crate::impute::{ImputeError, impute_probe_means};
use crate::loader::{LoadError, list_sample_files, load_beta_matrix, sample_id_from_path};
use crate::metadata::{
    MetadataError, align_metadata, load_sample_table, platform_values, project_metadata_path,
};
use crate::progress::{LoadProgressObserver, ProcessStage};
use crate::qc::{ProbeQcReport, SampleQcReport, probe_qc, sample_qc};
use crate::types::{ArrayType, FeatureMatrix, SampleTable};
use ahash::AHashSet;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error("No sample file in {raw_dir} belongs to a {array_type} sample of project {project}")]
    NoMatchingSamples {
        project: String,
        array_type: ArrayType,
        raw_dir: PathBuf,
    },
    #[error("Project {project} has no data left after {stage}")]
    EmptyMatrix {
        project: String,
        stage: ProcessStage,
    },
}

/// Counts collected while processing one project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingReport {
    pub sample_files: usize,
    pub metadata_rows: usize,
    /// Files skipped because their sample is of another array type or has no metadata.
    pub skipped_files: usize,
    pub loaded_samples: usize,
    pub loaded_probes: usize,
    pub probe_qc: Option<ProbeQcReport>,
    pub sample_qc: Option<SampleQcReport>,
    pub imputed_values: Option<usize>,
    pub genes: usize,
    pub samples: usize,
}

/// The in-memory result of processing one project.
#[derive(Debug, Clone)]
pub struct ProcessedProject {
    pub project: String,
    pub array_type: ArrayType,
    /// Genes × samples, clipped.
    pub genes: FeatureMatrix,
    /// One row per column of `genes`, in the same order.
    pub metadata: SampleTable,
    pub report: ProcessingReport,
}

fn ensure_not_empty(
    matrix: &FeatureMatrix,
    project: &str,
    stage: ProcessStage,
) -> Result<(), ProcessError> {
    if matrix.is_empty() {
        return Err(ProcessError::EmptyMatrix {
            project: project.to_string(),
            stage,
        });
    }
    Ok(())
}

/// Processes one project from raw sample files to a clipped gene matrix.
pub fn process_project(
    project: &str,
    config: &PipelineConfig,
    observer: &dyn LoadProgressObserver,
) -> Result<ProcessedProject, ProcessError> {
    let preprocess = &config.preprocess;
    let mut report = ProcessingReport::default();

    let raw_dir = config.paths.raw_data_dir.join(project);
    let files = list_sample_files(&raw_dir)?;
    report.sample_files = files.len();

    let metadata_path = project_metadata_path(&config.paths.metadata_dir, project);
    let table = load_sample_table(&metadata_path, &config.metadata.sample_key)?;
    report.metadata_rows = table.len();
    let platforms = platform_values(&table, &config.metadata.platform_column, &metadata_path)?;

    let (annotation, array_type) = load_annotation(&config.paths.annotation_dir, &platforms)?;

    let selected: AHashSet<&str> = table
        .sample_ids
        .iter()
        .zip(&platforms)
        .filter(|(_, platform)| ArrayType::from_platform(platform) == Some(array_type))
        .map(|(id, _)| id.as_str())
        .collect();
    let files: Vec<PathBuf> = files
        .into_iter()
        .filter(|path| selected.contains(sample_id_from_path(path).as_str()))
        .collect();
    report.skipped_files = report.sample_files - files.len();
    if files.is_empty() {
        return Err(ProcessError::NoMatchingSamples {
            project: project.to_string(),
            array_type,
            raw_dir,
        });
    }
    log::info!(
        "{project}: {} {array_type} samples selected, {} files skipped",
        files.len(),
        report.skipped_files
    );

    log::info!("{project}: {}", ProcessStage::Loading);
    let mut matrix = load_beta_matrix(&files, config.loader.effective_workers(), observer)?;
    ensure_not_empty(&matrix, project, ProcessStage::Loading)?;
    report.loaded_samples = matrix.n_samples();
    report.loaded_probes = matrix.n_features();

    if preprocess.toggle_probe_filtering {
        log::info!("{project}: {}", ProcessStage::ProbeQc);
        let (kept, qc) = probe_qc(&matrix, &annotation, preprocess.max_missing_probe);
        matrix = kept;
        report.probe_qc = Some(qc);
        ensure_not_empty(&matrix, project, ProcessStage::ProbeQc)?;
    }

    if preprocess.toggle_sample_filtering {
        log::info!("{project}: {}", ProcessStage::SampleQc);
        let (kept, qc) = sample_qc(&matrix, preprocess.max_missing_sample);
        matrix = kept;
        report.sample_qc = Some(qc);
        ensure_not_empty(&matrix, project, ProcessStage::SampleQc)?;
    }

    if preprocess.toggle_imputation {
        log::info!("{project}: {}", ProcessStage::Imputation);
        report.imputed_values = Some(impute_probe_means(&mut matrix)?);
    }

    log::info!("{project}: {}", ProcessStage::Aggregation);
    let mut genes = aggregate_to_genes(&matrix, &annotation);
    ensure_not_empty(&genes, project, ProcessStage::Aggregation)?;

    log::info!("{project}: {}", ProcessStage::Clipping);
    clip_values(&mut genes);

    let metadata = align_metadata(&table, &genes.samples);
    report.genes = genes.n_features();
    report.samples = genes.n_samples();
    log::info!(
        "{project}: finished with {} samples × {} genes",
        report.samples,
        report.genes
    );

    Ok(ProcessedProject {
        project: project.to_string(),
        array_type,
        genes,
        metadata,
        report,
    })
}
