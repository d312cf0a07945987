//! # Pipeline Configuration
//!
//! One TOML file drives every stage. All fields carry defaults so a minimal file
//! only names what differs from them; relative paths are resolved against the
//! directory holding the configuration file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Configuration value '{name}' must lie in [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// How the reconciler combines the gene sets of different projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinPolicy {
    /// Union of gene sets; genes a project lacks become missing values.
    #[default]
    Outer,
    /// Intersection of gene sets; no missing values are introduced.
    Inner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_data_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub annotation_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub training_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_data_dir: PathBuf::from("data/raw/methylation"),
            metadata_dir: PathBuf::from("data/metadata/methylation"),
            annotation_dir: PathBuf::from("resources"),
            processed_dir: PathBuf::from("data/processed/methylation"),
            training_dir: PathBuf::from("data/training/methylation"),
        }
    }
}

impl PathsConfig {
    fn rebase(&mut self, root: &Path) {
        for path in [
            &mut self.raw_data_dir,
            &mut self.metadata_dir,
            &mut self.annotation_dir,
            &mut self.processed_dir,
            &mut self.training_dir,
        ] {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
    }
}

/// Columns of the sample metadata table consumed by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Column whose values match the per-sample file names.
    pub sample_key: String,
    /// Column holding the array generation of each sample.
    pub platform_column: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            sample_key: "file_name".to_string(),
            platform_column: "platform".to_string(),
        }
    }
}

/// Toggles and thresholds of the quality-control and imputation stages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub toggle_sample_filtering: bool,
    pub toggle_probe_filtering: bool,
    pub toggle_imputation: bool,
    /// Maximum fraction of missing probes tolerated per sample.
    pub max_missing_sample: f64,
    /// Maximum fraction of missing samples tolerated per probe.
    pub max_missing_probe: f64,
    /// Accepted for compatibility with neighbour-based imputation settings.
    /// Row-mean imputation does not use it.
    pub n_neighbours: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Size of the file-loading worker pool; 0 selects the number of CPUs.
    pub workers: usize,
}

impl LoaderConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub join: JoinPolicy,
}

/// The complete configuration of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub seed: u64,
    pub paths: PathsConfig,
    pub metadata: MetadataConfig,
    pub preprocess: PreprocessConfig,
    pub loader: LoaderConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            paths: PathsConfig::default(),
            metadata: MetadataConfig::default(),
            preprocess: PreprocessConfig::default(),
            loader: LoaderConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads, validates, and rebases a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        let root = path.parent().unwrap_or_else(|| Path::new("."));
        config.paths.rebase(root);
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text without touching the paths.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("max_missing_sample", self.preprocess.max_missing_sample)?;
        check_fraction("max_missing_probe", self.preprocess.max_missing_probe)?;
        Ok(())
    }
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min: 0.0,
            max: 1.0,
        });
    }
    Ok(())
}
