use std::fmt;

/// Stages of processing one project, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessStage {
    Loading,
    ProbeQc,
    SampleQc,
    Imputation,
    Aggregation,
    Clipping,
}

impl ProcessStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Loading => "sample loading",
            Self::ProbeQc => "probe quality control",
            Self::SampleQc => "sample quality control",
            Self::Imputation => "missing-value imputation",
            Self::Aggregation => "gene aggregation",
            Self::Clipping => "value clipping",
        }
    }
}

impl fmt::Display for ProcessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting per-file progress while sample files are loaded.
///
/// Files are read on a worker pool, so callbacks may arrive from several threads
/// and in any order.
pub trait LoadProgressObserver: Sync {
    fn on_start(&self, total_files: usize) {
        let _ = total_files;
    }
    fn on_file_loaded(&self, sample_id: &str) {
        let _ = sample_id;
    }
    fn on_finish(&self) {}
}

#[derive(Default)]
pub struct NoopLoadProgress;

impl LoadProgressObserver for NoopLoadProgress {}
