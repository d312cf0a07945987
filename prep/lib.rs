#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod aggregate;
pub mod annotation;
pub mod config;
pub mod impute;
pub mod loader;
pub mod metadata;
pub mod process;
pub mod progress;
pub mod qc;
pub mod store;
pub mod types;

#[path = "../cohort/mod.rs"]
pub mod cohort;

pub use config::PipelineConfig;
pub use process::{ProcessedProject, process_project};
pub use types::{ArrayType, FeatureMatrix, SampleTable};
