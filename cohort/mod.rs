#![deny(dead_code)]
#![deny(unused_imports)]

pub mod reconcile;
pub mod split;

pub use reconcile::{Cohort, ReconcileError, reconcile_directory, reconcile_projects};
pub use split::{CohortSplit, SplitError, split_cohort};
