//! Seeded, project-stratified train/validation/test partitioning of a cohort.
//!
//! The split runs in two stages. First `TEST_FRACTION` of the cohort is held out as the
//! test set; then `VALIDATION_FRACTION` of the remainder is held out as the validation
//! set. Both stages stratify by project label, so each partition keeps every project's
//! share of the cohort to within one sample, and both use the same seed.

use super::reconcile::Cohort;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use thiserror::Error;

/// Share of the full cohort held out for testing.
pub const TEST_FRACTION: f64 = 0.2;
/// Share of the non-test remainder held out for validation.
pub const VALIDATION_FRACTION: f64 = 0.25;

// Absorbs the rounding in products such as 0.2 * 30.
const SIZE_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SplitError {
    #[error("Cannot split an empty cohort")]
    EmptyCohort,
    #[error("Project '{project}' has {count} sample(s); stratification needs at least 2")]
    TooFewMembers { project: String, count: usize },
    #[error(
        "A {partition} partition of {size} sample(s) cannot hold all {classes} projects; more samples are needed"
    )]
    TooFewForStrata {
        partition: &'static str,
        size: usize,
        classes: usize,
    },
}

/// Column indices of each partition, each sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

impl CohortSplit {
    /// Materializes the three partitions as (train, validation, test).
    pub fn apply(&self, cohort: &Cohort) -> (Cohort, Cohort, Cohort) {
        (
            cohort.subset(&self.train),
            cohort.subset(&self.validation),
            cohort.subset(&self.test),
        )
    }
}

/// Number of held-out members of each class, by largest remainder.
///
/// Every class first receives the floor of its exact share; the leftover slots go to
/// the classes with the largest fractional parts, ties broken by class order.
fn allocate(class_sizes: &[usize], total: usize, held_out: usize) -> Vec<usize> {
    let exact: Vec<f64> = class_sizes
        .iter()
        .map(|&size| held_out as f64 * size as f64 / total as f64)
        .collect();
    let mut counts: Vec<usize> = exact
        .iter()
        .zip(class_sizes)
        .map(|(share, &size)| (share.floor() as usize).min(size))
        .collect();

    let mut leftover = held_out.saturating_sub(counts.iter().sum());
    let mut order: Vec<usize> = (0..class_sizes.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    for class in order.into_iter().cycle() {
        if leftover == 0 {
            break;
        }
        if counts[class] < class_sizes[class] {
            counts[class] += 1;
            leftover -= 1;
        }
    }
    counts
}

/// Splits positions `0..labels.len()` into (kept, held_out), stratified by label.
///
/// The held-out partition has `ceil(fraction · n)` members. Members of each class are
/// shuffled with a `StdRng` seeded from `seed` before the held-out share is taken.
pub fn stratified_split(
    labels: &[String],
    fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), SplitError> {
    if labels.is_empty() {
        return Err(SplitError::EmptyCohort);
    }

    let mut classes: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (position, label) in labels.iter().enumerate() {
        classes.entry(label.as_str()).or_default().push(position);
    }
    if let Some((project, members)) = classes.iter().find(|(_, members)| members.len() < 2) {
        return Err(SplitError::TooFewMembers {
            project: project.to_string(),
            count: members.len(),
        });
    }

    let n = labels.len();
    let held_out = ((fraction * n as f64 - SIZE_EPSILON).ceil().max(0.0) as usize).min(n);
    let kept = n - held_out;
    for (partition, size) in [("held-out", held_out), ("remaining", kept)] {
        if size < classes.len() {
            return Err(SplitError::TooFewForStrata {
                partition,
                size,
                classes: classes.len(),
            });
        }
    }

    let sizes: Vec<usize> = classes.values().map(Vec::len).collect();
    let counts = allocate(&sizes, n, held_out);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut kept_positions = Vec::with_capacity(kept);
    let mut held_positions = Vec::with_capacity(held_out);
    for (members, &take) in classes.values().zip(&counts) {
        let mut shuffled = members.clone();
        shuffled.shuffle(&mut rng);
        held_positions.extend_from_slice(&shuffled[..take]);
        kept_positions.extend_from_slice(&shuffled[take..]);
    }
    kept_positions.sort_unstable();
    held_positions.sort_unstable();
    Ok((kept_positions, held_positions))
}

/// Two-stage 60/20/20 split of a cohort by project label.
pub fn split_cohort(cohort: &Cohort, seed: u64) -> Result<CohortSplit, SplitError> {
    let (rest, test) = stratified_split(&cohort.projects, TEST_FRACTION, seed)?;

    let rest_labels: Vec<String> = rest.iter().map(|&i| cohort.projects[i].clone()).collect();
    let (train_local, validation_local) =
        stratified_split(&rest_labels, VALIDATION_FRACTION, seed)?;
    let train: Vec<usize> = train_local.iter().map(|&i| rest[i]).collect();
    let validation: Vec<usize> = validation_local.iter().map(|&i| rest[i]).collect();

    log::info!(
        "Split {} samples into {} train, {} validation, {} test (seed {seed})",
        cohort.n_samples(),
        train.len(),
        validation.len(),
        test.len()
    );
    Ok(CohortSplit {
        train,
        validation,
        test,
    })
}
