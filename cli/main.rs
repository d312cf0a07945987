#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use methylprep::PipelineConfig;
use methylprep::cohort::{reconcile_directory, split_cohort};
use methylprep::loader::clean_raw_directory;
use methylprep::process::process_project;
use methylprep::progress::LoadProgressObserver;
use methylprep::store::{write_cohort, write_processed_project};

const COHORT_ARTIFACT: &str = "tcga_cohort_gene_matrix";
const TRAIN_ARTIFACT: &str = "tcga_train_gene_matrix";
const VALIDATION_ARTIFACT: &str = "tcga_val_gene_matrix";
const TEST_ARTIFACT: &str = "tcga_test_gene_matrix";

#[derive(Parser)]
#[command(
    name = "methylprep",
    about = "Preprocessing and cohort reconciliation for DNA methylation array data",
    long_about = "Turns per-sample TCGA methylation beta-value files into quality-controlled \
                 gene-level matrices, reconciles projects into one cohort, and writes \
                 stratified train/validation/test splits."
)]
struct Cli {
    /// Log debug-level detail (RUST_LOG overrides this)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process raw sample files of one or more projects into gene matrices
    #[command(about = "Process projects (outputs: <PROJECT>_gene_matrix.parquet)")]
    Process {
        /// Project identifier, e.g. TCGA-BRCA; repeat to process several
        #[arg(long = "project", value_name = "PROJECT", required = true)]
        projects: Vec<String>,

        /// Path to the pipeline configuration file (.toml)
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Reconcile processed projects into a cohort and split it
    #[command(about = "Build the cohort and its splits (outputs: tcga_*_gene_matrix.parquet)")]
    Prepare {
        /// Path to the pipeline configuration file (.toml)
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Flatten a GDC download directory into per-sample parquet files
    #[command(about = "Convert *.level3betas.txt downloads to parquet")]
    Clean {
        /// Directory holding the downloaded files of one project
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// Print a configuration file holding every default value
    #[command(about = "Print the default configuration as TOML")]
    DefaultConfig,

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    let Cli { verbose, command } = Cli::parse();

    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    let result = match command {
        Some(Commands::Process { projects, config }) => run_process(&projects, &config),
        Some(Commands::Prepare { config }) => run_prepare(&config),
        Some(Commands::Clean { dir }) => run_clean(&dir),
        Some(Commands::DefaultConfig) => run_default_config(),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command().print_help().map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ========================================================================================
//                                   Progress display
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Shows sample-file loading on a terminal progress bar.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new(project: &str) -> Self {
        Self {
            bar: create_progress_bar(0, &format!("Loading {project} sample files")),
        }
    }
}

impl LoadProgressObserver for BarProgress {
    fn on_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
    }

    fn on_file_loaded(&self, _: &str) {
        self.bar.inc(1);
    }

    fn on_finish(&self) {
        self.bar.finish_and_clear();
    }
}

// ========================================================================================
//                                  Subcommand runners
// ========================================================================================

fn run_process(projects: &[String], config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::load(config_path)?;
    let mut failed = Vec::new();

    for project in projects {
        let start = Instant::now();
        let progress = BarProgress::new(project);
        let outcome = process_project(project, &config, &progress)
            .map_err(|e| e.to_string())
            .and_then(|processed| {
                write_processed_project(&config.paths.processed_dir, &processed)
                    .map_err(|e| e.to_string())
            });
        match outcome {
            Ok(paths) => log::info!(
                "{project} done in {:.1?}; wrote {}",
                start.elapsed(),
                paths.matrix.display()
            ),
            Err(e) => {
                log::error!("{project} failed: {e}");
                failed.push(project.as_str());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} of {} projects failed: {}", failed.len(), projects.len(), failed.join(", ")).into())
    }
}

fn run_prepare(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::load(config_path)?;
    let training_dir = &config.paths.training_dir;

    let cohort = reconcile_directory(&config.paths.processed_dir, config.reconcile.join)?;
    write_cohort(training_dir, COHORT_ARTIFACT, &cohort)?;

    let split = split_cohort(&cohort, config.seed)?;
    let (train, validation, test) = split.apply(&cohort);
    write_cohort(training_dir, TRAIN_ARTIFACT, &train)?;
    write_cohort(training_dir, VALIDATION_ARTIFACT, &validation)?;
    write_cohort(training_dir, TEST_ARTIFACT, &test)?;

    println!(
        "Cohort of {} samples × {} genes split into {}/{}/{} (train/validation/test) in {}",
        cohort.n_samples(),
        cohort.matrix.n_features(),
        train.n_samples(),
        validation.n_samples(),
        test.n_samples(),
        training_dir.display()
    );
    Ok(())
}

fn run_clean(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let converted = clean_raw_directory(dir)?;
    println!("Converted {converted} sample files in {}", dir.display());
    Ok(())
}

fn run_default_config() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", PipelineConfig::default().to_toml()?);
    Ok(())
}

// ========================================================================================
//                                  Version reporting
// ========================================================================================

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;
    const YEAR: u64 = 365 * DAY;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else if seconds < WEEK {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    } else if seconds < YEAR {
        format!("{:.1} weeks ago", seconds as f64 / WEEK as f64)
    } else {
        format!("{:.1} years ago", seconds as f64 / YEAR as f64)
    }
}

fn print_version_info() {
    println!("methylprep {}", env!("CARGO_PKG_VERSION"));

    let build_timestamp: u64 = env!("METHYLPREP_BUILD_TIMESTAMP").parse().unwrap_or(0);
    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
