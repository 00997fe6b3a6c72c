//! InSAR pair-batch scheduler CLI
//!
//! Processes a list of acquisition pairs with an external radar-processing tool,
//! resuming from checkpoints across invocations.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use insar_batch::{build_runtime, plan_batch, run_batch, Config};

/// Exit status when the batch could not run to completion.
const EXIT_ABORTED: u8 = 2;

#[derive(Parser)]
#[command(name = "insar-batch")]
#[command(about = "Run InSAR pair processing jobs with bounded parallelism and resume", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "batch.yaml", global = true)]
    config: PathBuf,

    /// Override the number of concurrent jobs
    #[arg(short, long, global = true, env = "WORKERS")]
    workers: Option<usize>,

    /// Override the pair list
    #[arg(short, long, global = true)]
    pairs: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the batch (default if no command specified)
    Run,

    /// Show the task list and resume points without processing
    Analyze,

    /// Validate configuration and pair list
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "batch.yaml")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        None | Some(Commands::Run) => run_command(&cli.config, cli.workers, cli.pairs),
        Some(Commands::Analyze) => analyze_command(&cli.config, cli.workers, cli.pairs),
        Some(Commands::Validate) => validate_command(&cli.config, cli.pairs),
        Some(Commands::GenerateConfig { ref output }) => generate_config_command(output),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(EXIT_ABORTED)
        }
    }
}

fn load_config(path: &Path, workers: Option<usize>, pairs: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::from_file(path)?;

    // Apply overrides
    if let Some(w) = workers {
        config.workers.count = Some(w);
    }
    if let Some(p) = pairs {
        config.input.pairs_file = p;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: &Path, workers: Option<usize>, pairs: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(config_path, workers, pairs)?;

    let runtime = build_runtime(None)?;
    let summary = runtime.block_on(async {
        tokio::select! {
            result = run_batch(config) => result.map(Some),
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => tracing::warn!("Interrupted, stopping running jobs"),
                    Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
                }
                Ok(None)
            }
        }
    })?;

    match summary {
        Some(summary) => {
            println!("\n{}\n", summary);
            Ok(ExitCode::from(summary.exit_code()))
        }
        None => Ok(ExitCode::from(EXIT_ABORTED)),
    }
}

fn analyze_command(config_path: &Path, workers: Option<usize>, pairs: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(config_path, workers, pairs)?;
    let plan = plan_batch(&config)?;
    let phase_count = plan.phases.len();

    println!("\n=== Batch Analysis ===");
    println!("Pair list: {}", config.input.pairs_file.display());
    println!("Jobs: {}", plan.catalog.len());
    println!("Catalog errors: {}", plan.catalog.errors.len());
    for error in &plan.catalog.errors {
        println!("  {}", error);
    }

    if let Some((first, last)) = plan.catalog.date_range() {
        println!("Acquisition dates: {} .. {} (orbit files needed for this range)", first, last);
    }

    println!("\n=== Phases ({}) ===", phase_count);
    for phase in &plan.phases {
        let steps = if phase.start_step == phase.end_step {
            phase.start_step.clone()
        } else {
            format!("{} .. {}", phase.start_step, phase.end_step)
        };
        println!("{:>3}. {:<20} {}", phase.ordinal + 1, phase.name, steps);
    }

    println!("\n=== Tasks ===");
    for (job, resume) in plan.catalog.jobs.iter().zip(&plan.resume) {
        let state = match plan.phases.get(*resume) {
            None => "complete".to_string(),
            Some(_) if *resume == 0 => "not started".to_string(),
            Some(phase) => format!("resume at {}/{} ({})", resume + 1, phase_count, phase.name),
        };
        println!("{:<28} {:<24} {}", job.id.to_string(), job.pair.to_string(), state);
    }

    println!("\n=== Resources ===");
    println!("Worker pool: {}", plan.sizing);
    println!(
        "Pending jobs: {} ({} already complete)",
        plan.catalog.len() - plan.complete_jobs(),
        plan.complete_jobs()
    );
    println!("======================\n");

    Ok(ExitCode::SUCCESS)
}

fn validate_command(config_path: &Path, pairs: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(config_path, None, pairs)?;
    println!("Configuration is valid ({} phases)", config.phases.len());

    if config.input.pairs_file.exists() {
        let catalog = insar_batch::Catalog::from_file(
            &config.input.pairs_file,
            &config.output.runs_dir,
            config.input.roi()?,
        )?;
        println!(
            "Pair list {}: {} jobs, {} errors",
            config.input.pairs_file.display(),
            catalog.len(),
            catalog.errors.len()
        );
        for error in &catalog.errors {
            println!("  {}", error);
        }
    } else {
        println!("Pair list {} not found", config.input.pairs_file.display());
    }
    Ok(ExitCode::SUCCESS)
}

const SAMPLE_CONFIG: &str = r#"# InSAR Pair Batch Configuration

# === INPUT: Which pairs to process ===
input:
  # One pair per line: two SAFE names, "a,b", "(a, b)" or "a b". '#' starts a comment.
  pairs_file: "data/pairs.txt"

  # Region of interest passed to the job file: south, north, west, east
  # roi: "[34.0, 35.0, -118.5, -117.5]"

# === OUTPUT: Where results and checkpoints go ===
output:
  # One run directory per pair: <runs_dir>/run_<refdate>_<secdate>_<pair hash>
  runs_dir: "data/runs"

  # Phase checkpoints (default: <runs_dir>/.checkpoints)
  # checkpoint_dir: "data/runs/.checkpoints"

  # Machine-readable batch summary
  summary_path: "data/runs/summary.json"

# === WORKERS: How many pairs run at once ===
workers:
  # Explicit worker count (omit to size from available memory)
  # count: 2

  # Memory budget per running job, used when count is omitted
  memory_per_worker_gb: 16.0

  # Upper bound for the memory-derived worker count
  max_workers: 8

# === TOOL: The external processor ===
tool:
  program: "topsApp.py"

  # Placeholders: {start} {end} {phase} {job_id} {reference} {secondary} {output_dir}
  args: ["topsApp.xml", "--steps", "--start={start}", "--end={end}"]

  # Keep each job from using every core
  env:
    OMP_NUM_THREADS: "4"
    MKL_NUM_THREADS: "4"

  # Kill a phase after this many seconds (0 = no limit)
  timeout_secs: 0

  # Output tail kept in the summary for failed jobs
  excerpt_bytes: 2048

  # Job file rendered into every run directory
  # Placeholders: {reference} {secondary} {dem} {job_id} {south} {north} {west} {east}
  job_file:
    name: "topsApp.xml"
    template: |
      <?xml version="1.0" encoding="UTF-8"?>
      <topsApp>
      <component name="topsinsar">
      <property name="sensor name">SENTINEL1</property>
      <property name="swaths">[1,2,3]</property>
      <property name="do unwrap">True</property>
      <property name="unwrapper name">snaphu_mcf</property>
      <property name="demFilename">{dem}</property>
      <component name="reference">
      <property name="output directory">reference</property>
      <property name="safe">{reference}</property>
      </component>
      <component name="secondary">
      <property name="output directory">secondary</property>
      <property name="safe">{secondary}</property>
      </component>
      </component>
      </topsApp>

# === PHASES: Ordered processing steps ===
# Omit to use the default topsApp layout (13 co-registration steps, then
# fineresamp..geocode as a single "interferogram" phase).
# phases:
#   - name: preprocess
#   - name: ionosphere
#     skippable: true
#     skip_when: not_requested
#   - name: interferogram
#     start: fineresamp
#     end: geocode
#     max_attempts: 1

# === RETRY: Transient failure handling ===
retry:
  max_attempts: 3
  initial_backoff_ms: 3000
  max_backoff_ms: 60000
  multiplier: 2.0

# === CLASSIFICATION: What counts as transient ===
# Anything not listed here is fatal.
classification:
  transient_exit_codes: [75]
  fatal_exit_codes: []
  transient_patterns:
    - "(?i)connection (reset|refused|timed out)"
    - "(?i)resource temporarily unavailable"
    - "(?i)database is locked"
  fatal_patterns:
    - "(?i)no such file or directory"

# === STAGING: Shared inputs linked into each run directory ===
staging:
  raw_dir: "data/raw"
  dem_path: "data/dem/dem.wgs84"
  orbit_dir: "data/orbits"
  # Removed when a job starts from its first phase
  clean_on_fresh_start: ["pickle"]

# === METRICS: Progress reporting ===
metrics:
  enabled: true
  interval_secs: 60
  # output_path: "data/runs/metrics.json"
"#;

fn generate_config_command(output: &Path) -> Result<ExitCode> {
    std::fs::write(output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());
    Ok(ExitCode::SUCCESS)
}
