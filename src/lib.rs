//! InSAR pair-batch scheduler
//!
//! Runs a batch of interferometric processing jobs, one per acquisition pair, as
//! supervised invocations of an external radar-processing tool on a single host.
//!
//! # Architecture
//!
//! - **Catalog**: pair list parsing into job descriptors
//! - **Checkpoint**: durable per-job record of completed phases
//! - **Pipeline**: phase execution, retry, job state machine, worker pool and reporting
//!
//! # Usage
//!
//! ```no_run
//! use insar_batch::{Config, run_batch};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(Path::new("batch.yaml"))?;
//!     let summary = run_batch(config).await?;
//!     println!("{}", summary);
//!     std::process::exit(summary.exit_code().into());
//! }
//! ```

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod pipeline;

pub use catalog::{Catalog, CatalogError, JobId, PairJob};
pub use checkpoint::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};
pub use config::Config;
pub use pipeline::{BatchSummary, Metrics, PhaseExecutor, ProcessExecutor, Scheduler, SchedulerConfig};

use anyhow::{Context, Result};
use pipeline::{
    resolve_workers, FailureClassifier, JobRunner, Phase, RetryController, RetryPolicy, SchedulerContext, Stager,
    WorkerSizing,
};
use std::sync::Arc;
use std::time::Instant;

/// Run a batch with the external tool and on-disk checkpoints from `config`.
pub async fn run_batch(config: Config) -> Result<BatchSummary> {
    config.validate()?;

    let checkpoint_dir = config.output.checkpoint_dir();
    let checkpoints = FsCheckpointStore::open(&checkpoint_dir)
        .with_context(|| format!("Failed to open checkpoint store {}", checkpoint_dir.display()))?;
    let executor = ProcessExecutor::from_config(&config.tool);

    run_batch_with(config, Arc::new(executor), Arc::new(checkpoints)).await
}

/// Run a batch with an explicit executor and checkpoint store.
///
/// Returns an error only when the batch could not be set up or was aborted by a
/// scheduler-internal failure. Job failures are part of the summary.
pub async fn run_batch_with(
    config: Config,
    executor: Arc<dyn PhaseExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> Result<BatchSummary> {
    config.validate()?;
    let started = Instant::now();

    tracing::info!("Starting InSAR pair batch");

    let catalog = load_catalog(&config)?;
    let sizing = resolve_workers(&config.workers);
    tracing::info!("Worker pool: {}", sizing);

    let phases: Arc<[Phase]> = config.build_phases().into();
    let metrics = Metrics::new();
    let ctx = Arc::new(SchedulerContext::new(sizing.workers, checkpoints, metrics.clone()));

    let classifier = FailureClassifier::from_config(&config.classification)?;
    let retry = RetryController::new(
        executor,
        Arc::new(classifier),
        RetryPolicy::from_config(&config.retry),
        config.tool.excerpt_bytes,
        metrics,
    );
    let stager = Stager::new(config.staging.clone(), config.tool.job_file.clone());
    let runner = JobRunner::new(phases, retry, stager, ctx.clone());

    let scheduler_config = SchedulerConfig {
        workers: sizing.workers,
        enable_metrics: config.metrics.enabled,
        metrics_interval_secs: config.metrics.interval_secs,
        metrics_output_path: config.metrics.output_path.clone(),
    };
    let scheduler = Scheduler::new(runner, ctx, scheduler_config);

    let Catalog { jobs, errors } = catalog;
    let reports = scheduler.run(jobs).await.context("Batch aborted")?;

    let summary = BatchSummary::new(reports, errors, started.elapsed());
    if let Some(path) = &config.output.summary_path {
        summary.write_json(path);
    }

    tracing::info!(
        "Batch complete: {} succeeded, {} failed, {} skipped",
        summary.succeeded,
        summary.failed,
        summary.skipped
    );
    Ok(summary)
}

fn load_catalog(config: &Config) -> Result<Catalog> {
    let roi = config.input.roi()?;
    tracing::info!("Loading pairs from {}", config.input.pairs_file.display());
    let catalog = Catalog::from_file(&config.input.pairs_file, &config.output.runs_dir, roi)?;

    for error in &catalog.errors {
        tracing::warn!("Catalog: {}", error);
    }
    tracing::info!(
        "Loaded {} jobs ({} catalog errors)",
        catalog.len(),
        catalog.errors.len()
    );
    Ok(catalog)
}

/// What a run would do, without running anything.
#[derive(Debug)]
pub struct BatchPlan {
    pub catalog: Catalog,
    pub phases: Vec<Phase>,
    /// Resume phase per job, parallel to `catalog.jobs`
    pub resume: Vec<usize>,
    pub sizing: WorkerSizing,
}

impl BatchPlan {
    /// Jobs with every phase already checkpointed.
    pub fn complete_jobs(&self) -> usize {
        self.resume.iter().filter(|r| **r >= self.phases.len()).count()
    }
}

/// Parse the catalog and read checkpoints to plan a batch.
pub fn plan_batch(config: &Config) -> Result<BatchPlan> {
    config.validate()?;
    let catalog = load_catalog(config)?;
    let phases = config.build_phases();

    let checkpoint_dir = config.output.checkpoint_dir();
    let resume = if checkpoint_dir.exists() {
        let store = FsCheckpointStore::open(&checkpoint_dir)?;
        catalog
            .jobs
            .iter()
            .map(|job| store.resume_phase(job, &phases))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        vec![0; catalog.len()]
    };

    Ok(BatchPlan {
        catalog,
        phases,
        resume,
        sizing: resolve_workers(&config.workers),
    })
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
