//! Worker pool scheduling for pair jobs.
//!
//! Jobs are dispatched in catalog order with bounded concurrency. Each running job
//! holds one worker slot for its whole Running period. A job's failure is reported and
//! never stops dispatch of the others; a scheduler-internal error aborts the batch and
//! drops every in-flight job (which kills its external process).

use crate::catalog::{JobId, PairJob};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::WorkerConfig;
use crate::pipeline::{InvalidTransition, JobReport, JobRunner, JobState, Metrics, MetricsReporter, Phase};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrently running jobs
    pub workers: usize,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            enable_metrics: true,
            metrics_interval_secs: 60,
            metrics_output_path: None,
        }
    }
}

/// Error that aborts the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("checkpoint store failure: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("worker slot unavailable: {0}")]
    SlotUnavailable(String),

    #[error("job {job}: {source}")]
    InvalidTransition {
        job: JobId,
        #[source]
        source: InvalidTransition,
    },
}

/// Fixed-size set of worker slots.
#[derive(Debug)]
pub struct WorkerSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl WorkerSlots {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<SlotGuard, SchedulerError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SchedulerError::SlotUnavailable(e.to_string()))?;
        self.metrics.job_started();
        Ok(SlotGuard {
            _permit: permit,
            metrics: self.metrics.clone(),
        })
    }
}

/// An occupied worker slot. Released on drop, whatever the job's outcome.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<Metrics>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.metrics.job_finished();
    }
}

/// Scheduler state shared by all jobs of one batch.
pub struct SchedulerContext {
    pub slots: WorkerSlots,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub metrics: Arc<Metrics>,
    /// Current state of every job holding a slot
    pub in_flight: DashMap<JobId, JobState>,
}

impl SchedulerContext {
    pub fn new(workers: usize, checkpoints: Arc<dyn CheckpointStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            slots: WorkerSlots::new(workers, metrics.clone()),
            checkpoints,
            metrics,
            in_flight: DashMap::new(),
        }
    }

    /// `job: phase` for every job holding a slot, sorted by job id.
    pub fn in_flight_phases(&self, phases: &[Phase]) -> Vec<String> {
        let phase_name = |idx: usize| phases.get(idx).map_or("?", |p| p.name.as_str());
        let mut entries: Vec<String> = self
            .in_flight
            .iter()
            .map(|entry| {
                let state = match entry.value() {
                    JobState::Pending => "dispatching".to_string(),
                    JobState::Running { phase } => phase_name(*phase).to_string(),
                    JobState::PhaseComplete { phase } => format!("{} done", phase_name(*phase)),
                    terminal => terminal.status().to_string(),
                };
                format!("{}: {}", entry.key(), state)
            })
            .collect();
        entries.sort();
        entries
    }
}

/// Scheduler for running a batch of pair jobs.
pub struct Scheduler {
    runner: JobRunner,
    ctx: Arc<SchedulerContext>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(runner: JobRunner, ctx: Arc<SchedulerContext>, config: SchedulerConfig) -> Self {
        Self { runner, ctx, config }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    /// Run every job to a terminal state.
    ///
    /// Reports come back in completion order.
    pub async fn run(&self, jobs: Vec<PairJob>) -> Result<Vec<JobReport>, SchedulerError> {
        let total_jobs = jobs.len();
        let workers = self.config.workers.max(1).min(self.ctx.slots.capacity());

        tracing::info!(
            "Scheduling {} jobs ({} phases each, {} concurrent)",
            total_jobs,
            self.runner.phases().len(),
            workers
        );

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.ctx.metrics.clone(),
                self.config.metrics_interval_secs,
                total_jobs as u64,
            )
            .with_in_flight(self.ctx.clone(), self.runner.shared_phases());
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut results = stream::iter(jobs)
            .map(|job| self.runner.run(job))
            .buffer_unordered(workers);

        let mut reports = Vec::with_capacity(total_jobs);
        let mut abort = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!("Aborting batch: {}", e);
                    abort = Some(e);
                    break;
                }
            }
        }
        // Dropping the stream cancels in-flight jobs.
        drop(results);

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if let Some(ref path) = self.config.metrics_output_path {
            if let Err(e) = self.ctx.metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path.display(), e);
            }
        }

        match abort {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

/// How the worker count was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingSource {
    Explicit,
    Memory,
}

/// Resolved worker count.
#[derive(Debug, Clone)]
pub struct WorkerSizing {
    pub workers: usize,
    pub source: SizingSource,
    pub available_bytes: u64,
    pub memory_per_worker_gb: f64,
}

impl std::fmt::Display for WorkerSizing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source {
            SizingSource::Explicit => write!(f, "{} workers (configured)", self.workers),
            SizingSource::Memory => write!(
                f,
                "{} workers ({:.1} GB available / {:.1} GB per worker)",
                self.workers,
                self.available_bytes as f64 / GIB,
                self.memory_per_worker_gb
            ),
        }
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Workers that fit in `available_bytes`, clamped to `[1, max_workers]`.
pub fn workers_for_memory(available_bytes: u64, memory_per_worker_gb: f64, max_workers: usize) -> usize {
    let max_workers = max_workers.max(1);
    if memory_per_worker_gb <= 0.0 {
        return max_workers;
    }
    let fits = (available_bytes as f64 / GIB / memory_per_worker_gb).floor() as usize;
    fits.clamp(1, max_workers)
}

/// Memory currently available to new processes, in bytes.
pub fn available_memory() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let available = system.available_memory();
    if available > 0 {
        available
    } else {
        system.total_memory().saturating_sub(system.used_memory())
    }
}

/// Resolve the worker count from configuration, probing memory when it is not explicit.
pub fn resolve_workers(config: &WorkerConfig) -> WorkerSizing {
    match config.count {
        Some(count) => WorkerSizing {
            workers: count.max(1),
            source: SizingSource::Explicit,
            available_bytes: 0,
            memory_per_worker_gb: config.memory_per_worker_gb,
        },
        None => {
            let available_bytes = available_memory();
            WorkerSizing {
                workers: workers_for_memory(available_bytes, config.memory_per_worker_gb, config.max_workers),
                source: SizingSource::Memory,
                available_bytes,
                memory_per_worker_gb: config.memory_per_worker_gb,
            }
        }
    }
}
