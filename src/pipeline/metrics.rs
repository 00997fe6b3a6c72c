//! Batch progress monitoring and metrics collection.

use crate::pipeline::{Phase, SchedulerContext};
use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a batch run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Jobs that reached Succeeded
    pub jobs_succeeded: AtomicU64,

    /// Jobs that reached Failed
    pub jobs_failed: AtomicU64,

    /// Jobs skipped because every phase was already checkpointed
    pub jobs_skipped: AtomicU64,

    /// Phases that ran to success
    pub phases_executed: AtomicU64,

    /// Phases skipped by their precondition
    pub phases_skipped: AtomicU64,

    /// Phase attempts started
    pub attempts: AtomicU64,

    /// Attempts that were followed by a retry
    pub retries: AtomicU64,

    /// Attempts killed by their timeout
    pub timeouts: AtomicU64,

    /// Jobs currently holding a worker slot
    pub running: AtomicU64,

    /// High-water mark of `running`
    pub max_running: AtomicU64,

    /// Time spent inside the external tool (microseconds, summed across workers)
    pub phase_time_us: AtomicU64,

    /// Start time
    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_job_skipped(&self) {
        self.jobs_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_phase_executed(&self) {
        self.phases_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_phase_skipped(&self) {
        self.phases_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in the external tool (in microseconds).
    pub fn add_phase_time(&self, duration: Duration) {
        self.phase_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// A job took a worker slot.
    pub fn job_started(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
    }

    /// A job released its worker slot.
    pub fn job_finished(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Jobs in a terminal state.
    pub fn jobs_done(&self) -> u64 {
        self.jobs_succeeded.load(Ordering::Relaxed)
            + self.jobs_failed.load(Ordering::Relaxed)
            + self.jobs_skipped.load(Ordering::Relaxed)
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get finished jobs per hour.
    pub fn jobs_per_hour(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.jobs_done() as f64 / elapsed * 3600.0
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_skipped: self.jobs_skipped.load(Ordering::Relaxed),
            phases_executed: self.phases_executed.load(Ordering::Relaxed),
            phases_skipped: self.phases_skipped.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            running: self.running.load(Ordering::SeqCst),
            max_running: self.max_running.load(Ordering::SeqCst),
            elapsed: self.elapsed(),
            jobs_per_hour: self.jobs_per_hour(),
            phase_secs: self.phase_time_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub phases_executed: u64,
    pub phases_skipped: u64,
    pub attempts: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub running: u64,
    pub max_running: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub jobs_per_hour: f64,
    /// Total time spent in the external tool (seconds, summed across workers)
    pub phase_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path.display());
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Jobs: {} succeeded, {} failed, {} skipped | Running: {} | \
             Phases: {} executed, {} skipped | Attempts: {} ({} retries, {} timeouts) | \
             Rate: {:.1} jobs/h | Elapsed: {:.1}s",
            self.jobs_succeeded,
            self.jobs_failed,
            self.jobs_skipped,
            self.running,
            self.phases_executed,
            self.phases_skipped,
            self.attempts,
            self.retries,
            self.timeouts,
            self.jobs_per_hour,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic progress reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_jobs: u64,
    /// Scheduler state and phase list for listing running jobs
    jobs: Option<(Arc<SchedulerContext>, Arc<[Phase]>)>,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_jobs: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_jobs,
            jobs: None,
        }
    }

    /// Also report which phase every running job is in.
    pub fn with_in_flight(mut self, ctx: Arc<SchedulerContext>, phases: Arc<[Phase]>) -> Self {
        self.jobs = Some((ctx, phases));
        self
    }

    /// `job: phase` for every job currently holding a worker slot.
    pub fn in_flight(&self) -> Vec<String> {
        match &self.jobs {
            Some((ctx, phases)) => ctx.in_flight_phases(phases),
            None => Vec::new(),
        }
    }

    /// Percentage of jobs in a terminal state.
    pub fn progress(&self) -> f64 {
        if self.total_jobs > 0 {
            self.metrics.jobs_done() as f64 / self.total_jobs as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("[{:.1}%] {}", self.progress(), self.metrics.snapshot());
                    let active = self.in_flight();
                    if !active.is_empty() {
                        tracing::info!("In flight: {}", active.join(", "));
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_job_succeeded();
        metrics.add_job_succeeded();
        metrics.add_job_failed();
        metrics.add_phase_executed();
        metrics.add_phase_skipped();
        metrics.add_attempt();
        metrics.add_retry();
        metrics.add_timeout();
        metrics.add_phase_time(Duration::from_millis(1500));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_succeeded, 2);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.phases_executed, 1);
        assert_eq!(snapshot.phases_skipped, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert!((snapshot.phase_secs - 1.5).abs() < 0.001);
        assert_eq!(metrics.jobs_done(), 3);
    }

    #[test]
    fn test_running_high_water_mark() {
        let metrics = Metrics::new();

        metrics.job_started();
        metrics.job_started();
        metrics.job_finished();
        metrics.job_started();
        metrics.job_finished();
        metrics.job_finished();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.max_running, 2);
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };
        metrics.add_job_succeeded();
        assert_eq!(metrics.jobs_per_hour(), 0.0);
    }

    #[test]
    fn test_snapshot_display_and_save() {
        let metrics = Metrics::new();
        metrics.add_job_skipped();
        let snapshot = metrics.snapshot();

        let display = format!("{}", snapshot);
        assert!(display.contains("1 skipped"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        snapshot.save_to_file(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["jobs_skipped"], 1);
    }

    #[test]
    fn test_reporter_progress() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics.clone(), 0, 4);
        assert_eq!(reporter.interval_secs, 1);
        assert_eq!(reporter.progress(), 0.0);

        metrics.add_job_succeeded();
        assert_eq!(reporter.progress(), 25.0);
    }

    #[test]
    fn test_reporter_lists_in_flight_jobs() {
        use crate::catalog::JobId;
        use crate::checkpoint::MemoryCheckpointStore;
        use crate::pipeline::JobState;

        let metrics = Metrics::new();
        let ctx = Arc::new(SchedulerContext::new(2, Arc::new(MemoryCheckpointStore::new()), metrics.clone()));
        let phases: Arc<[Phase]> = vec![Phase::named(0, "topo"), Phase::named(1, "unwrap")].into();

        let reporter = MetricsReporter::new(metrics.clone(), 1, 2);
        assert!(reporter.in_flight().is_empty());

        let reporter = reporter.with_in_flight(ctx.clone(), phases);
        ctx.in_flight.insert(JobId::new("run_b"), JobState::Running { phase: 1 });
        ctx.in_flight.insert(JobId::new("run_a"), JobState::Running { phase: 0 });
        assert_eq!(reporter.in_flight(), vec!["run_a: topo", "run_b: unwrap"]);

        ctx.in_flight.remove(&JobId::new("run_a"));
        assert_eq!(reporter.in_flight(), vec!["run_b: unwrap"]);
    }
}
