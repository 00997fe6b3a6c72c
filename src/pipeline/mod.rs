//! Pipeline orchestration for pair jobs.

mod classify;
mod executor;
mod job;
mod metrics;
mod phase;
mod report;
mod retry;
mod scheduler;
mod staging;


pub use classify::{FailureClassifier, FailureKind};
pub use executor::{render_template, ExecutionStatus, PhaseExecution, PhaseExecutor, ProcessExecutor};
pub use job::{transition, InvalidTransition, JobEvent, JobRunner, JobState, STAGING_PHASE};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use phase::{Phase, SkipWhen};
pub use report::{BatchSummary, JobReport};
pub use retry::{decide, Attempt, AttemptOutcome, PhaseOutcome, RetryController, RetryDecision, RetryPolicy};
pub use scheduler::{
    available_memory, resolve_workers, workers_for_memory, Scheduler, SchedulerConfig, SchedulerContext,
    SchedulerError, SizingSource, SlotGuard, WorkerSizing, WorkerSlots,
};
pub use staging::{Stager, StagingError};
