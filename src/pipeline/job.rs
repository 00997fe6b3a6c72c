//! Per-job state machine.
//!
//! ```text
//! Pending -> Running(r) -> {PhaseComplete(i) -> Running(i+1)}* -> Succeeded | Failed | Skipped
//! ```
//!
//! [`transition`] is pure; [`JobRunner`] drives it with phase outcomes and owns all
//! side effects (staging, execution, checkpoint writes).

use crate::catalog::{JobStatus, PairJob};
use crate::checkpoint::{CheckpointRecord, PhaseCompletion};
use crate::pipeline::{
    JobReport, Phase, PhaseOutcome, RetryController, SchedulerContext, SchedulerError, Stager,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Lifecycle state of one job within one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running { phase: usize },
    PhaseComplete { phase: usize },
    Succeeded,
    Failed { phase: String, reason: String },
    Skipped,
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::Running { .. } => JobStatus::Running,
            JobState::PhaseComplete { .. } => JobStatus::PhaseComplete,
            JobState::Succeeded => JobStatus::Succeeded,
            JobState::Failed { .. } => JobStatus::Failed,
            JobState::Skipped => JobStatus::Skipped,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The job got a worker slot; `resume_phase` is the first phase without a checkpoint.
    Dispatched { resume_phase: usize },
    /// The current phase succeeded and its checkpoint is durable.
    PhaseSucceeded,
    /// The current phase's precondition held and its checkpoint is durable.
    PhaseSkipped,
    /// The current phase failed terminally.
    PhaseFailed { reason: String },
    /// The run directory could not be prepared.
    StagingFailed { reason: String },
    /// Move past a completed phase.
    Advance,
}

/// Rejected state-machine input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub event: JobEvent,
}

/// Phase name used when staging fails.
pub const STAGING_PHASE: &str = "staging";

/// Compute the next state. `phases` is the ordered phase list of the batch.
pub fn transition(state: &JobState, event: &JobEvent, phases: &[Phase]) -> Result<JobState, InvalidTransition> {
    let invalid = || InvalidTransition {
        from: state.clone(),
        event: event.clone(),
    };

    let next = match (state, event) {
        (JobState::Pending, JobEvent::Dispatched { resume_phase }) if *resume_phase >= phases.len() => {
            JobState::Skipped
        }
        (JobState::Pending, JobEvent::Dispatched { resume_phase }) => JobState::Running { phase: *resume_phase },
        (JobState::Running { phase }, JobEvent::PhaseSucceeded | JobEvent::PhaseSkipped) => {
            JobState::PhaseComplete { phase: *phase }
        }
        (JobState::Running { phase }, JobEvent::PhaseFailed { reason }) => JobState::Failed {
            phase: phases.get(*phase).map(|p| p.name.clone()).ok_or_else(invalid)?,
            reason: reason.clone(),
        },
        (JobState::Running { .. }, JobEvent::StagingFailed { reason }) => JobState::Failed {
            phase: STAGING_PHASE.to_string(),
            reason: reason.clone(),
        },
        (JobState::PhaseComplete { phase }, JobEvent::Advance) if phase + 1 >= phases.len() => JobState::Succeeded,
        (JobState::PhaseComplete { phase }, JobEvent::Advance) => JobState::Running { phase: phase + 1 },
        _ => return Err(invalid()),
    };
    Ok(next)
}

/// Runs jobs through their phases.
pub struct JobRunner {
    phases: Arc<[Phase]>,
    retry: RetryController,
    stager: Stager,
    ctx: Arc<SchedulerContext>,
}

impl JobRunner {
    pub fn new(phases: Arc<[Phase]>, retry: RetryController, stager: Stager, ctx: Arc<SchedulerContext>) -> Self {
        Self {
            phases,
            retry,
            stager,
            ctx,
        }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn shared_phases(&self) -> Arc<[Phase]> {
        self.phases.clone()
    }

    /// Run a job to a terminal state.
    ///
    /// Phase failures end up in the report. Only scheduler-internal problems
    /// (checkpoint store, slots, state machine) are returned as errors.
    pub async fn run(&self, job: PairJob) -> Result<JobReport, SchedulerError> {
        let span = tracing::info_span!("job", id = %job.id);
        self.run_inner(job).instrument(span).await
    }

    async fn run_inner(&self, mut job: PairJob) -> Result<JobReport, SchedulerError> {
        let _slot = self.ctx.slots.acquire().await?;
        let started = Instant::now();

        let result = self.drive(&mut job).await;
        self.ctx.in_flight.remove(&job.id);

        let mut report = result?;
        report.elapsed = started.elapsed();

        match report.status {
            JobStatus::Succeeded => {
                self.ctx.metrics.add_job_succeeded();
                tracing::info!("Succeeded in {:.1}s", report.elapsed.as_secs_f64());
            }
            JobStatus::Skipped => {
                self.ctx.metrics.add_job_skipped();
                tracing::info!("All phases already complete, skipping");
            }
            JobStatus::Failed => {
                self.ctx.metrics.add_job_failed();
                tracing::error!(
                    "Failed at {}: {}",
                    report.failed_phase.as_deref().unwrap_or("?"),
                    report.reason.as_deref().unwrap_or("unknown")
                );
            }
            _ => {}
        }
        Ok(report)
    }

    fn apply(&self, job: &mut PairJob, state: &JobState, event: JobEvent) -> Result<JobState, SchedulerError> {
        let next = transition(state, &event, &self.phases).map_err(|source| SchedulerError::InvalidTransition {
            job: job.id.clone(),
            source,
        })?;
        job.status = next.status();
        if let JobState::Running { phase } | JobState::PhaseComplete { phase } = next {
            job.phase_index = phase;
        }
        self.ctx.in_flight.insert(job.id.clone(), next.clone());
        Ok(next)
    }

    async fn drive(&self, job: &mut PairJob) -> Result<JobReport, SchedulerError> {
        let resume_phase = self.ctx.checkpoints.resume_phase(job, &self.phases)?;
        let mut report = JobReport::new(job, resume_phase);

        let mut state = self.apply(job, &JobState::Pending, JobEvent::Dispatched { resume_phase })?;

        if let JobState::Running { phase } = state {
            tracing::info!(
                "Starting at phase {}/{} ({})",
                phase + 1,
                self.phases.len(),
                self.phases[phase].name
            );
            if let Err(e) = self.stager.prepare(job, phase == 0) {
                state = self.apply(job, &state, JobEvent::StagingFailed { reason: e.to_string() })?;
            }
        }

        while let JobState::Running { phase: idx } = state {
            let phase = &self.phases[idx];

            let event = if phase.should_skip(job) {
                tracing::info!("Skipping {}: precondition holds", phase.name);
                self.checkpoint(job, phase, PhaseCompletion::Skipped, 0)?;
                self.ctx.metrics.add_phase_skipped();
                report.phases_skipped += 1;
                JobEvent::PhaseSkipped
            } else {
                tracing::info!("Phase {}/{}: {}", idx + 1, self.phases.len(), phase.name);
                match self.retry.run_phase(job, phase).await {
                    PhaseOutcome::Succeeded { attempts } => {
                        report.attempts += attempts;
                        self.checkpoint(job, phase, PhaseCompletion::Executed, attempts)?;
                        self.ctx.metrics.add_phase_executed();
                        report.phases_executed += 1;
                        JobEvent::PhaseSucceeded
                    }
                    PhaseOutcome::Failed {
                        attempts,
                        reason,
                        last_attempt,
                    } => {
                        report.attempts += attempts;
                        report.last_attempt = Some(*last_attempt);
                        JobEvent::PhaseFailed { reason }
                    }
                }
            };

            state = self.apply(job, &state, event)?;
            if let JobState::PhaseComplete { .. } = state {
                state = self.apply(job, &state, JobEvent::Advance)?;
            }
        }

        report.status = state.status();
        if let JobState::Failed { phase, reason } = state {
            report.failed_phase = Some(phase);
            report.reason = Some(reason);
        }
        Ok(report)
    }

    fn checkpoint(
        &self,
        job: &PairJob,
        phase: &Phase,
        outcome: PhaseCompletion,
        attempts: usize,
    ) -> Result<(), SchedulerError> {
        let record = CheckpointRecord::new(job, phase, outcome, attempts);
        self.ctx.checkpoints.record_complete(&record)?;
        tracing::debug!("Checkpointed {}", phase.name);
        Ok(())
    }
}
