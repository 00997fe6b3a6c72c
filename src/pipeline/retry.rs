//! Bounded retry around phase execution.
//!
//! Each attempt is classified into an [`AttemptOutcome`]; [`decide`] turns the outcome
//! into the next step. Only the last attempt survives a terminal phase, carried in
//! [`PhaseOutcome::Failed`] for reporting.

use crate::catalog::PairJob;
use crate::config::RetryConfig;
use crate::pipeline::{
    ExecutionStatus, FailureClassifier, FailureKind, Metrics, Phase, PhaseExecution, PhaseExecutor,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Attempt limits and backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }

    /// Attempt limit for a phase. Non-retryable phases get exactly one attempt.
    pub fn attempts_for(&self, phase: &Phase) -> usize {
        if !phase.retryable {
            return 1;
        }
        phase.max_attempts.unwrap_or(self.max_attempts).max(1)
    }

    /// Delay before retry number `retry` (1-based). Never decreases, never exceeds the cap.
    pub fn backoff_for(&self, retry: usize) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure { reason: String },
    FatalFailure { reason: String },
}

impl AttemptOutcome {
    pub fn reason(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Success => None,
            AttemptOutcome::TransientFailure { reason } | AttemptOutcome::FatalFailure { reason } => {
                Some(reason.as_str())
            }
        }
    }
}

/// One execution of one phase.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub number: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when the process did not exit normally
    pub exit_code: Option<i32>,
    pub outcome: AttemptOutcome,
    /// Tail of the attempt's output
    pub excerpt: String,
    pub log_path: Option<PathBuf>,
}

/// Terminal result of running a phase through the retry controller.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    Succeeded {
        attempts: usize,
    },
    Failed {
        attempts: usize,
        reason: String,
        last_attempt: Box<Attempt>,
    },
}

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Done,
    RetryAfter(Duration),
    GiveUp { reason: String },
}

/// Decide the next step after attempt `attempt` (1-based) out of `limit`.
pub fn decide(policy: &RetryPolicy, limit: usize, attempt: usize, outcome: &AttemptOutcome) -> RetryDecision {
    match outcome {
        AttemptOutcome::Success => RetryDecision::Done,
        AttemptOutcome::FatalFailure { reason } => RetryDecision::GiveUp { reason: reason.clone() },
        AttemptOutcome::TransientFailure { reason } if attempt >= limit => RetryDecision::GiveUp {
            reason: if limit > 1 {
                format!("{} (gave up after {} attempts)", reason, attempt)
            } else {
                reason.clone()
            },
        },
        AttemptOutcome::TransientFailure { .. } => RetryDecision::RetryAfter(policy.backoff_for(attempt)),
    }
}

/// Runs a phase to a terminal [`PhaseOutcome`].
pub struct RetryController {
    executor: Arc<dyn PhaseExecutor>,
    classifier: Arc<FailureClassifier>,
    policy: RetryPolicy,
    excerpt_bytes: usize,
    metrics: Arc<Metrics>,
}

impl RetryController {
    pub fn new(
        executor: Arc<dyn PhaseExecutor>,
        classifier: Arc<FailureClassifier>,
        policy: RetryPolicy,
        excerpt_bytes: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            executor,
            classifier,
            policy,
            excerpt_bytes,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Map an execution onto an attempt outcome.
    pub fn classify(&self, execution: &PhaseExecution) -> AttemptOutcome {
        match &execution.status {
            ExecutionStatus::Success => AttemptOutcome::Success,
            ExecutionStatus::Exited { code } => {
                let reason = match code {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                };
                match self.classifier.classify_exit(*code, &execution.output_tail) {
                    FailureKind::Transient => AttemptOutcome::TransientFailure { reason },
                    FailureKind::Fatal => AttemptOutcome::FatalFailure { reason },
                }
            }
            ExecutionStatus::TimedOut { after } => AttemptOutcome::TransientFailure {
                reason: format!("timed out after {}s", after.as_secs()),
            },
            ExecutionStatus::LaunchFailed(msg) => AttemptOutcome::FatalFailure { reason: msg.clone() },
            ExecutionStatus::MarkerMissing(path) => AttemptOutcome::FatalFailure {
                reason: format!("success marker {} missing", path.display()),
            },
        }
    }

    /// Run `phase` of `job` until it succeeds, fails fatally, or exhausts its attempts.
    pub async fn run_phase(&self, job: &PairJob, phase: &Phase) -> PhaseOutcome {
        let limit = self.policy.attempts_for(phase);
        let mut number = 1;

        loop {
            let started_at = Utc::now();
            let execution = self.executor.execute(job, phase, number).await;
            let finished_at = Utc::now();

            self.metrics.add_attempt();
            self.metrics.add_phase_time(execution.duration);
            if matches!(execution.status, ExecutionStatus::TimedOut { .. }) {
                self.metrics.add_timeout();
            }

            let outcome = self.classify(&execution);
            match decide(&self.policy, limit, number, &outcome) {
                RetryDecision::Done => {
                    tracing::debug!("[{}] {} succeeded on attempt {}", job.id, phase.name, number);
                    return PhaseOutcome::Succeeded { attempts: number };
                }
                RetryDecision::RetryAfter(backoff) => {
                    tracing::warn!(
                        "[{}] {} attempt {}/{} failed: {}, retrying in {}ms",
                        job.id,
                        phase.name,
                        number,
                        limit,
                        outcome.reason().unwrap_or("unknown"),
                        backoff.as_millis()
                    );
                    self.metrics.add_retry();
                    tokio::time::sleep(backoff).await;
                    number += 1;
                }
                RetryDecision::GiveUp { reason } => {
                    tracing::error!(
                        "[{}] {} failed after {} attempt(s): {}",
                        job.id,
                        phase.name,
                        number,
                        reason
                    );
                    let last_attempt = Attempt {
                        number,
                        started_at,
                        finished_at,
                        exit_code: match execution.status {
                            ExecutionStatus::Exited { code } => code,
                            _ => None,
                        },
                        outcome,
                        excerpt: execution.excerpt(self.excerpt_bytes),
                        log_path: execution.log_path,
                    };
                    return PhaseOutcome::Failed {
                        attempts: number,
                        reason,
                        last_attempt: Box::new(last_attempt),
                    };
                }
            }
        }
    }
}
