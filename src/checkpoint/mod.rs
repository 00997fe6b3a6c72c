//! Durable per-job phase checkpoints.
//!
//! A checkpoint records that phase P of job J completed. The resume point of a job is
//! the first phase, in pipeline order, without a record. Stores are partitioned by job
//! id; the scheduler never writes the same job from two tasks at once. Every record also
//! names its pair, and reading a record on behalf of a different pair is an error.

mod fs_store;
mod memory;

pub use fs_store::FsCheckpointStore;
pub use memory::MemoryCheckpointStore;

use crate::catalog::{AcquisitionPair, JobId, PairJob};
use crate::pipeline::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a phase completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseCompletion {
    /// The phase ran and succeeded.
    Executed,

    /// The phase was skipped because its precondition held.
    Skipped,
}

/// Durable fact "phase P of job J completed at time T".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub job_id: JobId,
    pub pair: AcquisitionPair,
    pub phase: String,
    pub ordinal: usize,
    pub outcome: PhaseCompletion,
    /// Attempts the phase needed (0 when skipped)
    pub attempts: usize,
    pub completed_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(job: &PairJob, phase: &Phase, outcome: PhaseCompletion, attempts: usize) -> Self {
        Self {
            job_id: job.id.clone(),
            pair: job.pair.clone(),
            phase: phase.name.clone(),
            ordinal: phase.ordinal,
            outcome,
            attempts,
            completed_at: Utc::now(),
        }
    }

    /// Fail unless this record was written for `pair`.
    pub fn check_pair(&self, pair: &AcquisitionPair) -> Result<(), CheckpointError> {
        if self.pair == *pair {
            return Ok(());
        }
        Err(CheckpointError::PairMismatch {
            job_id: self.job_id.clone(),
            recorded: Box::new(self.pair.clone()),
            expected: Box::new(pair.clone()),
        })
    }
}

/// Checkpoint store failure. Treated as fatal to the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt checkpoint record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error(
        "checkpoints of job {job_id} belong to pair {} / {}, not {} / {}",
        .recorded.reference, .recorded.secondary, .expected.reference, .expected.secondary
    )]
    PairMismatch {
        job_id: JobId,
        recorded: Box<AcquisitionPair>,
        expected: Box<AcquisitionPair>,
    },
}

/// Durable store of phase completions.
pub trait CheckpointStore: Send + Sync {
    /// Whether a completion for `(job, phase)` is recorded. A record written for a
    /// different pair under the same job id is a [`CheckpointError::PairMismatch`].
    fn is_complete(&self, job: &PairJob, phase: &Phase) -> Result<bool, CheckpointError>;

    /// Persist a completion. Must be durable before returning. Writing the same
    /// `(job, phase)` twice leaves the store as if it were written once; writing it
    /// for a different pair fails with [`CheckpointError::PairMismatch`].
    fn record_complete(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    /// All records for a job, in no particular order.
    fn records(&self, job_id: &JobId) -> Result<Vec<CheckpointRecord>, CheckpointError>;

    /// Index of the first phase without a recorded completion; `phases.len()` when
    /// every phase is complete, 0 when none is.
    fn resume_phase(&self, job: &PairJob, phases: &[Phase]) -> Result<usize, CheckpointError> {
        for (idx, phase) in phases.iter().enumerate() {
            if !self.is_complete(job, phase)? {
                return Ok(idx);
            }
        }
        Ok(phases.len())
    }
}
