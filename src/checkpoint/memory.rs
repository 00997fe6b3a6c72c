//! In-memory checkpoint store for dry runs and tests.

use super::{CheckpointError, CheckpointRecord, CheckpointStore};
use crate::catalog::{JobId, PairJob};
use crate::pipeline::Phase;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Volatile checkpoint store, partitioned by job id.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    jobs: DashMap<JobId, BTreeMap<String, CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all jobs.
    pub fn len(&self) -> usize {
        self.jobs.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn is_complete(&self, job: &PairJob, phase: &Phase) -> Result<bool, CheckpointError> {
        let Some(records) = self.jobs.get(&job.id) else {
            return Ok(false);
        };
        match records.get(&phase.name) {
            Some(record) => record.check_pair(&job.pair).map(|()| true),
            None => Ok(false),
        }
    }

    fn record_complete(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let mut records = self.jobs.entry(record.job_id.clone()).or_default();
        match records.get(&record.phase) {
            Some(existing) => existing.check_pair(&record.pair),
            None => {
                records.insert(record.phase.clone(), record.clone());
                Ok(())
            }
        }
    }

    fn records(&self, job_id: &JobId) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        Ok(self
            .jobs
            .get(job_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }
}
