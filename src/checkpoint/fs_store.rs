//! Filesystem checkpoint store.
//!
//! Layout: `<root>/<job_id>/<phase>.json`, one JSON record per completed phase.
//! Records are written to a temporary file, fsynced, then renamed into place, so a
//! crash never leaves a partially written record under the final name.

use super::{CheckpointError, CheckpointRecord, CheckpointStore};
use crate::catalog::{JobId, PairJob};
use crate::pipeline::Phase;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Checkpoint store backed by one directory per job.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CheckpointError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    fn record_path(&self, job_id: &JobId, phase: &str) -> PathBuf {
        self.job_dir(job_id).join(format!("{}.json", phase))
    }

    fn read_record(path: &Path) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn is_complete(&self, job: &PairJob, phase: &Phase) -> Result<bool, CheckpointError> {
        let path = self.record_path(&job.id, &phase.name);
        match Self::read_record(&path)? {
            Some(record) => {
                record.check_pair(&job.pair)?;
                Ok(record.phase == phase.name)
            }
            None => Ok(false),
        }
    }

    fn record_complete(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let path = self.record_path(&record.job_id, &record.phase);
        if let Some(existing) = Self::read_record(&path)? {
            existing.check_pair(&record.pair)?;
            tracing::debug!(
                "Checkpoint {}/{} already recorded, keeping existing record",
                record.job_id,
                record.phase
            );
            return Ok(());
        }

        let dir = self.job_dir(&record.job_id);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let json = serde_json::to_vec_pretty(record).map_err(|source| CheckpointError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let tmp = dir.join(format!(".{}.json.tmp", record.phase));
        {
            let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
            file.write_all(&json).map_err(io_err(&tmp))?;
            file.sync_all().map_err(io_err(&tmp))?;
        }
        fs::rename(&tmp, &path).map_err(io_err(&path))?;

        // Persist the rename itself.
        #[cfg(unix)]
        File::open(&dir)
            .and_then(|d| d.sync_all())
            .map_err(io_err(&dir))?;

        Ok(())
    }

    fn records(&self, job_id: &JobId) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let dir = self.job_dir(job_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(CheckpointError::Io { path: dir, source }),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_err(&dir))?.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_record {
                continue;
            }
            if let Some(record) = Self::read_record(&path)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AcquisitionPair;
    use crate::checkpoint::PhaseCompletion;

    fn pair_job(id: &str) -> PairJob {
        PairJob::new(
            0,
            JobId::new(id),
            AcquisitionPair::new(format!("{id}_ref.SAFE"), format!("{id}_sec.SAFE")),
            PathBuf::from("/runs").join(id),
        )
    }

    fn phases() -> Vec<Phase> {
        ["preprocess", "topo", "unwrap"]
            .iter()
            .enumerate()
            .map(|(i, n)| Phase::named(i, n))
            .collect()
    }

    #[test]
    fn test_resume_phase_progression() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::open(dir.path()).unwrap();
        let job = pair_job("run_20230203_20230215");
        let phases = phases();

        assert_eq!(store.resume_phase(&job, &phases).unwrap(), 0);

        store
            .record_complete(&CheckpointRecord::new(&job, &phases[0], PhaseCompletion::Executed, 1))
            .unwrap();
        assert_eq!(store.resume_phase(&job, &phases).unwrap(), 1);

        for phase in &phases[1..] {
            store
                .record_complete(&CheckpointRecord::new(&job, phase, PhaseCompletion::Executed, 1))
                .unwrap();
        }
        assert_eq!(store.resume_phase(&job, &phases).unwrap(), 3);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let job = pair_job("run_a_b");
        let phases = phases();

        {
            let store = FsCheckpointStore::open(dir.path()).unwrap();
            store
                .record_complete(&CheckpointRecord::new(&job, &phases[0], PhaseCompletion::Executed, 2))
                .unwrap();
        }

        let reopened = FsCheckpointStore::open(dir.path()).unwrap();
        assert_eq!(reopened.resume_phase(&job, &phases).unwrap(), 1);
        let records = reopened.records(&job.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 2);
    }

    #[test]
    fn test_record_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::open(dir.path()).unwrap();
        let job = pair_job("run_a_b");
        let phase = Phase::named(0, "preprocess");

        let first = CheckpointRecord::new(&job, &phase, PhaseCompletion::Executed, 1);
        store.record_complete(&first).unwrap();
        let second = CheckpointRecord::new(&job, &phase, PhaseCompletion::Executed, 3);
        store.record_complete(&second).unwrap();

        let records = store.records(&job.id).unwrap();
        assert_eq!(records, vec![first]);
    }

    #[test]
    fn test_jobs_are_partitioned() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::open(dir.path()).unwrap();
        let phases = phases();
        let a = pair_job("run_a");
        let b = pair_job("run_b");

        store
            .record_complete(&CheckpointRecord::new(&a, &phases[0], PhaseCompletion::Executed, 1))
            .unwrap();

        assert_eq!(store.resume_phase(&a, &phases).unwrap(), 1);
        assert_eq!(store.resume_phase(&b, &phases).unwrap(), 0);
        assert!(store.records(&b.id).unwrap().is_empty());
    }

    #[test]
    fn test_gap_resumes_at_first_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::open(dir.path()).unwrap();
        let job = pair_job("run_a_b");
        let phases = phases();

        store
            .record_complete(&CheckpointRecord::new(&job, &phases[2], PhaseCompletion::Executed, 1))
            .unwrap();
        assert_eq!(store.resume_phase(&job, &phases).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::open(dir.path()).unwrap();
        let job = pair_job("run_a_b");
        std::fs::create_dir_all(dir.path().join("run_a_b")).unwrap();
        std::fs::write(dir.path().join("run_a_b/preprocess.json"), b"{not json").unwrap();

        let result = store.resume_phase(&job, &phases());
        assert!(matches!(result, Err(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_record_for_other_pair_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::open(dir.path()).unwrap();
        let phases = phases();
        let owner = pair_job("run_20230101_20230201");
        let mut intruder = owner.clone();
        intruder.pair = AcquisitionPair::new("other_ref.SAFE", "other_sec.SAFE");

        store
            .record_complete(&CheckpointRecord::new(&owner, &phases[0], PhaseCompletion::Executed, 1))
            .unwrap();

        assert!(matches!(
            store.resume_phase(&intruder, &phases),
            Err(CheckpointError::PairMismatch { .. })
        ));
        let err = store
            .record_complete(&CheckpointRecord::new(&intruder, &phases[0], PhaseCompletion::Executed, 1))
            .unwrap_err();
        assert!(err.to_string().contains("other_ref.SAFE"));
        assert_eq!(store.resume_phase(&owner, &phases).unwrap(), 1);
    }
}
