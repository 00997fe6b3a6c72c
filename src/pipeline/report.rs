//! Batch summary.

use crate::catalog::{AcquisitionPair, CatalogError, JobId, JobStatus, PairJob};
use crate::pipeline::Attempt;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Catalog position
    pub index: usize,
    pub job_id: JobId,
    pub pair: AcquisitionPair,
    pub status: JobStatus,

    /// First phase that was pending at dispatch
    pub resume_phase: usize,

    pub phases_executed: usize,
    pub phases_skipped: usize,

    /// Attempts across all phases run in this invocation
    pub attempts: usize,

    /// Phase (or "staging") the job failed at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Diagnostics of the attempt that ended the job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<Attempt>,

    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl JobReport {
    pub fn new(job: &PairJob, resume_phase: usize) -> Self {
        Self {
            index: job.index,
            job_id: job.id.clone(),
            pair: job.pair.clone(),
            status: job.status,
            resume_phase,
            phases_executed: 0,
            phases_skipped: 0,
            attempts: 0,
            failed_phase: None,
            reason: None,
            last_attempt: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Diagnostic excerpt of the failing attempt, if any.
    pub fn excerpt(&self) -> Option<&str> {
        self.last_attempt
            .as_ref()
            .map(|a| a.excerpt.as_str())
            .filter(|e| !e.is_empty())
    }
}

/// Aggregated result of a batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub catalog_errors: Vec<CatalogError>,
    /// Per-job reports in catalog order
    pub jobs: Vec<JobReport>,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl BatchSummary {
    /// Build the summary. Reports are put back into catalog order.
    pub fn new(mut jobs: Vec<JobReport>, catalog_errors: Vec<CatalogError>, elapsed: Duration) -> Self {
        jobs.sort_by_key(|r| r.index);
        let count = |status: JobStatus| jobs.iter().filter(|r| r.status == status).count();

        Self {
            total: jobs.len(),
            succeeded: count(JobStatus::Succeeded),
            failed: count(JobStatus::Failed),
            skipped: count(JobStatus::Skipped),
            catalog_errors,
            jobs,
            elapsed,
        }
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|r| r.status == JobStatus::Failed)
    }

    /// Process exit status: nonzero iff any job failed.
    pub fn exit_code(&self) -> u8 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }

    /// Write the summary as JSON. Failures are logged, never returned.
    pub fn write_json(&self, path: &Path) {
        let result = serde_json::to_string_pretty(self)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from));

        match result {
            Ok(()) => tracing::info!("Summary saved to {}", path.display()),
            Err(e) => tracing::error!("Failed to write summary to {}: {}", path.display(), e),
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Batch Summary ===")?;
        writeln!(f, "Total time: {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "Jobs: {} | Succeeded: {} | Failed: {} | Skipped: {}",
            self.total, self.succeeded, self.failed, self.skipped
        )?;

        if !self.catalog_errors.is_empty() {
            writeln!(f, "\n--- Catalog errors ({}) ---", self.catalog_errors.len())?;
            for error in &self.catalog_errors {
                writeln!(f, "{}", error)?;
            }
        }

        if self.failed > 0 {
            writeln!(f, "\n--- Failed jobs ---")?;
            for report in self.failed_jobs() {
                writeln!(
                    f,
                    "{} ({}) at {}: {}",
                    report.job_id,
                    report.pair,
                    report.failed_phase.as_deref().unwrap_or("?"),
                    report.reason.as_deref().unwrap_or("unknown")
                )?;
                if let Some(excerpt) = report.excerpt() {
                    for line in excerpt.lines() {
                        writeln!(f, "    | {}", line)?;
                    }
                }
                if let Some(log) = report.last_attempt.as_ref().and_then(|a| a.log_path.as_ref()) {
                    writeln!(f, "    log: {}", log.display())?;
                }
            }
        }
        write!(f, "=====================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AttemptOutcome;
    use chrono::Utc;
    use std::path::PathBuf;

    fn report(index: usize, status: JobStatus) -> JobReport {
        let mut job = PairJob::new(
            index,
            JobId::new(format!("run_{}", index)),
            AcquisitionPair::new(format!("ref{}", index), format!("sec{}", index)),
            PathBuf::from(format!("/runs/run_{}", index)),
        );
        job.status = status;
        JobReport::new(&job, 0)
    }

    fn failed(index: usize) -> JobReport {
        let mut r = report(index, JobStatus::Failed);
        r.failed_phase = Some("unwrap".to_string());
        r.reason = Some("exit code 1".to_string());
        r.last_attempt = Some(Attempt {
            number: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            exit_code: Some(1),
            outcome: AttemptOutcome::FatalFailure {
                reason: "exit code 1".to_string(),
            },
            excerpt: "snaphu: out of memory".to_string(),
            log_path: Some(PathBuf::from("/runs/run_1/logs/unwrap.attempt1.log")),
        });
        r
    }

    #[test]
    fn test_counts_and_catalog_order() {
        let summary = BatchSummary::new(
            vec![
                report(2, JobStatus::Skipped),
                failed(1),
                report(0, JobStatus::Succeeded),
            ],
            vec![],
            Duration::from_secs(3),
        );

        assert_eq!(summary.total, 3);
        assert_eq!((summary.succeeded, summary.failed, summary.skipped), (1, 1, 1));
        let order: Vec<_> = summary.jobs.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_zero_without_failures() {
        let summary = BatchSummary::new(
            vec![report(0, JobStatus::Succeeded), report(1, JobStatus::Skipped)],
            vec![],
            Duration::ZERO,
        );
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_display_lists_failures() {
        let summary = BatchSummary::new(
            vec![failed(1)],
            vec![CatalogError::Malformed {
                line: 4,
                content: "garbage".to_string(),
                reason: "expected two scene names".to_string(),
            }],
            Duration::ZERO,
        );

        let text = summary.to_string();
        assert!(text.contains("Failed: 1"));
        assert!(text.contains("run_1"));
        assert!(text.contains("at unwrap: exit code 1"));
        assert!(text.contains("| snaphu: out of memory"));
        assert!(text.contains("line 4"));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = BatchSummary::new(vec![failed(0)], vec![], Duration::ZERO);
        summary.write_json(&path);

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["failed"], 1);
        assert_eq!(json["jobs"][0]["failed_phase"], "unwrap");
        assert_eq!(json["jobs"][0]["last_attempt"]["excerpt"], "snaphu: out of memory");
    }

    #[test]
    fn test_write_json_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing/dir/summary.json");
        let summary = BatchSummary::new(vec![], vec![], Duration::ZERO);
        summary.write_json(&path);
        assert!(!path.exists());
    }
}
