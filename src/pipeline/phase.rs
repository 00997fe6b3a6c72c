//! Phase definitions and skip preconditions.

use crate::catalog::PairJob;
use crate::config::PhaseConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Precondition under which a skippable phase is not executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipWhen {
    /// Skip when every listed path (relative to the run dir) already exists,
    /// e.g. because an earlier phase materialized the result in-process.
    OutputExists(Vec<String>),

    /// The phase is configured but not requested for this batch.
    NotRequested,
}

impl SkipWhen {
    /// Evaluate the precondition for a job.
    pub fn holds(&self, job: &PairJob) -> bool {
        match self {
            SkipWhen::OutputExists(paths) => {
                !paths.is_empty() && paths.iter().all(|p| job.output_dir.join(p).exists())
            }
            SkipWhen::NotRequested => true,
        }
    }
}

/// A named, ordered step in processing a job.
#[derive(Debug, Clone)]
pub struct Phase {
    /// Phase name, also the checkpoint key
    pub name: String,

    /// Position in the pipeline (0-based)
    pub ordinal: usize,

    /// First tool step this phase covers
    pub start_step: String,

    /// Last tool step this phase covers
    pub end_step: String,

    /// Argument template override
    pub args: Option<Vec<String>>,

    /// Whether the phase may be skipped
    pub skippable: bool,

    /// When to skip a skippable phase
    pub precondition: Option<SkipWhen>,

    /// Whether transient failures are retried
    pub retryable: bool,

    /// Attempt limit override
    pub max_attempts: Option<usize>,

    /// Timeout override; a zero in configuration falls back to the tool timeout
    pub timeout: Option<Duration>,

    /// Success-marker override
    pub success_marker: Option<String>,
}

impl Phase {
    /// Build a phase from its configuration and position.
    pub fn from_config(ordinal: usize, config: &PhaseConfig) -> Self {
        let start_step = config.start.clone().unwrap_or_else(|| config.name.clone());
        let end_step = config.end.clone().unwrap_or_else(|| start_step.clone());
        Self {
            name: config.name.clone(),
            ordinal,
            start_step,
            end_step,
            args: config.args.clone(),
            skippable: config.skippable,
            precondition: config.skip_when.clone(),
            retryable: config.retryable,
            max_attempts: config.max_attempts,
            timeout: config.timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs),
            success_marker: config.success_marker.clone(),
        }
    }

    /// Simple single-step phase, mostly useful in tests.
    pub fn named(ordinal: usize, name: &str) -> Self {
        Self::from_config(ordinal, &PhaseConfig::step(name))
    }

    /// Whether this phase should be skipped for the given job.
    ///
    /// Only skippable phases with a precondition that currently holds are skipped.
    pub fn should_skip(&self, job: &PairJob) -> bool {
        self.skippable
            && self
                .precondition
                .as_ref()
                .is_some_and(|precondition| precondition.holds(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AcquisitionPair, JobId};

    fn job_in(dir: &std::path::Path) -> PairJob {
        PairJob::new(0, JobId::new("run_a_b"), AcquisitionPair::new("a", "b"), dir.to_path_buf())
    }

    #[test]
    fn test_from_config_step_range() {
        let mut pc = PhaseConfig::step("interferogram");
        pc.start = Some("fineresamp".to_string());
        pc.end = Some("geocode".to_string());
        pc.timeout_secs = Some(30);

        let phase = Phase::from_config(13, &pc);
        assert_eq!(phase.ordinal, 13);
        assert_eq!(phase.start_step, "fineresamp");
        assert_eq!(phase.end_step, "geocode");
        assert_eq!(phase.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_timeout_is_no_override() {
        let mut pc = PhaseConfig::step("unwrap");
        pc.timeout_secs = Some(0);
        assert_eq!(Phase::from_config(0, &pc).timeout, None);
    }

    #[test]
    fn test_single_step_defaults() {
        let phase = Phase::named(2, "topo");
        assert_eq!(phase.start_step, "topo");
        assert_eq!(phase.end_step, "topo");
        assert!(phase.retryable);
        assert!(!phase.skippable);
    }

    #[test]
    fn test_skip_when_output_exists() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());

        let mut pc = PhaseConfig::step("ionosphere");
        pc.skippable = true;
        pc.skip_when = Some(SkipWhen::OutputExists(vec!["ion/done".to_string()]));
        let phase = Phase::from_config(0, &pc);

        assert!(!phase.should_skip(&job));
        std::fs::create_dir_all(dir.path().join("ion")).unwrap();
        std::fs::write(dir.path().join("ion/done"), b"").unwrap();
        assert!(phase.should_skip(&job));
    }

    #[test]
    fn test_non_skippable_never_skips() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());

        let mut phase = Phase::named(0, "unwrap");
        phase.precondition = Some(SkipWhen::NotRequested);
        assert!(!phase.should_skip(&job));

        phase.skippable = true;
        assert!(phase.should_skip(&job));
    }

    #[test]
    fn test_skip_when_yaml() {
        let parsed: SkipWhen = serde_yaml::from_str("output_exists: [a, b]").unwrap();
        assert_eq!(parsed, SkipWhen::OutputExists(vec!["a".into(), "b".into()]));
        let parsed: SkipWhen = serde_yaml::from_str("not_requested").unwrap();
        assert_eq!(parsed, SkipWhen::NotRequested);
    }
}
