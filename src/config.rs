//! Configuration for the pair-batch scheduler.

use crate::catalog::Roi;
use crate::pipeline::{Phase, SkipWhen};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration for a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input configuration
    pub input: InputConfig,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// Worker pool sizing
    #[serde(default)]
    pub workers: WorkerConfig,

    /// External tool invocation
    pub tool: ToolConfig,

    /// Ordered processing phases
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseConfig>,

    /// Retry policy for transient phase failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Transient/fatal failure classification
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Optional workspace staging of shared inputs
    #[serde(default)]
    pub staging: StagingConfig,

    /// Progress metrics
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Path to the pair list
    #[serde(default = "default_pairs_file")]
    pub pairs_file: PathBuf,

    /// Region of interest: "south,north,west,east" or "[s,n,w,e]"
    #[serde(default)]
    pub roi: Option<String>,
}

impl InputConfig {
    /// Parse the configured ROI, if any.
    pub fn roi(&self) -> anyhow::Result<Option<Roi>> {
        self.roi
            .as_deref()
            .map(|s| s.parse::<Roi>().with_context(|| format!("Invalid ROI '{}'", s)))
            .transpose()
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory holding one run directory per pair
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,

    /// Checkpoint directory (default: `<runs_dir>/.checkpoints`)
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Optional path for the JSON batch summary
    #[serde(default)]
    pub summary_path: Option<PathBuf>,
}

impl OutputConfig {
    /// Resolved checkpoint directory.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.runs_dir.join(".checkpoints"))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            checkpoint_dir: None,
            summary_path: None,
        }
    }
}

/// Worker pool sizing.
///
/// If `count` is unset the pool size is derived from available memory divided by
/// `memory_per_worker_gb`, clamped to `[1, max_workers]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Explicit number of concurrent jobs
    #[serde(default)]
    pub count: Option<usize>,

    /// Memory budget per worker in GB
    #[serde(default = "default_memory_per_worker_gb")]
    pub memory_per_worker_gb: f64,

    /// Upper bound for the derived worker count
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: None,
            memory_per_worker_gb: default_memory_per_worker_gb(),
            max_workers: default_max_workers(),
        }
    }
}

/// External tool invocation.
///
/// `args` may contain placeholders: `{start}`, `{end}`, `{phase}`, `{job_id}`,
/// `{reference}`, `{secondary}`, `{output_dir}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Executable to run for every phase
    pub program: String,

    /// Argument template
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the tool (e.g. thread caps)
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Per-phase timeout in seconds (0 = none)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Marker file (relative to the run dir) the tool writes on success
    #[serde(default)]
    pub success_marker: Option<String>,

    /// Job-input file rendered into each run directory before processing
    #[serde(default)]
    pub job_file: Option<JobFileConfig>,

    /// Bytes of output tail kept as diagnostic excerpt
    #[serde(default = "default_excerpt_bytes")]
    pub excerpt_bytes: usize,
}

/// Templated job-input file.
///
/// Placeholders: `{reference}`, `{secondary}`, `{dem}`, `{job_id}`, `{south}`,
/// `{north}`, `{west}`, `{east}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFileConfig {
    /// File name inside the run directory
    pub name: String,

    /// File template
    pub template: String,
}

/// One processing phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Phase name (unique)
    pub name: String,

    /// First tool step covered by this phase (default: name)
    #[serde(default)]
    pub start: Option<String>,

    /// Last tool step covered by this phase (default: start)
    #[serde(default)]
    pub end: Option<String>,

    /// Per-phase argument template, replacing `tool.args`
    #[serde(default)]
    pub args: Option<Vec<String>>,

    /// Whether the phase may be skipped when its precondition says so
    #[serde(default)]
    pub skippable: bool,

    /// Precondition deciding when a skippable phase is skipped
    #[serde(default)]
    pub skip_when: Option<SkipWhen>,

    /// Whether transient failures of this phase are retried
    #[serde(default = "default_true")]
    pub retryable: bool,

    /// Attempt limit override
    #[serde(default)]
    pub max_attempts: Option<usize>,

    /// Timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Success-marker override
    #[serde(default)]
    pub success_marker: Option<String>,
}

impl PhaseConfig {
    /// Phase covering a single tool step of the same name.
    pub fn step(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start: None,
            end: None,
            args: None,
            skippable: false,
            skip_when: None,
            retryable: true,
            max_attempts: None,
            timeout_secs: None,
            success_marker: None,
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per phase (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff growth factor between attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 3_000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// Failure classification data. Exit codes listed nowhere are fatal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Exit codes that indicate a transient failure
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,

    /// Exit codes that are always fatal
    #[serde(default)]
    pub fatal_exit_codes: Vec<i32>,

    /// Output patterns (regex) marking a failure as transient
    #[serde(default)]
    pub transient_patterns: Vec<String>,

    /// Output patterns (regex) marking a failure as fatal; checked first
    #[serde(default)]
    pub fatal_patterns: Vec<String>,
}

/// Shared inputs linked into each run directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory containing the raw scenes
    #[serde(default)]
    pub raw_dir: Option<PathBuf>,

    /// DEM file; `.xml` and `.vrt` sidecars are linked too
    #[serde(default)]
    pub dem_path: Option<PathBuf>,

    /// Directory containing orbit files (`*.EOF`)
    #[serde(default)]
    pub orbit_dir: Option<PathBuf>,

    /// Directories (relative to the run dir) removed when a job starts from scratch
    #[serde(default)]
    pub clean_on_fresh_start: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Log periodic progress
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Progress interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,

    /// Optional path to save metrics JSON after the run
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_metrics_interval(),
            output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Build the ordered phase list.
    pub fn build_phases(&self) -> Vec<Phase> {
        self.phases
            .iter()
            .enumerate()
            .map(|(ordinal, pc)| Phase::from_config(ordinal, pc))
            .collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tool.program.trim().is_empty() {
            bail!("tool.program must not be empty");
        }
        if self.phases.is_empty() {
            bail!("At least one phase must be configured");
        }

        let mut names = std::collections::HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                bail!("Phase names must not be empty");
            }
            if !names.insert(phase.name.as_str()) {
                bail!("Duplicate phase name '{}'", phase.name);
            }
            if phase.name.contains(['/', '\\']) {
                bail!("Phase name '{}' must not contain path separators", phase.name);
            }
            if phase.max_attempts == Some(0) {
                bail!("Phase '{}': max_attempts must be > 0", phase.name);
            }
            if phase.timeout_secs == Some(0) {
                bail!(
                    "Phase '{}': timeout_secs must be > 0 (omit it to use tool.timeout_secs)",
                    phase.name
                );
            }
            if phase.skip_when.is_some() && !phase.skippable {
                bail!("Phase '{}': skip_when requires skippable: true", phase.name);
            }
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be > 0");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1.0 (backoff may not shrink)");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            bail!("retry.initial_backoff_ms must be <= retry.max_backoff_ms");
        }

        if self.workers.count == Some(0) {
            bail!("workers.count must be > 0");
        }
        if self.workers.max_workers == 0 {
            bail!("workers.max_workers must be > 0");
        }
        if self.workers.memory_per_worker_gb <= 0.0 {
            bail!("workers.memory_per_worker_gb must be > 0");
        }

        for pattern in self
            .classification
            .transient_patterns
            .iter()
            .chain(&self.classification.fatal_patterns)
        {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid classification pattern '{}'", pattern))?;
        }

        self.input.roi()?;
        Ok(())
    }
}

/// Default phase layout for topsApp-style processing.
///
/// Co-registration steps run one per phase. Everything from fine resampling to
/// geocoding runs as a single phase so that the ionospheric correction computed in
/// memory is not lost between processes.
pub fn default_phases() -> Vec<PhaseConfig> {
    let mut phases: Vec<PhaseConfig> = [
        "startup",
        "preprocess",
        "computeBaselines",
        "verifyDEM",
        "topo",
        "subsetoverlaps",
        "coarseoffsets",
        "coarseresamp",
        "overlapifg",
        "prepesd",
        "esd",
        "rangecoreg",
        "fineoffsets",
    ]
    .iter()
    .map(|name| PhaseConfig::step(name))
    .collect();

    phases.push(PhaseConfig {
        start: Some("fineresamp".to_string()),
        end: Some("geocode".to_string()),
        max_attempts: Some(1),
        ..PhaseConfig::step("interferogram")
    });

    phases
}

// Default value functions for serde
fn default_pairs_file() -> PathBuf { PathBuf::from("data/pairs.txt") }
fn default_runs_dir() -> PathBuf { PathBuf::from("data/runs") }
fn default_memory_per_worker_gb() -> f64 { 16.0 }
fn default_max_workers() -> usize { 8 }
fn default_timeout_secs() -> u64 { 0 }
fn default_excerpt_bytes() -> usize { 2048 }
fn default_true() -> bool { true }
fn default_max_attempts() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 3_000 }
fn default_max_backoff_ms() -> u64 { 60_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_metrics_interval() -> u64 { 60 }

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
input:
  pairs_file: pairs.txt
tool:
  program: topsApp.py
  args: ["topsApp.xml", "--steps", "--start={start}", "--end={end}"]
"#;

    #[test]
    fn test_minimal_yaml_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.output.runs_dir, PathBuf::from("data/runs"));
        assert_eq!(config.output.checkpoint_dir(), PathBuf::from("data/runs/.checkpoints"));
        assert!(config.workers.count.is_none());
        assert_eq!(config.phases.len(), 14);
        assert_eq!(config.phases[0].name, "startup");
        assert_eq!(config.phases[13].start.as_deref(), Some("fineresamp"));
        assert_eq!(config.phases[13].end.as_deref(), Some("geocode"));
    }

    #[test]
    fn test_json_config() {
        let json = r#"{
            "input": {"pairs_file": "p.txt", "roi": "[34, 35, -118, -117]"},
            "tool": {"program": "tool"},
            "phases": [{"name": "a"}, {"name": "b", "max_attempts": 5}]
        }"#;
        let config = Config::from_json(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.phases.len(), 2);
        assert_eq!(config.input.roi().unwrap().unwrap().north, 35.0);
    }

    #[test]
    fn test_validation_rejects_duplicate_phases() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.phases = vec![PhaseConfig::step("a"), PhaseConfig::step("a")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_retry() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_pattern_and_roi() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.classification.transient_patterns = vec!["(unclosed".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.input.roi = Some("1,2,3".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_phase_timeout_rejected() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        let mut phase = PhaseConfig::step("unwrap");
        phase.timeout_secs = Some(0);
        config.phases = vec![phase];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));

        config.phases[0].timeout_secs = Some(600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_skip_when_requires_skippable() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        let mut phase = PhaseConfig::step("ionosphere");
        phase.skip_when = Some(SkipWhen::NotRequested);
        config.phases = vec![phase];
        assert!(config.validate().is_err());

        config.phases[0].skippable = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_phases() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let yaml = config.to_yaml().unwrap();
        let again = Config::from_yaml(&yaml).unwrap();
        assert_eq!(again.phases.len(), config.phases.len());
        assert_eq!(again.tool.program, "topsApp.py");
    }
}
