//! Phase execution as an external process.
//!
//! The executor knows nothing about radar processing. It renders an argument list,
//! runs the tool in the job's run directory, and reports the exit status, an output
//! tail, and whether the optional success marker appeared.
//!
//! On unix the tool runs as the leader of its own process group. A timeout, or
//! dropping the execution (Ctrl-C, batch abort), kills the whole group so helper
//! processes the tool started do not outlive the phase.

use crate::catalog::PairJob;
use crate::config::ToolConfig;
use crate::pipeline::Phase;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

/// Bytes of output kept from the end of each attempt's log for classification.
const OUTPUT_TAIL_BYTES: u64 = 64 * 1024;

/// How a single execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    /// Exit code 0 (and the success marker, if configured, exists).
    Success,

    /// Nonzero exit, or killed by a signal (`code: None`).
    Exited { code: Option<i32> },

    /// The phase timeout elapsed and the process was killed.
    TimedOut { after: Duration },

    /// The process could not be started or waited on.
    LaunchFailed(String),

    /// Exit code 0 but the expected success marker is missing.
    MarkerMissing(PathBuf),
}

/// Result of running one attempt of one phase.
#[derive(Debug, Clone)]
pub struct PhaseExecution {
    pub status: ExecutionStatus,
    pub duration: Duration,
    /// Tail of the combined stdout/stderr
    pub output_tail: String,
    /// Full log of this attempt, if one was written
    pub log_path: Option<PathBuf>,
}

impl PhaseExecution {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            duration: Duration::ZERO,
            output_tail: String::new(),
            log_path: None,
        }
    }

    /// Last `max_bytes` of output, trimmed to a character boundary.
    pub fn excerpt(&self, max_bytes: usize) -> String {
        tail_str(&self.output_tail, max_bytes).trim().to_string()
    }
}

/// Runs a phase of a job to completion or failure.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, job: &PairJob, phase: &Phase, attempt: usize) -> PhaseExecution;
}

/// Executor that spawns the configured external tool.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    success_marker: Option<String>,
}

impl ProcessExecutor {
    pub fn from_config(tool: &ToolConfig) -> Self {
        Self {
            program: tool.program.clone(),
            args: tool.args.clone(),
            env: tool.env.clone(),
            timeout: (tool.timeout_secs > 0).then(|| Duration::from_secs(tool.timeout_secs)),
            success_marker: tool.success_marker.clone(),
        }
    }

    /// Rendered argument list for a phase of a job.
    pub fn command_args(&self, job: &PairJob, phase: &Phase) -> Vec<String> {
        let vars = phase_vars(job, phase);
        phase
            .args
            .as_ref()
            .unwrap_or(&self.args)
            .iter()
            .map(|arg| render_template(arg, &vars))
            .collect()
    }

    fn marker_path(&self, job: &PairJob, phase: &Phase) -> Option<PathBuf> {
        let template = phase.success_marker.as_ref().or(self.success_marker.as_ref())?;
        Some(job.output_dir.join(render_template(template, &phase_vars(job, phase))))
    }
}

#[async_trait]
impl PhaseExecutor for ProcessExecutor {
    async fn execute(&self, job: &PairJob, phase: &Phase, attempt: usize) -> PhaseExecution {
        let started = Instant::now();
        let args = self.command_args(job, phase);

        let log_dir = job.output_dir.join("logs");
        let log_path = log_dir.join(format!("{}.attempt{}.log", phase.name, attempt));
        let (stdout, stderr) = match open_log(&log_dir, &log_path) {
            Ok(pair) => pair,
            Err(e) => {
                return PhaseExecution::new(ExecutionStatus::LaunchFailed(format!(
                    "cannot create log {}: {}",
                    log_path.display(),
                    e
                )))
            }
        };

        tracing::debug!("[{}] {} {} {}", job.id, phase.name, self.program, args.join(" "));

        let mut command = tokio::process::Command::new(&self.program);
        #[cfg(unix)]
        command.process_group(0);
        command
            .kill_on_drop(true)
            .args(&args)
            .envs(&self.env)
            .current_dir(&job.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut execution = PhaseExecution::new(ExecutionStatus::LaunchFailed(format!(
                    "failed to start '{}': {}",
                    self.program, e
                )));
                execution.log_path = Some(log_path);
                return execution;
            }
        };

        let mut group = ProcessGroup::of(&child);

        let timeout = phase.timeout.or(self.timeout);
        let wait_result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => Some(result),
                Err(_) => {
                    group.kill();
                    if let Err(e) = child.kill().await {
                        tracing::warn!("[{}] Failed to kill timed-out {}: {}", job.id, phase.name, e);
                    }
                    None
                }
            },
            None => Some(child.wait().await),
        };
        // Stragglers left behind by a tool that already exited.
        group.kill();

        let status = match wait_result {
            None => ExecutionStatus::TimedOut {
                after: timeout.unwrap_or_default(),
            },
            Some(Err(e)) => ExecutionStatus::LaunchFailed(format!("failed to wait on '{}': {}", self.program, e)),
            Some(Ok(exit)) if exit.success() => match self.marker_path(job, phase) {
                Some(marker) if !marker.exists() => ExecutionStatus::MarkerMissing(marker),
                _ => ExecutionStatus::Success,
            },
            Some(Ok(exit)) => ExecutionStatus::Exited { code: exit.code() },
        };

        PhaseExecution {
            status,
            duration: started.elapsed(),
            output_tail: read_tail(&log_path, OUTPUT_TAIL_BYTES),
            log_path: Some(log_path),
        }
    }
}

/// Process group led by a spawned tool. Killed on drop unless already killed.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        // SAFETY: killpg takes plain integers and touches no memory.
        let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!("Failed to kill process group {}: {}", pgid, err);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn open_log(dir: &Path, path: &Path) -> std::io::Result<(File, File)> {
    std::fs::create_dir_all(dir)?;
    let file = File::create(path)?;
    let clone = file.try_clone()?;
    Ok((file, clone))
}

/// Read up to `max_bytes` from the end of a file. Unreadable files yield "".
fn read_tail(path: &Path, max_bytes: u64) -> String {
    let read = || -> std::io::Result<String> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;
        let mut buf = Vec::with_capacity(max_bytes.min(len) as usize);
        file.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    };
    read().unwrap_or_else(|e| {
        tracing::debug!("Could not read log tail {}: {}", path.display(), e);
        String::new()
    })
}

fn tail_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn phase_vars(job: &PairJob, phase: &Phase) -> Vec<(&'static str, String)> {
    vec![
        ("start", phase.start_step.clone()),
        ("end", phase.end_step.clone()),
        ("phase", phase.name.clone()),
        ("job_id", job.id.to_string()),
        ("reference", job.pair.reference.clone()),
        ("secondary", job.pair.secondary.clone()),
        ("output_dir", job.output_dir.display().to_string()),
    ]
}

/// Replace `{key}` placeholders in `template`.
pub fn render_template<V: AsRef<str>>(template: &str, vars: &[(&str, V)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value.as_ref())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AcquisitionPair, JobId};

    fn job_in(dir: &Path) -> PairJob {
        PairJob::new(
            0,
            JobId::new("run_20230203_20230215"),
            AcquisitionPair::new("ref.SAFE", "sec.SAFE"),
            dir.to_path_buf(),
        )
    }

    fn tool(program: &str, args: &[&str]) -> ToolConfig {
        ToolConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            timeout_secs: 0,
            success_marker: None,
            job_file: None,
            excerpt_bytes: 2048,
        }
    }

    #[test]
    fn test_render_template() {
        let rendered = render_template("--start={start} --end={end} {unknown}", &[("start", "topo"), ("end", "geocode")]);
        assert_eq!(rendered, "--start=topo --end=geocode {unknown}");
    }

    #[test]
    fn test_command_args() {
        let executor = ProcessExecutor::from_config(&tool(
            "topsApp.py",
            &["topsApp.xml", "--steps", "--start={start}", "--end={end}"],
        ));
        let job = job_in(Path::new("/runs/x"));
        let mut pc = crate::config::PhaseConfig::step("interferogram");
        pc.start = Some("fineresamp".into());
        pc.end = Some("geocode".into());
        let phase = Phase::from_config(13, &pc);

        assert_eq!(
            executor.command_args(&job, &phase),
            vec!["topsApp.xml", "--steps", "--start=fineresamp", "--end=geocode"]
        );
    }

    #[test]
    fn test_phase_args_override() {
        let executor = ProcessExecutor::from_config(&tool("tool", &["default"]));
        let job = job_in(Path::new("/runs/x"));
        let mut phase = Phase::named(0, "unwrap");
        phase.args = Some(vec!["--job={job_id}".into(), "{reference}".into()]);

        assert_eq!(
            executor.command_args(&job, &phase),
            vec!["--job=run_20230203_20230215", "ref.SAFE"]
        );
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let mut execution = PhaseExecution::new(ExecutionStatus::Success);
        execution.output_tail = "ééé error\n".to_string();
        assert_eq!(execution.excerpt(7), "error");
        assert_eq!(execution.excerpt(1000), "ééé error");
        let excerpt = execution.excerpt(10);
        assert!(excerpt.ends_with("error"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_success_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let executor = ProcessExecutor::from_config(&tool("sh", &["-c", "echo running {phase}"]));

        let execution = executor.execute(&job, &Phase::named(0, "topo"), 1).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution.output_tail.contains("running topo"));
        assert_eq!(execution.log_path, Some(dir.path().join("logs/topo.attempt1.log")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let executor = ProcessExecutor::from_config(&tool("sh", &["-c", "echo boom >&2; exit 3"]));

        let execution = executor.execute(&job, &Phase::named(0, "topo"), 2).await;
        assert_eq!(execution.status, ExecutionStatus::Exited { code: Some(3) });
        assert!(execution.excerpt(100).contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_timeout_kills() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let mut config = tool("sh", &["-c", "sleep 30"]);
        config.timeout_secs = 30;
        let executor = ProcessExecutor::from_config(&config);
        let mut phase = Phase::named(0, "unwrap");
        phase.timeout = Some(Duration::from_millis(200));

        let started = Instant::now();
        let execution = executor.execute(&job, &phase, 1).await;
        assert!(matches!(execution.status, ExecutionStatus::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_background_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let executor = ProcessExecutor::from_config(&tool(
            "sh",
            &["-c", "sh -c 'sleep 2; touch late_marker' & wait"],
        ));
        let mut phase = Phase::named(0, "unwrap");
        phase.timeout = Some(Duration::from_millis(300));

        let execution = executor.execute(&job, &phase, 1).await;
        assert!(matches!(execution.status, ExecutionStatus::TimedOut { .. }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("late_marker").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_execution_kills_background_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let executor = ProcessExecutor::from_config(&tool(
            "sh",
            &["-c", "sh -c 'sleep 2; touch late_marker' & wait"],
        ));
        let phase = Phase::named(0, "unwrap");

        let cancelled = tokio::time::timeout(Duration::from_millis(300), executor.execute(&job, &phase, 1)).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("late_marker").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_marker() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let mut config = tool("sh", &["-c", "true"]);
        config.success_marker = Some("{phase}.done".to_string());
        let executor = ProcessExecutor::from_config(&config);

        let execution = executor.execute(&job, &Phase::named(0, "topo"), 1).await;
        assert_eq!(execution.status, ExecutionStatus::MarkerMissing(dir.path().join("topo.done")));

        let mut config = tool("sh", &["-c", "touch {phase}.done"]);
        config.success_marker = Some("{phase}.done".to_string());
        let executor = ProcessExecutor::from_config(&config);
        let execution = executor.execute(&job, &Phase::named(0, "topo"), 2).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let executor = ProcessExecutor::from_config(&tool("definitely-not-a-real-tool-xyz", &[]));

        let execution = executor.execute(&job, &Phase::named(0, "topo"), 1).await;
        assert!(matches!(execution.status, ExecutionStatus::LaunchFailed(_)));
    }
}
