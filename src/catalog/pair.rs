//! Acquisition pairs and the per-pair job descriptor.

use crate::catalog::Roi;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Ordered (reference, secondary) pair of acquisition identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcquisitionPair {
    /// Reference scene (e.g. a Sentinel-1 `.SAFE` name)
    pub reference: String,

    /// Secondary scene
    pub secondary: String,
}

impl AcquisitionPair {
    pub fn new(reference: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            secondary: secondary.into(),
        }
    }

    /// Acquisition dates of both scenes, if they can be extracted.
    pub fn dates(&self) -> (Option<&str>, Option<&str>) {
        (acquisition_date(&self.reference), acquisition_date(&self.secondary))
    }

    /// Run-directory name for this pair, also its job id.
    ///
    /// `run_<refdate>_<secdate>_<hash>`, with the first ten characters of each scene
    /// name standing in when a date cannot be extracted. The suffix is derived from the
    /// pair alone, so pairs acquired on the same dates (adjacent frames, S1A and S1B)
    /// get distinct names whatever else the catalog lists.
    pub fn run_name(&self) -> String {
        let stem = match self.dates() {
            (Some(ref_date), Some(sec_date)) => format!("run_{}_{}", ref_date, sec_date),
            _ => format!(
                "run_{}_{}",
                sanitize(prefix_chars(&self.reference, 10)),
                sanitize(prefix_chars(&self.secondary, 10))
            ),
        };
        format!("{}_{:08x}", stem, self.stable_hash() as u32)
    }

    /// Stable 64-bit FNV-1a hash of the pair, used to disambiguate job ids.
    pub fn stable_hash(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        for byte in self
            .reference
            .bytes()
            .chain(std::iter::once(0u8))
            .chain(self.secondary.bytes())
        {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }
}

impl fmt::Display for AcquisitionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dates() {
            (Some(r), Some(s)) => write!(f, "{} vs {}", r, s),
            _ => write!(f, "{} vs {}", self.reference, self.secondary),
        }
    }
}

/// Extract the acquisition date (`YYYYMMDD`) from a scene name.
///
/// Sentinel-1 names carry the sensing start as `YYYYMMDDTHHMMSS`; the first such
/// timestamp is taken.
pub fn acquisition_date(scene: &str) -> Option<&str> {
    let bytes = scene.as_bytes();
    if bytes.len() < 15 {
        return None;
    }
    (0..=bytes.len() - 15).find_map(|start| {
        let window = &bytes[start..start + 15];
        let is_stamp = window[..8].iter().all(u8::is_ascii_digit)
            && window[8] == b'T'
            && window[9..].iter().all(u8::is_ascii_digit);
        is_stamp.then(|| &scene[start..start + 8])
    })
}

fn prefix_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Identifier of a job within a batch; also the name of its run directory and
/// checkpoint partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a job within one batch invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    PhaseComplete,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::PhaseComplete => "phase-complete",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One unit of work: a pair plus everything needed to process it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairJob {
    /// Position in the catalog (0-based), used for report ordering
    pub index: usize,

    /// Unique id within the batch
    pub id: JobId,

    /// The acquisition pair
    pub pair: AcquisitionPair,

    /// Run directory for this job's artifacts
    pub output_dir: PathBuf,

    /// Region of interest, if the batch has one
    pub roi: Option<Roi>,

    /// Index of the phase currently being worked on
    pub phase_index: usize,

    /// Current status
    pub status: JobStatus,
}

impl PairJob {
    pub fn new(index: usize, id: JobId, pair: AcquisitionPair, output_dir: PathBuf) -> Self {
        Self {
            index,
            id,
            pair,
            output_dir,
            roi: None,
            phase_index: 0,
            status: JobStatus::Pending,
        }
    }
}
