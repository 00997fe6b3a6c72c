//! Pair catalog: turns the operator's pair list into job descriptors.
//!
//! Each non-empty, non-comment line holds one pair. Two forms are accepted:
//!
//! - Any line containing exactly two Sentinel-1 SAFE names, wherever they sit in the line.
//! - Two names separated by a comma (or by whitespace when no comma is present), optionally
//!   wrapped in parentheses and quotes: `("a.SAFE", "b.SAFE")`, `a b`.
//!
//! Malformed lines are recorded as [`CatalogError`]s and never stop the rest of the file
//! from being parsed.

mod pair;
mod roi;

pub use pair::{acquisition_date, AcquisitionPair, JobId, JobStatus, PairJob};
pub use roi::Roi;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A line-level catalog problem. Recorded, never fatal to the batch.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
pub enum CatalogError {
    #[error("line {line}: malformed pair entry '{content}': {reason}")]
    Malformed {
        line: usize,
        content: String,
        reason: String,
    },

    #[error("line {line}: duplicate of pair first listed on line {first_line}, ignored")]
    Duplicate { line: usize, first_line: usize },

    #[error("line {line}: job id {id} collides with the pair on line {first_line}, ignored")]
    IdCollision { line: usize, first_line: usize, id: String },
}

impl CatalogError {
    /// 1-based line number the error refers to.
    pub fn line(&self) -> usize {
        match self {
            CatalogError::Malformed { line, .. }
            | CatalogError::Duplicate { line, .. }
            | CatalogError::IdCollision { line, .. } => *line,
        }
    }
}

/// Parser for a single catalog line.
pub struct LineParser {
    safe_re: Regex,
}

impl LineParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            safe_re: Regex::new(r"S1[AB]_IW_SLC__[0-9A-Za-zT_\-]+\.SAFE")?,
        })
    }

    /// Parse one line. `Ok(None)` for blank and comment lines.
    pub fn parse_line(&self, line_no: usize, raw: &str) -> Result<Option<AcquisitionPair>, CatalogError> {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let malformed = |reason: String| CatalogError::Malformed {
            line: line_no,
            content: line.to_string(),
            reason,
        };

        let safes: Vec<&str> = self.safe_re.find_iter(line).map(|m| m.as_str()).collect();
        let (reference, secondary) = if safes.len() == 2 {
            (safes[0].to_string(), safes[1].to_string())
        } else {
            let cleaned = line
                .trim_start_matches('(')
                .trim_end_matches(')')
                .trim();
            let strip = |p: &str| p.trim().trim_matches('"').trim_matches('\'').to_string();

            let parts: Vec<String> = if cleaned.contains(',') {
                cleaned.split(',').map(strip).filter(|p| !p.is_empty()).collect()
            } else {
                cleaned.split_whitespace().map(strip).filter(|p| !p.is_empty()).collect()
            };

            if parts.len() != 2 {
                return Err(malformed(format!("expected 2 scene names, found {}", parts.len())));
            }
            let mut parts = parts.into_iter();
            match (parts.next(), parts.next()) {
                (Some(r), Some(s)) => (r, s),
                _ => return Err(malformed("expected 2 scene names".to_string())),
            }
        };

        if reference == secondary {
            return Err(malformed("reference and secondary are the same scene".to_string()));
        }

        Ok(Some(AcquisitionPair::new(reference, secondary)))
    }
}

/// Parsed catalog: jobs in catalog order plus line-level errors.
#[derive(Debug, Default)]
pub struct Catalog {
    pub jobs: Vec<PairJob>,
    pub errors: Vec<CatalogError>,
}

impl Catalog {
    /// Load and parse a pair list from disk.
    pub fn from_file(path: &Path, runs_dir: &Path, roi: Option<Roi>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pair list {}", path.display()))?;
        Self::parse(&contents, runs_dir, roi)
    }

    /// Parse a pair list.
    ///
    /// Duplicate pairs keep their first occurrence. Job ids depend only on the pair,
    /// never on its position, so checkpoints stay attached to the right pair when the
    /// list is edited between runs.
    pub fn parse(contents: &str, runs_dir: &Path, roi: Option<Roi>) -> Result<Self> {
        let parser = LineParser::new()?;
        let mut catalog = Catalog::default();
        let mut seen: HashMap<AcquisitionPair, usize> = HashMap::new();
        let mut ids: HashMap<String, usize> = HashMap::new();

        for (idx, raw) in contents.lines().enumerate() {
            let line_no = idx + 1;
            let pair = match parser.parse_line(line_no, raw) {
                Ok(Some(pair)) => pair,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("{}", e);
                    catalog.errors.push(e);
                    continue;
                }
            };

            if let Some(&first_line) = seen.get(&pair) {
                let e = CatalogError::Duplicate { line: line_no, first_line };
                tracing::warn!("{}", e);
                catalog.errors.push(e);
                continue;
            }
            seen.insert(pair.clone(), line_no);

            let name = pair.run_name();
            if let Some(&first_line) = ids.get(&name) {
                let e = CatalogError::IdCollision {
                    line: line_no,
                    first_line,
                    id: name,
                };
                tracing::warn!("{}", e);
                catalog.errors.push(e);
                continue;
            }
            ids.insert(name.clone(), line_no);

            let output_dir: PathBuf = runs_dir.join(&name);
            let mut job = PairJob::new(catalog.jobs.len(), JobId::new(name), pair, output_dir);
            job.roi = roi;
            catalog.jobs.push(job);
        }

        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Earliest and latest acquisition dates across all pairs (`YYYYMMDD`).
    pub fn date_range(&self) -> Option<(String, String)> {
        let mut dates: Vec<&str> = self
            .jobs
            .iter()
            .flat_map(|job| {
                let (r, s) = job.pair.dates();
                [r, s]
            })
            .flatten()
            .collect();
        dates.sort_unstable();
        match (dates.first(), dates.last()) {
            (Some(first), Some(last)) => Some((first.to_string(), last.to_string())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "S1A_IW_SLC__1SDV_20230203T034221_20230203T034249_047066_05A5B3_1F2E.SAFE";
    const B: &str = "S1A_IW_SLC__1SDV_20230215T034221_20230215T034249_047241_05AB9A_C0D1.SAFE";
    const C: &str = "S1B_IW_SLC__1SDV_20230227T034220_20230227T034248_047416_05B17F_9A3C.SAFE";

    fn parse(contents: &str) -> Catalog {
        Catalog::parse(contents, Path::new("/runs"), None).unwrap()
    }

    #[test]
    fn test_parse_formats() {
        let contents = format!(
            "# pairs\n\n{A} {B}\n(\"{B}\", \"{C}\")\npair: {A} -> {C}\nfoo,bar\n"
        );
        let catalog = parse(&contents);

        assert!(catalog.errors.is_empty(), "{:?}", catalog.errors);
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.jobs[0].pair, AcquisitionPair::new(A, B));
        assert_eq!(catalog.jobs[1].pair, AcquisitionPair::new(B, C));
        assert_eq!(catalog.jobs[2].pair, AcquisitionPair::new(A, C));
        assert_eq!(catalog.jobs[3].pair, AcquisitionPair::new("foo", "bar"));
    }

    #[test]
    fn test_malformed_lines_do_not_abort() {
        let contents = format!("{A}\n{A} {B}\nonly,one,too,many\n{B},{C}\n");
        let catalog = parse(&contents);

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.errors.len(), 2);
        assert_eq!(catalog.errors[0].line(), 1);
        assert_eq!(catalog.errors[1].line(), 3);
        assert!(catalog.errors[1].to_string().contains("line 3"));
    }

    #[test]
    fn test_same_scene_rejected() {
        let catalog = parse(&format!("{A} {A}\n"));
        assert!(catalog.is_empty());
        assert!(matches!(catalog.errors[0], CatalogError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_duplicates_deduplicated() {
        let contents = format!("{A} {B}\n{B} {C}\n{A},{B}\n");
        let catalog = parse(&contents);

        assert_eq!(catalog.len(), 2);
        assert!(matches!(
            catalog.errors[0],
            CatalogError::Duplicate { line: 3, first_line: 1 }
        ));
    }

    #[test]
    fn test_catalog_order_and_ids() {
        let contents = format!("{B} {C}\n{A} {B}\n");
        let catalog = parse(&contents);

        assert_eq!(catalog.jobs[0].index, 0);
        assert_eq!(catalog.jobs[0].id.as_str(), AcquisitionPair::new(B, C).run_name());
        assert!(catalog.jobs[0].id.as_str().starts_with("run_20230215_20230227_"));
        assert_eq!(catalog.jobs[1].index, 1);
        assert_eq!(
            catalog.jobs[1].output_dir,
            PathBuf::from("/runs").join(AcquisitionPair::new(A, B).run_name())
        );
        assert_eq!(catalog.jobs[1].status, JobStatus::Pending);
    }

    #[test]
    fn test_same_date_pairs_have_order_independent_ids() {
        let other_a = "S1B_IW_SLC__1SDV_20230203T999999_20230203T034249_047066_05A5B3_1F2E.SAFE";
        let forward = parse(&format!("{A} {B}\n{other_a} {B}\n"));
        let reversed = parse(&format!("{other_a} {B}\n{A} {B}\n"));
        let alone = parse(&format!("{A} {B}\n"));

        assert_eq!(forward.len(), 2);
        assert_ne!(forward.jobs[0].id, forward.jobs[1].id);
        assert!(forward.jobs[1].id.as_str().starts_with("run_20230203_20230215_"));

        let id_of = |catalog: &Catalog, reference: &str| {
            catalog
                .jobs
                .iter()
                .find(|job| job.pair.reference == reference)
                .map(|job| job.id.clone())
                .unwrap()
        };
        assert_eq!(id_of(&forward, A), id_of(&reversed, A));
        assert_eq!(id_of(&forward, other_a), id_of(&reversed, other_a));
        assert_eq!(id_of(&forward, A), id_of(&alone, A));
    }

    #[test]
    fn test_date_range() {
        let catalog = parse(&format!("{B} {C}\n{A} {B}\n"));
        assert_eq!(
            catalog.date_range(),
            Some(("20230203".to_string(), "20230227".to_string()))
        );
        assert_eq!(parse("x y\n").date_range(), None);
    }

    #[test]
    fn test_roi_propagated() {
        let roi: Roi = "34,35,-118,-117".parse().unwrap();
        let catalog = Catalog::parse(&format!("{A} {B}\n"), Path::new("/runs"), Some(roi)).unwrap();
        assert_eq!(catalog.jobs[0].roi, Some(roi));
    }
}
