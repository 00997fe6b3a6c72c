//! Transient/fatal classification of external tool failures.
//!
//! The boundary between the two is tool-specific, so it lives in configuration.
//! Anything the configuration does not recognize is fatal.

use crate::config::ClassificationConfig;
use anyhow::{Context, Result};
use regex::Regex;

/// Class of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Fatal,
}

/// Compiled classification rules.
#[derive(Debug, Default)]
pub struct FailureClassifier {
    transient_exit_codes: Vec<i32>,
    fatal_exit_codes: Vec<i32>,
    transient_patterns: Vec<Regex>,
    fatal_patterns: Vec<Regex>,
}

impl FailureClassifier {
    /// Compile the classification config.
    pub fn from_config(config: &ClassificationConfig) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).with_context(|| format!("Invalid pattern '{}'", p)))
                .collect()
        };

        Ok(Self {
            transient_exit_codes: config.transient_exit_codes.clone(),
            fatal_exit_codes: config.fatal_exit_codes.clone(),
            transient_patterns: compile(&config.transient_patterns)?,
            fatal_patterns: compile(&config.fatal_patterns)?,
        })
    }

    /// Classify a process that exited unsuccessfully.
    ///
    /// Precedence: fatal patterns, fatal exit codes, transient patterns, transient
    /// exit codes. `exit_code` is `None` when the process was killed by a signal.
    pub fn classify_exit(&self, exit_code: Option<i32>, output: &str) -> FailureKind {
        if self.fatal_patterns.iter().any(|re| re.is_match(output)) {
            return FailureKind::Fatal;
        }
        if exit_code.is_some_and(|code| self.fatal_exit_codes.contains(&code)) {
            return FailureKind::Fatal;
        }
        if self.transient_patterns.iter().any(|re| re.is_match(output)) {
            return FailureKind::Transient;
        }
        if exit_code.is_some_and(|code| self.transient_exit_codes.contains(&code)) {
            return FailureKind::Transient;
        }
        FailureKind::Fatal
    }
}
