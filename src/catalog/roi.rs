//! Region-of-interest bounds shared by every pair in a batch.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Geographic bounding box in degrees, ordered the way the radar tool expects it:
/// south, north, west, east.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl Roi {
    /// Create a new ROI, checking that the bounds are ordered and in range.
    pub fn new(south: f64, north: f64, west: f64, east: f64) -> Result<Self> {
        let roi = Self { south, north, west, east };
        roi.validate()?;
        Ok(roi)
    }

    /// Validate latitude/longitude ranges and ordering.
    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.south) || !(-90.0..=90.0).contains(&self.north) {
            bail!("ROI latitude out of range: {}", self);
        }
        if !(-180.0..=180.0).contains(&self.west) || !(-180.0..=180.0).contains(&self.east) {
            bail!("ROI longitude out of range: {}", self);
        }
        if self.south >= self.north {
            bail!("ROI south ({}) must be less than north ({})", self.south, self.north);
        }
        if self.west >= self.east {
            bail!("ROI west ({}) must be less than east ({})", self.west, self.east);
        }
        Ok(())
    }
}

impl FromStr for Roi {
    type Err = anyhow::Error;

    /// Accepts `"s,n,w,e"`, `"[s, n, w, e]"`, and `;` or whitespace separators.
    fn from_str(s: &str) -> Result<Self> {
        let cleaned = s
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .replace([';', ' ', '\t'], ",");

        let parts: Vec<&str> = cleaned.split(',').filter(|p| !p.is_empty()).collect();
        if parts.len() != 4 {
            bail!("Expected 4 ROI values (south,north,west,east), got {}: '{}'", parts.len(), s);
        }

        let mut values = [0.0f64; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .with_context(|| format!("Invalid ROI value '{}' in '{}'", part, s))?;
        }

        Roi::new(values[0], values[1], values[2], values[3])
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S={:.4}, N={:.4}, W={:.4}, E={:.4}",
            self.south, self.north, self.west, self.east
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_comma_separated() {
        let roi: Roi = "34.0,35.5,-118.5,-117.0".parse().unwrap();
        assert_eq!(roi, Roi { south: 34.0, north: 35.5, west: -118.5, east: -117.0 });
    }

    #[test]
    fn test_parse_bracketed_and_mixed_separators() {
        let roi: Roi = "[34.0; 35.5 -118.5, -117.0]".parse().unwrap();
        assert_eq!(roi.south, 34.0);
        assert_eq!(roi.east, -117.0);
    }

    #[test]
    fn test_parse_wrong_count() {
        assert!("34.0,35.5,-118.5".parse::<Roi>().is_err());
    }

    #[test]
    fn test_parse_not_a_number() {
        assert!("34.0,north,-118.5,-117.0".parse::<Roi>().is_err());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        assert!(Roi::new(35.0, 34.0, -118.0, -117.0).is_err());
        assert!(Roi::new(34.0, 35.0, -117.0, -118.0).is_err());
    }
}
