//! Dotted-numeric OS version comparison
//!
//! MDM providers report versions like `13`, `13.4` or `13.4.1`. Missing
//! trailing segments compare as zero, so `13` and `13.0.0` are equal.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("Empty version string")]
    Empty,

    #[error("Invalid version segment '{segment}' in '{version}'")]
    InvalidSegment { version: String, segment: String },
}

/// A parsed dotted-numeric version
#[derive(Debug, Clone)]
pub struct OsVersion {
    segments: Vec<u64>,
}

impl OsVersion {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }

        let segments = trimmed
            .split('.')
            .map(|segment| {
                segment
                    .parse::<u64>()
                    .map_err(|_| VersionError::InvalidSegment {
                        version: input.to_string(),
                        segment: segment.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { segments })
    }

    fn segment(&self, idx: usize) -> u64 {
        self.segments.get(idx).copied().unwrap_or(0)
    }
}

impl FromStr for OsVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl PartialEq for OsVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OsVersion {}

impl PartialOrd for OsVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OsVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        (0..len)
            .map(|i| self.segment(i).cmp(&other.segment(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

/// Returns true when `candidate` >= `required`.
pub fn satisfies(candidate: &str, required: &str) -> Result<bool, VersionError> {
    let candidate = OsVersion::parse(candidate)?;
    let required = OsVersion::parse(required)?;
    Ok(candidate >= required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies_basic() {
        assert!(satisfies("13.4", "13.0").unwrap());
        assert!(satisfies("13.0", "13.0").unwrap());
        assert!(!satisfies("12.6.1", "13.0").unwrap());
        assert!(satisfies("14", "13.5.2").unwrap());
    }

    #[test]
    fn test_missing_segments_are_zero() {
        assert!(satisfies("13", "13.0.0").unwrap());
        assert!(satisfies("13.0.0", "13").unwrap());
        assert!(!satisfies("13", "13.0.1").unwrap());
    }

    #[test]
    fn test_numeric_not_lexical() {
        assert!(satisfies("13.10", "13.9").unwrap());
        assert!(!satisfies("9.9", "10.0").unwrap());
    }

    #[test]
    fn test_antisymmetric_except_equal() {
        let pairs = [("12.0", "13.0"), ("13.4.1", "13.4"), ("11", "11.0"), ("14.2", "14.10")];
        for (a, b) in pairs {
            let ab = satisfies(a, b).unwrap();
            let ba = satisfies(b, a).unwrap();
            if OsVersion::parse(a).unwrap() == OsVersion::parse(b).unwrap() {
                assert!(ab && ba, "{a} vs {b}");
            } else {
                assert_eq!(ab, !ba, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            satisfies("13.x", "13.0"),
            Err(VersionError::InvalidSegment { .. })
        ));
        assert!(matches!(satisfies("", "13.0"), Err(VersionError::Empty)));
        assert!(satisfies("13.0", "beta").is_err());
        assert!(satisfies("13..1", "13.0").is_err());
    }

    #[test]
    fn test_display_and_prefix() {
        let v: OsVersion = "v13.4.1".parse().unwrap();
        assert_eq!(v.to_string(), "13.4.1");
    }
}
