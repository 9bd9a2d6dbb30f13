//! # vega-version
//!
//! The agent version type used throughout the platform.
//!
//! ## Design Principles
//!
//! - Versions are dotted numeric strings with one to four components
//!   (`"2.13"`, `"2.2.53"`, `"9.9.9.10"`)
//! - Comparison is total: missing components compare as zero, so
//!   `"2.5" == "2.5.0"` and `"2.5.0.1" > "2.5"`
//! - Display preserves the precision the version was written with
//! - Versions support roundtrip serialization (parse → format → parse)
//!
//! The total order is what makes "latest installed", "greater than the
//! daemon version", and "downgrade" well-defined for update decisions.

mod error;

pub use error::VersionError;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Maximum number of dotted components in a version.
pub const MAX_COMPONENTS: usize = 4;

/// A four-component agent version with total ordering.
///
/// Equality, ordering, and hashing all operate on the zero-padded
/// four-tuple; `precision` only affects formatting.
#[derive(Debug, Clone, Copy)]
pub struct AgentVersion {
    parts: [u64; MAX_COMPONENTS],
    precision: usize,
}

impl AgentVersion {
    /// Creates a version from four explicit components.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64, build: u64) -> Self {
        Self {
            parts: [major, minor, patch, build],
            precision: MAX_COMPONENTS,
        }
    }

    /// The zero version, smaller than every released version.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            parts: [0; MAX_COMPONENTS],
            precision: 1,
        }
    }

    #[must_use]
    pub const fn major(&self) -> u64 {
        self.parts[0]
    }

    #[must_use]
    pub const fn minor(&self) -> u64 {
        self.parts[1]
    }

    #[must_use]
    pub const fn patch(&self) -> u64 {
        self.parts[2]
    }

    #[must_use]
    pub const fn build(&self) -> u64 {
        self.parts[3]
    }

    /// True when `self` and `other` agree on the first three components and
    /// differ only in the fourth.
    ///
    /// Used to classify a candidate upgrade as a hotfix, which is allowed
    /// through on a shorter frequency window than a regular release.
    #[must_use]
    pub fn is_hotfix_of(&self, other: &Self) -> bool {
        self.parts[..3] == other.parts[..3] && self.parts[3] != other.parts[3]
    }
}

impl PartialEq for AgentVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for AgentVersion {}

impl Hash for AgentVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl PartialOrd for AgentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl fmt::Display for AgentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts[..self.precision].iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl FromStr for AgentVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VersionError::Empty);
        }

        let components: Vec<&str> = s.split('.').collect();
        if components.len() > MAX_COMPONENTS {
            return Err(VersionError::TooManyComponents {
                count: components.len(),
            });
        }

        let mut parts = [0u64; MAX_COMPONENTS];
        for (i, component) in components.iter().enumerate() {
            parts[i] = component
                .parse()
                .map_err(|_| VersionError::InvalidComponent {
                    component: (*component).to_string(),
                })?;
        }

        Ok(Self {
            parts,
            precision: components.len(),
        })
    }
}

impl serde::Serialize for AgentVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for AgentVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> AgentVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_roundtrip() {
        for s in ["2", "2.13", "2.2.53", "9.9.9.10", "99999.0.0.0"] {
            let version = v(s);
            assert_eq!(version.to_string(), s);
            let reparsed: AgentVersion = version.to_string().parse().unwrap();
            assert_eq!(version, reparsed);
        }
    }

    #[test]
    fn test_parse_empty() {
        let result: Result<AgentVersion, _> = "".parse();
        assert!(matches!(result.unwrap_err(), VersionError::Empty));
    }

    #[test]
    fn test_parse_too_many_components() {
        let result: Result<AgentVersion, _> = "1.2.3.4.5".parse();
        assert!(matches!(
            result.unwrap_err(),
            VersionError::TooManyComponents { count: 5 }
        ));
    }

    #[test]
    fn test_parse_invalid_component() {
        for s in ["2.x.0", "2..0", "-1.0", "2.5-beta"] {
            let result: Result<AgentVersion, _> = s.parse();
            assert!(
                matches!(result.unwrap_err(), VersionError::InvalidComponent { .. }),
                "expected invalid component for {s}"
            );
        }
    }

    #[test]
    fn test_ordering_is_total_and_numeric() {
        assert!(v("2.2.53") < v("9.9.9.10"));
        assert!(v("9.9.9.10") < v("99999.0.0.0"));
        assert!(v("2.10.0") > v("2.9.9"), "components compare numerically");
        assert!(v("1.2.0") < v("2.2.53"));
    }

    #[test]
    fn test_missing_components_compare_as_zero() {
        assert_eq!(v("2.5"), v("2.5.0"));
        assert_eq!(v("2.5"), v("2.5.0.0"));
        assert!(v("2.5.0.1") > v("2.5"));
    }

    #[test]
    fn test_display_preserves_precision() {
        assert_eq!(v("2.5").to_string(), "2.5");
        assert_eq!(v("2.5.0").to_string(), "2.5.0");
        assert_eq!(v("2.5.0.0").to_string(), "2.5.0.0");
    }

    #[test]
    fn test_sort_descending() {
        let mut versions = vec![v("2.2.53"), v("99999.0.0.0"), v("1.2.0"), v("9.9.9.10")];
        versions.sort_by(|a, b| b.cmp(a));
        let rendered: Vec<String> = versions.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["99999.0.0.0", "9.9.9.10", "2.2.53", "1.2.0"]);
    }

    #[test]
    fn test_is_hotfix_of() {
        assert!(v("2.2.53.2").is_hotfix_of(&v("2.2.53.1")));
        assert!(v("2.2.53.1").is_hotfix_of(&v("2.2.53")));
        assert!(!v("2.2.54").is_hotfix_of(&v("2.2.53")));
        assert!(!v("3.0.0").is_hotfix_of(&v("2.2.53")));
        assert!(!v("2.2.53").is_hotfix_of(&v("2.2.53")), "equal is not a hotfix");
    }

    #[test]
    fn test_json_roundtrip() {
        let version = v("9.9.9.10");
        let json = serde_json::to_string(&version).unwrap();
        assert_eq!(json, "\"9.9.9.10\"");
        let parsed: AgentVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(version, parsed);
    }

    #[test]
    fn test_zero_is_floor() {
        assert!(AgentVersion::zero() < v("0.0.0.1"));
        assert_eq!(AgentVersion::zero(), v("0"));
    }
}
