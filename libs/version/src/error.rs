//! Error types for version parsing.

use thiserror::Error;

/// Errors that can occur when parsing an agent version.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The version string is empty.
    #[error("version cannot be empty")]
    Empty,

    /// The version has more than four components.
    #[error("version has too many components: expected at most 4, got {count}")]
    TooManyComponents { count: usize },

    /// A component is not a non-negative integer.
    #[error("invalid version component '{component}'")]
    InvalidComponent { component: String },
}
