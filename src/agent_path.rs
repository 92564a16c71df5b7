//! Validated rig/agent identifiers.
//!
//! Rig and agent names end up as tmux targets and command arguments, so they
//! are checked at the edge and carried as [`SafeSegment`]s from there on.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Prefix shared by every agent session name.
pub const SESSION_PREFIX: &str = "gt";

/// Maximum length of a single segment.
pub const MAX_SEGMENT_LEN: usize = 128;

/// Errors from parsing agent identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("invalid {label}: {value:?}")]
    InvalidSegment { label: &'static str, value: String },
}

/// A name segment made only of `[A-Za-z0-9._-]`, 1..=128 chars, not `.` or `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SafeSegment(String);

impl SafeSegment {
    /// Validate `value`; `label` names the segment in the error.
    pub fn new(value: impl Into<String>, label: &'static str) -> Result<Self, PathError> {
        let value = value.into();
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(PathError::InvalidSegment { label, value })
        }
    }

    /// Whether `value` is a safe segment.
    #[must_use]
    pub fn is_valid(value: &str) -> bool {
        !value.is_empty()
            && value.len() <= MAX_SEGMENT_LEN
            && value != "."
            && value != ".."
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SafeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `rig/name` address of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentPath {
    rig: SafeSegment,
    name: SafeSegment,
}

impl AgentPath {
    /// Validate both segments.
    pub fn new(rig: &str, name: &str) -> Result<Self, PathError> {
        Ok(Self {
            rig: SafeSegment::new(rig, "rig")?,
            name: SafeSegment::new(name, "agent name")?,
        })
    }

    #[must_use]
    pub const fn rig(&self) -> &SafeSegment {
        &self.rig
    }

    #[must_use]
    pub const fn name(&self) -> &SafeSegment {
        &self.name
    }

    /// tmux session name, `gt-<rig>-<name>`.
    #[must_use]
    pub fn session_name(&self) -> String {
        format!("{SESSION_PREFIX}-{}-{}", self.rig, self.name)
    }
}

impl fmt::Display for AgentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rig, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_segments() {
        for ok in ["tw", "gastown", "my_rig-2", "a.b", "..x", "a".repeat(128).as_str()] {
            assert!(SafeSegment::is_valid(ok), "{ok} should be valid");
        }
    }

    #[test]
    fn test_invalid_segments() {
        for bad in ["", ".", "..", "a/b", "a b", "rig;rm", "émile", "a".repeat(129).as_str()] {
            assert!(!SafeSegment::is_valid(bad), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn test_error_names_the_segment() {
        let err = AgentPath::new("tw", "../etc").expect_err("invalid");
        assert_eq!(err.to_string(), "invalid agent name: \"../etc\"");
    }

    #[test]
    fn test_session_name_and_display() {
        let path = AgentPath::new("tw", "alice").expect("path");
        assert_eq!(path.session_name(), "gt-tw-alice");
        assert_eq!(path.to_string(), "tw/alice");
        assert_eq!(path.rig().as_str(), "tw");
    }
}
