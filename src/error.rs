//! Bridge-level errors.
//!
//! Subprocess failures are data (see [`crate::runner::CommandResult`]); the
//! types here describe failures that a caller of the bridge has to act on.

use crate::cache::CacheError;
use crate::runner::CommandResult;
use serde::Serialize;
use thiserror::Error;

/// Machine-readable error category, surfaced to HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    NotRunning,
    InvalidInput,
    CommandFailed,
    Unavailable,
    Internal,
}

impl ErrorCategory {
    /// Wire name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NotRunning => "not_running",
            Self::InvalidInput => "invalid_input",
            Self::CommandFailed => "command_failed",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

/// Errors produced by bridge operations.
///
/// `Clone` so that a single failed cache production can be handed to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{target} is not running")]
    NotRunning {
        target: String,
        hint: Option<String>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{command} failed: {message}")]
    CommandFailed {
        command: String,
        message: String,
        hint: Option<String>,
    },

    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Build a `CommandFailed` error from a failed subprocess result.
    #[must_use]
    pub fn command_failed(command: &str, result: &CommandResult) -> Self {
        let message = result
            .error
            .clone()
            .or_else(|| {
                let stderr = result.stderr.trim();
                (!stderr.is_empty()).then(|| stderr.to_string())
            })
            .unwrap_or_else(|| match result.exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "terminated without an exit code".to_string(),
            });
        Self::CommandFailed {
            command: command.to_string(),
            message,
            hint: None,
        }
    }

    /// Attach a remediation hint (only `NotRunning` and `CommandFailed` carry one).
    #[must_use]
    pub fn with_hint(self, new_hint: impl Into<String>) -> Self {
        match self {
            Self::NotRunning { target, .. } => Self::NotRunning {
                target,
                hint: Some(new_hint.into()),
            },
            Self::CommandFailed {
                command, message, ..
            } => Self::CommandFailed {
                command,
                message,
                hint: Some(new_hint.into()),
            },
            other => other,
        }
    }

    /// Category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::NotRunning { .. } => ErrorCategory::NotRunning,
            Self::InvalidInput(_) => ErrorCategory::InvalidInput,
            Self::CommandFailed { .. } => ErrorCategory::CommandFailed,
            Self::Unavailable(_) => ErrorCategory::Unavailable,
            Self::Cache(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Remediation hint, if any.
    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::NotRunning { hint, .. } | Self::CommandFailed { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

impl From<crate::agent_path::PathError> for BridgeError {
    fn from(err: crate::agent_path::PathError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}
