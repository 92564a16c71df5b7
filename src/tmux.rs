//! tmux session gateway.
//!
//! Agents live in tmux sessions named `gt-<rig>-<agent>`. This module wraps
//! the handful of tmux invocations the bridge needs.

use crate::runner::{Exec, ExecOptions, args};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default number of pane lines returned by [`TmuxGateway::capture_pane`].
pub const DEFAULT_CAPTURE_LINES: usize = 50;

/// Upper bound on captured pane lines.
pub const MAX_CAPTURE_LINES: usize = 10_000;

/// Budget for every tmux call.
const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// One line of `tmux ls` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub name: String,
    pub windows: u32,
    pub attached: bool,
}

/// Result of [`TmuxGateway::kill_session`].
///
/// `ok && !killed` means the session was already gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillOutcome {
    pub ok: bool,
    pub killed: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Typed tmux wrapper over an [`Exec`].
#[derive(Clone)]
pub struct TmuxGateway {
    runner: Arc<dyn Exec>,
    binary: String,
}

impl TmuxGateway {
    /// Create a gateway that invokes `tmux` from `PATH`.
    #[must_use]
    pub fn new(runner: Arc<dyn Exec>) -> Self {
        Self::with_binary(runner, "tmux")
    }

    /// Create a gateway that invokes the given tmux binary.
    #[must_use]
    pub fn with_binary(runner: Arc<dyn Exec>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    /// Whether a session with exactly this name exists.
    pub async fn has_session(&self, name: &str) -> bool {
        let options = ExecOptions::default()
            .allow_exit_codes(&[0, 1])
            .timeout(TMUX_TIMEOUT);
        let result = self
            .runner
            .exec(&self.binary, &args(&["has-session", "-t", name]), options)
            .await;
        result.exit_code == Some(0)
    }

    /// Raw `tmux ls` output; empty when tmux has no server or failed.
    pub async fn list_sessions(&self) -> String {
        let options = ExecOptions::default()
            .allow_exit_codes(&[0, 1])
            .timeout(TMUX_TIMEOUT);
        let result = self.runner.exec(&self.binary, &args(&["ls"]), options).await;
        if result.ok {
            result.stdout
        } else {
            debug!(error = ?result.error, "tmux ls failed");
            String::new()
        }
    }

    /// Last `lines` lines of the session's active pane.
    ///
    /// `None` when the capture failed (usually: no such session).
    pub async fn capture_pane(&self, session: &str, lines: usize) -> Option<String> {
        let result = self
            .runner
            .exec(
                &self.binary,
                &args(&["capture-pane", "-t", session, "-p"]),
                ExecOptions::default().timeout(TMUX_TIMEOUT),
            )
            .await;
        if !result.ok {
            debug!(session, error = ?result.error, "capture-pane failed");
            return None;
        }
        Some(trailing_lines(&result.stdout, lines))
    }

    /// Kill a session; a missing session is not an error.
    pub async fn kill_session(&self, name: &str) -> KillOutcome {
        let options = ExecOptions::default()
            .allow_exit_codes(&[0, 1])
            .timeout(TMUX_TIMEOUT);
        let result = self
            .runner
            .exec(&self.binary, &args(&["kill-session", "-t", name]), options)
            .await;
        KillOutcome {
            ok: result.ok,
            killed: result.exit_code == Some(0),
            exit_code: result.exit_code,
            error: result.error,
        }
    }

    /// `tmux -V`, for diagnostics.
    pub async fn version(&self) -> Option<String> {
        let result = self
            .runner
            .exec(
                &self.binary,
                &args(&["-V"]),
                ExecOptions::default().timeout(TMUX_TIMEOUT),
            )
            .await;
        result.ok.then(|| result.stdout_trimmed().to_string())
    }
}

/// Normalize a requested line count: 0 means the default, the rest is capped.
#[must_use]
pub fn normalize_lines(lines: usize) -> usize {
    if lines == 0 {
        DEFAULT_CAPTURE_LINES
    } else {
        lines.min(MAX_CAPTURE_LINES)
    }
}

/// Keep the last `lines` non-trailing-blank lines of pane output, trimmed.
#[must_use]
pub fn trailing_lines(output: &str, lines: usize) -> String {
    let lines = normalize_lines(lines);
    let mut all: Vec<&str> = output.split('\n').collect();
    while all.last().is_some_and(|line| line.trim().is_empty()) {
        all.pop();
    }
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n").trim().to_string()
}

/// Parse `tmux ls` output into session records, skipping unrecognized lines.
#[must_use]
pub fn parse_sessions(listing: &str) -> Vec<SessionRecord> {
    listing.lines().filter_map(parse_session_line).collect()
}

fn parse_session_line(line: &str) -> Option<SessionRecord> {
    let (name, rest) = line.split_once(':')?;
    if name.is_empty() {
        return None;
    }
    let windows = rest
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    Some(SessionRecord {
        name: name.to_string(),
        windows,
        attached: rest.contains("(attached)"),
    })
}
