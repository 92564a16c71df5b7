//! Activity feed parser.
//!
//! `gt feed --plain` prints one event per line:
//!
//! ```text
//! [12:30:01] + rig1/bead-1 created · fixed login
//! ```
//!
//! Lines that do not match are dropped; the feed is long-lived and must
//! survive garbage.

// Timestamp won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{2}:\d{2}:\d{2})\]\s+(.+?)\s+(\S+)\s+(.+)$")
        .expect("activity line pattern is valid")
});

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

const DESCRIPTION_SEPARATOR: &str = " · ";

/// Kind of activity, derived from the line's leading symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    BeadCreated,
    BeadUpdated,
    WorkComplete,
    WorkFailed,
    BeadDeleted,
    BeadPinned,
    PatrolStarted,
    AgentNudged,
    WorkSlung,
    Handoff,
    MergeStarted,
    ConvoyCreated,
    ConvoyUpdated,
    System,
}

impl ActivityKind {
    /// Map a feed symbol to a kind; unknown symbols are `System`.
    #[must_use]
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol.trim().trim_end_matches('\u{fe0f}') {
            "+" => Self::BeadCreated,
            "→" => Self::BeadUpdated,
            "✓" => Self::WorkComplete,
            "✗" => Self::WorkFailed,
            "⊘" => Self::BeadDeleted,
            "📌" => Self::BeadPinned,
            "🦉" => Self::PatrolStarted,
            "⚡" => Self::AgentNudged,
            "🎯" => Self::WorkSlung,
            "🤝" => Self::Handoff,
            "⚙" => Self::MergeStarted,
            "🚀" => Self::ConvoyCreated,
            "📦" => Self::ConvoyUpdated,
            _ => Self::System,
        }
    }
}

/// One parsed feed line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Unique within the process.
    pub id: String,
    /// Wall-clock time printed by the feed (`HH:MM:SS`).
    pub time: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub target: String,
    pub action: String,
    pub message: String,
    pub summary: String,
    /// RFC 3339 time the line was parsed.
    pub timestamp: String,
}

/// Parse one feed line; `None` when it does not match the format.
#[must_use]
pub fn parse_activity_line(line: &str) -> Option<ActivityEvent> {
    let clean = strip_ansi_escapes::strip_str(line);
    let caps = LINE_RE.captures(clean.trim_end_matches(['\r', '\n']))?;

    let mut parts = caps[4].split(DESCRIPTION_SEPARATOR);
    let action = parts.next().unwrap_or_default().trim().to_string();
    let rest: Vec<&str> = parts.collect();
    let message = rest.join(DESCRIPTION_SEPARATOR).trim().to_string();
    let summary = if rest.is_empty() {
        action.clone()
    } else {
        format!("{action}: {message}")
    };

    Some(ActivityEvent {
        id: next_event_id(),
        time: caps[1].to_string(),
        kind: ActivityKind::from_symbol(&caps[2]),
        target: caps[3].to_string(),
        action,
        message,
        summary,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// `<unix-millis>-<sequence>`.
#[must_use]
pub fn next_event_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{millis}-{seq}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_created_with_description() {
        let event = parse_activity_line("[12:30:01] + rig1/bead-1 created · fixed login")
            .expect("event");
        assert_eq!(event.time, "12:30:01");
        assert_eq!(event.kind, ActivityKind::BeadCreated);
        assert_eq!(event.target, "rig1/bead-1");
        assert_eq!(event.action, "created");
        assert_eq!(event.message, "fixed login");
        assert_eq!(event.summary, "created: fixed login");
    }

    #[test]
    fn test_parse_without_description() {
        let event = parse_activity_line("[08:00:00] 🦉 tw/witness patrol started").expect("event");
        assert_eq!(event.kind, ActivityKind::PatrolStarted);
        assert_eq!(event.action, "patrol started");
        assert_eq!(event.message, "");
        assert_eq!(event.summary, "patrol started");
    }

    #[test]
    fn test_multiple_separators_rejoin() {
        let event = parse_activity_line("[08:00:00] ✓ tw/alice done · a · b").expect("event");
        assert_eq!(event.kind, ActivityKind::WorkComplete);
        assert_eq!(event.message, "a · b");
    }

    #[test]
    fn test_unknown_symbol_is_system() {
        let event = parse_activity_line("[08:00:00] ?? town booted ok").expect("event");
        assert_eq!(event.kind, ActivityKind::System);
        assert_eq!(ActivityKind::from_symbol("⚙\u{fe0f}"), ActivityKind::MergeStarted);
    }

    #[test]
    fn test_ansi_is_stripped() {
        let event = parse_activity_line("\x1b[2m[09:15:00]\x1b[0m \x1b[32m🚀\x1b[0m hq/cv-1 created\r")
            .expect("event");
        assert_eq!(event.kind, ActivityKind::ConvoyCreated);
        assert_eq!(event.target, "hq/cv-1");
        assert_eq!(event.action, "created");
    }

    #[test]
    fn test_malformed_lines_dropped() {
        for line in ["", "created something", "12:30:01 + a b", "[12:30] + a b", "[12:30:01] +"] {
            assert!(parse_activity_line(line).is_none(), "{line:?}");
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let a = parse_activity_line("[01:02:03] + a b").expect("a");
        let b = parse_activity_line("[01:02:03] + a b").expect("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_wire_shape() {
        let event = parse_activity_line("[01:02:03] 🎯 tw/alice slung · gt-123").expect("event");
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "work_slung");
        assert!(value["timestamp"].as_str().is_some_and(|t| t.ends_with('Z')));
    }
}
