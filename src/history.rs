//! Bounded history of messages sent to agents.

// Timestamp won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default history capacity.
pub const MAX_MESSAGE_HISTORY: usize = 100;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Delivery outcome of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    Sent,
    Failed,
    /// Delivered after the target had to be started first.
    AutoStarted,
}

/// A message sent (or attempted) to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: String,
    pub timestamp: String,
    pub target: String,
    pub message: String,
    pub status: MessageStatus,
    pub response: Option<String>,
}

/// Newest-first ring buffer of [`MessageEntry`].
#[derive(Debug)]
pub struct MessageHistory {
    capacity: usize,
    entries: VecDeque<MessageEntry>,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_HISTORY)
    }
}

impl MessageHistory {
    /// Create a history holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    fn next_id() -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!("{millis:x}{seq:04x}")
    }

    /// Record a message, evicting the oldest entry when full.
    pub fn record(
        &mut self,
        target: &str,
        message: &str,
        status: MessageStatus,
        response: Option<String>,
    ) -> MessageEntry {
        let entry = MessageEntry {
            id: Self::next_id(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            target: target.to_string(),
            message: message.to_string(),
            status,
            response,
        };
        self.entries.push_front(entry.clone());
        self.entries.truncate(self.capacity);
        entry
    }

    /// Up to `limit` most recent entries, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<MessageEntry> {
        self.entries
            .iter()
            .take(limit.min(self.capacity))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_first() {
        let mut history = MessageHistory::default();
        history.record("mayor", "first", MessageStatus::Sent, None);
        history.record("mayor", "second", MessageStatus::Failed, Some("boom".into()));

        let recent = history.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[0].response.as_deref(), Some("boom"));
        assert_eq!(recent[1].message, "first");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = MessageHistory::new(3);
        for i in 0..5 {
            history.record("mayor", &format!("m{i}"), MessageStatus::Sent, None);
        }
        assert_eq!(history.len(), 3);
        let messages: Vec<_> = history.recent(100).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["m4", "m3", "m2"]);
    }

    #[test]
    fn test_ids_unique_and_status_wire_name() {
        let mut history = MessageHistory::default();
        let a = history.record("mayor", "a", MessageStatus::AutoStarted, None);
        let b = history.record("mayor", "b", MessageStatus::Sent, None);
        assert_ne!(a.id, b.id);
        let value = serde_json::to_value(&a).expect("serialize");
        assert_eq!(value["status"], "auto-started");
    }
}
