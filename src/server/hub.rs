//! WebSocket connection registry.
//!
//! Registry membership is the only notion of reachability: a connection is
//! sent to while registered and open, and forgotten once unregistered.

use crate::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Identifier of a registered connection.
pub type ConnectionId = u64;

/// Outbound half of one WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<str>>,
    open: AtomicBool,
}

impl Connection {
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Mark closed; later broadcasts skip it.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Queue a frame without waiting. Returns false if it was not queued.
    fn deliver(&self, text: &Arc<str>) -> bool {
        match self.sender.try_send(Arc::clone(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = self.id, "Dropping frame for slow connection");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                debug!(conn_id = self.id, "Connection closed before send");
                false
            }
        }
    }

    /// Queue a single message to this connection.
    pub fn send(&self, message: &ServerMessage) -> bool {
        self.is_open() && self.deliver(&Arc::from(message.encode()))
    }
}

/// Shared registry of open connections. Clones share state.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns it and the number registered after.
    pub fn register(&self, sender: mpsc::Sender<Arc<str>>) -> (Arc<Connection>, usize) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connection = Arc::new(Connection {
            id,
            sender,
            open: AtomicBool::new(true),
        });
        let count = {
            let mut connections = self
                .inner
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            connections.insert(id, Arc::clone(&connection));
            connections.len()
        };
        info!(conn_id = id, connections = count, "Client connected");
        (connection, count)
    }

    /// Remove a connection; returns the number still registered.
    pub fn unregister(&self, id: ConnectionId) -> usize {
        let (removed, count) = {
            let mut connections = self
                .inner
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let removed = connections.remove(&id);
            (removed, connections.len())
        };
        if let Some(connection) = removed {
            connection.close();
            info!(conn_id = id, connections = count, "Client disconnected");
        }
        count
    }

    /// Send `message` to every open connection. Returns how many accepted it.
    ///
    /// Serialization happens once. Full or closed connections are skipped;
    /// there is no retry and no per-client queue beyond the channel.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|connection| connection.is_open())
            .cloned()
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let text: Arc<str> = Arc::from(message.encode());
        let delivered = targets
            .iter()
            .filter(|connection| connection.deliver(&text))
            .count();
        debug!(
            kind = message.kind().as_str(),
            delivered,
            targets = targets.len(),
            "Broadcast"
        );
        delivered
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_reaches_every_open_connection() {
        let hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (_a, count) = hub.register(tx_a);
        assert_eq!(count, 1);
        let (_b, count) = hub.register(tx_b);
        assert_eq!(count, 2);

        let delivered = hub.broadcast(&ServerMessage::Status(json!({"ok": true})));
        assert_eq!(delivered, 2);

        let a = rx_a.recv().await.expect("a");
        let b = rx_b.recv().await.expect("b");
        assert_eq!(a, b);
        assert!(a.contains("\"type\":\"status\""));
    }

    #[tokio::test]
    async fn test_closed_and_full_connections_are_skipped() {
        let hub = Hub::new();
        let (tx_closed, rx_closed) = mpsc::channel(8);
        let (tx_full, _rx_full) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = mpsc::channel(8);
        let (closed, _) = hub.register(tx_closed);
        hub.register(tx_full);
        hub.register(tx_ok);
        drop(rx_closed);

        let message = ServerMessage::RigAdded(json!({"name": "tw"}));
        assert_eq!(hub.broadcast(&message), 2);
        assert!(!closed.is_open());
        // The single-slot channel is now full.
        assert_eq!(hub.broadcast(&message), 1);
        assert!(rx_ok.recv().await.is_some());
    }

    #[test]
    fn test_unregister_counts_down() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(1);
        let (conn, _) = hub.register(tx.clone());
        let (other, _) = hub.register(tx);
        assert_ne!(conn.id(), other.id());

        assert_eq!(hub.unregister(conn.id()), 1);
        assert!(!conn.is_open());
        assert_eq!(hub.unregister(conn.id()), 1);
        assert_eq!(hub.unregister(other.id()), 0);
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_single_connection() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(1);
        let (conn, _) = hub.register(tx);
        assert!(conn.send(&ServerMessage::Status(json!({}))));
        assert!(rx.recv().await.is_some());
        conn.close();
        assert!(!conn.send(&ServerMessage::Status(json!({}))));
    }
}
