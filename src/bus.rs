//! In-process event bus.
//!
//! Producers inside the bridge call [`EventBus::emit`]. Local subscribers are
//! called synchronously, then the message is forwarded to the WebSocket hub.

use crate::protocol::{MessageKind, ServerMessage};
use crate::server::Hub;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Listener = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

struct Registration {
    id: u64,
    /// `None` subscribes to every kind.
    filter: Option<MessageKind>,
    listener: Listener,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Typed publish/subscribe. Clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
    hub: Option<Hub>,
}

impl EventBus {
    /// A bus with no hub; messages reach local subscribers only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that forwards every message to `hub` after local delivery.
    #[must_use]
    pub fn with_hub(hub: Hub) -> Self {
        Self {
            inner: Arc::default(),
            hub: Some(hub),
        }
    }

    /// Deliver to matching subscribers, then broadcast.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// revoke from inside a callback.
    pub fn emit(&self, message: &ServerMessage) {
        let kind = message.kind();
        let listeners: Vec<Listener> = self
            .inner
            .lock()
            .iter()
            .filter(|reg| reg.filter.is_none_or(|filter| filter == kind))
            .map(|reg| Arc::clone(&reg.listener))
            .collect();
        for listener in listeners {
            listener(message);
        }
        if let Some(hub) = &self.hub {
            hub.broadcast(message);
        }
    }

    /// Subscribe to one kind of message.
    #[must_use]
    pub fn subscribe<F>(&self, kind: MessageKind, listener: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Subscribe to every message.
    #[must_use]
    pub fn subscribe_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, filter: Option<MessageKind>, listener: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().push(Registration {
            id,
            filter,
            listener,
        });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Handle to a subscription; revoked when dropped.
#[must_use = "dropping a Subscription revokes it"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Revoke now.
    pub fn revoke(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().retain(|reg| reg.id != self.id);
        }
    }
}
