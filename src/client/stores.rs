//! Client-side state fed by the bridge's event stream.

use crate::activity::ActivityEvent;
use crate::history::MessageEntry;
use crate::protocol::{Decoded, ServerMessage, ServiceStarted, decode};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Maximum number of items kept by [`EventStore`].
pub const MAX_EVENTS: usize = 500;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Latest status snapshot.
pub struct StatusStore {
    latest: watch::Sender<Option<Value>>,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self {
            latest: watch::channel(None).0,
        }
    }
}

impl StatusStore {
    pub fn set(&self, status: Value) {
        self.latest.send_replace(Some(status));
    }

    #[must_use]
    pub fn latest(&self) -> Option<Value> {
        self.latest.borrow().clone()
    }

    /// Watch for new snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Value>> {
        self.latest.subscribe()
    }
}

/// One entry of the activity feed shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "item", rename_all = "snake_case")]
pub enum FeedItem {
    Activity(ActivityEvent),
    Message(MessageEntry),
    ServiceStarted(ServiceStarted),
}

/// Newest-first feed, capped at [`MAX_EVENTS`].
pub struct EventStore {
    capacity: usize,
    items: Mutex<VecDeque<FeedItem>>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(MAX_EVENTS)
    }
}

impl EventStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: FeedItem) {
        let mut items = lock(&self.items);
        items.push_front(item);
        items.truncate(self.capacity);
    }

    /// Up to `limit` items, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<FeedItem> {
        lock(&self.items).iter().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.items).clear();
    }
}

/// Convoys keyed by their `id` field.
#[derive(Default)]
pub struct ConvoyStore {
    convoys: Mutex<Vec<Value>>,
}

impl ConvoyStore {
    /// Merge `convoy` into the entry with the same id, or add it at the
    /// front. Convoys without a string or numeric id are ignored.
    pub fn upsert(&self, convoy: Value) -> bool {
        let Some(id) = convoy.get("id").filter(|id| id.is_string() || id.is_number()).cloned()
        else {
            debug!("Ignoring convoy without an id");
            return false;
        };
        let mut convoys = lock(&self.convoys);
        match convoys.iter_mut().find(|c| c.get("id") == Some(&id)) {
            Some(existing) => merge(existing, convoy),
            None => convoys.insert(0, convoy),
        }
        true
    }

    #[must_use]
    pub fn all(&self) -> Vec<Value> {
        lock(&self.convoys).clone()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Value> {
        lock(&self.convoys)
            .iter()
            .find(|c| match c.get("id") {
                Some(Value::String(s)) => s == id,
                Some(other) => other.to_string() == id,
                None => false,
            })
            .cloned()
    }
}

/// Shallow merge: top-level fields of `update` overwrite `target`'s.
fn merge(target: &mut Value, update: Value) {
    match (target.as_object_mut(), update) {
        (Some(target), Value::Object(update)) => target.extend(update),
        (_, update) => *target = update,
    }
}

/// What a refresh signal asks the UI to re-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTopic {
    Status,
    Convoys,
    Work,
    Mail,
}

impl RefreshTopic {
    pub const ALL: [Self; 4] = [Self::Status, Self::Convoys, Self::Work, Self::Mail];

    const fn index(self) -> usize {
        match self {
            Self::Status => 0,
            Self::Convoys => 1,
            Self::Work => 2,
            Self::Mail => 3,
        }
    }
}

/// The latest refresh request for a topic. `generation` increases with
/// every request; `force` asks to bypass server-side caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshRequest {
    pub generation: u64,
    pub force: bool,
}

/// Per-topic refresh counters.
pub struct RefreshSignals {
    topics: [watch::Sender<RefreshRequest>; 4],
}

impl Default for RefreshSignals {
    fn default() -> Self {
        Self {
            topics: std::array::from_fn(|_| watch::channel(RefreshRequest::default()).0),
        }
    }
}

impl RefreshSignals {
    /// Ask watchers of `topic` to re-fetch.
    pub fn request(&self, topic: RefreshTopic, force: bool) {
        self.topics[topic.index()].send_modify(|request| {
            request.generation += 1;
            request.force = force;
        });
    }

    #[must_use]
    pub fn current(&self, topic: RefreshTopic) -> RefreshRequest {
        *self.topics[topic.index()].borrow()
    }

    #[must_use]
    pub fn subscribe(&self, topic: RefreshTopic) -> watch::Receiver<RefreshRequest> {
        self.topics[topic.index()].subscribe()
    }
}

/// Every client-side store, plus a tap of dispatched messages.
pub struct Stores {
    pub status: StatusStore,
    pub events: EventStore,
    pub convoys: ConvoyStore,
    pub refresh: RefreshSignals,
    tap: broadcast::Sender<ServerMessage>,
}

impl Default for Stores {
    fn default() -> Self {
        Self {
            status: StatusStore::default(),
            events: EventStore::default(),
            convoys: ConvoyStore::default(),
            refresh: RefreshSignals::default(),
            tap: broadcast::channel(256).0,
        }
    }
}

impl Stores {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message applied from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tap.subscribe()
    }

    /// Decode a frame and apply it. Malformed and unknown frames are logged
    /// and dropped.
    pub fn dispatch_text(&self, text: &str) {
        match decode(text) {
            Ok(Decoded::Known(message)) => self.apply(message),
            Ok(Decoded::Unknown(kind)) => debug!(kind, "Ignoring unknown message type"),
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    /// Route a message to the store it updates.
    pub fn apply(&self, message: ServerMessage) {
        match &message {
            ServerMessage::Status(status) => self.status.set(status.clone()),
            ServerMessage::Activity(event) => self.events.push(FeedItem::Activity(event.clone())),
            ServerMessage::ConvoyCreated(convoy) | ServerMessage::ConvoyUpdated(convoy) => {
                self.convoys.upsert(convoy.clone());
            }
            ServerMessage::WorkSlung(_) => self.refresh.request(RefreshTopic::Convoys, false),
            ServerMessage::BeadCreated(_) => self.refresh.request(RefreshTopic::Work, false),
            ServerMessage::RigAdded(_) | ServerMessage::RigRemoved(_) => {
                self.refresh.request(RefreshTopic::Status, true);
            }
            ServerMessage::MayorMessage(entry) => self.events.push(FeedItem::Message(entry.clone())),
            ServerMessage::ServiceStarted(started) => {
                if started.auto_started {
                    self.events.push(FeedItem::ServiceStarted(started.clone()));
                }
                self.refresh.request(RefreshTopic::Status, false);
            }
            ServerMessage::MailReceived(_) => self.refresh.request(RefreshTopic::Mail, false),
            ServerMessage::AgentStarted(_)
            | ServerMessage::AgentStopped(_)
            | ServerMessage::AgentRestarted(_) => self.refresh.request(RefreshTopic::Status, false),
            ServerMessage::BeadUpdated(_) => {}
        }
        // Err only means nobody is tapping.
        let _ = self.tap.send(message);
    }
}
