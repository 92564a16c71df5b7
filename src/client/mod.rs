//! Client for the bridge's `/ws` event stream.
//!
//! [`ConnectionManager`] keeps one connection open while at least one
//! subscriber holds a [`SubscriberGuard`], reconnects with exponential
//! backoff when it drops, and feeds every frame into [`Stores`].

mod stores;

pub use stores::{
    ConvoyStore, EventStore, FeedItem, MAX_EVENTS, RefreshRequest, RefreshSignals, RefreshTopic,
    StatusStore, Stores,
};

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Delay before the first reconnect; doubled for each further attempt.
pub const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connection error: {0}")]
    Transport(String),

    #[error("not connected")]
    NotConnected,
}

/// State of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted.
    Error,
}

/// Exponential reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BASE_RECONNECT_DELAY, MAX_RECONNECT_ATTEMPTS)
    }
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Count an attempt and return its delay, `base * 2^(attempt-1)`, or
    /// `None` once `max_attempts` have been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.base.saturating_mul(2_u32.saturating_pow(self.attempt - 1)))
    }

    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// An open connection: text frames in, text frames out.
pub struct Channel {
    pub incoming: BoxStream<'static, Result<String, ClientError>>,
    pub outgoing: mpsc::Sender<String>,
}

/// Opens connections for [`ConnectionManager`].
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Channel, ClientError>>;
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] if `url` does not parse.
    pub fn new(url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            url: Url::parse(url)?,
        })
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Channel, ClientError>> {
        let url = self.url.to_string();
        async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|e| ClientError::Connect(e.to_string()))?;
            let (mut sink, stream) = ws.split();

            let (outgoing, mut rx) = mpsc::channel::<String>(64);
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            let incoming = stream
                .filter_map(|frame| async move {
                    match frame {
                        Ok(Message::Text(text)) => Some(Ok(text)),
                        Ok(_) => None,
                        Err(e) => Some(Err(ClientError::Transport(e.to_string()))),
                    }
                })
                .boxed();
            Ok(Channel { incoming, outgoing })
        }
        .boxed()
    }
}

struct ManagerState {
    /// Bumped whenever a session is started or torn down; tasks from older
    /// epochs leave the state alone.
    epoch: u64,
    ref_count: usize,
    backoff: Backoff,
    auto_reconnect: bool,
    outgoing: Option<mpsc::Sender<String>>,
    session: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl ManagerState {
    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(session) = self.session.take() {
            session.abort();
        }
        self.outgoing = None;
    }
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    stores: Stores,
    status: watch::Sender<ConnectionStatus>,
    state: Mutex<ManagerState>,
}

/// Shared, ref-counted connection to the bridge. Clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_backoff(connector, Backoff::default())
    }

    #[must_use]
    pub fn with_backoff(connector: Arc<dyn Connector>, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                stores: Stores::new(),
                status: watch::channel(ConnectionStatus::Disconnected).0,
                state: Mutex::new(ManagerState {
                    epoch: 0,
                    ref_count: 0,
                    backoff,
                    auto_reconnect: true,
                    outgoing: None,
                    session: None,
                    timer: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.inner.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.lock().backoff.attempt()
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.lock().ref_count
    }

    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    /// Register a subscriber; the first one opens the connection.
    #[must_use = "dropping the guard releases the subscription"]
    pub fn acquire(&self) -> SubscriberGuard {
        let first = {
            let mut state = self.lock();
            state.ref_count += 1;
            state.ref_count == 1
        };
        if first {
            self.connect();
        }
        SubscriberGuard {
            manager: self.clone(),
        }
    }

    fn release(&self) {
        let last = {
            let mut state = self.lock();
            state.ref_count = state.ref_count.saturating_sub(1);
            state.ref_count == 0
        };
        if last {
            self.disconnect();
        }
    }

    /// Open the connection unless it is already open or opening. Re-enables
    /// automatic reconnects and resets the backoff.
    pub fn connect(&self) {
        let mut state = self.lock();
        if matches!(
            self.status(),
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        ) {
            return;
        }
        state.auto_reconnect = true;
        state.backoff.reset();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        self.open(&mut state);
    }

    /// Close the connection and stop reconnecting until the next
    /// [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.auto_reconnect = false;
        state.epoch += 1;
        state.cancel_tasks();
        self.set_status(ConnectionStatus::Disconnected);
        drop(state);
        info!("Disconnected from bridge");
    }

    /// Send a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if there is no open connection
    /// or its outbound queue is full.
    pub fn send(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let outgoing = self.lock().outgoing.clone();
        match outgoing {
            Some(tx) => tx.try_send(text.into()).map_err(|_| ClientError::NotConnected),
            None => {
                warn!("Cannot send, not connected");
                Err(ClientError::NotConnected)
            }
        }
    }

    fn open(&self, state: &mut ManagerState) {
        state.epoch += 1;
        let epoch = state.epoch;
        self.set_status(ConnectionStatus::Connecting);
        let manager = self.clone();
        state.session = Some(tokio::spawn(async move {
            manager.run_session(epoch).await;
        }));
    }

    async fn run_session(&self, epoch: u64) {
        match self.inner.connector.connect().await {
            Ok(channel) => {
                {
                    let mut state = self.lock();
                    if state.epoch != epoch {
                        return;
                    }
                    state.outgoing = Some(channel.outgoing);
                    state.backoff.reset();
                    self.set_status(ConnectionStatus::Connected);
                }
                info!("Connected to bridge");

                let mut incoming = channel.incoming;
                while let Some(frame) = incoming.next().await {
                    match frame {
                        Ok(text) => self.inner.stores.dispatch_text(&text),
                        Err(e) => {
                            warn!(error = %e, "Connection error");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Connection failed"),
        }
        self.on_closed(epoch);
    }

    fn on_closed(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        state.outgoing = None;
        state.session = None;
        self.set_status(ConnectionStatus::Disconnected);

        if state.ref_count == 0 || !state.auto_reconnect {
            return;
        }
        let Some(delay) = state.backoff.next_delay() else {
            warn!(attempts = state.backoff.attempt(), "Giving up on reconnecting");
            self.set_status(ConnectionStatus::Error);
            return;
        };
        debug!(
            attempt = state.backoff.attempt(),
            delay_ms = delay.as_millis(),
            "Reconnecting"
        );
        let manager = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.reconnect(epoch);
        }));
    }

    fn reconnect(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch || !state.auto_reconnect {
            return;
        }
        state.timer = None;
        self.open(&mut state);
    }
}

/// Keeps the connection wanted while alive.
pub struct SubscriberGuard {
    manager: ConnectionManager,
}

impl SubscriberGuard {
    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.manager.release();
    }
}
