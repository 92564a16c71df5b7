//! The bridge runtime: every long-lived component, constructed once and
//! shared by the HTTP handlers, the WebSocket hub, and the CLI.

use crate::agents::AgentService;
use crate::bus::EventBus;
use crate::cache::CacheRegistry;
use crate::config::BridgeConfig;
use crate::gt::GtGateway;
use crate::history::MessageHistory;
use crate::protocol::HealthResponse;
use crate::runner::{CommandRunner, Exec};
use crate::server::{ActivityFeed, Connection, ConnectionId, Hub};
use crate::status::StatusService;
use crate::tmux::TmuxGateway;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

struct RuntimeInner {
    config: BridgeConfig,
    gt: GtGateway,
    tmux: TmuxGateway,
    cache: CacheRegistry,
    hub: Hub,
    bus: EventBus,
    feed: ActivityFeed,
    status: StatusService,
    agents: AgentService,
    shutdown: watch::Sender<bool>,
}

/// Cheaply cloneable handle to the bridge's shared state.
#[derive(Clone)]
pub struct BridgeRuntime {
    inner: Arc<RuntimeInner>,
}

impl BridgeRuntime {
    /// Runtime that shells out to the real `gt` and `tmux`.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_runner(config, Arc::new(CommandRunner::new()))
    }

    /// Runtime whose one-shot commands go through `runner`.
    ///
    /// The activity feed is a long-lived child and always uses a real
    /// [`CommandRunner`].
    #[must_use]
    pub fn with_runner(config: BridgeConfig, runner: Arc<dyn Exec>) -> Self {
        let gt = GtGateway::with_binary(Arc::clone(&runner), &config.gt_root, &config.gt_binary);
        let tmux = TmuxGateway::with_binary(runner, &config.tmux_binary);
        let cache = CacheRegistry::new();
        let hub = Hub::new();
        let bus = EventBus::with_hub(hub.clone());
        let history = Arc::new(Mutex::new(MessageHistory::default()));

        let feed_command = config
            .feed_command
            .clone()
            .unwrap_or_else(|| gt.feed_command());
        let feed = ActivityFeed::new(
            feed_command,
            CommandRunner::new(),
            config.feed_restart_delay,
            bus.clone(),
            hub.clone(),
        );
        let status = StatusService::new(gt.clone(), tmux.clone(), cache.clone(), config.ttls);
        let agents = AgentService::new(
            gt.clone(),
            tmux.clone(),
            cache.clone(),
            config.ttls,
            bus.clone(),
            history,
            config.mayor_start_grace,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(RuntimeInner {
                config,
                gt,
                tmux,
                cache,
                hub,
                bus,
                feed,
                status,
                agents,
                shutdown,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn gt(&self) -> &GtGateway {
        &self.inner.gt
    }

    #[must_use]
    pub fn tmux(&self) -> &TmuxGateway {
        &self.inner.tmux
    }

    #[must_use]
    pub fn cache(&self) -> &CacheRegistry {
        &self.inner.cache
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    #[must_use]
    pub fn feed(&self) -> &ActivityFeed {
        &self.inner.feed
    }

    #[must_use]
    pub fn status(&self) -> &StatusService {
        &self.inner.status
    }

    #[must_use]
    pub fn agents(&self) -> &AgentService {
        &self.inner.agents
    }

    /// Register a WebSocket writer with the hub and start the feed if it is
    /// the first one.
    pub fn attach_connection(&self, sender: mpsc::Sender<Arc<str>>) -> Arc<Connection> {
        let (connection, _) = self.inner.hub.register(sender);
        self.inner.feed.reconcile();
        connection
    }

    /// Drop a connection; the feed stops with the last one.
    pub fn detach_connection(&self, id: ConnectionId) {
        self.inner.hub.unregister(id);
        self.inner.feed.reconcile();
    }

    /// `GET /api/health` body.
    #[must_use]
    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            connections: self.inner.hub.len(),
            cache_entries: self.inner.cache.len(),
            feed_running: self.inner.feed.is_running(),
        }
    }

    /// Ask the server and every WebSocket session to wind down.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        // Err means the sender is gone, which only happens once the runtime is
        // being dropped.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gt::FeedCommand;
    use crate::runner::args;
    use crate::testing::FakeRunner;
    use std::time::Duration;

    fn runtime() -> BridgeRuntime {
        let mut config = BridgeConfig::new("/town");
        config.feed_command = Some(FeedCommand {
            program: "sh".into(),
            args: args(&["-c", "sleep 30"]),
            cwd: None,
        });
        BridgeRuntime::with_runner(config, Arc::new(FakeRunner::new()))
    }

    #[tokio::test]
    async fn test_feed_follows_connections() {
        let runtime = runtime();
        assert!(!runtime.health().feed_running);

        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let first = runtime.attach_connection(tx1);
        let second = runtime.attach_connection(tx2);
        let health = runtime.health();
        assert_eq!(health.connections, 2);
        assert!(health.feed_running);

        runtime.detach_connection(first.id());
        assert!(runtime.feed().is_running());
        runtime.detach_connection(second.id());
        assert!(!runtime.feed().is_running());
        assert_eq!(runtime.health().connections, 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let runtime = runtime();
        let waiter = runtime.clone();
        let task = tokio::spawn(async move { waiter.shutdown_requested().await });

        assert!(!runtime.is_shutting_down());
        runtime.shutdown();
        assert!(runtime.is_shutting_down());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("timeout")
            .expect("join");
    }
}
