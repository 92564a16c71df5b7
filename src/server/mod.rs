//! The bridge server.
//!
//! Serves the JSON API and the `/ws` event stream over HTTP. All state lives
//! in the [`BridgeRuntime`] handed to [`Server::bind`].

mod feed;
mod hub;
mod routes;

pub use feed::{ActivityFeed, DEFAULT_RESTART_DELAY};
pub use hub::{Connection, ConnectionId, Hub};
pub use routes::router;

use crate::runtime::BridgeRuntime;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// A bound, not yet running server.
pub struct Server {
    runtime: BridgeRuntime,
    listener: TcpListener,
}

impl Server {
    /// Bind the configured `host:port`. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(runtime: BridgeRuntime) -> Result<Self, ServerError> {
        let addr = runtime.config().addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self { runtime, listener })
    }

    /// The address actually bound.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Serve`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Serve)
    }

    /// Serve until [`BridgeRuntime::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Serve`] if accepting connections fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self { runtime, listener } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, root = %runtime.config().gt_root.display(), "Bridge listening");
        }

        let sweeper = runtime
            .cache()
            .spawn_sweeper(runtime.config().cache_sweep_interval);
        let app = router(runtime.clone());
        let stopping = runtime.clone();

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stopping.shutdown_requested().await })
            .await;

        sweeper.abort();
        runtime.feed().stop();
        info!("Bridge shut down");
        served.map_err(ServerError::Serve)
    }
}
