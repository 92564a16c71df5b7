//! gt-bridge: HTTP + WebSocket bridge for a gt town
//!
//! Wraps the `gt` and `tmux` command-line tools behind a cached JSON API and
//! streams town activity to browser dashboards over WebSocket.

pub mod activity;
pub mod agent_path;
pub mod agents;
pub mod bus;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gt;
pub mod history;
pub mod protocol;
pub mod runner;
pub mod runtime;
pub mod server;
pub mod status;
pub mod testing;
pub mod tmux;

pub use activity::{ActivityEvent, ActivityKind, parse_activity_line};
pub use agent_path::{AgentPath, PathError, SafeSegment};
pub use agents::AgentService;
pub use bus::{EventBus, Subscription};
pub use cache::{CacheError, CacheRegistry};
pub use cli::{Cli, Command};
pub use client::{
    Backoff, ClientError, ConnectionManager, ConnectionStatus, Connector, Stores, WsConnector,
};
pub use config::BridgeConfig;
pub use error::{BridgeError, ErrorCategory};
pub use gt::GtGateway;
pub use history::{MessageEntry, MessageHistory, MessageStatus};
pub use protocol::{MessageKind, ServerMessage};
pub use runner::{CommandResult, CommandRunner, Exec, ExecOptions};
pub use runtime::BridgeRuntime;
pub use server::{Server, ServerError};
pub use status::StatusService;
pub use testing::{FakeRunner, TestBridge, TestError};
pub use tmux::TmuxGateway;
