//! Runtime configuration.

use crate::gt::FeedCommand;
use std::path::PathBuf;
use std::time::Duration;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 7667;

/// Default listen host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Cache lifetimes per key family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub status: Duration,
    pub agents: Duration,
    pub rig_config: Duration,
    /// Lifetime of a "rig has no config file" result.
    pub missing_rig_config: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            status: Duration::from_secs(5),
            agents: Duration::from_secs(15),
            rig_config: Duration::from_secs(300),
            missing_rig_config: Duration::from_secs(60),
        }
    }
}

/// Everything the bridge runtime needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Town root: working directory for every `gt` call.
    pub gt_root: PathBuf,
    pub gt_binary: String,
    pub tmux_binary: String,
    /// Browser origins allowed by CORS. `*` allows any.
    pub allowed_origins: Vec<String>,
    /// Allow the `null` origin (file:// pages, sandboxed iframes).
    pub allow_null_origin: bool,
    pub ttls: CacheTtls,
    pub feed_restart_delay: Duration,
    pub cache_sweep_interval: Duration,
    /// Pause after auto-starting the mayor before nudging it.
    pub mayor_start_grace: Duration,
    /// Replaces `gt feed --plain --follow` when set.
    pub feed_command: Option<FeedCommand>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(Self::default_gt_root())
    }
}

impl BridgeConfig {
    /// Defaults for a town rooted at `gt_root`.
    #[must_use]
    pub fn new(gt_root: impl Into<PathBuf>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            gt_root: gt_root.into(),
            gt_binary: "gt".to_string(),
            tmux_binary: "tmux".to_string(),
            allowed_origins: Self::default_origins(DEFAULT_PORT),
            allow_null_origin: false,
            ttls: CacheTtls::default(),
            feed_restart_delay: Duration::from_secs(5),
            cache_sweep_interval: Duration::from_secs(60),
            mayor_start_grace: Duration::from_secs(2),
            feed_command: None,
        }
    }

    /// `$HOME/gt`, or `./gt` when there is no home directory.
    #[must_use]
    pub fn default_gt_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gt")
    }

    /// The localhost origins a dashboard served by the bridge uses.
    #[must_use]
    pub fn default_origins(port: u16) -> Vec<String> {
        vec![
            format!("http://localhost:{port}"),
            format!("http://127.0.0.1:{port}"),
        ]
    }

    /// Parse a comma-separated origin list, ignoring blanks.
    #[must_use]
    pub fn parse_origins(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// `host:port`.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
