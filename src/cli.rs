//! Command-line interface for gt-bridge.

use crate::config::{BridgeConfig, DEFAULT_HOST, DEFAULT_PORT};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// HTTP + WebSocket bridge for a gt town.
#[derive(Debug, Parser)]
#[command(name = "gt-bridge", version, about)]
pub struct Cli {
    /// Town root; every gt command runs here. Defaults to ~/gt.
    #[arg(long, env = "GT_ROOT", global = true)]
    pub gt_root: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// The town root, falling back to `~/gt`.
    #[must_use]
    pub fn gt_root(&self) -> PathBuf {
        self.gt_root
            .clone()
            .unwrap_or_else(BridgeConfig::default_gt_root)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge server.
    Serve(ServeArgs),

    /// Connect to a running bridge and print the events it sends.
    Watch {
        /// WebSocket URL of the bridge.
        #[arg(long, default_value = "ws://127.0.0.1:7667/ws")]
        url: String,
    },

    /// Parse activity feed lines from stdin and print them as JSON lines.
    ParseFeed,

    /// Check that gt, tmux, and the town root are usable.
    Doctor,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "GASTOWN_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Comma-separated browser origins allowed by CORS (`*` for any).
    #[arg(long, env = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    /// Also allow the `null` origin.
    #[arg(long, env = "ALLOW_NULL_ORIGIN")]
    pub allow_null_origin: bool,
}

impl ServeArgs {
    /// Build the runtime configuration for a town at `gt_root`.
    #[must_use]
    pub fn into_config(self, gt_root: PathBuf) -> BridgeConfig {
        let mut config = BridgeConfig::new(gt_root);
        config.allowed_origins = match self.cors_origins.as_deref() {
            Some(list) => BridgeConfig::parse_origins(list),
            None => BridgeConfig::default_origins(self.port),
        };
        config.host = self.host;
        config.port = self.port;
        config.allow_null_origin = self.allow_null_origin;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["gt-bridge", "serve"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config(PathBuf::from("/town"));
        assert_eq!(config.gt_root, PathBuf::from("/town"));
        assert_eq!(config.ttls, crate::config::CacheTtls::default());
    }

    #[test]
    fn test_origins_follow_port() {
        let cli = Cli::try_parse_from(["gt-bridge", "serve", "--port", "9000"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config(PathBuf::from("/town"));
        assert_eq!(
            config.allowed_origins,
            vec!["http://localhost:9000", "http://127.0.0.1:9000"]
        );
    }

    #[test]
    fn test_explicit_origins() {
        let cli = Cli::try_parse_from([
            "gt-bridge",
            "serve",
            "--cors-origins",
            "http://a:1,http://b:2",
            "--allow-null-origin",
        ])
        .expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config(PathBuf::from("/town"));
        assert_eq!(config.allowed_origins, vec!["http://a:1", "http://b:2"]);
        assert!(config.allow_null_origin);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["gt-bridge", "doctor", "--gt-root", "/srv/town", "-v"])
            .expect("parse");
        assert!(cli.verbose);
        assert_eq!(cli.gt_root(), PathBuf::from("/srv/town"));
        assert!(matches!(cli.command, Command::Doctor));
    }
}
