//! gt-bridge: HTTP + WebSocket bridge for a gt town

use clap::Parser;
use gt_bridge::{
    BridgeRuntime, Cli, Command, CommandRunner, ConnectionManager, ConnectionStatus, Server,
    WsConnector, parse_activity_line,
};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over -v.
    let default_filter = if cli.verbose {
        "gt_bridge=debug"
    } else {
        "gt_bridge=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let gt_root = cli.gt_root();
    let result = match cli.command {
        Command::Serve(args) => run_server(args.into_config(gt_root)).await,
        Command::Watch { url } => run_watch(&url).await,
        Command::ParseFeed => run_parse_feed().await,
        Command::Doctor => run_doctor(&gt_root).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(config: gt_bridge::BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = BridgeRuntime::new(config);
    let server = Server::bind(runtime.clone()).await?;

    let stopping = runtime.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
        }
        stopping.shutdown();
    });

    server.run().await?;
    Ok(())
}

async fn run_watch(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConnectionManager::new(Arc::new(WsConnector::new(url)?));
    let mut messages = manager.stores().subscribe();
    let mut status = manager.watch_status();
    let _guard = manager.acquire();

    loop {
        tokio::select! {
            received = messages.recv() => match received {
                Ok(message) => println!("{}", message.encode()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Output fell behind, skipped messages");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = *status.borrow_and_update();
                info!(status = ?current, attempt = manager.attempt(), "Connection status");
                if current == ConnectionStatus::Error {
                    return Err(format!("Could not reach {url}").into());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn run_parse_feed() -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(event) = parse_activity_line(&line) {
            println!("{}", serde_json::to_string(&event)?);
        }
    }
    Ok(())
}

async fn run_doctor(gt_root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let runner: Arc<dyn gt_bridge::Exec> = Arc::new(CommandRunner::new());
    let gt = gt_bridge::GtGateway::new(Arc::clone(&runner), gt_root);
    let tmux = gt_bridge::TmuxGateway::new(runner);
    let mut all_ok = true;

    print!("Town root: {} ", gt_root.display());
    if gt_root.is_dir() {
        println!("[OK]");
    } else {
        println!("[FAIL] not a directory");
        all_ok = false;
    }

    print!("gt: ");
    if gt_root.is_dir() {
        let version = gt.version().await;
        if version.ok {
            println!("[OK] {}", version.stdout_trimmed());
        } else {
            println!("[FAIL] {}", version.error.unwrap_or_default());
            all_ok = false;
        }
    } else {
        println!("[FAIL] skipped, no town root");
        all_ok = false;
    }

    print!("tmux: ");
    match tmux.version().await {
        Some(version) => println!("[OK] {version}"),
        None => {
            println!("[FAIL] tmux not available");
            all_ok = false;
        }
    }

    println!();
    if all_ok {
        println!("All checks passed!");
        Ok(())
    } else {
        Err("Some checks failed".into())
    }
}
