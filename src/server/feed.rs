//! Activity feed supervisor.
//!
//! Runs `gt feed --plain --follow` while at least one WebSocket client is
//! connected, turns each line into an `activity` message, and restarts the
//! child after a delay if it exits while clients remain.

use super::hub::Hub;
use crate::activity::parse_activity_line;
use crate::bus::EventBus;
use crate::gt::FeedCommand;
use crate::protocol::ServerMessage;
use crate::runner::{CommandRunner, display_command};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default delay before restarting an exited feed.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Owns the feed child's supervisor task.
pub struct ActivityFeed {
    command: FeedCommand,
    runner: CommandRunner,
    restart_delay: Duration,
    bus: EventBus,
    hub: Hub,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityFeed {
    /// Create a stopped feed. Lines are published on `bus`; `hub` decides
    /// whether anyone is listening.
    #[must_use]
    pub const fn new(
        command: FeedCommand,
        runner: CommandRunner,
        restart_delay: Duration,
        bus: EventBus,
        hub: Hub,
    ) -> Self {
        Self {
            command,
            runner,
            restart_delay,
            bus,
            hub,
            task: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start or stop the feed to match whether the hub has connections.
    ///
    /// Callers invoke this after every register/unregister; the decision is
    /// made under the feed's lock so interleaved calls settle on the state
    /// the last one observed. Returns whether the feed is running afterwards.
    pub fn reconcile(&self) -> bool {
        let mut task = self.lock();
        let running = task.as_ref().is_some_and(|handle| !handle.is_finished());
        let wanted = !self.hub.is_empty();

        match (running, wanted) {
            (false, true) => {
                info!(command = %display_command(&self.command.program, &self.command.args), "Starting activity feed");
                *task = Some(tokio::spawn(supervise(
                    self.command.clone(),
                    self.runner.clone(),
                    self.restart_delay,
                    self.bus.clone(),
                    self.hub.clone(),
                )));
                true
            }
            (true, false) => {
                if let Some(handle) = task.take() {
                    handle.abort();
                }
                info!("Stopped activity feed");
                false
            }
            _ => running,
        }
    }

    /// Stop unconditionally.
    pub fn stop(&self) {
        if let Some(handle) = self.lock().take() {
            handle.abort();
            info!("Stopped activity feed");
        }
    }

    /// Whether the supervisor task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ActivityFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn supervise(
    command: FeedCommand,
    runner: CommandRunner,
    restart_delay: Duration,
    bus: EventBus,
    hub: Hub,
) {
    loop {
        match runner.spawn_streaming(&command.program, &command.args, command.cwd.as_deref()) {
            Ok(child) => {
                let code = pump(child, &bus).await;
                info!(?code, "Activity feed exited");
            }
            Err(e) => warn!(error = %e, program = %command.program, "Failed to start activity feed"),
        }

        if hub.is_empty() {
            break;
        }
        debug!(delay_ms = restart_delay.as_millis(), "Restarting activity feed");
        tokio::time::sleep(restart_delay).await;
        if hub.is_empty() {
            break;
        }
    }
}

/// Forward parsed stdout lines until EOF; returns the exit code.
async fn pump(mut child: Child, bus: &EventBus) -> Option<i32> {
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    warn!(line = %line.trim(), "Activity feed stderr");
                }
            }
        });
    }

    if let Some(stdout) = child.stdout.take() {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    match parse_activity_line(&line) {
                        Some(event) => bus.emit(&ServerMessage::Activity(event)),
                        None => debug!(line = %line.trim_end(), "Dropping unparsed feed line"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Activity feed read error");
                    break;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "Failed to reap activity feed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::args;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn sh_feed(script: &str) -> FeedCommand {
        FeedCommand {
            program: "sh".into(),
            args: args(&["-c", script]),
            cwd: None,
        }
    }

    fn feed(script: &str, hub: &Hub, restart: Duration) -> ActivityFeed {
        ActivityFeed::new(
            sh_feed(script),
            CommandRunner::new(),
            restart,
            EventBus::with_hub(hub.clone()),
            hub.clone(),
        )
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Arc<str>>) -> String {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("frame")
            .to_string()
    }

    #[tokio::test]
    async fn test_runs_only_with_connections() {
        let hub = Hub::new();
        let feed = feed(
            "printf 'noise\\n[12:00:00] + tw/b-1 created · x\\n'; sleep 30",
            &hub,
            DEFAULT_RESTART_DELAY,
        );
        assert!(!feed.reconcile());

        let (tx, mut rx) = mpsc::channel(16);
        let (conn, _) = hub.register(tx);
        assert!(feed.reconcile());
        assert!(feed.reconcile());

        let frame = next_frame(&mut rx).await;
        assert!(frame.contains("\"type\":\"activity\""));
        assert!(frame.contains("tw/b-1"));

        hub.unregister(conn.id());
        assert!(!feed.reconcile());
        assert!(!feed.is_running());
    }

    #[tokio::test]
    async fn test_restarts_after_exit_while_clients_remain() {
        let hub = Hub::new();
        let feed = feed(
            "printf '[12:00:00] ⚡ tw/alice nudged\\n'",
            &hub,
            Duration::from_millis(50),
        );
        let (tx, mut rx) = mpsc::channel(16);
        hub.register(tx);
        feed.reconcile();

        let first = next_frame(&mut rx).await;
        let second = next_frame(&mut rx).await;
        assert!(first.contains("agent_nudged"));
        assert!(second.contains("agent_nudged"));
        feed.stop();
        assert!(!feed.is_running());
    }

    #[tokio::test]
    async fn test_supervisor_ends_when_hub_empties() {
        let hub = Hub::new();
        let feed = feed("exit 0", &hub, Duration::from_millis(10));
        let (tx, _rx) = mpsc::channel(1);
        let (conn, _) = hub.register(tx);
        feed.reconcile();
        hub.unregister(conn.id());

        timeout(Duration::from_secs(5), async {
            while feed.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("supervisor should exit");
    }
}
