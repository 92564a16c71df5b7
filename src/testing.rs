//! Test support: a scripted command runner and a bridge harness.
//!
//! ```ignore
//! let runner = Arc::new(FakeRunner::new());
//! runner.respond(&["gt", "status"], CommandResult::success(r#"{"rigs": []}"#));
//!
//! let bridge = TestBridge::start(Arc::clone(&runner)).await?;
//! let (ws, _) = tokio_tungstenite::connect_async(bridge.ws_url()).await?;
//! ```

use crate::config::BridgeConfig;
use crate::gt::FeedCommand;
use crate::runner::{CommandResult, Exec, ExecOptions, args};
use crate::runtime::BridgeRuntime;
use crate::server::Server;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Errors from the test harness.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("server error: {0}")]
    Server(#[from] crate::server::ServerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One call observed by [`FakeRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub command: String,
    pub args: Vec<String>,
    pub options: ExecOptions,
}

impl RecordedCall {
    /// Command followed by its arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

struct Script {
    prefix: Vec<String>,
    result: CommandResult,
    once: bool,
}

impl Script {
    fn matches(&self, argv: &[&str]) -> bool {
        self.prefix.len() <= argv.len() && self.prefix.iter().zip(argv).all(|(p, a)| p == a)
    }
}

/// An [`Exec`] that answers from a script instead of spawning processes.
///
/// Scripts match on a prefix of `[command, args...]`; the first match wins.
/// Unscripted calls fail as if the binary were missing.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<Vec<Script>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call take `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer calls starting with `prefix` with `result`, indefinitely.
    pub fn respond(&self, prefix: &[&str], result: CommandResult) {
        self.script(prefix, result, false);
    }

    /// Answer the next call starting with `prefix` with `result`.
    pub fn respond_once(&self, prefix: &[&str], result: CommandResult) {
        self.script(prefix, result, true);
    }

    fn script(&self, prefix: &[&str], result: CommandResult, once: bool) {
        lock(&self.scripts).push(Script {
            prefix: args(prefix),
            result,
            once,
        });
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls whose argv starts with `prefix`.
    #[must_use]
    pub fn call_count(&self, prefix: &[&str]) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| {
                let argv = call.argv();
                prefix.len() <= argv.len() && prefix.iter().zip(&argv).all(|(p, a)| p == a)
            })
            .count()
    }

    fn answer(&self, argv: &[&str], allowed: &[i32]) -> CommandResult {
        let mut scripts = lock(&self.scripts);
        let Some(index) = scripts.iter().position(|script| script.matches(argv)) else {
            return CommandResult::failure(format!("Command not found: {}", argv.join(" ")));
        };
        let result = if scripts[index].once {
            scripts.remove(index).result
        } else {
            scripts[index].result.clone()
        };
        drop(scripts);
        rejudge(result, allowed)
    }
}

/// Apply the caller's accepted exit codes to a scripted result.
fn rejudge(mut result: CommandResult, allowed: &[i32]) -> CommandResult {
    if let Some(code) = result.exit_code {
        result.ok = allowed.contains(&code);
        if result.ok {
            result.error = None;
        } else if result.error.is_none() {
            result.error = Some(format!("exited with code {code}"));
        }
    }
    result
}

impl Exec for FakeRunner {
    fn exec<'a>(
        &'a self,
        command: &'a str,
        args: &'a [String],
        options: ExecOptions,
    ) -> BoxFuture<'a, CommandResult> {
        async move {
            let allowed = options.allowed_exit_codes.clone();
            lock(&self.calls).push(RecordedCall {
                command: command.to_string(),
                args: args.to_vec(),
                options,
            });
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let argv: Vec<&str> = std::iter::once(command)
                .chain(args.iter().map(String::as_str))
                .collect();
            self.answer(&argv, &allowed)
        }
        .boxed()
    }
}

/// A bridge server on an ephemeral localhost port, driven by a [`FakeRunner`].
///
/// The activity feed runs `sh -c 'sleep 3600'` unless configured otherwise.
pub struct TestBridge {
    runtime: BridgeRuntime,
    runner: Arc<FakeRunner>,
    addr: SocketAddr,
    root: PathBuf,
    server_handle: JoinHandle<()>,
}

impl TestBridge {
    /// Start with the default test configuration.
    ///
    /// # Errors
    ///
    /// Fails if the server cannot bind.
    pub async fn start(runner: Arc<FakeRunner>) -> Result<Self, TestError> {
        Self::start_with(runner, |_| {}).await
    }

    /// Start after letting `configure` adjust the test configuration.
    ///
    /// # Errors
    ///
    /// Fails if the town directory cannot be created or the server cannot bind.
    pub async fn start_with(
        runner: Arc<FakeRunner>,
        configure: impl FnOnce(&mut BridgeConfig),
    ) -> Result<Self, TestError> {
        let root = Self::unique_root();
        std::fs::create_dir_all(&root)?;

        let mut config = BridgeConfig::new(&root);
        config.port = 0;
        config.mayor_start_grace = Duration::ZERO;
        config.feed_restart_delay = Duration::from_millis(100);
        config.feed_command = Some(Self::sh_feed("sleep 3600"));
        configure(&mut config);

        let runtime = BridgeRuntime::with_runner(config, Arc::clone(&runner) as Arc<dyn Exec>);
        let server = Server::bind(runtime.clone()).await?;
        let addr = server.local_addr()?;
        let server_handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        Ok(Self {
            runtime,
            runner,
            addr,
            root,
            server_handle,
        })
    }

    /// A feed command running `script` under `sh -c`.
    #[must_use]
    pub fn sh_feed(script: &str) -> FeedCommand {
        FeedCommand {
            program: "sh".to_string(),
            args: args(&["-c", script]),
            cwd: None,
        }
    }

    fn unique_root() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        std::env::temp_dir().join(format!("gt-bridge-test-{pid}-{id}"))
    }

    /// `http://<addr><path>`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// `ws://<addr>/ws`.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn runtime(&self) -> &BridgeRuntime {
        &self.runtime
    }

    #[must_use]
    pub const fn runner(&self) -> &Arc<FakeRunner> {
        &self.runner
    }

    /// The temporary town root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Poll `condition` every 10ms until it holds or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Timeout`] if the condition never held.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        condition: impl Fn(&BridgeRuntime) -> bool,
    ) -> Result<(), TestError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition(&self.runtime) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if condition(&self.runtime) {
            Ok(())
        } else {
            Err(TestError::Timeout)
        }
    }

    /// Stop the server and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.runtime.shutdown();
        let handle = std::mem::replace(&mut self.server_handle, tokio::spawn(async {}));
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}

impl Drop for TestBridge {
    fn drop(&mut self) {
        self.runtime.shutdown();
        self.runtime.feed().stop();
        self.server_handle.abort();
        std::fs::remove_dir_all(&self.root).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_runner_prefix_and_once() {
        let runner = FakeRunner::new();
        runner.respond_once(&["gt", "status"], CommandResult::success("first"));
        runner.respond(&["gt"], CommandResult::success("any"));

        let status = runner
            .exec("gt", &args(&["status", "--json"]), ExecOptions::default())
            .await;
        assert_eq!(status.stdout, "first");
        let again = runner
            .exec("gt", &args(&["status"]), ExecOptions::default())
            .await;
        assert_eq!(again.stdout, "any");
        let missing = runner.exec("tmux", &args(&["ls"]), ExecOptions::default()).await;
        assert!(!missing.ok);
        assert_eq!(runner.call_count(&["gt"]), 2);
        assert_eq!(runner.calls()[2].argv(), vec!["tmux", "ls"]);
    }

    #[tokio::test]
    async fn test_fake_runner_rejudges_exit_codes() {
        let runner = FakeRunner::new();
        runner.respond(&["tmux", "ls"], CommandResult::exited(1, "", &[0]));
        let listed = runner
            .exec("tmux", &args(&["ls"]), ExecOptions::default().allow_exit_codes(&[0, 1]))
            .await;
        assert!(listed.ok);
        assert_eq!(listed.error, None);

        let strict = runner.exec("tmux", &args(&["ls"]), ExecOptions::default()).await;
        assert!(!strict.ok);
        assert_eq!(strict.error.as_deref(), Some("exited with code 1"));
    }

    #[tokio::test]
    async fn test_bridge_serves_and_shuts_down() {
        let bridge = TestBridge::start(Arc::new(FakeRunner::new()))
            .await
            .expect("start");
        assert!(bridge.root().is_dir());
        assert!(bridge.url("/api/health").starts_with("http://127.0.0.1:"));

        let stream = tokio::net::TcpStream::connect(bridge.addr()).await;
        assert!(stream.is_ok());
        bridge.shutdown().await;
    }
}
