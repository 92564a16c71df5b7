//! Subprocess execution.
//!
//! Every call to an external tool goes through [`Exec`]. A failure of the
//! child (missing binary, timeout, unexpected exit code, runaway output) is
//! reported as data in [`CommandResult`], never as an `Err`.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Default time budget for a single command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on captured bytes, per stream.
pub const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;

/// Uniform outcome of running a command.
///
/// `ok` holds iff the process exited with a code from the caller's accepted
/// set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl CommandResult {
    /// A successful run (exit code 0) with the given stdout.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self::exited(0, stdout, &[0])
    }

    /// A run that exited with `code`, judged against `allowed`.
    #[must_use]
    pub fn exited(code: i32, stdout: impl Into<String>, allowed: &[i32]) -> Self {
        let ok = allowed.contains(&code);
        Self {
            ok,
            exit_code: Some(code),
            signal: None,
            stdout: stdout.into(),
            stderr: String::new(),
            error: (!ok).then(|| format!("exited with code {code}")),
        }
    }

    /// A run that never produced an exit code.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
        }
    }

    /// Stdout with surrounding whitespace removed.
    #[must_use]
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Stdout parsed as JSON, or `None` when it is empty or not JSON.
    #[must_use]
    pub fn json(&self) -> Option<Value> {
        let text = self.stdout_trimmed();
        if text.is_empty() {
            return None;
        }
        serde_json::from_str(text).ok()
    }
}

/// Per-call options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    /// Overrides layered over the runner's base environment.
    pub env: Vec<(String, String)>,
    pub allowed_exit_codes: Vec<i32>,
    pub max_output_bytes: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
            allowed_exit_codes: vec![0],
            max_output_bytes: DEFAULT_MAX_OUTPUT,
        }
    }
}

impl ExecOptions {
    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the time budget.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Replace the accepted exit-code set.
    #[must_use]
    pub fn allow_exit_codes(mut self, codes: &[i32]) -> Self {
        self.allowed_exit_codes = codes.to_vec();
        self
    }

    /// Set the per-stream output cap.
    #[must_use]
    pub const fn max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }
}

/// Runs external commands.
///
/// Object safe so gateways can hold an `Arc<dyn Exec>` and tests can swap in
/// a scripted fake.
pub trait Exec: Send + Sync {
    /// Run `command` with `args` to completion.
    fn exec<'a>(
        &'a self,
        command: &'a str,
        args: &'a [String],
        options: ExecOptions,
    ) -> BoxFuture<'a, CommandResult>;
}

/// Convert string slices into owned arguments.
#[must_use]
pub fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

/// Render a command line for logs and error messages.
#[must_use]
pub fn display_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

/// Why output collection stopped before the child exited.
enum CollectError {
    Io(std::io::Error),
    Overflow,
}

/// The real runner, backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    base_env: Vec<(String, String)>,
}

impl CommandRunner {
    /// Create a runner that passes the inherited environment through.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base_env: Vec::new(),
        }
    }

    /// Create a runner with extra environment applied to every command.
    #[must_use]
    pub const fn with_base_env(base_env: Vec<(String, String)>) -> Self {
        Self { base_env }
    }

    fn command(&self, command: &str, args: &[String], cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .envs(self.base_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Run a command to completion under the given options.
    pub async fn run(&self, command: &str, args: &[String], options: ExecOptions) -> CommandResult {
        let cmdline = display_command(command, args);
        debug!(command = %cmdline, cwd = ?options.cwd, "Executing");

        let mut cmd = self.command(command, args, options.cwd.as_deref());
        cmd.envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CommandResult::failure(format!("Command not found: {command}"));
            }
            Err(e) => return CommandResult::failure(format!("Failed to start {cmdline}: {e}")),
        };

        let collected = tokio::time::timeout(
            options.timeout,
            collect_output(&mut child, options.max_output_bytes),
        )
        .await;

        match collected {
            Ok(Ok((status, stdout, stderr))) => {
                from_status(status, stdout, stderr, &options.allowed_exit_codes, &cmdline)
            }
            Ok(Err(CollectError::Overflow)) => {
                kill_quietly(&mut child).await;
                warn!(command = %cmdline, max = options.max_output_bytes, "Output cap exceeded");
                CommandResult::failure(format!(
                    "Output exceeded {} bytes: {cmdline}",
                    options.max_output_bytes
                ))
            }
            Ok(Err(CollectError::Io(e))) => {
                kill_quietly(&mut child).await;
                CommandResult::failure(format!("Failed to read output of {cmdline}: {e}"))
            }
            Err(_) => {
                kill_quietly(&mut child).await;
                warn!(command = %cmdline, timeout_ms = options.timeout.as_millis(), "Command timed out");
                CommandResult::failure(format!(
                    "Command timed out after {}ms: {cmdline}",
                    options.timeout.as_millis()
                ))
            }
        }
    }

    /// Start a long-lived child with piped stdout/stderr.
    ///
    /// The child is killed when the returned handle is dropped.
    pub fn spawn_streaming(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> std::io::Result<Child> {
        debug!(command = %display_command(command, args), ?cwd, "Spawning streaming child");
        self.command(command, args, cwd).spawn()
    }
}

impl Exec for CommandRunner {
    fn exec<'a>(
        &'a self,
        command: &'a str,
        args: &'a [String],
        options: ExecOptions,
    ) -> BoxFuture<'a, CommandResult> {
        self.run(command, args, options).boxed()
    }
}

async fn collect_output(
    child: &mut Child,
    max: usize,
) -> Result<(ExitStatus, String, String), CollectError> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out, err) = tokio::try_join!(read_capped(stdout, max), read_capped(stderr, max))?;
    let status = child.wait().await.map_err(CollectError::Io)?;
    Ok((
        status,
        String::from_utf8_lossy(&out).into_owned(),
        String::from_utf8_lossy(&err).into_owned(),
    ))
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    max: usize,
) -> Result<Vec<u8>, CollectError> {
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.map_err(CollectError::Io)?;
        if n == 0 {
            return Ok(buf);
        }
        if buf.len() + n > max {
            return Err(CollectError::Overflow);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn kill_quietly(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill after abort failed");
    }
}

fn from_status(
    status: ExitStatus,
    stdout: String,
    stderr: String,
    allowed: &[i32],
    cmdline: &str,
) -> CommandResult {
    let exit_code = status.code();
    let signal = status
        .signal()
        .and_then(|sig| Signal::try_from(sig).ok())
        .map(|sig| sig.as_str().to_string());
    let ok = exit_code.is_some_and(|code| allowed.contains(&code));

    let error = if ok {
        None
    } else {
        let mut message = match (&exit_code, &signal) {
            (Some(0), _) => format!("Command exited 0 but 0 is not accepted: {cmdline}"),
            (Some(_), _) => format!("Command failed: {cmdline}"),
            (None, Some(sig)) => format!("Command killed by {sig}: {cmdline}"),
            (None, None) => format!("Command terminated abnormally: {cmdline}"),
        };
        let trimmed = stderr.trim();
        if !trimmed.is_empty() {
            message.push('\n');
            message.push_str(trimmed);
        }
        Some(message)
    };

    CommandResult {
        ok,
        exit_code,
        signal,
        stdout,
        stderr,
        error,
    }
}
