//! `gt` CLI gateway.
//!
//! Every invocation runs with the town root as working directory. JSON output
//! is parsed leniently: a command that prints something other than JSON
//! still yields its raw text.

use crate::discovery::PolecatEntry;
use crate::runner::{CommandResult, Exec, ExecOptions, args};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const STATUS_TIMEOUT: Duration = Duration::from_secs(30);
const POLECAT_LIST_TIMEOUT: Duration = Duration::from_secs(10);
const NUDGE_TIMEOUT: Duration = Duration::from_secs(10);
const MAYOR_START_TIMEOUT: Duration = Duration::from_secs(30);

/// A command result together with its leniently parsed stdout.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonOutput {
    pub result: CommandResult,
    /// Trimmed stdout.
    pub raw: String,
    /// Stdout parsed as JSON, when it is JSON.
    pub data: Option<Value>,
}

impl From<CommandResult> for JsonOutput {
    fn from(result: CommandResult) -> Self {
        let raw = result.stdout_trimmed().to_string();
        let data = result.json();
        Self { result, raw, data }
    }
}

/// Description of a long-running command, started by the activity feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Typed `gt` wrapper over an [`Exec`].
#[derive(Clone)]
pub struct GtGateway {
    runner: Arc<dyn Exec>,
    gt_root: PathBuf,
    binary: String,
}

impl GtGateway {
    /// Create a gateway rooted at the given town directory.
    #[must_use]
    pub fn new(runner: Arc<dyn Exec>, gt_root: impl Into<PathBuf>) -> Self {
        Self::with_binary(runner, gt_root, "gt")
    }

    /// Create a gateway that invokes the given `gt` binary.
    #[must_use]
    pub fn with_binary(
        runner: Arc<dyn Exec>,
        gt_root: impl Into<PathBuf>,
        binary: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            gt_root: gt_root.into(),
            binary: binary.into(),
        }
    }

    /// The town root every command runs in.
    #[must_use]
    pub fn gt_root(&self) -> &Path {
        &self.gt_root
    }

    /// Run `gt <args>` in the town root.
    pub async fn exec(&self, args: &[String], options: ExecOptions) -> CommandResult {
        let options = ExecOptions {
            cwd: Some(options.cwd.unwrap_or_else(|| self.gt_root.clone())),
            ..options
        };
        self.runner.exec(&self.binary, args, options).await
    }

    /// `gt status --json --fast`.
    pub async fn status(&self) -> JsonOutput {
        self.exec(
            &args(&["status", "--json", "--fast"]),
            ExecOptions::default().timeout(STATUS_TIMEOUT),
        )
        .await
        .into()
    }

    /// `gt polecat list --all --json`.
    ///
    /// `None` only when the command failed. Output that is not a JSON array
    /// counts as an empty list.
    pub async fn polecat_list(&self) -> Option<Vec<PolecatEntry>> {
        let result = self
            .exec(
                &args(&["polecat", "list", "--all", "--json"]),
                ExecOptions::default().timeout(POLECAT_LIST_TIMEOUT),
            )
            .await;
        if !result.ok {
            debug!(error = ?result.error, "polecat list unavailable");
            return None;
        }
        match serde_json::from_str(result.stdout_trimmed()) {
            Ok(list) => Some(list),
            Err(e) => {
                debug!(error = %e, "polecat list is not a JSON array");
                Some(Vec::new())
            }
        }
    }

    /// `gt nudge <target> <message>`.
    pub async fn nudge(&self, target: &str, message: &str) -> CommandResult {
        self.exec(
            &args(&["nudge", target, message]),
            ExecOptions::default().timeout(NUDGE_TIMEOUT),
        )
        .await
    }

    /// `gt mayor start`.
    pub async fn start_mayor(&self) -> CommandResult {
        self.exec(
            &args(&["mayor", "start"]),
            ExecOptions::default().timeout(MAYOR_START_TIMEOUT),
        )
        .await
    }

    /// `gt --version`.
    pub async fn version(&self) -> CommandResult {
        self.exec(&args(&["--version"]), ExecOptions::default()).await
    }

    /// The `gt feed --plain --follow` command, run in the town root.
    #[must_use]
    pub fn feed_command(&self) -> FeedCommand {
        FeedCommand {
            program: self.binary.clone(),
            args: args(&["feed", "--plain", "--follow"]),
            cwd: Some(self.gt_root.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;

    fn gateway(runner: &Arc<FakeRunner>) -> GtGateway {
        GtGateway::new(Arc::clone(runner) as Arc<dyn Exec>, "/town")
    }

    #[tokio::test]
    async fn test_status_runs_in_town_root() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["gt", "status", "--json", "--fast"],
            CommandResult::success("{\"rigs\": []}\n"),
        );
        let output = gateway(&runner).status().await;
        assert!(output.result.ok);
        assert_eq!(output.data, Some(serde_json::json!({"rigs": []})));

        let calls = runner.calls();
        assert_eq!(calls[0].options.cwd.as_deref(), Some(Path::new("/town")));
        assert_eq!(calls[0].options.timeout, STATUS_TIMEOUT);
    }

    #[tokio::test]
    async fn test_status_keeps_raw_text() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["gt", "status"], CommandResult::success("Town: ok\n"));
        let output = gateway(&runner).status().await;
        assert_eq!(output.raw, "Town: ok");
        assert_eq!(output.data, None);
    }

    #[tokio::test]
    async fn test_polecat_list() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["gt", "polecat", "list"],
            CommandResult::success(
                r#"[{"rig":"tw","name":"alice","session_running":true},{"rig":"tw","name":"bob"}]"#,
            ),
        );
        let list = gateway(&runner).polecat_list().await.expect("list");
        assert_eq!(list.len(), 2);
        assert!(list[0].session_running);
        assert!(!list[1].session_running);
    }

    #[tokio::test]
    async fn test_polecat_list_unavailable() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["gt", "polecat"], CommandResult::exited(1, "", &[0]));
        assert!(gateway(&runner).polecat_list().await.is_none());
    }

    #[tokio::test]
    async fn test_polecat_list_garbage_is_empty() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["gt", "polecat"], CommandResult::success("not json"));
        let list = gateway(&runner).polecat_list().await.expect("list");
        assert!(list.is_empty());
    }

    #[test]
    fn test_feed_command() {
        let runner = Arc::new(FakeRunner::new());
        let feed = gateway(&runner).feed_command();
        assert_eq!(feed.program, "gt");
        assert_eq!(feed.args, vec!["feed", "--plain", "--follow"]);
        assert_eq!(feed.cwd.as_deref(), Some(Path::new("/town")));
    }
}
