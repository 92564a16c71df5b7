//! Agent listing and session operations.

use crate::agent_path::{AgentPath, SESSION_PREFIX};
use crate::bus::EventBus;
use crate::cache::CacheRegistry;
use crate::config::CacheTtls;
use crate::discovery::{
    self, RunningSet, StatusSnapshot, find_agent_session, find_polecat_session, running_agents,
};
use crate::error::BridgeError;
use crate::gt::GtGateway;
use crate::history::{MessageEntry, MessageHistory, MessageStatus};
use crate::protocol::{
    ActionResponse, AgentOutput, MayorOutput, NudgeRequest, NudgeResponse, ServerMessage,
    ServiceStarted,
};
use crate::tmux::{TmuxGateway, parse_sessions};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Cache key of the agents overview.
pub const AGENTS_KEY: &str = "agents";

const MAYOR: &str = "mayor";

/// One row of the agents overview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummary {
    /// `rig/name` for rig agents, the hook's agent address for hooks.
    pub name: String,
    pub rig: String,
    pub role: Value,
    pub running: bool,
    pub has_work: Value,
    pub hook_bead: Value,
}

/// Listing, output capture, stop and nudge for agents.
#[derive(Clone)]
pub struct AgentService {
    gt: GtGateway,
    tmux: TmuxGateway,
    cache: CacheRegistry,
    ttls: CacheTtls,
    bus: EventBus,
    history: Arc<Mutex<MessageHistory>>,
    mayor_start_grace: Duration,
}

impl AgentService {
    #[must_use]
    pub const fn new(
        gt: GtGateway,
        tmux: TmuxGateway,
        cache: CacheRegistry,
        ttls: CacheTtls,
        bus: EventBus,
        history: Arc<Mutex<MessageHistory>>,
        mayor_start_grace: Duration,
    ) -> Self {
        Self {
            gt,
            tmux,
            cache,
            ttls,
            bus,
            history,
            mayor_start_grace,
        }
    }

    /// `{agents, polecats, runningPolecats}`, cached under [`AGENTS_KEY`].
    pub async fn list_agents(&self, refresh: bool) -> Result<Value, BridgeError> {
        if refresh {
            let overview = self.build_overview().await?;
            self.cache.set(AGENTS_KEY, overview.clone(), self.ttls.agents)?;
            return Ok(overview);
        }
        let service = self.clone();
        self.cache
            .get_or_execute(AGENTS_KEY, self.ttls.agents, move || async move {
                service.build_overview().await
            })
            .await
    }

    async fn build_overview(&self) -> Result<Value, BridgeError> {
        let (status, polecats) = tokio::join!(self.gt.status(), self.gt.polecat_list());
        if !status.result.ok {
            return Err(BridgeError::command_failed("gt status", &status.result));
        }
        let snapshot: StatusSnapshot = status
            .data
            .and_then(|data| serde_json::from_value(data).ok())
            .unwrap_or_default();

        let listing = if polecats.is_none() {
            self.tmux.list_sessions().await
        } else {
            String::new()
        };
        let running = running_agents(Some(&snapshot), polecats.as_deref(), &listing);
        Ok(overview(snapshot, &running))
    }

    /// Pane capture of `path`'s session.
    pub async fn agent_output(&self, path: &AgentPath, lines: usize) -> AgentOutput {
        let Some(session) = self.polecat_session(path).await else {
            return AgentOutput {
                session: format!("{}-{}", path.rig(), path.name()),
                output: None,
                running: false,
            };
        };
        let output = self.tmux.capture_pane(&session, lines).await;
        AgentOutput {
            running: output.is_some(),
            session,
            output,
        }
    }

    /// Kill `path`'s session. An agent that is not running is not an error.
    pub async fn stop_agent(&self, path: &AgentPath) -> Result<ActionResponse, BridgeError> {
        let Some(session) = self.polecat_session(path).await else {
            return Ok(ActionResponse {
                ok: true,
                message: format!("{path} was not running"),
            });
        };
        let outcome = self.tmux.kill_session(&session).await;
        if !outcome.ok {
            return Err(BridgeError::CommandFailed {
                command: format!("tmux kill-session -t {session}"),
                message: outcome
                    .error
                    .unwrap_or_else(|| format!("Failed to stop {path}")),
                hint: None,
            });
        }
        if !outcome.killed {
            return Ok(ActionResponse {
                ok: true,
                message: format!("{path} was not running"),
            });
        }
        info!(agent = %path, %session, "Stopped agent");
        self.bus.emit(&ServerMessage::AgentStopped(json!({
            "rig": path.rig(),
            "name": path.name(),
            "session": session,
        })));
        Ok(ActionResponse {
            ok: true,
            message: format!("Stopped {path}"),
        })
    }

    /// Send a message to an agent's session, starting the mayor if needed.
    pub async fn nudge(&self, request: NudgeRequest) -> Result<NudgeResponse, BridgeError> {
        let message = request
            .message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| BridgeError::InvalidInput("message is required".into()))?;
        let target = request.target.unwrap_or_else(|| MAYOR.to_string());
        let session = format!("{SESSION_PREFIX}-{target}");

        let mut auto_started = false;
        if !discovery::is_session_running(&self.tmux, &session).await {
            if target != MAYOR || !request.auto_start {
                let reason = format!("Session {session} not running");
                self.record(&target, &message, MessageStatus::Failed, Some(reason));
                let hint = format!("Start it first: gt {target} start");
                return Err(BridgeError::NotRunning { target, hint: Some(hint) });
            }

            let started = self.gt.start_mayor().await;
            if !started.ok {
                let reason = "Failed to auto-start Mayor".to_string();
                self.record(&target, &message, MessageStatus::Failed, Some(reason));
                return Err(BridgeError::command_failed("gt mayor start", &started)
                    .with_hint("Mayor not running and failed to auto-start"));
            }
            info!("Auto-started mayor");
            auto_started = true;
            tokio::time::sleep(self.mayor_start_grace).await;
            self.bus.emit(&ServerMessage::ServiceStarted(ServiceStarted {
                service: MAYOR.to_string(),
                auto_started: true,
            }));
        }

        let result = self.gt.nudge(&target, &message).await;
        if !result.ok {
            warn!(%target, error = ?result.error, "Nudge failed");
            self.record(&target, &message, MessageStatus::Failed, result.error.clone());
            return Err(BridgeError::command_failed("gt nudge", &result));
        }

        let status = if auto_started {
            MessageStatus::AutoStarted
        } else {
            MessageStatus::Sent
        };
        let entry = self.record(&target, &message, status, None);
        Ok(NudgeResponse {
            ok: true,
            target,
            message,
            was_auto_started: auto_started,
            message_id: entry.id,
        })
    }

    /// Mayor pane capture plus the ten most recent messages.
    pub async fn mayor_output(&self, lines: usize) -> MayorOutput {
        let status = self.status_snapshot().await;
        let session = match agent_session(status.as_ref(), MAYOR) {
            Some(session) => Some(session),
            None => find_agent_session(None, &self.tmux.list_sessions().await, MAYOR),
        };
        let output = match &session {
            Some(session) => self.tmux.capture_pane(session, lines).await,
            None => None,
        };
        MayorOutput {
            running: output.is_some(),
            session: session.unwrap_or_else(|| "hq-mayor".to_string()),
            output,
            recent_messages: self.recent_messages(10),
        }
    }

    /// Up to `limit` most recent messages, newest first.
    #[must_use]
    pub fn recent_messages(&self, limit: usize) -> Vec<MessageEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(limit)
    }

    fn record(
        &self,
        target: &str,
        message: &str,
        status: MessageStatus,
        response: Option<String>,
    ) -> MessageEntry {
        let entry = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(target, message, status, response);
        self.bus.emit(&ServerMessage::MayorMessage(entry.clone()));
        entry
    }

    async fn status_snapshot(&self) -> Option<StatusSnapshot> {
        let status = self.gt.status().await;
        status.data.and_then(|data| serde_json::from_value(data).ok())
    }

    /// Structured lookup first; the session listing only when that fails.
    /// In the listing, the conventional `gt-<rig>-<name>` beats a suffix match.
    async fn polecat_session(&self, path: &AgentPath) -> Option<String> {
        let status = self.status_snapshot().await;
        let (rig, name) = (path.rig().as_str(), path.name().as_str());
        if let Some(session) = find_polecat_session(status.as_ref(), "", rig, name) {
            return Some(session);
        }
        let listing = self.tmux.list_sessions().await;
        let conventional = path.session_name();
        if parse_sessions(&listing)
            .iter()
            .any(|record| record.name == conventional)
        {
            return Some(conventional);
        }
        find_polecat_session(None, &listing, rig, name)
    }
}

fn agent_session(status: Option<&StatusSnapshot>, name: &str) -> Option<String> {
    status.and_then(|s| discovery::agent_session_from_status(s, name))
}

fn extra(map: &serde_json::Map<String, Value>, key: &str) -> Value {
    map.get(key).cloned().unwrap_or(Value::Null)
}

/// Assemble `{agents, polecats, runningPolecats}` from a snapshot.
#[must_use]
pub fn overview(mut snapshot: StatusSnapshot, running: &RunningSet) -> Value {
    for agent in &mut snapshot.agents {
        if agent.running.is_none() {
            agent.running = Some(running.contains(agent.address.as_deref().unwrap_or_default()));
        }
    }

    let mut polecats: Vec<AgentSummary> = Vec::new();
    for rig in &snapshot.rigs {
        for agent in &rig.agents {
            polecats.push(AgentSummary {
                name: format!("{}/{}", rig.name, agent.name),
                rig: rig.name.clone(),
                role: extra(&agent.extra, "role"),
                running: agent.running.unwrap_or(false),
                has_work: agent.extra.get("has_work").cloned().unwrap_or(Value::Bool(false)),
                hook_bead: Value::Null,
            });
        }
        for hook in &rig.hooks {
            if polecats.iter().any(|p| p.name == hook.agent) {
                continue;
            }
            polecats.push(AgentSummary {
                name: hook.agent.clone(),
                rig: rig.name.clone(),
                role: extra(&hook.extra, "role"),
                running: running.contains(&hook.agent),
                has_work: extra(&hook.extra, "has_work"),
                hook_bead: extra(&hook.extra, "hook_bead"),
            });
        }
    }

    json!({
        "agents": snapshot.agents,
        "polecats": polecats,
        "runningPolecats": running.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandResult, Exec};
    use crate::testing::FakeRunner;

    fn service(runner: &Arc<FakeRunner>, bus: EventBus) -> AgentService {
        let exec = Arc::clone(runner) as Arc<dyn Exec>;
        AgentService::new(
            GtGateway::new(Arc::clone(&exec), "/town"),
            TmuxGateway::new(exec),
            CacheRegistry::new(),
            CacheTtls::default(),
            bus,
            Arc::new(Mutex::new(MessageHistory::default())),
            Duration::ZERO,
        )
    }

    const STATUS: &str = r#"{
        "agents": [{"name": "mayor", "address": "mayor/", "session": "hq-mayor"}],
        "rigs": [{
            "name": "tw",
            "agents": [{"name": "witness", "address": "tw/witness", "session": "tw-witness", "running": true, "role": "witness"}],
            "hooks": [{"agent": "tw/witness"}, {"agent": "tw/alice", "role": "polecat", "has_work": true, "hook_bead": "tw-42"}]
        }]
    }"#;

    #[tokio::test]
    async fn test_list_agents_overview() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["gt", "status"], CommandResult::success(STATUS));
        runner.respond(
            &["gt", "polecat", "list"],
            CommandResult::success(r#"[{"rig":"tw","name":"alice","session_running":true}]"#),
        );
        let overview = service(&runner, EventBus::new())
            .list_agents(false)
            .await
            .expect("overview");

        let polecats = overview["polecats"].as_array().expect("polecats");
        assert_eq!(polecats.len(), 2);
        assert_eq!(polecats[0]["name"], "tw/witness");
        assert_eq!(polecats[0]["role"], "witness");
        assert_eq!(polecats[0]["has_work"], false);
        assert_eq!(polecats[1]["name"], "tw/alice");
        assert_eq!(polecats[1]["running"], true);
        assert_eq!(polecats[1]["hook_bead"], "tw-42");
        assert_eq!(overview["agents"][0]["running"], false);
        assert_eq!(overview["runningPolecats"], json!(["tw/alice", "tw/witness"]));
    }

    #[tokio::test]
    async fn test_agent_output_uses_derived_session() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["gt", "status"], CommandResult::success(STATUS));
        runner.respond(
            &["tmux", "capture-pane", "-t", "tw-alice"],
            CommandResult::success("working\n"),
        );
        let path = AgentPath::new("tw", "alice").expect("path");
        let output = service(&runner, EventBus::new()).agent_output(&path, 50).await;
        assert_eq!(output.session, "tw-alice");
        assert_eq!(output.output.as_deref(), Some("working"));
        assert!(output.running);
    }

    #[tokio::test]
    async fn test_agent_output_prefers_conventional_session() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["tmux", "ls"],
            CommandResult::success(
                "gt-zz-alice: 1 windows (created today)\ngt-tw-alice: 1 windows (created today)\n",
            ),
        );
        runner.respond(
            &["tmux", "capture-pane", "-t", "gt-tw-alice"],
            CommandResult::success("hi\n"),
        );
        let path = AgentPath::new("tw", "alice").expect("path");
        let output = service(&runner, EventBus::new()).agent_output(&path, 50).await;
        assert_eq!(output.session, "gt-tw-alice");
        assert_eq!(output.output.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_agent_output_without_session() {
        let runner = Arc::new(FakeRunner::new());
        let path = AgentPath::new("zz", "ghost").expect("path");
        let output = service(&runner, EventBus::new()).agent_output(&path, 50).await;
        assert_eq!(output.session, "zz-ghost");
        assert!(!output.running);
        assert_eq!(output.output, None);
    }

    #[tokio::test]
    async fn test_stop_not_running_is_success() {
        let runner = Arc::new(FakeRunner::new());
        let path = AgentPath::new("zz", "ghost").expect("path");
        let response = service(&runner, EventBus::new())
            .stop_agent(&path)
            .await
            .expect("stop");
        assert_eq!(response.message, "zz/ghost was not running");
    }

    #[tokio::test]
    async fn test_stop_emits_agent_stopped() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["gt", "status"], CommandResult::success(STATUS));
        runner.respond(&["tmux", "kill-session", "-t", "tw-alice"], CommandResult::success(""));
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(crate::protocol::MessageKind::AgentStopped, move |m| {
            sink.lock().expect("lock").push(m.clone());
        });

        let path = AgentPath::new("tw", "alice").expect("path");
        let response = service(&runner, bus).stop_agent(&path).await.expect("stop");
        assert_eq!(response.message, "Stopped tw/alice");
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_nudge_requires_message() {
        let runner = Arc::new(FakeRunner::new());
        let err = service(&runner, EventBus::new())
            .nudge(NudgeRequest { target: None, message: Some("  ".into()), auto_start: true })
            .await
            .expect_err("invalid");
        assert_eq!(err.category().as_str(), "invalid_input");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_nudge_target_not_running() {
        let runner = Arc::new(FakeRunner::new());
        let service = service(&runner, EventBus::new());
        let err = service
            .nudge(NudgeRequest {
                target: Some("tw/witness".into()),
                message: Some("wake up".into()),
                auto_start: true,
            })
            .await
            .expect_err("not running");
        assert_eq!(err.category().as_str(), "not_running");
        assert!(err.hint().is_some());

        let history = service.recent_messages(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MessageStatus::Failed);
        assert_eq!(history[0].response.as_deref(), Some("Session gt-tw/witness not running"));
    }

    #[tokio::test]
    async fn test_nudge_auto_starts_mayor() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["gt", "mayor", "start"], CommandResult::success("started"));
        runner.respond(&["gt", "nudge", "mayor"], CommandResult::success(""));
        let bus = EventBus::new();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        let _sub = bus.subscribe_any(move |m| sink.lock().expect("lock").push(m.kind()));

        let service = service(&runner, bus);
        let response = service
            .nudge(NudgeRequest { target: None, message: Some("status?".into()), auto_start: true })
            .await
            .expect("nudge");
        assert!(response.was_auto_started);
        assert_eq!(response.target, "mayor");

        let history = service.recent_messages(10);
        assert_eq!(history[0].status, MessageStatus::AutoStarted);
        assert_eq!(history[0].id, response.message_id);
        assert_eq!(
            *kinds.lock().expect("lock"),
            vec![
                crate::protocol::MessageKind::ServiceStarted,
                crate::protocol::MessageKind::MayorMessage
            ]
        );
    }

    #[tokio::test]
    async fn test_nudge_running_session() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["tmux", "has-session", "-t", "gt-mayor"], CommandResult::success(""));
        runner.respond(&["gt", "nudge"], CommandResult::exited(1, "", &[0]));
        let service = service(&runner, EventBus::new());
        let err = service
            .nudge(NudgeRequest { target: None, message: Some("hi".into()), auto_start: false })
            .await
            .expect_err("nudge failed");
        assert_eq!(err.category().as_str(), "command_failed");
        assert_eq!(runner.call_count(&["gt", "mayor"]), 0);
        assert_eq!(service.recent_messages(10)[0].status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn test_mayor_output() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["gt", "status"], CommandResult::success(STATUS));
        runner.respond(&["tmux", "capture-pane", "-t", "hq-mayor"], CommandResult::success("ready\n"));
        let output = service(&runner, EventBus::new()).mayor_output(100).await;
        assert_eq!(output.session, "hq-mayor");
        assert!(output.running);
        assert_eq!(output.output.as_deref(), Some("ready"));
    }
}
