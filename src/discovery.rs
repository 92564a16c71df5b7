//! Agent and session discovery.
//!
//! Three sources say which agents are alive: the `gt status` snapshot, the
//! polecat list, and the raw `tmux ls` listing. The first two are structured
//! and authoritative. The listing is parsed by naming convention and only
//! consulted when the structured sources cannot answer.

use crate::agent_path::SESSION_PREFIX;
use crate::tmux::{TmuxGateway, parse_sessions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// An agent entry in the status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A hook (agent with attached work) in a rig.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookStatus {
    #[serde(default)]
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A rig in the status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RigStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub agents: Vec<AgentStatus>,
    #[serde(default)]
    pub hooks: Vec<HookStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `gt status --json` document. Fields the bridge does not interpret
/// pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub agents: Vec<AgentStatus>,
    #[serde(default)]
    pub rigs: Vec<RigStatus>,
    #[serde(rename = "runningPolecats", default)]
    pub running_polecats: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusSnapshot {
    /// Names of every rig in the snapshot.
    #[must_use]
    pub fn rig_names(&self) -> Vec<&str> {
        self.rigs
            .iter()
            .map(|rig| rig.name.as_str())
            .filter(|name| !name.is_empty())
            .collect()
    }
}

/// One entry of `gt polecat list --json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolecatEntry {
    #[serde(default)]
    pub rig: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub session_running: bool,
}

/// Rig and agent recovered from a session name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub rig: String,
    pub name: String,
}

impl AgentRef {
    /// `rig/name`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}", self.rig, self.name)
    }
}

/// Set of running agent paths (`rig/name`), kept sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningSet(BTreeSet<String>);

impl RunningSet {
    /// Add a path, ignoring a trailing slash.
    pub fn insert(&mut self, path: &str) {
        let path = path.trim_end_matches('/');
        if !path.is_empty() {
            self.0.insert(path.to_string());
        }
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path.trim_end_matches('/'))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorted paths.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

/// Recover `{rig, name}` from a `gt-<rig>-<name>` session name.
///
/// Known rig names are tried longest first, so a rig called `foo-bar` wins
/// over `foo`. Without a matching rig the last hyphen splits rig from agent.
#[must_use]
pub fn parse_session_name<S: AsRef<str>>(session: &str, rigs: &[S]) -> Option<AgentRef> {
    let rest = session.strip_prefix(SESSION_PREFIX)?.strip_prefix('-')?;

    let mut candidates: Vec<&str> = rigs
        .iter()
        .map(AsRef::as_ref)
        .filter(|rig| !rig.is_empty())
        .collect();
    candidates.sort_by_key(|rig| std::cmp::Reverse(rig.len()));

    for rig in candidates {
        if let Some(name) = rest.strip_prefix(rig).and_then(|r| r.strip_prefix('-'))
            && !name.is_empty()
        {
            return Some(AgentRef {
                rig: rig.to_string(),
                name: name.to_string(),
            });
        }
    }

    let (rig, name) = rest.rsplit_once('-')?;
    (!rig.is_empty() && !name.is_empty()).then(|| AgentRef {
        rig: rig.to_string(),
        name: name.to_string(),
    })
}

/// Agents recoverable from a `tmux ls` listing by naming convention.
#[must_use]
pub fn sessions_to_agents<S: AsRef<str>>(listing: &str, rigs: &[S]) -> Vec<AgentRef> {
    parse_sessions(listing)
        .iter()
        .filter_map(|record| parse_session_name(&record.name, rigs))
        .collect()
}

/// Build the running-set.
///
/// Status rig agents and the polecat list are authoritative. The session
/// listing is consulted only when the polecat list is unavailable (`None`).
#[must_use]
pub fn running_agents(
    status: Option<&StatusSnapshot>,
    polecats: Option<&[PolecatEntry]>,
    listing: &str,
) -> RunningSet {
    let mut running = RunningSet::default();

    if let Some(status) = status {
        for agent in status.rigs.iter().flat_map(|rig| &rig.agents) {
            if agent.running == Some(true)
                && let Some(address) = agent.address.as_deref()
            {
                running.insert(address);
            }
        }
    }

    match polecats {
        Some(list) => {
            for entry in list {
                if entry.session_running && !entry.rig.is_empty() && !entry.name.is_empty() {
                    running.insert(&format!("{}/{}", entry.rig, entry.name));
                }
            }
        }
        None => {
            let rigs = status.map(StatusSnapshot::rig_names).unwrap_or_default();
            for agent in sessions_to_agents(listing, &rigs) {
                running.insert(&agent.path());
            }
        }
    }

    running
}

/// Stamp running state onto the snapshot: every hook gets `running`, top-level
/// agents without an explicit flag get one, and `runningPolecats` is recorded.
pub fn apply_running(status: &mut StatusSnapshot, running: &RunningSet) {
    for hook in status.rigs.iter_mut().flat_map(|rig| &mut rig.hooks) {
        hook.running = Some(running.contains(&hook.agent));
    }
    for agent in &mut status.agents {
        if agent.running.is_none() {
            let address = agent.address.as_deref().unwrap_or_default();
            agent.running = Some(running.contains(address));
        }
    }
    status.running_polecats = running.to_vec();
}

/// First listed session whose name ends with `-<name>`.
#[must_use]
pub fn session_ending_with(listing: &str, name: &str) -> Option<String> {
    let suffix = format!("-{name}");
    parse_sessions(listing)
        .into_iter()
        .find(|record| record.name.ends_with(&suffix))
        .map(|record| record.name)
}

/// Session of the agent called `name`, according to the status snapshot.
#[must_use]
pub fn agent_session_from_status(status: &StatusSnapshot, name: &str) -> Option<String> {
    status
        .agents
        .iter()
        .chain(status.rigs.iter().flat_map(|rig| &rig.agents))
        .find(|agent| agent.name == name && agent.session.as_deref().is_some_and(|s| !s.is_empty()))
        .and_then(|agent| agent.session.clone())
}

/// Session of polecat `name` in `rig`, derived from the session prefix any
/// other agent of the rig uses (`tw-witness` implies `tw-<name>`).
#[must_use]
pub fn polecat_session_from_status(status: &StatusSnapshot, rig: &str, name: &str) -> Option<String> {
    status
        .rigs
        .iter()
        .filter(|r| r.name == rig)
        .flat_map(|r| &r.agents)
        .filter_map(|agent| agent.session.as_deref())
        .find_map(|session| {
            let (prefix, _) = session.rsplit_once('-')?;
            (!prefix.is_empty()).then(|| format!("{prefix}-{name}"))
        })
}

/// Authoritative lookup first, then the listing.
#[must_use]
pub fn find_agent_session(status: Option<&StatusSnapshot>, listing: &str, name: &str) -> Option<String> {
    status
        .and_then(|s| agent_session_from_status(s, name))
        .or_else(|| session_ending_with(listing, name))
}

/// Authoritative lookup first, then the listing.
#[must_use]
pub fn find_polecat_session(
    status: Option<&StatusSnapshot>,
    listing: &str,
    rig: &str,
    name: &str,
) -> Option<String> {
    status
        .and_then(|s| polecat_session_from_status(s, rig, name))
        .or_else(|| session_ending_with(listing, name))
}

/// Whether `session` exists, or failing that, any session for the same agent.
pub async fn is_session_running(tmux: &TmuxGateway, session: &str) -> bool {
    if tmux.has_session(session).await {
        return true;
    }
    let Some((_, agent)) = session.split_once('-') else {
        return false;
    };
    let listing = tmux.list_sessions().await;
    session_ending_with(&listing, agent).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandResult, Exec};
    use crate::testing::FakeRunner;
    use serde_json::json;
    use std::sync::Arc;

    fn snapshot(value: Value) -> StatusSnapshot {
        serde_json::from_value(value).expect("snapshot")
    }

    #[test]
    fn test_longest_rig_wins() {
        let agent = parse_session_name("gt-foo-bar-alice", &["foo", "foo-bar"]).expect("agent");
        assert_eq!(agent.rig, "foo-bar");
        assert_eq!(agent.name, "alice");
    }

    #[test]
    fn test_fallback_splits_on_last_hyphen() {
        let agent = parse_session_name::<&str>("gt-my-rig-bob", &[]).expect("agent");
        assert_eq!(agent.path(), "my-rig/bob");
        assert_eq!(parse_session_name::<&str>("gt-solo", &[]), None);
        assert_eq!(parse_session_name("hq-mayor", &["hq"]), None);
        assert_eq!(parse_session_name("gt-tw-", &["tw"]), None);
    }

    #[test]
    fn test_passthrough_fields_survive() {
        let status = snapshot(json!({
            "town": "hq",
            "rigs": [{"name": "tw", "polecats": 2, "agents": [{"name": "witness", "role": "witness"}]}]
        }));
        let value = serde_json::to_value(&status).expect("serialize");
        assert_eq!(value["town"], "hq");
        assert_eq!(value["rigs"][0]["polecats"], 2);
        assert_eq!(value["rigs"][0]["agents"][0]["role"], "witness");
    }

    #[test]
    fn test_running_agents_prefers_structured_sources() {
        let status = snapshot(json!({
            "rigs": [{"name": "tw", "agents": [
                {"name": "witness", "address": "tw/witness/", "running": true},
                {"name": "refinery", "address": "tw/refinery", "running": false}
            ]}]
        }));
        let polecats = vec![
            PolecatEntry { rig: "tw".into(), name: "alice".into(), session_running: true },
            PolecatEntry { rig: "tw".into(), name: "bob".into(), session_running: false },
        ];
        let listing = "gt-tw-ghost: 1 windows (created today)\n";

        let running = running_agents(Some(&status), Some(&polecats), listing);
        assert_eq!(running.to_vec(), vec!["tw/alice", "tw/witness"]);
    }

    #[test]
    fn test_running_agents_falls_back_to_listing() {
        let status = snapshot(json!({"rigs": [{"name": "foo-bar"}]}));
        let listing = "gt-foo-bar-alice: 1 windows (created today)\nother: 1 windows\n";

        let running = running_agents(Some(&status), None, listing);
        assert_eq!(running.to_vec(), vec!["foo-bar/alice"]);
    }

    #[test]
    fn test_apply_running() {
        let mut status = snapshot(json!({
            "agents": [{"name": "mayor", "address": "mayor/"}, {"name": "deacon", "running": false}],
            "rigs": [{"name": "tw", "hooks": [{"agent": "tw/alice"}, {"agent": "tw/bob"}]}]
        }));
        let mut running = RunningSet::default();
        running.insert("tw/alice");
        running.insert("mayor");

        apply_running(&mut status, &running);
        assert_eq!(status.rigs[0].hooks[0].running, Some(true));
        assert_eq!(status.rigs[0].hooks[1].running, Some(false));
        assert_eq!(status.agents[0].running, Some(true));
        assert_eq!(status.agents[1].running, Some(false));
        assert_eq!(status.running_polecats, vec!["mayor", "tw/alice"]);
    }

    #[test]
    fn test_polecat_session_derives_prefix() {
        let status = snapshot(json!({
            "rigs": [{"name": "tw", "agents": [{"name": "witness", "session": "tw-witness"}]}]
        }));
        assert_eq!(
            find_polecat_session(Some(&status), "", "tw", "alice").as_deref(),
            Some("tw-alice")
        );
        let listing = "gt-other-alice: 1 windows\n";
        assert_eq!(
            find_polecat_session(Some(&status), listing, "unknown", "alice").as_deref(),
            Some("gt-other-alice")
        );
        assert_eq!(find_polecat_session(None, "", "tw", "alice"), None);
    }

    #[test]
    fn test_agent_session_lookup() {
        let status = snapshot(json!({
            "agents": [{"name": "mayor", "session": "hq-mayor"}],
            "rigs": [{"name": "tw", "agents": [{"name": "witness", "session": "tw-witness"}]}]
        }));
        assert_eq!(find_agent_session(Some(&status), "", "mayor").as_deref(), Some("hq-mayor"));
        assert_eq!(find_agent_session(Some(&status), "", "witness").as_deref(), Some("tw-witness"));
        assert_eq!(
            find_agent_session(None, "hq-deacon: 1 windows\n", "deacon").as_deref(),
            Some("hq-deacon")
        );
    }

    #[tokio::test]
    async fn test_is_session_running_falls_back_to_listing() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["tmux", "ls"],
            CommandResult::success("hq-mayor: 1 windows (created today)\n"),
        );
        let tmux = TmuxGateway::new(Arc::clone(&runner) as Arc<dyn Exec>);

        assert!(is_session_running(&tmux, "gt-mayor").await);
        assert!(!is_session_running(&tmux, "gt-deacon").await);
        assert!(!is_session_running(&tmux, "nohyphen").await);
    }
}
