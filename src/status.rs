//! Town status, enriched with running state and rig metadata.
//!
//! The snapshot is expensive (it shells out twice), so it sits behind the
//! cache with a short TTL and concurrent requests share one production.

use crate::cache::CacheRegistry;
use crate::config::CacheTtls;
use crate::discovery::{StatusSnapshot, apply_running, running_agents};
use crate::error::BridgeError;
use crate::gt::GtGateway;
use crate::tmux::TmuxGateway;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Cache key of the status snapshot.
pub const STATUS_KEY: &str = "status";

/// Builds and caches the status snapshot.
#[derive(Clone)]
pub struct StatusService {
    gt: GtGateway,
    tmux: TmuxGateway,
    cache: CacheRegistry,
    ttls: CacheTtls,
}

impl StatusService {
    #[must_use]
    pub const fn new(gt: GtGateway, tmux: TmuxGateway, cache: CacheRegistry, ttls: CacheTtls) -> Self {
        Self {
            gt,
            tmux,
            cache,
            ttls,
        }
    }

    /// Cached snapshot, or a fresh one when `refresh` is set.
    ///
    /// A refresh does not coordinate with an in-flight cached production; it
    /// runs its own and overwrites the entry.
    pub async fn get_status(&self, refresh: bool) -> Result<Value, BridgeError> {
        if refresh {
            let status = self.fetch().await?;
            self.cache.set(STATUS_KEY, status.clone(), self.ttls.status)?;
            return Ok(status);
        }
        let service = self.clone();
        self.cache
            .get_or_execute(STATUS_KEY, self.ttls.status, move || async move {
                service.fetch().await
            })
            .await
    }

    /// Run `gt status` and the polecat list in parallel and merge them.
    async fn fetch(&self) -> Result<Value, BridgeError> {
        let (status, polecats) = tokio::join!(self.gt.status(), self.gt.polecat_list());
        if !status.result.ok {
            return Err(BridgeError::command_failed("gt status", &status.result));
        }

        let Some(data) = status.data else {
            debug!("gt status did not print JSON, passing raw text through");
            return Ok(json!({ "raw": status.raw }));
        };
        let mut snapshot: StatusSnapshot = match serde_json::from_value(data.clone()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Unexpected gt status shape, passing through");
                return Ok(data);
            }
        };

        let listing = if polecats.is_none() {
            self.tmux.list_sessions().await
        } else {
            String::new()
        };
        let running = running_agents(Some(&snapshot), polecats.as_deref(), &listing);
        apply_running(&mut snapshot, &running);

        for rig in &mut snapshot.rigs {
            if rig.git_url.is_none() && !rig.name.is_empty() {
                rig.git_url = self.rig_git_url(&rig.name).await;
            }
        }

        serde_json::to_value(&snapshot).map_err(|e| BridgeError::Internal(e.to_string()))
    }

    /// `git_url` from `<gt_root>/<rig>/config.json`, cached per rig.
    async fn rig_git_url(&self, rig: &str) -> Option<String> {
        let key = format!("rig-config:{rig}");
        let cached = match self.cache.get(&key) {
            Some(cached) => cached,
            None => {
                let config = read_rig_config(self.gt.gt_root().join(rig).join("config.json")).await;
                let ttl = if config.is_some() {
                    self.ttls.rig_config
                } else {
                    self.ttls.missing_rig_config
                };
                let wrapped = json!({ "config": config });
                if let Err(e) = self.cache.set(&key, wrapped.clone(), ttl) {
                    debug!(error = %e, "Failed to cache rig config");
                }
                wrapped
            }
        };
        cached
            .get("config")
            .and_then(|config| config.get("git_url"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }
}

async fn read_rig_config(path: PathBuf) -> Option<Value> {
    let text = tokio::fs::read_to_string(&path).await.ok()?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable rig config");
            None
        }
    }
}
