//! TTL cache with request coalescing.
//!
//! Each key moves through `absent -> pending -> cached -> expired`. While a
//! production for a key is pending, every other caller awaits the same shared
//! result instead of starting a second one. Productions run on their own task
//! and finish even if every caller goes away.

use crate::error::BridgeError;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Errors from cache operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("refusing to cache a null value for key {key}")]
    NullValue { key: String },
}

type Production = Shared<BoxFuture<'static, Result<Value, BridgeError>>>;
type Settler = oneshot::Sender<Result<Value, BridgeError>>;

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

struct Pending {
    generation: u64,
    result: Production,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, Pending>,
    generation: u64,
}

impl CacheState {
    fn fresh(&mut self, key: &str, now: Instant) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if now < entry.expires_at {
            return Some(entry.value.clone());
        }
        self.entries.remove(key);
        None
    }

    /// Drop the pending marker for `key` if it still belongs to `generation`.
    fn release(&mut self, key: &str, generation: u64) -> bool {
        let owned = self
            .pending
            .get(key)
            .is_some_and(|pending| pending.generation == generation);
        if owned {
            self.pending.remove(key);
        }
        owned
    }

    fn store(&mut self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        if value.is_null() {
            return Err(CacheError::NullValue {
                key: key.to_string(),
            });
        }
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }
}

/// Process-wide cache handle. Clones share the same storage.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    inner: Arc<Mutex<CacheState>>,
}

impl CacheRegistry {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `key`, evicting it if it has expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().fresh(key, Instant::now())
    }

    /// Whether a fresh value exists for `key`.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Store `value` under `key` for `ttl`. `Value::Null` is rejected.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.lock().store(key, value, ttl)
    }

    /// Remove a key and any pending production marker for it.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.lock();
        let had_pending = state.pending.remove(key).is_some();
        state.entries.remove(key).is_some() || had_pending
    }

    /// Remove everything.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.pending.clear();
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| now < entry.expires_at);
        before - state.entries.len()
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a production for `key` is in flight.
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().pending.contains_key(key)
    }

    /// Return the cached value for `key`, or run `producer` once and cache
    /// its result for `ttl`.
    ///
    /// Concurrent callers for the same key share one production. A failed
    /// production is not cached; every waiter sees the same error and the
    /// next call starts over.
    pub async fn get_or_execute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<Value, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, BridgeError>> + Send + 'static,
    {
        let (production, start) = {
            let mut state = self.lock();
            if let Some(value) = state.fresh(key, Instant::now()) {
                return Ok(value);
            }
            if let Some(pending) = state.pending.get(key) {
                debug!(key, "Joining in-flight production");
                (pending.result.clone(), None)
            } else {
                Self::register_pending(&mut state, key)
            }
        };

        if let Some((generation, tx)) = start {
            // Armed before the producer runs so a panic anywhere below, or an
            // aborted task, still clears the pending marker.
            let guard = PendingGuard {
                inner: Arc::clone(&self.inner),
                key: key.to_string(),
                generation,
            };
            // The producer is invoked outside the lock; it may touch the cache.
            let work = producer();
            tokio::spawn(async move {
                let outcome = work.await;
                let settled = guard.settle(ttl, outcome);
                // Nobody listening is fine; the value is cached either way.
                let _ = tx.send(settled);
            });
        }

        production.await
    }

    fn register_pending(state: &mut CacheState, key: &str) -> (Production, Option<(u64, Settler)>) {
        state.generation += 1;
        let generation = state.generation;
        let (tx, rx) = oneshot::channel();
        let production: Production = async move {
            rx.await
                .unwrap_or_else(|_| Err(BridgeError::Internal("cache production was dropped".into())))
        }
        .boxed()
        .shared();
        state.pending.insert(
            key.to_string(),
            Pending {
                generation,
                result: production.clone(),
            },
        );
        (production, Some((generation, tx)))
    }

    /// Run [`cleanup`](Self::cleanup) every `every` until the handle is aborted.
    #[must_use]
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.cleanup();
                if removed > 0 {
                    info!(removed, "Swept expired cache entries");
                }
            }
        })
    }
}

/// Owns a key's pending marker until the production settles.
struct PendingGuard {
    inner: Arc<Mutex<CacheState>>,
    key: String,
    generation: u64,
}

impl PendingGuard {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(self, ttl: Duration, outcome: Result<Value, BridgeError>) -> Result<Value, BridgeError> {
        let mut state = self.lock();
        state.release(&self.key, self.generation);
        let value = outcome?;
        state.store(&self.key, value.clone(), ttl)?;
        Ok(value)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // Already released when settled; otherwise the production died.
        let released = self.lock().release(&self.key, self.generation);
        if released {
            warn!(key = %self.key, "Cache production ended without a result");
        }
    }
}
