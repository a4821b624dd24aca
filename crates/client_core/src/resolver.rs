//! Maps a participant pair to its durable session id.
//!
//! Lookups go memory tier, then persistent tier, then the server. A cached
//! id is only returned after a bounded history probe confirms the server
//! still knows it; a failed probe evicts the entry from both tiers.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::domain::{SessionId, UserId};
use storage::Storage;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::{ChatError, ChatResult},
    gateway::ChatGateway,
};

/// Order-independent cache key of two user ids.
///
/// The lower id is length-prefixed, so ids containing the separator cannot
/// collide: `("a|b", "c")` and `("a", "b|c")` map to different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(String);

impl PairKey {
    pub fn new(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}:{low}|{high}", low.as_str().len()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persistent tier of the session cache.
#[async_trait]
pub trait SessionCacheStore: Send + Sync {
    async fn load(&self, key: &PairKey) -> ChatResult<Option<SessionId>>;
    async fn store(&self, key: &PairKey, session_id: &SessionId) -> ChatResult<()>;
    async fn evict(&self, key: &PairKey) -> ChatResult<bool>;
    async fn clear(&self) -> ChatResult<u64>;
}

#[async_trait]
impl SessionCacheStore for Storage {
    async fn load(&self, key: &PairKey) -> ChatResult<Option<SessionId>> {
        self.cached_session(key.as_str())
            .await
            .map_err(ChatError::from_storage)
    }

    async fn store(&self, key: &PairKey, session_id: &SessionId) -> ChatResult<()> {
        self.store_cached_session(key.as_str(), session_id)
            .await
            .map_err(ChatError::from_storage)
    }

    async fn evict(&self, key: &PairKey) -> ChatResult<bool> {
        self.evict_cached_session(key.as_str())
            .await
            .map_err(ChatError::from_storage)
    }

    async fn clear(&self) -> ChatResult<u64> {
        self.clear_session_cache()
            .await
            .map_err(ChatError::from_storage)
    }
}

/// Memory-only operation, for callers without a writable data directory.
pub struct NoPersistentCache;

#[async_trait]
impl SessionCacheStore for NoPersistentCache {
    async fn load(&self, _key: &PairKey) -> ChatResult<Option<SessionId>> {
        Ok(None)
    }

    async fn store(&self, _key: &PairKey, _session_id: &SessionId) -> ChatResult<()> {
        Ok(())
    }

    async fn evict(&self, _key: &PairKey) -> ChatResult<bool> {
        Ok(false)
    }

    async fn clear(&self) -> ChatResult<u64> {
        Ok(0)
    }
}

type SharedResolve = Shared<BoxFuture<'static, ChatResult<SessionId>>>;

pub struct SessionResolver {
    gateway: Arc<dyn ChatGateway>,
    persistent: Arc<dyn SessionCacheStore>,
    memory: RwLock<HashMap<PairKey, SessionId>>,
    inflight: Mutex<HashMap<PairKey, SharedResolve>>,
    probe_limit: u32,
}

impl SessionResolver {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        persistent: Arc<dyn SessionCacheStore>,
        probe_limit: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            persistent,
            memory: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            probe_limit: probe_limit.max(1),
        })
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<PairKey, SharedResolve>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the session between `me` and `counterpart`.
    ///
    /// Concurrent calls for the same pair share one lookup, so the server sees
    /// at most one creation request for them.
    pub async fn resolve(self: &Arc<Self>, me: &UserId, counterpart: &UserId) -> ChatResult<SessionId> {
        if me == counterpart {
            return Err(ChatError::Validation("cannot open a session with yourself".into()));
        }
        let key = PairKey::new(me, counterpart);
        let pending = {
            let mut inflight = self.inflight();
            match inflight.get(&key) {
                Some(pending) => pending.clone(),
                None => {
                    let resolver = Arc::clone(self);
                    let (me, counterpart, lookup_key) = (me.clone(), counterpart.clone(), key.clone());
                    let lookup = async move {
                        let result = resolver.lookup(&lookup_key, &me, &counterpart).await;
                        resolver.inflight().remove(&lookup_key);
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, lookup.clone());
                    lookup
                }
            }
        };
        pending.await
    }

    async fn lookup(&self, key: &PairKey, me: &UserId, counterpart: &UserId) -> ChatResult<SessionId> {
        if let Some(session_id) = self.cached_entry(key).await {
            match self.gateway.probe_session(&session_id, self.probe_limit).await {
                Ok(()) => {
                    debug!(pair_key = %key, session_id = %session_id, "resolver: cached session verified");
                    return Ok(session_id);
                }
                Err(err) => {
                    warn!(
                        pair_key = %key,
                        session_id = %session_id,
                        error = %err,
                        "resolver: cached session failed probe, evicting"
                    );
                    self.evict(key).await;
                }
            }
        }

        let session = self
            .gateway
            .resolve_session(me, counterpart)
            .await
            .map_err(ChatError::resolution)?;

        if let Err(err) = self.persistent.store(key, &session.id).await {
            warn!(pair_key = %key, error = %err, "resolver: failed to persist session id");
        }
        self.memory.write().await.insert(key.clone(), session.id.clone());
        info!(pair_key = %key, session_id = %session.id, "resolver: session resolved");
        Ok(session.id)
    }

    async fn cached_entry(&self, key: &PairKey) -> Option<SessionId> {
        let in_memory = self.memory.read().await.get(key).cloned();
        if in_memory.is_some() {
            return in_memory;
        }
        match self.persistent.load(key).await {
            Ok(Some(session_id)) => {
                debug!(pair_key = %key, session_id = %session_id, "resolver: promoting persistent entry");
                self.memory.write().await.insert(key.clone(), session_id.clone());
                Some(session_id)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(pair_key = %key, error = %err, "resolver: persistent lookup failed");
                None
            }
        }
    }

    async fn evict(&self, key: &PairKey) {
        self.memory.write().await.remove(key);
        if let Err(err) = self.persistent.evict(key).await {
            warn!(pair_key = %key, error = %err, "resolver: failed to evict persistent entry");
        }
    }

    /// Drops the cached session for one pair from both tiers.
    pub async fn invalidate(&self, me: &UserId, counterpart: &UserId) -> ChatResult<bool> {
        let key = PairKey::new(me, counterpart);
        let in_memory = self.memory.write().await.remove(&key).is_some();
        let persisted = self.persistent.evict(&key).await?;
        Ok(in_memory || persisted)
    }

    /// Wipes both tiers.
    pub async fn clear(&self) -> ChatResult<()> {
        self.memory.write().await.clear();
        let removed = self.persistent.clear().await?;
        info!(removed, "resolver: session cache cleared");
        Ok(())
    }

    /// Memory-tier entry for the pair, without probing.
    pub async fn cached(&self, me: &UserId, counterpart: &UserId) -> Option<SessionId> {
        self.memory
            .read()
            .await
            .get(&PairKey::new(me, counterpart))
            .cloned()
    }
}

#[cfg(test)]
#[path = "tests/resolver_tests.rs"]
mod tests;
