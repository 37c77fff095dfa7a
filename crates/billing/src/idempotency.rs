//! Client idempotency keys
//!
//! A mutating request carrying a key runs at most once per (user, operation, key)
//! within the TTL. The first caller takes a lock tagged with its own token, keeps
//! it alive while the operation runs and stores the successful response next to
//! a fingerprint of the request body. Only the token holder can release the lock.
//! Later callers with the same body get the stored response back; a different
//! body, or a call while the first is still running, is an idempotency conflict.
//!
//! Failed operations are not stored so the client may retry with the same key.
//! If the cache itself is unreachable the operation runs uncached.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::Script;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const LOCK_TTL: Duration = Duration::from_secs(60);

/// Delete the lock only while it still carries our token
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Push the lock expiry out only while it still carries our token
const EXTEND_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResponse {
    fingerprint: String,
    response: serde_json::Value,
}

#[derive(Default)]
struct MemoryState {
    responses: HashMap<String, (StoredResponse, Instant)>,
    /// Lock key to (owner token, expiry)
    locks: HashMap<String, (String, Instant)>,
}

enum Backend {
    Memory(Mutex<MemoryState>),
    Redis {
        conn: ConnectionManager,
        release: Script,
        extend: Script,
    },
}

type CacheResult<T> = Result<T, String>;

pub struct IdempotencyCache {
    backend: Backend,
    ttl: Duration,
    lock_ttl: Duration,
}

/// Hex SHA-256 of the serialized request body
pub fn fingerprint<T: Serialize>(request: &T) -> BillingResult<String> {
    let body = serde_json::to_vec(request)
        .map_err(|e| BillingError::Internal(format!("failed to serialize request: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&body)))
}

impl IdempotencyCache {
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(MemoryState::default())),
            ttl: DEFAULT_TTL,
            lock_ttl: LOCK_TTL,
        }
    }

    pub fn new_redis(conn: ConnectionManager) -> Self {
        Self {
            backend: Backend::Redis {
                conn,
                release: Script::new(RELEASE_LOCK_SCRIPT),
                extend: Script::new(EXTEND_LOCK_SCRIPT),
            },
            ttl: DEFAULT_TTL,
            lock_ttl: LOCK_TTL,
        }
    }

    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BillingError::Config(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BillingError::Internal(format!("redis connection failed: {}", e)))?;
        Ok(Self::new_redis(conn))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Expiry of the in-flight lock; it is refreshed every third of this while the
    /// operation runs, so it only lapses when the holder is gone
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// Run `op` at most once for this key and request body
    ///
    /// Without a key the operation simply runs.
    pub async fn execute<Req, T, F, Fut>(
        &self,
        user_id: &str,
        operation: &str,
        key: Option<&str>,
        request: &Req,
        op: F,
    ) -> BillingResult<T>
    where
        Req: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return op().await;
        };

        let cache_key = format!("idempotency:{}:{}:{}", user_id, operation, key);
        let lock_key = format!("{}:lock", cache_key);
        let fingerprint = fingerprint(request)?;

        match self.lookup(&cache_key).await {
            Ok(Some(stored)) => return replay(stored, &fingerprint, key),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(operation, error = %e, "Idempotency cache unavailable, running uncached");
                return op().await;
            }
        }

        let token = Uuid::new_v4().to_string();
        match self.try_lock(&lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(BillingError::IdempotencyConflict(format!(
                    "request with key {} is still in progress",
                    key
                )));
            }
            Err(e) => {
                tracing::warn!(operation, error = %e, "Idempotency lock unavailable, running uncached");
                return op().await;
            }
        }

        // A concurrent caller may have finished between the lookup and the lock
        if let Ok(Some(stored)) = self.lookup(&cache_key).await {
            self.unlock(&lock_key, &token).await;
            return replay(stored, &fingerprint, key);
        }

        let result = self.run_holding_lock(&lock_key, &token, op()).await;

        if let Ok(response) = &result {
            match serde_json::to_value(response) {
                Ok(response) => {
                    let stored = StoredResponse {
                        fingerprint,
                        response,
                    };
                    if let Err(e) = self.store(&cache_key, &stored).await {
                        tracing::warn!(operation, error = %e, "Failed to store idempotent response");
                    }
                }
                Err(e) => {
                    tracing::warn!(operation, error = %e, "Response not serializable, not cached");
                }
            }
        }

        self.unlock(&lock_key, &token).await;
        result
    }

    /// Drive `fut` to completion while refreshing the lock it runs under
    async fn run_holding_lock<T>(
        &self,
        lock_key: &str,
        token: &str,
        fut: impl Future<Output = BillingResult<T>>,
    ) -> BillingResult<T> {
        let period = (self.lock_ttl / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(fut);

        loop {
            tokio::select! {
                result = &mut fut => return result,
                _ = heartbeat.tick() => match self.extend_lock(lock_key, token).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!(lock_key, "Idempotency lock lost while the operation was running");
                    }
                    Err(e) => {
                        tracing::warn!(lock_key, error = %e, "Failed to refresh idempotency lock");
                    }
                },
            }
        }
    }

    async fn lookup(&self, cache_key: &str) -> CacheResult<Option<StoredResponse>> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                match state.responses.get(cache_key) {
                    Some((stored, expires)) if *expires > Instant::now() => Ok(Some(stored.clone())),
                    Some(_) => {
                        state.responses.remove(cache_key);
                        Ok(None)
                    }
                    None => Ok(None),
                }
            }
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let raw: Option<String> = redis::cmd("GET")
                    .arg(cache_key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| e.to_string())?;
                raw.map(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
                    .transpose()
            }
        }
    }

    async fn try_lock(&self, lock_key: &str, token: &str) -> CacheResult<bool> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                let now = Instant::now();
                if state.locks.get(lock_key).is_some_and(|(_, expires)| *expires > now) {
                    return Ok(false);
                }
                state
                    .locks
                    .insert(lock_key.to_string(), (token.to_string(), now + self.lock_ttl));
                Ok(true)
            }
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let acquired: Option<String> = redis::cmd("SET")
                    .arg(lock_key)
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(self.lock_ttl))
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(acquired.is_some())
            }
        }
    }

    async fn store(&self, cache_key: &str, stored: &StoredResponse) -> CacheResult<()> {
        match &self.backend {
            Backend::Memory(state) => {
                state.lock().await.responses.insert(
                    cache_key.to_string(),
                    (stored.clone(), Instant::now() + self.ttl),
                );
                Ok(())
            }
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let body = serde_json::to_string(stored).map_err(|e| e.to_string())?;
                let _: () = redis::cmd("SET")
                    .arg(cache_key)
                    .arg(body)
                    .arg("PX")
                    .arg(millis(self.ttl))
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(())
            }
        }
    }

    async fn extend_lock(&self, lock_key: &str, token: &str) -> CacheResult<bool> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                match state.locks.get_mut(lock_key) {
                    Some((owner, expires)) if owner == token => {
                        *expires = Instant::now() + self.lock_ttl;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
            Backend::Redis { conn, extend, .. } => {
                let mut conn = conn.clone();
                let extended: i64 = extend
                    .key(lock_key)
                    .arg(token)
                    .arg(millis(self.lock_ttl))
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(extended == 1)
            }
        }
    }

    async fn unlock(&self, lock_key: &str, token: &str) {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                if state.locks.get(lock_key).is_some_and(|(owner, _)| owner == token) {
                    state.locks.remove(lock_key);
                }
            }
            Backend::Redis { conn, release, .. } => {
                let mut conn = conn.clone();
                let released: Result<i64, _> =
                    release.key(lock_key).arg(token).invoke_async(&mut conn).await;
                if let Err(e) = released {
                    // The lock expires on its own after the lock TTL
                    tracing::warn!(lock_key, error = %e, "Failed to release idempotency lock");
                }
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn replay<T: DeserializeOwned>(stored: StoredResponse, fingerprint: &str, key: &str) -> BillingResult<T> {
    if stored.fingerprint != fingerprint {
        return Err(BillingError::IdempotencyConflict(format!(
            "key {} was used with a different request body",
            key
        )));
    }
    tracing::debug!(key, "Replaying stored idempotent response");
    serde_json::from_value(stored.response)
        .map_err(|e| BillingError::Internal(format!("stored idempotent response unreadable: {}", e)))
}
