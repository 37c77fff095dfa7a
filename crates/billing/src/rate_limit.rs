//! Per-user sliding window rate limiting
//!
//! Each key keeps the timestamps of its admitted requests inside the window. A
//! request is admitted while fewer than `requests_per_window` timestamps remain
//! after pruning. The Redis backend runs prune, count and insert as one Lua
//! script so concurrent instances share a single counter.
//!
//! Backend failures fail open: the request is admitted and a warning is logged.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use redis::Script;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_REQUESTS_PER_WINDOW: u32 = 100;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

const KEY_PREFIX: &str = "ratelimit:user:";

/// Prune, count and conditionally record in one round trip.
/// Returns {allowed, count, oldest_score}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window)
    return {1, count + 1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {0, count, tonumber(oldest[2])}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
            window: DEFAULT_WINDOW,
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests_per_window: requests,
            window: Duration::from_secs(60),
        }
    }

    fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// Seconds until the oldest request in the window expires, set when rejected
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    fn admitted(limit: u32, count: u32) -> Self {
        Self {
            allowed: true,
            remaining: limit.saturating_sub(count),
            limit,
            retry_after_seconds: None,
        }
    }

    fn rejected(limit: u32, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            retry_after_seconds: Some(retry_after_ms.div_ceil(1000).max(1)),
        }
    }
}

enum Backend {
    Memory(Mutex<HashMap<String, VecDeque<u64>>>),
    Redis {
        conn: ConnectionManager,
        script: Script,
    },
}

pub struct RateLimiter {
    backend: Backend,
    config: RateLimitConfig,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl RateLimiter {
    /// Process-local limiter, suitable for a single instance and for tests
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(HashMap::new())),
            config: RateLimitConfig::default(),
        }
    }

    pub fn new_redis(conn: ConnectionManager) -> Self {
        Self {
            backend: Backend::Redis {
                conn,
                script: Script::new(SLIDING_WINDOW_SCRIPT),
            },
            config: RateLimitConfig::default(),
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

    pub fn with_config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Record a request for `key` and report whether it is admitted
    pub async fn check(&self, key: &str) -> BillingResult<RateLimitResult> {
        self.check_at(key, now_ms()).await
    }

    /// Like [`check`](Self::check) with an explicit clock, in unix milliseconds
    pub async fn check_at(&self, key: &str, now_ms: u64) -> BillingResult<RateLimitResult> {
        let limit = self.config.requests_per_window;
        let window_ms = self.config.window_ms();

        match &self.backend {
            Backend::Memory(windows) => {
                let mut windows = windows.lock().await;
                let hits = windows.entry(key.to_string()).or_default();
                while hits
                    .front()
                    .is_some_and(|ts| ts.saturating_add(window_ms) <= now_ms)
                {
                    hits.pop_front();
                }

                let count = u32::try_from(hits.len()).unwrap_or(u32::MAX);
                if count < limit {
                    hits.push_back(now_ms);
                    return Ok(RateLimitResult::admitted(limit, count + 1));
                }

                let oldest = hits.front().copied().unwrap_or(now_ms);
                Ok(RateLimitResult::rejected(
                    limit,
                    oldest.saturating_add(window_ms).saturating_sub(now_ms),
                ))
            }
            Backend::Redis { conn, script } => {
                let mut conn = conn.clone();
                let member = format!("{}-{}", now_ms, Uuid::new_v4());
                let reply: Result<Vec<i64>, redis::RedisError> = script
                    .key(key)
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(limit)
                    .arg(member)
                    .invoke_async(&mut conn)
                    .await;

                match reply.as_deref() {
                    Ok([1, count, _]) => Ok(RateLimitResult::admitted(
                        limit,
                        u32::try_from(*count).unwrap_or(limit),
                    )),
                    Ok([0, _, oldest]) => {
                        let oldest = u64::try_from(*oldest).unwrap_or(now_ms);
                        Ok(RateLimitResult::rejected(
                            limit,
                            oldest.saturating_add(window_ms).saturating_sub(now_ms),
                        ))
                    }
                    Ok(other) => {
                        tracing::warn!(key = %key, reply = ?other, "Unexpected rate limit reply, allowing request");
                        Ok(RateLimitResult::admitted(limit, 0))
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Rate limit backend unavailable, allowing request");
                        Ok(RateLimitResult::admitted(limit, 0))
                    }
                }
            }
        }
    }

    /// Admit a request for `user_id` or fail with `RateLimitExceeded`
    pub async fn enforce(&self, user_id: &str) -> BillingResult<RateLimitResult> {
        let result = self.check(&format!("{}{}", KEY_PREFIX, user_id)).await?;
        if !result.allowed {
            tracing::info!(
                user_id = %user_id,
                limit = result.limit,
                retry_after = ?result.retry_after_seconds,
                "Rate limit exceeded"
            );
            return Err(BillingError::RateLimitExceeded {
                retry_after_seconds: result.retry_after_seconds.unwrap_or(1),
            });
        }
        Ok(result)
    }

    /// Drop memory windows with no live entries; Redis keys expire on their own
    pub async fn cleanup(&self) {
        if let Backend::Memory(windows) = &self.backend {
            let now = now_ms();
            let window_ms = self.config.window_ms();
            let mut windows = windows.lock().await;
            let before = windows.len();
            windows.retain(|_, hits| {
                hits.back()
                    .is_some_and(|ts| ts.saturating_add(window_ms) > now)
            });
            let removed = before - windows.len();
            if removed > 0 {
                tracing::debug!(removed, "Removed idle rate limit windows");
            }
        }
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        match &self.backend {
            Backend::Memory(windows) => windows.lock().await.len(),
            Backend::Redis { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_allowed() {
        let limiter = RateLimiter::new_in_memory();
        let result = limiter.check("user-a").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.limit, 100);
        assert_eq!(result.remaining, 99);
        assert_eq!(result.retry_after_seconds, None);
    }

    #[tokio::test]
    async fn test_rejected_at_limit_with_retry_after() {
        let limiter = RateLimiter::new_in_memory().with_config(RateLimitConfig::per_minute(3));
        let start = 1_000_000;

        for i in 0..3 {
            assert!(limiter.check_at("k", start + i * 1000).await.unwrap().allowed);
        }
        let rejected = limiter.check_at("k", start + 10_000).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        // Oldest entry (start) leaves the window at start + 60s
        assert_eq!(rejected.retry_after_seconds, Some(50));
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new_in_memory().with_config(RateLimitConfig::per_minute(2));
        let start = 5_000_000;

        limiter.check_at("k", start).await.unwrap();
        limiter.check_at("k", start + 30_000).await.unwrap();
        assert!(!limiter.check_at("k", start + 59_999).await.unwrap().allowed);

        // First entry expires, second still counts
        let result = limiter.check_at("k", start + 60_000).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_rejections_are_not_recorded() {
        let limiter = RateLimiter::new_in_memory().with_config(RateLimitConfig::per_minute(1));
        limiter.check_at("k", 0).await.unwrap();
        for t in [1_000, 2_000, 3_000] {
            assert!(!limiter.check_at("k", t).await.unwrap().allowed);
        }
        assert!(limiter.check_at("k", 60_000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_keys_isolated() {
        let limiter = RateLimiter::new_in_memory().with_config(RateLimitConfig::per_minute(1));
        assert!(limiter.check_at("a", 0).await.unwrap().allowed);
        assert!(!limiter.check_at("a", 1).await.unwrap().allowed);
        assert!(limiter.check_at("b", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_enforce_maps_to_rate_limit_error() {
        let limiter = RateLimiter::new_in_memory().with_config(RateLimitConfig::per_minute(1));
        limiter.enforce("user-a").await.unwrap();
        match limiter.enforce("user-a").await {
            Err(BillingError::RateLimitExceeded {
                retry_after_seconds,
            }) => assert!(retry_after_seconds >= 1 && retry_after_seconds <= 60),
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_windows() {
        let limiter = RateLimiter::new_in_memory();
        limiter.check_at("stale", 0).await.unwrap();
        limiter.check("live").await.unwrap();
        assert_eq!(limiter.tracked_keys().await, 2);

        limiter.cleanup().await;
        assert_eq!(limiter.tracked_keys().await, 1);
    }
}
