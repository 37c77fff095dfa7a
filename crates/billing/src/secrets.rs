//! Webhook signing secret cache
//!
//! Secrets come from a [`SecretSource`] and are cached per provider for a fixed
//! TTL. The composition root owns the cache and hands it to the webhook engine;
//! there is no global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::types::Provider;

#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Current signing secret for `provider`, `None` when none is configured
    async fn webhook_secret(&self, provider: Provider) -> BillingResult<Option<String>>;
}

/// Fixed secrets, typically read once from configuration
#[derive(Clone, Default)]
pub struct StaticSecretSource {
    secrets: HashMap<Provider, String>,
}

impl StaticSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, provider: Provider, secret: impl Into<String>) -> Self {
        self.secrets.insert(provider, secret.into());
        self
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        let mut source = Self::new().with_secret(Provider::Stripe, &config.stripe.webhook_secret);
        if let Some(secret) = config
            .swish
            .as_ref()
            .and_then(|swish| swish.webhook_secret.as_ref())
        {
            source = source.with_secret(Provider::Swish, secret);
        }
        source
    }
}

#[async_trait]
impl SecretSource for StaticSecretSource {
    async fn webhook_secret(&self, provider: Provider) -> BillingResult<Option<String>> {
        Ok(self.secrets.get(&provider).cloned())
    }
}

struct CachedSecret {
    value: String,
    fetched_at: Instant,
}

pub struct SecretCache {
    source: Arc<dyn SecretSource>,
    ttl: Duration,
    entries: RwLock<HashMap<Provider, CachedSecret>>,
}

impl SecretCache {
    pub fn new(source: Arc<dyn SecretSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Secret for `provider`, refreshed from the source once the cached copy expires
    ///
    /// When a refresh fails the previous value keeps being served. A provider with
    /// no secret at all is a configuration error.
    pub async fn get(&self, provider: Provider) -> BillingResult<String> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&provider) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        let mut entries = self.entries.write().await;
        // Another task may have refreshed while we waited for the write lock
        if let Some(entry) = entries.get(&provider) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.value.clone());
            }
        }

        match self.source.webhook_secret(provider).await {
            Ok(Some(value)) if !value.is_empty() => {
                entries.insert(
                    provider,
                    CachedSecret {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                tracing::debug!(provider = %provider, "Webhook secret refreshed");
                Ok(value)
            }
            Ok(_) => {
                entries.remove(&provider);
                Err(BillingError::Config(format!(
                    "no webhook secret configured for {}",
                    provider
                )))
            }
            Err(e) => match entries.get(&provider) {
                Some(stale) => {
                    tracing::warn!(
                        provider = %provider,
                        error = %e,
                        "Webhook secret refresh failed, serving cached value"
                    );
                    Ok(stale.value.clone())
                }
                None => Err(e),
            },
        }
    }

    pub async fn invalidate(&self, provider: Provider) {
        self.entries.write().await.remove(&provider);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingSource {
        fetches: AtomicUsize,
        value: Mutex<Option<String>>,
        failing: Mutex<bool>,
    }

    impl CountingSource {
        fn new(value: &str) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                value: Mutex::new(Some(value.to_string())),
                failing: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl SecretSource for CountingSource {
        async fn webhook_secret(&self, _provider: Provider) -> BillingResult<Option<String>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if *self.failing.lock().unwrap() {
                return Err(BillingError::Internal("vault unreachable".to_string()));
            }
            Ok(self.value.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_cached_within_ttl() {
        let source = Arc::new(CountingSource::new("whsec_1"));
        let cache = SecretCache::new(source.clone(), Duration::from_secs(300));

        assert_eq!(cache.get(Provider::Stripe).await.unwrap(), "whsec_1");
        *source.value.lock().unwrap() = Some("whsec_2".to_string());
        assert_eq!(cache.get(Provider::Stripe).await.unwrap(), "whsec_1");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        cache.invalidate(Provider::Stripe).await;
        assert_eq!(cache.get(Provider::Stripe).await.unwrap(), "whsec_2");
    }

    #[tokio::test]
    async fn test_expired_entry_refetched() {
        let source = Arc::new(CountingSource::new("whsec_1"));
        let cache = SecretCache::new(source.clone(), Duration::ZERO);

        cache.get(Provider::Stripe).await.unwrap();
        cache.get(Provider::Stripe).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_value() {
        let source = Arc::new(CountingSource::new("whsec_1"));
        let cache = SecretCache::new(source.clone(), Duration::ZERO);

        cache.get(Provider::Stripe).await.unwrap();
        *source.failing.lock().unwrap() = true;
        assert_eq!(cache.get(Provider::Stripe).await.unwrap(), "whsec_1");
    }

    #[tokio::test]
    async fn test_missing_secret_is_config_error() {
        let cache = SecretCache::new(Arc::new(StaticSecretSource::new()), Duration::from_secs(60));
        assert!(matches!(
            cache.get(Provider::Swish).await,
            Err(BillingError::Config(_))
        ));
    }
}
