//! Environment-driven configuration

use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 100;
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 86_400;
pub const DEFAULT_WEBHOOK_SECRET_TTL_SECS: u64 = 300;
pub const DEFAULT_WEBHOOK_CLAIM_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WEBHOOK_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub api_key: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct SwishConfig {
    pub api_url: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub database_url: String,
    pub redis_url: String,
    pub stripe: StripeConfig,
    /// Present when `SWISH_API_URL` is set
    pub swish: Option<SwishConfig>,
    pub rate_limit_per_minute: u32,
    pub idempotency_ttl: Duration,
    pub webhook_secret_ttl: Duration,
    pub webhook_claim_timeout: Duration,
    pub webhook_retention_days: i64,
    pub environment: String,
    pub json_logs: bool,
}

fn optional(key: &str) -> Option<String> {
    dotenvy::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str) -> BillingResult<String> {
    optional(key).ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
}

fn parsed<T: FromStr>(key: &str, default: T) -> BillingResult<T> {
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value '{}'", key, raw))),
    }
}

impl BillingConfig {
    /// Read configuration from the process environment (and `.env` if present)
    pub fn from_env() -> BillingResult<Self> {
        let stripe = StripeConfig {
            api_key: required("STRIPE_API_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
        };

        let swish = optional("SWISH_API_URL").map(|api_url| SwishConfig {
            api_url,
            cert_path: optional("SWISH_CERT_PATH"),
            key_path: optional("SWISH_KEY_PATH"),
            webhook_secret: optional("SWISH_WEBHOOK_SECRET"),
        });

        let rate_limit_per_minute = parsed("RATE_LIMIT_PER_MINUTE", DEFAULT_RATE_LIMIT_PER_MINUTE)?;
        if rate_limit_per_minute == 0 {
            return Err(BillingError::Config(
                "RATE_LIMIT_PER_MINUTE must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: optional("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            stripe,
            swish,
            rate_limit_per_minute,
            idempotency_ttl: Duration::from_secs(parsed(
                "IDEMPOTENCY_TTL_SECS",
                DEFAULT_IDEMPOTENCY_TTL_SECS,
            )?),
            webhook_secret_ttl: Duration::from_secs(parsed(
                "WEBHOOK_SECRET_TTL_SECS",
                DEFAULT_WEBHOOK_SECRET_TTL_SECS,
            )?),
            webhook_claim_timeout: Duration::from_secs(parsed(
                "WEBHOOK_CLAIM_TIMEOUT_SECS",
                DEFAULT_WEBHOOK_CLAIM_TIMEOUT_SECS,
            )?),
            webhook_retention_days: parsed(
                "WEBHOOK_RETENTION_DAYS",
                DEFAULT_WEBHOOK_RETENTION_DAYS,
            )?,
            environment: optional("ENV").unwrap_or_else(|| "development".to_string()),
            json_logs: optional("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "DATABASE_URL",
        "REDIS_URL",
        "STRIPE_API_KEY",
        "STRIPE_WEBHOOK_SECRET",
        "SWISH_API_URL",
        "SWISH_WEBHOOK_SECRET",
        "RATE_LIMIT_PER_MINUTE",
        "IDEMPOTENCY_TTL_SECS",
        "WEBHOOK_RETENTION_DAYS",
        "ENV",
        "LOG_FORMAT",
    ];

    fn reset_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
        std::env::set_var("DATABASE_URL", "postgres://localhost/paybridge_test");
        std::env::set_var("STRIPE_API_KEY", "sk_test_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_123");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        reset_env();
        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.rate_limit_per_minute, 100);
        assert_eq!(config.idempotency_ttl, Duration::from_secs(86_400));
        assert_eq!(config.webhook_secret_ttl, Duration::from_secs(300));
        assert_eq!(config.webhook_retention_days, 30);
        assert_eq!(config.environment, "development");
        assert!(config.swish.is_none());
        assert!(!config.json_logs);
        assert!(!config.is_production());
    }

    #[test]
    #[serial]
    fn test_missing_required_value() {
        reset_env();
        std::env::remove_var("STRIPE_API_KEY");
        match BillingConfig::from_env() {
            Err(BillingError::Config(msg)) => assert!(msg.contains("STRIPE_API_KEY")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    #[serial]
    fn test_overrides_and_swish() {
        reset_env();
        std::env::set_var("RATE_LIMIT_PER_MINUTE", "250");
        std::env::set_var("SWISH_API_URL", "https://mss.cpc.getswish.net/swish-cpcapi/api");
        std::env::set_var("SWISH_WEBHOOK_SECRET", "swish_secret");
        std::env::set_var("LOG_FORMAT", "JSON");
        std::env::set_var("ENV", "production");

        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.rate_limit_per_minute, 250);
        let swish = config.swish.as_ref().unwrap();
        assert_eq!(swish.webhook_secret.as_deref(), Some("swish_secret"));
        assert!(config.json_logs);
        assert!(config.is_production());
        reset_env();
    }

    #[test]
    #[serial]
    fn test_invalid_number_rejected() {
        reset_env();
        std::env::set_var("WEBHOOK_RETENTION_DAYS", "thirty");
        assert!(matches!(
            BillingConfig::from_env(),
            Err(BillingError::Config(_))
        ));
        std::env::set_var("WEBHOOK_RETENTION_DAYS", "30");
        std::env::set_var("RATE_LIMIT_PER_MINUTE", "0");
        assert!(matches!(
            BillingConfig::from_env(),
            Err(BillingError::Config(_))
        ));
        reset_env();
    }
}
