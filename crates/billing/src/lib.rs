// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider errors inline
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Paybridge Billing
//!
//! Payment, subscription and refund orchestration across payment providers, with
//! webhook reconciliation into a local ledger.
//!
//! ## Features
//!
//! - **Payments**: One-off payments with customer auto-linking per provider
//! - **Subscriptions**: Recurring billing with trials and end-of-period cancellation
//! - **Refunds**: Partial and full refunds that never exceed the payment amount
//! - **Webhooks**: Signature-verified, exactly-once reconciliation of provider events
//! - **Rate Limiting**: Per-user sliding window, shared through Redis
//! - **Idempotency**: Client idempotency keys with replay of the stored response
//! - **Invariants**: Runnable ledger consistency checks

pub mod config;
pub mod customers;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod invariants;
pub mod payments;
pub mod rate_limit;
pub mod refunds;
pub mod secrets;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod webhooks;

#[cfg(test)]
pub mod testing;


pub use config::{BillingConfig, StripeConfig, SwishConfig};
pub use customers::CustomerLinker;
pub use error::{BillingError, BillingResult};
pub use gateway::{GatewayError, PaymentGateway, ProviderRegistry, StripeGateway};
pub use idempotency::IdempotencyCache;
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};
pub use payments::{CreatePaymentRequest, PaymentManager};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use refunds::{CreateRefundRequest, RefundManager};
pub use secrets::{SecretCache, SecretSource, StaticSecretSource};
pub use store::{InMemoryLedger, LedgerStore, PgLedger, StoreError, WebhookFilter};
pub use subscriptions::{CreateSubscriptionRequest, SubscriptionManager, UpdateSubscriptionRequest};
pub use types::{
    BillingInterval, Currency, Customer, Metadata, Page, PageResult, Payment, PaymentStatus,
    Provider, Refund, RefundStatus, Subscription, SubscriptionStatus, WebhookEventRecord,
};
pub use webhooks::{IngestOutcome, WebhookReconciler, WebhookReplayResult};

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Shared pieces every component is built from
pub struct BillingParts {
    pub store: Arc<dyn LedgerStore>,
    pub providers: ProviderRegistry,
    pub secrets: Arc<SecretCache>,
    pub rate_limiter: RateLimiter,
    pub idempotency: IdempotencyCache,
    pub webhook_claim_timeout: std::time::Duration,
}

/// Main billing service that combines all billing functionality
///
/// User calls pass the rate limiter, then the idempotency cache, then the
/// lifecycle manager. Webhooks go straight to the reconciler.
pub struct BillingService {
    pub customers: Arc<CustomerLinker>,
    pub payments: Arc<PaymentManager>,
    pub subscriptions: SubscriptionManager,
    pub refunds: RefundManager,
    pub webhooks: WebhookReconciler,
    pub invariants: InvariantChecker,
    pub rate_limiter: RateLimiter,
    idempotency: IdempotencyCache,
}

#[derive(Serialize)]
struct TargetedRequest<'a, T: Serialize> {
    id: Uuid,
    #[serde(flatten)]
    body: &'a T,
}

impl BillingService {
    pub fn new(parts: BillingParts) -> Self {
        let BillingParts {
            store,
            providers,
            secrets,
            rate_limiter,
            idempotency,
            webhook_claim_timeout,
        } = parts;

        let customers = Arc::new(CustomerLinker::new(store.clone(), providers.clone()));
        let payments = Arc::new(PaymentManager::new(
            store.clone(),
            providers.clone(),
            customers.clone(),
        ));

        Self {
            subscriptions: SubscriptionManager::new(
                store.clone(),
                providers.clone(),
                customers.clone(),
            ),
            refunds: RefundManager::new(store.clone(), providers.clone(), payments.clone()),
            webhooks: WebhookReconciler::new(store.clone(), providers, secrets)
                .with_claim_timeout(webhook_claim_timeout),
            invariants: InvariantChecker::new(store, webhook_claim_timeout),
            customers,
            payments,
            rate_limiter,
            idempotency,
        }
    }

    /// Wire the production stack: Postgres ledger, Stripe gateway, Redis caches
    ///
    /// If Redis cannot be reached the rate limiter and idempotency cache fall back
    /// to process-local state.
    pub async fn from_config(config: &BillingConfig, pool: sqlx::PgPool) -> BillingResult<Self> {
        let store: Arc<dyn LedgerStore> = Arc::new(PgLedger::new(pool));

        // Swish has no gateway yet; its slot stays empty and reports ProviderUnavailable
        let providers = ProviderRegistry::new()
            .with_stripe(Arc::new(StripeGateway::new(&config.stripe.api_key)));
        if config.swish.is_some() {
            tracing::warn!("Swish is configured but no Swish gateway is available");
        }

        let secrets = Arc::new(SecretCache::new(
            Arc::new(StaticSecretSource::from_config(config)),
            config.webhook_secret_ttl,
        ));

        let rate_limiter = match RateLimiter::connect(&config.redis_url).await {
            Ok(limiter) => limiter,
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, using in-memory rate limiter");
                RateLimiter::new_in_memory()
            }
        }
        .with_config(RateLimitConfig::per_minute(config.rate_limit_per_minute));

        let idempotency = match IdempotencyCache::connect(&config.redis_url).await {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, using in-memory idempotency cache");
                IdempotencyCache::new_in_memory()
            }
        }
        .with_ttl(config.idempotency_ttl);

        tracing::info!(
            providers = ?providers.available(),
            rate_limit_per_minute = config.rate_limit_per_minute,
            "Billing service initialised"
        );

        Ok(Self::new(BillingParts {
            store,
            providers,
            secrets,
            rate_limiter,
            idempotency,
            webhook_claim_timeout: config.webhook_claim_timeout,
        }))
    }

    pub async fn create_payment(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
        req: CreatePaymentRequest,
    ) -> BillingResult<Payment> {
        self.rate_limiter.enforce(user_id).await?;
        self.idempotency
            .execute(
                user_id,
                "create_payment",
                req.idempotency_key.as_deref(),
                &req,
                || self.payments.create(user_id, email, name, req.clone()),
            )
            .await
    }

    pub async fn get_payment(&self, payment_id: Uuid, user_id: &str) -> BillingResult<Payment> {
        self.rate_limiter.enforce(user_id).await?;
        self.payments.get(payment_id, user_id).await
    }

    pub async fn list_payments(
        &self,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<Payment>> {
        self.rate_limiter.enforce(user_id).await?;
        self.payments.list(user_id, limit, offset).await
    }

    pub async fn cancel_payment(
        &self,
        payment_id: Uuid,
        user_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Payment> {
        self.rate_limiter.enforce(user_id).await?;
        self.idempotency
            .execute(
                user_id,
                "cancel_payment",
                idempotency_key,
                &payment_id,
                || self.payments.cancel(payment_id, user_id, idempotency_key),
            )
            .await
    }

    pub async fn create_subscription(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
        req: CreateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        self.rate_limiter.enforce(user_id).await?;
        self.idempotency
            .execute(
                user_id,
                "create_subscription",
                req.idempotency_key.as_deref(),
                &req,
                || self.subscriptions.create(user_id, email, name, req.clone()),
            )
            .await
    }

    pub async fn get_subscription(
        &self,
        subscription_id: Uuid,
        user_id: &str,
    ) -> BillingResult<Subscription> {
        self.rate_limiter.enforce(user_id).await?;
        self.subscriptions.get(subscription_id, user_id).await
    }

    pub async fn list_subscriptions(
        &self,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<Subscription>> {
        self.rate_limiter.enforce(user_id).await?;
        self.subscriptions.list(user_id, limit, offset).await
    }

    pub async fn update_subscription(
        &self,
        subscription_id: Uuid,
        user_id: &str,
        req: UpdateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        self.rate_limiter.enforce(user_id).await?;
        let key = req.idempotency_key.clone();
        let request = TargetedRequest {
            id: subscription_id,
            body: &req,
        };
        self.idempotency
            .execute(
                user_id,
                "update_subscription",
                key.as_deref(),
                &request,
                || self.subscriptions.update(subscription_id, user_id, req.clone()),
            )
            .await
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        user_id: &str,
        immediate: bool,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Subscription> {
        self.rate_limiter.enforce(user_id).await?;
        self.idempotency
            .execute(
                user_id,
                "cancel_subscription",
                idempotency_key,
                &(subscription_id, immediate),
                || {
                    self.subscriptions
                        .cancel(subscription_id, user_id, immediate, idempotency_key)
                },
            )
            .await
    }

    pub async fn create_refund(
        &self,
        user_id: &str,
        req: CreateRefundRequest,
    ) -> BillingResult<Refund> {
        self.rate_limiter.enforce(user_id).await?;
        self.idempotency
            .execute(
                user_id,
                "create_refund",
                req.idempotency_key.as_deref(),
                &req,
                || self.refunds.create(user_id, req.clone()),
            )
            .await
    }

    pub async fn get_refund(&self, refund_id: Uuid, user_id: &str) -> BillingResult<Refund> {
        self.rate_limiter.enforce(user_id).await?;
        self.refunds.get(refund_id, user_id).await
    }

    pub async fn list_payment_refunds(
        &self,
        payment_id: Uuid,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<Refund>> {
        self.rate_limiter.enforce(user_id).await?;
        self.refunds
            .list_by_payment(payment_id, user_id, limit, offset)
            .await
    }

    pub async fn list_refunds(
        &self,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<Refund>> {
        self.rate_limiter.enforce(user_id).await?;
        self.refunds.list_by_customer(user_id, limit, offset).await
    }

    pub async fn get_customer(&self, user_id: &str) -> BillingResult<Option<Customer>> {
        self.rate_limiter.enforce(user_id).await?;
        self.customers.find(user_id).await
    }

    pub async fn delete_customer(&self, user_id: &str) -> BillingResult<OffsetDateTime> {
        self.rate_limiter.enforce(user_id).await?;
        self.customers.soft_delete(user_id).await
    }

    /// Provider webhook entry point; not rate limited
    pub async fn handle_webhook(
        &self,
        provider: Provider,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<IngestOutcome> {
        self.webhooks.ingest(provider, payload, signature).await
    }
}
