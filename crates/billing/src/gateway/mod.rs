//! Provider gateway abstraction
//!
//! The only layer that talks to an external payment network. Each provider
//! variant implements [`PaymentGateway`] and normalizes provider responses into
//! snapshots the ledger understands. The [`ProviderRegistry`] holds one slot per
//! variant; there is no dynamic registration.

pub mod signature;
pub mod stripe_gateway;

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::types::{
    BillingInterval, Currency, Metadata, PaymentStatus, Provider, RefundStatus, ResourceKind,
    SubscriptionStatus,
};

pub use self::stripe_gateway::StripeGateway;

/// Failure reported by a provider, carrying the provider's code and message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: String,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone)]
pub struct CustomerRequest {
    pub user_id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub customer_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub description: Option<String>,
    pub statement_descriptor: Option<String>,
    pub metadata: Metadata,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub customer_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub interval: BillingInterval,
    pub interval_count: u32,
    pub product_name: String,
    pub product_description: Option<String>,
    pub trial_days: Option<u32>,
    pub metadata: Metadata,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub cancel_at_period_end: Option<bool>,
    pub metadata: Option<Metadata>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    /// Provider-side id of the payment being refunded
    pub provider_payment_id: String,
    pub amount: i64,
    pub reason: Option<String>,
    pub metadata: Metadata,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CustomerSnapshot {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PaymentSnapshot {
    pub id: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub client_secret: Option<String>,
    pub payment_method_type: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct RefundSnapshot {
    pub id: String,
    pub amount: i64,
    pub status: RefundStatus,
    pub failure_reason: Option<String>,
}

/// A verified webhook payload reduced to what reconciliation needs
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub event_type: String,
    pub resource: ResourceKind,
    pub resource_id: Option<String>,
    pub created_at: Option<OffsetDateTime>,
    pub payload: serde_json::Value,
}

impl NormalizedEvent {
    /// The provider object embedded in the event (`data.object`)
    pub fn object(&self) -> &serde_json::Value {
        &self.payload["data"]["object"]
    }

    /// A string field of the embedded provider object
    pub fn object_str(&self, field: &str) -> Option<&str> {
        self.object().get(field).and_then(|v| v.as_str())
    }
}

/// Capability set every provider variant implements
///
/// Mutating calls forward the request's idempotency key so provider-side retries of
/// the same logical operation are deduplicated by the provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> Provider;

    async fn create_customer(&self, req: &CustomerRequest) -> GatewayResult<CustomerSnapshot>;
    async fn get_customer(&self, customer_id: &str) -> GatewayResult<CustomerSnapshot>;

    async fn create_payment(&self, req: &PaymentRequest) -> GatewayResult<PaymentSnapshot>;
    async fn get_payment(&self, payment_id: &str) -> GatewayResult<PaymentSnapshot>;
    async fn cancel_payment(
        &self,
        payment_id: &str,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<PaymentSnapshot>;

    async fn create_subscription(
        &self,
        req: &SubscriptionRequest,
    ) -> GatewayResult<SubscriptionSnapshot>;
    async fn get_subscription(&self, subscription_id: &str)
        -> GatewayResult<SubscriptionSnapshot>;
    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> GatewayResult<SubscriptionSnapshot>;
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediate: bool,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<SubscriptionSnapshot>;

    async fn create_refund(&self, req: &RefundRequest) -> GatewayResult<RefundSnapshot>;
    async fn get_refund(&self, refund_id: &str) -> GatewayResult<RefundSnapshot>;

    /// Check a raw webhook payload against the provider's signature header
    fn verify_webhook(&self, payload: &[u8], signature: &str, secret: &str)
        -> GatewayResult<()>;

    /// Parse an already verified webhook payload
    fn parse_webhook(&self, payload: &[u8]) -> GatewayResult<NormalizedEvent>;
}

/// Closed set of provider gateways, one optional slot per variant
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    stripe: Option<Arc<dyn PaymentGateway>>,
    swish: Option<Arc<dyn PaymentGateway>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stripe(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.stripe = Some(gateway);
        self
    }

    pub fn with_swish(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.swish = Some(gateway);
        self
    }

    /// Gateway for a provider variant, or `ProviderUnavailable` if the slot is empty
    pub fn gateway(&self, provider: Provider) -> BillingResult<Arc<dyn PaymentGateway>> {
        let slot = match provider {
            Provider::Stripe => &self.stripe,
            Provider::Swish => &self.swish,
        };
        slot.clone()
            .ok_or(BillingError::ProviderUnavailable(provider))
    }

    pub fn is_available(&self, provider: Provider) -> bool {
        self.gateway(provider).is_ok()
    }

    pub fn available(&self) -> Vec<Provider> {
        Provider::ALL
            .iter()
            .copied()
            .filter(|p| self.is_available(*p))
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("available", &self.available())
            .finish()
    }
}
