//! Ledger store
//!
//! Durable storage for customers, payments, subscriptions, refunds and webhook
//! events. Every uniqueness rule the reconciliation logic relies on is enforced
//! here, not assumed by callers:
//!
//! - one non-deleted customer per user id
//! - (provider, provider id) per payment, subscription and refund
//! - (provider, provider event id) per webhook event
//! - refund reservations never exceed the payment amount (conditional write)
//! - payments and refunds never leave a terminal status (checked under the row lock)

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{
    Customer, Metadata, Page, Payment, PaymentStatus, Provider, Refund, RefundStatus,
    ResourceKind, Subscription, SubscriptionStatus, WebhookEventRecord,
};

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Status fields a payment update may change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentStateUpdate {
    pub status: PaymentStatus,
    pub payment_method_type: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

/// Provider-driven subscription fields, written as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    /// Replaces local metadata when set
    pub metadata: Option<Metadata>,
}

impl From<&Subscription> for SubscriptionState {
    fn from(sub: &Subscription) -> Self {
        Self {
            status: sub.status,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            trial_start: sub.trial_start,
            trial_end: sub.trial_end,
            cancel_at_period_end: sub.cancel_at_period_end,
            cancel_at: sub.cancel_at,
            canceled_at: sub.canceled_at,
            metadata: None,
        }
    }
}

/// Outcome of a status write that may not move a row out of a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite<T, S> {
    Applied(T),
    /// The row already holds the terminal status `current`; nothing was written
    TerminalRefused { current: S },
}

/// Outcome of a refund status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundTransition {
    pub previous: RefundStatus,
    pub current: RefundStatus,
    /// Whether this write returned the refund's amount to the payment
    pub released_reservation: bool,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider: Provider,
    pub provider_event_id: String,
    pub event_type: String,
    pub resource_type: ResourceKind,
    pub resource_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Result of trying to take processing rights for a webhook event
#[derive(Debug, Clone)]
pub enum WebhookClaim {
    /// Caller owns this processing attempt
    Claimed(WebhookEventRecord),
    /// A previous attempt already marked the event processed
    AlreadyProcessed(WebhookEventRecord),
    /// Another worker claimed it less than the claim timeout ago
    InFlight(WebhookEventRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFilter {
    All,
    /// Processed with a recorded error
    Failed,
    Unprocessed,
}

/// A payment whose refund bookkeeping disagrees with its refunds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundLedgerAnomaly {
    pub payment_id: Uuid,
    pub amount: i64,
    pub refunded_amount: i64,
    pub succeeded_total: i64,
    pub reserved_total: i64,
}

impl RefundLedgerAnomaly {
    /// Shared predicate so every store reports the same rows
    pub fn is_anomalous(&self) -> bool {
        self.succeeded_total > self.amount
            || self.refunded_amount > self.amount
            || self.refunded_amount != self.reserved_total
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Customers
    async fn find_customer_by_user(&self, user_id: &str) -> StoreResult<Option<Customer>>;
    async fn get_customer(&self, id: Uuid) -> StoreResult<Option<Customer>>;
    /// Fails with `Conflict` if the user already has a non-deleted customer
    async fn insert_customer(&self, customer: &Customer) -> StoreResult<Customer>;
    /// Fill the provider slot only if it is still empty; returns the current row
    async fn attach_provider_customer(
        &self,
        customer_id: Uuid,
        provider: Provider,
        provider_customer_id: &str,
    ) -> StoreResult<Customer>;
    async fn soft_delete_customer(&self, id: Uuid) -> StoreResult<OffsetDateTime>;

    // Payments
    async fn insert_payment(&self, payment: &Payment) -> StoreResult<Payment>;
    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>>;
    async fn find_payment_by_provider_id(
        &self,
        provider: Provider,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Payment>>;
    async fn list_payments(&self, customer_id: Uuid, page: Page)
        -> StoreResult<(Vec<Payment>, i64)>;
    /// Refused when the payment is terminal and `update` names another status
    async fn update_payment_state(
        &self,
        id: Uuid,
        update: &PaymentStateUpdate,
    ) -> StoreResult<StatusWrite<OffsetDateTime, PaymentStatus>>;
    /// Atomically add `amount` to the payment's reserved refund total if the total
    /// stays within the payment amount. Returns false when it would not.
    async fn reserve_refund(&self, payment_id: Uuid, amount: i64) -> StoreResult<bool>;
    async fn release_refund(&self, payment_id: Uuid, amount: i64) -> StoreResult<()>;

    // Subscriptions
    async fn insert_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription>;
    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>>;
    async fn find_subscription_by_provider_id(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>>;
    async fn list_subscriptions(
        &self,
        customer_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Subscription>, i64)>;
    async fn update_subscription_state(
        &self,
        id: Uuid,
        state: &SubscriptionState,
    ) -> StoreResult<OffsetDateTime>;

    // Refunds
    async fn insert_refund(&self, refund: &Refund) -> StoreResult<Refund>;
    async fn get_refund(&self, id: Uuid) -> StoreResult<Option<Refund>>;
    async fn find_refund_by_provider_id(
        &self,
        provider: Provider,
        provider_refund_id: &str,
    ) -> StoreResult<Option<Refund>>;
    async fn list_refunds_by_payment(
        &self,
        payment_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Refund>, i64)>;
    async fn list_refunds_by_customer(
        &self,
        customer_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Refund>, i64)>;
    /// Write a refund status; moving out of a reservation-holding status returns
    /// the refund amount to the payment in the same atomic step. Refused when the
    /// refund is terminal and `status` differs.
    async fn update_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        failure_reason: Option<&str>,
    ) -> StoreResult<StatusWrite<RefundTransition, RefundStatus>>;

    // Webhook events
    async fn claim_webhook_event(
        &self,
        event: &NewWebhookEvent,
        claim_timeout: Duration,
    ) -> StoreResult<WebhookClaim>;
    /// Re-take an unprocessed event whose claim is older than `claim_timeout`
    async fn reclaim_stale_webhook_event(
        &self,
        id: Uuid,
        claim_timeout: Duration,
    ) -> StoreResult<Option<WebhookEventRecord>>;
    /// Start another processing attempt regardless of the processed flag
    async fn begin_webhook_replay(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>>;
    /// `replayable` marks an error the failed-event replay should retry
    async fn mark_webhook_processed(
        &self,
        id: Uuid,
        error: Option<&str>,
        replayable: bool,
    ) -> StoreResult<OffsetDateTime>;
    async fn get_webhook_event(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>>;
    async fn list_webhook_events(
        &self,
        filter: WebhookFilter,
        page: Page,
    ) -> StoreResult<(Vec<WebhookEventRecord>, i64)>;
    /// Unprocessed events never claimed or claimed before `claimed_before`, oldest first
    async fn list_stale_webhook_events(
        &self,
        claimed_before: OffsetDateTime,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEventRecord>>;
    /// Events processed with a replayable error and fewer than `max_attempts`
    /// attempts, least recently attempted first
    async fn list_replayable_webhook_events(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEventRecord>>;
    /// Delete processed events received before `received_before`
    async fn delete_processed_webhook_events(
        &self,
        received_before: OffsetDateTime,
    ) -> StoreResult<u64>;

    // Audit
    async fn refund_ledger_anomalies(&self) -> StoreResult<Vec<RefundLedgerAnomaly>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refund_ledger_anomaly_predicate() {
        let healthy = RefundLedgerAnomaly {
            payment_id: Uuid::new_v4(),
            amount: 10_000,
            refunded_amount: 4_000,
            succeeded_total: 4_000,
            reserved_total: 4_000,
        };
        assert!(!healthy.is_anomalous());

        let overshoot = RefundLedgerAnomaly {
            succeeded_total: 11_000,
            reserved_total: 11_000,
            refunded_amount: 11_000,
            ..healthy.clone()
        };
        assert!(overshoot.is_anomalous());

        let drift = RefundLedgerAnomaly {
            refunded_amount: 3_000,
            ..healthy
        };
        assert!(drift.is_anomalous());
    }
}
