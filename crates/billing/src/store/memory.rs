//! In-memory ledger store
//!
//! Same uniqueness rules and atomic refund reservation as the PostgreSQL store,
//! behind a single lock. Used by tests and local runs without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{
    LedgerStore, NewWebhookEvent, PaymentStateUpdate, RefundLedgerAnomaly, RefundTransition,
    StatusWrite, StoreError, StoreResult, SubscriptionState, WebhookClaim, WebhookFilter,
};
use crate::types::{
    Customer, Page, Payment, PaymentStatus, Provider, Refund, RefundStatus, Subscription,
    WebhookEventRecord,
};

#[derive(Default)]
struct LedgerState {
    customers: HashMap<Uuid, Customer>,
    payments: HashMap<Uuid, Payment>,
    subscriptions: HashMap<Uuid, Subscription>,
    refunds: HashMap<Uuid, Refund>,
    webhooks: HashMap<Uuid, WebhookEventRecord>,
}

impl LedgerState {
    fn webhook_by_event(&self, provider: Provider, event_id: &str) -> Option<&WebhookEventRecord> {
        self.webhooks
            .values()
            .find(|w| w.provider == provider && w.provider_event_id == event_id)
    }

    fn webhook_by_event_mut(
        &mut self,
        provider: Provider,
        event_id: &str,
    ) -> Option<&mut WebhookEventRecord> {
        self.webhooks
            .values_mut()
            .find(|w| w.provider == provider && w.provider_event_id == event_id)
    }
}

fn claim_is_stale(record: &WebhookEventRecord, now: OffsetDateTime, timeout: Duration) -> bool {
    match record.processing_started_at {
        None => true,
        Some(started) => started < now - timeout,
    }
}

/// Newest first, then the page window
fn paginate<T: Clone>(
    mut items: Vec<T>,
    page: Page,
    key: impl Fn(&T) -> (OffsetDateTime, Uuid),
) -> (Vec<T>, i64) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
    let total = items.len() as i64;
    let window = items
        .into_iter()
        .skip(page.offset.max(0) as usize)
        .take(page.limit.max(0) as usize)
        .collect();
    (window, total)
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory ledger offline".to_string()));
        }
        Ok(())
    }

    /// Move a claim timestamp back, simulating a worker that stalled mid-processing
    pub async fn backdate_webhook_claim(&self, id: Uuid, by: Duration) {
        let mut state = self.state.write().await;
        if let Some(record) = state.webhooks.get_mut(&id) {
            record.processing_started_at = record.processing_started_at.map(|ts| ts - by);
        }
    }

    /// Move the receipt timestamp back, for retention tests
    pub async fn backdate_webhook_received(&self, id: Uuid, by: Duration) {
        let mut state = self.state.write().await;
        if let Some(record) = state.webhooks.get_mut(&id) {
            record.received_at -= by;
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn find_customer_by_user(&self, user_id: &str) -> StoreResult<Option<Customer>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .customers
            .values()
            .find(|c| c.user_id == user_id && c.deleted_at.is_none())
            .cloned())
    }

    async fn get_customer(&self, id: Uuid) -> StoreResult<Option<Customer>> {
        self.check_available()?;
        Ok(self.state.read().await.customers.get(&id).cloned())
    }

    async fn insert_customer(&self, customer: &Customer) -> StoreResult<Customer> {
        self.check_available()?;
        let mut state = self.state.write().await;

        let user_taken = state
            .customers
            .values()
            .any(|c| c.user_id == customer.user_id && c.deleted_at.is_none());
        if user_taken {
            return Err(StoreError::Conflict(format!(
                "customer for user {}",
                customer.user_id
            )));
        }
        for provider in Provider::ALL {
            if let Some(pid) = customer.provider_ids.get(*provider) {
                let taken = state
                    .customers
                    .values()
                    .any(|c| c.provider_ids.get(*provider) == Some(pid));
                if taken {
                    return Err(StoreError::Conflict(format!("{} customer {}", provider, pid)));
                }
            }
        }

        state.customers.insert(customer.id, customer.clone());
        Ok(customer.clone())
    }

    async fn attach_provider_customer(
        &self,
        customer_id: Uuid,
        provider: Provider,
        provider_customer_id: &str,
    ) -> StoreResult<Customer> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let customer = state
            .customers
            .get_mut(&customer_id)
            .ok_or_else(|| StoreError::NotFound(format!("customer {}", customer_id)))?;

        if customer.provider_ids.get(provider).is_none() {
            customer
                .provider_ids
                .set(provider, provider_customer_id.to_string());
            customer.updated_at = OffsetDateTime::now_utc();
        }
        Ok(customer.clone())
    }

    async fn soft_delete_customer(&self, id: Uuid) -> StoreResult<OffsetDateTime> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let customer = state
            .customers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("customer {}", id)))?;
        let now = OffsetDateTime::now_utc();
        let deleted_at = *customer.deleted_at.get_or_insert(now);
        customer.updated_at = now;
        Ok(deleted_at)
    }

    async fn insert_payment(&self, payment: &Payment) -> StoreResult<Payment> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let duplicate = state.payments.values().any(|p| {
            p.provider == payment.provider && p.provider_payment_id == payment.provider_payment_id
        });
        if duplicate || state.payments.contains_key(&payment.id) {
            return Err(StoreError::Conflict(format!(
                "payment {}",
                payment.provider_payment_id
            )));
        }
        state.payments.insert(payment.id, payment.clone());
        Ok(payment.clone())
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        self.check_available()?;
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn find_payment_by_provider_id(
        &self,
        provider: Provider,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Payment>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.provider == provider && p.provider_payment_id == provider_payment_id)
            .cloned())
    }

    async fn list_payments(
        &self,
        customer_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Payment>, i64)> {
        self.check_available()?;
        let state = self.state.read().await;
        let owned = state
            .payments
            .values()
            .filter(|p| p.customer_id == customer_id)
            .cloned()
            .collect();
        Ok(paginate(owned, page, |p| (p.created_at, p.id)))
    }

    async fn update_payment_state(
        &self,
        id: Uuid,
        update: &PaymentStateUpdate,
    ) -> StoreResult<StatusWrite<OffsetDateTime, PaymentStatus>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let payment = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))?;
        if payment.status.is_terminal() && payment.status != update.status {
            return Ok(StatusWrite::TerminalRefused {
                current: payment.status,
            });
        }

        let now = OffsetDateTime::now_utc();
        payment.status = update.status;
        if update.payment_method_type.is_some() {
            payment.payment_method_type = update.payment_method_type.clone();
        }
        payment.failure_code = update.failure_code.clone();
        payment.failure_message = update.failure_message.clone();
        if update.status == PaymentStatus::Succeeded && payment.completed_at.is_none() {
            payment.completed_at = Some(now);
        }
        payment.updated_at = now;
        Ok(StatusWrite::Applied(now))
    }

    async fn reserve_refund(&self, payment_id: Uuid, amount: i64) -> StoreResult<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", payment_id)))?;

        if payment.refunded_amount + amount > payment.amount {
            return Ok(false);
        }
        payment.refunded_amount += amount;
        payment.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn release_refund(&self, payment_id: Uuid, amount: i64) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(payment) = state.payments.get_mut(&payment_id) {
            payment.refunded_amount = (payment.refunded_amount - amount).max(0);
            payment.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let duplicate = state.subscriptions.values().any(|s| {
            s.provider == subscription.provider
                && s.provider_subscription_id == subscription.provider_subscription_id
        });
        if duplicate || state.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::Conflict(format!(
                "subscription {}",
                subscription.provider_subscription_id
            )));
        }
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription.clone())
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        self.check_available()?;
        Ok(self.state.read().await.subscriptions.get(&id).cloned())
    }

    async fn find_subscription_by_provider_id(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| {
                s.provider == provider && s.provider_subscription_id == provider_subscription_id
            })
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        customer_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Subscription>, i64)> {
        self.check_available()?;
        let state = self.state.read().await;
        let owned = state
            .subscriptions
            .values()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect();
        Ok(paginate(owned, page, |s| (s.created_at, s.id)))
    }

    async fn update_subscription_state(
        &self,
        id: Uuid,
        update: &SubscriptionState,
    ) -> StoreResult<OffsetDateTime> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", id)))?;

        let now = OffsetDateTime::now_utc();
        sub.status = update.status;
        sub.current_period_start = update.current_period_start;
        sub.current_period_end = update.current_period_end;
        sub.trial_start = update.trial_start;
        sub.trial_end = update.trial_end;
        sub.cancel_at_period_end = update.cancel_at_period_end;
        sub.cancel_at = update.cancel_at;
        sub.canceled_at = update.canceled_at;
        if let Some(metadata) = &update.metadata {
            sub.metadata = metadata.clone();
        }
        sub.updated_at = now;
        Ok(now)
    }

    async fn insert_refund(&self, refund: &Refund) -> StoreResult<Refund> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let duplicate = state.refunds.values().any(|r| {
            r.provider == refund.provider && r.provider_refund_id == refund.provider_refund_id
        });
        if duplicate || state.refunds.contains_key(&refund.id) {
            return Err(StoreError::Conflict(format!(
                "refund {}",
                refund.provider_refund_id
            )));
        }
        state.refunds.insert(refund.id, refund.clone());
        Ok(refund.clone())
    }

    async fn get_refund(&self, id: Uuid) -> StoreResult<Option<Refund>> {
        self.check_available()?;
        Ok(self.state.read().await.refunds.get(&id).cloned())
    }

    async fn find_refund_by_provider_id(
        &self,
        provider: Provider,
        provider_refund_id: &str,
    ) -> StoreResult<Option<Refund>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .refunds
            .values()
            .find(|r| r.provider == provider && r.provider_refund_id == provider_refund_id)
            .cloned())
    }

    async fn list_refunds_by_payment(
        &self,
        payment_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Refund>, i64)> {
        self.check_available()?;
        let state = self.state.read().await;
        let refunds = state
            .refunds
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect();
        Ok(paginate(refunds, page, |r| (r.created_at, r.id)))
    }

    async fn list_refunds_by_customer(
        &self,
        customer_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Refund>, i64)> {
        self.check_available()?;
        let state = self.state.read().await;
        let refunds = state
            .refunds
            .values()
            .filter(|r| {
                state
                    .payments
                    .get(&r.payment_id)
                    .is_some_and(|p| p.customer_id == customer_id)
            })
            .cloned()
            .collect();
        Ok(paginate(refunds, page, |r| (r.created_at, r.id)))
    }

    async fn update_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        failure_reason: Option<&str>,
    ) -> StoreResult<StatusWrite<RefundTransition, RefundStatus>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let refund = state
            .refunds
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("refund {}", id)))?;
        let previous = refund.status;
        if previous.is_terminal() && previous != status {
            return Ok(StatusWrite::TerminalRefused { current: previous });
        }

        let now = OffsetDateTime::now_utc();
        refund.status = status;
        if let Some(reason) = failure_reason {
            refund.failure_reason = Some(reason.to_string());
        }
        refund.updated_at = now;
        let (payment_id, amount) = (refund.payment_id, refund.amount);

        let released_reservation = previous.holds_reservation() && !status.holds_reservation();
        if released_reservation {
            if let Some(payment) = state.payments.get_mut(&payment_id) {
                payment.refunded_amount = (payment.refunded_amount - amount).max(0);
                payment.updated_at = now;
            }
        }

        Ok(StatusWrite::Applied(RefundTransition {
            previous,
            current: status,
            released_reservation,
            updated_at: now,
        }))
    }

    async fn claim_webhook_event(
        &self,
        event: &NewWebhookEvent,
        claim_timeout: Duration,
    ) -> StoreResult<WebhookClaim> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = state.webhook_by_event_mut(event.provider, &event.provider_event_id)
        {
            if existing.processed {
                return Ok(WebhookClaim::AlreadyProcessed(existing.clone()));
            }
            if !claim_is_stale(existing, now, claim_timeout) {
                return Ok(WebhookClaim::InFlight(existing.clone()));
            }
            existing.processing_started_at = Some(now);
            existing.processing_attempts += 1;
            return Ok(WebhookClaim::Claimed(existing.clone()));
        }

        let record = WebhookEventRecord {
            id: Uuid::new_v4(),
            provider: event.provider,
            provider_event_id: event.provider_event_id.clone(),
            event_type: event.event_type.clone(),
            resource_type: event.resource_type.as_str().to_string(),
            resource_id: event.resource_id.clone(),
            payload: event.payload.clone(),
            processed: false,
            processing_error: None,
            error_replayable: false,
            processing_attempts: 1,
            received_at: now,
            processing_started_at: Some(now),
            processed_at: None,
        };
        state.webhooks.insert(record.id, record.clone());
        Ok(WebhookClaim::Claimed(record))
    }

    async fn reclaim_stale_webhook_event(
        &self,
        id: Uuid,
        claim_timeout: Duration,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();
        match state.webhooks.get_mut(&id) {
            Some(record) if !record.processed && claim_is_stale(record, now, claim_timeout) => {
                record.processing_started_at = Some(now);
                record.processing_attempts += 1;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn begin_webhook_replay(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        Ok(state
            .webhook_by_event_mut(provider, provider_event_id)
            .map(|record| {
                record.processing_started_at = Some(OffsetDateTime::now_utc());
                record.processing_attempts += 1;
                record.clone()
            }))
    }

    async fn mark_webhook_processed(
        &self,
        id: Uuid,
        error: Option<&str>,
        replayable: bool,
    ) -> StoreResult<OffsetDateTime> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let record = state
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook event {}", id)))?;
        let now = OffsetDateTime::now_utc();
        record.processed = true;
        record.processing_error = error.map(str::to_string);
        record.error_replayable = error.is_some() && replayable;
        record.processed_at = Some(now);
        Ok(now)
    }

    async fn get_webhook_event(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.webhook_by_event(provider, provider_event_id).cloned())
    }

    async fn list_webhook_events(
        &self,
        filter: WebhookFilter,
        page: Page,
    ) -> StoreResult<(Vec<WebhookEventRecord>, i64)> {
        self.check_available()?;
        let state = self.state.read().await;
        let matching = state
            .webhooks
            .values()
            .filter(|w| match filter {
                WebhookFilter::All => true,
                WebhookFilter::Failed => w.processed && w.processing_error.is_some(),
                WebhookFilter::Unprocessed => !w.processed,
            })
            .cloned()
            .collect();
        Ok(paginate(matching, page, |w| (w.received_at, w.id)))
    }

    async fn list_stale_webhook_events(
        &self,
        claimed_before: OffsetDateTime,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEventRecord>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut stale: Vec<_> = state
            .webhooks
            .values()
            .filter(|w| {
                !w.processed
                    && w
                        .processing_started_at
                        .map_or(true, |started| started < claimed_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|w| w.received_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn list_replayable_webhook_events(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEventRecord>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut failed: Vec<_> = state
            .webhooks
            .values()
            .filter(|w| {
                w.processed
                    && w.processing_error.is_some()
                    && w.error_replayable
                    && w.processing_attempts < max_attempts
            })
            .cloned()
            .collect();
        // None sorts first, matching NULLS FIRST
        failed.sort_by_key(|w| (w.processing_started_at, w.received_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn delete_processed_webhook_events(
        &self,
        received_before: OffsetDateTime,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before = state.webhooks.len();
        state
            .webhooks
            .retain(|_, w| !(w.processed && w.received_at < received_before));
        Ok((before - state.webhooks.len()) as u64)
    }

    async fn refund_ledger_anomalies(&self) -> StoreResult<Vec<RefundLedgerAnomaly>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut anomalies: Vec<_> = state
            .payments
            .values()
            .map(|p| {
                let refunds = state.refunds.values().filter(|r| r.payment_id == p.id);
                let (succeeded_total, reserved_total) =
                    refunds.fold((0, 0), |(succeeded, reserved), r| {
                        (
                            succeeded + if r.status == RefundStatus::Succeeded { r.amount } else { 0 },
                            reserved + if r.status.holds_reservation() { r.amount } else { 0 },
                        )
                    });
                RefundLedgerAnomaly {
                    payment_id: p.id,
                    amount: p.amount,
                    refunded_amount: p.refunded_amount,
                    succeeded_total,
                    reserved_total,
                }
            })
            .filter(RefundLedgerAnomaly::is_anomalous)
            .collect();
        anomalies.sort_by_key(|a| a.payment_id);
        Ok(anomalies)
    }
}
