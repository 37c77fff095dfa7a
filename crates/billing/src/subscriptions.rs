//! Recurring subscription lifecycle
//!
//! Subscription status is owned by the provider. This manager never computes a
//! transition itself: it forwards the caller's intent and records whatever state
//! the provider reports back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::customers::CustomerLinker;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ProviderRegistry, SubscriptionRequest, SubscriptionSnapshot, SubscriptionUpdate};
use crate::store::{LedgerStore, SubscriptionState};
use crate::types::{
    BillingInterval, Currency, Metadata, Page, PageResult, Provider, Subscription,
};

/// Longest trial a subscription may start with (two years)
pub const MAX_TRIAL_DAYS: u32 = 730;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub provider: Provider,
    pub amount: i64,
    pub currency: Currency,
    pub interval: BillingInterval,
    /// Missing or zero means every single interval
    #[serde(default)]
    pub interval_count: Option<u32>,
    pub product_name: String,
    #[serde(default)]
    pub product_description: Option<String>,
    #[serde(default)]
    pub trial_days: Option<u32>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl CreateSubscriptionRequest {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount <= 0 {
            return Err(BillingError::ValidationFailed(
                "amount must be greater than zero".to_string(),
            ));
        }
        if self.product_name.trim().is_empty() {
            return Err(BillingError::ValidationFailed(
                "product name is required".to_string(),
            ));
        }
        if self.trial_days.is_some_and(|days| days > MAX_TRIAL_DAYS) {
            return Err(BillingError::ValidationFailed(format!(
                "trial cannot exceed {} days",
                MAX_TRIAL_DAYS
            )));
        }
        Ok(())
    }

    pub fn effective_interval_count(&self) -> u32 {
        self.interval_count.filter(|c| *c >= 1).unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSubscriptionRequest {
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    /// Replaces the stored metadata when present
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn state_from_snapshot(snapshot: &SubscriptionSnapshot, metadata: Option<Metadata>) -> SubscriptionState {
    SubscriptionState {
        status: snapshot.status,
        current_period_start: snapshot.current_period_start,
        current_period_end: snapshot.current_period_end,
        trial_start: snapshot.trial_start,
        trial_end: snapshot.trial_end,
        cancel_at_period_end: snapshot.cancel_at_period_end,
        cancel_at: snapshot.cancel_at,
        canceled_at: snapshot.canceled_at,
        metadata,
    }
}

fn apply_state(sub: &mut Subscription, state: SubscriptionState, updated_at: OffsetDateTime) {
    sub.status = state.status;
    sub.current_period_start = state.current_period_start;
    sub.current_period_end = state.current_period_end;
    sub.trial_start = state.trial_start;
    sub.trial_end = state.trial_end;
    sub.cancel_at_period_end = state.cancel_at_period_end;
    sub.cancel_at = state.cancel_at;
    sub.canceled_at = state.canceled_at;
    if let Some(metadata) = state.metadata {
        sub.metadata = metadata;
    }
    sub.updated_at = updated_at;
}

pub struct SubscriptionManager {
    store: Arc<dyn LedgerStore>,
    providers: ProviderRegistry,
    customers: Arc<CustomerLinker>,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        providers: ProviderRegistry,
        customers: Arc<CustomerLinker>,
    ) -> Self {
        Self {
            store,
            providers,
            customers,
        }
    }

    pub async fn create(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
        req: CreateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        req.validate()?;
        let gateway = self.providers.gateway(req.provider)?;
        let interval_count = req.effective_interval_count();

        let customer = self
            .customers
            .resolve(user_id, email, name, req.provider)
            .await?;
        let provider_customer_id = customer
            .provider_ids
            .get(req.provider)
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "customer {} has no {} id after linking",
                    customer.id, req.provider
                ))
            })?
            .to_string();

        let snapshot = gateway
            .create_subscription(&SubscriptionRequest {
                customer_id: provider_customer_id,
                amount: req.amount,
                currency: req.currency,
                interval: req.interval,
                interval_count,
                product_name: req.product_name.clone(),
                product_description: req.product_description.clone(),
                trial_days: req.trial_days,
                metadata: req.metadata.clone(),
                idempotency_key: req.idempotency_key.clone(),
            })
            .await
            .map_err(|e| {
                tracing::warn!(
                    customer_id = %customer.id,
                    provider = %req.provider,
                    code = %e.code,
                    "Provider rejected subscription"
                );
                BillingError::PaymentFailed(e)
            })?;

        let now = OffsetDateTime::now_utc();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            customer_id: customer.id,
            provider: req.provider,
            provider_subscription_id: snapshot.id.clone(),
            amount: req.amount,
            currency: req.currency,
            interval: req.interval,
            interval_count: i32::try_from(interval_count).unwrap_or(i32::MAX),
            status: snapshot.status,
            current_period_start: snapshot.current_period_start,
            current_period_end: snapshot.current_period_end,
            trial_start: snapshot.trial_start,
            trial_end: snapshot.trial_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
            cancel_at: snapshot.cancel_at,
            canceled_at: snapshot.canceled_at,
            product_name: req.product_name,
            product_description: req.product_description,
            metadata: req.metadata,
            idempotency_key: req.idempotency_key,
            created_at: now,
            updated_at: now,
        };

        let stored = self
            .store
            .insert_subscription(&subscription)
            .await
            .map_err(|e| {
                tracing::error!(
                    provider = %subscription.provider,
                    provider_subscription_id = %subscription.provider_subscription_id,
                    customer_id = %subscription.customer_id,
                    error = %e,
                    "Subscription created at provider but ledger write failed"
                );
                BillingError::from(e)
            })?;

        tracing::info!(
            subscription_id = %stored.id,
            provider_subscription_id = %stored.provider_subscription_id,
            interval = %stored.interval,
            interval_count = stored.interval_count,
            status = %stored.status,
            "Subscription created"
        );
        Ok(stored)
    }

    pub async fn get(&self, subscription_id: Uuid, user_id: &str) -> BillingResult<Subscription> {
        let not_found = || BillingError::NotFound(format!("subscription {}", subscription_id));

        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(not_found)?;
        match self.store.get_customer(subscription.customer_id).await? {
            Some(customer) if customer.user_id == user_id => Ok(subscription),
            _ => Err(not_found()),
        }
    }

    pub async fn list(
        &self,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<Subscription>> {
        let page = Page::new(limit, offset);
        let Some(customer) = self.store.find_customer_by_user(user_id).await? else {
            return Ok(PageResult::empty(page));
        };

        let (items, total) = self.store.list_subscriptions(customer.id, page).await?;
        Ok(PageResult {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    pub async fn update(
        &self,
        subscription_id: Uuid,
        user_id: &str,
        req: UpdateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.get(subscription_id, user_id).await?;
        if subscription.status.is_terminal() {
            return Err(BillingError::InvalidState(format!(
                "subscription is {}",
                subscription.status
            )));
        }

        let gateway = self.providers.gateway(subscription.provider)?;
        let snapshot = gateway
            .update_subscription(
                &subscription.provider_subscription_id,
                &SubscriptionUpdate {
                    cancel_at_period_end: req.cancel_at_period_end,
                    metadata: req.metadata.clone(),
                    idempotency_key: req.idempotency_key,
                },
            )
            .await
            .map_err(BillingError::Provider)?;

        self.persist_snapshot(&mut subscription, &snapshot, req.metadata)
            .await?;
        tracing::info!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            cancel_at_period_end = subscription.cancel_at_period_end,
            "Subscription updated"
        );
        Ok(subscription)
    }

    /// Cancel now (`immediate`) or at the end of the current period
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        user_id: &str,
        immediate: bool,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.get(subscription_id, user_id).await?;
        if subscription.status.is_terminal() {
            return Err(BillingError::InvalidState(format!(
                "subscription is already {}",
                subscription.status
            )));
        }

        let gateway = self.providers.gateway(subscription.provider)?;
        let snapshot = gateway
            .cancel_subscription(
                &subscription.provider_subscription_id,
                immediate,
                idempotency_key,
            )
            .await
            .map_err(BillingError::Provider)?;

        self.persist_snapshot(&mut subscription, &snapshot, None)
            .await?;
        tracing::info!(
            subscription_id = %subscription.id,
            immediate,
            status = %subscription.status,
            "Subscription cancellation recorded"
        );
        Ok(subscription)
    }

    async fn persist_snapshot(
        &self,
        subscription: &mut Subscription,
        snapshot: &SubscriptionSnapshot,
        metadata: Option<Metadata>,
    ) -> BillingResult<()> {
        let state = state_from_snapshot(snapshot, metadata);
        let updated_at = self
            .store
            .update_subscription_state(subscription.id, &state)
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id = %subscription.id,
                    provider_subscription_id = %subscription.provider_subscription_id,
                    error = %e,
                    "Provider accepted subscription change but ledger write failed"
                );
                BillingError::from(e)
            })?;
        apply_state(subscription, state, updated_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_registry, memory_ledger, FakeGateway};
    use crate::types::SubscriptionStatus;

    fn manager() -> (Arc<FakeGateway>, SubscriptionManager) {
        let (gateway, registry) = fake_registry();
        let store: Arc<dyn LedgerStore> = memory_ledger();
        let customers = Arc::new(CustomerLinker::new(store.clone(), registry.clone()));
        (gateway, SubscriptionManager::new(store, registry, customers))
    }

    fn request() -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            provider: Provider::Stripe,
            amount: 9_900,
            currency: Currency::SEK,
            interval: BillingInterval::Month,
            interval_count: None,
            product_name: "Pro plan".to_string(),
            product_description: None,
            trial_days: None,
            metadata: Metadata::new(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_create_defaults_interval_count() {
        let (_, subs) = manager();
        let mut req = request();
        req.interval_count = Some(0);
        let sub = subs.create("user-a", "a@example.com", "A", req).await.unwrap();
        assert_eq!(sub.interval_count, 1);
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_create_with_trial_is_trialing() {
        let (_, subs) = manager();
        let mut req = request();
        req.trial_days = Some(14);
        let sub = subs.create("user-a", "a@example.com", "A", req).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert!(sub.trial_end.is_some());
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (gateway, subs) = manager();

        let mut no_name = request();
        no_name.product_name = "  ".to_string();
        assert!(matches!(
            subs.create("user-a", "a@example.com", "A", no_name).await,
            Err(BillingError::ValidationFailed(_))
        ));

        let mut long_trial = request();
        long_trial.trial_days = Some(MAX_TRIAL_DAYS + 1);
        assert!(matches!(
            subs.create("user-a", "a@example.com", "A", long_trial).await,
            Err(BillingError::ValidationFailed(_))
        ));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_replaces_metadata_and_flag() {
        let (_, subs) = manager();
        let sub = subs
            .create("user-a", "a@example.com", "A", request())
            .await
            .unwrap();

        let mut metadata = Metadata::new();
        metadata.insert("seat_count".to_string(), "5".to_string());
        let updated = subs
            .update(
                sub.id,
                "user-a",
                UpdateSubscriptionRequest {
                    cancel_at_period_end: Some(true),
                    metadata: Some(metadata.clone()),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();
        assert!(updated.cancel_at_period_end);
        assert_eq!(updated.metadata, metadata);

        let stored = subs.get(sub.id, "user-a").await.unwrap();
        assert_eq!(stored.metadata, metadata);
        assert!(stored.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_scheduled_cancel_keeps_status() {
        let (_, subs) = manager();
        let sub = subs
            .create("user-a", "a@example.com", "A", request())
            .await
            .unwrap();

        let scheduled = subs.cancel(sub.id, "user-a", false, None).await.unwrap();
        assert_eq!(scheduled.status, SubscriptionStatus::Active);
        assert!(scheduled.cancel_at_period_end);
        assert!(scheduled.cancel_at.is_some());
    }

    #[tokio::test]
    async fn test_immediate_cancel_then_terminal_rejections() {
        let (gateway, subs) = manager();
        let sub = subs
            .create("user-a", "a@example.com", "A", request())
            .await
            .unwrap();

        let canceled = subs.cancel(sub.id, "user-a", true, None).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(canceled.canceled_at.is_some());

        assert!(matches!(
            subs.cancel(sub.id, "user-a", true, None).await,
            Err(BillingError::InvalidState(_))
        ));
        assert!(matches!(
            subs.update(sub.id, "user-a", UpdateSubscriptionRequest::default())
                .await,
            Err(BillingError::InvalidState(_))
        ));
        assert_eq!(gateway.call_count("cancel_subscription"), 1);
        assert_eq!(gateway.call_count("update_subscription"), 0);
    }

    #[tokio::test]
    async fn test_foreign_subscription_is_not_found() {
        let (_, subs) = manager();
        let sub = subs
            .create("user-a", "a@example.com", "A", request())
            .await
            .unwrap();
        assert!(matches!(
            subs.get(sub.id, "user-b").await,
            Err(BillingError::NotFound(_))
        ));
        assert!(matches!(
            subs.cancel(sub.id, "user-b", true, None).await,
            Err(BillingError::NotFound(_))
        ));
        assert_eq!(subs.list("user-b", None, None).await.unwrap().total, 0);
    }
}
