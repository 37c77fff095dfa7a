//! Stripe gateway
//!
//! Payments are PaymentIntents created unconfirmed (the client confirms with the
//! returned client secret). Subscriptions are created against a recurring Price
//! built from the request's amount and interval.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use stripe::{
    CancelPaymentIntent, CancelSubscription, Client, CreateCustomer, CreatePaymentIntent,
    CreatePrice, CreatePriceProductData, CreatePriceRecurring, CreatePriceRecurringInterval,
    CreateRefund, CreateSubscription, CreateSubscriptionItems, Customer, CustomerId,
    PaymentIntent, PaymentIntentId, Price, Refund, RefundId, RefundReasonFilter, RequestStrategy,
    StripeError, Subscription, SubscriptionId, UpdateSubscription,
};
use time::OffsetDateTime;

use crate::gateway::signature::verify_signature;
use crate::gateway::{
    CustomerRequest, CustomerSnapshot, GatewayError, GatewayResult, NormalizedEvent,
    PaymentGateway, PaymentRequest, PaymentSnapshot, RefundRequest, RefundSnapshot,
    SubscriptionRequest, SubscriptionSnapshot, SubscriptionUpdate,
};
use crate::types::{
    BillingInterval, Currency, PaymentStatus, Provider, RefundStatus, ResourceKind,
    SubscriptionStatus,
};

/// Stripe implementation of [`PaymentGateway`]
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
}

impl StripeGateway {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: Client::new(secret_key),
        }
    }

    /// Client that sends `Idempotency-Key` when the caller supplied one
    fn client_for(&self, idempotency_key: Option<&str>) -> Client {
        match idempotency_key {
            Some(key) => self
                .client
                .clone()
                .with_strategy(RequestStrategy::Idempotent(key.to_string())),
            None => self.client.clone(),
        }
    }
}

impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway").finish_non_exhaustive()
    }
}

impl From<StripeError> for GatewayError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::Stripe(request_error) => {
                let code = request_error
                    .decline_code
                    .clone()
                    .or_else(|| {
                        request_error
                            .code
                            .as_ref()
                            .map(|code| to_snake_case(&format!("{:?}", code)))
                    })
                    .unwrap_or_else(|| format!("http_{}", request_error.http_status));
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| "Stripe request failed".to_string());
                GatewayError::new(code, message)
            }
            StripeError::Timeout => GatewayError::new("timeout", "Stripe request timed out"),
            other => GatewayError::new("stripe_client_error", other.to_string()),
        }
    }
}

fn parse_id<T>(raw: &str, what: &str) -> GatewayResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| GatewayError::new("invalid_id", format!("Invalid {} ID: {}", what, e)))
}

fn from_unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

/// Serialized string form of a Stripe enum or string field
fn wire_name<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Some(s),
        _ => None,
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn stripe_currency(currency: Currency) -> stripe::Currency {
    match currency {
        Currency::SEK => stripe::Currency::SEK,
        Currency::USD => stripe::Currency::USD,
        Currency::EUR => stripe::Currency::EUR,
        Currency::GBP => stripe::Currency::GBP,
    }
}

fn stripe_interval(interval: BillingInterval) -> CreatePriceRecurringInterval {
    match interval {
        BillingInterval::Day => CreatePriceRecurringInterval::Day,
        BillingInterval::Week => CreatePriceRecurringInterval::Week,
        BillingInterval::Month => CreatePriceRecurringInterval::Month,
        BillingInterval::Year => CreatePriceRecurringInterval::Year,
    }
}

fn refund_reason_filter(reason: &str) -> Option<RefundReasonFilter> {
    match reason {
        "duplicate" => Some(RefundReasonFilter::Duplicate),
        "fraudulent" => Some(RefundReasonFilter::Fraudulent),
        "requested_by_customer" => Some(RefundReasonFilter::RequestedByCustomer),
        _ => None,
    }
}

/// Payment intent status as reported by Stripe
pub fn payment_status_from_stripe(status: &str) -> PaymentStatus {
    match status {
        "requires_payment_method" | "requires_confirmation" => PaymentStatus::Pending,
        "requires_action" => PaymentStatus::RequiresAction,
        "processing" => PaymentStatus::Processing,
        "succeeded" => PaymentStatus::Succeeded,
        "canceled" => PaymentStatus::Canceled,
        _ => PaymentStatus::Failed,
    }
}

pub fn subscription_status_from_stripe(status: &str) -> SubscriptionStatus {
    status.parse().unwrap_or(SubscriptionStatus::Incomplete)
}

pub fn refund_status_from_stripe(status: &str) -> RefundStatus {
    match status {
        "requires_action" => RefundStatus::Processing,
        other => other.parse().unwrap_or(RefundStatus::Pending),
    }
}

/// Which ledger entity a Stripe event type refers to
pub fn resource_kind_for_event(event_type: &str) -> ResourceKind {
    if event_type.starts_with("payment_intent.") {
        ResourceKind::Payment
    } else if event_type.starts_with("customer.subscription.") {
        ResourceKind::Subscription
    } else if event_type.starts_with("charge.refund.") || event_type.starts_with("refund.") {
        ResourceKind::Refund
    } else {
        ResourceKind::Other
    }
}

fn payment_snapshot(intent: PaymentIntent) -> PaymentSnapshot {
    let (failure_code, failure_message) = match intent.last_payment_error.as_deref() {
        Some(err) => (
            err.code.as_ref().and_then(wire_name),
            err.message.clone(),
        ),
        None => (None, None),
    };

    PaymentSnapshot {
        id: intent.id.to_string(),
        amount: intent.amount,
        status: payment_status_from_stripe(intent.status.as_str()),
        client_secret: intent.client_secret.clone(),
        payment_method_type: intent.payment_method_types.first().cloned(),
        failure_code,
        failure_message,
    }
}

fn subscription_snapshot(sub: Subscription) -> SubscriptionSnapshot {
    SubscriptionSnapshot {
        id: sub.id.to_string(),
        status: subscription_status_from_stripe(sub.status.as_str()),
        current_period_start: from_unix(sub.current_period_start),
        current_period_end: from_unix(sub.current_period_end),
        trial_start: sub.trial_start.and_then(from_unix),
        trial_end: sub.trial_end.and_then(from_unix),
        cancel_at_period_end: sub.cancel_at_period_end,
        cancel_at: sub.cancel_at.and_then(from_unix),
        canceled_at: sub.canceled_at.and_then(from_unix),
    }
}

fn refund_snapshot(refund: Refund) -> RefundSnapshot {
    let status = wire_name(&refund.status)
        .map(|s| refund_status_from_stripe(&s))
        .unwrap_or(RefundStatus::Pending);

    RefundSnapshot {
        id: refund.id.to_string(),
        amount: refund.amount,
        status,
        failure_reason: wire_name(&refund.failure_reason),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    async fn create_customer(&self, req: &CustomerRequest) -> GatewayResult<CustomerSnapshot> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), req.user_id.clone());

        let params = CreateCustomer {
            email: Some(req.email.as_str()),
            name: Some(req.name.as_str()),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(&self.client, params).await?;

        tracing::info!(
            user_id = %req.user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(CustomerSnapshot {
            id: customer.id.to_string(),
            email: customer.email,
        })
    }

    async fn get_customer(&self, customer_id: &str) -> GatewayResult<CustomerSnapshot> {
        let id = parse_id::<CustomerId>(customer_id, "customer")?;
        let customer = Customer::retrieve(&self.client, &id, &[]).await?;
        Ok(CustomerSnapshot {
            id: customer.id.to_string(),
            email: customer.email,
        })
    }

    async fn create_payment(&self, req: &PaymentRequest) -> GatewayResult<PaymentSnapshot> {
        let client = self.client_for(req.idempotency_key.as_deref());
        let customer_id = parse_id::<CustomerId>(&req.customer_id, "customer")?;

        let mut params = CreatePaymentIntent::new(req.amount, stripe_currency(req.currency));
        params.customer = Some(customer_id);
        params.confirm = Some(false);
        params.description = req.description.as_deref();
        params.statement_descriptor = req.statement_descriptor.as_deref();
        params.metadata = Some(req.metadata.clone());

        let intent = PaymentIntent::create(&client, params).await?;

        tracing::info!(
            payment_intent_id = %intent.id,
            amount = req.amount,
            currency = %req.currency,
            "Created Stripe payment intent"
        );

        Ok(payment_snapshot(intent))
    }

    async fn get_payment(&self, payment_id: &str) -> GatewayResult<PaymentSnapshot> {
        let id = parse_id::<PaymentIntentId>(payment_id, "payment intent")?;
        let intent = PaymentIntent::retrieve(&self.client, &id, &[]).await?;
        Ok(payment_snapshot(intent))
    }

    async fn cancel_payment(
        &self,
        payment_id: &str,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<PaymentSnapshot> {
        let client = self.client_for(idempotency_key);
        let id = parse_id::<PaymentIntentId>(payment_id, "payment intent")?;
        let params = CancelPaymentIntent {
            cancellation_reason: None,
        };
        let intent = PaymentIntent::cancel(&client, &id, params).await?;

        tracing::info!(payment_intent_id = %intent.id, "Canceled Stripe payment intent");

        Ok(payment_snapshot(intent))
    }

    async fn create_subscription(
        &self,
        req: &SubscriptionRequest,
    ) -> GatewayResult<SubscriptionSnapshot> {
        let client = self.client_for(req.idempotency_key.as_deref());
        let customer_id = parse_id::<CustomerId>(&req.customer_id, "customer")?;

        let mut price_params = CreatePrice::new(stripe_currency(req.currency));
        price_params.unit_amount = Some(req.amount);
        price_params.recurring = Some(CreatePriceRecurring {
            interval: stripe_interval(req.interval),
            interval_count: Some(u64::from(req.interval_count)),
            aggregate_usage: None,
            trial_period_days: None,
            usage_type: None,
        });
        price_params.product_data = Some(CreatePriceProductData {
            name: req.product_name.clone(),
            ..Default::default()
        });

        // The price and the subscription are separate provider requests, so each
        // gets its own derived key
        let price_client = match req.idempotency_key.as_deref() {
            Some(key) => self.client_for(Some(&format!("{}:price", key))),
            None => self.client.clone(),
        };
        let price = Price::create(&price_client, price_params).await?;

        let mut metadata = req.metadata.clone();
        if let Some(description) = &req.product_description {
            metadata.insert("product_description".to_string(), description.clone());
        }

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price.id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.trial_period_days = req.trial_days;
        params.metadata = Some(metadata);

        let subscription = Subscription::create(&client, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            price_id = %price.id,
            interval = %req.interval,
            interval_count = req.interval_count,
            "Created Stripe subscription"
        );

        Ok(subscription_snapshot(subscription))
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> GatewayResult<SubscriptionSnapshot> {
        let id = parse_id::<SubscriptionId>(subscription_id, "subscription")?;
        let subscription = Subscription::retrieve(&self.client, &id, &[]).await?;
        Ok(subscription_snapshot(subscription))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> GatewayResult<SubscriptionSnapshot> {
        let client = self.client_for(update.idempotency_key.as_deref());
        let id = parse_id::<SubscriptionId>(subscription_id, "subscription")?;

        let params = UpdateSubscription {
            cancel_at_period_end: update.cancel_at_period_end,
            metadata: update.metadata.clone(),
            ..Default::default()
        };

        let subscription = Subscription::update(&client, &id, params).await?;
        Ok(subscription_snapshot(subscription))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediate: bool,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<SubscriptionSnapshot> {
        let client = self.client_for(idempotency_key);
        let id = parse_id::<SubscriptionId>(subscription_id, "subscription")?;

        let subscription = if immediate {
            let params = CancelSubscription {
                cancellation_details: None,
                invoice_now: None,
                prorate: None,
            };
            Subscription::cancel(&client, &id, params).await?
        } else {
            let params = UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            Subscription::update(&client, &id, params).await?
        };

        tracing::info!(
            subscription_id = %subscription.id,
            immediate = immediate,
            "Canceled Stripe subscription"
        );

        Ok(subscription_snapshot(subscription))
    }

    async fn create_refund(&self, req: &RefundRequest) -> GatewayResult<RefundSnapshot> {
        let client = self.client_for(req.idempotency_key.as_deref());
        let intent_id = parse_id::<PaymentIntentId>(&req.provider_payment_id, "payment intent")?;

        let mut metadata = req.metadata.clone();
        let reason_filter = req.reason.as_deref().and_then(refund_reason_filter);
        if let (Some(reason), None) = (&req.reason, &reason_filter) {
            metadata.insert("reason".to_string(), reason.clone());
        }

        let mut params = CreateRefund::new();
        params.payment_intent = Some(intent_id);
        params.amount = Some(req.amount);
        params.reason = reason_filter;
        params.metadata = Some(metadata);

        let refund = Refund::create(&client, params).await?;

        tracing::info!(
            refund_id = %refund.id,
            payment_intent_id = %req.provider_payment_id,
            amount = req.amount,
            "Created Stripe refund"
        );

        Ok(refund_snapshot(refund))
    }

    async fn get_refund(&self, refund_id: &str) -> GatewayResult<RefundSnapshot> {
        let id = parse_id::<RefundId>(refund_id, "refund")?;
        let refund = Refund::retrieve(&self.client, &id, &[]).await?;
        Ok(refund_snapshot(refund))
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> GatewayResult<()> {
        verify_signature(payload, signature, secret).map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook signature rejected");
            GatewayError::new("invalid_signature", e.to_string())
        })
    }

    fn parse_webhook(&self, payload: &[u8]) -> GatewayResult<NormalizedEvent> {
        parse_stripe_event(payload)
    }
}

/// Normalize a Stripe event envelope
///
/// Parsed from JSON rather than `stripe::Event` so API versions newer than the
/// crate's generated types still deserialize.
pub fn parse_stripe_event(payload: &[u8]) -> GatewayResult<NormalizedEvent> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::new("malformed_payload", e.to_string()))?;

    let event_id = value["id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::new("malformed_payload", "event id missing"))?
        .to_string();
    let event_type = value["type"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::new("malformed_payload", "event type missing"))?
        .to_string();

    let resource_id = value["data"]["object"]["id"].as_str().map(str::to_string);
    let created_at = value["created"].as_i64().and_then(from_unix);

    Ok(NormalizedEvent {
        resource: resource_kind_for_event(&event_type),
        event_id,
        event_type,
        resource_id,
        created_at,
        payload: value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_status_mapping() {
        assert_eq!(
            payment_status_from_stripe("requires_payment_method"),
            PaymentStatus::Pending
        );
        assert_eq!(
            payment_status_from_stripe("requires_confirmation"),
            PaymentStatus::Pending
        );
        assert_eq!(
            payment_status_from_stripe("requires_action"),
            PaymentStatus::RequiresAction
        );
        assert_eq!(payment_status_from_stripe("processing"), PaymentStatus::Processing);
        assert_eq!(payment_status_from_stripe("succeeded"), PaymentStatus::Succeeded);
        assert_eq!(payment_status_from_stripe("canceled"), PaymentStatus::Canceled);
        assert_eq!(payment_status_from_stripe("requires_capture"), PaymentStatus::Failed);
    }

    #[test]
    fn test_subscription_status_mapping_defaults_to_incomplete() {
        assert_eq!(subscription_status_from_stripe("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(
            subscription_status_from_stripe("incomplete_expired"),
            SubscriptionStatus::IncompleteExpired
        );
        assert_eq!(
            subscription_status_from_stripe("something_new"),
            SubscriptionStatus::Incomplete
        );
    }

    #[test]
    fn test_refund_status_mapping() {
        assert_eq!(refund_status_from_stripe("succeeded"), RefundStatus::Succeeded);
        assert_eq!(refund_status_from_stripe("requires_action"), RefundStatus::Processing);
        assert_eq!(refund_status_from_stripe("unknown"), RefundStatus::Pending);
    }

    #[test]
    fn test_resource_kind_for_event() {
        assert_eq!(
            resource_kind_for_event("payment_intent.succeeded"),
            ResourceKind::Payment
        );
        assert_eq!(
            resource_kind_for_event("customer.subscription.updated"),
            ResourceKind::Subscription
        );
        assert_eq!(
            resource_kind_for_event("charge.refund.updated"),
            ResourceKind::Refund
        );
        assert_eq!(resource_kind_for_event("refund.failed"), ResourceKind::Refund);
        assert_eq!(resource_kind_for_event("charge.refunded"), ResourceKind::Other);
        assert_eq!(resource_kind_for_event("invoice.paid"), ResourceKind::Other);
    }

    #[test]
    fn test_parse_stripe_event() {
        let payload = br#"{
            "id": "evt_123",
            "type": "payment_intent.succeeded",
            "created": 1700000000,
            "data": { "object": { "id": "pi_123", "object": "payment_intent", "status": "succeeded" } }
        }"#;
        let event = parse_stripe_event(payload).unwrap();
        assert_eq!(event.event_id, "evt_123");
        assert_eq!(event.resource, ResourceKind::Payment);
        assert_eq!(event.resource_id.as_deref(), Some("pi_123"));
        assert_eq!(event.object_str("status"), Some("succeeded"));
        assert_eq!(event.created_at.map(|t| t.unix_timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_parse_stripe_event_rejects_missing_fields() {
        assert!(parse_stripe_event(b"not json").is_err());
        assert!(parse_stripe_event(br#"{"type":"payment_intent.succeeded"}"#).is_err());
        assert!(parse_stripe_event(br#"{"id":"evt_1"}"#).is_err());
        assert!(parse_stripe_event(br#"{"id":"","type":"x"}"#).is_err());
    }

    #[test]
    fn test_stripe_verify_webhook_fails_closed() {
        let gateway = StripeGateway::new("sk_test_123");
        let payload = br#"{"id":"evt_1","type":"invoice.paid"}"#;
        assert!(gateway.verify_webhook(payload, "garbage", "whsec_x").is_err());

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = crate::gateway::signature::sign_payload("whsec_x", now, payload);
        assert!(gateway.verify_webhook(payload, &header, "whsec_x").is_ok());
        assert!(gateway.verify_webhook(payload, &header, "whsec_y").is_err());
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("CardDeclined"), "card_declined");
        assert_eq!(to_snake_case("Timeout"), "timeout");
    }
}
