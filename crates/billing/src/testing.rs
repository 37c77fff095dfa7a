//! Test doubles: a scripted provider gateway and webhook payload builders

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::gateway::signature::{sign_payload, verify_signature};
use crate::gateway::stripe_gateway::parse_stripe_event;
use crate::gateway::{
    CustomerRequest, CustomerSnapshot, GatewayError, GatewayResult, NormalizedEvent,
    PaymentGateway, PaymentRequest, PaymentSnapshot, ProviderRegistry, RefundRequest,
    RefundSnapshot, SubscriptionRequest, SubscriptionSnapshot, SubscriptionUpdate,
};
use crate::customers::CustomerLinker;
use crate::idempotency::IdempotencyCache;
use crate::rate_limit::RateLimiter;
use crate::secrets::{SecretCache, StaticSecretSource};
use crate::{BillingParts, BillingService};
use crate::payments::{CreatePaymentRequest, PaymentManager};
use crate::store::{InMemoryLedger, LedgerStore, PaymentStateUpdate};
use crate::types::{
    Currency, Metadata, Payment, PaymentStatus, Provider, RefundStatus, SubscriptionStatus,
};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_fake";

#[derive(Debug, Clone)]
pub struct GatewayCall {
    pub op: &'static str,
    pub idempotency_key: Option<String>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    calls: Vec<GatewayCall>,
    failures: HashMap<&'static str, GatewayError>,
    payment_status: Option<PaymentStatus>,
    refund_status: Option<RefundStatus>,
    subscription_status: Option<SubscriptionStatus>,
    payments: HashMap<String, PaymentSnapshot>,
    subscriptions: HashMap<String, SubscriptionSnapshot>,
    refunds: HashMap<String, RefundSnapshot>,
}

/// In-process gateway that behaves like Stripe without the network
///
/// Every call is recorded. `fail(op, ..)` makes the named operation fail until
/// `succeed(op)` is called.
pub struct FakeGateway {
    provider: Provider,
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::for_provider(Provider::Stripe)
    }

    pub fn for_provider(provider: Provider) -> Self {
        Self {
            provider,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn fail(&self, op: &'static str, code: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(op, GatewayError::new(code, format!("{} rejected by fake", op)));
    }

    pub fn succeed(&self, op: &'static str) {
        self.state.lock().unwrap().failures.remove(op);
    }

    pub fn set_payment_status(&self, status: PaymentStatus) {
        self.state.lock().unwrap().payment_status = Some(status);
    }

    pub fn set_refund_status(&self, status: RefundStatus) {
        self.state.lock().unwrap().refund_status = Some(status);
    }

    pub fn set_subscription_status(&self, status: SubscriptionStatus) {
        self.state.lock().unwrap().subscription_status = Some(status);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    fn begin(&self, op: &'static str, idempotency_key: Option<&str>) -> GatewayResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall {
            op,
            idempotency_key: idempotency_key.map(str::to_string),
        });
        if let Some(err) = state.failures.get(op) {
            return Err(err.clone());
        }
        state.next_id += 1;
        Ok(state.next_id)
    }
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn create_customer(&self, req: &CustomerRequest) -> GatewayResult<CustomerSnapshot> {
        let n = self.begin("create_customer", None)?;
        Ok(CustomerSnapshot {
            id: format!("cus_fake_{}", n),
            email: Some(req.email.clone()),
        })
    }

    async fn get_customer(&self, customer_id: &str) -> GatewayResult<CustomerSnapshot> {
        self.begin("get_customer", None)?;
        Ok(CustomerSnapshot {
            id: customer_id.to_string(),
            email: None,
        })
    }

    async fn create_payment(&self, req: &PaymentRequest) -> GatewayResult<PaymentSnapshot> {
        let n = self.begin("create_payment", req.idempotency_key.as_deref())?;
        let mut state = self.state.lock().unwrap();
        let snapshot = PaymentSnapshot {
            id: format!("pi_fake_{}", n),
            amount: req.amount,
            status: state.payment_status.unwrap_or(PaymentStatus::Pending),
            client_secret: Some(format!("pi_fake_{}_secret", n)),
            payment_method_type: None,
            failure_code: None,
            failure_message: None,
        };
        state.payments.insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn get_payment(&self, payment_id: &str) -> GatewayResult<PaymentSnapshot> {
        self.begin("get_payment", None)?;
        self.state
            .lock()
            .unwrap()
            .payments
            .get(payment_id)
            .cloned()
            .ok_or_else(|| GatewayError::new("resource_missing", payment_id))
    }

    async fn cancel_payment(
        &self,
        payment_id: &str,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<PaymentSnapshot> {
        self.begin("cancel_payment", idempotency_key)?;
        let mut state = self.state.lock().unwrap();
        let payment = state
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| GatewayError::new("resource_missing", payment_id))?;
        payment.status = PaymentStatus::Canceled;
        Ok(payment.clone())
    }

    async fn create_subscription(
        &self,
        req: &SubscriptionRequest,
    ) -> GatewayResult<SubscriptionSnapshot> {
        let n = self.begin("create_subscription", req.idempotency_key.as_deref())?;
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().unwrap();
        let trial_end = req
            .trial_days
            .map(|days| now + time::Duration::days(i64::from(days)));
        let default_status = if trial_end.is_some() {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };
        let snapshot = SubscriptionSnapshot {
            id: format!("sub_fake_{}", n),
            status: state.subscription_status.unwrap_or(default_status),
            current_period_start: Some(now),
            current_period_end: Some(now + time::Duration::days(30)),
            trial_start: trial_end.map(|_| now),
            trial_end,
            cancel_at_period_end: false,
            cancel_at: None,
            canceled_at: None,
        };
        state
            .subscriptions
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn get_subscription(&self, subscription_id: &str) -> GatewayResult<SubscriptionSnapshot> {
        self.begin("get_subscription", None)?;
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| GatewayError::new("resource_missing", subscription_id))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> GatewayResult<SubscriptionSnapshot> {
        self.begin("update_subscription", update.idempotency_key.as_deref())?;
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| GatewayError::new("resource_missing", subscription_id))?;
        if let Some(flag) = update.cancel_at_period_end {
            sub.cancel_at_period_end = flag;
            sub.cancel_at = if flag { sub.current_period_end } else { None };
        }
        Ok(sub.clone())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediate: bool,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<SubscriptionSnapshot> {
        self.begin("cancel_subscription", idempotency_key)?;
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| GatewayError::new("resource_missing", subscription_id))?;
        if immediate {
            sub.status = SubscriptionStatus::Canceled;
            sub.canceled_at = Some(OffsetDateTime::now_utc());
        } else {
            sub.cancel_at_period_end = true;
            sub.cancel_at = sub.current_period_end;
        }
        Ok(sub.clone())
    }

    async fn create_refund(&self, req: &RefundRequest) -> GatewayResult<RefundSnapshot> {
        let n = self.begin("create_refund", req.idempotency_key.as_deref())?;
        let mut state = self.state.lock().unwrap();
        let snapshot = RefundSnapshot {
            id: format!("re_fake_{}", n),
            amount: req.amount,
            status: state.refund_status.unwrap_or(RefundStatus::Pending),
            failure_reason: None,
        };
        state.refunds.insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn get_refund(&self, refund_id: &str) -> GatewayResult<RefundSnapshot> {
        self.begin("get_refund", None)?;
        self.state
            .lock()
            .unwrap()
            .refunds
            .get(refund_id)
            .cloned()
            .ok_or_else(|| GatewayError::new("resource_missing", refund_id))
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> GatewayResult<()> {
        verify_signature(payload, signature, secret)
            .map_err(|e| GatewayError::new("invalid_signature", e.to_string()))
    }

    fn parse_webhook(&self, payload: &[u8]) -> GatewayResult<NormalizedEvent> {
        parse_stripe_event(payload)
    }
}

/// Registry with one fake gateway in the Stripe slot
pub fn fake_registry() -> (Arc<FakeGateway>, ProviderRegistry) {
    let gateway = Arc::new(FakeGateway::new());
    let registry = ProviderRegistry::new().with_stripe(gateway.clone());
    (gateway, registry)
}

pub fn memory_ledger() -> Arc<InMemoryLedger> {
    Arc::new(InMemoryLedger::new())
}

/// Stripe-shaped event body
pub fn stripe_event(event_id: &str, event_type: &str, object: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": object },
    }))
    .unwrap()
}

/// Signature header for `payload` under the test secret, stamped now
pub fn sign(payload: &[u8]) -> String {
    sign_payload(
        TEST_WEBHOOK_SECRET,
        OffsetDateTime::now_utc().unix_timestamp(),
        payload,
    )
}

/// Plain SEK Stripe payment request without a key
pub fn payment_request(amount: i64) -> CreatePaymentRequest {
    CreatePaymentRequest {
        provider: Provider::Stripe,
        amount,
        currency: Currency::SEK,
        description: None,
        statement_descriptor: None,
        metadata: Metadata::new(),
        idempotency_key: None,
    }
}

/// Payment manager over `store` with its own customer linker
pub fn payment_manager(store: Arc<dyn LedgerStore>, registry: ProviderRegistry) -> Arc<PaymentManager> {
    let customers = Arc::new(CustomerLinker::new(store.clone(), registry.clone()));
    Arc::new(PaymentManager::new(store, registry, customers))
}

/// Create a Stripe payment for `user_id` and mark it succeeded in the ledger
pub async fn succeeded_payment(
    payments: &PaymentManager,
    store: &dyn LedgerStore,
    user_id: &str,
    amount: i64,
) -> Payment {
    let payment = payments
        .create(
            user_id,
            &format!("{}@example.com", user_id),
            user_id,
            payment_request(amount),
        )
        .await
        .unwrap();
    store
        .update_payment_state(
            payment.id,
            &PaymentStateUpdate {
                status: PaymentStatus::Succeeded,
                payment_method_type: Some("card".to_string()),
                failure_code: None,
                failure_message: None,
            },
        )
        .await
        .unwrap();
    store.get_payment(payment.id).await.unwrap().unwrap()
}

/// Full service over an in-memory ledger and a fake Stripe gateway
pub fn billing_service() -> (Arc<FakeGateway>, Arc<InMemoryLedger>, BillingService) {
    let (gateway, registry) = fake_registry();
    let ledger = memory_ledger();
    let secrets = Arc::new(SecretCache::new(
        Arc::new(StaticSecretSource::new().with_secret(Provider::Stripe, TEST_WEBHOOK_SECRET)),
        Duration::from_secs(300),
    ));
    let service = BillingService::new(BillingParts {
        store: ledger.clone(),
        providers: registry,
        secrets,
        rate_limiter: RateLimiter::new_in_memory(),
        idempotency: IdempotencyCache::new_in_memory(),
        webhook_claim_timeout: Duration::from_secs(300),
    });
    (gateway, ledger, service)
}
