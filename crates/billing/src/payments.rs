//! One-off payment lifecycle
//!
//! Creates payment intents through the provider gateway and records them in the
//! ledger. Status moves after creation come from webhooks or an explicit cancel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::customers::CustomerLinker;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentRequest, ProviderRegistry};
use crate::store::{LedgerStore, PaymentStateUpdate, StatusWrite};
use crate::types::{Currency, Metadata, Page, PageResult, Payment, PaymentStatus, Provider};

/// Card networks truncate statement descriptors beyond this
pub const MAX_STATEMENT_DESCRIPTOR_LEN: usize = 22;
pub const MAX_DESCRIPTION_LEN: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub provider: Provider,
    pub amount: i64,
    pub currency: Currency,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub statement_descriptor: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl CreatePaymentRequest {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount <= 0 {
            return Err(BillingError::ValidationFailed(
                "amount must be greater than zero".to_string(),
            ));
        }
        if let Some(description) = &self.description {
            if description.chars().count() > MAX_DESCRIPTION_LEN {
                return Err(BillingError::ValidationFailed(format!(
                    "description must be at most {} characters",
                    MAX_DESCRIPTION_LEN
                )));
            }
        }
        if let Some(descriptor) = &self.statement_descriptor {
            if descriptor.chars().count() > MAX_STATEMENT_DESCRIPTOR_LEN {
                return Err(BillingError::ValidationFailed(format!(
                    "statement descriptor must be at most {} characters",
                    MAX_STATEMENT_DESCRIPTOR_LEN
                )));
            }
        }
        Ok(())
    }
}

pub struct PaymentManager {
    store: Arc<dyn LedgerStore>,
    providers: ProviderRegistry,
    customers: Arc<CustomerLinker>,
}

impl PaymentManager {
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
        req: CreatePaymentRequest,
    ) -> BillingResult<Payment> {
        req.validate()?;
        let gateway = self.providers.gateway(req.provider)?;

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
            .create_payment(&PaymentRequest {
                customer_id: provider_customer_id,
                amount: req.amount,
                currency: req.currency,
                description: req.description.clone(),
                statement_descriptor: req.statement_descriptor.clone(),
                metadata: req.metadata.clone(),
                idempotency_key: req.idempotency_key.clone(),
            })
            .await
            .map_err(|e| {
                tracing::warn!(
                    customer_id = %customer.id,
                    provider = %req.provider,
                    code = %e.code,
                    "Provider rejected payment"
                );
                BillingError::PaymentFailed(e)
            })?;

        let now = OffsetDateTime::now_utc();
        let payment = Payment {
            id: Uuid::new_v4(),
            customer_id: customer.id,
            subscription_id: None,
            provider: req.provider,
            provider_payment_id: snapshot.id.clone(),
            amount: req.amount,
            currency: req.currency,
            status: snapshot.status,
            description: req.description,
            statement_descriptor: req.statement_descriptor,
            client_secret: snapshot.client_secret,
            payment_method_type: snapshot.payment_method_type,
            failure_code: snapshot.failure_code,
            failure_message: snapshot.failure_message,
            metadata: req.metadata,
            idempotency_key: req.idempotency_key,
            refunded_amount: 0,
            created_at: now,
            updated_at: now,
            completed_at: (snapshot.status == PaymentStatus::Succeeded).then_some(now),
        };

        let stored = self.store.insert_payment(&payment).await.map_err(|e| {
            // The provider-side payment exists; webhooks for it will log "unknown payment"
            tracing::error!(
                provider = %payment.provider,
                provider_payment_id = %payment.provider_payment_id,
                customer_id = %payment.customer_id,
                error = %e,
                "Payment created at provider but ledger write failed"
            );
            BillingError::from(e)
        })?;

        tracing::info!(
            payment_id = %stored.id,
            provider_payment_id = %stored.provider_payment_id,
            amount = stored.amount,
            currency = %stored.currency,
            status = %stored.status,
            "Payment created"
        );
        Ok(stored)
    }

    /// Fetch a payment owned by `user_id`; anything else is `NotFound`
    pub async fn get(&self, payment_id: Uuid, user_id: &str) -> BillingResult<Payment> {
        let not_found = || BillingError::NotFound(format!("payment {}", payment_id));

        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(not_found)?;
        let owner = self.store.get_customer(payment.customer_id).await?;
        match owner {
            Some(customer) if customer.user_id == user_id => Ok(payment),
            _ => Err(not_found()),
        }
    }

    pub async fn list(
        &self,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<Payment>> {
        let page = Page::new(limit, offset);
        let Some(customer) = self.store.find_customer_by_user(user_id).await? else {
            return Ok(PageResult::empty(page));
        };

        let (items, total) = self.store.list_payments(customer.id, page).await?;
        Ok(PageResult {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Cancel a payment that has not reached a terminal status
    pub async fn cancel(
        &self,
        payment_id: Uuid,
        user_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Payment> {
        let mut payment = self.get(payment_id, user_id).await?;
        if payment.status.is_terminal() {
            return Err(BillingError::InvalidState(format!(
                "payment is already {}",
                payment.status
            )));
        }

        let gateway = self.providers.gateway(payment.provider)?;
        let snapshot = gateway
            .cancel_payment(&payment.provider_payment_id, idempotency_key)
            .await
            .map_err(BillingError::Provider)?;

        let update = PaymentStateUpdate {
            status: snapshot.status,
            payment_method_type: snapshot.payment_method_type,
            failure_code: snapshot.failure_code,
            failure_message: snapshot.failure_message,
        };
        let write = self
            .store
            .update_payment_state(payment.id, &update)
            .await
            .map_err(|e| {
                tracing::error!(
                    payment_id = %payment.id,
                    provider_payment_id = %payment.provider_payment_id,
                    error = %e,
                    "Payment canceled at provider but ledger write failed"
                );
                BillingError::from(e)
            })?;
        payment.updated_at = match write {
            StatusWrite::Applied(updated_at) => updated_at,
            // A webhook settled the payment while the cancel was in flight
            StatusWrite::TerminalRefused { current } => {
                tracing::warn!(
                    payment_id = %payment.id,
                    current = %current,
                    requested = %update.status,
                    "Payment reached a terminal status before the cancel was recorded"
                );
                return Err(BillingError::InvalidState(format!(
                    "payment is already {}",
                    current
                )));
            }
        };
        payment.status = update.status;
        payment.payment_method_type = update.payment_method_type.or(payment.payment_method_type);
        payment.failure_code = update.failure_code;
        payment.failure_message = update.failure_message;

        tracing::info!(payment_id = %payment.id, status = %payment.status, "Payment canceled");
        Ok(payment)
    }
}
