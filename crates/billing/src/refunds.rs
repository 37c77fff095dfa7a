//! Refund lifecycle
//!
//! The running total of refunds against a payment can never exceed the payment
//! amount. Before a refund reaches the provider its amount is reserved on the
//! payment with a single conditional store write; concurrent requests that would
//! overshoot lose that write and are rejected. A refund that ends failed or
//! canceled gives its reservation back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ProviderRegistry, RefundRequest};
use crate::payments::PaymentManager;
use crate::store::LedgerStore;
use crate::types::{Metadata, Page, PageResult, Payment, PaymentStatus, Refund};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRefundRequest {
    pub payment_id: Uuid,
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub struct RefundManager {
    store: Arc<dyn LedgerStore>,
    providers: ProviderRegistry,
    payments: Arc<PaymentManager>,
}

impl RefundManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        providers: ProviderRegistry,
        payments: Arc<PaymentManager>,
    ) -> Self {
        Self {
            store,
            providers,
            payments,
        }
    }

    pub async fn create(&self, user_id: &str, req: CreateRefundRequest) -> BillingResult<Refund> {
        if req.amount <= 0 {
            return Err(BillingError::ValidationFailed(
                "refund amount must be greater than zero".to_string(),
            ));
        }

        let payment = self.payments.get(req.payment_id, user_id).await?;
        Self::check_refundable(&payment, req.amount)?;
        let gateway = self.providers.gateway(payment.provider)?;

        if !self.store.reserve_refund(payment.id, req.amount).await? {
            tracing::info!(
                payment_id = %payment.id,
                amount = req.amount,
                "Refund reservation rejected, refundable amount exhausted"
            );
            return Err(BillingError::ValidationFailed(
                "refund would exceed the refundable amount of the payment".to_string(),
            ));
        }

        let mut metadata = req.metadata.clone();
        if let Some(notes) = &req.notes {
            metadata.entry("notes".to_string()).or_insert_with(|| notes.clone());
        }
        let snapshot = match gateway
            .create_refund(&RefundRequest {
                provider_payment_id: payment.provider_payment_id.clone(),
                amount: req.amount,
                reason: req.reason.clone(),
                metadata,
                idempotency_key: req.idempotency_key.clone(),
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    payment_id = %payment.id,
                    amount = req.amount,
                    code = %e.code,
                    "Provider rejected refund, releasing reservation"
                );
                self.release(&payment, req.amount).await;
                return Err(BillingError::PaymentFailed(e));
            }
        };

        let now = OffsetDateTime::now_utc();
        let refund = Refund {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            provider: payment.provider,
            provider_refund_id: snapshot.id.clone(),
            amount: req.amount,
            currency: payment.currency,
            status: snapshot.status,
            reason: req.reason,
            notes: req.notes,
            failure_reason: snapshot.failure_reason,
            metadata: req.metadata,
            idempotency_key: req.idempotency_key,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.insert_refund(&refund).await.map_err(|e| {
            // Reservation stays: the provider refund exists and its webhook will settle it
            tracing::error!(
                payment_id = %refund.payment_id,
                provider_refund_id = %refund.provider_refund_id,
                amount = refund.amount,
                error = %e,
                "Refund created at provider but ledger write failed"
            );
            BillingError::from(e)
        })?;

        if !stored.status.holds_reservation() {
            self.release(&payment, stored.amount).await;
        }

        tracing::info!(
            refund_id = %stored.id,
            payment_id = %stored.payment_id,
            provider_refund_id = %stored.provider_refund_id,
            amount = stored.amount,
            status = %stored.status,
            "Refund created"
        );
        Ok(stored)
    }

    pub async fn get(&self, refund_id: Uuid, user_id: &str) -> BillingResult<Refund> {
        let refund = self
            .store
            .get_refund(refund_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("refund {}", refund_id)))?;

        // Ownership flows through the refunded payment
        self.payments
            .get(refund.payment_id, user_id)
            .await
            .map_err(|e| match e {
                BillingError::NotFound(_) => {
                    BillingError::NotFound(format!("refund {}", refund_id))
                }
                other => other,
            })?;
        Ok(refund)
    }

    pub async fn list_by_payment(
        &self,
        payment_id: Uuid,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<Refund>> {
        let page = Page::new(limit, offset);
        let payment = self.payments.get(payment_id, user_id).await?;

        let (items, total) = self.store.list_refunds_by_payment(payment.id, page).await?;
        Ok(PageResult {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    pub async fn list_by_customer(
        &self,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<Refund>> {
        let page = Page::new(limit, offset);
        let Some(customer) = self.store.find_customer_by_user(user_id).await? else {
            return Ok(PageResult::empty(page));
        };

        let (items, total) = self.store.list_refunds_by_customer(customer.id, page).await?;
        Ok(PageResult {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// In-process fast reject; the store reservation is the authoritative check
    fn check_refundable(payment: &Payment, amount: i64) -> BillingResult<()> {
        if payment.status != PaymentStatus::Succeeded {
            return Err(BillingError::InvalidState(format!(
                "only succeeded payments can be refunded (payment is {})",
                payment.status
            )));
        }
        if amount > payment.amount {
            return Err(BillingError::ValidationFailed(
                "refund amount exceeds payment amount".to_string(),
            ));
        }
        if payment.refunded_amount + amount > payment.amount {
            return Err(BillingError::ValidationFailed(format!(
                "refund would exceed the refundable amount of the payment ({} remaining)",
                payment.amount - payment.refunded_amount
            )));
        }
        Ok(())
    }

    async fn release(&self, payment: &Payment, amount: i64) {
        if let Err(e) = self.store.release_refund(payment.id, amount).await {
            tracing::error!(
                payment_id = %payment.id,
                amount,
                error = %e,
                "Failed to release refund reservation, ledger invariant check will flag it"
            );
        }
    }
}
