//! Webhook reconciliation
//!
//! Provider events arrive at least once, in any order, possibly concurrently with
//! the lifecycle managers writing the same rows. Each event is applied as an
//! idempotent upsert keyed by (provider, provider event id):
//!
//! 1. The signature is verified with the provider secret (fail closed).
//! 2. The event row is claimed atomically. A processed event is a no-op and an
//!    event claimed by another worker within the claim timeout is left alone.
//! 3. The event is dispatched by resource kind and the row is marked processed,
//!    with any processing error recorded on it.
//!
//! Only store failures surface as errors after verification; everything else is
//! recorded and acknowledged so the provider stops redelivering. Errors naming a
//! ledger row that does not exist yet are flagged replayable and retried by
//! `replay_failed` up to `MAX_REPLAY_ATTEMPTS`; other errors stay as recorded.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{NormalizedEvent, ProviderRegistry};
use crate::secrets::SecretCache;
use crate::store::{
    LedgerStore, NewWebhookEvent, PaymentStateUpdate, StatusWrite, SubscriptionState,
    WebhookClaim, WebhookFilter,
};
use crate::types::{
    Page, PageResult, PaymentStatus, Provider, RefundStatus, ResourceKind, SubscriptionStatus,
    WebhookEventRecord,
};

/// How long a claim protects an unprocessed event from other workers
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// Default batch size for replay and stale reprocessing
pub const DEFAULT_BATCH_LIMIT: i64 = 100;

/// Processing attempts (first delivery included) after which a replayable event
/// is left alone
pub const MAX_REPLAY_ATTEMPTS: i32 = 8;

/// Error recorded on an event row
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessingNote {
    message: String,
    replayable: bool,
}

impl ProcessingNote {
    fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            replayable: false,
        }
    }

    /// The referenced row may be written after the event arrives
    fn awaiting_ledger(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            replayable: true,
        }
    }

    fn terminal_refusal(kind: &str, id: Uuid, current: impl Display, requested: impl Display) -> Self {
        Self::permanent(format!(
            "{} {} is {}, refusing transition to {}",
            kind, id, current, requested
        ))
    }
}

fn note_message(note: Option<ProcessingNote>) -> Option<String> {
    note.map(|n| n.message)
}

/// What happened to an ingested webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Applied now; `error` is the processing note recorded on the event row
    Processed {
        event_id: String,
        error: Option<String>,
    },
    /// Already processed by an earlier delivery
    Duplicate { event_id: String },
    /// Another worker holds a live claim on the event
    InFlight { event_id: String },
}

impl IngestOutcome {
    pub fn event_id(&self) -> &str {
        match self {
            IngestOutcome::Processed { event_id, .. }
            | IngestOutcome::Duplicate { event_id }
            | IngestOutcome::InFlight { event_id } => event_id,
        }
    }
}

/// Result of re-running a stored event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub provider: Provider,
    pub event_id: String,
    pub event_type: String,
    pub previously_processed: bool,
    pub previous_error: Option<String>,
    pub new_error: Option<String>,
    pub success: bool,
}

impl WebhookReplayResult {
    fn failed(provider: Provider, event_id: String, error: &BillingError) -> Self {
        Self {
            record_id: Uuid::nil(),
            provider,
            event_id,
            event_type: "unknown".to_string(),
            previously_processed: false,
            previous_error: None,
            new_error: Some(error.to_string()),
            success: false,
        }
    }
}

/// Rebuild the normalized event from a stored row; the payload was verified at ingest
fn event_from_record(record: &WebhookEventRecord) -> NormalizedEvent {
    NormalizedEvent {
        event_id: record.provider_event_id.clone(),
        event_type: record.event_type.clone(),
        resource: record
            .resource_type
            .parse()
            .unwrap_or(ResourceKind::Other),
        resource_id: record.resource_id.clone(),
        created_at: None,
        payload: record.payload.clone(),
    }
}

fn object_timestamp(event: &NormalizedEvent, field: &str) -> Option<OffsetDateTime> {
    event
        .object()
        .get(field)
        .and_then(serde_json::Value::as_i64)
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
}

/// Target status for a payment intent event type, `None` for informational events
fn payment_status_for_event(event_type: &str) -> Option<PaymentStatus> {
    match event_type {
        "payment_intent.succeeded" => Some(PaymentStatus::Succeeded),
        "payment_intent.payment_failed" => Some(PaymentStatus::Failed),
        "payment_intent.canceled" => Some(PaymentStatus::Canceled),
        "payment_intent.processing" => Some(PaymentStatus::Processing),
        "payment_intent.requires_action" => Some(PaymentStatus::RequiresAction),
        _ => None,
    }
}

pub struct WebhookReconciler {
    store: Arc<dyn LedgerStore>,
    providers: ProviderRegistry,
    secrets: Arc<SecretCache>,
    claim_timeout: Duration,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        providers: ProviderRegistry,
        secrets: Arc<SecretCache>,
    ) -> Self {
        Self {
            store,
            providers,
            secrets,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// Verify, deduplicate and apply one provider webhook delivery
    pub async fn ingest(
        &self,
        provider: Provider,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<IngestOutcome> {
        let gateway = self.providers.gateway(provider)?;

        let secret = self.secrets.get(provider).await.map_err(|e| {
            tracing::error!(provider = %provider, error = %e, "No webhook secret available, rejecting");
            BillingError::InvalidSignature
        })?;
        gateway
            .verify_webhook(payload, signature, &secret)
            .map_err(|e| {
                tracing::warn!(provider = %provider, error = %e, "Webhook signature verification failed");
                BillingError::InvalidSignature
            })?;

        let event = gateway
            .parse_webhook(payload)
            .map_err(|e| BillingError::MalformedPayload(e.message))?;

        let claim = self
            .store
            .claim_webhook_event(
                &NewWebhookEvent {
                    provider,
                    provider_event_id: event.event_id.clone(),
                    event_type: event.event_type.clone(),
                    resource_type: event.resource,
                    resource_id: event.resource_id.clone(),
                    payload: event.payload.clone(),
                },
                self.claim_timeout,
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    provider = %provider,
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to claim webhook event"
                );
                BillingError::from(e)
            })?;

        let record = match claim {
            WebhookClaim::Claimed(record) => record,
            WebhookClaim::AlreadyProcessed(_) => {
                tracing::info!(
                    provider = %provider,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "Duplicate webhook event, already processed"
                );
                return Ok(IngestOutcome::Duplicate {
                    event_id: event.event_id,
                });
            }
            WebhookClaim::InFlight(record) => {
                tracing::info!(
                    provider = %provider,
                    event_id = %event.event_id,
                    attempts = record.processing_attempts,
                    "Webhook event is being processed by another worker"
                );
                return Ok(IngestOutcome::InFlight {
                    event_id: event.event_id,
                });
            }
        };

        tracing::info!(
            provider = %provider,
            event_id = %event.event_id,
            event_type = %event.event_type,
            resource = %event.resource,
            attempt = record.processing_attempts,
            "Processing webhook event"
        );

        let note = self.dispatch(provider, &event).await?;
        self.mark_processed(record.id, note.as_ref()).await?;

        Ok(IngestOutcome::Processed {
            event_id: event.event_id,
            error: note_message(note),
        })
    }

    pub async fn list_events(
        &self,
        filter: WebhookFilter,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> BillingResult<PageResult<WebhookEventRecord>> {
        let page = Page::new(limit, offset);
        let (items, total) = self.store.list_webhook_events(filter, page).await?;
        Ok(PageResult {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Re-apply a stored event and record the new result
    ///
    /// Used after fixing whatever made the original attempt fail. The stored
    /// payload is not re-verified.
    pub async fn replay(
        &self,
        provider: Provider,
        event_id: &str,
    ) -> BillingResult<WebhookReplayResult> {
        tracing::info!(provider = %provider, event_id = %event_id, "Replaying webhook event");

        let previous = self
            .store
            .get_webhook_event(provider, event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;
        let record = self
            .store
            .begin_webhook_replay(provider, event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;

        let note = self.dispatch(provider, &event_from_record(&record)).await?;
        self.mark_processed(record.id, note.as_ref()).await?;
        let new_error = note_message(note);

        tracing::info!(
            provider = %provider,
            event_id = %event_id,
            previous_error = ?previous.processing_error,
            new_error = ?new_error,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id: record.id,
            provider,
            event_id: record.provider_event_id,
            event_type: record.event_type,
            previously_processed: previous.processed,
            previous_error: previous.processing_error,
            success: new_error.is_none(),
            new_error,
        })
    }

    /// Replay events whose recorded error may clear, least recently attempted first
    ///
    /// Events past `MAX_REPLAY_ATTEMPTS` and errors that cannot clear on their own
    /// (terminal refusals, malformed events) are skipped; `replay` still runs them.
    pub async fn replay_failed(&self, max_events: Option<i64>) -> BillingResult<Vec<WebhookReplayResult>> {
        let failed = self
            .store
            .list_replayable_webhook_events(
                MAX_REPLAY_ATTEMPTS,
                max_events.unwrap_or(DEFAULT_BATCH_LIMIT),
            )
            .await?;

        let mut results = Vec::with_capacity(failed.len());
        for record in failed {
            match self.replay(record.provider, &record.provider_event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        provider = %record.provider,
                        event_id = %record.provider_event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult::failed(
                        record.provider,
                        record.provider_event_id,
                        &e,
                    ));
                }
            }
        }
        Ok(results)
    }

    /// Finish events whose processing attempt was abandoned (worker crash, store outage)
    pub async fn reprocess_stale(&self, max_events: Option<i64>) -> BillingResult<Vec<WebhookReplayResult>> {
        let claimed_before = OffsetDateTime::now_utc() - self.claim_timeout;
        let stale = self
            .store
            .list_stale_webhook_events(claimed_before, max_events.unwrap_or(DEFAULT_BATCH_LIMIT))
            .await?;

        let mut results = Vec::with_capacity(stale.len());
        for candidate in stale {
            // Another worker may have picked it up since the listing
            let Some(record) = self
                .store
                .reclaim_stale_webhook_event(candidate.id, self.claim_timeout)
                .await?
            else {
                continue;
            };

            let outcome = match self.dispatch(record.provider, &event_from_record(&record)).await {
                Ok(note) => self
                    .mark_processed(record.id, note.as_ref())
                    .await
                    .map(|_| note_message(note)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(error) => results.push(WebhookReplayResult {
                    record_id: record.id,
                    provider: record.provider,
                    event_id: record.provider_event_id,
                    event_type: record.event_type,
                    previously_processed: false,
                    previous_error: record.processing_error,
                    success: error.is_none(),
                    new_error: error,
                }),
                Err(e) => {
                    tracing::error!(
                        event_id = %record.provider_event_id,
                        error = %e,
                        "Stale webhook reprocessing failed"
                    );
                    results.push(WebhookReplayResult::failed(
                        record.provider,
                        record.provider_event_id,
                        &e,
                    ));
                }
            }
        }

        if !results.is_empty() {
            tracing::info!(count = results.len(), "Reprocessed stale webhook events");
        }
        Ok(results)
    }

    /// Delete processed events received more than `retention` ago
    pub async fn cleanup(&self, retention: Duration) -> BillingResult<u64> {
        let received_before = OffsetDateTime::now_utc() - retention;
        let deleted = self
            .store
            .delete_processed_webhook_events(received_before)
            .await?;
        tracing::info!(deleted, "Cleaned up processed webhook events");
        Ok(deleted)
    }

    /// Marking processed is retried once; losing it leaves the event for the stale job
    async fn mark_processed(&self, record_id: Uuid, note: Option<&ProcessingNote>) -> BillingResult<()> {
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_millis(250))
            .map(jitter)
            .take(1);
        let error = note.map(|n| n.message.as_str());
        let replayable = note.is_some_and(|n| n.replayable);

        Retry::start(strategy, || {
            self.store
                .mark_webhook_processed(record_id, error, replayable)
        })
        .await
        .map(|_| ())
        .map_err(|e| {
            tracing::error!(
                record_id = %record_id,
                processing_error = ?error,
                error = %e,
                "Failed to mark webhook event processed after retry"
            );
            BillingError::from(e)
        })
    }

    /// Apply an event to the ledger
    ///
    /// `Ok(Some(note))` is a non-transient processing error to record on the event.
    async fn dispatch(
        &self,
        provider: Provider,
        event: &NormalizedEvent,
    ) -> BillingResult<Option<ProcessingNote>> {
        match event.resource {
            ResourceKind::Payment => self.apply_payment_event(provider, event).await,
            ResourceKind::Subscription => self.apply_subscription_event(provider, event).await,
            ResourceKind::Refund => self.apply_refund_event(provider, event).await,
            ResourceKind::Other => {
                tracing::debug!(event_type = %event.event_type, "Ignoring webhook for untracked resource");
                Ok(None)
            }
        }
    }

    async fn apply_payment_event(
        &self,
        provider: Provider,
        event: &NormalizedEvent,
    ) -> BillingResult<Option<ProcessingNote>> {
        let Some(target) = payment_status_for_event(&event.event_type) else {
            return Ok(None);
        };
        let Some(resource_id) = event.resource_id.as_deref() else {
            return Ok(Some(ProcessingNote::permanent("payment event has no resource id")));
        };
        let Some(payment) = self
            .store
            .find_payment_by_provider_id(provider, resource_id)
            .await?
        else {
            tracing::warn!(provider_payment_id = %resource_id, "Webhook for unknown payment");
            return Ok(Some(ProcessingNote::awaiting_ledger(format!(
                "unknown payment {}",
                resource_id
            ))));
        };

        if payment.status == target {
            return Ok(None);
        }
        if payment.status.is_terminal() {
            tracing::warn!(
                payment_id = %payment.id,
                current = %payment.status,
                requested = %target,
                "Ignoring webhook that would move a terminal payment"
            );
            return Ok(Some(ProcessingNote::terminal_refusal(
                "payment",
                payment.id,
                payment.status,
                target,
            )));
        }

        let error = &event.object()["last_payment_error"];
        let update = PaymentStateUpdate {
            status: target,
            payment_method_type: event.object()["payment_method_types"][0]
                .as_str()
                .map(str::to_string),
            failure_code: (target == PaymentStatus::Failed)
                .then(|| {
                    error["decline_code"]
                        .as_str()
                        .or_else(|| error["code"].as_str())
                        .map(str::to_string)
                })
                .flatten(),
            failure_message: (target == PaymentStatus::Failed)
                .then(|| error["message"].as_str().map(str::to_string))
                .flatten(),
        };
        if let StatusWrite::TerminalRefused { current } =
            self.store.update_payment_state(payment.id, &update).await?
        {
            // Settled by a concurrent event after the read above
            tracing::warn!(
                payment_id = %payment.id,
                current = %current,
                requested = %target,
                "Store refused to move a terminal payment"
            );
            return Ok(Some(ProcessingNote::terminal_refusal(
                "payment", payment.id, current, target,
            )));
        }

        tracing::info!(
            payment_id = %payment.id,
            from = %payment.status,
            to = %target,
            "Payment status reconciled from webhook"
        );
        Ok(None)
    }

    async fn apply_subscription_event(
        &self,
        provider: Provider,
        event: &NormalizedEvent,
    ) -> BillingResult<Option<ProcessingNote>> {
        let target = match event.event_type.as_str() {
            "customer.subscription.created" => SubscriptionStatus::Active,
            "customer.subscription.deleted" => SubscriptionStatus::Canceled,
            "customer.subscription.updated" => match event.object_str("status") {
                Some(status) => crate::gateway::stripe_gateway::subscription_status_from_stripe(status),
                None => {
                    return Ok(Some(ProcessingNote::permanent(
                        "subscription update carries no status",
                    )));
                }
            },
            _ => return Ok(None),
        };
        let Some(resource_id) = event.resource_id.as_deref() else {
            return Ok(Some(ProcessingNote::permanent(
                "subscription event has no resource id",
            )));
        };
        let Some(subscription) = self
            .store
            .find_subscription_by_provider_id(provider, resource_id)
            .await?
        else {
            tracing::warn!(provider_subscription_id = %resource_id, "Webhook for unknown subscription");
            return Ok(Some(ProcessingNote::awaiting_ledger(format!(
                "unknown subscription {}",
                resource_id
            ))));
        };

        if subscription.status.is_terminal() && subscription.status != target {
            tracing::warn!(
                subscription_id = %subscription.id,
                current = %subscription.status,
                requested = %target,
                "Ignoring webhook that would move a terminal subscription"
            );
            return Ok(Some(ProcessingNote::terminal_refusal(
                "subscription",
                subscription.id,
                subscription.status,
                target,
            )));
        }

        // Fields absent from the payload keep their stored values
        let mut state = SubscriptionState::from(&subscription);
        state.status = target;
        if let Some(flag) = event.object()["cancel_at_period_end"].as_bool() {
            state.cancel_at_period_end = flag;
        }
        for (field, slot) in [
            ("current_period_start", &mut state.current_period_start),
            ("current_period_end", &mut state.current_period_end),
            ("trial_start", &mut state.trial_start),
            ("trial_end", &mut state.trial_end),
            ("cancel_at", &mut state.cancel_at),
            ("canceled_at", &mut state.canceled_at),
        ] {
            if let Some(ts) = object_timestamp(event, field) {
                *slot = Some(ts);
            }
        }
        if target == SubscriptionStatus::Canceled && state.canceled_at.is_none() {
            state.canceled_at = Some(OffsetDateTime::now_utc());
        }

        self.store
            .update_subscription_state(subscription.id, &state)
            .await?;
        tracing::info!(
            subscription_id = %subscription.id,
            from = %subscription.status,
            to = %target,
            "Subscription reconciled from webhook"
        );
        Ok(None)
    }

    async fn apply_refund_event(
        &self,
        provider: Provider,
        event: &NormalizedEvent,
    ) -> BillingResult<Option<ProcessingNote>> {
        let Some(raw_status) = event.object_str("status") else {
            return Ok(Some(ProcessingNote::permanent("refund event carries no status")));
        };
        let target: RefundStatus =
            crate::gateway::stripe_gateway::refund_status_from_stripe(raw_status);
        let Some(resource_id) = event.resource_id.as_deref() else {
            return Ok(Some(ProcessingNote::permanent("refund event has no resource id")));
        };
        let Some(refund) = self
            .store
            .find_refund_by_provider_id(provider, resource_id)
            .await?
        else {
            tracing::warn!(provider_refund_id = %resource_id, "Webhook for unknown refund");
            return Ok(Some(ProcessingNote::awaiting_ledger(format!(
                "unknown refund {}",
                resource_id
            ))));
        };

        if refund.status == target {
            return Ok(None);
        }
        if refund.status.is_terminal() {
            tracing::warn!(
                refund_id = %refund.id,
                current = %refund.status,
                requested = %target,
                "Ignoring webhook that would move a terminal refund"
            );
            return Ok(Some(ProcessingNote::terminal_refusal(
                "refund",
                refund.id,
                refund.status,
                target,
            )));
        }

        let transition = match self
            .store
            .update_refund_status(refund.id, target, event.object_str("failure_reason"))
            .await?
        {
            StatusWrite::Applied(transition) => transition,
            StatusWrite::TerminalRefused { current } => {
                // Settled by a concurrent event after the read above
                tracing::warn!(
                    refund_id = %refund.id,
                    current = %current,
                    requested = %target,
                    "Store refused to move a terminal refund"
                );
                return Ok(Some(ProcessingNote::terminal_refusal(
                    "refund", refund.id, current, target,
                )));
            }
        };
        tracing::info!(
            refund_id = %refund.id,
            payment_id = %refund.payment_id,
            from = %transition.previous,
            to = %transition.current,
            released = transition.released_reservation,
            "Refund status reconciled from webhook"
        );
        Ok(None)
    }
}
