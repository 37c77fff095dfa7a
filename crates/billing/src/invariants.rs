//! Ledger invariants
//!
//! Runnable consistency checks over the ledger. They only read, so they can run
//! after a webhook replay, from the worker on a schedule, or ad hoc while
//! debugging a customer report.
//!
//! - `refund_total_within_amount`: succeeded refunds never exceed the payment
//! - `reservation_within_amount`: the reserved refund total never exceeds the payment
//! - `reservation_matches_refunds`: the reserved total equals the sum of refunds still holding it
//! - `no_stale_webhooks`: no webhook event sits unprocessed past its claim timeout

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{LedgerStore, RefundLedgerAnomaly};

const STALE_WEBHOOK_SAMPLE: i64 = 100;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Ledger rows involved (payment ids, webhook event ids)
    pub entity_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may move incorrectly
    Critical,
    /// Bookkeeping disagrees with itself
    High,
    /// Work is stuck and needs a look
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// No violations at all
    pub healthy: bool,
}

pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
    stale_webhook_after: Duration,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn LedgerStore>, stale_webhook_after: Duration) -> Self {
        Self {
            store,
            stale_webhook_after,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // One aggregate pass feeds the three refund checks
        let anomalies = self.store.refund_ledger_anomalies().await?;
        violations.extend(refund_total_violations(&anomalies));
        violations.extend(reservation_bound_violations(&anomalies));
        violations.extend(reservation_drift_violations(&anomalies));
        violations.extend(self.check_no_stale_webhooks().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed,
                "Ledger invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let check: fn(&[RefundLedgerAnomaly]) -> Vec<InvariantViolation> = match name {
            "refund_total_within_amount" => refund_total_violations,
            "reservation_within_amount" => reservation_bound_violations,
            "reservation_matches_refunds" => reservation_drift_violations,
            "no_stale_webhooks" => return self.check_no_stale_webhooks().await,
            _ => return Ok(vec![]),
        };
        let anomalies = self.store.refund_ledger_anomalies().await?;
        Ok(check(&anomalies))
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "refund_total_within_amount",
            "reservation_within_amount",
            "reservation_matches_refunds",
            "no_stale_webhooks",
        ]
    }

    async fn check_no_stale_webhooks(&self) -> BillingResult<Vec<InvariantViolation>> {
        let claimed_before = OffsetDateTime::now_utc() - self.stale_webhook_after;
        let stale = self
            .store
            .list_stale_webhook_events(claimed_before, STALE_WEBHOOK_SAMPLE)
            .await?;

        Ok(stale
            .into_iter()
            .map(|event| InvariantViolation {
                invariant: "no_stale_webhooks".to_string(),
                entity_ids: vec![event.id],
                description: format!(
                    "Webhook {} ({}) unprocessed after {} attempts",
                    event.provider_event_id, event.event_type, event.processing_attempts
                ),
                context: serde_json::json!({
                    "provider": event.provider,
                    "event_type": event.event_type,
                    "received_at": event.received_at,
                    "processing_started_at": event.processing_started_at,
                    "attempts": event.processing_attempts,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

fn anomaly_context(row: &RefundLedgerAnomaly) -> serde_json::Value {
    serde_json::json!({
        "amount": row.amount,
        "refunded_amount": row.refunded_amount,
        "succeeded_total": row.succeeded_total,
        "reserved_total": row.reserved_total,
    })
}

fn refund_total_violations(rows: &[RefundLedgerAnomaly]) -> Vec<InvariantViolation> {
    rows.iter()
        .filter(|row| row.succeeded_total > row.amount)
        .map(|row| InvariantViolation {
            invariant: "refund_total_within_amount".to_string(),
            entity_ids: vec![row.payment_id],
            description: format!(
                "Succeeded refunds total {} on a payment of {}",
                row.succeeded_total, row.amount
            ),
            context: anomaly_context(row),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn reservation_bound_violations(rows: &[RefundLedgerAnomaly]) -> Vec<InvariantViolation> {
    rows.iter()
        .filter(|row| row.refunded_amount > row.amount)
        .map(|row| InvariantViolation {
            invariant: "reservation_within_amount".to_string(),
            entity_ids: vec![row.payment_id],
            description: format!(
                "Reserved refund total {} exceeds payment amount {}",
                row.refunded_amount, row.amount
            ),
            context: anomaly_context(row),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn reservation_drift_violations(rows: &[RefundLedgerAnomaly]) -> Vec<InvariantViolation> {
    rows.iter()
        .filter(|row| row.refunded_amount != row.reserved_total)
        .map(|row| {
            // A reservation below what refunds hold lets a later refund overshoot
            let severity = if row.refunded_amount < row.reserved_total {
                ViolationSeverity::High
            } else {
                ViolationSeverity::Medium
            };
            InvariantViolation {
                invariant: "reservation_matches_refunds".to_string(),
                entity_ids: vec![row.payment_id],
                description: format!(
                    "Payment reserves {} but its live refunds hold {}",
                    row.refunded_amount, row.reserved_total
                ),
                context: anomaly_context(row),
                severity,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refunds::{CreateRefundRequest, RefundManager};
    use crate::testing::{fake_registry, memory_ledger, payment_manager, succeeded_payment};
    use crate::types::Metadata;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"refund_total_within_amount"));
        assert!(checks.contains(&"no_stale_webhooks"));
    }

    #[test]
    fn test_anomaly_classification() {
        let overshoot = RefundLedgerAnomaly {
            payment_id: Uuid::new_v4(),
            amount: 10_000,
            refunded_amount: 12_000,
            succeeded_total: 12_000,
            reserved_total: 12_000,
        };
        assert_eq!(refund_total_violations(&[overshoot.clone()]).len(), 1);
        assert_eq!(reservation_bound_violations(&[overshoot.clone()]).len(), 1);
        assert!(reservation_drift_violations(&[overshoot]).is_empty());

        let under_reserved = RefundLedgerAnomaly {
            payment_id: Uuid::new_v4(),
            amount: 10_000,
            refunded_amount: 2_000,
            succeeded_total: 5_000,
            reserved_total: 5_000,
        };
        let drift = reservation_drift_violations(&[under_reserved]);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].severity, ViolationSeverity::High);
    }

    #[tokio::test]
    async fn test_healthy_ledger_after_refunds() {
        let ledger = memory_ledger();
        let (_, registry) = fake_registry();
        let payments = payment_manager(ledger.clone(), registry.clone());
        let payment = succeeded_payment(&payments, ledger.as_ref(), "user-a", 10_000).await;
        let refunds = RefundManager::new(ledger.clone(), registry, payments);
        refunds
            .create(
                "user-a",
                CreateRefundRequest {
                    payment_id: payment.id,
                    amount: 4_000,
                    reason: None,
                    notes: None,
                    metadata: Metadata::new(),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();

        let checker = InvariantChecker::new(ledger, Duration::from_secs(300));
        let summary = checker.run_all_checks().await.unwrap();
        assert!(summary.healthy, "violations: {:?}", summary.violations);
        assert_eq!(summary.checks_run, 4);
        assert_eq!(summary.checks_passed, 4);
    }

    #[tokio::test]
    async fn test_drifted_reservation_reported() {
        let ledger = memory_ledger();
        let (_, registry) = fake_registry();
        let payments = payment_manager(ledger.clone(), registry);
        let payment = succeeded_payment(&payments, ledger.as_ref(), "user-a", 10_000).await;
        // Reservation without any refund row behind it
        assert!(ledger.reserve_refund(payment.id, 3_000).await.unwrap());

        let checker = InvariantChecker::new(ledger, Duration::from_secs(300));
        let summary = checker.run_all_checks().await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 1);
        assert_eq!(summary.violations[0].invariant, "reservation_matches_refunds");
        assert_eq!(summary.violations[0].entity_ids, vec![payment.id]);

        let single = checker.run_check("reservation_matches_refunds").await.unwrap();
        assert_eq!(single.len(), 1);
        assert!(checker.run_check("no_such_check").await.unwrap().is_empty());
    }
}
