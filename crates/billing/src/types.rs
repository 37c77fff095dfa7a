//! Ledger entity types
//!
//! Customers, payments, subscriptions, refunds and webhook events as they are
//! persisted locally, plus the status enums the providers drive.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Free-form key/value metadata attached to ledger entities
pub type Metadata = HashMap<String, String>;

/// Declares a closed string-backed enum with `as_str`, `Display` and `FromStr`.
///
/// The string form is what gets stored in the ledger and what providers send.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $wire:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// A string did not name any variant of a wire enum
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

wire_enum! {
    /// External payment network integration
    pub enum Provider {
        Stripe => "stripe",
        Swish => "swish",
    }
}

wire_enum! {
    /// Supported settlement currencies (no conversion is performed)
    pub enum Currency {
        SEK => "SEK",
        USD => "USD",
        EUR => "EUR",
        GBP => "GBP",
    }
}

wire_enum! {
    pub enum PaymentStatus {
        Pending => "pending",
        RequiresAction => "requires_action",
        Processing => "processing",
        Succeeded => "succeeded",
        Failed => "failed",
        Canceled => "canceled",
    }
}

wire_enum! {
    pub enum SubscriptionStatus {
        Incomplete => "incomplete",
        IncompleteExpired => "incomplete_expired",
        Trialing => "trialing",
        Active => "active",
        PastDue => "past_due",
        Unpaid => "unpaid",
        Paused => "paused",
        Canceled => "canceled",
    }
}

wire_enum! {
    pub enum RefundStatus {
        Pending => "pending",
        Processing => "processing",
        Succeeded => "succeeded",
        Failed => "failed",
        Canceled => "canceled",
    }
}

wire_enum! {
    /// Recurring billing interval unit
    pub enum BillingInterval {
        Day => "day",
        Week => "week",
        Month => "month",
        Year => "year",
    }
}

wire_enum! {
    /// Ledger entity a webhook event targets
    pub enum ResourceKind {
        Payment => "payment",
        Subscription => "subscription",
        Refund => "refund",
        Other => "other",
    }
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::Failed | PaymentStatus::Canceled
        )
    }
}

impl SubscriptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }
}

impl RefundStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefundStatus::Succeeded | RefundStatus::Failed | RefundStatus::Canceled
        )
    }

    /// Whether a refund in this status still holds part of the payment's refundable amount
    pub fn holds_reservation(&self) -> bool {
        !matches!(self, RefundStatus::Failed | RefundStatus::Canceled)
    }
}

/// One provider-side customer id per provider variant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCustomerIds {
    pub stripe: Option<String>,
    pub swish: Option<String>,
}

impl ProviderCustomerIds {
    pub fn get(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Stripe => self.stripe.as_deref(),
            Provider::Swish => self.swish.as_deref(),
        }
    }

    pub fn set(&mut self, provider: Provider, id: String) {
        match provider {
            Provider::Stripe => self.stripe = Some(id),
            Provider::Swish => self.swish = Some(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub provider_ids: ProviderCustomerIds,
    pub metadata: Metadata,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub provider: Provider,
    pub provider_payment_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub description: Option<String>,
    pub statement_descriptor: Option<String>,
    pub client_secret: Option<String>,
    pub payment_method_type: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub metadata: Metadata,
    pub idempotency_key: Option<String>,
    /// Sum of refund amounts currently holding a reservation against this payment
    pub refunded_amount: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub provider: Provider,
    pub provider_subscription_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub product_name: String,
    pub product_description: Option<String>,
    pub metadata: Metadata,
    pub idempotency_key: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub provider: Provider,
    pub provider_refund_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub status: RefundStatus,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: Metadata,
    pub idempotency_key: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Stored provider webhook event, unique per (provider, provider_event_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider: Provider,
    pub provider_event_id: String,
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processing_error: Option<String>,
    /// The recorded error may clear once the ledger catches up
    pub error_replayable: bool,
    pub processing_attempts: i32,
    pub received_at: OffsetDateTime,
    pub processing_started_at: Option<OffsetDateTime>,
    pub processed_at: Option<OffsetDateTime>,
}

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Normalized limit/offset window for list operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    /// Non-positive or missing limits fall back to the default; large limits are capped.
    /// Negative or missing offsets become zero.
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        let limit = match limit {
            Some(l) if l > 0 => l.min(MAX_PAGE_LIMIT),
            _ => DEFAULT_PAGE_LIMIT,
        };
        let offset = offset.filter(|o| *o >= 0).unwrap_or(0);
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

impl<T> PageResult<T> {
    pub fn empty(page: Page) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            limit: page.limit,
            offset: page.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_defaults_and_clamps() {
        assert_eq!(Page::new(None, None), Page { limit: 20, offset: 0 });
        assert_eq!(Page::new(Some(0), None).limit, 20);
        assert_eq!(Page::new(Some(-5), None).limit, 20);
        assert_eq!(Page::new(Some(500), None).limit, 100);
        assert_eq!(Page::new(Some(100), None).limit, 100);
        assert_eq!(Page::new(Some(1), None).limit, 1);
        assert_eq!(Page::new(None, Some(-1)).offset, 0);
        assert_eq!(Page::new(None, Some(40)).offset, 40);
    }

    #[test]
    fn test_wire_enum_round_trip_through_str() {
        for status in SubscriptionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(*status));
        }
        assert_eq!("SEK".parse::<Currency>(), Ok(Currency::SEK));
        assert!("sek".parse::<Currency>().is_err());
        assert_eq!(Provider::Swish.to_string(), "swish");
    }

    #[test]
    fn test_unknown_variant_message() {
        let err = "paypal".parse::<Provider>().unwrap_err();
        assert_eq!(err.to_string(), "unknown Provider 'paypal'");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(PaymentStatus::Succeeded.is_terminal());
        assert!(!PaymentStatus::RequiresAction.is_terminal());
        assert!(SubscriptionStatus::IncompleteExpired.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
        assert!(RefundStatus::Canceled.is_terminal());
        assert!(!RefundStatus::Processing.is_terminal());
    }

    #[test]
    fn test_refund_reservation_statuses() {
        assert!(RefundStatus::Pending.holds_reservation());
        assert!(RefundStatus::Succeeded.holds_reservation());
        assert!(!RefundStatus::Failed.holds_reservation());
        assert!(!RefundStatus::Canceled.holds_reservation());
    }

    #[test]
    fn test_provider_customer_ids_slots() {
        let mut ids = ProviderCustomerIds::default();
        assert_eq!(ids.get(Provider::Stripe), None);
        ids.set(Provider::Stripe, "cus_1".to_string());
        assert_eq!(ids.get(Provider::Stripe), Some("cus_1"));
        assert_eq!(ids.get(Provider::Swish), None);
    }
}
