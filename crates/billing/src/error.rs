//! Billing error taxonomy
//!
//! Every error maps to a stable machine-readable code and a public message that
//! never carries provider detail or internal state. The transport layer picks
//! status codes from `code()`.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::store::StoreError;
use crate::types::Provider;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Entity is absent or owned by someone else; the two are never distinguished
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Provider {0} is not available")]
    ProviderUnavailable(Provider),

    #[error("Payment failed: {0}")]
    PaymentFailed(GatewayError),

    #[error("Provider error: {0}")]
    Provider(GatewayError),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimitExceeded { retry_after_seconds: u64 },

    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::ValidationFailed(_) => "validation_failed",
            BillingError::AuthenticationFailed => "authentication_failed",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidState(_) => "invalid_state",
            BillingError::ProviderUnavailable(_) => "provider_unavailable",
            BillingError::PaymentFailed(_) => "payment_failed",
            BillingError::Provider(_) => "provider_error",
            BillingError::PersistenceFailed(_) => "persistence_failed",
            BillingError::InvalidSignature => "invalid_signature",
            BillingError::MalformedPayload(_) => "malformed_payload",
            BillingError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            BillingError::IdempotencyConflict(_) => "idempotency_conflict",
            BillingError::Config(_) => "configuration_error",
            BillingError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show to the caller
    pub fn public_message(&self) -> String {
        match self {
            // Validation text is written by this crate and describes the caller's input
            BillingError::ValidationFailed(msg) => msg.clone(),
            BillingError::InvalidState(msg) => msg.clone(),
            BillingError::AuthenticationFailed => "Authentication required".to_string(),
            BillingError::NotFound(_) => "Resource not found".to_string(),
            BillingError::ProviderUnavailable(provider) => {
                format!("Payment provider '{}' is not available", provider)
            }
            BillingError::PaymentFailed(_) => "The payment provider rejected the request".to_string(),
            BillingError::Provider(_) => "The payment provider could not complete the request".to_string(),
            BillingError::PersistenceFailed(_) => {
                "The request could not be recorded, please retry later".to_string()
            }
            BillingError::InvalidSignature => "Invalid webhook signature".to_string(),
            BillingError::MalformedPayload(_) => "Malformed webhook payload".to_string(),
            BillingError::RateLimitExceeded {
                retry_after_seconds,
            } => format!(
                "Too many requests, retry after {} seconds",
                retry_after_seconds
            ),
            BillingError::IdempotencyConflict(_) => {
                "A request with this idempotency key is in progress or used a different body"
                    .to_string()
            }
            BillingError::Config(_) | BillingError::Internal(_) => {
                "Internal server error".to_string()
            }
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::PersistenceFailed(_) | BillingError::RateLimitExceeded { .. }
        )
    }
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        BillingError::PersistenceFailed(err.to_string())
    }
}
