//! Billing error taxonomy.
//!
//! Every synchronizer operation returns [`BillingResult`]; errors propagate
//! to the caller unmutated. The calling layer is responsible for translating
//! them into user-visible messages.

use thiserror::Error;
use uuid::Uuid;

/// Errors from billing operations.
#[derive(Debug, Error)]
pub enum BillingError {
    /// The local plan identifier does not exist in the catalog.
    #[error("Unknown plan '{0}'")]
    UnknownPlan(String),

    /// The user has no billing state, so there is no subscription to mutate.
    #[error("User {0} has no active subscription")]
    NoActiveSubscription(Uuid),

    /// The user already has billing state; subscribe is a one-time operation.
    #[error("User {0} already has a subscription")]
    AlreadySubscribed(Uuid),

    /// The target plan has no trial, so the operation requires a payment method.
    #[error("A payment method is required for '{0}'")]
    PaymentMethodRequired(String),

    /// Optimistic-lock conflict on a billing state commit.
    #[error("Billing state was modified concurrently: {0}")]
    ConcurrentModification(String),

    /// The payment processor rejected the call or timed out.
    #[error("Payment processor error: {0}")]
    Processor(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant failure.
    #[error("Internal billing error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Processor(err.to_string())
    }
}

/// Result alias for billing operations.
pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BillingError::UnknownPlan("gold-weekly".to_string());
        assert_eq!(err.to_string(), "Unknown plan 'gold-weekly'");

        let user = Uuid::new_v4();
        let err = BillingError::NoActiveSubscription(user);
        assert!(err.to_string().contains(&user.to_string()));
    }

    #[test]
    fn test_sqlx_error_maps_to_database() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::Database(_)));
    }
}
