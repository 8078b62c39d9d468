//! Payment processor client interface.
//!
//! The synchronizer talks to the processor exclusively through this trait so
//! that business logic is testable without network access. The live Stripe
//! implementation lives in [`crate::client`]; an in-memory fake lives in
//! [`crate::testing`].

use std::collections::HashMap;

use async_trait::async_trait;
use paidup_shared::SubscriptionStatus;
use uuid::Uuid;

use crate::error::BillingResult;

/// Processor-side view of a subscription.
///
/// The processor stores product as a property of the price, so updating the
/// price of a subscription moves its product too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSubscription {
    /// Processor subscription id.
    pub id: String,
    /// Processor customer id.
    pub customer_id: String,
    /// Processor price id currently billed.
    pub price_id: String,
    /// Processor product id the current price belongs to.
    pub product_id: String,
    /// Subscription status.
    pub status: SubscriptionStatus,
}

/// Request to create a subscription.
#[derive(Debug, Clone, Default)]
pub struct CreateSubscriptionRequest {
    /// Processor customer id.
    pub customer_id: String,
    /// Processor price id to bill.
    pub price_id: String,
    /// Trial period in days (None or 0 = no trial).
    pub trial_days: Option<u32>,
    /// Payment method to bill with (required for no-trial plans).
    pub payment_method_id: Option<String>,
    /// Idempotency key forwarded to the processor call.
    pub idempotency_key: Option<String>,
    /// Metadata attached to the processor subscription.
    pub metadata: HashMap<String, String>,
}

/// Operations the synchronizer needs from the payment processor.
///
/// Errors surface as [`crate::BillingError::Processor`]; implementations must
/// not retry mutations internally (a subscription mutation must not be
/// applied twice) — callers retry at the request layer using the idempotency
/// key forwarded with the call.
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    /// Create a processor customer for a user, returning the customer id.
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String>;

    /// Attach a payment method to a customer.
    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    /// Create a subscription for a customer.
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<ProcessorSubscription>;

    /// Retrieve a subscription.
    async fn get_subscription(&self, subscription_id: &str)
        -> BillingResult<ProcessorSubscription>;

    /// Change the price (and therefore possibly the product) billed on an
    /// existing subscription, keeping the same subscription id.
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProcessorSubscription>;
}
