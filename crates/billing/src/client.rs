//! Stripe client wrapper and the live [`ProcessorClient`] implementation.

use std::collections::HashMap;

use paidup_shared::SubscriptionStatus;
use stripe::{
    AttachPaymentMethod, CreateCustomer, CreateSubscription, CreateSubscriptionItems, Customer,
    CustomerId, PaymentMethod, PaymentMethodId, RequestStrategy, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateSubscription, UpdateSubscriptionItems,
};
// Import the proration behavior enum from the subscription module (not subscription_item)
use async_trait::async_trait;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::{CreateSubscriptionRequest, ProcessorClient, ProcessorSubscription};

/// Stripe configuration.
#[derive(Clone)]
pub struct StripeConfig {
    /// Secret API key (sk_test_... or sk_live_...).
    pub secret_key: String,
}

impl StripeConfig {
    /// Load configuration from `STRIPE_SECRET_KEY`.
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        Ok(Self { secret_key })
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig").finish_non_exhaustive()
    }
}

/// Thin wrapper around the Stripe SDK client.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying SDK client.
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Live [`ProcessorClient`] backed by the Stripe API.
#[derive(Clone, Debug)]
pub struct StripeProcessor {
    stripe: StripeClient,
}

impl StripeProcessor {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeClient::from_env()?))
    }

    /// SDK client, keyed for idempotent replay when a key is supplied.
    fn client_for(&self, idempotency_key: Option<&str>) -> stripe::Client {
        match idempotency_key {
            Some(key) => self
                .stripe
                .inner()
                .clone()
                .with_strategy(RequestStrategy::Idempotent(key.to_string())),
            None => self.stripe.inner().clone(),
        }
    }
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>()
        .map_err(|e| BillingError::Processor(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::Processor(format!("Invalid subscription ID: {}", e)))
}

fn parse_payment_method_id(id: &str) -> BillingResult<PaymentMethodId> {
    id.parse::<PaymentMethodId>()
        .map_err(|e| BillingError::Processor(format!("Invalid payment method ID: {}", e)))
}

fn map_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
    }
}

/// Map an SDK subscription to the processor-neutral view.
///
/// The product id is available without expansion because the SDK exposes
/// unexpanded objects by id.
fn map_subscription(subscription: &Subscription) -> BillingResult<ProcessorSubscription> {
    let item = subscription
        .items
        .data
        .first()
        .ok_or_else(|| BillingError::Processor("Subscription has no items".to_string()))?;

    let price = item
        .price
        .as_ref()
        .ok_or_else(|| BillingError::Processor("Subscription item has no price".to_string()))?;

    let product_id = price
        .product
        .as_ref()
        .map(|p| p.id().to_string())
        .ok_or_else(|| BillingError::Processor("Price has no product".to_string()))?;

    Ok(ProcessorSubscription {
        id: subscription.id.to_string(),
        customer_id: subscription.customer.id().to_string(),
        price_id: price.id.to_string(),
        product_id,
        status: map_status(subscription.status),
    })
}

#[async_trait]
impl ProcessorClient for StripeProcessor {
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "paidup".to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let customer_id = parse_customer_id(customer_id)?;
        let payment_method_id = parse_payment_method_id(payment_method_id)?;

        PaymentMethod::attach(
            self.stripe.inner(),
            &payment_method_id,
            AttachPaymentMethod {
                customer: customer_id.clone(),
            },
        )
        .await?;

        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Attached payment method"
        );

        Ok(())
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<ProcessorSubscription> {
        let customer_id = parse_customer_id(&request.customer_id)?;
        let client = self.client_for(request.idempotency_key.as_deref());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        if !request.metadata.is_empty() {
            params.metadata = Some(request.metadata.clone());
        }
        if let Some(trial_days) = request.trial_days.filter(|d| *d > 0) {
            params.trial_period_days = Some(trial_days);
        }
        if let Some(ref payment_method_id) = request.payment_method_id {
            params.default_payment_method = Some(payment_method_id.as_str());
        }

        let subscription = Subscription::create(&client, params).await?;

        tracing::info!(
            customer_id = %request.customer_id,
            subscription_id = %subscription.id,
            price_id = %request.price_id,
            "Created subscription"
        );

        map_subscription(&subscription)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        map_subscription(&subscription)
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        // The subscription keeps its id; only the billed item changes, so we
        // need the current item id first.
        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Processor("Subscription has no items".to_string()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            // Charge the prorated difference immediately on upgrades
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let client = self.client_for(idempotency_key);
        let subscription = Subscription::update(&client, &sub_id, params)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("no attached payment source")
                    || err_str.contains("no default payment method")
                {
                    tracing::warn!(
                        subscription_id = %sub_id,
                        error = %err_str,
                        "Subscription update failed: customer has no payment method"
                    );
                    return BillingError::PaymentMethodRequired(price_id.to_string());
                }
                BillingError::Processor(err_str)
            })?;

        tracing::info!(
            subscription_id = %subscription.id,
            price_id = %price_id,
            "Updated subscription price"
        );

        map_subscription(&subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert_eq!(map_status(StripeSubStatus::Active), SubscriptionStatus::Active);
        assert_eq!(map_status(StripeSubStatus::Trialing), SubscriptionStatus::Trialing);
        assert_eq!(map_status(StripeSubStatus::PastDue), SubscriptionStatus::PastDue);
        assert_eq!(map_status(StripeSubStatus::Canceled), SubscriptionStatus::Canceled);
    }

    #[test]
    fn test_parse_ids_reject_garbage() {
        assert!(parse_customer_id("not a customer id").is_err());
        assert!(parse_subscription_id("not a subscription id").is_err());
        assert!(parse_payment_method_id("not a payment method id").is_err());
    }
}
