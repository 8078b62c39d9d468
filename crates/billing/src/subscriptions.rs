//! Subscription synchronizer.
//!
//! Drives the payment processor through customer creation, payment-method
//! attachment, subscription creation, and plan/product swaps, keeping the
//! local [`BillingState`] in sync with the processor's ledger.
//!
//! The processor is the source of truth for subscription status. Every
//! mutation calls the processor first and commits local state only after the
//! processor confirms the change; on processor failure the local record is
//! left untouched. Commits are compare-and-swap guarded, so two racing
//! mutations for the same user cannot both apply — the loser observes
//! [`BillingError::ConcurrentModification`].

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::processor::{CreateSubscriptionRequest, ProcessorClient};
use crate::store::{BillingState, BillingStateStore, CardDetails};

/// A payment method being put on file.
#[derive(Debug, Clone)]
pub struct NewPaymentMethod {
    /// Processor payment method id (already vaulted client-side).
    pub payment_method_id: String,
    /// Display fields for the card behind the method.
    pub card: CardDetails,
}

/// Subscription service synchronizing local billing state with the processor.
pub struct SubscriptionService {
    store: Arc<dyn BillingStateStore>,
    processor: Arc<dyn ProcessorClient>,
    catalog: PlanCatalog,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStateStore>,
        processor: Arc<dyn ProcessorClient>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            store,
            processor,
            catalog,
        }
    }

    /// The plan/product catalog this service resolves against.
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Subscribe a user to a plan, creating their billing state.
    ///
    /// Plans with a trial subscribe without a payment method; plans without
    /// one require a method up front. The processor sequence is customer →
    /// optional attach → subscription; the local record is inserted only
    /// after the subscription exists. If two subscribes race, the insert
    /// rejects the loser with [`BillingError::AlreadySubscribed`].
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        email: &str,
        plan_id: &str,
        payment_method: Option<NewPaymentMethod>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<BillingState> {
        if self.store.get(user_id).await?.is_some() {
            return Err(BillingError::AlreadySubscribed(user_id));
        }

        let plan = self
            .catalog
            .get(plan_id)
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))?
            .clone();

        if plan.requires_payment_method() && payment_method.is_none() {
            return Err(BillingError::PaymentMethodRequired(plan_id.to_string()));
        }

        let customer_id = self.processor.create_customer(user_id, email).await?;

        if let Some(ref method) = payment_method {
            self.processor
                .attach_payment_method(&customer_id, &method.payment_method_id)
                .await?;
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("plan_id".to_string(), plan_id.to_string());

        let subscription = self
            .processor
            .create_subscription(CreateSubscriptionRequest {
                customer_id: customer_id.clone(),
                price_id: plan.stripe_price_id.clone(),
                trial_days: (plan.trial_days > 0).then_some(plan.trial_days),
                payment_method_id: payment_method
                    .as_ref()
                    .map(|m| m.payment_method_id.clone()),
                idempotency_key: idempotency_key.map(str::to_string),
                metadata,
            })
            .await?;

        let state = BillingState {
            stripe_customer_id: customer_id,
            stripe_subscription_id: subscription.id.clone(),
            stripe_price_id: subscription.price_id.clone(),
            plan_id: plan_id.to_string(),
            status: subscription.status,
            card: payment_method.map(|m| m.card),
            version: 1,
            updated_at: OffsetDateTime::now_utc(),
        };

        let stored = self.store.insert(user_id, &state).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %stored.stripe_subscription_id,
            plan_id = %plan_id,
            status = %stored.status,
            "Created subscription"
        );

        Ok(stored)
    }

    /// Put a new payment method on file for the user's processor customer.
    ///
    /// The card display fields are committed only after the processor
    /// confirms the attachment; a rejected attachment leaves local state
    /// unchanged.
    pub async fn update_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: &str,
        card: CardDetails,
    ) -> BillingResult<BillingState> {
        let state = self
            .store
            .get(user_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(user_id))?;

        self.processor
            .attach_payment_method(&state.stripe_customer_id, payment_method_id)
            .await?;

        let new_state = BillingState {
            card: Some(card),
            ..state.clone()
        };
        let committed = self.store.commit(user_id, &new_state, state.version).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %committed.stripe_customer_id,
            "Updated payment method"
        );

        Ok(committed)
    }

    /// Swap the user's subscription to another plan.
    ///
    /// Covers same-product cadence swaps (monthly → annual) and cross-product
    /// swaps (basic → pro): the processor stores product as a property of the
    /// price, so changing the price on the existing subscription moves the
    /// product with it. The subscription id never changes. Local plan id and
    /// price id are committed together, after processor confirmation, under
    /// the version observed before the call.
    pub async fn swap_plan(
        &self,
        user_id: Uuid,
        target_plan_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<BillingState> {
        let state = self
            .store
            .get(user_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(user_id))?;

        let plan = self
            .catalog
            .get(target_plan_id)
            .ok_or_else(|| BillingError::UnknownPlan(target_plan_id.to_string()))?;

        if state.plan_id == target_plan_id {
            tracing::debug!(
                user_id = %user_id,
                plan_id = %target_plan_id,
                "Swap requested to current plan, nothing to do"
            );
            return Ok(state);
        }

        let updated = self
            .processor
            .update_subscription_price(
                &state.stripe_subscription_id,
                &plan.stripe_price_id,
                idempotency_key,
            )
            .await?;

        let new_state = BillingState {
            plan_id: target_plan_id.to_string(),
            stripe_price_id: updated.price_id.clone(),
            status: updated.status,
            ..state.clone()
        };
        let committed = self.store.commit(user_id, &new_state, state.version).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %committed.stripe_subscription_id,
            from_plan = %state.plan_id,
            to_plan = %target_plan_id,
            "Swapped subscription plan"
        );

        Ok(committed)
    }

    /// Current billing state for a user, if any.
    pub async fn billing_state(&self, user_id: Uuid) -> BillingResult<Option<BillingState>> {
        self.store.get(user_id).await
    }

    /// Whether the user has an active (or trialing) subscription.
    pub async fn has_active_subscription(&self, user_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .store
            .get(user_id)
            .await?
            .map(|s| s.status.is_active())
            .unwrap_or(false))
    }

    /// Re-read the subscription from the processor and commit the refreshed
    /// status (and price, should it have changed out of band).
    pub async fn refresh(&self, user_id: Uuid) -> BillingResult<Option<BillingState>> {
        let state = match self.store.get(user_id).await? {
            Some(state) => state,
            None => return Ok(None),
        };

        let remote = self
            .processor
            .get_subscription(&state.stripe_subscription_id)
            .await?;

        let plan_id = if remote.price_id == state.stripe_price_id {
            state.plan_id.clone()
        } else {
            match self.catalog.find_by_price(&remote.price_id) {
                Some(plan) => plan.id.clone(),
                None => {
                    tracing::warn!(
                        user_id = %user_id,
                        price_id = %remote.price_id,
                        "Processor price has no catalog plan, keeping local plan id"
                    );
                    state.plan_id.clone()
                }
            }
        };

        let new_state = BillingState {
            stripe_price_id: remote.price_id.clone(),
            plan_id,
            status: remote.status,
            ..state.clone()
        };
        let committed = self.store.commit(user_id, &new_state, state.version).await?;

        Ok(Some(committed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_catalog, FakeProcessor, InMemoryBillingStore};

    fn service() -> SubscriptionService {
        let catalog = test_catalog();
        let processor = Arc::new(FakeProcessor::with_catalog(&catalog));
        let store = Arc::new(InMemoryBillingStore::new());
        SubscriptionService::new(store, processor, catalog)
    }

    fn card() -> CardDetails {
        CardDetails {
            brand: "Visa".to_string(),
            last4: "4242".to_string(),
            exp_month: 6,
            exp_year: 2027,
        }
    }

    #[tokio::test]
    async fn test_subscribe_trial_plan_without_card() {
        let service = service();
        let user = Uuid::new_v4();

        let state = service
            .subscribe(user, "user@example.com", "basic-monthly", None, None)
            .await
            .unwrap();

        assert_eq!(state.plan_id, "basic-monthly");
        assert_eq!(state.stripe_price_id, "price_basic_m");
        assert!(state.card.is_none());
        assert!(service.has_active_subscription(user).await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_no_trial_plan_requires_card() {
        let service = service();
        let user = Uuid::new_v4();

        let err = service
            .subscribe(user, "user@example.com", "pro-monthly", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::PaymentMethodRequired(p) if p == "pro-monthly"));
        assert!(service.billing_state(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_plan() {
        let service = service();
        let err = service
            .subscribe(Uuid::new_v4(), "user@example.com", "gold-weekly", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::UnknownPlan(_)));
    }

    #[tokio::test]
    async fn test_subscribe_twice_rejected() {
        let service = service();
        let user = Uuid::new_v4();

        service
            .subscribe(user, "user@example.com", "basic-monthly", None, None)
            .await
            .unwrap();
        let err = service
            .subscribe(user, "user@example.com", "basic-monthly", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::AlreadySubscribed(u) if u == user));
    }

    #[tokio::test]
    async fn test_subscribe_with_card_stores_display_fields() {
        let service = service();
        let user = Uuid::new_v4();

        let state = service
            .subscribe(
                user,
                "user@example.com",
                "pro-monthly",
                Some(NewPaymentMethod {
                    payment_method_id: "pm_123".to_string(),
                    card: card(),
                }),
                None,
            )
            .await
            .unwrap();

        assert_eq!(state.card.as_ref().unwrap().last4, "4242");
        assert_eq!(state.plan_id, "pro-monthly");
    }

    #[tokio::test]
    async fn test_swap_to_current_plan_is_noop() {
        let service = service();
        let user = Uuid::new_v4();

        let before = service
            .subscribe(user, "user@example.com", "basic-monthly", None, None)
            .await
            .unwrap();
        let after = service.swap_plan(user, "basic-monthly", None).await.unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_refresh_syncs_status() {
        let catalog = test_catalog();
        let processor = Arc::new(FakeProcessor::with_catalog(&catalog));
        let store = Arc::new(InMemoryBillingStore::new());
        let service = SubscriptionService::new(store, processor.clone(), catalog);
        let user = Uuid::new_v4();

        let state = service
            .subscribe(user, "user@example.com", "basic-monthly", None, None)
            .await
            .unwrap();
        processor.set_subscription_status(
            &state.stripe_subscription_id,
            paidup_shared::SubscriptionStatus::PastDue,
        );

        let refreshed = service.refresh(user).await.unwrap().unwrap();
        assert_eq!(refreshed.status, paidup_shared::SubscriptionStatus::PastDue);
        assert!(refreshed.version > state.version);
    }
}
