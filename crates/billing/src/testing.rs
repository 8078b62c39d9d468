//! In-memory fakes for offline tests.
//!
//! [`FakeProcessor`] and [`InMemoryBillingStore`] implement the processor and
//! store seams without network or database access, so synchronizer behavior
//! (including failure and race paths) is testable hermetically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use paidup_shared::{BillingInterval, SubscriptionStatus};
use time::OffsetDateTime;
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::catalog::{Plan, PlanCatalog, Product};
use crate::error::{BillingError, BillingResult};
use crate::processor::{CreateSubscriptionRequest, ProcessorClient, ProcessorSubscription};
use crate::store::{BillingState, BillingStateStore};

/// Standard two-product catalog used across tests.
///
/// `basic-monthly` carries a trial (subscribes without a card); every other
/// plan requires a payment method.
#[must_use]
#[allow(clippy::unwrap_used)]
pub fn test_catalog() -> PlanCatalog {
    let mut catalog = PlanCatalog::new();
    catalog.add_product(Product {
        id: "basic".to_string(),
        name: "Basic".to_string(),
        stripe_product_id: "prod_basic".to_string(),
    });
    catalog.add_product(Product {
        id: "pro".to_string(),
        name: "Pro".to_string(),
        stripe_product_id: "prod_pro".to_string(),
    });

    let plans = [
        ("basic-monthly", "basic", "price_basic_m", BillingInterval::Monthly, 14),
        ("basic-annual", "basic", "price_basic_a", BillingInterval::Annual, 0),
        ("pro-monthly", "pro", "price_pro_m", BillingInterval::Monthly, 0),
        ("pro-annual", "pro", "price_pro_a", BillingInterval::Annual, 0),
    ];
    for (id, product_id, price_id, interval, trial_days) in plans {
        catalog
            .add_plan(Plan {
                id: id.to_string(),
                product_id: product_id.to_string(),
                stripe_price_id: price_id.to_string(),
                interval,
                trial_days,
                display_name: id.to_string(),
            })
            .unwrap();
    }
    catalog
}

/// A customer held by the fake processor.
#[derive(Debug, Clone, Default)]
pub struct FakeCustomer {
    pub email: String,
    pub payment_methods: Vec<String>,
}

/// A subscription held by the fake processor.
///
/// Product follows price, as it does on the real processor.
#[derive(Debug, Clone)]
pub struct FakeSubscription {
    pub customer_id: String,
    pub price_id: String,
    pub product_id: String,
    pub status: SubscriptionStatus,
}

#[derive(Default)]
struct FakeProcessorInner {
    customers: HashMap<String, FakeCustomer>,
    subscriptions: HashMap<String, FakeSubscription>,
    price_to_product: HashMap<String, String>,
    fail_next: Option<String>,
    last_idempotency_key: Option<String>,
    next_id: u64,
}

impl FakeProcessorInner {
    fn take_failure(&mut self) -> BillingResult<()> {
        if let Some(message) = self.fail_next.take() {
            return Err(BillingError::Processor(message));
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_fake_{}", prefix, self.next_id)
    }
}

/// In-memory [`ProcessorClient`].
#[derive(Default)]
pub struct FakeProcessor {
    inner: Mutex<FakeProcessorInner>,
    update_gate: Mutex<Option<Arc<Barrier>>>,
}

impl FakeProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fake whose price → product mapping mirrors a catalog.
    #[must_use]
    pub fn with_catalog(catalog: &PlanCatalog) -> Self {
        let fake = Self::new();
        {
            let mut inner = fake.lock();
            for (_, plan) in catalog.iter() {
                if let Ok(product) = catalog.product_for_plan(&plan.id) {
                    inner
                        .price_to_product
                        .insert(plan.stripe_price_id.clone(), product.stripe_product_id.clone());
                }
            }
        }
        fake
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeProcessorInner> {
        self.inner.lock().unwrap()
    }

    /// Register a price the fake should accept.
    pub fn register_price(&self, price_id: &str, product_id: &str) {
        self.lock()
            .price_to_product
            .insert(price_id.to_string(), product_id.to_string());
    }

    /// Make the next processor call fail with the given message.
    pub fn fail_next(&self, message: &str) {
        self.lock().fail_next = Some(message.to_string());
    }

    /// Park `update_subscription_price` calls on a barrier until all racing
    /// callers have read their precondition. Used by race tests.
    #[allow(clippy::unwrap_used)]
    pub fn gate_updates(&self, barrier: Arc<Barrier>) {
        *self.update_gate.lock().unwrap() = Some(barrier);
    }

    /// Force a subscription's status (simulates out-of-band processor state).
    pub fn set_subscription_status(&self, subscription_id: &str, status: SubscriptionStatus) {
        if let Some(sub) = self.lock().subscriptions.get_mut(subscription_id) {
            sub.status = status;
        }
    }

    /// Processor-side view of a subscription, for assertions.
    #[must_use]
    pub fn subscription(&self, subscription_id: &str) -> Option<FakeSubscription> {
        self.lock().subscriptions.get(subscription_id).cloned()
    }

    /// Processor-side view of a customer, for assertions.
    #[must_use]
    pub fn customer(&self, customer_id: &str) -> Option<FakeCustomer> {
        self.lock().customers.get(customer_id).cloned()
    }

    /// Idempotency key received with the most recent keyed call.
    #[must_use]
    pub fn last_idempotency_key(&self) -> Option<String> {
        self.lock().last_idempotency_key.clone()
    }
}

#[async_trait]
impl ProcessorClient for FakeProcessor {
    async fn create_customer(&self, _user_id: Uuid, email: &str) -> BillingResult<String> {
        let mut inner = self.lock();
        inner.take_failure()?;
        let id = inner.next_id("cus");
        inner.customers.insert(
            id.clone(),
            FakeCustomer {
                email: email.to_string(),
                payment_methods: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let mut inner = self.lock();
        inner.take_failure()?;
        let customer = inner
            .customers
            .get_mut(customer_id)
            .ok_or_else(|| BillingError::Processor(format!("No such customer: {}", customer_id)))?;
        customer.payment_methods.push(payment_method_id.to_string());
        Ok(())
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<ProcessorSubscription> {
        let mut inner = self.lock();
        inner.take_failure()?;
        inner.last_idempotency_key = request.idempotency_key.clone();

        if !inner.customers.contains_key(&request.customer_id) {
            return Err(BillingError::Processor(format!(
                "No such customer: {}",
                request.customer_id
            )));
        }
        let product_id = inner
            .price_to_product
            .get(&request.price_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::Processor(format!("No such price: {}", request.price_id))
            })?;

        let status = if request.trial_days.unwrap_or(0) > 0 {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };

        let id = inner.next_id("sub");
        inner.subscriptions.insert(
            id.clone(),
            FakeSubscription {
                customer_id: request.customer_id.clone(),
                price_id: request.price_id.clone(),
                product_id: product_id.clone(),
                status,
            },
        );

        Ok(ProcessorSubscription {
            id,
            customer_id: request.customer_id,
            price_id: request.price_id,
            product_id,
            status,
        })
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let inner = self.lock();
        let sub = inner.subscriptions.get(subscription_id).ok_or_else(|| {
            BillingError::Processor(format!("No such subscription: {}", subscription_id))
        })?;
        Ok(ProcessorSubscription {
            id: subscription_id.to_string(),
            customer_id: sub.customer_id.clone(),
            price_id: sub.price_id.clone(),
            product_id: sub.product_id.clone(),
            status: sub.status,
        })
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProcessorSubscription> {
        // Let every racing caller read its precondition before any of them
        // commits. Must happen before the state lock is taken.
        let gate = {
            #[allow(clippy::unwrap_used)]
            let guard = self.update_gate.lock().unwrap();
            guard.clone()
        };
        if let Some(barrier) = gate {
            barrier.wait().await;
        }

        let mut inner = self.lock();
        inner.take_failure()?;
        inner.last_idempotency_key = idempotency_key.map(str::to_string);

        let product_id = inner
            .price_to_product
            .get(price_id)
            .cloned()
            .ok_or_else(|| BillingError::Processor(format!("No such price: {}", price_id)))?;

        let sub = inner.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            BillingError::Processor(format!("No such subscription: {}", subscription_id))
        })?;
        sub.price_id = price_id.to_string();
        sub.product_id = product_id;

        Ok(ProcessorSubscription {
            id: subscription_id.to_string(),
            customer_id: sub.customer_id.clone(),
            price_id: sub.price_id.clone(),
            product_id: sub.product_id.clone(),
            status: sub.status,
        })
    }
}

/// In-memory [`BillingStateStore`] with atomic compare-and-swap commits.
///
/// The whole map sits behind one mutex, so the version check and the write
/// are a single critical section — no TOCTOU window.
#[derive(Default)]
pub struct InMemoryBillingStore {
    records: Mutex<HashMap<Uuid, BillingState>>,
}

impl InMemoryBillingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, BillingState>> {
        self.records.lock().unwrap()
    }
}

#[async_trait]
impl BillingStateStore for InMemoryBillingStore {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<BillingState>> {
        Ok(self.lock().get(&user_id).cloned())
    }

    async fn insert(&self, user_id: Uuid, state: &BillingState) -> BillingResult<BillingState> {
        let mut records = self.lock();
        if records.contains_key(&user_id) {
            return Err(BillingError::AlreadySubscribed(user_id));
        }
        let stored = BillingState {
            version: 1,
            updated_at: OffsetDateTime::now_utc(),
            ..state.clone()
        };
        records.insert(user_id, stored.clone());
        Ok(stored)
    }

    async fn commit(
        &self,
        user_id: Uuid,
        state: &BillingState,
        expected_version: i64,
    ) -> BillingResult<BillingState> {
        let mut records = self.lock();
        let current_version = records.get(&user_id).map(|s| s.version);
        if current_version != Some(expected_version) {
            return Err(BillingError::ConcurrentModification(format!(
                "billing state for user {} was modified by another request",
                user_id
            )));
        }
        let stored = BillingState {
            version: expected_version + 1,
            updated_at: OffsetDateTime::now_utc(),
            ..state.clone()
        };
        records.insert(user_id, stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paidup_shared::SubscriptionStatus;

    fn state() -> BillingState {
        BillingState {
            stripe_customer_id: "cus_1".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            stripe_price_id: "price_basic_m".to_string(),
            plan_id: "basic-monthly".to_string(),
            status: SubscriptionStatus::Active,
            card: None,
            version: 1,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let store = InMemoryBillingStore::new();
        let user = Uuid::new_v4();

        let stored = store.insert(user, &state()).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(store.get(user).await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn test_double_insert_rejected() {
        let store = InMemoryBillingStore::new();
        let user = Uuid::new_v4();

        store.insert(user, &state()).await.unwrap();
        let err = store.insert(user, &state()).await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadySubscribed(u) if u == user));
    }

    #[tokio::test]
    async fn test_commit_bumps_version() {
        let store = InMemoryBillingStore::new();
        let user = Uuid::new_v4();
        store.insert(user, &state()).await.unwrap();

        let mut update = state();
        update.plan_id = "basic-annual".to_string();
        let committed = store.commit(user, &update, 1).await.unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(committed.plan_id, "basic-annual");
    }

    #[tokio::test]
    async fn test_stale_commit_rejected() {
        let store = InMemoryBillingStore::new();
        let user = Uuid::new_v4();
        store.insert(user, &state()).await.unwrap();
        store.commit(user, &state(), 1).await.unwrap();

        // Version 1 was already consumed by the commit above.
        let err = store.commit(user, &state(), 1).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_commit_without_record_rejected() {
        let store = InMemoryBillingStore::new();
        let err = store.commit(Uuid::new_v4(), &state(), 1).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_fake_processor_product_follows_price() {
        let processor = FakeProcessor::with_catalog(&test_catalog());
        let customer = processor
            .create_customer(Uuid::new_v4(), "user@example.com")
            .await
            .unwrap();
        let sub = processor
            .create_subscription(CreateSubscriptionRequest {
                customer_id: customer,
                price_id: "price_basic_m".to_string(),
                trial_days: Some(14),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sub.product_id, "prod_basic");
        assert_eq!(sub.status, SubscriptionStatus::Trialing);

        let updated = processor
            .update_subscription_price(&sub.id, "price_pro_m", None)
            .await
            .unwrap();
        assert_eq!(updated.product_id, "prod_pro");
        assert_eq!(updated.id, sub.id);
    }

    #[tokio::test]
    async fn test_fake_processor_fail_next() {
        let processor = FakeProcessor::with_catalog(&test_catalog());
        processor.fail_next("card declined");
        let err = processor
            .create_customer(Uuid::new_v4(), "user@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Processor(m) if m == "card declined"));

        // The failure is one-shot.
        processor
            .create_customer(Uuid::new_v4(), "user@example.com")
            .await
            .unwrap();
    }
}
