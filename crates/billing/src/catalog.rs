//! Plan and product catalog.
//!
//! Read-only mapping from local plan identifiers to the processor-side price
//! and product identifiers. Built once at startup (from code or environment)
//! and never mutated at request time.

use std::collections::HashMap;

use paidup_shared::BillingInterval;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};

/// A billable offering grouping one or more plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    /// Local product identifier (e.g., "basic", "pro").
    pub id: String,
    /// Display name.
    pub name: String,
    /// Processor-side product identifier.
    pub stripe_product_id: String,
}

/// A purchasable price/cadence tier belonging to a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    /// Local plan identifier (e.g., "basic-monthly").
    pub id: String,
    /// Local product this plan belongs to.
    pub product_id: String,
    /// Processor-side price identifier.
    pub stripe_price_id: String,
    /// Billing cadence.
    pub interval: BillingInterval,
    /// Trial period in days; 0 means no trial.
    pub trial_days: u32,
    /// Display name.
    pub display_name: String,
}

impl Plan {
    /// Whether subscribing to this plan needs a payment method up front.
    ///
    /// Plans with a trial can start without a card; the card is collected
    /// before the trial ends.
    #[must_use]
    pub fn requires_payment_method(&self) -> bool {
        self.trial_days == 0
    }
}

/// Immutable plan/product catalog.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    products: HashMap<String, Product>,
    plans: HashMap<String, Plan>,
}

impl PlanCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a product.
    pub fn add_product(&mut self, product: Product) {
        self.products.insert(product.id.clone(), product);
    }

    /// Register a plan. The plan's product must already be registered.
    pub fn add_plan(&mut self, plan: Plan) -> BillingResult<()> {
        if !self.products.contains_key(&plan.product_id) {
            return Err(BillingError::Config(format!(
                "Plan '{}' references unknown product '{}'",
                plan.id, plan.product_id
            )));
        }
        self.plans.insert(plan.id.clone(), plan);
        Ok(())
    }

    /// Resolve a local plan id to the processor-side price id.
    pub fn resolve_price_id(&self, plan_id: &str) -> BillingResult<&str> {
        self.plans
            .get(plan_id)
            .map(|p| p.stripe_price_id.as_str())
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))
    }

    /// Get a plan by local id.
    #[must_use]
    pub fn get(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.get(plan_id)
    }

    /// Check if a plan exists.
    #[must_use]
    pub fn contains(&self, plan_id: &str) -> bool {
        self.plans.contains_key(plan_id)
    }

    /// All local plan ids.
    #[must_use]
    pub fn plan_ids(&self) -> Vec<&str> {
        self.plans.keys().map(|s| s.as_str()).collect()
    }

    /// Iterate over all plans.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Plan)> {
        self.plans.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Reverse lookup by processor price id.
    #[must_use]
    pub fn find_by_price(&self, stripe_price_id: &str) -> Option<&Plan> {
        self.plans
            .values()
            .find(|p| p.stripe_price_id == stripe_price_id)
    }

    /// Product a plan belongs to.
    pub fn product_for_plan(&self, plan_id: &str) -> BillingResult<&Product> {
        let plan = self
            .plans
            .get(plan_id)
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))?;
        self.products.get(&plan.product_id).ok_or_else(|| {
            BillingError::Internal(format!(
                "Plan '{}' references missing product '{}'",
                plan_id, plan.product_id
            ))
        })
    }

    /// Whether subscribing to the plan needs a payment method up front.
    pub fn plan_requires_payment_method(&self, plan_id: &str) -> BillingResult<bool> {
        self.plans
            .get(plan_id)
            .map(Plan::requires_payment_method)
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))
    }

    /// Build the standard basic/pro catalog from environment variables.
    ///
    /// Expects `STRIPE_PRODUCT_BASIC`, `STRIPE_PRODUCT_PRO`,
    /// `STRIPE_PRICE_BASIC_MONTHLY`, `STRIPE_PRICE_BASIC_ANNUAL`,
    /// `STRIPE_PRICE_PRO_MONTHLY`, `STRIPE_PRICE_PRO_ANNUAL`.
    /// `BILLING_TRIAL_DAYS` (default 14) sets the trial on monthly basic.
    pub fn from_env() -> BillingResult<Self> {
        fn env(name: &str) -> BillingResult<String> {
            std::env::var(name)
                .map_err(|_| BillingError::Config(format!("{} not set", name)))
        }

        let trial_days = std::env::var("BILLING_TRIAL_DAYS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(14);

        let mut catalog = Self::new();
        catalog.add_product(Product {
            id: "basic".to_string(),
            name: "Basic".to_string(),
            stripe_product_id: env("STRIPE_PRODUCT_BASIC")?,
        });
        catalog.add_product(Product {
            id: "pro".to_string(),
            name: "Pro".to_string(),
            stripe_product_id: env("STRIPE_PRODUCT_PRO")?,
        });

        catalog.add_plan(Plan {
            id: "basic-monthly".to_string(),
            product_id: "basic".to_string(),
            stripe_price_id: env("STRIPE_PRICE_BASIC_MONTHLY")?,
            interval: BillingInterval::Monthly,
            trial_days,
            display_name: "Basic (monthly)".to_string(),
        })?;
        catalog.add_plan(Plan {
            id: "basic-annual".to_string(),
            product_id: "basic".to_string(),
            stripe_price_id: env("STRIPE_PRICE_BASIC_ANNUAL")?,
            interval: BillingInterval::Annual,
            trial_days: 0,
            display_name: "Basic (annual)".to_string(),
        })?;
        catalog.add_plan(Plan {
            id: "pro-monthly".to_string(),
            product_id: "pro".to_string(),
            stripe_price_id: env("STRIPE_PRICE_PRO_MONTHLY")?,
            interval: BillingInterval::Monthly,
            trial_days: 0,
            display_name: "Pro (monthly)".to_string(),
        })?;
        catalog.add_plan(Plan {
            id: "pro-annual".to_string(),
            product_id: "pro".to_string(),
            stripe_price_id: env("STRIPE_PRICE_PRO_ANNUAL")?,
            interval: BillingInterval::Annual,
            trial_days: 0,
            display_name: "Pro (annual)".to_string(),
        })?;

        Ok(catalog)
    }
}
