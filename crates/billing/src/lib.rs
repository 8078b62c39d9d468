// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some subscription operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PaidUp Billing Module
//!
//! Synchronizes local subscription state with the Stripe payment processor.
//!
//! ## Features
//!
//! - **Subscribe**: create the processor customer + subscription and the
//!   local billing state record (trial plans need no card up front)
//! - **Plan Swaps**: move an existing subscription to another plan or
//!   product, keeping the subscription id
//! - **Payment Methods**: attach a card and track its display fields
//! - **Catalog**: local plan ids resolved to processor price/product ids
//! - **Optimistic Locking**: per-user compare-and-swap commits, so racing
//!   requests cannot interleave
//! - **Invariants**: runnable consistency checks over billing state
//!
//! The processor is the source of truth: local state is committed only after
//! the processor confirms a change, and is left untouched when it does not.

pub mod catalog;
pub mod client;
pub mod error;
pub mod invariants;
pub mod processor;
pub mod store;
pub mod subscriptions;
pub mod testing;


// Catalog
pub use catalog::{Plan, PlanCatalog, Product};

// Client
pub use client::{StripeClient, StripeConfig, StripeProcessor};

// Error
pub use error::{BillingError, BillingResult};

// Processor
pub use processor::{CreateSubscriptionRequest, ProcessorClient, ProcessorSubscription};

// Store
pub use store::{BillingState, BillingStateStore, CardDetails, PgBillingStore};

// Subscriptions
pub use subscriptions::{NewPaymentMethod, SubscriptionService};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let catalog = PlanCatalog::from_env()?;
        Ok(Self::new(stripe, catalog, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(stripe: StripeClient, catalog: PlanCatalog, pool: PgPool) -> Self {
        let processor = Arc::new(StripeProcessor::new(stripe));
        let store = Arc::new(PgBillingStore::new(pool.clone()));

        Self {
            subscriptions: SubscriptionService::new(store, processor, catalog.clone()),
            invariants: InvariantChecker::new(pool, catalog),
        }
    }
}
