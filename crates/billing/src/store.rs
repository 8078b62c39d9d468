//! Billing state persistence.
//!
//! One record per user holding the processor-assigned ids, the user's
//! current local plan, and card display fields. Commits are guarded by an
//! optimistic-lock version so concurrent mutations for the same user cannot
//! interleave: the `UPDATE` carries the previously observed version in its
//! `WHERE` clause, and zero affected rows means another request committed
//! first.

use async_trait::async_trait;
use paidup_shared::SubscriptionStatus;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Card display fields. Never a full card number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDetails {
    /// Card brand (e.g., "Visa", "MasterCard").
    pub brand: String,
    /// Last four digits.
    pub last4: String,
    /// Expiration month (1-12).
    pub exp_month: i16,
    /// Expiration year (e.g., 2027).
    pub exp_year: i16,
}

/// Per-user billing state.
///
/// Created on first successful subscribe, mutated on every card update or
/// plan swap, never deleted in this scope. Invariant: while the subscription
/// is active, `stripe_price_id` equals the catalog price for `plan_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingState {
    /// Processor customer id.
    pub stripe_customer_id: String,
    /// Processor subscription id.
    pub stripe_subscription_id: String,
    /// Processor price id currently billed.
    pub stripe_price_id: String,
    /// Local plan identifier.
    pub plan_id: String,
    /// Last known subscription status.
    pub status: SubscriptionStatus,
    /// Card display fields, if a payment method is on file.
    pub card: Option<CardDetails>,
    /// Optimistic-lock version, bumped on every commit.
    pub version: i64,
    /// Last commit time.
    pub updated_at: OffsetDateTime,
}

/// Storage for per-user billing state.
///
/// `commit` must be an atomic compare-and-swap keyed by user id; a commit
/// whose observed prior version no longer matches is rejected with
/// [`BillingError::ConcurrentModification`], never partially applied.
#[async_trait]
pub trait BillingStateStore: Send + Sync {
    /// Fetch the billing state for a user.
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<BillingState>>;

    /// Create the billing state for a user on first subscribe.
    ///
    /// Fails with [`BillingError::AlreadySubscribed`] if a record exists.
    async fn insert(&self, user_id: Uuid, state: &BillingState) -> BillingResult<BillingState>;

    /// Replace the billing state iff the stored version equals
    /// `expected_version`. Returns the stored record with its new version.
    async fn commit(
        &self,
        user_id: Uuid,
        state: &BillingState,
        expected_version: i64,
    ) -> BillingResult<BillingState>;
}

#[derive(Debug, sqlx::FromRow)]
struct BillingStateRow {
    stripe_customer_id: String,
    stripe_subscription_id: String,
    stripe_price_id: String,
    plan_id: String,
    status: String,
    card_brand: Option<String>,
    card_last4: Option<String>,
    card_exp_month: Option<i16>,
    card_exp_year: Option<i16>,
    version: i64,
    updated_at: OffsetDateTime,
}

impl From<BillingStateRow> for BillingState {
    fn from(row: BillingStateRow) -> Self {
        let card = match (row.card_brand, row.card_last4, row.card_exp_month, row.card_exp_year) {
            (Some(brand), Some(last4), Some(exp_month), Some(exp_year)) => Some(CardDetails {
                brand,
                last4,
                exp_month,
                exp_year,
            }),
            _ => None,
        };
        BillingState {
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_price_id: row.stripe_price_id,
            plan_id: row.plan_id,
            status: SubscriptionStatus::from_processor(&row.status),
            card,
            version: row.version,
            updated_at: row.updated_at,
        }
    }
}

/// PostgreSQL-backed billing state store.
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStateStore for PgBillingStore {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<BillingState>> {
        let row: Option<BillingStateRow> = sqlx::query_as(
            r#"
            SELECT stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   plan_id, status, card_brand, card_last4, card_exp_month,
                   card_exp_year, version, updated_at
            FROM billing_states
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BillingState::from))
    }

    async fn insert(&self, user_id: Uuid, state: &BillingState) -> BillingResult<BillingState> {
        let row: Option<BillingStateRow> = sqlx::query_as(
            r#"
            INSERT INTO billing_states
                (user_id, stripe_customer_id, stripe_subscription_id,
                 stripe_price_id, plan_id, status, card_brand, card_last4,
                 card_exp_month, card_exp_year)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING stripe_customer_id, stripe_subscription_id,
                      stripe_price_id, plan_id, status, card_brand,
                      card_last4, card_exp_month, card_exp_year, version,
                      updated_at
            "#,
        )
        .bind(user_id)
        .bind(&state.stripe_customer_id)
        .bind(&state.stripe_subscription_id)
        .bind(&state.stripe_price_id)
        .bind(&state.plan_id)
        .bind(state.status.as_str())
        .bind(state.card.as_ref().map(|c| c.brand.clone()))
        .bind(state.card.as_ref().map(|c| c.last4.clone()))
        .bind(state.card.as_ref().map(|c| c.exp_month))
        .bind(state.card.as_ref().map(|c| c.exp_year))
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingState::from)
            .ok_or(BillingError::AlreadySubscribed(user_id))
    }

    async fn commit(
        &self,
        user_id: Uuid,
        state: &BillingState,
        expected_version: i64,
    ) -> BillingResult<BillingState> {
        let row: Option<BillingStateRow> = sqlx::query_as(
            r#"
            UPDATE billing_states SET
                stripe_customer_id = $1,
                stripe_subscription_id = $2,
                stripe_price_id = $3,
                plan_id = $4,
                status = $5,
                card_brand = $6,
                card_last4 = $7,
                card_exp_month = $8,
                card_exp_year = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE user_id = $10 AND version = $11
            RETURNING stripe_customer_id, stripe_subscription_id,
                      stripe_price_id, plan_id, status, card_brand,
                      card_last4, card_exp_month, card_exp_year, version,
                      updated_at
            "#,
        )
        .bind(&state.stripe_customer_id)
        .bind(&state.stripe_subscription_id)
        .bind(&state.stripe_price_id)
        .bind(&state.plan_id)
        .bind(state.status.as_str())
        .bind(state.card.as_ref().map(|c| c.brand.clone()))
        .bind(state.card.as_ref().map(|c| c.last4.clone()))
        .bind(state.card.as_ref().map(|c| c.exp_month))
        .bind(state.card.as_ref().map(|c| c.exp_year))
        .bind(user_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingState::from).ok_or_else(|| {
            BillingError::ConcurrentModification(format!(
                "billing state for user {} was modified by another request",
                user_id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_state_with_card() {
        let row = BillingStateRow {
            stripe_customer_id: "cus_1".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            stripe_price_id: "price_basic_m".to_string(),
            plan_id: "basic-monthly".to_string(),
            status: "trialing".to_string(),
            card_brand: Some("Visa".to_string()),
            card_last4: Some("4242".to_string()),
            card_exp_month: Some(6),
            card_exp_year: Some(2027),
            version: 3,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };
        let state = BillingState::from(row);
        assert_eq!(state.status, SubscriptionStatus::Trialing);
        let card = state.card.unwrap();
        assert_eq!(card.last4, "4242");
        assert_eq!(state.version, 3);
    }

    #[test]
    fn test_row_to_state_partial_card_is_none() {
        let row = BillingStateRow {
            stripe_customer_id: "cus_1".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            stripe_price_id: "price_basic_m".to_string(),
            plan_id: "basic-monthly".to_string(),
            status: "active".to_string(),
            card_brand: Some("Visa".to_string()),
            card_last4: None,
            card_exp_month: None,
            card_exp_year: None,
            version: 1,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(BillingState::from(row).card.is_none());
    }
}
