//! Billing invariants.
//!
//! Runnable consistency checks over the billing state table. These can be
//! run after any mutation (or on a schedule) to verify the local records
//! still agree with the plan catalog and with what the processor should be
//! billing.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real query against live data
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::BillingResult;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// User(s) affected.
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    /// Severity level.
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - the processor may be charging for the wrong plan.
    Critical,
    /// High - data inconsistency that needs attention.
    High,
    /// Medium - potential issue, should investigate.
    Medium,
    /// Low - minor inconsistency, informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of a full invariant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run.
    pub checked_at: OffsetDateTime,
    /// Total number of checks run.
    pub checks_run: usize,
    /// Number of checks that passed.
    pub checks_passed: usize,
    /// Number of checks that failed.
    pub checks_failed: usize,
    /// List of all violations found.
    pub violations: Vec<InvariantViolation>,
    /// Overall health status.
    pub healthy: bool,
}

/// Row type for plan/price checks.
#[derive(Debug, sqlx::FromRow)]
struct PlanPriceRow {
    user_id: Uuid,
    plan_id: String,
    stripe_price_id: String,
}

/// Row type for missing processor id violations.
#[derive(Debug, sqlx::FromRow)]
struct MissingIdsRow {
    user_id: Uuid,
    stripe_customer_id: String,
    stripe_subscription_id: String,
}

/// Row type for missing card violations.
#[derive(Debug, sqlx::FromRow)]
struct NoCardRow {
    user_id: Uuid,
    plan_id: String,
}

/// Service for running billing invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
    catalog: PlanCatalog,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, catalog: PlanCatalog) -> Self {
        Self { pool, catalog }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_price_matches_plan().await?);
        violations.extend(self.check_plan_known().await?);
        violations.extend(self.check_subscription_ids_present().await?);
        violations.extend(self.check_card_on_file_for_card_plans().await?);

        let checks_run = 4;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: stored price id matches the catalog price for the plan.
    ///
    /// If these disagree, the user sees one plan while the processor charges
    /// another.
    async fn check_price_matches_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanPriceRow> = sqlx::query_as(
            r#"
            SELECT user_id, plan_id, stripe_price_id
            FROM billing_states
            WHERE status IN ('active', 'trialing', 'past_due')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let expected = self.catalog.resolve_price_id(&row.plan_id).ok()?;
                if expected == row.stripe_price_id {
                    return None;
                }
                Some(InvariantViolation {
                    invariant: "price_matches_plan".to_string(),
                    user_ids: vec![row.user_id],
                    description: format!(
                        "Plan '{}' should bill price '{}' but billing state has '{}'",
                        row.plan_id, expected, row.stripe_price_id
                    ),
                    context: serde_json::json!({
                        "plan_id": row.plan_id,
                        "expected_price_id": expected,
                        "stored_price_id": row.stripe_price_id,
                    }),
                    severity: ViolationSeverity::Critical,
                })
            })
            .collect())
    }

    /// Invariant 2: every stored plan id exists in the catalog.
    async fn check_plan_known(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanPriceRow> = sqlx::query_as(
            "SELECT user_id, plan_id, stripe_price_id FROM billing_states",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| !self.catalog.contains(&row.plan_id))
            .map(|row| InvariantViolation {
                invariant: "plan_known".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Billing state references unknown plan '{}'", row.plan_id),
                context: serde_json::json!({
                    "plan_id": row.plan_id,
                    "stored_price_id": row.stripe_price_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: active states carry processor customer/subscription ids.
    async fn check_subscription_ids_present(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingIdsRow> = sqlx::query_as(
            r#"
            SELECT user_id, stripe_customer_id, stripe_subscription_id
            FROM billing_states
            WHERE stripe_customer_id = '' OR stripe_subscription_id = ''
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_ids_present".to_string(),
                user_ids: vec![row.user_id],
                description: "Billing state is missing processor ids".to_string(),
                context: serde_json::json!({
                    "stripe_customer_id": row.stripe_customer_id,
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: plans that require a payment method have a card on file.
    ///
    /// Trial plans may run without a card; anything else without one will
    /// fail at the next renewal.
    async fn check_card_on_file_for_card_plans(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NoCardRow> = sqlx::query_as(
            r#"
            SELECT user_id, plan_id
            FROM billing_states
            WHERE card_brand IS NULL
              AND status IN ('active', 'trialing', 'past_due')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| {
                self.catalog
                    .plan_requires_payment_method(&row.plan_id)
                    .unwrap_or(false)
            })
            .map(|row| InvariantViolation {
                invariant: "card_on_file_for_card_plans".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Plan '{}' requires a payment method but no card is on file",
                    row.plan_id
                ),
                context: serde_json::json!({
                    "plan_id": row.plan_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "price_matches_plan" => self.check_price_matches_plan().await,
            "plan_known" => self.check_plan_known().await,
            "subscription_ids_present" => self.check_subscription_ids_present().await,
            "card_on_file_for_card_plans" => self.check_card_on_file_for_card_plans().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "price_matches_plan",
            "plan_known",
            "subscription_ids_present",
            "card_on_file_for_card_plans",
        ]
    }
}
