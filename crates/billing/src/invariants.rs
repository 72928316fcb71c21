//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing system. These
//! invariants can be run after any mutation or sweep to ensure the system
//! is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use atende_shared::TenantId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected
    pub tenant_ids: Vec<TenantId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money may be moving incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
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

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple live subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    tenant_id: TenantId,
    sub_count: i64,
}

/// Row type for negative ledger balance violation
#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    tenant_id: TenantId,
    balance_cents: i64,
}

/// Row type for double-settled plan change violation
#[derive(Debug, sqlx::FromRow)]
struct DoubleSettledChangeRow {
    id: Uuid,
    tenant_id: TenantId,
    prorated_amount_cents: i64,
    credits_generated_cents: i64,
}

/// Row type for over-redeemed coupon violation
#[derive(Debug, sqlx::FromRow)]
struct OverRedeemedCouponRow {
    code: String,
    max_uses: i64,
    used_count: i64,
}

/// Row type for cancelled-without-timestamp violation
#[derive(Debug, sqlx::FromRow)]
struct CancelledNoTimestampRow {
    sub_id: Uuid,
    tenant_id: TenantId,
}

/// Row type for invoice item sum mismatch violation
#[derive(Debug, sqlx::FromRow)]
struct InvoiceItemMismatchRow {
    invoice_id: Uuid,
    tenant_id: TenantId,
    invoice_number: String,
    subtotal_cents: i64,
    items_total_cents: i64,
}

/// Row type for invoice total arithmetic violation
#[derive(Debug, sqlx::FromRow)]
struct InvoiceTotalMismatchRow {
    invoice_id: Uuid,
    tenant_id: TenantId,
    invoice_number: String,
    subtotal_cents: i64,
    discount_cents: i64,
    credit_applied_cents: i64,
    total_cents: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
    clock: Clock,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, clock: Clock) -> Self {
        Self { pool, clock }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_single_live_subscription().await?);
        violations.extend(self.check_ledger_balance_non_negative(now).await?);
        violations.extend(self.check_plan_change_settles_one_way().await?);
        violations.extend(self.check_coupon_uses_within_limit().await?);
        violations.extend(self.check_cancelled_has_timestamp().await?);
        violations.extend(self.check_invoice_items_sum().await?);
        violations.extend(self.check_invoice_total_arithmetic().await?);

        let checks_run = 7;
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

    /// Invariant 1: At most 1 live subscription per tenant
    ///
    /// Multiple live subscriptions would cause double-billing and
    /// entitlement confusion.
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('trial', 'active', 'past_due')
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} live subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Credit ledger balance is never negative
    ///
    /// Consumption entries are only appended when sufficient balance
    /// exists; a negative sum means that guard was bypassed.
    async fn check_ledger_balance_non_negative(
        &self,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, SUM(amount_cents)::BIGINT as balance_cents
            FROM credit_ledger
            WHERE expires_at IS NULL OR expires_at > $1
            GROUP BY tenant_id
            HAVING SUM(amount_cents) < 0
            "#,
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_balance_non_negative".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant credit balance is negative ({} cents)",
                    row.balance_cents
                ),
                context: serde_json::json!({
                    "balance_cents": row.balance_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Completed plan changes settle exactly one way
    ///
    /// A completed change carries either an invoice adjustment or a ledger
    /// credit, never both.
    async fn check_plan_change_settles_one_way(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DoubleSettledChangeRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, prorated_amount_cents, credits_generated_cents
            FROM plan_change_history
            WHERE status = 'completed'
              AND prorated_amount_cents > 0
              AND credits_generated_cents > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "plan_change_settles_one_way".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Plan change {} both invoiced {} cents and credited {} cents",
                    row.id, row.prorated_amount_cents, row.credits_generated_cents
                ),
                context: serde_json::json!({
                    "change_id": row.id,
                    "prorated_amount_cents": row.prorated_amount_cents,
                    "credits_generated_cents": row.credits_generated_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Coupon used_count never exceeds max_uses
    ///
    /// An over-redeemed coupon means the conditional increment was
    /// bypassed somewhere.
    async fn check_coupon_uses_within_limit(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverRedeemedCouponRow> = sqlx::query_as(
            r#"
            SELECT code, max_uses, used_count
            FROM coupons
            WHERE max_uses > 0 AND used_count > max_uses
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "coupon_uses_within_limit".to_string(),
                tenant_ids: vec![],
                description: format!(
                    "Coupon '{}' redeemed {} times with max_uses {}",
                    row.code, row.used_count, row.max_uses
                ),
                context: serde_json::json!({
                    "code": row.code,
                    "max_uses": row.max_uses,
                    "used_count": row.used_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Cancelled subscriptions carry cancelled_at
    ///
    /// Without the timestamp we cannot tell when access was revoked.
    async fn check_cancelled_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelledNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, tenant_id
            FROM subscriptions
            WHERE status = 'cancelled' AND cancelled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_has_timestamp".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Cancelled subscription has no cancelled_at date".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Invoice subtotal equals the sum of its items
    async fn check_invoice_items_sum(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvoiceItemMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                i.id as invoice_id,
                i.tenant_id,
                i.invoice_number,
                i.subtotal_cents,
                COALESCE(SUM(it.total_cents), 0)::BIGINT as items_total_cents
            FROM invoices i
            LEFT JOIN invoice_items it ON it.invoice_id = i.id
            GROUP BY i.id, i.tenant_id, i.invoice_number, i.subtotal_cents
            HAVING i.subtotal_cents != COALESCE(SUM(it.total_cents), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_items_sum".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Invoice '{}' subtotal {} does not match item sum {}",
                    row.invoice_number, row.subtotal_cents, row.items_total_cents
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "subtotal_cents": row.subtotal_cents,
                    "items_total_cents": row.items_total_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 7: Invoice total arithmetic holds
    ///
    /// total = subtotal - discount - credit, and never negative.
    async fn check_invoice_total_arithmetic(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvoiceTotalMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                id as invoice_id,
                tenant_id,
                invoice_number,
                subtotal_cents,
                discount_cents,
                credit_applied_cents,
                total_cents
            FROM invoices
            WHERE total_cents != subtotal_cents - discount_cents - credit_applied_cents
               OR total_cents < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_total_arithmetic".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Invoice '{}' total {} != subtotal {} - discount {} - credit {}",
                    row.invoice_number,
                    row.total_cents,
                    row.subtotal_cents,
                    row.discount_cents,
                    row.credit_applied_cents
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "subtotal_cents": row.subtotal_cents,
                    "discount_cents": row.discount_cents,
                    "credit_applied_cents": row.credit_applied_cents,
                    "total_cents": row.total_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_live_subscription" => self.check_single_live_subscription().await,
            "ledger_balance_non_negative" => {
                self.check_ledger_balance_non_negative(self.clock.now())
                    .await
            }
            "plan_change_settles_one_way" => self.check_plan_change_settles_one_way().await,
            "coupon_uses_within_limit" => self.check_coupon_uses_within_limit().await,
            "cancelled_has_timestamp" => self.check_cancelled_has_timestamp().await,
            "invoice_items_sum" => self.check_invoice_items_sum().await,
            "invoice_total_arithmetic" => self.check_invoice_total_arithmetic().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_live_subscription",
            "ledger_balance_non_negative",
            "plan_change_settles_one_way",
            "coupon_uses_within_limit",
            "cancelled_has_timestamp",
            "invoice_items_sum",
            "invoice_total_arithmetic",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"single_live_subscription"));
        assert!(checks.contains(&"plan_change_settles_one_way"));
    }
}
