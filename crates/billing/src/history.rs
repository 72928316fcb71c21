//! Plan change history
//!
//! Write-once audit record of every subscription mutation: the system of
//! record for proration decisions. Each completed row settles exactly one
//! way: an invoice adjustment (`prorated_amount_cents > 0`) or a ledger
//! credit (`credits_generated_cents > 0`), never both.

use atende_shared::{PlanId, TenantId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Kind of subscription mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Upgrade,
    Downgrade,
    Cancellation,
    Reactivation,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::Cancellation => "cancellation",
            Self::Reactivation => "reactivation",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the recorded change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Completed,
    Failed,
}

/// One plan change audit row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanChangeRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub change_type: ChangeType,
    pub from_plan_id: Option<PlanId>,
    pub to_plan_id: Option<PlanId>,
    /// Centavos invoiced for the change (0 when the change credited)
    pub prorated_amount_cents: i64,
    /// Centavos credited to the ledger (0 when the change invoiced)
    pub credits_generated_cents: i64,
    pub status: ChangeStatus,
    pub created_at: OffsetDateTime,
}

/// Input for one history row
#[derive(Debug, Clone)]
pub struct PlanChangeDraft {
    pub tenant_id: TenantId,
    pub change_type: ChangeType,
    pub from_plan_id: Option<PlanId>,
    pub to_plan_id: Option<PlanId>,
    pub prorated_amount_cents: i64,
    pub credits_generated_cents: i64,
    pub status: ChangeStatus,
}

/// Plan change history service
#[derive(Clone)]
pub struct PlanChangeHistoryService {
    pool: PgPool,
}

impl PlanChangeHistoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one row inside the mutation's transaction.
    ///
    /// Rows are write-once; there is no update path.
    pub async fn record_tx(
        conn: &mut PgConnection,
        draft: PlanChangeDraft,
    ) -> BillingResult<PlanChangeRecord> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO plan_change_history (
                id, tenant_id, change_type, from_plan_id, to_plan_id,
                prorated_amount_cents, credits_generated_cents, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.tenant_id)
        .bind(draft.change_type)
        .bind(draft.from_plan_id)
        .bind(draft.to_plan_id)
        .bind(draft.prorated_amount_cents)
        .bind(draft.credits_generated_cents)
        .bind(draft.status)
        .fetch_one(conn)
        .await?)
    }

    /// Full change history for a tenant, newest first
    pub async fn list(&self, tenant_id: TenantId) -> BillingResult<Vec<PlanChangeRecord>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM plan_change_history
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Most recent change for a tenant, if any
    pub async fn latest(&self, tenant_id: TenantId) -> BillingResult<Option<PlanChangeRecord>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM plan_change_history
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_strings() {
        assert_eq!(ChangeType::Upgrade.as_str(), "upgrade");
        assert_eq!(ChangeType::Cancellation.as_str(), "cancellation");
        assert_eq!(ChangeType::Reactivation.to_string(), "reactivation");
    }
}
