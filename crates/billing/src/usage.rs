//! Usage metering
//!
//! Records consumption counters per tenant, per resource type, per
//! calendar-month period. Records are lazily created on first write and
//! snapshot the plan limit in effect at that moment; later plan changes
//! never rewrite a period's recorded limit. Increments are single-statement
//! atomic upserts, so concurrent writers on the same counter cannot lose
//! updates. The meter never clamps: overage is allowed and billed by the
//! invoice generator, and callers react to the returned [`LimitStatus`].

use atende_shared::{LimitStatus, Period, ResourceType, TenantId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanLimits;
use crate::error::{BillingError, BillingResult};

/// One (tenant, resource, period) usage counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub resource_type: ResourceType,
    pub period: Period,
    pub usage_count: i64,
    /// Plan limit snapshot taken when the record was opened
    pub limit_count: i64,
    /// Set when the period is rolled over; closed records are immutable
    pub is_closed: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UsageRecord {
    pub fn limit_status(&self) -> LimitStatus {
        LimitStatus::from_counts(self.usage_count, self.limit_count)
    }

    /// Units past the recorded limit, zero when within it
    pub fn overage(&self) -> i64 {
        if self.limit_count >= atende_shared::UNLIMITED {
            return 0;
        }
        (self.usage_count - self.limit_count).max(0)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for UsageRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let period: String = row.try_get("period")?;
        let period = period
            .parse::<Period>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "period".to_string(),
                source: e.into(),
            })?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            resource_type: row.try_get("resource_type")?,
            period,
            usage_count: row.try_get("usage_count")?,
            limit_count: row.try_get("limit_count")?,
            is_closed: row.try_get("is_closed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Per-period rollup across all resource types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub period: Period,
    pub records: Vec<UsageRecord>,
    /// Worst limit status across the period's resources
    pub status: LimitStatus,
}

impl UsageSummary {
    /// Build a summary from fetched records
    pub fn from_records(period: Period, records: Vec<UsageRecord>) -> Self {
        let status = records
            .iter()
            .map(UsageRecord::limit_status)
            .max_by_key(|s| match s {
                LimitStatus::Ok => 0,
                LimitStatus::Warning => 1,
                LimitStatus::Exceeded => 2,
            })
            .unwrap_or(LimitStatus::Ok);
        Self {
            period,
            records,
            status,
        }
    }
}

/// Usage metering service
#[derive(Clone)]
pub struct UsageMeter {
    pool: PgPool,
}

impl UsageMeter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record consumption and report where the counter stands.
    ///
    /// The increment is one atomic upsert; the meter does not deduplicate
    /// (idempotence is the caller's concern via its own dedup keys).
    /// Writing to a closed period is an error, as is a non-positive delta.
    pub async fn record_usage(
        &self,
        tenant_id: TenantId,
        resource: ResourceType,
        delta: i64,
        period: Period,
    ) -> BillingResult<LimitStatus> {
        if delta <= 0 {
            return Err(BillingError::InvalidUsageDelta(delta));
        }

        // Limit snapshot used only when this write opens the record
        let limit = self.current_plan_limit(tenant_id, resource).await?;

        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            INSERT INTO usage_records (
                id, tenant_id, resource_type, period,
                usage_count, limit_count, is_closed, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, false, NOW(), NOW())
            ON CONFLICT (tenant_id, resource_type, period)
            DO UPDATE SET
                usage_count = usage_records.usage_count + EXCLUDED.usage_count,
                updated_at = NOW()
            WHERE usage_records.is_closed = false
            RETURNING usage_count, limit_count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(resource)
        .bind(period.key())
        .bind(delta)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;

        let (usage_count, limit_count) = row.ok_or_else(|| {
            BillingError::InvalidTransition(format!(
                "usage period {} is closed for tenant {}",
                period, tenant_id
            ))
        })?;

        let status = LimitStatus::from_counts(usage_count, limit_count);
        if status == LimitStatus::Exceeded {
            tracing::warn!(
                tenant_id = %tenant_id,
                resource = %resource,
                period = %period,
                usage = usage_count,
                limit = limit_count,
                "Usage exceeded plan limit"
            );
        }
        Ok(status)
    }

    /// Pure read of one counter; `None` when nothing was recorded yet
    pub async fn get_usage(
        &self,
        tenant_id: TenantId,
        resource: ResourceType,
        period: Period,
    ) -> BillingResult<Option<UsageRecord>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM usage_records
            WHERE tenant_id = $1 AND resource_type = $2 AND period = $3
            "#,
        )
        .bind(tenant_id)
        .bind(resource)
        .bind(period.key())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Limit status for one counter without writing anything
    pub async fn check_limit(
        &self,
        tenant_id: TenantId,
        resource: ResourceType,
        period: Period,
    ) -> BillingResult<LimitStatus> {
        match self.get_usage(tenant_id, resource, period).await? {
            Some(record) => Ok(record.limit_status()),
            // Nothing recorded yet: check against the current plan limit
            None => {
                let limit = self.current_plan_limit(tenant_id, resource).await?;
                Ok(LimitStatus::from_counts(0, limit))
            }
        }
    }

    /// All counters for a tenant in one period
    pub async fn period_usage(
        &self,
        tenant_id: TenantId,
        period: Period,
    ) -> BillingResult<Vec<UsageRecord>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM usage_records
            WHERE tenant_id = $1 AND period = $2
            ORDER BY resource_type
            "#,
        )
        .bind(tenant_id)
        .bind(period.key())
        .fetch_all(&self.pool)
        .await?)
    }

    /// Rollup with the worst limit status across resources
    pub async fn usage_summary(
        &self,
        tenant_id: TenantId,
        period: Period,
    ) -> BillingResult<UsageSummary> {
        let records = self.period_usage(tenant_id, period).await?;
        Ok(UsageSummary::from_records(period, records))
    }

    /// Limit for the tenant's current plan (live subscription required)
    async fn current_plan_limit(
        &self,
        tenant_id: TenantId,
        resource: ResourceType,
    ) -> BillingResult<i64> {
        let limits = self.current_plan_limits(tenant_id).await?;
        Ok(limits.limit_for(resource))
    }

    /// Plan limits for the tenant's live subscription
    pub async fn current_plan_limits(&self, tenant_id: TenantId) -> BillingResult<PlanLimits> {
        let row: Option<(i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                p.max_whatsapp_instances, p.max_messages_month, p.max_users,
                p.max_ai_tokens_month, p.max_automations, p.max_storage_bytes
            FROM subscriptions s
            JOIN plans p ON p.id = s.plan_id
            WHERE s.tenant_id = $1
              AND s.status IN ('trial', 'active', 'past_due')
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let (instances, messages, users, ai_tokens, automations, storage) = row.ok_or_else(|| {
            BillingError::NotFound(format!("live subscription for tenant {}", tenant_id))
        })?;
        Ok(PlanLimits {
            max_whatsapp_instances: instances,
            max_messages_month: messages,
            max_users: users,
            max_ai_tokens_month: ai_tokens,
            max_automations: automations,
            max_storage_bytes: storage,
        })
    }

    /// Close every open counter for periods before `cutoff` (transactional).
    ///
    /// Called by the period rollover inside the subscription transaction;
    /// closed records are immutable from then on. Zero-padded period keys
    /// order lexicographically, so the comparison is a plain string one.
    pub async fn close_periods_before_tx(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        cutoff: Period,
    ) -> BillingResult<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE usage_records
            SET is_closed = true, updated_at = NOW()
            WHERE tenant_id = $1 AND period < $2 AND is_closed = false
            "#,
        )
        .bind(tenant_id)
        .bind(cutoff.key())
        .execute(conn)
        .await?
        .rows_affected();
        Ok(rows)
    }

    /// Open zero-seeded counters for every resource type (transactional).
    ///
    /// Seeds the limit snapshot from the plan in effect at rollover time.
    /// Existing rows (from an early lazy write) are left untouched.
    pub async fn open_period_tx(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        period: Period,
        limits: &PlanLimits,
    ) -> BillingResult<()> {
        for resource in ResourceType::all() {
            sqlx::query(
                r#"
                INSERT INTO usage_records (
                    id, tenant_id, resource_type, period,
                    usage_count, limit_count, is_closed, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, 0, $5, false, NOW(), NOW())
                ON CONFLICT (tenant_id, resource_type, period) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(resource)
            .bind(period.key())
            .bind(limits.limit_for(resource))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(resource: ResourceType, usage: i64, limit: i64) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            tenant_id: TenantId::new(),
            resource_type: resource,
            period: Period::containing(datetime!(2026-08-01 00:00 UTC)),
            usage_count: usage,
            limit_count: limit,
            is_closed: false,
            created_at: datetime!(2026-08-01 00:00 UTC),
            updated_at: datetime!(2026-08-01 00:00 UTC),
        }
    }

    #[test]
    fn test_record_limit_status() {
        assert_eq!(
            record(ResourceType::Messages, 100, 5_000).limit_status(),
            LimitStatus::Ok
        );
        assert_eq!(
            record(ResourceType::Messages, 4_000, 5_000).limit_status(),
            LimitStatus::Warning
        );
        assert_eq!(
            record(ResourceType::Messages, 5_000, 5_000).limit_status(),
            LimitStatus::Exceeded
        );
    }

    #[test]
    fn test_record_overage() {
        assert_eq!(record(ResourceType::Messages, 4_000, 5_000).overage(), 0);
        assert_eq!(record(ResourceType::Messages, 5_750, 5_000).overage(), 750);
        assert_eq!(
            record(ResourceType::Messages, 999, atende_shared::UNLIMITED).overage(),
            0
        );
    }

    #[test]
    fn test_summary_takes_worst_status() {
        let period = Period::containing(datetime!(2026-08-01 00:00 UTC));
        let summary = UsageSummary::from_records(
            period,
            vec![
                record(ResourceType::Messages, 100, 5_000),
                record(ResourceType::AiTokens, 48_000, 50_000),
                record(ResourceType::Users, 2, 5),
            ],
        );
        assert_eq!(summary.status, LimitStatus::Warning);

        let summary = UsageSummary::from_records(
            period,
            vec![
                record(ResourceType::Messages, 6_000, 5_000),
                record(ResourceType::Users, 2, 5),
            ],
        );
        assert_eq!(summary.status, LimitStatus::Exceeded);
    }

    #[test]
    fn test_summary_of_nothing_is_ok() {
        let period = Period::containing(datetime!(2026-08-01 00:00 UTC));
        let summary = UsageSummary::from_records(period, vec![]);
        assert_eq!(summary.status, LimitStatus::Ok);
    }
}
