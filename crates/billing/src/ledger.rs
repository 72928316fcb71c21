//! Credit ledger
//!
//! Append-only account of non-cash balance a tenant can apply to future
//! invoices. Entries are never updated or deleted; corrections are new
//! offsetting entries. Consumption is guarded so the balance is never
//! driven negative, and it is attributed against open grants
//! FIFO-by-expiry for reporting (the balance itself is a plain sum of
//! non-expired entries).

use atende_shared::TenantId;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};

/// Why a ledger entry exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    DowngradeRefund,
    CancellationRefund,
    ManualAdjustment,
    AppliedToInvoice,
    Promotional,
}

impl CreditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DowngradeRefund => "downgrade_refund",
            Self::CancellationRefund => "cancellation_refund",
            Self::ManualAdjustment => "manual_adjustment",
            Self::AppliedToInvoice => "applied_to_invoice",
            Self::Promotional => "promotional",
        }
    }
}

impl std::fmt::Display for CreditReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One append-only ledger entry (positive = grant, negative = consumption)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditLedgerEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub amount_cents: i64,
    pub reason: CreditReason,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl CreditLedgerEntry {
    /// Whether the entry counts toward the balance at `as_of`
    pub fn counts_at(&self, as_of: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(expiry) => expiry > as_of,
            None => true,
        }
    }
}

/// Balance as the plain sum of non-expired entries
pub fn balance_of(entries: &[CreditLedgerEntry], as_of: OffsetDateTime) -> i64 {
    entries
        .iter()
        .filter(|e| e.counts_at(as_of))
        .map(|e| e.amount_cents)
        .sum()
}

/// An open grant with value still unconsumed, for FIFO attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenGrant {
    pub entry_id: Uuid,
    pub remaining_cents: i64,
    pub expires_at: Option<OffsetDateTime>,
}

/// Attribute a consumption across open grants, closest-to-expiry first.
///
/// Grants without expiry come last, ordered as given (insertion order).
/// Returns `(entry_id, consumed_cents)` pairs; the caller has already
/// verified the total balance covers `amount_cents`, so any shortfall here
/// only shortens the attribution list, never the consumption itself.
pub fn allocate_fifo_by_expiry(grants: &[OpenGrant], amount_cents: i64) -> Vec<(Uuid, i64)> {
    let mut ordered: Vec<&OpenGrant> = grants.iter().filter(|g| g.remaining_cents > 0).collect();
    // (is_none, expiry) puts expiring grants first, soonest expiry leading
    ordered.sort_by_key(|g| (g.expires_at.is_none(), g.expires_at));

    let mut allocations = Vec::new();
    let mut outstanding = amount_cents;
    for grant in ordered {
        if outstanding <= 0 {
            break;
        }
        let take = grant.remaining_cents.min(outstanding);
        allocations.push((grant.entry_id, take));
        outstanding -= take;
    }
    allocations
}

/// Credit ledger service
#[derive(Clone)]
pub struct CreditLedgerService {
    pool: PgPool,
    clock: Clock,
    event_logger: BillingEventLogger,
}

impl CreditLedgerService {
    pub fn new(pool: PgPool, clock: Clock) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            clock,
            event_logger,
        }
    }

    /// Append a positive entry
    pub async fn grant(
        &self,
        tenant_id: TenantId,
        amount_cents: i64,
        reason: CreditReason,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<CreditLedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let entry = Self::grant_tx(&mut *tx, tenant_id, amount_cents, reason, expires_at).await?;
        tx.commit().await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::CreditGranted).data(
                    serde_json::json!({
                        "entry_id": entry.id,
                        "amount_cents": amount_cents,
                        "reason": reason.as_str(),
                    }),
                ),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log credit grant event");
        }
        Ok(entry)
    }

    /// Append a positive entry inside an existing transaction
    pub async fn grant_tx(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        amount_cents: i64,
        reason: CreditReason,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<CreditLedgerEntry> {
        if amount_cents <= 0 {
            return Err(BillingError::InvalidAmount {
                amount: amount_cents,
                context: "credit grant",
            });
        }
        let entry: CreditLedgerEntry = sqlx::query_as(
            r#"
            INSERT INTO credit_ledger (id, tenant_id, amount_cents, reason, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id, tenant_id, amount_cents, reason, expires_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(amount_cents)
        .bind(reason)
        .bind(expires_at)
        .fetch_one(conn)
        .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            amount_cents = amount_cents,
            reason = %reason,
            "Credit granted"
        );
        Ok(entry)
    }

    /// Append a negative entry, failing with `InsufficientCredit` when the
    /// non-expired balance does not cover the amount.
    pub async fn consume(
        &self,
        tenant_id: TenantId,
        amount_cents: i64,
        reason: CreditReason,
    ) -> BillingResult<CreditLedgerEntry> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let entry = Self::consume_tx(&mut *tx, tenant_id, amount_cents, reason, now).await?;
        tx.commit().await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::CreditConsumed).data(
                    serde_json::json!({
                        "entry_id": entry.id,
                        "amount_cents": amount_cents,
                        "reason": reason.as_str(),
                    }),
                ),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log credit consumption event");
        }
        Ok(entry)
    }

    /// Consumption inside an existing transaction.
    ///
    /// Locks the tenant's entries (`FOR UPDATE`) so concurrent consumers
    /// serialize, checks the balance, appends the negative entry, and
    /// records the FIFO-by-expiry attribution rows.
    pub async fn consume_tx(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        amount_cents: i64,
        reason: CreditReason,
        now: OffsetDateTime,
    ) -> BillingResult<CreditLedgerEntry> {
        if amount_cents <= 0 {
            return Err(BillingError::InvalidAmount {
                amount: amount_cents,
                context: "credit consumption",
            });
        }

        // Serialize per tenant: lock all existing entries for the tenant
        let entries: Vec<CreditLedgerEntry> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, amount_cents, reason, expires_at, created_at
            FROM credit_ledger
            WHERE tenant_id = $1
            ORDER BY created_at
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *conn)
        .await?;

        let available = balance_of(&entries, now);
        if available < amount_cents {
            return Err(BillingError::InsufficientCredit {
                available,
                requested: amount_cents,
            });
        }

        let consumption: CreditLedgerEntry = sqlx::query_as(
            r#"
            INSERT INTO credit_ledger (id, tenant_id, amount_cents, reason, expires_at, created_at)
            VALUES ($1, $2, $3, $4, NULL, NOW())
            RETURNING id, tenant_id, amount_cents, reason, expires_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(-amount_cents)
        .bind(reason)
        .fetch_one(&mut *conn)
        .await?;

        // Attribution detail for reporting: which grants funded this
        let open_grants = Self::open_grants_tx(&mut *conn, tenant_id, &entries, now).await?;
        for (grant_id, consumed) in allocate_fifo_by_expiry(&open_grants, amount_cents) {
            sqlx::query(
                r#"
                INSERT INTO credit_consumptions (id, consumption_id, grant_id, amount_cents, created_at)
                VALUES ($1, $2, $3, $4, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(consumption.id)
            .bind(grant_id)
            .bind(consumed)
            .execute(&mut *conn)
            .await?;
        }

        tracing::info!(
            tenant_id = %tenant_id,
            amount_cents = amount_cents,
            reason = %reason,
            remaining = available - amount_cents,
            "Credit consumed"
        );
        Ok(consumption)
    }

    /// Non-expired balance at `as_of` (defaults to the clock's now)
    pub async fn balance(
        &self,
        tenant_id: TenantId,
        as_of: Option<OffsetDateTime>,
    ) -> BillingResult<i64> {
        let as_of = as_of.unwrap_or_else(|| self.clock.now());
        let sum: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount_cents)::BIGINT
            FROM credit_ledger
            WHERE tenant_id = $1
              AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(tenant_id)
        .bind(as_of)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum.unwrap_or(0))
    }

    /// Full entry history for a tenant, oldest first
    pub async fn entries(&self, tenant_id: TenantId) -> BillingResult<Vec<CreditLedgerEntry>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, tenant_id, amount_cents, reason, expires_at, created_at
            FROM credit_ledger
            WHERE tenant_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Open grants (non-expired, value not fully attributed) from an
    /// already-locked entry set
    async fn open_grants_tx(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        entries: &[CreditLedgerEntry],
        now: OffsetDateTime,
    ) -> BillingResult<Vec<OpenGrant>> {
        let consumed_per_grant: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT cc.grant_id, SUM(cc.amount_cents)::BIGINT
            FROM credit_consumptions cc
            JOIN credit_ledger cl ON cl.id = cc.consumption_id
            WHERE cl.tenant_id = $1
            GROUP BY cc.grant_id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *conn)
        .await?;

        let consumed: std::collections::HashMap<Uuid, i64> =
            consumed_per_grant.into_iter().collect();

        Ok(entries
            .iter()
            .filter(|e| e.amount_cents > 0 && e.counts_at(now))
            .map(|e| OpenGrant {
                entry_id: e.id,
                remaining_cents: e.amount_cents - consumed.get(&e.id).copied().unwrap_or(0),
                expires_at: e.expires_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn entry(
        amount: i64,
        reason: CreditReason,
        expires_at: Option<OffsetDateTime>,
    ) -> CreditLedgerEntry {
        CreditLedgerEntry {
            id: Uuid::new_v4(),
            tenant_id: TenantId::new(),
            amount_cents: amount,
            reason,
            expires_at,
            created_at: datetime!(2026-08-01 00:00 UTC),
        }
    }

    #[test]
    fn test_balance_sums_non_expired() {
        let now = datetime!(2026-08-15 00:00 UTC);
        let entries = vec![
            entry(5_000, CreditReason::DowngradeRefund, None),
            entry(
                2_000,
                CreditReason::Promotional,
                Some(datetime!(2026-08-10 00:00 UTC)),
            ),
            entry(-1_000, CreditReason::AppliedToInvoice, None),
        ];
        // Expired promotional grant no longer counts
        assert_eq!(balance_of(&entries, now), 4_000);
        // Before expiry it did
        assert_eq!(balance_of(&entries, datetime!(2026-08-05 00:00 UTC)), 6_000);
    }

    #[test]
    fn test_consume_then_grant_restores_balance() {
        let now = datetime!(2026-08-15 00:00 UTC);
        let mut entries = vec![entry(5_000, CreditReason::DowngradeRefund, None)];
        let before = balance_of(&entries, now);
        entries.push(entry(-3_000, CreditReason::AppliedToInvoice, None));
        entries.push(entry(3_000, CreditReason::ManualAdjustment, None));
        assert_eq!(balance_of(&entries, now), before);
    }

    #[test]
    fn test_fifo_prefers_closest_expiry() {
        let soon = Uuid::new_v4();
        let later = Uuid::new_v4();
        let never = Uuid::new_v4();
        let grants = vec![
            OpenGrant {
                entry_id: never,
                remaining_cents: 10_000,
                expires_at: None,
            },
            OpenGrant {
                entry_id: later,
                remaining_cents: 2_000,
                expires_at: Some(datetime!(2026-12-01 00:00 UTC)),
            },
            OpenGrant {
                entry_id: soon,
                remaining_cents: 1_500,
                expires_at: Some(datetime!(2026-09-01 00:00 UTC)),
            },
        ];
        let allocations = allocate_fifo_by_expiry(&grants, 3_000);
        assert_eq!(allocations, vec![(soon, 1_500), (later, 1_500)]);
    }

    #[test]
    fn test_fifo_falls_through_to_unexpiring_grants() {
        let expiring = Uuid::new_v4();
        let open = Uuid::new_v4();
        let grants = vec![
            OpenGrant {
                entry_id: open,
                remaining_cents: 5_000,
                expires_at: None,
            },
            OpenGrant {
                entry_id: expiring,
                remaining_cents: 1_000,
                expires_at: Some(datetime!(2026-09-01 00:00 UTC)),
            },
        ];
        let allocations = allocate_fifo_by_expiry(&grants, 4_000);
        assert_eq!(allocations, vec![(expiring, 1_000), (open, 3_000)]);
    }

    #[test]
    fn test_fifo_skips_drained_grants() {
        let drained = Uuid::new_v4();
        let live = Uuid::new_v4();
        let grants = vec![
            OpenGrant {
                entry_id: drained,
                remaining_cents: 0,
                expires_at: Some(datetime!(2026-09-01 00:00 UTC)),
            },
            OpenGrant {
                entry_id: live,
                remaining_cents: 500,
                expires_at: None,
            },
        ];
        let allocations = allocate_fifo_by_expiry(&grants, 500);
        assert_eq!(allocations, vec![(live, 500)]);
    }
}
