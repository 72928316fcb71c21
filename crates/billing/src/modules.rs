//! Module grants
//!
//! Purchased add-on modules per tenant. Grants are soft-closed on removal
//! (`deactivated_at` set), never hard-deleted, so past invoices keep their
//! reference. Removing a recurring module mid-cycle credits the unused
//! remainder to the ledger.

use atende_shared::{ModuleId, TenantId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::CatalogService;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::{CreditLedgerService, CreditReason};
use crate::proration::prorate;

/// One tenant × module grant
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ModuleGrant {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub module_id: ModuleId,
    pub quantity: i64,
    pub activated_at: OffsetDateTime,
    pub deactivated_at: Option<OffsetDateTime>,
}

impl ModuleGrant {
    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

/// Grant joined with the catalog fields consumers need
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ModuleGrantDetail {
    pub grant_id: Uuid,
    pub module_id: ModuleId,
    pub module_slug: String,
    pub module_name: String,
    pub quantity: i64,
    pub price_cents: i64,
    pub is_recurring: bool,
    pub is_per_unit: bool,
    pub is_core: bool,
    pub activated_at: OffsetDateTime,
}

impl ModuleGrantDetail {
    /// Cycle charge for this grant in centavos
    pub fn charge_cents(&self) -> BillingResult<i64> {
        let quantity = if self.is_per_unit { self.quantity } else { 1 };
        self.price_cents
            .checked_mul(quantity)
            .ok_or(BillingError::ArithmeticOverflow("module charge"))
    }
}

/// Module grant service
#[derive(Clone)]
pub struct ModuleGrantService {
    pool: PgPool,
    clock: Clock,
    catalog: CatalogService,
    event_logger: BillingEventLogger,
}

impl ModuleGrantService {
    pub fn new(pool: PgPool, clock: Clock) -> Self {
        let catalog = CatalogService::new(pool.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            clock,
            catalog,
            event_logger,
        }
    }

    /// Purchase a module for a tenant.
    ///
    /// Per-unit modules stack: buying again raises the quantity on the
    /// existing active grant. Flat modules reject a duplicate purchase.
    pub async fn purchase_module(
        &self,
        tenant_id: TenantId,
        module_id: ModuleId,
        quantity: i64,
    ) -> BillingResult<ModuleGrant> {
        if quantity <= 0 {
            return Err(BillingError::InvalidAmount {
                amount: quantity,
                context: "module quantity",
            });
        }
        let module = self.catalog.require_active_module(module_id).await?;
        if !module.is_per_unit && quantity != 1 {
            return Err(BillingError::InvalidAmount {
                amount: quantity,
                context: "flat module quantity",
            });
        }

        let existing: Option<ModuleGrant> = sqlx::query_as(
            r#"
            SELECT * FROM module_grants
            WHERE tenant_id = $1 AND module_id = $2 AND deactivated_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(module_id)
        .fetch_optional(&self.pool)
        .await?;

        let grant = match existing {
            Some(grant) if module.is_per_unit => {
                sqlx::query_as(
                    r#"
                    UPDATE module_grants SET quantity = quantity + $1
                    WHERE id = $2 AND deactivated_at IS NULL
                    RETURNING *
                    "#,
                )
                .bind(quantity)
                .bind(grant.id)
                .fetch_one(&self.pool)
                .await?
            }
            Some(_) => {
                return Err(BillingError::InvalidTransition(format!(
                    "module {} already active for tenant {}",
                    module.slug, tenant_id
                )))
            }
            None => {
                sqlx::query_as(
                    r#"
                    INSERT INTO module_grants (id, tenant_id, module_id, quantity, activated_at, deactivated_at)
                    VALUES ($1, $2, $3, $4, NOW(), NULL)
                    RETURNING *
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(tenant_id)
                .bind(module_id)
                .bind(quantity)
                .fetch_one(&self.pool)
                .await?
            }
        };

        tracing::info!(
            tenant_id = %tenant_id,
            module = %module.slug,
            quantity = quantity,
            "Module purchased"
        );
        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::ModulePurchased).data(
                    serde_json::json!({
                        "module": module.slug,
                        "quantity": quantity,
                    }),
                ),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log module purchase event");
        }
        Ok(grant)
    }

    /// Soft-close a tenant's grant for a module.
    ///
    /// Recurring modules credit the unused remainder of the current period
    /// to the ledger; one-time modules just close.
    pub async fn remove_module(
        &self,
        tenant_id: TenantId,
        module_id: ModuleId,
    ) -> BillingResult<ModuleGrant> {
        let module = self.catalog.module(module_id).await?;
        let now = self.clock.now();

        // Close the grant and credit the refund atomically
        let mut tx = self.pool.begin().await?;

        let grant: Option<ModuleGrant> = sqlx::query_as(
            r#"
            UPDATE module_grants SET deactivated_at = $1
            WHERE tenant_id = $2 AND module_id = $3 AND deactivated_at IS NULL
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(tenant_id)
        .bind(module_id)
        .fetch_optional(&mut *tx)
        .await?;

        let grant = grant.ok_or_else(|| {
            BillingError::NotFound(format!(
                "active grant of module {} for tenant {}",
                module.slug, tenant_id
            ))
        })?;

        if module.is_recurring {
            let period: Option<(OffsetDateTime, OffsetDateTime)> = sqlx::query_as(
                r#"
                SELECT current_period_start, current_period_end
                FROM subscriptions
                WHERE tenant_id = $1 AND status IN ('trial', 'active', 'past_due')
                "#,
            )
            .bind(tenant_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((period_start, period_end)) = period {
                let quantity = if module.is_per_unit { grant.quantity } else { 1 };
                let paid = module
                    .price_cents
                    .checked_mul(quantity)
                    .ok_or(BillingError::ArithmeticOverflow("module refund"))?;
                let result = prorate(paid, None, period_start, period_end, now)?;
                if result.credit_granted > 0 {
                    CreditLedgerService::grant_tx(
                        &mut *tx,
                        tenant_id,
                        result.credit_granted,
                        CreditReason::DowngradeRefund,
                        None,
                    )
                    .await?;
                }
            }
        }

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            module = %module.slug,
            "Module removed"
        );
        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::ModuleRemoved)
                    .data(serde_json::json!({ "module": module.slug })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log module removal event");
        }
        Ok(grant)
    }

    /// Active grants joined with their catalog rows
    pub async fn active_grants(&self, tenant_id: TenantId) -> BillingResult<Vec<ModuleGrantDetail>> {
        Ok(sqlx::query_as(
            r#"
            SELECT
                g.id as grant_id,
                g.module_id,
                m.slug as module_slug,
                m.name as module_name,
                g.quantity,
                m.price_cents,
                m.is_recurring,
                m.is_per_unit,
                m.is_core,
                g.activated_at
            FROM module_grants g
            JOIN modules m ON m.id = g.module_id
            WHERE g.tenant_id = $1 AND g.deactivated_at IS NULL
            ORDER BY g.activated_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Whether the tenant holds an active grant for a module slug
    pub async fn has_active_grant(&self, tenant_id: TenantId, module_slug: &str) -> BillingResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM module_grants g
            JOIN modules m ON m.id = g.module_id
            WHERE g.tenant_id = $1 AND m.slug = $2 AND g.deactivated_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(module_slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn detail(price: i64, quantity: i64, per_unit: bool) -> ModuleGrantDetail {
        ModuleGrantDetail {
            grant_id: Uuid::new_v4(),
            module_id: ModuleId::new(),
            module_slug: "extra-instance".to_string(),
            module_name: "Instância WhatsApp Adicional".to_string(),
            quantity,
            price_cents: price,
            is_recurring: true,
            is_per_unit: per_unit,
            is_core: false,
            activated_at: datetime!(2026-08-01 00:00 UTC),
        }
    }

    #[test]
    fn test_flat_module_ignores_quantity() {
        let d = detail(4_900, 3, false);
        assert_eq!(d.charge_cents().unwrap(), 4_900);
    }

    #[test]
    fn test_per_unit_module_multiplies() {
        let d = detail(3_900, 3, true);
        assert_eq!(d.charge_cents().unwrap(), 11_700);
    }

    #[test]
    fn test_charge_overflow_is_error() {
        let d = detail(i64::MAX, 2, true);
        assert!(matches!(
            d.charge_cents(),
            Err(BillingError::ArithmeticOverflow(_))
        ));
    }
}
