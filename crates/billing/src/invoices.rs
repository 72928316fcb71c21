//! Invoice generation
//!
//! Assembles invoices at period boundaries and plan-change events: base
//! plan price for the new cycle, recurring and per-unit module charges,
//! overage charges from the closed usage period, minus coupon discount and
//! ledger credit (capped at the remaining total, so an invoice never goes
//! negative). Status only moves forward: Pending → Paid | Overdue |
//! Cancelled, Overdue → Paid | Cancelled; Paid and Cancelled are terminal.

use atende_shared::{Period, TenantId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{CatalogService, OverageRates};
use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::coupons::CouponService;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::{CreditLedgerService, CreditReason};
use crate::modules::{ModuleGrantDetail, ModuleGrantService};
use crate::subscriptions::AdvancedPeriod;
use crate::usage::{UsageMeter, UsageRecord};

/// Invoice lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Forward-only invoice status transitions
pub fn invoice_can_transition(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    use InvoiceStatus::*;
    matches!(
        (from, to),
        (Pending, Paid) | (Pending, Overdue) | (Pending, Cancelled) | (Overdue, Paid) | (Overdue, Cancelled)
    )
}

/// Invoice header
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub credit_applied_cents: i64,
    pub total_cents: i64,
    pub due_date: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub payment_method: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// One invoice line
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub total_cents: i64,
    pub sort_order: i32,
}

/// A line before persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceLine {
    pub description: String,
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub total_cents: i64,
}

impl InvoiceLine {
    fn flat(description: String, amount_cents: i64) -> Self {
        Self {
            description,
            unit_price_cents: amount_cents,
            quantity: 1,
            total_cents: amount_cents,
        }
    }
}

/// Inputs for pure line assembly
#[derive(Debug, Clone)]
pub struct LineAssembly<'a> {
    /// Base plan charge for the cycle ahead; `None` for final invoices of
    /// cancelled subscriptions (overage only)
    pub base: Option<(&'a str, i64)>,
    pub grants: &'a [ModuleGrantDetail],
    /// Usage records of the closed period (overage is billed from these)
    pub usage: &'a [UsageRecord],
    pub rates: &'a OverageRates,
    /// Window for including one-time module purchases
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

/// Assemble invoice lines. Pure: no store access, fully deterministic.
pub fn build_invoice_lines(assembly: &LineAssembly<'_>) -> BillingResult<Vec<InvoiceLine>> {
    let mut lines = Vec::new();

    if let Some((plan_name, price_cents)) = assembly.base {
        if price_cents > 0 {
            lines.push(InvoiceLine::flat(format!("Plano {}", plan_name), price_cents));
        }
    }

    for grant in assembly.grants {
        // One-time modules bill only in the period they were purchased
        if !grant.is_recurring
            && !(grant.activated_at >= assembly.period_start
                && grant.activated_at < assembly.period_end)
        {
            continue;
        }
        let total = grant.charge_cents()?;
        if total == 0 {
            continue;
        }
        let quantity = if grant.is_per_unit { grant.quantity } else { 1 };
        lines.push(InvoiceLine {
            description: if grant.is_per_unit {
                format!("Módulo {} × {}", grant.module_name, quantity)
            } else {
                format!("Módulo {}", grant.module_name)
            },
            unit_price_cents: grant.price_cents,
            quantity,
            total_cents: total,
        });
    }

    for record in assembly.usage {
        let overage = record.overage();
        if overage == 0 {
            continue;
        }
        let charge = assembly
            .rates
            .overage_charge_cents(record.resource_type, overage)?;
        if charge == 0 {
            continue;
        }
        lines.push(InvoiceLine {
            description: format!(
                "Excedente de {} ({} acima do limite)",
                record.resource_type, overage
            ),
            unit_price_cents: charge,
            quantity: 1,
            total_cents: charge,
        });
    }

    Ok(lines)
}

/// Totals after applying a coupon discount and available ledger credit.
///
/// The discount caps at the subtotal and the credit caps at what remains,
/// so the payable total is never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceTotals {
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub credit_applied_cents: i64,
    pub total_cents: i64,
}

/// Apply discount then credit to a subtotal. Pure.
pub fn apply_reductions(
    subtotal_cents: i64,
    coupon_discount_cents: i64,
    credit_available_cents: i64,
) -> InvoiceTotals {
    let discount = coupon_discount_cents.clamp(0, subtotal_cents);
    let after_discount = subtotal_cents - discount;
    let credit = credit_available_cents.clamp(0, after_discount);
    InvoiceTotals {
        subtotal_cents,
        discount_cents: discount,
        credit_applied_cents: credit,
        total_cents: after_discount - credit,
    }
}

/// Invoice generation service
#[derive(Clone)]
pub struct InvoiceGenerator {
    pool: PgPool,
    clock: Clock,
    config: BillingConfig,
    rates: OverageRates,
    catalog: CatalogService,
    usage: UsageMeter,
    modules: ModuleGrantService,
    coupons: CouponService,
    event_logger: BillingEventLogger,
}

impl InvoiceGenerator {
    pub fn new(pool: PgPool, clock: Clock, config: BillingConfig, rates: OverageRates) -> Self {
        let catalog = CatalogService::new(pool.clone());
        let usage = UsageMeter::new(pool.clone());
        let modules = ModuleGrantService::new(pool.clone(), clock.clone());
        let coupons = CouponService::new(pool.clone(), clock.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            clock,
            config,
            rates,
            catalog,
            usage,
            modules,
            coupons,
            event_logger,
        }
    }

    /// Generate the invoice for a just-rolled period.
    ///
    /// Bills the new cycle's base plan price plus module charges, and the
    /// closed period's overage. For a rollover that executed a scheduled
    /// cancellation, only outstanding overage is billed. Applies a coupon
    /// (validated and redeemed here) and then ledger credit up to the
    /// remaining total. Returns `None` when there is nothing to bill.
    pub async fn generate_period_invoice(
        &self,
        advanced: &AdvancedPeriod,
        coupon_code: Option<&str>,
    ) -> BillingResult<Option<Invoice>> {
        let tenant_id = advanced.tenant_id;
        let now = self.clock.now();

        // Base charge comes from the plan in effect for the new period
        let base = if advanced.cancelled {
            None
        } else {
            let subscription: Option<(atende_shared::PlanId, atende_shared::BillingCycle)> =
                sqlx::query_as(
                    r#"
                    SELECT plan_id, billing_cycle FROM subscriptions
                    WHERE tenant_id = $1 AND status IN ('trial', 'active', 'past_due')
                    "#,
                )
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
            match subscription {
                Some((plan_id, cycle)) => {
                    let plan = self.catalog.plan(plan_id).await?;
                    Some((plan.name.clone(), plan.price_for(cycle)))
                }
                None => None,
            }
        };

        let grants = self.modules.active_grants(tenant_id).await?;
        let usage = self
            .usage
            .period_usage(tenant_id, advanced.closed_usage_period)
            .await?;

        let lines = build_invoice_lines(&LineAssembly {
            base: base.as_ref().map(|(name, price)| (name.as_str(), *price)),
            grants: &grants,
            usage: &usage,
            rates: &self.rates,
            period_start: advanced.closed_period_start,
            period_end: advanced.closed_period_end,
        })?;

        if lines.is_empty() {
            tracing::debug!(tenant_id = %tenant_id, "Nothing to invoice for period");
            return Ok(None);
        }

        let subtotal: i64 = lines
            .iter()
            .try_fold(0i64, |acc, l| acc.checked_add(l.total_cents))
            .ok_or(BillingError::ArithmeticOverflow("invoice subtotal"))?;

        // A coupon queued via apply_coupon is picked up when none is passed
        let pending_coupon: Option<String> = match coupon_code {
            Some(_) => None,
            None => sqlx::query_scalar(
                r#"
                SELECT pending_coupon_code FROM subscriptions
                WHERE tenant_id = $1
                ORDER BY created_at DESC
                LIMIT 1
                "#,
            )
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?
            .flatten(),
        };
        let coupon_code = coupon_code.or(pending_coupon.as_deref());

        // Coupon: validate softly, then redeem (hard error on races)
        let discount = match coupon_code {
            Some(code) => {
                let validation = self.coupons.validate(code, subtotal).await?;
                if !validation.valid {
                    return Err(BillingError::CouponInvalid(
                        validation.message.unwrap_or_else(|| code.to_string()),
                    ));
                }
                self.coupons.redeem(tenant_id, code).await?;
                validation.discount_cents
            }
            None => 0,
        };

        let mut tx = self.pool.begin().await?;

        // Credit application happens in-transaction so the ledger guard
        // and the invoice commit atomically
        let credit_available: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount_cents)::BIGINT
            FROM credit_ledger
            WHERE tenant_id = $1 AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let totals = apply_reductions(subtotal, discount, credit_available.unwrap_or(0).max(0));

        if totals.credit_applied_cents > 0 {
            CreditLedgerService::consume_tx(
                &mut *tx,
                tenant_id,
                totals.credit_applied_cents,
                CreditReason::AppliedToInvoice,
                now,
            )
            .await?;
        }

        let due_date = advanced.closed_period_end + Duration::days(self.config.invoice_grace_days);
        let invoice = Self::insert_invoice_tx(
            &mut *tx,
            tenant_id,
            &lines,
            totals,
            due_date,
            Some(advanced.closed_period_start),
            Some(advanced.closed_period_end),
        )
        .await?;

        // The queued coupon is spent by this invoice
        if pending_coupon.is_some() {
            sqlx::query(
                "UPDATE subscriptions SET pending_coupon_code = NULL WHERE tenant_id = $1",
            )
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            invoice_number = %invoice.invoice_number,
            subtotal_cents = totals.subtotal_cents,
            total_cents = totals.total_cents,
            "Period invoice generated"
        );
        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::InvoiceCreated).data(
                    serde_json::json!({
                        "invoice_number": invoice.invoice_number,
                        "subtotal_cents": totals.subtotal_cents,
                        "discount_cents": totals.discount_cents,
                        "credit_applied_cents": totals.credit_applied_cents,
                        "total_cents": totals.total_cents,
                    }),
                ),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice creation event");
        }
        Ok(Some(invoice))
    }

    /// One-line adjustment invoice inside an existing transaction.
    ///
    /// Used by plan upgrades: the prorated difference is due immediately.
    pub async fn adjustment_invoice_tx(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        description: &str,
        amount_cents: i64,
        due_date: OffsetDateTime,
    ) -> BillingResult<Invoice> {
        if amount_cents <= 0 {
            return Err(BillingError::InvalidAmount {
                amount: amount_cents,
                context: "adjustment invoice",
            });
        }
        let lines = vec![InvoiceLine::flat(description.to_string(), amount_cents)];
        let totals = apply_reductions(amount_cents, 0, 0);
        Self::insert_invoice_tx(conn, tenant_id, &lines, totals, due_date, None, None).await
    }

    /// Insert header + items; numbers come from `invoice_number_seq`
    async fn insert_invoice_tx(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        lines: &[InvoiceLine],
        totals: InvoiceTotals,
        due_date: OffsetDateTime,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Invoice> {
        let invoice: Invoice = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                id, tenant_id, invoice_number, status,
                subtotal_cents, discount_cents, credit_applied_cents, total_cents,
                due_date, paid_at, payment_method, period_start, period_end, created_at
            )
            VALUES (
                $1, $2,
                format('ATD-%s-%s', to_char(NOW(), 'YYYY'),
                       lpad(nextval('invoice_number_seq')::text, 6, '0')),
                'pending', $3, $4, $5, $6, $7, NULL, NULL, $8, $9, NOW()
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(totals.subtotal_cents)
        .bind(totals.discount_cents)
        .bind(totals.credit_applied_cents)
        .bind(totals.total_cents)
        .bind(due_date)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&mut *conn)
        .await?;

        for (index, line) in lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO invoice_items (
                    id, invoice_id, description, unit_price_cents, quantity, total_cents, sort_order
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice.id)
            .bind(&line.description)
            .bind(line.unit_price_cents)
            .bind(line.quantity)
            .bind(line.total_cents)
            .bind(index as i32)
            .execute(&mut *conn)
            .await?;
        }
        Ok(invoice)
    }

    /// Settle an invoice: Pending | Overdue → Paid
    pub async fn mark_paid(
        &self,
        invoice_id: Uuid,
        payment_method: &str,
    ) -> BillingResult<Invoice> {
        let now = self.clock.now();
        let invoice: Option<Invoice> = sqlx::query_as(
            r#"
            UPDATE invoices SET
                status = 'paid',
                paid_at = $1,
                payment_method = $2
            WHERE id = $3 AND status IN ('pending', 'overdue')
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(payment_method)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        let invoice = invoice.ok_or_else(|| {
            BillingError::InvalidTransition(format!(
                "invoice {} is not pending or overdue",
                invoice_id
            ))
        })?;

        tracing::info!(
            tenant_id = %invoice.tenant_id,
            invoice_number = %invoice.invoice_number,
            "Invoice paid"
        );
        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(invoice.tenant_id, BillingEventType::InvoicePaid)
                    .data(serde_json::json!({ "invoice_number": invoice.invoice_number })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice payment event");
        }
        Ok(invoice)
    }

    /// Cancel an invoice: Pending | Overdue → Cancelled
    pub async fn cancel_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice: Option<Invoice> = sqlx::query_as(
            r#"
            UPDATE invoices SET status = 'cancelled'
            WHERE id = $1 AND status IN ('pending', 'overdue')
            RETURNING *
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        let invoice = invoice.ok_or_else(|| {
            BillingError::InvalidTransition(format!(
                "invoice {} is not pending or overdue",
                invoice_id
            ))
        })?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(invoice.tenant_id, BillingEventType::InvoiceCancelled)
                    .data(serde_json::json!({ "invoice_number": invoice.invoice_number })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice cancellation event");
        }
        Ok(invoice)
    }

    /// Overdue sweep: flip pending invoices past their due date.
    ///
    /// Returns the flipped invoices so the caller can kick off collection.
    pub async fn mark_overdue(&self, now: OffsetDateTime) -> BillingResult<Vec<Invoice>> {
        let overdue: Vec<Invoice> = sqlx::query_as(
            r#"
            UPDATE invoices SET status = 'overdue'
            WHERE status = 'pending' AND due_date < $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for invoice in &overdue {
            tracing::warn!(
                tenant_id = %invoice.tenant_id,
                invoice_number = %invoice.invoice_number,
                total_cents = invoice.total_cents,
                "Invoice overdue"
            );
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(invoice.tenant_id, BillingEventType::InvoiceOverdue)
                        .data(serde_json::json!({ "invoice_number": invoice.invoice_number })),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log invoice overdue event");
            }
        }
        Ok(overdue)
    }

    /// Pending invoices with an amount due (collection sweep input)
    pub async fn pending_invoices(&self) -> BillingResult<Vec<Invoice>> {
        Ok(sqlx::query_as(
            "SELECT * FROM invoices WHERE status = 'pending' AND total_cents > 0 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// A tenant's invoices, newest first
    pub async fn list(&self, tenant_id: TenantId) -> BillingResult<Vec<Invoice>> {
        Ok(sqlx::query_as(
            "SELECT * FROM invoices WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Items of one invoice in line order
    pub async fn items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceItem>> {
        Ok(sqlx::query_as(
            "SELECT * FROM invoice_items WHERE invoice_id = $1 ORDER BY sort_order",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
