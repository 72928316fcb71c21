// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some ledger/invoice operations take many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Atende Billing Module
//!
//! Billing and entitlement core for the Atende multi-tenant console.
//!
//! ## Features
//!
//! - **Subscription Lifecycle**: trial, active, past_due, cancelled, with
//!   reactivation as a fresh subscription
//! - **Proration**: integer-cents mid-cycle plan change math with banker's
//!   rounding (no floating point anywhere near money)
//! - **Modules**: paid add-ons per tenant, recurring or one-time, per-unit
//! - **Usage Metering**: per-period counters with limit snapshots and
//!   overage billing
//! - **Credit Ledger**: append-only tenant credit with FIFO-by-expiry
//!   attribution
//! - **Coupons**: soft validation, compare-and-swap redemption
//! - **Entitlement**: the single read-side answer to "what can this tenant
//!   do right now?"
//! - **Invoices**: period and adjustment invoices with forward-only status
//! - **Invariants**: executable consistency checks over the whole system

pub mod catalog;
pub mod clock;
pub mod config;
pub mod coupons;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod history;
pub mod invariants;
pub mod invoices;
pub mod ledger;
pub mod modules;
pub mod payment;
pub mod proration;
pub mod subscriptions;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{
    CatalogService, Module, ModuleCategory, ModuleDraft, OverageRates, Plan, PlanDraft,
    PlanFeatures, PlanLimits, PlanPrices,
};

// Clock
pub use clock::Clock;

// Config
pub use config::{BillingConfig, DowngradePolicy};

// Coupons
pub use coupons::{Coupon, CouponDraft, CouponService, CouponValidation, DiscountType};

// Entitlement
pub use entitlement::{
    Entitlement, EntitlementService, EntitlementState, LimitSource, RawEntitlementData,
    TenantOverrides,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// History
pub use history::{
    ChangeStatus, ChangeType, PlanChangeDraft, PlanChangeHistoryService, PlanChangeRecord,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{Invoice, InvoiceGenerator, InvoiceItem, InvoiceStatus};

// Ledger
pub use ledger::{CreditLedgerEntry, CreditLedgerService, CreditReason};

// Modules
pub use modules::{ModuleGrant, ModuleGrantDetail, ModuleGrantService};

// Payment
pub use payment::{PaymentCallbacks, PaymentOutcome, PaymentProcessor};

// Proration
pub use proration::{prorate, ProrationResult};

// Subscriptions
pub use subscriptions::{
    AdvancedPeriod, CancelEffective, CancellationOutcome, ChangeSource, PlanChangeOptions,
    PlanChangeOutcome, Subscription, SubscriptionService,
};

// Usage
pub use usage::{UsageMeter, UsageRecord, UsageSummary};

use atende_shared::TenantId;
use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: CatalogService,
    pub coupons: CouponService,
    pub entitlement: EntitlementService,
    pub history: PlanChangeHistoryService,
    pub invoices: InvoiceGenerator,
    pub ledger: CreditLedgerService,
    pub modules: ModuleGrantService,
    pub subscriptions: SubscriptionService,
    pub usage: UsageMeter,
    pool: PgPool,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(
            pool,
            Clock::system(),
            BillingConfig::from_env(),
            OverageRates::from_env(),
        )
    }

    /// Create a new billing service with explicit config
    pub fn new(pool: PgPool, clock: Clock, config: BillingConfig, rates: OverageRates) -> Self {
        Self {
            catalog: CatalogService::new(pool.clone()),
            coupons: CouponService::new(pool.clone(), clock.clone()),
            entitlement: EntitlementService::new(pool.clone(), clock.clone(), config.clone()),
            history: PlanChangeHistoryService::new(pool.clone()),
            invoices: InvoiceGenerator::new(pool.clone(), clock.clone(), config.clone(), rates),
            ledger: CreditLedgerService::new(pool.clone(), clock.clone()),
            modules: ModuleGrantService::new(pool.clone(), clock.clone()),
            subscriptions: SubscriptionService::new(pool.clone(), clock, config),
            usage: UsageMeter::new(pool.clone()),
            pool,
        }
    }

    /// Roll a tenant's period and generate the resulting invoice.
    ///
    /// The rollover commits first; invoice generation failure leaves the
    /// rolled period in place for a retry (invoices are generated from
    /// closed, immutable usage records, so the retry is safe).
    pub async fn advance_period(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<(AdvancedPeriod, Option<Invoice>)> {
        let advanced = self.subscriptions.advance_period(tenant_id).await?;
        let invoice = self
            .invoices
            .generate_period_invoice(&advanced, None)
            .await?;
        Ok((advanced, invoice))
    }

    /// Queue a coupon for the tenant's next period invoice.
    ///
    /// Validation is soft: an invalid code returns the rejection in the
    /// result instead of queueing. Redemption happens when the invoice is
    /// generated, so a code queued by many tenants still resolves its last
    /// use atomically there.
    pub async fn apply_coupon(
        &self,
        tenant_id: TenantId,
        code: &str,
    ) -> BillingResult<CouponValidation> {
        // Validated against a zero subtotal: only eligibility is checked
        // here, the discount is computed against the real invoice later
        let validation = self.coupons.validate(code, 0).await?;
        if validation.valid {
            self.subscriptions
                .set_pending_coupon(tenant_id, code)
                .await?;
        }
        Ok(validation)
    }

    /// Admin credit adjustment: positive grants, negative consumes.
    pub async fn adjust_credit(
        &self,
        tenant_id: TenantId,
        amount_cents: i64,
    ) -> BillingResult<CreditLedgerEntry> {
        if amount_cents >= 0 {
            self.ledger
                .grant(tenant_id, amount_cents, CreditReason::ManualAdjustment, None)
                .await
        } else {
            self.ledger
                .consume(tenant_id, -amount_cents, CreditReason::ManualAdjustment)
                .await
        }
    }

    /// Period rollover sweep: advance every due tenant and invoice them.
    ///
    /// Per-tenant failures are logged and skipped so one bad tenant cannot
    /// stall the sweep; the next run retries them.
    pub async fn process_due_rollovers(
        &self,
        now: time::OffsetDateTime,
    ) -> BillingResult<Vec<AdvancedPeriod>> {
        let due = self.subscriptions.due_for_rollover(now).await?;
        let mut advanced = Vec::with_capacity(due.len());
        for tenant_id in due {
            match self.advance_period(tenant_id).await {
                Ok((period, _invoice)) => advanced.push(period),
                Err(e) => {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "Failed to roll billing period"
                    );
                }
            }
        }
        Ok(advanced)
    }

    /// Consistency checker over the same pool
    pub fn invariant_checker(&self, clock: Clock) -> InvariantChecker {
        InvariantChecker::new(self.pool.clone(), clock)
    }
}
