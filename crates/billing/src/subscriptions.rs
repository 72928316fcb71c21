//! Subscription lifecycle management
//!
//! The single authoritative owner of subscription state. ALL plan changes,
//! cancellations, and period rollovers go through this service: each runs
//! in a transaction holding a `FOR UPDATE` lock on the tenant's
//! subscription row, writes its `plan_change_history` audit row in the
//! same transaction, and settles money exactly one way: a prorated
//! invoice adjustment or a prorated ledger credit, never both.

use atende_shared::{BillingCycle, Period, PlanId, SubscriptionStatus, TenantId};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::CatalogService;
use crate::clock::Clock;
use crate::config::{BillingConfig, DowngradePolicy};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::history::{ChangeStatus, ChangeType, PlanChangeDraft, PlanChangeHistoryService};
use crate::invoices::InvoiceGenerator;
use crate::ledger::{CreditLedgerService, CreditReason};
use crate::proration::prorate;
use crate::usage::UsageMeter;

/// One tenant subscription row
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_ends_at: Option<OffsetDateTime>,
    /// Flagged cancellations execute at the period boundary sweep
    pub cancel_at_period_end: bool,
    /// End-of-period downgrades recorded here, executed by the sweep
    pub scheduled_plan_id: Option<PlanId>,
    pub scheduled_cycle: Option<BillingCycle>,
    /// Coupon queued by `apply_coupon`, consumed by the next period invoice
    pub pending_coupon_code: Option<String>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Valid state transitions.
///
/// Reactivation is not a transition: a cancelled tenant that resubscribes
/// gets a fresh subscription row.
pub fn can_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    use SubscriptionStatus::*;
    matches!(
        (from, to),
        (Trial, Active)
            | (Trial, Cancelled)
            | (Active, PastDue)
            | (Active, Cancelled)
            | (PastDue, Active)
            | (PastDue, Cancelled)
    )
}

/// Source of a subscription mutation, for audit logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ChangeSource {
    /// Tenant-initiated via the app
    User,
    /// Admin panel
    AdminPanel,
    /// Payment processor callback
    PaymentProcessor,
    /// System automated change (sweep, trial expiry)
    System,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::User => "user",
            ChangeSource::AdminPanel => "admin_panel",
            ChangeSource::PaymentProcessor => "payment_processor",
            ChangeSource::System => "system",
        }
    }

    fn actor_type(&self) -> ActorType {
        match self {
            ChangeSource::User => ActorType::User,
            ChangeSource::AdminPanel => ActorType::Admin,
            ChangeSource::PaymentProcessor | ChangeSource::System => ActorType::System,
        }
    }
}

impl std::fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options for plan change operations
#[derive(Debug, Clone, Default)]
pub struct PlanChangeOptions {
    /// Source of the change
    pub source: Option<ChangeSource>,
    /// User who initiated the change (for audit)
    pub changed_by: Option<Uuid>,
    /// Reason (for audit logging)
    pub reason: Option<String>,
    /// Override the configured downgrade policy for this change
    pub downgrade_policy: Option<DowngradePolicy>,
}

impl PlanChangeOptions {
    /// Tenant-initiated change
    pub fn user() -> Self {
        Self {
            source: Some(ChangeSource::User),
            ..Default::default()
        }
    }

    /// Admin panel change
    pub fn admin(changed_by: Uuid, reason: Option<String>) -> Self {
        Self {
            source: Some(ChangeSource::AdminPanel),
            changed_by: Some(changed_by),
            reason,
            ..Default::default()
        }
    }

    /// System automated change
    pub fn system(reason: &str) -> Self {
        Self {
            source: Some(ChangeSource::System),
            reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

/// Result of a plan change
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanChangeOutcome {
    pub from_plan_id: PlanId,
    pub to_plan_id: PlanId,
    /// Whether the change was recorded for the period boundary instead of
    /// applied now
    pub scheduled: bool,
    pub effective_at: Option<OffsetDateTime>,
    /// Centavos invoiced for the upgrade remainder
    pub amount_due_cents: i64,
    /// Centavos credited for the downgrade remainder
    pub credit_granted_cents: i64,
    pub message: String,
}

/// When a cancellation takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelEffective {
    Immediate,
    EndOfPeriod,
}

/// Result of a cancellation
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancellationOutcome {
    pub effective: CancelEffective,
    pub effective_at: OffsetDateTime,
    /// Centavos credited for unused time (immediate cancellations only)
    pub credit_granted_cents: i64,
    pub message: String,
}

/// Result of a period rollover
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdvancedPeriod {
    pub tenant_id: TenantId,
    /// Bounds of the period that just closed
    pub closed_period_start: OffsetDateTime,
    pub closed_period_end: OffsetDateTime,
    /// Calendar usage period closed by this rollover
    pub closed_usage_period: Period,
    /// New period end (unset when the rollover executed a cancellation)
    pub new_period_end: Option<OffsetDateTime>,
    /// Whether a flagged end-of-period cancellation executed
    pub cancelled: bool,
    /// Plan applied by a scheduled end-of-period change, if any
    pub plan_changed_to: Option<PlanId>,
}

/// Subscription lifecycle service
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    clock: Clock,
    config: BillingConfig,
    catalog: CatalogService,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, clock: Clock, config: BillingConfig) -> Self {
        let catalog = CatalogService::new(pool.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            clock,
            config,
            catalog,
            event_logger,
        }
    }

    /// The tenant's live subscription, if any
    pub async fn get_live(&self, tenant_id: TenantId) -> BillingResult<Option<Subscription>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE tenant_id = $1 AND status IN ('trial', 'active', 'past_due')
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Status of the tenant's most recent subscription
    pub async fn get_status(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<SubscriptionStatus>> {
        let status: Option<SubscriptionStatus> = sqlx::query_scalar(
            r#"
            SELECT status FROM subscriptions
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status)
    }

    /// Create the subscription at tenant onboarding.
    ///
    /// Starts in Trial when the plan carries a trial, otherwise Active.
    /// A tenant holds at most one live subscription; a second create is an
    /// invalid transition.
    pub async fn create_subscription(
        &self,
        tenant_id: TenantId,
        plan_id: PlanId,
        cycle: BillingCycle,
    ) -> BillingResult<Subscription> {
        let plan = self.catalog.require_active_plan(plan_id).await?;
        let now = self.clock.now();

        let mut tx = self.pool.begin().await?;

        let live: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM subscriptions
            WHERE tenant_id = $1 AND status IN ('trial', 'active', 'past_due')
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await?;
        if live > 0 {
            return Err(BillingError::InvalidTransition(format!(
                "tenant {} already has a live subscription",
                tenant_id
            )));
        }

        let (status, trial_ends_at) = if plan.trial_days > 0 {
            (
                SubscriptionStatus::Trial,
                Some(now + Duration::days(plan.trial_days as i64)),
            )
        } else {
            (SubscriptionStatus::Active, None)
        };
        let period_end = cycle.advance(now);

        let subscription: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, plan_id, status, billing_cycle,
                current_period_start, current_period_end, trial_ends_at,
                cancel_at_period_end, scheduled_plan_id, scheduled_cycle,
                pending_coupon_code, cancelled_at, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, NULL, NULL, NULL, NULL, 1, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(plan_id)
        .bind(status)
        .bind(cycle)
        .bind(now)
        .bind(period_end)
        .bind(trial_ends_at)
        .fetch_one(&mut *tx)
        .await?;

        UsageMeter::open_period_tx(&mut *tx, tenant_id, Period::containing(now), &plan.limits)
            .await?;

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            plan = %plan.slug,
            status = %status,
            cycle = %cycle,
            "Subscription created"
        );
        self.log_event(
            BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionCreated).data(
                serde_json::json!({
                    "plan": plan.slug,
                    "status": status.as_str(),
                    "cycle": cycle.as_str(),
                    "trial_ends_at": trial_ends_at.map(|t| t.to_string()),
                }),
            ),
        )
        .await;
        Ok(subscription)
    }

    // =========================================================================
    // CONSOLIDATED PLAN CHANGE
    // =========================================================================
    // The SINGLE authoritative function for changing a subscription's plan.
    // All plan changes (user, admin, sweep-executed) go through here.
    // =========================================================================

    /// Change the tenant's plan and/or billing cycle.
    ///
    /// Requires a live subscription (Trial, Active, or PastDue) and an
    /// active target plan. Prorates the remainder of the current period:
    /// an upgrade invoices the difference, a downgrade credits it (or is
    /// recorded for the period boundary under the end-of-period policy).
    /// Period bounds are unchanged by an immediate change.
    pub async fn change_plan(
        &self,
        tenant_id: TenantId,
        new_plan_id: PlanId,
        new_cycle: BillingCycle,
        options: PlanChangeOptions,
    ) -> BillingResult<PlanChangeOutcome> {
        let source = options.source.unwrap_or(ChangeSource::System);
        let now = self.clock.now();

        tracing::info!(
            tenant_id = %tenant_id,
            new_plan_id = %new_plan_id,
            new_cycle = %new_cycle,
            source = %source,
            "Starting plan change"
        );

        let new_plan = self.catalog.require_active_plan(new_plan_id).await?;

        let mut tx = self.pool.begin().await?;
        let subscription = Self::lock_live_subscription(&mut tx, tenant_id, "change_plan").await?;
        let old_plan = self.catalog.plan(subscription.plan_id).await?;

        let old_price = old_plan.price_for(subscription.billing_cycle);
        let new_price = new_plan.price_for(new_cycle);
        let proration = prorate(
            old_price,
            Some(new_price),
            subscription.current_period_start,
            subscription.current_period_end,
            now,
        )?;

        let is_downgrade = new_price < old_price;
        let policy = options
            .downgrade_policy
            .unwrap_or(self.config.downgrade_policy);

        // End-of-period downgrades are recorded on the row and executed by
        // the rollover sweep; no money moves now
        if is_downgrade && policy == DowngradePolicy::EndOfPeriod {
            if let Some(already) = subscription.scheduled_plan_id {
                if already != new_plan_id {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        previous = %already,
                        replacement = %new_plan_id,
                        "Replacing previously scheduled plan change"
                    );
                }
            }
            let rows = sqlx::query(
                r#"
                UPDATE subscriptions SET
                    scheduled_plan_id = $1,
                    scheduled_cycle = $2,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $3 AND version = $4
                "#,
            )
            .bind(new_plan_id)
            .bind(new_cycle)
            .bind(subscription.id)
            .bind(subscription.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if rows == 0 {
                return Err(BillingError::ConcurrentModification(
                    "subscription was modified by another process".to_string(),
                ));
            }
            tx.commit().await?;

            tracing::info!(
                tenant_id = %tenant_id,
                from_plan = %old_plan.slug,
                to_plan = %new_plan.slug,
                effective_at = %subscription.current_period_end,
                "Scheduled plan downgrade at period end"
            );
            self.log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::PlanChangeScheduled)
                    .data(serde_json::json!({
                        "from_plan": old_plan.slug,
                        "to_plan": new_plan.slug,
                        "effective_at": subscription.current_period_end.to_string(),
                    }))
                    .actor_opt(options.changed_by, source.actor_type()),
            )
            .await;

            return Ok(PlanChangeOutcome {
                from_plan_id: subscription.plan_id,
                to_plan_id: new_plan_id,
                scheduled: true,
                effective_at: Some(subscription.current_period_end),
                amount_due_cents: 0,
                credit_granted_cents: 0,
                message: format!(
                    "Downgrade to {} scheduled for {}",
                    new_plan.slug, subscription.current_period_end
                ),
            });
        }

        // Immediate change: swap the plan in place, period bounds unchanged
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_id = $1,
                billing_cycle = $2,
                scheduled_plan_id = NULL,
                scheduled_cycle = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(new_plan_id)
        .bind(new_cycle)
        .bind(subscription.id)
        .bind(subscription.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(BillingError::ConcurrentModification(
                "subscription was modified by another process".to_string(),
            ));
        }

        // Settle exactly one way: invoice the upgrade or credit the downgrade
        if proration.amount_due > 0 {
            InvoiceGenerator::adjustment_invoice_tx(
                &mut *tx,
                tenant_id,
                &format!("Mudança de plano: {} → {}", old_plan.name, new_plan.name),
                proration.amount_due,
                now + Duration::days(self.config.invoice_grace_days),
            )
            .await?;
        } else if proration.credit_granted > 0 {
            CreditLedgerService::grant_tx(
                &mut *tx,
                tenant_id,
                proration.credit_granted,
                CreditReason::DowngradeRefund,
                None,
            )
            .await?;
        }

        let change_type = if is_downgrade {
            ChangeType::Downgrade
        } else {
            ChangeType::Upgrade
        };
        PlanChangeHistoryService::record_tx(
            &mut *tx,
            PlanChangeDraft {
                tenant_id,
                change_type,
                from_plan_id: Some(subscription.plan_id),
                to_plan_id: Some(new_plan_id),
                prorated_amount_cents: proration.amount_due,
                credits_generated_cents: proration.credit_granted,
                status: ChangeStatus::Completed,
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            from_plan = %old_plan.slug,
            to_plan = %new_plan.slug,
            amount_due_cents = proration.amount_due,
            credit_granted_cents = proration.credit_granted,
            "Plan changed"
        );
        self.log_event(
            BillingEventBuilder::new(tenant_id, BillingEventType::PlanChanged)
                .data(serde_json::json!({
                    "from_plan": old_plan.slug,
                    "to_plan": new_plan.slug,
                    "change_type": change_type.as_str(),
                    "amount_due_cents": proration.amount_due,
                    "credit_granted_cents": proration.credit_granted,
                    "source": source.as_str(),
                }))
                .actor_opt(options.changed_by, source.actor_type()),
        )
        .await;

        Ok(PlanChangeOutcome {
            from_plan_id: subscription.plan_id,
            to_plan_id: new_plan_id,
            scheduled: false,
            effective_at: Some(now),
            amount_due_cents: proration.amount_due,
            credit_granted_cents: proration.credit_granted,
            message: format!("Plan changed from {} to {}", old_plan.slug, new_plan.slug),
        })
    }

    /// Cancel the tenant's subscription.
    ///
    /// Immediate cancellation credits the unused remainder of the period
    /// to the ledger and transitions to Cancelled now. End-of-period flags
    /// the row; the rollover sweep executes the transition at the boundary
    /// with no credit (the period was paid through).
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        effective: CancelEffective,
        options: PlanChangeOptions,
    ) -> BillingResult<CancellationOutcome> {
        let source = options.source.unwrap_or(ChangeSource::System);
        let now = self.clock.now();

        let mut tx = self.pool.begin().await?;
        let subscription = Self::lock_live_subscription(&mut tx, tenant_id, "cancel").await?;
        let plan = self.catalog.plan(subscription.plan_id).await?;

        match effective {
            CancelEffective::EndOfPeriod => {
                let rows = sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        cancel_at_period_end = true,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1 AND version = $2
                    "#,
                )
                .bind(subscription.id)
                .bind(subscription.version)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if rows == 0 {
                    return Err(BillingError::ConcurrentModification(
                        "subscription was modified by another process".to_string(),
                    ));
                }
                tx.commit().await?;

                tracing::info!(
                    tenant_id = %tenant_id,
                    effective_at = %subscription.current_period_end,
                    "Cancellation scheduled for period end"
                );
                self.log_event(
                    BillingEventBuilder::new(tenant_id, BillingEventType::CancellationScheduled)
                        .data(serde_json::json!({
                            "effective_at": subscription.current_period_end.to_string(),
                        }))
                        .actor_opt(options.changed_by, source.actor_type()),
                )
                .await;

                Ok(CancellationOutcome {
                    effective: CancelEffective::EndOfPeriod,
                    effective_at: subscription.current_period_end,
                    credit_granted_cents: 0,
                    message: format!(
                        "Subscription will cancel at {}",
                        subscription.current_period_end
                    ),
                })
            }
            CancelEffective::Immediate => {
                let old_price = plan.price_for(subscription.billing_cycle);
                let proration = prorate(
                    old_price,
                    None,
                    subscription.current_period_start,
                    subscription.current_period_end,
                    now,
                )?;

                let rows = sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        status = 'cancelled',
                        cancelled_at = $1,
                        cancel_at_period_end = false,
                        scheduled_plan_id = NULL,
                        scheduled_cycle = NULL,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $2 AND version = $3
                    "#,
                )
                .bind(now)
                .bind(subscription.id)
                .bind(subscription.version)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if rows == 0 {
                    return Err(BillingError::ConcurrentModification(
                        "subscription was modified by another process".to_string(),
                    ));
                }

                if proration.credit_granted > 0 {
                    CreditLedgerService::grant_tx(
                        &mut *tx,
                        tenant_id,
                        proration.credit_granted,
                        CreditReason::CancellationRefund,
                        None,
                    )
                    .await?;
                }

                PlanChangeHistoryService::record_tx(
                    &mut *tx,
                    PlanChangeDraft {
                        tenant_id,
                        change_type: ChangeType::Cancellation,
                        from_plan_id: Some(subscription.plan_id),
                        to_plan_id: None,
                        prorated_amount_cents: 0,
                        credits_generated_cents: proration.credit_granted,
                        status: ChangeStatus::Completed,
                    },
                )
                .await?;

                tx.commit().await?;

                tracing::info!(
                    tenant_id = %tenant_id,
                    plan = %plan.slug,
                    credit_granted_cents = proration.credit_granted,
                    "Subscription cancelled immediately"
                );
                self.log_event(
                    BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionCancelled)
                        .data(serde_json::json!({
                            "plan": plan.slug,
                            "credit_granted_cents": proration.credit_granted,
                        }))
                        .actor_opt(options.changed_by, source.actor_type()),
                )
                .await;

                Ok(CancellationOutcome {
                    effective: CancelEffective::Immediate,
                    effective_at: now,
                    credit_granted_cents: proration.credit_granted,
                    message: format!(
                        "Subscription cancelled; {} cents credited for unused time",
                        proration.credit_granted
                    ),
                })
            }
        }
    }

    /// Reactivate a cancelled tenant on a plan.
    ///
    /// Inserts a fresh subscription row with a new period; the cancelled
    /// row stays untouched for history. No second trial.
    pub async fn reactivate(
        &self,
        tenant_id: TenantId,
        plan_id: PlanId,
        cycle: BillingCycle,
    ) -> BillingResult<Subscription> {
        let plan = self.catalog.require_active_plan(plan_id).await?;
        let now = self.clock.now();

        let mut tx = self.pool.begin().await?;

        let live: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM subscriptions
            WHERE tenant_id = $1 AND status IN ('trial', 'active', 'past_due')
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await?;
        if live > 0 {
            return Err(BillingError::InvalidTransition(format!(
                "tenant {} already has a live subscription",
                tenant_id
            )));
        }

        let cancelled: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE tenant_id = $1 AND status = 'cancelled'",
        )
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await?;
        if cancelled == 0 {
            return Err(BillingError::InvalidTransition(format!(
                "tenant {} has no cancelled subscription to reactivate",
                tenant_id
            )));
        }

        let period_end = cycle.advance(now);
        let subscription: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, plan_id, status, billing_cycle,
                current_period_start, current_period_end, trial_ends_at,
                cancel_at_period_end, scheduled_plan_id, scheduled_cycle,
                pending_coupon_code, cancelled_at, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'active', $4, $5, $6, NULL, false, NULL, NULL, NULL, NULL, 1, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(plan_id)
        .bind(cycle)
        .bind(now)
        .bind(period_end)
        .fetch_one(&mut *tx)
        .await?;

        UsageMeter::open_period_tx(&mut *tx, tenant_id, Period::containing(now), &plan.limits)
            .await?;

        PlanChangeHistoryService::record_tx(
            &mut *tx,
            PlanChangeDraft {
                tenant_id,
                change_type: ChangeType::Reactivation,
                from_plan_id: None,
                to_plan_id: Some(plan_id),
                prorated_amount_cents: 0,
                credits_generated_cents: 0,
                status: ChangeStatus::Completed,
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            plan = %plan.slug,
            "Subscription reactivated"
        );
        self.log_event(
            BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionReactivated)
                .data(serde_json::json!({ "plan": plan.slug, "cycle": cycle.as_str() })),
        )
        .await;
        Ok(subscription)
    }

    /// Payment capture failed: Active → PastDue
    pub async fn mark_past_due(&self, tenant_id: TenantId) -> BillingResult<()> {
        self.transition_status(
            tenant_id,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            BillingEventType::PaymentFailed,
        )
        .await
    }

    /// Payment retry succeeded: PastDue → Active
    pub async fn recover_from_past_due(&self, tenant_id: TenantId) -> BillingResult<()> {
        self.transition_status(
            tenant_id,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Active,
            BillingEventType::PaymentRecovered,
        )
        .await
    }

    /// Guarded single-step status transition
    async fn transition_status(
        &self,
        tenant_id: TenantId,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        event: BillingEventType,
    ) -> BillingResult<()> {
        if !can_transition(from, to) {
            return Err(BillingError::InvalidTransition(format!(
                "{} -> {} is not a valid subscription transition",
                from, to
            )));
        }
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $1,
                version = version + 1,
                updated_at = NOW()
            WHERE tenant_id = $2 AND status = $3
            "#,
        )
        .bind(to)
        .bind(tenant_id)
        .bind(from)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            let current = self.get_status(tenant_id).await?;
            return Err(BillingError::InvalidTransition(format!(
                "tenant {} subscription is {:?}, expected {}",
                tenant_id, current, from
            )));
        }

        tracing::info!(
            tenant_id = %tenant_id,
            from = %from,
            to = %to,
            "Subscription status transition"
        );
        self.log_event(
            BillingEventBuilder::new(tenant_id, event)
                .data(serde_json::json!({ "from": from.as_str(), "to": to.as_str() })),
        )
        .await;
        Ok(())
    }

    /// Queue a validated coupon code for the tenant's next period invoice
    pub async fn set_pending_coupon(&self, tenant_id: TenantId, code: &str) -> BillingResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions SET
                pending_coupon_code = $1,
                updated_at = NOW()
            WHERE tenant_id = $2 AND status IN ('trial', 'active', 'past_due')
            "#,
        )
        .bind(code)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(BillingError::InvalidTransition(format!(
                "tenant {} has no live subscription for apply_coupon",
                tenant_id
            )));
        }
        tracing::info!(tenant_id = %tenant_id, code = %code, "Coupon queued for next invoice");
        Ok(())
    }

    /// Roll the subscription into its next period.
    ///
    /// Executes any flagged end-of-period cancellation or scheduled plan
    /// change, closes the calendar usage periods that precede the new one,
    /// opens fresh zero counters with the (possibly new) plan's limits,
    /// and advances the period bounds by one cycle. Invoice generation for
    /// the closed period is triggered by the caller ([`crate::BillingService`]).
    pub async fn advance_period(&self, tenant_id: TenantId) -> BillingResult<AdvancedPeriod> {
        let now = self.clock.now();

        let mut tx = self.pool.begin().await?;
        let subscription =
            Self::lock_live_subscription(&mut tx, tenant_id, "advance_period").await?;
        let closed_usage_period = Period::containing(subscription.current_period_start);

        // Flagged cancellation executes at the boundary: no new period
        if subscription.cancel_at_period_end {
            let rows = sqlx::query(
                r#"
                UPDATE subscriptions SET
                    status = 'cancelled',
                    cancelled_at = $1,
                    cancel_at_period_end = false,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $2 AND version = $3
                "#,
            )
            .bind(subscription.current_period_end)
            .bind(subscription.id)
            .bind(subscription.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if rows == 0 {
                return Err(BillingError::ConcurrentModification(
                    "subscription was modified by another process".to_string(),
                ));
            }

            UsageMeter::close_periods_before_tx(&mut *tx, tenant_id, Period::containing(now).next())
                .await?;

            PlanChangeHistoryService::record_tx(
                &mut *tx,
                PlanChangeDraft {
                    tenant_id,
                    change_type: ChangeType::Cancellation,
                    from_plan_id: Some(subscription.plan_id),
                    to_plan_id: None,
                    prorated_amount_cents: 0,
                    credits_generated_cents: 0,
                    status: ChangeStatus::Completed,
                },
            )
            .await?;

            tx.commit().await?;

            tracing::info!(
                tenant_id = %tenant_id,
                "End-of-period cancellation executed at rollover"
            );
            self.log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionCancelled).data(
                    serde_json::json!({
                        "effective_at": subscription.current_period_end.to_string(),
                        "scheduled": true,
                    }),
                ),
            )
            .await;

            return Ok(AdvancedPeriod {
                tenant_id,
                closed_period_start: subscription.current_period_start,
                closed_period_end: subscription.current_period_end,
                closed_usage_period,
                new_period_end: None,
                cancelled: true,
                plan_changed_to: None,
            });
        }

        // Scheduled end-of-period plan change applies at the boundary;
        // money-neutral because the old period was fully paid
        let (plan_id, cycle) = match subscription.scheduled_plan_id {
            Some(scheduled) => (
                scheduled,
                subscription
                    .scheduled_cycle
                    .unwrap_or(subscription.billing_cycle),
            ),
            None => (subscription.plan_id, subscription.billing_cycle),
        };
        let plan = self.catalog.plan(plan_id).await?;

        let new_start = subscription.current_period_end;
        let new_end = cycle.advance(new_start);
        // A trial that reaches its period boundary converts to active
        let new_status = if subscription.status == SubscriptionStatus::Trial {
            SubscriptionStatus::Active
        } else {
            subscription.status
        };

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_id = $1,
                billing_cycle = $2,
                status = $3,
                current_period_start = $4,
                current_period_end = $5,
                scheduled_plan_id = NULL,
                scheduled_cycle = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(plan_id)
        .bind(cycle)
        .bind(new_status)
        .bind(new_start)
        .bind(new_end)
        .bind(subscription.id)
        .bind(subscription.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(BillingError::ConcurrentModification(
                "subscription was modified by another process".to_string(),
            ));
        }

        let new_usage_period = Period::containing(new_start);
        UsageMeter::close_periods_before_tx(&mut *tx, tenant_id, new_usage_period).await?;
        UsageMeter::open_period_tx(&mut *tx, tenant_id, new_usage_period, &plan.limits).await?;

        let plan_changed = subscription.scheduled_plan_id.is_some();
        if plan_changed {
            PlanChangeHistoryService::record_tx(
                &mut *tx,
                PlanChangeDraft {
                    tenant_id,
                    change_type: ChangeType::Downgrade,
                    from_plan_id: Some(subscription.plan_id),
                    to_plan_id: Some(plan_id),
                    prorated_amount_cents: 0,
                    credits_generated_cents: 0,
                    status: ChangeStatus::Completed,
                },
            )
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            plan = %plan.slug,
            new_period_end = %new_end,
            plan_changed = plan_changed,
            "Billing period advanced"
        );
        self.log_event(
            BillingEventBuilder::new(tenant_id, BillingEventType::PeriodAdvanced).data(
                serde_json::json!({
                    "plan": plan.slug,
                    "period_start": new_start.to_string(),
                    "period_end": new_end.to_string(),
                }),
            ),
        )
        .await;

        Ok(AdvancedPeriod {
            tenant_id,
            closed_period_start: subscription.current_period_start,
            closed_period_end: subscription.current_period_end,
            closed_usage_period,
            new_period_end: Some(new_end),
            cancelled: false,
            plan_changed_to: subscription.scheduled_plan_id,
        })
    }

    /// Tenants whose current period has ended (rollover sweep input)
    pub async fn due_for_rollover(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantId>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT tenant_id FROM subscriptions
            WHERE status IN ('trial', 'active', 'past_due')
              AND current_period_end <= $1
            ORDER BY current_period_end
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Convert expired trials to Active (trial expiry sweep).
    ///
    /// Returns the tenants converted.
    pub async fn process_expired_trials(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<TenantId>> {
        let converted: Vec<TenantId> = sqlx::query_scalar(
            r#"
            UPDATE subscriptions SET
                status = 'active',
                version = version + 1,
                updated_at = NOW()
            WHERE status = 'trial' AND trial_ends_at IS NOT NULL AND trial_ends_at <= $1
            RETURNING tenant_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for tenant_id in &converted {
            tracing::info!(tenant_id = %tenant_id, "Trial ended, subscription now active");
            self.log_event(BillingEventBuilder::new(
                *tenant_id,
                BillingEventType::TrialEnded,
            ))
            .await;
        }
        Ok(converted)
    }

    /// Lock the tenant's live subscription row for a mutation
    async fn lock_live_subscription(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: TenantId,
        operation: &str,
    ) -> BillingResult<Subscription> {
        let subscription: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE tenant_id = $1 AND status IN ('trial', 'active', 'past_due')
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&mut **tx)
        .await?;

        subscription.ok_or_else(|| {
            BillingError::InvalidTransition(format!(
                "tenant {} has no live subscription for {}",
                tenant_id, operation
            ))
        })
    }

    /// Best-effort event logging after a committed mutation
    async fn log_event(&self, builder: BillingEventBuilder) {
        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log billing event");
        }
    }
}
