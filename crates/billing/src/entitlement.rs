//! Entitlement resolution
//!
//! Provides the unified answer to "what can this tenant do right now?"
//! This is the single authoritative read side the rest of the application
//! queries before gating features; clients hold no independent copy, only
//! a cache they invalidate on billing events.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: `compute_entitlement()` is THE function
//!    that determines access
//! 2. **Deterministic**: same raw inputs and clock always produce the same
//!    output
//! 3. **Debuggable**: entitlements carry source tracing for "why" questions
//! 4. **Read-only**: this component performs no writes

use atende_shared::{LimitStatus, Period, PlanId, ResourceType, SubscriptionStatus, TenantId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::catalog::{PlanFeatures, PlanLimits};
use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::usage::UsageMeter;

/// Unified entitlement state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    /// Trial period active (trial_ends_at > now)
    Trialing,
    /// Subscription active and in good standing
    Active,
    /// Cancellation flagged for the period boundary; access continues
    CancelScheduled,
    /// Payment past due, within the grace window
    PastDueGrace,
    /// Payment past due and the grace window has run out
    PastDueLocked,
    /// Subscription cancelled, access revoked
    Cancelled,
    /// Tenant has never subscribed (or rows are gone)
    NoSubscription,
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementState::Trialing => write!(f, "trialing"),
            EntitlementState::Active => write!(f, "active"),
            EntitlementState::CancelScheduled => write!(f, "cancel_scheduled"),
            EntitlementState::PastDueGrace => write!(f, "past_due_grace"),
            EntitlementState::PastDueLocked => write!(f, "past_due_locked"),
            EntitlementState::Cancelled => write!(f, "cancelled"),
            EntitlementState::NoSubscription => write!(f, "no_subscription"),
        }
    }
}

/// What determined the effective limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitSource {
    /// Plan defaults only
    Plan,
    /// Every limit overridden per tenant
    Override,
    /// Some limits overridden, the rest from the plan
    Mixed,
}

/// Per-tenant limit overrides (admin-set, all optional)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantOverrides {
    pub max_whatsapp_instances: Option<i64>,
    pub max_messages_month: Option<i64>,
    pub max_users: Option<i64>,
    pub max_ai_tokens_month: Option<i64>,
    pub max_automations: Option<i64>,
    pub max_storage_bytes: Option<i64>,
}

impl TenantOverrides {
    pub fn is_empty(&self) -> bool {
        self.max_whatsapp_instances.is_none()
            && self.max_messages_month.is_none()
            && self.max_users.is_none()
            && self.max_ai_tokens_month.is_none()
            && self.max_automations.is_none()
            && self.max_storage_bytes.is_none()
    }

    fn is_full(&self) -> bool {
        self.max_whatsapp_instances.is_some()
            && self.max_messages_month.is_some()
            && self.max_users.is_some()
            && self.max_ai_tokens_month.is_some()
            && self.max_automations.is_some()
            && self.max_storage_bytes.is_some()
    }

    /// Merge overrides onto plan defaults
    pub fn apply_to(&self, plan: &PlanLimits) -> (PlanLimits, LimitSource) {
        let source = if self.is_empty() {
            LimitSource::Plan
        } else if self.is_full() {
            LimitSource::Override
        } else {
            LimitSource::Mixed
        };
        let limits = PlanLimits {
            max_whatsapp_instances: self
                .max_whatsapp_instances
                .unwrap_or(plan.max_whatsapp_instances),
            max_messages_month: self.max_messages_month.unwrap_or(plan.max_messages_month),
            max_users: self.max_users.unwrap_or(plan.max_users),
            max_ai_tokens_month: self.max_ai_tokens_month.unwrap_or(plan.max_ai_tokens_month),
            max_automations: self.max_automations.unwrap_or(plan.max_automations),
            max_storage_bytes: self.max_storage_bytes.unwrap_or(plan.max_storage_bytes),
        };
        (limits, source)
    }
}

/// Complete entitlement for a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub state: EntitlementState,
    pub plan_id: Option<PlanId>,
    pub plan_slug: Option<String>,
    /// Effective limits (plan defaults + per-tenant overrides)
    pub limits: PlanLimits,
    pub limit_source: LimitSource,
    /// Feature flags from the plan, widened by module grants
    pub features: PlanFeatures,
    /// Module slugs enabled right now (core + plan-included + granted)
    pub enabled_modules: Vec<String>,
    pub computed_at: OffsetDateTime,
    /// When this entitlement lapses (trial end, scheduled cancellation)
    pub expires_at: Option<OffsetDateTime>,
    /// Whether the tenant may use the product right now
    pub access_allowed: bool,
    /// Human-readable reason when access is blocked or degraded
    pub blocked_reason: Option<String>,
}

impl Entitlement {
    pub fn is_module_enabled(&self, module_slug: &str) -> bool {
        self.enabled_modules.iter().any(|m| m == module_slug)
    }
}

/// Raw data needed to compute an entitlement
#[derive(Debug, Clone)]
pub struct RawEntitlementData {
    pub tenant_id: TenantId,
    pub subscription_status: Option<SubscriptionStatus>,
    pub plan_id: Option<PlanId>,
    pub plan_slug: Option<String>,
    pub plan_limits: Option<PlanLimits>,
    pub plan_features: Option<PlanFeatures>,
    pub plan_included_modules: Vec<String>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub overrides: TenantOverrides,
    /// Slugs of modules with an active grant
    pub granted_modules: Vec<String>,
    /// Core module slugs from the catalog (always on)
    pub core_modules: Vec<String>,
}

/// Pure function: compute the entitlement from raw data.
///
/// Deterministic in `(raw, now, past_due_grace_days)`, which is what makes
/// the resolver testable without a store.
pub fn compute_from_raw(
    raw: &RawEntitlementData,
    now: OffsetDateTime,
    past_due_grace_days: i64,
) -> Entitlement {
    let (state, expires_at, access_allowed, blocked_reason) =
        determine_state(raw, now, past_due_grace_days);

    let plan_limits = raw.plan_limits.unwrap_or(PlanLimits {
        max_whatsapp_instances: 0,
        max_messages_month: 0,
        max_users: 0,
        max_ai_tokens_month: 0,
        max_automations: 0,
        max_storage_bytes: 0,
    });
    let (limits, limit_source) = raw.overrides.apply_to(&plan_limits);

    // Module set: core always on, then plan-included, then granted
    let mut enabled_modules: Vec<String> = Vec::new();
    for slug in raw
        .core_modules
        .iter()
        .chain(raw.plan_included_modules.iter())
        .chain(raw.granted_modules.iter())
    {
        if !enabled_modules.iter().any(|m| m == slug) {
            enabled_modules.push(slug.clone());
        }
    }

    // Feature flags widen with the relevant module grants
    let base = raw.plan_features.unwrap_or(PlanFeatures {
        has_ai: false,
        has_automations: false,
        has_calendar_sync: false,
        has_priority_support: false,
    });
    let features = PlanFeatures {
        has_ai: base.has_ai || enabled_modules.iter().any(|m| m == "ai-assistant"),
        has_automations: base.has_automations,
        has_calendar_sync: base.has_calendar_sync
            || enabled_modules.iter().any(|m| m == "calendar-sync"),
        has_priority_support: base.has_priority_support
            || enabled_modules.iter().any(|m| m == "priority-support"),
    };

    Entitlement {
        state,
        plan_id: raw.plan_id,
        plan_slug: raw.plan_slug.clone(),
        limits,
        limit_source,
        features,
        enabled_modules,
        computed_at: now,
        expires_at,
        access_allowed,
        blocked_reason,
    }
}

/// Determine the entitlement state from raw data
fn determine_state(
    raw: &RawEntitlementData,
    now: OffsetDateTime,
    past_due_grace_days: i64,
) -> (
    EntitlementState,
    Option<OffsetDateTime>,
    bool,
    Option<String>,
) {
    match raw.subscription_status {
        None => (
            EntitlementState::NoSubscription,
            None,
            false,
            Some("Nenhuma assinatura ativa".to_string()),
        ),
        Some(SubscriptionStatus::Cancelled) => (
            EntitlementState::Cancelled,
            None,
            false,
            Some("Assinatura cancelada".to_string()),
        ),
        Some(SubscriptionStatus::Trial) => {
            match raw.trial_ends_at {
                Some(trial_end) if trial_end > now => (
                    EntitlementState::Trialing,
                    Some(trial_end),
                    true,
                    None,
                ),
                // Expired trial the sweep has not converted yet: treat as
                // active rather than lock the tenant out mid-sweep
                _ => (EntitlementState::Active, None, true, None),
            }
        }
        Some(SubscriptionStatus::Active) => {
            if raw.cancel_at_period_end {
                (
                    EntitlementState::CancelScheduled,
                    raw.current_period_end,
                    true,
                    None,
                )
            } else {
                (EntitlementState::Active, None, true, None)
            }
        }
        Some(SubscriptionStatus::PastDue) => {
            let grace_until = raw
                .current_period_end
                .map(|end| end + Duration::days(past_due_grace_days));
            match grace_until {
                Some(until) if now > until => (
                    EntitlementState::PastDueLocked,
                    Some(until),
                    false,
                    Some("Pagamento pendente; acesso suspenso".to_string()),
                ),
                _ => (
                    EntitlementState::PastDueGrace,
                    grace_until,
                    true,
                    Some("Pagamento pendente; atualize o método de pagamento".to_string()),
                ),
            }
        }
    }
}

/// Entitlement resolver service (read-only)
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    clock: Clock,
    config: BillingConfig,
    usage: UsageMeter,
}

impl EntitlementService {
    pub fn new(pool: PgPool, clock: Clock, config: BillingConfig) -> Self {
        let usage = UsageMeter::new(pool.clone());
        Self {
            pool,
            clock,
            config,
            usage,
        }
    }

    /// Compute the complete entitlement for a tenant.
    ///
    /// This is THE function the application queries before gating features.
    pub async fn compute_entitlement(&self, tenant_id: TenantId) -> BillingResult<Entitlement> {
        let raw = self.load_raw(tenant_id).await?;
        Ok(compute_from_raw(
            &raw,
            self.clock.now(),
            self.config.past_due_grace_days,
        ))
    }

    /// Whether one module is enabled for a tenant
    pub async fn is_module_enabled(
        &self,
        tenant_id: TenantId,
        module_slug: &str,
    ) -> BillingResult<bool> {
        let entitlement = self.compute_entitlement(tenant_id).await?;
        Ok(entitlement.access_allowed && entitlement.is_module_enabled(module_slug))
    }

    /// Limit status for one resource in the current calendar period
    pub async fn check_limit(
        &self,
        tenant_id: TenantId,
        resource: ResourceType,
    ) -> BillingResult<LimitStatus> {
        let period = Period::containing(self.clock.now());
        self.usage.check_limit(tenant_id, resource, period).await
    }

    /// Status of the tenant's most recent subscription
    pub async fn get_subscription_status(
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

    /// Load everything the pure resolver needs in two queries
    async fn load_raw(&self, tenant_id: TenantId) -> BillingResult<RawEntitlementData> {
        use sqlx::Row;

        let tenant_exists: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;
        if tenant_exists == 0 {
            return Err(BillingError::NotFound(format!("tenant {}", tenant_id)));
        }

        let row = sqlx::query(
            r#"
            SELECT
                s.status,
                s.trial_ends_at,
                s.current_period_end,
                COALESCE(s.cancel_at_period_end, false) as cancel_at_period_end,
                p.id as plan_id,
                p.slug as plan_slug,
                p.max_whatsapp_instances, p.max_messages_month, p.max_users,
                p.max_ai_tokens_month, p.max_automations, p.max_storage_bytes,
                p.has_ai, p.has_automations, p.has_calendar_sync, p.has_priority_support,
                p.included_modules,
                o.max_whatsapp_instances as ov_instances,
                o.max_messages_month as ov_messages,
                o.max_users as ov_users,
                o.max_ai_tokens_month as ov_ai_tokens,
                o.max_automations as ov_automations,
                o.max_storage_bytes as ov_storage
            FROM subscriptions s
            JOIN plans p ON p.id = s.plan_id
            LEFT JOIN tenant_overrides o ON o.tenant_id = s.tenant_id
            WHERE s.tenant_id = $1
            ORDER BY s.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let granted_modules: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT m.slug
            FROM module_grants g
            JOIN modules m ON m.id = g.module_id
            WHERE g.tenant_id = $1 AND g.deactivated_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let core_modules: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT slug FROM modules WHERE is_core = true AND is_active = true",
        )
        .fetch_all(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(RawEntitlementData {
                tenant_id,
                subscription_status: None,
                plan_id: None,
                plan_slug: None,
                plan_limits: None,
                plan_features: None,
                plan_included_modules: vec![],
                trial_ends_at: None,
                current_period_end: None,
                cancel_at_period_end: false,
                overrides: TenantOverrides::default(),
                granted_modules,
                core_modules,
            });
        };

        Ok(RawEntitlementData {
            tenant_id,
            subscription_status: Some(row.try_get("status")?),
            plan_id: Some(row.try_get("plan_id")?),
            plan_slug: Some(row.try_get("plan_slug")?),
            plan_limits: Some(PlanLimits {
                max_whatsapp_instances: row.try_get("max_whatsapp_instances")?,
                max_messages_month: row.try_get("max_messages_month")?,
                max_users: row.try_get("max_users")?,
                max_ai_tokens_month: row.try_get("max_ai_tokens_month")?,
                max_automations: row.try_get("max_automations")?,
                max_storage_bytes: row.try_get("max_storage_bytes")?,
            }),
            plan_features: Some(PlanFeatures {
                has_ai: row.try_get("has_ai")?,
                has_automations: row.try_get("has_automations")?,
                has_calendar_sync: row.try_get("has_calendar_sync")?,
                has_priority_support: row.try_get("has_priority_support")?,
            }),
            plan_included_modules: row.try_get("included_modules")?,
            trial_ends_at: row.try_get("trial_ends_at")?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            overrides: TenantOverrides {
                max_whatsapp_instances: row.try_get("ov_instances")?,
                max_messages_month: row.try_get("ov_messages")?,
                max_users: row.try_get("ov_users")?,
                max_ai_tokens_month: row.try_get("ov_ai_tokens")?,
                max_automations: row.try_get("ov_automations")?,
                max_storage_bytes: row.try_get("ov_storage")?,
            },
            granted_modules,
            core_modules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-08-15 12:00 UTC);
    const GRACE_DAYS: i64 = 3;

    fn starter_limits() -> PlanLimits {
        PlanLimits {
            max_whatsapp_instances: 2,
            max_messages_month: 5_000,
            max_users: 5,
            max_ai_tokens_month: 50_000,
            max_automations: 5,
            max_storage_bytes: 5 * 1024 * 1024 * 1024,
        }
    }

    fn raw(status: SubscriptionStatus) -> RawEntitlementData {
        RawEntitlementData {
            tenant_id: TenantId::new(),
            subscription_status: Some(status),
            plan_id: Some(PlanId::new()),
            plan_slug: Some("starter".to_string()),
            plan_limits: Some(starter_limits()),
            plan_features: Some(PlanFeatures {
                has_ai: false,
                has_automations: true,
                has_calendar_sync: false,
                has_priority_support: false,
            }),
            plan_included_modules: vec![],
            trial_ends_at: None,
            current_period_end: Some(datetime!(2026-08-31 00:00 UTC)),
            cancel_at_period_end: false,
            overrides: TenantOverrides::default(),
            granted_modules: vec![],
            core_modules: vec!["inbox".to_string()],
        }
    }

    #[test]
    fn test_active_subscription_has_access() {
        let e = compute_from_raw(&raw(SubscriptionStatus::Active), NOW, GRACE_DAYS);
        assert_eq!(e.state, EntitlementState::Active);
        assert!(e.access_allowed);
        assert!(e.blocked_reason.is_none());
        assert_eq!(e.limits, starter_limits());
        assert_eq!(e.limit_source, LimitSource::Plan);
    }

    #[test]
    fn test_trial_before_expiry() {
        let mut data = raw(SubscriptionStatus::Trial);
        data.trial_ends_at = Some(datetime!(2026-08-20 00:00 UTC));
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert_eq!(e.state, EntitlementState::Trialing);
        assert_eq!(e.expires_at, Some(datetime!(2026-08-20 00:00 UTC)));
        assert!(e.access_allowed);
    }

    #[test]
    fn test_trial_past_expiry_degrades_to_active() {
        let mut data = raw(SubscriptionStatus::Trial);
        data.trial_ends_at = Some(datetime!(2026-08-10 00:00 UTC));
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert_eq!(e.state, EntitlementState::Active);
        assert!(e.access_allowed);
    }

    #[test]
    fn test_cancel_scheduled_keeps_access_until_period_end() {
        let mut data = raw(SubscriptionStatus::Active);
        data.cancel_at_period_end = true;
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert_eq!(e.state, EntitlementState::CancelScheduled);
        assert_eq!(e.expires_at, Some(datetime!(2026-08-31 00:00 UTC)));
        assert!(e.access_allowed);
    }

    #[test]
    fn test_past_due_within_grace_keeps_access() {
        let e = compute_from_raw(&raw(SubscriptionStatus::PastDue), NOW, GRACE_DAYS);
        assert_eq!(e.state, EntitlementState::PastDueGrace);
        assert!(e.access_allowed);
        assert!(e.blocked_reason.is_some());
    }

    #[test]
    fn test_past_due_beyond_grace_locks() {
        let mut data = raw(SubscriptionStatus::PastDue);
        data.current_period_end = Some(datetime!(2026-08-01 00:00 UTC));
        // Now is 14 days past period end, grace is 3
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert_eq!(e.state, EntitlementState::PastDueLocked);
        assert!(!e.access_allowed);
    }

    #[test]
    fn test_cancelled_blocks_access() {
        let e = compute_from_raw(&raw(SubscriptionStatus::Cancelled), NOW, GRACE_DAYS);
        assert_eq!(e.state, EntitlementState::Cancelled);
        assert!(!e.access_allowed);
    }

    #[test]
    fn test_no_subscription_blocks_access() {
        let mut data = raw(SubscriptionStatus::Active);
        data.subscription_status = None;
        data.plan_limits = None;
        data.plan_features = None;
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert_eq!(e.state, EntitlementState::NoSubscription);
        assert!(!e.access_allowed);
        assert_eq!(e.limits.max_messages_month, 0);
    }

    #[test]
    fn test_core_module_always_enabled() {
        let e = compute_from_raw(&raw(SubscriptionStatus::Active), NOW, GRACE_DAYS);
        assert!(e.is_module_enabled("inbox"));
        assert!(!e.is_module_enabled("ai-assistant"));
    }

    #[test]
    fn test_plan_included_module_enabled() {
        let mut data = raw(SubscriptionStatus::Active);
        data.plan_included_modules = vec!["calendar-sync".to_string()];
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert!(e.is_module_enabled("calendar-sync"));
        // Included module widens the feature flag too
        assert!(e.features.has_calendar_sync);
    }

    #[test]
    fn test_granted_module_enabled_and_widens_features() {
        let mut data = raw(SubscriptionStatus::Active);
        data.granted_modules = vec!["ai-assistant".to_string()];
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert!(e.is_module_enabled("ai-assistant"));
        assert!(e.features.has_ai);
    }

    #[test]
    fn test_duplicate_module_sources_deduplicate() {
        let mut data = raw(SubscriptionStatus::Active);
        data.plan_included_modules = vec!["ai-assistant".to_string()];
        data.granted_modules = vec!["ai-assistant".to_string()];
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert_eq!(
            e.enabled_modules
                .iter()
                .filter(|m| m.as_str() == "ai-assistant")
                .count(),
            1
        );
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut data = raw(SubscriptionStatus::Active);
        data.overrides.max_messages_month = Some(50_000);
        let e = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert_eq!(e.limits.max_messages_month, 50_000);
        // Untouched limits stay at plan defaults
        assert_eq!(e.limits.max_users, 5);
        assert_eq!(e.limit_source, LimitSource::Mixed);
    }

    #[test]
    fn test_determinism() {
        let data = raw(SubscriptionStatus::Active);
        let a = compute_from_raw(&data, NOW, GRACE_DAYS);
        let b = compute_from_raw(&data, NOW, GRACE_DAYS);
        assert_eq!(a.state, b.state);
        assert_eq!(a.limits, b.limits);
        assert_eq!(a.enabled_modules, b.enabled_modules);
    }
}
