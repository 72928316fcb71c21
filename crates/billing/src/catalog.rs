//! Plan and module catalog
//!
//! Immutable, versioned definitions of what Atende sells. Publishing a
//! change inserts a new row with a bumped version; subscriptions keep
//! referencing the exact row they were sold under, so a later price or
//! limit change never retroactively alters an existing subscription.

use atende_shared::{BillingCycle, ModuleId, PlanId, ResourceType, UNLIMITED};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Per-resource limits included in a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_whatsapp_instances: i64,
    pub max_messages_month: i64,
    pub max_users: i64,
    pub max_ai_tokens_month: i64,
    pub max_automations: i64,
    pub max_storage_bytes: i64,
}

impl PlanLimits {
    /// Limit for a metered resource type
    pub fn limit_for(&self, resource: ResourceType) -> i64 {
        match resource {
            ResourceType::WhatsappInstances => self.max_whatsapp_instances,
            ResourceType::Messages => self.max_messages_month,
            ResourceType::Users => self.max_users,
            ResourceType::AiTokens => self.max_ai_tokens_month,
            ResourceType::Automations => self.max_automations,
            ResourceType::Storage => self.max_storage_bytes,
        }
    }

    /// Everything unlimited (top tiers)
    pub fn unlimited() -> Self {
        Self {
            max_whatsapp_instances: UNLIMITED,
            max_messages_month: UNLIMITED,
            max_users: UNLIMITED,
            max_ai_tokens_month: UNLIMITED,
            max_automations: UNLIMITED,
            max_storage_bytes: UNLIMITED,
        }
    }
}

/// Feature flags included in a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeatures {
    pub has_ai: bool,
    pub has_automations: bool,
    pub has_calendar_sync: bool,
    pub has_priority_support: bool,
}

/// Price per billing cycle in integer centavos
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPrices {
    pub monthly_cents: i64,
    pub quarterly_cents: i64,
    pub semiannual_cents: i64,
    pub annual_cents: i64,
}

impl PlanPrices {
    pub fn price_for(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.monthly_cents,
            BillingCycle::Quarterly => self.quarterly_cents,
            BillingCycle::Semiannual => self.semiannual_cents,
            BillingCycle::Annual => self.annual_cents,
        }
    }

    /// Derive longer cycles from a monthly price with a flat multiple.
    ///
    /// Seed catalog only; published plans can carry arbitrary per-cycle
    /// prices (e.g. annual discounts).
    pub fn flat_from_monthly(monthly_cents: i64) -> Self {
        Self {
            monthly_cents,
            quarterly_cents: monthly_cents * 3,
            semiannual_cents: monthly_cents * 6,
            annual_cents: monthly_cents * 12,
        }
    }
}

/// Catalog plan entry (immutable once published)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub slug: String,
    pub version: i32,
    pub name: String,
    pub limits: PlanLimits,
    pub prices: PlanPrices,
    pub features: PlanFeatures,
    /// Module slugs included with the plan at no extra charge
    pub included_modules: Vec<String>,
    /// Trial length for new subscriptions; 0 = no trial
    pub trial_days: i32,
    pub is_active: bool,
    pub is_public: bool,
    pub sort_order: i32,
}

impl Plan {
    pub fn price_for(&self, cycle: BillingCycle) -> i64 {
        self.prices.price_for(cycle)
    }

    pub fn includes_module(&self, module_slug: &str) -> bool {
        self.included_modules.iter().any(|m| m == module_slug)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Plan {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            version: row.try_get("version")?,
            name: row.try_get("name")?,
            limits: PlanLimits {
                max_whatsapp_instances: row.try_get("max_whatsapp_instances")?,
                max_messages_month: row.try_get("max_messages_month")?,
                max_users: row.try_get("max_users")?,
                max_ai_tokens_month: row.try_get("max_ai_tokens_month")?,
                max_automations: row.try_get("max_automations")?,
                max_storage_bytes: row.try_get("max_storage_bytes")?,
            },
            prices: PlanPrices {
                monthly_cents: row.try_get("price_monthly_cents")?,
                quarterly_cents: row.try_get("price_quarterly_cents")?,
                semiannual_cents: row.try_get("price_semiannual_cents")?,
                annual_cents: row.try_get("price_annual_cents")?,
            },
            features: PlanFeatures {
                has_ai: row.try_get("has_ai")?,
                has_automations: row.try_get("has_automations")?,
                has_calendar_sync: row.try_get("has_calendar_sync")?,
                has_priority_support: row.try_get("has_priority_support")?,
            },
            included_modules: row.try_get("included_modules")?,
            trial_days: row.try_get("trial_days")?,
            is_active: row.try_get("is_active")?,
            is_public: row.try_get("is_public")?,
            sort_order: row.try_get("sort_order")?,
        })
    }
}

/// Category of an add-on module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModuleCategory {
    Messaging,
    Ai,
    Productivity,
    Capacity,
    Support,
}

/// Optional add-on module (immutable once published)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Module {
    pub id: ModuleId,
    pub slug: String,
    pub version: i32,
    pub name: String,
    pub price_cents: i64,
    /// Billed every cycle vs once at purchase
    pub is_recurring: bool,
    /// Price multiplies by purchased quantity
    pub is_per_unit: bool,
    /// Core modules are enabled for every tenant regardless of plan
    pub is_core: bool,
    pub category: ModuleCategory,
    pub is_active: bool,
}

/// Catalog lookup and publishing service
#[derive(Clone)]
pub struct CatalogService {
    pool: PgPool,
}

impl CatalogService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch a plan row by id, active or not.
    ///
    /// Historical lookups (proration, invoices) must resolve retired
    /// versions that existing subscriptions still reference.
    pub async fn plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::PlanNotFound(plan_id))
    }

    /// Fetch a plan by id, failing unless it is open for new subscriptions
    pub async fn require_active_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        let plan = self.plan(plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::PlanNotFound(plan_id));
        }
        Ok(plan)
    }

    /// Latest active version of a plan by slug
    pub async fn plan_by_slug(&self, slug: &str) -> BillingResult<Plan> {
        sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE slug = $1 AND is_active = true ORDER BY version DESC LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("plan '{}'", slug)))
    }

    /// Plans offered on the public pricing page, in display order
    pub async fn list_public_plans(&self) -> BillingResult<Vec<Plan>> {
        let mut plans = sqlx::query_as::<_, Plan>(
            r#"
            SELECT DISTINCT ON (slug) *
            FROM plans
            WHERE is_active = true AND is_public = true
            ORDER BY slug, version DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        plans.sort_by_key(|p| p.sort_order);
        Ok(plans)
    }

    /// Fetch a module row by id, active or not
    pub async fn module(&self, module_id: ModuleId) -> BillingResult<Module> {
        sqlx::query_as::<_, Module>("SELECT * FROM modules WHERE id = $1")
            .bind(module_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::ModuleNotFound(module_id))
    }

    /// Fetch a module by id, failing unless it is open for purchase
    pub async fn require_active_module(&self, module_id: ModuleId) -> BillingResult<Module> {
        let module = self.module(module_id).await?;
        if !module.is_active {
            return Err(BillingError::ModuleNotFound(module_id));
        }
        Ok(module)
    }

    /// Latest active version of a module by slug
    pub async fn module_by_slug(&self, slug: &str) -> BillingResult<Module> {
        sqlx::query_as::<_, Module>(
            "SELECT * FROM modules WHERE slug = $1 AND is_active = true ORDER BY version DESC LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("module '{}'", slug)))
    }

    /// Core module slugs (enabled for every tenant)
    pub async fn core_module_slugs(&self) -> BillingResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT slug FROM modules WHERE is_core = true AND is_active = true",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Publish a new version of a plan.
    ///
    /// Inserts a fresh row with `version = max(version) + 1` for the slug.
    /// Prior versions stay untouched: existing subscriptions keep their
    /// row, and they remain resolvable by id forever.
    pub async fn publish_plan(&self, draft: PlanDraft) -> BillingResult<Plan> {
        let id = PlanId(Uuid::new_v4());
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (
                id, slug, version, name,
                max_whatsapp_instances, max_messages_month, max_users,
                max_ai_tokens_month, max_automations, max_storage_bytes,
                price_monthly_cents, price_quarterly_cents,
                price_semiannual_cents, price_annual_cents,
                has_ai, has_automations, has_calendar_sync, has_priority_support,
                included_modules, trial_days, is_active, is_public, sort_order
            )
            VALUES (
                $1, $2,
                COALESCE((SELECT MAX(version) FROM plans WHERE slug = $2), 0) + 1,
                $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, true, $20, $21
            )
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&draft.slug)
        .bind(&draft.name)
        .bind(draft.limits.max_whatsapp_instances)
        .bind(draft.limits.max_messages_month)
        .bind(draft.limits.max_users)
        .bind(draft.limits.max_ai_tokens_month)
        .bind(draft.limits.max_automations)
        .bind(draft.limits.max_storage_bytes)
        .bind(draft.prices.monthly_cents)
        .bind(draft.prices.quarterly_cents)
        .bind(draft.prices.semiannual_cents)
        .bind(draft.prices.annual_cents)
        .bind(draft.features.has_ai)
        .bind(draft.features.has_automations)
        .bind(draft.features.has_calendar_sync)
        .bind(draft.features.has_priority_support)
        .bind(&draft.included_modules)
        .bind(draft.trial_days)
        .bind(draft.is_public)
        .bind(draft.sort_order)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            plan_id = %plan.id,
            slug = %plan.slug,
            version = plan.version,
            "Published plan version"
        );
        Ok(plan)
    }

    /// Publish a new version of a module
    pub async fn publish_module(&self, draft: ModuleDraft) -> BillingResult<Module> {
        let id = ModuleId(Uuid::new_v4());
        let module = sqlx::query_as::<_, Module>(
            r#"
            INSERT INTO modules (
                id, slug, version, name, price_cents,
                is_recurring, is_per_unit, is_core, category, is_active
            )
            VALUES (
                $1, $2,
                COALESCE((SELECT MAX(version) FROM modules WHERE slug = $2), 0) + 1,
                $3, $4, $5, $6, $7, $8, true
            )
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&draft.slug)
        .bind(&draft.name)
        .bind(draft.price_cents)
        .bind(draft.is_recurring)
        .bind(draft.is_per_unit)
        .bind(draft.is_core)
        .bind(draft.category)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            module_id = %module.id,
            slug = %module.slug,
            version = module.version,
            "Published module version"
        );
        Ok(module)
    }

    /// Stop selling a plan. Existing subscriptions are unaffected.
    pub async fn retire_plan(&self, plan_id: PlanId) -> BillingResult<()> {
        let rows = sqlx::query("UPDATE plans SET is_active = false WHERE id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(BillingError::PlanNotFound(plan_id));
        }
        tracing::info!(plan_id = %plan_id, "Retired plan version");
        Ok(())
    }
}

/// Input for publishing a plan version (id/version assigned on insert)
#[derive(Debug, Clone)]
pub struct PlanDraft {
    pub slug: String,
    pub name: String,
    pub limits: PlanLimits,
    pub prices: PlanPrices,
    pub features: PlanFeatures,
    pub included_modules: Vec<String>,
    pub trial_days: i32,
    pub is_public: bool,
    pub sort_order: i32,
}

/// Input for publishing a module version
#[derive(Debug, Clone)]
pub struct ModuleDraft {
    pub slug: String,
    pub name: String,
    pub price_cents: i64,
    pub is_recurring: bool,
    pub is_per_unit: bool,
    pub is_core: bool,
    pub category: ModuleCategory,
}

// =============================================================================
// Overage rates
// =============================================================================

/// Overage pricing per resource type.
///
/// Usage past a plan limit is billed at these rates on the period invoice.
/// Batched resources round the overage up to whole batches before pricing.
#[derive(Debug, Clone)]
pub struct OverageRates {
    /// Centavos per 1,000 messages over limit
    pub messages_per_1k_cents: i64,
    /// Centavos per 1,000 AI tokens over limit
    pub ai_tokens_per_1k_cents: i64,
    /// Centavos per GiB of storage over limit
    pub storage_per_gib_cents: i64,
    /// Centavos per extra WhatsApp instance
    pub instance_unit_cents: i64,
    /// Centavos per extra active automation
    pub automation_unit_cents: i64,
    /// Centavos per extra user seat
    pub user_unit_cents: i64,
}

const GIB: i64 = 1024 * 1024 * 1024;

impl Default for OverageRates {
    fn default() -> Self {
        Self {
            messages_per_1k_cents: 10,
            ai_tokens_per_1k_cents: 20,
            storage_per_gib_cents: 50,
            instance_unit_cents: 1_500,
            automation_unit_cents: 200,
            user_unit_cents: 500,
        }
    }
}

impl OverageRates {
    /// Load rates from environment or use defaults
    ///
    /// - `OVERAGE_RATE_MESSAGES_1K_CENTS` (default: 10)
    /// - `OVERAGE_RATE_AI_TOKENS_1K_CENTS` (default: 20)
    /// - `OVERAGE_RATE_STORAGE_GIB_CENTS` (default: 50)
    /// - `OVERAGE_RATE_INSTANCE_CENTS` (default: 1500)
    /// - `OVERAGE_RATE_AUTOMATION_CENTS` (default: 200)
    /// - `OVERAGE_RATE_USER_CENTS` (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            messages_per_1k_cents: env_rate(
                "OVERAGE_RATE_MESSAGES_1K_CENTS",
                defaults.messages_per_1k_cents,
            ),
            ai_tokens_per_1k_cents: env_rate(
                "OVERAGE_RATE_AI_TOKENS_1K_CENTS",
                defaults.ai_tokens_per_1k_cents,
            ),
            storage_per_gib_cents: env_rate(
                "OVERAGE_RATE_STORAGE_GIB_CENTS",
                defaults.storage_per_gib_cents,
            ),
            instance_unit_cents: env_rate("OVERAGE_RATE_INSTANCE_CENTS", defaults.instance_unit_cents),
            automation_unit_cents: env_rate(
                "OVERAGE_RATE_AUTOMATION_CENTS",
                defaults.automation_unit_cents,
            ),
            user_unit_cents: env_rate("OVERAGE_RATE_USER_CENTS", defaults.user_unit_cents),
        }
    }

    /// Charge in centavos for an overage amount of a resource.
    ///
    /// Batched resources (messages, tokens per 1k; storage per GiB) round
    /// the overage up to whole batches. Overflow is an error, never a
    /// silent cap.
    pub fn overage_charge_cents(
        &self,
        resource: ResourceType,
        overage_count: i64,
    ) -> BillingResult<i64> {
        if overage_count <= 0 {
            return Ok(0);
        }
        let (rate, batch) = match resource {
            ResourceType::Messages => (self.messages_per_1k_cents, 1_000),
            ResourceType::AiTokens => (self.ai_tokens_per_1k_cents, 1_000),
            ResourceType::Storage => (self.storage_per_gib_cents, GIB),
            ResourceType::WhatsappInstances => (self.instance_unit_cents, 1),
            ResourceType::Automations => (self.automation_unit_cents, 1),
            ResourceType::Users => (self.user_unit_cents, 1),
        };
        // Round up to whole batches
        let batches = overage_count
            .checked_add(batch - 1)
            .ok_or(BillingError::ArithmeticOverflow("overage batch rounding"))?
            / batch;
        batches
            .checked_mul(rate)
            .ok_or(BillingError::ArithmeticOverflow("overage charge"))
    }
}

fn env_rate(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// =============================================================================
// Seed catalog
// =============================================================================

/// Built-in catalog used for initial seeding and tests
pub mod seed {
    use super::*;

    /// Free: 1 instance, trial-sized limits, no paid features
    pub fn free() -> PlanDraft {
        PlanDraft {
            slug: "free".to_string(),
            name: "Gratuito".to_string(),
            limits: PlanLimits {
                max_whatsapp_instances: 1,
                max_messages_month: 500,
                max_users: 2,
                max_ai_tokens_month: 0,
                max_automations: 0,
                max_storage_bytes: GIB,
            },
            prices: PlanPrices::flat_from_monthly(0),
            features: PlanFeatures {
                has_ai: false,
                has_automations: false,
                has_calendar_sync: false,
                has_priority_support: false,
            },
            included_modules: vec![],
            trial_days: 0,
            is_public: true,
            sort_order: 0,
        }
    }

    /// Starter: R$99,00/month, 2 instances, 5K messages
    pub fn starter() -> PlanDraft {
        PlanDraft {
            slug: "starter".to_string(),
            name: "Starter".to_string(),
            limits: PlanLimits {
                max_whatsapp_instances: 2,
                max_messages_month: 5_000,
                max_users: 5,
                max_ai_tokens_month: 50_000,
                max_automations: 5,
                max_storage_bytes: 5 * GIB,
            },
            prices: PlanPrices::flat_from_monthly(9_900),
            features: PlanFeatures {
                has_ai: false,
                has_automations: true,
                has_calendar_sync: false,
                has_priority_support: false,
            },
            included_modules: vec![],
            trial_days: 14,
            is_public: true,
            sort_order: 1,
        }
    }

    /// Professional: R$199,00/month, 5 instances, 25K messages, AI included
    pub fn professional() -> PlanDraft {
        PlanDraft {
            slug: "professional".to_string(),
            name: "Professional".to_string(),
            limits: PlanLimits {
                max_whatsapp_instances: 5,
                max_messages_month: 25_000,
                max_users: 15,
                max_ai_tokens_month: 500_000,
                max_automations: 25,
                max_storage_bytes: 20 * GIB,
            },
            prices: PlanPrices::flat_from_monthly(19_900),
            features: PlanFeatures {
                has_ai: true,
                has_automations: true,
                has_calendar_sync: true,
                has_priority_support: false,
            },
            included_modules: vec!["ai-assistant".to_string(), "calendar-sync".to_string()],
            trial_days: 14,
            is_public: true,
            sort_order: 2,
        }
    }

    /// Business: R$499,00/month, unlimited everything, all features
    pub fn business() -> PlanDraft {
        PlanDraft {
            slug: "business".to_string(),
            name: "Business".to_string(),
            limits: PlanLimits::unlimited(),
            prices: PlanPrices::flat_from_monthly(49_900),
            features: PlanFeatures {
                has_ai: true,
                has_automations: true,
                has_calendar_sync: true,
                has_priority_support: true,
            },
            included_modules: vec![
                "ai-assistant".to_string(),
                "calendar-sync".to_string(),
                "priority-support".to_string(),
            ],
            trial_days: 14,
            is_public: true,
            sort_order: 3,
        }
    }

    /// Standard module set
    pub fn modules() -> Vec<ModuleDraft> {
        vec![
            ModuleDraft {
                slug: "ai-assistant".to_string(),
                name: "Assistente IA".to_string(),
                price_cents: 4_900,
                is_recurring: true,
                is_per_unit: false,
                is_core: false,
                category: ModuleCategory::Ai,
            },
            ModuleDraft {
                slug: "calendar-sync".to_string(),
                name: "Sincronização de Agenda".to_string(),
                price_cents: 1_900,
                is_recurring: true,
                is_per_unit: false,
                is_core: false,
                category: ModuleCategory::Productivity,
            },
            ModuleDraft {
                slug: "extra-instance".to_string(),
                name: "Instância WhatsApp Adicional".to_string(),
                price_cents: 3_900,
                is_recurring: true,
                is_per_unit: true,
                is_core: false,
                category: ModuleCategory::Capacity,
            },
            ModuleDraft {
                slug: "priority-support".to_string(),
                name: "Suporte Prioritário".to_string(),
                price_cents: 2_900,
                is_recurring: true,
                is_per_unit: false,
                is_core: false,
                category: ModuleCategory::Support,
            },
            ModuleDraft {
                slug: "onboarding".to_string(),
                name: "Onboarding Assistido".to_string(),
                price_cents: 19_900,
                is_recurring: false,
                is_per_unit: false,
                is_core: false,
                category: ModuleCategory::Support,
            },
            // Inbox is part of the product itself, not a paid add-on
            ModuleDraft {
                slug: "inbox".to_string(),
                name: "Caixa de Entrada".to_string(),
                price_cents: 0,
                is_recurring: false,
                is_per_unit: false,
                is_core: true,
                category: ModuleCategory::Messaging,
            },
        ]
    }

    /// All built-in plan drafts in display order
    pub fn plans() -> Vec<PlanDraft> {
        vec![free(), starter(), professional(), business()]
    }
}

impl CatalogService {
    /// Publish the built-in catalog if the store is empty.
    ///
    /// Idempotent: an existing catalog (any plan row) short-circuits.
    pub async fn seed_builtin(&self) -> BillingResult<()> {
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plans")
            .fetch_one(&self.pool)
            .await?;
        if existing > 0 {
            return Ok(());
        }
        for draft in seed::modules() {
            self.publish_module(draft).await?;
        }
        for draft in seed::plans() {
            self.publish_plan(draft).await?;
        }
        tracing::info!("Seeded built-in catalog");
        Ok(())
    }
}
