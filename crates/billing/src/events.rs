//! Billing audit events
//!
//! Append-only record of every externally visible billing mutation.
//! Event logging is best-effort: call sites warn on failure rather than
//! fail the mutation that already committed.

use atende_shared::TenantId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Who triggered a billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Admin,
    System,
}

/// Typed billing event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    SubscriptionCreated,
    PlanChanged,
    PlanChangeScheduled,
    SubscriptionCancelled,
    CancellationScheduled,
    SubscriptionReactivated,
    PeriodAdvanced,
    TrialEnded,
    PaymentFailed,
    PaymentRecovered,
    CreditGranted,
    CreditConsumed,
    CouponRedeemed,
    ModulePurchased,
    ModuleRemoved,
    InvoiceCreated,
    InvoicePaid,
    InvoiceOverdue,
    InvoiceCancelled,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated => "subscription_created",
            Self::PlanChanged => "plan_changed",
            Self::PlanChangeScheduled => "plan_change_scheduled",
            Self::SubscriptionCancelled => "subscription_cancelled",
            Self::CancellationScheduled => "cancellation_scheduled",
            Self::SubscriptionReactivated => "subscription_reactivated",
            Self::PeriodAdvanced => "period_advanced",
            Self::TrialEnded => "trial_ended",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentRecovered => "payment_recovered",
            Self::CreditGranted => "credit_granted",
            Self::CreditConsumed => "credit_consumed",
            Self::CouponRedeemed => "coupon_redeemed",
            Self::ModulePurchased => "module_purchased",
            Self::ModuleRemoved => "module_removed",
            Self::InvoiceCreated => "invoice_created",
            Self::InvoicePaid => "invoice_paid",
            Self::InvoiceOverdue => "invoice_overdue",
            Self::InvoiceCancelled => "invoice_cancelled",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recorded billing event
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub created_at: OffsetDateTime,
}

/// Builder for a billing event
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    tenant_id: TenantId,
    event_type: BillingEventType,
    data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(tenant_id: TenantId, event_type: BillingEventType) -> Self {
        Self {
            tenant_id,
            event_type,
            data: serde_json::Value::Null,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Attach an actor when one is known; the actor type applies either way
    pub fn actor_opt(mut self, actor_id: Option<Uuid>, actor_type: ActorType) -> Self {
        self.actor_id = actor_id;
        self.actor_type = actor_type;
        self
    }
}

/// Service appending billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (id, tenant_id, event_type, data, actor_id, actor_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(builder.tenant_id)
        .bind(builder.event_type.as_str())
        .bind(&builder.data)
        .bind(builder.actor_id)
        .bind(builder.actor_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recent events for a tenant, newest first
    pub async fn recent_events(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, tenant_id, event_type, data, actor_id, actor_type, created_at
            FROM billing_events
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings_are_snake_case() {
        assert_eq!(BillingEventType::PlanChanged.as_str(), "plan_changed");
        assert_eq!(
            BillingEventType::SubscriptionReactivated.as_str(),
            "subscription_reactivated"
        );
        assert_eq!(BillingEventType::CouponRedeemed.as_str(), "coupon_redeemed");
    }

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let builder = BillingEventBuilder::new(TenantId::new(), BillingEventType::PeriodAdvanced);
        assert_eq!(builder.actor_type, ActorType::System);
        assert!(builder.actor_id.is_none());
    }
}
