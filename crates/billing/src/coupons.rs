//! Coupon validation and redemption
//!
//! Validation is a soft check (`valid = false` plus a message, never an
//! error) so the UI can show a specific reason. Redemption is a single
//! guarded UPDATE (a compare-and-swap, not read-then-write), so two
//! callers racing for the last use of a coupon resolve to exactly one
//! winner; the loser gets `CouponExhausted`.

use atende_shared::TenantId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};

/// Discount shape of a coupon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// `discount_value` is a percentage of the subtotal (0-100)
    Percentage,
    /// `discount_value` is centavos, capped at the subtotal
    Fixed,
}

/// Coupon definition
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    /// 0 = unlimited
    pub max_uses: i64,
    pub used_count: i64,
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

/// Outcome of validating a coupon against a subtotal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponValidation {
    pub valid: bool,
    pub discount_cents: i64,
    pub message: Option<String>,
}

impl CouponValidation {
    fn rejected(message: &str) -> Self {
        Self {
            valid: false,
            discount_cents: 0,
            message: Some(message.to_string()),
        }
    }
}

/// Discount in centavos for a coupon against a subtotal.
///
/// Percentage discounts round down; fixed discounts cap at the subtotal so
/// a coupon can never drive a total negative.
pub fn discount_cents(discount_type: DiscountType, discount_value: i64, subtotal_cents: i64) -> i64 {
    if subtotal_cents <= 0 || discount_value <= 0 {
        return 0;
    }
    match discount_type {
        DiscountType::Percentage => {
            let pct = discount_value.min(100);
            ((subtotal_cents as i128 * pct as i128) / 100) as i64
        }
        DiscountType::Fixed => discount_value.min(subtotal_cents),
    }
}

/// Pure validation against a loaded coupon row (`None` = unknown code)
pub fn validate_coupon(
    coupon: Option<&Coupon>,
    subtotal_cents: i64,
    now: OffsetDateTime,
) -> CouponValidation {
    let Some(coupon) = coupon else {
        return CouponValidation::rejected("Cupom não encontrado");
    };
    if !coupon.is_active {
        return CouponValidation::rejected("Cupom desativado");
    }
    if let Some(expires_at) = coupon.expires_at {
        if expires_at <= now {
            return CouponValidation::rejected("Cupom expirado");
        }
    }
    if coupon.max_uses > 0 && coupon.used_count >= coupon.max_uses {
        return CouponValidation::rejected("Cupom esgotado");
    }
    CouponValidation {
        valid: true,
        discount_cents: discount_cents(coupon.discount_type, coupon.discount_value, subtotal_cents),
        message: None,
    }
}

/// Coupon service
#[derive(Clone)]
pub struct CouponService {
    pool: PgPool,
    clock: Clock,
    event_logger: BillingEventLogger,
}

impl CouponService {
    pub fn new(pool: PgPool, clock: Clock) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            clock,
            event_logger,
        }
    }

    /// Look up a coupon by code
    pub async fn get(&self, code: &str) -> BillingResult<Option<Coupon>> {
        Ok(sqlx::query_as("SELECT * FROM coupons WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Validate a code against a subtotal. Soft failure only.
    pub async fn validate(&self, code: &str, subtotal_cents: i64) -> BillingResult<CouponValidation> {
        let coupon = self.get(code).await?;
        Ok(validate_coupon(coupon.as_ref(), subtotal_cents, self.clock.now()))
    }

    /// Atomically consume one use of a coupon.
    ///
    /// The guarded UPDATE is the only write path for `used_count`, so a
    /// race between validate and redeem resolves here: whoever loses the
    /// last use gets `CouponExhausted`.
    pub async fn redeem(&self, tenant_id: TenantId, code: &str) -> BillingResult<Coupon> {
        let now = self.clock.now();
        let redeemed: Option<Coupon> = sqlx::query_as(
            r#"
            UPDATE coupons
            SET used_count = used_count + 1
            WHERE code = $1
              AND is_active = true
              AND (expires_at IS NULL OR expires_at > $2)
              AND (max_uses = 0 OR used_count < max_uses)
            RETURNING *
            "#,
        )
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(coupon) = redeemed else {
            // Distinguish exhaustion from the other rejection reasons
            let current = self.get(code).await?;
            return match current {
                Some(c)
                    if c.is_active
                        && c.expires_at.map_or(true, |e| e > now)
                        && c.max_uses > 0
                        && c.used_count >= c.max_uses =>
                {
                    Err(BillingError::CouponExhausted {
                        code: code.to_string(),
                    })
                }
                _ => Err(BillingError::CouponInvalid(code.to_string())),
            };
        };

        tracing::info!(
            tenant_id = %tenant_id,
            code = %code,
            used_count = coupon.used_count,
            "Coupon redeemed"
        );
        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::CouponRedeemed).data(
                    serde_json::json!({
                        "code": code,
                        "used_count": coupon.used_count,
                    }),
                ),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log coupon redemption event");
        }
        Ok(coupon)
    }

    /// Return one use of a coupon.
    ///
    /// Compensation for a redeem whose enclosing operation failed before
    /// committing; guarded so the count never goes below zero.
    pub async fn release(&self, code: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE coupons
            SET used_count = used_count - 1
            WHERE code = $1 AND used_count > 0
            "#,
        )
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create a coupon (admin surface)
    pub async fn create(&self, draft: CouponDraft) -> BillingResult<Coupon> {
        let coupon: Coupon = sqlx::query_as(
            r#"
            INSERT INTO coupons (
                id, code, discount_type, discount_value,
                max_uses, used_count, expires_at, is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, true, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.code)
        .bind(draft.discount_type)
        .bind(draft.discount_value)
        .bind(draft.max_uses)
        .bind(draft.expires_at)
        .fetch_one(&self.pool)
        .await?;
        tracing::info!(code = %coupon.code, "Coupon created");
        Ok(coupon)
    }

    /// Deactivate a coupon without touching its history
    pub async fn deactivate(&self, code: &str) -> BillingResult<()> {
        let rows = sqlx::query("UPDATE coupons SET is_active = false WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(BillingError::NotFound(format!("coupon '{}'", code)));
        }
        Ok(())
    }
}

/// Input for creating a coupon
#[derive(Debug, Clone)]
pub struct CouponDraft {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub max_uses: i64,
    pub expires_at: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-08-15 12:00 UTC);

    fn coupon(discount_type: DiscountType, value: i64) -> Coupon {
        Coupon {
            id: Uuid::new_v4(),
            code: "WELCOME10".to_string(),
            discount_type,
            discount_value: value,
            max_uses: 100,
            used_count: 0,
            expires_at: None,
            is_active: true,
            created_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_unknown_code_rejected_softly() {
        let result = validate_coupon(None, 10_000, NOW);
        assert!(!result.valid);
        assert_eq!(result.discount_cents, 0);
        assert!(result.message.is_some());
    }

    #[test]
    fn test_inactive_coupon_rejected() {
        let mut c = coupon(DiscountType::Percentage, 10);
        c.is_active = false;
        assert!(!validate_coupon(Some(&c), 10_000, NOW).valid);
    }

    #[test]
    fn test_expired_coupon_rejected() {
        let mut c = coupon(DiscountType::Percentage, 10);
        c.expires_at = Some(datetime!(2026-08-01 00:00 UTC));
        assert!(!validate_coupon(Some(&c), 10_000, NOW).valid);
        // Still valid right before expiry
        c.expires_at = Some(datetime!(2026-08-15 12:00:01 UTC));
        assert!(validate_coupon(Some(&c), 10_000, NOW).valid);
    }

    #[test]
    fn test_exhausted_coupon_rejected() {
        let mut c = coupon(DiscountType::Percentage, 10);
        c.max_uses = 5;
        c.used_count = 5;
        assert!(!validate_coupon(Some(&c), 10_000, NOW).valid);
    }

    #[test]
    fn test_zero_max_uses_is_unlimited() {
        let mut c = coupon(DiscountType::Percentage, 10);
        c.max_uses = 0;
        c.used_count = 1_000_000;
        assert!(validate_coupon(Some(&c), 10_000, NOW).valid);
    }

    #[test]
    fn test_percentage_discount_rounds_down() {
        // 10% of 9999 = 999.9 -> 999
        assert_eq!(discount_cents(DiscountType::Percentage, 10, 9_999), 999);
        assert_eq!(discount_cents(DiscountType::Percentage, 50, 19_900), 9_950);
    }

    #[test]
    fn test_fixed_discount_caps_at_subtotal() {
        assert_eq!(discount_cents(DiscountType::Fixed, 5_000, 3_000), 3_000);
        assert_eq!(discount_cents(DiscountType::Fixed, 5_000, 10_000), 5_000);
    }

    #[test]
    fn test_discount_never_negative() {
        assert_eq!(discount_cents(DiscountType::Fixed, 5_000, 0), 0);
        assert_eq!(discount_cents(DiscountType::Percentage, 10, -100), 0);
        assert_eq!(discount_cents(DiscountType::Fixed, -500, 1_000), 0);
    }

    #[test]
    fn test_percentage_over_100_caps_at_subtotal() {
        assert_eq!(discount_cents(DiscountType::Percentage, 250, 4_000), 4_000);
    }
}
