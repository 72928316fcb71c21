//! Billing error taxonomy
//!
//! Business-rule failures are typed and non-retryable; callers map them to
//! their own surface (4xx-equivalents). Arithmetic overflow in monetary
//! computation is fatal and never clamped.

use atende_shared::{ModuleId, PlanId, SubscriptionStatus};

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the billing core
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// The subscription state does not permit the requested operation
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Referenced plan does not exist or is not active
    #[error("plan not found or inactive: {0}")]
    PlanNotFound(PlanId),

    /// Referenced module does not exist or is not active
    #[error("module not found or inactive: {0}")]
    ModuleNotFound(ModuleId),

    /// Credit consumption exceeds the tenant's non-expired balance
    #[error("insufficient credit: balance {available} cents, requested {requested} cents")]
    InsufficientCredit { available: i64, requested: i64 },

    /// A concurrent redeem won the last remaining coupon use
    #[error("coupon exhausted: {code}")]
    CouponExhausted { code: String },

    /// Coupon cannot be redeemed (unknown, inactive, or expired)
    #[error("coupon invalid: {0}")]
    CouponInvalid(String),

    /// A concurrent writer modified the row between read and write
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Usage deltas must be positive; counters never decrease in-period
    #[error("invalid usage delta: {0}")]
    InvalidUsageDelta(i64),

    /// Monetary amounts passed to grants/consumptions must be positive
    #[error("invalid amount {amount} for {context}")]
    InvalidAmount { amount: i64, context: &'static str },

    /// Monetary computation overflowed. Fatal: clamping would corrupt
    /// financial records.
    #[error("arithmetic overflow in {0}")]
    ArithmeticOverflow(&'static str),

    /// Entity lookup failed
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage layer failure
    #[error("database error: {0}")]
    Database(String),
}

impl BillingError {
    /// Convenience constructor for transition violations
    pub fn invalid_transition(from: SubscriptionStatus, operation: &str) -> Self {
        Self::InvalidTransition(format!(
            "subscription is {} and does not permit {}",
            from, operation
        ))
    }

    /// Whether retrying the same call could ever succeed.
    ///
    /// Only lost optimistic locks qualify; every business-rule failure is
    /// final until the caller changes something.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = BillingError::invalid_transition(SubscriptionStatus::Cancelled, "change_plan");
        assert_eq!(
            err.to_string(),
            "invalid transition: subscription is cancelled and does not permit change_plan"
        );
    }

    #[test]
    fn test_only_concurrent_modification_is_retryable() {
        assert!(BillingError::ConcurrentModification("retry".into()).is_retryable());
        assert!(!BillingError::CouponExhausted {
            code: "WELCOME".into()
        }
        .is_retryable());
        assert!(!BillingError::InsufficientCredit {
            available: 100,
            requested: 200
        }
        .is_retryable());
        assert!(!BillingError::ArithmeticOverflow("prorate").is_retryable());
    }
}
