//! Proration calculator
//!
//! Pure integer arithmetic for mid-cycle plan changes. All values are
//! centavos; the remaining-period fraction is computed in whole seconds
//! (truncated, never rounded up, so a tenant is never over-credited) and
//! applied with banker's rounding. No floating point anywhere: this is a
//! correctness requirement for the financial records, not a style choice.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Monetary outcome of a plan change at a point in the period.
///
/// At most one of the two fields is non-zero: an upgrade produces an
/// `amount_due` invoice adjustment, a downgrade or cancellation produces a
/// `credit_granted` ledger grant, and a same-price lateral move produces
/// neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrationResult {
    /// Centavos to invoice now (upgrade)
    pub amount_due: i64,
    /// Centavos to credit to the ledger (downgrade / cancellation)
    pub credit_granted: i64,
}

impl ProrationResult {
    pub const ZERO: Self = Self {
        amount_due: 0,
        credit_granted: 0,
    };

    pub fn is_upgrade(&self) -> bool {
        self.amount_due > 0
    }

    pub fn is_downgrade(&self) -> bool {
        self.credit_granted > 0
    }
}

/// Compute the monetary delta for swapping `old_price_cents` for
/// `new_price_cents` with the period `[period_start, period_end)` partially
/// elapsed at `now`.
///
/// `new_price_cents = None` models cancellation: the whole unused value of
/// the old plan comes back as credit.
///
/// `now` outside the period clamps the remaining fraction: before the start
/// nothing has elapsed (full swap), after the end nothing remains (no
/// money moves). A degenerate period (`period_end <= period_start`) has no
/// remaining value and also moves no money.
pub fn prorate(
    old_price_cents: i64,
    new_price_cents: Option<i64>,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> BillingResult<ProrationResult> {
    let total_secs = (period_end - period_start).whole_seconds();
    if total_secs <= 0 {
        return Ok(ProrationResult::ZERO);
    }
    let remaining_secs = (period_end - now).whole_seconds().clamp(0, total_secs);

    let unused_old_value = mul_div_half_even(old_price_cents, remaining_secs, total_secs)?;
    let prorated_new_cost = match new_price_cents {
        Some(price) => mul_div_half_even(price, remaining_secs, total_secs)?,
        None => 0,
    };

    if prorated_new_cost > unused_old_value {
        Ok(ProrationResult {
            amount_due: prorated_new_cost - unused_old_value,
            credit_granted: 0,
        })
    } else {
        Ok(ProrationResult {
            amount_due: 0,
            credit_granted: unused_old_value - prorated_new_cost,
        })
    }
}

/// `value * num / den` with round-half-to-even, computed through i128.
///
/// Inputs are non-negative and `den > 0` (enforced by the caller); the
/// i128 product of two i64 values cannot overflow, so the only overflow
/// point is the narrowing back to i64, which is an error, never a clamp.
fn mul_div_half_even(value: i64, num: i64, den: i64) -> BillingResult<i64> {
    let product = (value as i128) * (num as i128);
    let den = den as i128;
    let quotient = product / den;
    let remainder = product % den;
    let rounded = match (remainder * 2).cmp(&den) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal => {
            if quotient % 2 == 0 {
                quotient
            } else {
                quotient + 1
            }
        }
    };
    i64::try_from(rounded).map_err(|_| BillingError::ArithmeticOverflow("proration"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const PERIOD_START: OffsetDateTime = datetime!(2026-08-01 00:00 UTC);
    const PERIOD_END: OffsetDateTime = datetime!(2026-08-31 00:00 UTC);
    const MIDPOINT: OffsetDateTime = datetime!(2026-08-16 00:00 UTC);

    const STARTER_MONTHLY: i64 = 9_900;
    const PROFESSIONAL_MONTHLY: i64 = 19_900;

    #[test]
    fn test_upgrade_at_midpoint() {
        // Starter -> Professional halfway through a 30-day period:
        // unused 4950, prorated new 9950, due 5000
        let result = prorate(
            STARTER_MONTHLY,
            Some(PROFESSIONAL_MONTHLY),
            PERIOD_START,
            PERIOD_END,
            MIDPOINT,
        )
        .unwrap();
        assert_eq!(result.amount_due, 5_000);
        assert_eq!(result.credit_granted, 0);
        assert!(result.is_upgrade());
    }

    #[test]
    fn test_downgrade_at_midpoint() {
        let result = prorate(
            PROFESSIONAL_MONTHLY,
            Some(STARTER_MONTHLY),
            PERIOD_START,
            PERIOD_END,
            MIDPOINT,
        )
        .unwrap();
        assert_eq!(result.amount_due, 0);
        assert_eq!(result.credit_granted, 5_000);
        assert!(result.is_downgrade());
    }

    #[test]
    fn test_cancellation_with_ten_days_left() {
        // 10 of 30 days remaining on Professional: 19900 * 10/30 = 6633.33 -> 6633
        let now = datetime!(2026-08-21 00:00 UTC);
        let result = prorate(PROFESSIONAL_MONTHLY, None, PERIOD_START, PERIOD_END, now).unwrap();
        assert_eq!(result.amount_due, 0);
        assert_eq!(result.credit_granted, 6_633);
    }

    #[test]
    fn test_lateral_move_is_zero_both_ways() {
        let result = prorate(
            STARTER_MONTHLY,
            Some(STARTER_MONTHLY),
            PERIOD_START,
            PERIOD_END,
            MIDPOINT,
        )
        .unwrap();
        assert_eq!(result, ProrationResult::ZERO);
    }

    #[test]
    fn test_at_most_one_side_nonzero() {
        // Sweep a grid of price pairs and instants: amount_due and
        // credit_granted are never both positive
        let prices = [0, 990, 9_900, 19_900, 49_900];
        let instants = [
            datetime!(2026-08-01 00:00:01 UTC),
            datetime!(2026-08-10 13:37 UTC),
            MIDPOINT,
            datetime!(2026-08-30 23:59:59 UTC),
        ];
        for old in prices {
            for new in prices {
                for now in instants {
                    let r = prorate(old, Some(new), PERIOD_START, PERIOD_END, now).unwrap();
                    assert!(
                        r.amount_due == 0 || r.credit_granted == 0,
                        "both sides nonzero for old={} new={} now={}",
                        old,
                        new,
                        now
                    );
                }
            }
        }
    }

    #[test]
    fn test_now_at_period_start_swaps_full_price() {
        let result = prorate(
            STARTER_MONTHLY,
            Some(PROFESSIONAL_MONTHLY),
            PERIOD_START,
            PERIOD_END,
            PERIOD_START,
        )
        .unwrap();
        assert_eq!(result.amount_due, PROFESSIONAL_MONTHLY - STARTER_MONTHLY);
    }

    #[test]
    fn test_now_at_period_end_moves_nothing() {
        let result = prorate(
            STARTER_MONTHLY,
            Some(PROFESSIONAL_MONTHLY),
            PERIOD_START,
            PERIOD_END,
            PERIOD_END,
        )
        .unwrap();
        assert_eq!(result, ProrationResult::ZERO);
    }

    #[test]
    fn test_now_outside_period_is_clamped() {
        let before = prorate(
            STARTER_MONTHLY,
            None,
            PERIOD_START,
            PERIOD_END,
            datetime!(2026-07-15 00:00 UTC),
        )
        .unwrap();
        assert_eq!(before.credit_granted, STARTER_MONTHLY);

        let after = prorate(
            STARTER_MONTHLY,
            None,
            PERIOD_START,
            PERIOD_END,
            datetime!(2026-09-15 00:00 UTC),
        )
        .unwrap();
        assert_eq!(after, ProrationResult::ZERO);
    }

    #[test]
    fn test_degenerate_period_moves_nothing() {
        let result = prorate(
            STARTER_MONTHLY,
            Some(PROFESSIONAL_MONTHLY),
            PERIOD_END,
            PERIOD_START,
            MIDPOINT,
        )
        .unwrap();
        assert_eq!(result, ProrationResult::ZERO);
    }

    #[test]
    fn test_remaining_fraction_truncates_seconds() {
        // 100-second period, 33.x seconds remaining: sub-second remainder
        // truncates, so 100 cents prorate to exactly 33
        let start = datetime!(2026-08-01 00:00:00 UTC);
        let end = datetime!(2026-08-01 00:01:40 UTC);
        let now = datetime!(2026-08-01 00:01:06.300 UTC);
        let result = prorate(100, None, start, end, now).unwrap();
        assert_eq!(result.credit_granted, 33);
    }

    #[test]
    fn test_bankers_rounding_ties_go_even() {
        // 1 cent over half a period: 0.5 rounds to 0 (even)
        assert_eq!(mul_div_half_even(1, 1, 2).unwrap(), 0);
        // 1.5 rounds to 2 (even), not 1
        assert_eq!(mul_div_half_even(3, 1, 2).unwrap(), 2);
        // 2.5 rounds to 2 (even), not 3
        assert_eq!(mul_div_half_even(5, 1, 2).unwrap(), 2);
        // Non-ties round nearest as usual
        assert_eq!(mul_div_half_even(100, 1, 3).unwrap(), 33);
        assert_eq!(mul_div_half_even(200, 1, 3).unwrap(), 67);
    }

    #[test]
    fn test_large_values_do_not_overflow_internally() {
        // A year-long period in seconds against a large price exercises the
        // i128 intermediate path
        let start = datetime!(2026-01-01 00:00 UTC);
        let end = datetime!(2027-01-01 00:00 UTC);
        let now = datetime!(2026-07-02 00:00 UTC);
        let result = prorate(i64::MAX / 4, None, start, end, now).unwrap();
        assert!(result.credit_granted > 0);
        assert!(result.credit_granted < i64::MAX / 4);
    }
}
