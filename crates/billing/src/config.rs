//! Billing configuration
//!
//! Policy knobs read from the environment once at service construction.

/// When a plan downgrade takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradePolicy {
    /// Apply now with a prorated ledger credit for the unused remainder
    Immediate,
    /// Record the change and apply it at the period boundary sweep
    EndOfPeriod,
}

/// Billing policy configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Trial length applied when a plan does not specify its own
    pub default_trial_days: i64,
    /// Days after period end before a pending invoice is overdue
    pub invoice_grace_days: i64,
    /// Days a past-due tenant keeps access before the resolver blocks it
    pub past_due_grace_days: i64,
    /// Downgrade timing policy
    pub downgrade_policy: DowngradePolicy,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_trial_days: 14,
            invoice_grace_days: 5,
            past_due_grace_days: 3,
            downgrade_policy: DowngradePolicy::Immediate,
        }
    }
}

impl BillingConfig {
    /// Load configuration from environment or use defaults
    ///
    /// - `BILLING_DEFAULT_TRIAL_DAYS` (default: 14)
    /// - `BILLING_INVOICE_GRACE_DAYS` (default: 5)
    /// - `BILLING_PAST_DUE_GRACE_DAYS` (default: 3)
    /// - `BILLING_DOWNGRADE_POLICY`: "immediate" or "end_of_period"
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_trial_days: env_i64("BILLING_DEFAULT_TRIAL_DAYS", defaults.default_trial_days),
            invoice_grace_days: env_i64("BILLING_INVOICE_GRACE_DAYS", defaults.invoice_grace_days),
            past_due_grace_days: env_i64(
                "BILLING_PAST_DUE_GRACE_DAYS",
                defaults.past_due_grace_days,
            ),
            downgrade_policy: match std::env::var("BILLING_DOWNGRADE_POLICY").as_deref() {
                Ok("end_of_period") => DowngradePolicy::EndOfPeriod,
                Ok("immediate") => DowngradePolicy::Immediate,
                _ => defaults.downgrade_policy,
            },
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
