//! Common types used across Atende

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

/// Sentinel for "no limit" on a plan resource.
pub const UNLIMITED: i64 = i64::MAX;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plan ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PlanId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Module ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ModuleId(pub Uuid);

impl ModuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ModuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ModuleId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Lifecycle status of a tenant subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
        }
    }

    /// A live subscription occupies the tenant's single subscription slot.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Trial | Self::Active | Self::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

// =============================================================================
// Billing cycle
// =============================================================================

/// Billing cycle length for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    Semiannual,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Semiannual => "semiannual",
            Self::Annual => "annual",
        }
    }

    /// Cycle length in calendar months
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Semiannual => 6,
            Self::Annual => 12,
        }
    }

    /// Advance a timestamp by one cycle length.
    ///
    /// Day-of-month is clamped to the target month's length, so a period
    /// starting Jan 31 rolls to Feb 28/29 rather than overflowing.
    pub fn advance(&self, from: OffsetDateTime) -> OffsetDateTime {
        add_months(from, self.months())
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "semiannual" => Ok(Self::Semiannual),
            "annual" => Ok(Self::Annual),
            _ => Err(format!("Invalid billing cycle: {}", s)),
        }
    }
}

/// Add calendar months to a timestamp, clamping the day to the target month.
fn add_months(at: OffsetDateTime, months: u32) -> OffsetDateTime {
    let date = at.date();
    let total = date.year() * 12 + (date.month() as i32 - 1) + months as i32;
    let year = total.div_euclid(12);
    let month = Month::try_from((total.rem_euclid(12) + 1) as u8).unwrap_or(Month::January);
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(d) => PrimitiveDateTime::new(d, at.time()).assume_offset(at.offset()),
        // Day is clamped to the month length, so construction cannot fail
        Err(_) => at,
    }
}

// =============================================================================
// Resource types
// =============================================================================

/// Metered resource types tracked per tenant per period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Messages,
    AiTokens,
    Storage,
    Automations,
    WhatsappInstances,
    Users,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::AiTokens => "ai_tokens",
            Self::Storage => "storage",
            Self::Automations => "automations",
            Self::WhatsappInstances => "whatsapp_instances",
            Self::Users => "users",
        }
    }

    /// All metered resource types, in reporting order
    pub fn all() -> [ResourceType; 6] {
        [
            Self::Messages,
            Self::AiTokens,
            Self::Storage,
            Self::Automations,
            Self::WhatsappInstances,
            Self::Users,
        ]
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "messages" => Ok(Self::Messages),
            "ai_tokens" => Ok(Self::AiTokens),
            "storage" => Ok(Self::Storage),
            "automations" => Ok(Self::Automations),
            "whatsapp_instances" => Ok(Self::WhatsappInstances),
            "users" => Ok(Self::Users),
            _ => Err(format!("Invalid resource type: {}", s)),
        }
    }
}

// =============================================================================
// Usage period
// =============================================================================

/// Calendar-month key for usage aggregation (`"2026-08"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u8,
}

impl Period {
    /// Build a period, rejecting out-of-range months
    pub fn new(year: i32, month: u8) -> Result<Self, String> {
        if !(1..=12).contains(&month) {
            return Err(format!("Invalid period month: {}", month));
        }
        Ok(Self { year, month })
    }

    /// The period containing the given timestamp (UTC calendar month)
    pub fn containing(at: OffsetDateTime) -> Self {
        let utc = at.to_offset(time::UtcOffset::UTC);
        Self {
            year: utc.year(),
            month: utc.month() as u8,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    /// Storage key, e.g. `"2026-08"`
    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// The following calendar month
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl std::str::FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("Invalid period key: {}", s))?;
        let year: i32 = year
            .parse()
            .map_err(|_| format!("Invalid period year: {}", s))?;
        let month: u8 = month
            .parse()
            .map_err(|_| format!("Invalid period month: {}", s))?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for Period {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Period> for String {
    fn from(p: Period) -> Self {
        p.key()
    }
}

// =============================================================================
// Limit status
// =============================================================================

/// Result of checking usage against a plan limit.
///
/// Informational, not an error: callers decide whether to hard-block or
/// soft-warn. Overage past the limit is allowed and billed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStatus {
    /// Under 80% of the limit
    Ok,
    /// At or above 80% of the limit
    Warning,
    /// At or above 100% of the limit
    Exceeded,
}

impl LimitStatus {
    /// Warning threshold in percent of the limit
    pub const WARNING_THRESHOLD_PCT: i64 = 80;

    /// Classify a usage count against a limit snapshot.
    ///
    /// Unlimited plans (limit >= UNLIMITED) never warn. A zero limit means
    /// the plan includes none of the resource: any usage is an overage.
    /// Comparisons run in i128 so large counters cannot overflow.
    pub fn from_counts(usage: i64, limit: i64) -> Self {
        if limit < 0 || limit >= UNLIMITED {
            return Self::Ok;
        }
        if limit == 0 {
            return if usage > 0 { Self::Exceeded } else { Self::Ok };
        }
        if usage >= limit {
            return Self::Exceeded;
        }
        if (usage as i128) * 100 >= (limit as i128) * Self::WARNING_THRESHOLD_PCT as i128 {
            return Self::Warning;
        }
        Self::Ok
    }
}

impl std::fmt::Display for LimitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Exceeded => write!(f, "exceeded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
        ] {
            let parsed: SubscriptionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_live_statuses() {
        assert!(SubscriptionStatus::Trial.is_live());
        assert!(SubscriptionStatus::Active.is_live());
        assert!(SubscriptionStatus::PastDue.is_live());
        assert!(!SubscriptionStatus::Cancelled.is_live());
    }

    #[test]
    fn test_cycle_advance_plain_month() {
        let start = datetime!(2026-03-15 10:00 UTC);
        assert_eq!(
            BillingCycle::Monthly.advance(start),
            datetime!(2026-04-15 10:00 UTC)
        );
        assert_eq!(
            BillingCycle::Annual.advance(start),
            datetime!(2027-03-15 10:00 UTC)
        );
    }

    #[test]
    fn test_cycle_advance_clamps_day() {
        // Jan 31 + 1 month lands on Feb 28 (non-leap)
        let start = datetime!(2026-01-31 00:00 UTC);
        assert_eq!(
            BillingCycle::Monthly.advance(start),
            datetime!(2026-02-28 00:00 UTC)
        );
        // Leap year keeps the 29th
        let start = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(
            BillingCycle::Monthly.advance(start),
            datetime!(2024-02-29 00:00 UTC)
        );
    }

    #[test]
    fn test_cycle_advance_across_year() {
        let start = datetime!(2026-11-20 00:00 UTC);
        assert_eq!(
            BillingCycle::Quarterly.advance(start),
            datetime!(2027-02-20 00:00 UTC)
        );
    }

    #[test]
    fn test_period_key_and_parse() {
        let period = Period::containing(datetime!(2026-08-07 12:00 UTC));
        assert_eq!(period.key(), "2026-08");
        assert_eq!("2026-08".parse::<Period>().unwrap(), period);
        assert!("2026-13".parse::<Period>().is_err());
        assert!("garbage".parse::<Period>().is_err());
    }

    #[test]
    fn test_period_next_wraps_year() {
        let dec = Period::new(2026, 12).unwrap();
        assert_eq!(dec.next(), Period::new(2027, 1).unwrap());
    }

    #[test]
    fn test_limit_status_thresholds() {
        assert_eq!(LimitStatus::from_counts(0, 100), LimitStatus::Ok);
        assert_eq!(LimitStatus::from_counts(79, 100), LimitStatus::Ok);
        assert_eq!(LimitStatus::from_counts(80, 100), LimitStatus::Warning);
        assert_eq!(LimitStatus::from_counts(99, 100), LimitStatus::Warning);
        assert_eq!(LimitStatus::from_counts(100, 100), LimitStatus::Exceeded);
        assert_eq!(LimitStatus::from_counts(250, 100), LimitStatus::Exceeded);
    }

    #[test]
    fn test_limit_status_unlimited() {
        assert_eq!(
            LimitStatus::from_counts(10_000_000, UNLIMITED),
            LimitStatus::Ok
        );
    }

    #[test]
    fn test_limit_status_zero_limit_means_not_included() {
        assert_eq!(LimitStatus::from_counts(0, 0), LimitStatus::Ok);
        assert_eq!(LimitStatus::from_counts(1, 0), LimitStatus::Exceeded);
    }

    #[test]
    fn test_resource_type_round_trip() {
        for resource in ResourceType::all() {
            let parsed: ResourceType = resource.as_str().parse().unwrap();
            assert_eq!(parsed, resource);
        }
    }
}
