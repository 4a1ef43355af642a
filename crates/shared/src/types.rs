//! Billing intervals, subscription statuses and credit sources.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workspaces are keyed by UUID everywhere in the platform.
pub type WorkspaceId = Uuid;

/// Credits granted per monthly subscription cycle
pub const PLAN_CREDITS_MONTHLY: i64 = 50_000;
/// Credits granted per yearly subscription cycle
pub const PLAN_CREDITS_YEARLY: i64 = 600_000;

/// Returned when a stored or provider string names no known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Recurrence of a workspace's subscription plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Yearly,
    #[default]
    Free,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
            BillingInterval::Free => "free",
        }
    }

    /// Map a provider price recurrence unit ("month", "year", ...) to an interval.
    ///
    /// Anything other than month or year is treated as free.
    pub fn from_recurring_interval(unit: &str) -> Self {
        match unit {
            "month" => BillingInterval::Monthly,
            "year" => BillingInterval::Yearly,
            _ => BillingInterval::Free,
        }
    }

    /// Credits allocated for one cycle of this interval
    pub fn plan_allocated_credits(&self) -> i64 {
        match self {
            BillingInterval::Monthly => PLAN_CREDITS_MONTHLY,
            BillingInterval::Yearly => PLAN_CREDITS_YEARLY,
            BillingInterval::Free => 0,
        }
    }

    /// Number of calendar months in one cycle, `None` for free plans
    pub fn months(&self) -> Option<u32> {
        match self {
            BillingInterval::Monthly => Some(1),
            BillingInterval::Yearly => Some(12),
            BillingInterval::Free => None,
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingInterval::Monthly),
            "yearly" => Ok(BillingInterval::Yearly),
            "free" => Ok(BillingInterval::Free),
            other => Err(ParseEnumError {
                kind: "billing interval",
                value: other.to_string(),
            }),
        }
    }
}

/// Subscription status as reported by the payment provider.
///
/// `None` is the local state of a workspace that never subscribed. Older
/// records stored it as `free`, which still parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    #[serde(alias = "free")]
    None,
    Trialing,
    Active,
    PastDue,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Active or trialing: the workspace is entitled to plan credits.
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    /// A subscription that still bills the customer. Creating another one
    /// for the same price would double-charge.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "free" => Ok(SubscriptionStatus::None),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(ParseEnumError {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// Where a one-time credit grant came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    /// Pay-as-you-go purchase
    #[serde(rename = "top-up")]
    TopUp,
    Promo,
    /// Granted by an operator
    ManualGrant,
    Bonus,
    Other,
}

impl CreditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditSource::TopUp => "top-up",
            CreditSource::Promo => "promo",
            CreditSource::ManualGrant => "manual_grant",
            CreditSource::Bonus => "bonus",
            CreditSource::Other => "other",
        }
    }
}

impl fmt::Display for CreditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top-up" => Ok(CreditSource::TopUp),
            "promo" => Ok(CreditSource::Promo),
            "manual_grant" | "manual" => Ok(CreditSource::ManualGrant),
            "bonus" => Ok(CreditSource::Bonus),
            "other" => Ok(CreditSource::Other),
            other => Err(ParseEnumError {
                kind: "credit source",
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Plan credit lookup
    // =========================================================================

    #[test]
    fn test_plan_credit_table() {
        assert_eq!(BillingInterval::Monthly.plan_allocated_credits(), 50_000);
        assert_eq!(BillingInterval::Yearly.plan_allocated_credits(), 600_000);
        assert_eq!(BillingInterval::Free.plan_allocated_credits(), 0);
    }

    #[test]
    fn test_recurring_interval_mapping() {
        assert_eq!(
            BillingInterval::from_recurring_interval("month"),
            BillingInterval::Monthly
        );
        assert_eq!(
            BillingInterval::from_recurring_interval("year"),
            BillingInterval::Yearly
        );
        assert_eq!(
            BillingInterval::from_recurring_interval("week"),
            BillingInterval::Free
        );
        assert_eq!(
            BillingInterval::from_recurring_interval(""),
            BillingInterval::Free
        );
    }

    // =========================================================================
    // String round trips used by storage
    // =========================================================================

    #[test]
    fn test_status_parses_legacy_free() {
        assert_eq!(
            "free".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::None
        );
        let status: SubscriptionStatus = serde_json::from_str("\"free\"").unwrap();
        assert_eq!(status, SubscriptionStatus::None);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"none\"");
    }

    #[test]
    fn test_status_rejects_unknown() {
        let err = "zombie".parse::<SubscriptionStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown subscription status: zombie");
    }

    #[test]
    fn test_status_predicates() {
        assert!(SubscriptionStatus::PastDue.is_live());
        assert!(!SubscriptionStatus::PastDue.is_entitled());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(!SubscriptionStatus::Canceled.is_live());
        assert!(!SubscriptionStatus::Incomplete.is_live());
    }

    #[test]
    fn test_credit_source_serialization() {
        assert_eq!(
            serde_json::to_string(&CreditSource::TopUp).unwrap(),
            "\"top-up\""
        );
        assert_eq!(
            serde_json::to_string(&CreditSource::ManualGrant).unwrap(),
            "\"manual_grant\""
        );
        assert_eq!(
            "manual".parse::<CreditSource>().unwrap(),
            CreditSource::ManualGrant
        );
    }
}
