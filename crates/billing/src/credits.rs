//! Credit Pool Calculator
//!
//! Combines plan credits, unexpired one-time grants and recorded usage into a
//! [`CreditBalanceReport`]. Plan credits are consumed first; one-time grants
//! are only debited once usage exceeds the plan allocation.
//!
//! Balance queries never fail from the caller's point of view. A usage read
//! error counts as zero usage, a missing window drops the cycle dates, and
//! any other failure yields [`CreditBalanceReport::default`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use intervo_shared::{BillingInterval, CreditSource, SubscriptionStatus, WorkspaceId};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::cycle::{self, CycleSource, UsageWindow};
use crate::error::{BillingError, BillingResult};
use crate::store::{CreditGrant, EntitlementStore, WorkspaceBilling};
use crate::usage::{ActivityStatus, UsageAggregator};

/// Subscription plan portion of a balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCreditsReport {
    pub allocated_credits: i64,
    pub used_credits: i64,
    pub remaining_credits: i64,
    pub billing_interval: BillingInterval,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_end_date: Option<DateTime<Utc>>,
}

/// One-time grant portion of a balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeCreditsReport {
    pub allocated_credits: i64,
    pub used_credits: i64,
    pub remaining_credits: i64,
    /// Unexpired grants only
    pub credits: Vec<CreditGrant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_end_date: Option<DateTime<Utc>>,
}

/// Balance view returned to callers. Recomputed on every query, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalanceReport {
    pub billing_configured: bool,
    pub total_allocated_credits: i64,
    pub total_used_credits: i64,
    pub total_remaining_credits: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_plan: Option<PlanCreditsReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_credits: Option<OneTimeCreditsReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_end_date: Option<DateTime<Utc>>,
}

/// Compute the balance of `workspace` at `now`.
///
/// Performs one usage read and never mutates the record.
pub async fn compute_balance(
    workspace: &WorkspaceBilling,
    usage: &dyn UsageAggregator,
    now: DateTime<Utc>,
    include_details: bool,
) -> CreditBalanceReport {
    match try_compute_balance(workspace, usage, now, include_details).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(
                workspace_id = %workspace.workspace_id,
                error = %e,
                "Balance computation failed, returning empty balance"
            );
            CreditBalanceReport::default()
        }
    }
}

/// Pick the authoritative window: subscription cycle, then one-time grant
/// span, then the calendar month.
fn resolve_window(
    workspace: &WorkspaceBilling,
    billing_configured: bool,
    has_valid_one_time: bool,
    now: DateTime<Utc>,
) -> Option<(CycleSource, UsageWindow)> {
    let preferred = if billing_configured {
        workspace
            .billing_cycle_anchor
            .and_then(|anchor| {
                cycle::subscription_cycle(anchor, workspace.billing_cycle_interval, now)
            })
            .map(|window| (CycleSource::Subscription, window))
    } else if has_valid_one_time {
        cycle::one_time_credit_window(workspace.active_grants(now), now)
            .map(|window| (CycleSource::OneTimeCredits, window))
    } else {
        None
    };

    preferred.or_else(|| cycle::calendar_month(now).map(|window| (CycleSource::CalendarMonth, window)))
}

async fn try_compute_balance(
    workspace: &WorkspaceBilling,
    usage: &dyn UsageAggregator,
    now: DateTime<Utc>,
    include_details: bool,
) -> BillingResult<CreditBalanceReport> {
    let workspace_id = workspace.workspace_id;
    let has_valid_one_time = workspace.has_valid_one_time_credits(now);

    if workspace.billing_cycle_anchor.is_none()
        && workspace.plan_allocated_credits.is_none()
        && !has_valid_one_time
    {
        return Ok(CreditBalanceReport::default());
    }

    let billing_configured =
        workspace.billing_cycle_anchor.is_some() && workspace.plan_allocated_credits.is_some();

    let window = resolve_window(workspace, billing_configured, has_valid_one_time, now);
    if let Some((source, window)) = &window {
        tracing::debug!(
            workspace_id = %workspace_id,
            source = ?source,
            start = %window.start,
            end = %window.end,
            "Resolved usage window"
        );
    }

    let total_used = match &window {
        Some((_, window)) => usage
            .sum_credits_used(workspace_id, ActivityStatus::Completed, *window)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(
                    workspace_id = %workspace_id,
                    error = %e,
                    "Usage aggregation failed, treating usage as zero"
                );
                0
            })
            .max(0),
        None => {
            tracing::warn!(
                workspace_id = %workspace_id,
                "No usage window could be resolved, treating usage as zero"
            );
            0
        }
    };

    let (cycle_start, cycle_end) = match (&window, include_details) {
        (Some((_, window)), true) => (Some(window.start), Some(window.end)),
        _ => (None, None),
    };

    let plan_allocated = workspace.plan_allocated_credits.unwrap_or(0).max(0);

    let billing_plan = billing_configured.then(|| {
        let used = total_used.min(plan_allocated);
        PlanCreditsReport {
            allocated_credits: plan_allocated,
            used_credits: used,
            remaining_credits: (plan_allocated - used).max(0),
            billing_interval: workspace.billing_cycle_interval,
            cycle_start_date: cycle_start,
            cycle_end_date: cycle_end,
        }
    });

    let one_time_credits = if has_valid_one_time {
        let grants: Vec<CreditGrant> = workspace.active_grants(now).cloned().collect();
        let allocated = grants
            .iter()
            .try_fold(0i64, |sum, grant| sum.checked_add(grant.amount.max(0)))
            .ok_or_else(|| BillingError::Internal("one-time credit total overflowed".into()))?;

        let consumed_by_plan = if billing_configured { plan_allocated } else { 0 };
        let used = total_used.saturating_sub(consumed_by_plan).clamp(0, allocated);

        Some(OneTimeCreditsReport {
            allocated_credits: allocated,
            used_credits: used,
            remaining_credits: (allocated - used).max(0),
            credits: grants,
            // Grant-span dates only apply when no plan cycle governs the window.
            cycle_start_date: cycle_start.filter(|_| !billing_configured),
            cycle_end_date: cycle_end.filter(|_| !billing_configured),
        })
    } else {
        None
    };

    let one_time_allocated = one_time_credits
        .as_ref()
        .map_or(0, |report| report.allocated_credits);
    let total_allocated = plan_allocated
        .checked_add(one_time_allocated)
        .ok_or_else(|| BillingError::Internal("total credit allocation overflowed".into()))?;

    Ok(CreditBalanceReport {
        billing_configured,
        total_allocated_credits: total_allocated,
        total_used_credits: total_used,
        total_remaining_credits: total_allocated.saturating_sub(total_used).max(0),
        billing_plan,
        one_time_credits,
        cycle_start_date: cycle_start,
        cycle_end_date: cycle_end,
    })
}

/// How a workspace is currently billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Subscription,
    PayAsYouGo,
    FreeWithCredits,
    Free,
}

/// Top-up credits already spent and what they cost
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayAsYouGoUsage {
    pub used_credits: i64,
    /// Minor units of `currency`
    pub value: i64,
    pub currency: String,
}

/// Plan classification derived from the stored record and its balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub plan_type: PlanType,
    pub is_active: bool,
    pub subscription_status: SubscriptionStatus,
    pub auto_recharge_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pay_as_you_go_usage: Option<PayAsYouGoUsage>,
}

impl PlanSummary {
    /// A subscription that is still being set up or billed wins over
    /// pay-as-you-go, which wins over leftover free credits.
    pub fn classify(workspace: &WorkspaceBilling, balance: &CreditBalanceReport) -> Self {
        let status = workspace.subscription_status;
        let subscribed = workspace.subscription_id.is_some()
            && matches!(
                status,
                SubscriptionStatus::Active
                    | SubscriptionStatus::Trialing
                    | SubscriptionStatus::PastDue
                    | SubscriptionStatus::Incomplete
            );

        if subscribed {
            return Self {
                plan_type: PlanType::Subscription,
                is_active: status.is_entitled(),
                subscription_status: status,
                auto_recharge_enabled: false,
                pay_as_you_go_usage: None,
            };
        }

        if workspace.auto_recharge.enabled {
            return Self {
                plan_type: PlanType::PayAsYouGo,
                is_active: true,
                subscription_status: status,
                auto_recharge_enabled: true,
                pay_as_you_go_usage: Some(pay_as_you_go_usage(workspace, balance)),
            };
        }

        let plan_type = if balance.total_remaining_credits > 0 {
            PlanType::FreeWithCredits
        } else {
            PlanType::Free
        };
        Self {
            plan_type,
            is_active: false,
            subscription_status: status,
            auto_recharge_enabled: false,
            pay_as_you_go_usage: None,
        }
    }
}

/// Spent top-up credits priced at the configured recharge rate.
///
/// Used credits are every top-up grant ever purchased minus the remaining
/// balance, floored at zero. The value is rounded half up to minor units and
/// is zero when the recharge amount is not positive.
pub fn pay_as_you_go_usage(
    workspace: &WorkspaceBilling,
    balance: &CreditBalanceReport,
) -> PayAsYouGoUsage {
    let settings = &workspace.auto_recharge;
    let topped_up = workspace
        .one_time_credits
        .iter()
        .filter(|grant| grant.source == CreditSource::TopUp)
        .fold(0i64, |sum, grant| sum.saturating_add(grant.amount.max(0)));
    let used_credits = topped_up
        .saturating_sub(balance.total_remaining_credits)
        .max(0);

    let value = if settings.amount_to_add_credits > 0 {
        let per_batch = i128::from(settings.amount_to_add_credits);
        let numerator = i128::from(used_credits) * i128::from(settings.charge_amount);
        let rounded = (2 * numerator + per_batch).div_euclid(2 * per_batch);
        rounded.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    } else {
        0
    };

    PayAsYouGoUsage {
        used_credits,
        value,
        currency: settings.currency.clone(),
    }
}

/// Balance queries for the route layer
pub struct CreditService {
    store: Arc<dyn EntitlementStore>,
    usage: Arc<dyn UsageAggregator>,
    clock: Arc<dyn Clock>,
}

impl CreditService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        usage: Arc<dyn UsageAggregator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            usage,
            clock,
        }
    }

    /// Current balance of a workspace. Unknown workspaces and store failures
    /// produce the empty balance.
    pub async fn compute_balance(
        &self,
        workspace_id: WorkspaceId,
        include_details: bool,
    ) -> CreditBalanceReport {
        let record = match self.store.get_workspace_billing(workspace_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(workspace_id = %workspace_id, "Balance requested for unknown workspace");
                return CreditBalanceReport::default();
            }
            Err(e) => {
                tracing::error!(
                    workspace_id = %workspace_id,
                    error = %e,
                    "Failed to load workspace billing for balance"
                );
                return CreditBalanceReport::default();
            }
        };

        compute_balance(&record, self.usage.as_ref(), self.clock.now(), include_details).await
    }

    /// Plan type, activity and pay-as-you-go spend for a workspace
    pub async fn plan_summary(&self, workspace_id: WorkspaceId) -> BillingResult<PlanSummary> {
        let record = self
            .store
            .get_workspace_billing(workspace_id)
            .await?
            .ok_or(BillingError::WorkspaceNotFound(workspace_id))?;
        let balance = compute_balance(&record, self.usage.as_ref(), self.clock.now(), false).await;
        Ok(PlanSummary::classify(&record, &balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::InMemoryEntitlementStore;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use intervo_shared::CreditSource;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Returns a fixed total and remembers the last query
    struct FixedUsage {
        total: i64,
        last_query: Mutex<Option<(ActivityStatus, UsageWindow)>>,
    }

    impl FixedUsage {
        fn new(total: i64) -> Self {
            Self {
                total,
                last_query: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl UsageAggregator for FixedUsage {
        async fn sum_credits_used(
            &self,
            _workspace_id: WorkspaceId,
            status: ActivityStatus,
            window: UsageWindow,
        ) -> BillingResult<i64> {
            *self.last_query.lock().unwrap() = Some((status, window));
            Ok(self.total)
        }
    }

    struct FailingUsage;

    #[async_trait]
    impl UsageAggregator for FailingUsage {
        async fn sum_credits_used(
            &self,
            _workspace_id: WorkspaceId,
            _status: ActivityStatus,
            _window: UsageWindow,
        ) -> BillingResult<i64> {
            Err(BillingError::Database("connection reset".into()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn subscribed(plan: i64) -> WorkspaceBilling {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.billing_cycle_anchor = Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        record.billing_cycle_interval = BillingInterval::Monthly;
        record.plan_allocated_credits = Some(plan);
        record
    }

    fn grant(amount: i64) -> CreditGrant {
        CreditGrant::new(amount, CreditSource::TopUp, "top-up", now() - Duration::days(3))
    }

    // =========================================================================
    // No-op default
    // =========================================================================

    #[tokio::test]
    async fn test_unconfigured_workspace_returns_exact_default() {
        let record = WorkspaceBilling::new(Uuid::new_v4());
        let usage = FixedUsage::new(999);
        let report = compute_balance(&record, &usage, now(), true).await;

        assert_eq!(report, CreditBalanceReport::default());
        assert!(usage.last_query.lock().unwrap().is_none(), "no usage read");
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "billingConfigured": false,
                "totalAllocatedCredits": 0,
                "totalUsedCredits": 0,
                "totalRemainingCredits": 0
            })
        );
    }

    // =========================================================================
    // Consumption order: plan first, then one-time grants
    // =========================================================================

    #[tokio::test]
    async fn test_plan_consumed_before_one_time() {
        let mut record = subscribed(1000);
        record.one_time_credits.push(grant(500));
        let report = compute_balance(&record, &FixedUsage::new(1200), now(), true).await;

        let plan = report.billing_plan.as_ref().unwrap();
        assert_eq!(plan.used_credits, 1000);
        assert_eq!(plan.remaining_credits, 0);

        let one_time = report.one_time_credits.as_ref().unwrap();
        assert_eq!(one_time.used_credits, 200);
        assert_eq!(one_time.remaining_credits, 300);

        assert!(report.billing_configured);
        assert_eq!(report.total_allocated_credits, 1500);
        assert_eq!(report.total_used_credits, 1200);
        assert_eq!(report.total_remaining_credits, 300);
    }

    #[tokio::test]
    async fn test_usage_within_plan_leaves_one_time_untouched() {
        let mut record = subscribed(1000);
        record.one_time_credits.push(grant(500));
        let report = compute_balance(&record, &FixedUsage::new(400), now(), false).await;

        assert_eq!(report.one_time_credits.unwrap().used_credits, 0);
        assert_eq!(report.total_remaining_credits, 1100);
    }

    #[tokio::test]
    async fn test_one_time_only_consumes_all_usage() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.one_time_credits.push(grant(5100));
        let usage = FixedUsage::new(100);
        let report = compute_balance(&record, &usage, now(), true).await;

        assert!(!report.billing_configured);
        assert!(report.billing_plan.is_none());
        let one_time = report.one_time_credits.unwrap();
        assert_eq!(one_time.used_credits, 100);
        assert_eq!(one_time.remaining_credits, 5000);

        // Window spans the grant, not the calendar month.
        let (status, window) = usage.last_query.lock().unwrap().unwrap();
        assert_eq!(status, ActivityStatus::Completed);
        assert_eq!(window.start, now() - Duration::days(3));
    }

    // =========================================================================
    // Non-negativity
    // =========================================================================

    #[tokio::test]
    async fn test_overuse_never_goes_negative() {
        let mut record = subscribed(1000);
        record.one_time_credits.push(grant(500));
        let report = compute_balance(&record, &FixedUsage::new(10_000), now(), true).await;

        assert_eq!(report.total_remaining_credits, 0);
        assert_eq!(report.total_used_credits, 10_000);
        assert_eq!(report.one_time_credits.unwrap().remaining_credits, 0);
        assert_eq!(report.billing_plan.unwrap().remaining_credits, 0);
    }

    #[tokio::test]
    async fn test_negative_usage_sum_clamped() {
        let report = compute_balance(&subscribed(1000), &FixedUsage::new(-40), now(), true).await;
        assert_eq!(report.total_used_credits, 0);
        assert_eq!(report.total_remaining_credits, 1000);
    }

    // =========================================================================
    // Expiry exclusion
    // =========================================================================

    #[tokio::test]
    async fn test_expired_grant_contributes_nothing() {
        let mut record = subscribed(1000);
        record
            .one_time_credits
            .push(grant(1_000_000).expiring_at(now() - Duration::seconds(1)));
        let report = compute_balance(&record, &FixedUsage::new(0), now(), true).await;

        assert_eq!(report.total_allocated_credits, 1000);
        assert!(report.one_time_credits.is_none());
    }

    #[tokio::test]
    async fn test_only_unexpired_grants_listed() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record
            .one_time_credits
            .push(grant(300).expiring_at(now() - Duration::days(1)));
        record
            .one_time_credits
            .push(grant(200).expiring_at(now() + Duration::days(30)));
        let report = compute_balance(&record, &FixedUsage::new(0), now(), true).await;

        let one_time = report.one_time_credits.unwrap();
        assert_eq!(one_time.allocated_credits, 200);
        assert_eq!(one_time.credits.len(), 1);
        assert_eq!(one_time.cycle_end_date, Some(now() + Duration::days(30)));
    }

    // =========================================================================
    // Degraded reads and detail flags
    // =========================================================================

    #[tokio::test]
    async fn test_usage_failure_counts_as_zero() {
        let report = compute_balance(&subscribed(50_000), &FailingUsage, now(), true).await;
        assert!(report.billing_configured);
        assert_eq!(report.total_used_credits, 0);
        assert_eq!(report.total_remaining_credits, 50_000);
    }

    #[tokio::test]
    async fn test_details_flag_controls_cycle_dates() {
        let record = subscribed(1000);
        let detailed = compute_balance(&record, &FixedUsage::new(0), now(), true).await;
        assert_eq!(
            detailed.cycle_start_date,
            Some(Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap())
        );
        assert_eq!(
            detailed.billing_plan.unwrap().cycle_end_date,
            Some(Utc.with_ymd_and_hms(2024, 7, 10, 0, 0, 0).unwrap())
        );

        let brief = compute_balance(&record, &FixedUsage::new(0), now(), false).await;
        assert!(brief.cycle_start_date.is_none());
        assert!(brief.billing_plan.unwrap().cycle_start_date.is_none());
    }

    #[tokio::test]
    async fn test_free_interval_with_anchor_uses_calendar_month() {
        let mut record = subscribed(0);
        record.billing_cycle_interval = BillingInterval::Free;
        let usage = FixedUsage::new(0);
        compute_balance(&record, &usage, now(), true).await;

        let (_, window) = usage.last_query.lock().unwrap().unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_plan_credits_without_anchor_not_configured() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.plan_allocated_credits = Some(0);
        let report = compute_balance(&record, &FixedUsage::new(25), now(), true).await;

        assert!(!report.billing_configured);
        assert_eq!(report.total_used_credits, 25);
        assert_eq!(report.total_remaining_credits, 0);
    }

    #[tokio::test]
    async fn test_overflowing_grants_return_default() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.one_time_credits.push(grant(i64::MAX));
        record.one_time_credits.push(grant(i64::MAX));
        let report = compute_balance(&record, &FixedUsage::new(0), now(), true).await;
        assert_eq!(report, CreditBalanceReport::default());
    }

    #[tokio::test]
    async fn test_one_time_dates_omitted_under_plan() {
        let mut record = subscribed(1000);
        record.one_time_credits.push(grant(500));
        let report = compute_balance(&record, &FixedUsage::new(0), now(), true).await;

        assert!(report.cycle_start_date.is_some());
        let one_time = report.one_time_credits.unwrap();
        assert!(one_time.cycle_start_date.is_none());
        assert!(one_time.cycle_end_date.is_none());
    }

    // =========================================================================
    // Plan classification
    // =========================================================================

    fn balance_with_remaining(remaining: i64) -> CreditBalanceReport {
        CreditBalanceReport {
            total_remaining_credits: remaining,
            ..Default::default()
        }
    }

    #[test]
    fn test_live_subscription_wins_over_auto_recharge() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Incomplete,
        ] {
            let mut record = subscribed(50_000);
            record.subscription_id = Some("sub_1".to_string());
            record.subscription_status = status;
            record.auto_recharge.enabled = true;

            let summary = PlanSummary::classify(&record, &balance_with_remaining(10));
            assert_eq!(summary.plan_type, PlanType::Subscription, "{status}");
            assert_eq!(summary.is_active, status.is_entitled(), "{status}");
            assert!(!summary.auto_recharge_enabled);
            assert!(summary.pay_as_you_go_usage.is_none());
        }
    }

    #[test]
    fn test_status_without_subscription_id_is_not_subscribed() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.subscription_status = SubscriptionStatus::Active;
        let summary = PlanSummary::classify(&record, &balance_with_remaining(0));
        assert_eq!(summary.plan_type, PlanType::Free);
    }

    #[test]
    fn test_canceled_subscription_with_auto_recharge_is_pay_as_you_go() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.subscription_id = Some("sub_old".to_string());
        record.subscription_status = SubscriptionStatus::Canceled;
        record.auto_recharge.enabled = true;

        let summary = PlanSummary::classify(&record, &balance_with_remaining(0));
        assert_eq!(summary.plan_type, PlanType::PayAsYouGo);
        assert!(summary.is_active);
        assert!(summary.pay_as_you_go_usage.is_some());
    }

    #[test]
    fn test_free_plan_split_on_remaining_credits() {
        let record = WorkspaceBilling::new(Uuid::new_v4());
        assert_eq!(
            PlanSummary::classify(&record, &balance_with_remaining(1)).plan_type,
            PlanType::FreeWithCredits
        );
        let summary = PlanSummary::classify(&record, &balance_with_remaining(0));
        assert_eq!(summary.plan_type, PlanType::Free);
        assert!(!summary.is_active);
    }

    #[test]
    fn test_pay_as_you_go_usage_value() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.auto_recharge.enabled = true;
        record.auto_recharge.amount_to_add_credits = 2000;
        record.auto_recharge.charge_amount = 1000;
        record.one_time_credits.push(grant(5100));
        record.one_time_credits.push(grant(2000));
        record
            .one_time_credits
            .push(CreditGrant::new(900, CreditSource::Promo, "promo", now()));

        // 7100 topped up, 4099 left: 3001 used at 0.5 cents each rounds up.
        let usage = pay_as_you_go_usage(&record, &balance_with_remaining(4099));
        assert_eq!(usage.used_credits, 3001);
        assert_eq!(usage.value, 1501);
        assert_eq!(usage.currency, "usd");

        let unused = pay_as_you_go_usage(&record, &balance_with_remaining(9000));
        assert_eq!(unused.used_credits, 0);
        assert_eq!(unused.value, 0);
    }

    #[test]
    fn test_pay_as_you_go_usage_zero_amount_has_no_value() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.auto_recharge.amount_to_add_credits = 0;
        record.one_time_credits.push(grant(400));

        let usage = pay_as_you_go_usage(&record, &balance_with_remaining(100));
        assert_eq!(usage.used_credits, 300);
        assert_eq!(usage.value, 0);
    }

    // =========================================================================
    // Service
    // =========================================================================

    #[tokio::test]
    async fn test_service_unknown_workspace_is_default() {
        let service = CreditService::new(
            Arc::new(InMemoryEntitlementStore::new()),
            Arc::new(FixedUsage::new(10)),
            Arc::new(FixedClock(now())),
        );
        let report = service.compute_balance(Uuid::new_v4(), true).await;
        assert_eq!(report, CreditBalanceReport::default());
    }

    #[tokio::test]
    async fn test_service_reads_store_and_clock() {
        let store = Arc::new(InMemoryEntitlementStore::new());
        let record = subscribed(50_000);
        store.insert(record.clone()).await;
        let service = CreditService::new(
            store,
            Arc::new(FixedUsage::new(1_250)),
            Arc::new(FixedClock(now())),
        );

        let report = service.compute_balance(record.workspace_id, true).await;
        assert_eq!(report.total_remaining_credits, 48_750);
    }

    #[tokio::test]
    async fn test_service_plan_summary_uses_balance() {
        let store = Arc::new(InMemoryEntitlementStore::new());
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.one_time_credits.push(grant(500));
        store.insert(record.clone()).await;
        let service = CreditService::new(
            store,
            Arc::new(FixedUsage::new(100)),
            Arc::new(FixedClock(now())),
        );

        let summary = service.plan_summary(record.workspace_id).await.unwrap();
        assert_eq!(summary.plan_type, PlanType::FreeWithCredits);

        let err = service.plan_summary(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::WorkspaceNotFound(_)));
    }
}
