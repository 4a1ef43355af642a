//! Billing Invariants Module
//!
//! Read-only consistency checks over workspace billing records. They can be
//! run after a webhook replay or on a schedule to catch records that drifted
//! from what the reconciler would have written.
//!
//! Each check is a pure function over the loaded records, so the same checks
//! run against Postgres in production and against fixtures in tests.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use intervo_shared::{SubscriptionStatus, WorkspaceId};
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;
use crate::store::{EntitlementStore, WorkspaceBilling};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Workspace(s) affected
    pub workspace_ids: Vec<WorkspaceId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Workspace may be granted credits it did not pay for
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: DateTime<Utc>,
    pub records_checked: usize,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

type Check = fn(&WorkspaceBilling) -> Option<InvariantViolation>;

const CHECKS: [(&str, Check); 5] = [
    ("inactive_has_no_plan", check_inactive_has_no_plan),
    ("plan_credits_match_interval", check_plan_credits_match_interval),
    ("subscription_has_customer", check_subscription_has_customer),
    ("auto_recharge_valid", check_auto_recharge_valid),
    ("grants_positive", check_grants_positive),
];

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn EntitlementStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks over every stored record
    pub async fn run_all_checks(&self, now: DateTime<Utc>) -> BillingResult<InvariantCheckSummary> {
        let records = self.store.list_workspace_billing().await?;
        Ok(summarize(&records, now))
    }

    /// Run a single invariant check by name. Unknown names find nothing.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let Some((_, check)) = CHECKS.iter().find(|(check_name, _)| *check_name == name) else {
            return Ok(vec![]);
        };
        let records = self.store.list_workspace_billing().await?;
        Ok(records.iter().filter_map(*check).collect())
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.iter().map(|(name, _)| *name).collect()
    }
}

/// Run every check over `records`
pub fn summarize(records: &[WorkspaceBilling], now: DateTime<Utc>) -> InvariantCheckSummary {
    let violations: Vec<InvariantViolation> = records
        .iter()
        .flat_map(|record| CHECKS.iter().filter_map(move |(_, check)| check(record)))
        .collect();

    let checks_run = CHECKS.len();
    let checks_failed = violations
        .iter()
        .map(|v| v.invariant.as_str())
        .collect::<HashSet<_>>()
        .len();

    InvariantCheckSummary {
        checked_at: now,
        records_checked: records.len(),
        checks_run,
        checks_passed: checks_run - checks_failed,
        checks_failed,
        healthy: violations.is_empty(),
        violations,
    }
}

fn violation(
    invariant: &str,
    record: &WorkspaceBilling,
    description: String,
    context: serde_json::Value,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        workspace_ids: vec![record.workspace_id],
        description,
        context,
        severity,
    }
}

/// Canceled or never-subscribed workspaces keep no anchor and no plan credits
fn check_inactive_has_no_plan(record: &WorkspaceBilling) -> Option<InvariantViolation> {
    let inactive = matches!(
        record.subscription_status,
        SubscriptionStatus::Canceled | SubscriptionStatus::None
    );
    let has_plan = record.billing_cycle_anchor.is_some()
        || record.plan_allocated_credits.is_some_and(|credits| credits != 0);

    (inactive && has_plan).then(|| {
        violation(
            "inactive_has_no_plan",
            record,
            format!(
                "Workspace with status '{}' still holds a plan allocation",
                record.subscription_status
            ),
            serde_json::json!({
                "status": record.subscription_status.as_str(),
                "billing_cycle_anchor": record.billing_cycle_anchor,
                "plan_allocated_credits": record.plan_allocated_credits,
            }),
            ViolationSeverity::Critical,
        )
    })
}

/// Live subscriptions carry the allocation of their interval
fn check_plan_credits_match_interval(record: &WorkspaceBilling) -> Option<InvariantViolation> {
    if !record.subscription_status.is_live() {
        return None;
    }
    let expected = record.billing_cycle_interval.plan_allocated_credits();
    (record.plan_allocated_credits != Some(expected)).then(|| {
        violation(
            "plan_credits_match_interval",
            record,
            format!(
                "Plan credits {:?} do not match {} interval allocation {}",
                record.plan_allocated_credits, record.billing_cycle_interval, expected
            ),
            serde_json::json!({
                "interval": record.billing_cycle_interval.as_str(),
                "plan_allocated_credits": record.plan_allocated_credits,
                "expected": expected,
            }),
            ViolationSeverity::High,
        )
    })
}

fn check_subscription_has_customer(record: &WorkspaceBilling) -> Option<InvariantViolation> {
    (record.subscription_id.is_some() && record.customer_id.is_none()).then(|| {
        violation(
            "subscription_has_customer",
            record,
            "Workspace has a subscription but no customer".to_string(),
            serde_json::json!({ "subscription_id": record.subscription_id }),
            ViolationSeverity::High,
        )
    })
}

fn check_auto_recharge_valid(record: &WorkspaceBilling) -> Option<InvariantViolation> {
    if !record.auto_recharge.enabled {
        return None;
    }
    record.auto_recharge.validate_enabled().err().map(|e| {
        violation(
            "auto_recharge_valid",
            record,
            format!("Enabled auto-recharge settings are invalid: {e}"),
            serde_json::json!({
                "threshold_credits": record.auto_recharge.threshold_credits,
                "amount_to_add_credits": record.auto_recharge.amount_to_add_credits,
                "charge_amount": record.auto_recharge.charge_amount,
                "currency": record.auto_recharge.currency,
            }),
            ViolationSeverity::Medium,
        )
    })
}

fn check_grants_positive(record: &WorkspaceBilling) -> Option<InvariantViolation> {
    let bad: Vec<_> = record
        .one_time_credits
        .iter()
        .filter(|grant| grant.amount <= 0)
        .map(|grant| grant.id)
        .collect();

    (!bad.is_empty()).then(|| {
        violation(
            "grants_positive",
            record,
            format!("{} credit grant(s) with non-positive amount", bad.len()),
            serde_json::json!({ "grant_ids": bad }),
            ViolationSeverity::Low,
        )
    })
}
