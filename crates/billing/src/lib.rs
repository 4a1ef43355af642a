// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Intervo Billing Module
//!
//! Entitlement reconciliation for workspaces: turns payment-provider events
//! into stored billing state and answers "how many credits are left".
//!
//! ## Features
//!
//! - **Billing Cycles**: Resolve the usage window from the subscription anchor
//! - **Credit Balances**: Plan credits first, then unexpired one-time grants
//! - **Webhooks**: Verify and reconcile Stripe events idempotently
//! - **Top-ups**: Pay-as-you-go credit purchases at 200 credits per USD
//! - **Auto-recharge**: Per-workspace recharge settings with validation
//! - **Plan summary**: Subscription, pay-as-you-go or free classification
//! - **Invariants**: Read-only consistency checks over billing records

pub mod auto_recharge;
pub mod clock;
pub mod config;
pub mod credits;
pub mod cycle;
pub mod error;
pub mod events;
pub mod inbox;
pub mod invariants;
pub mod provider;
pub mod store;
pub mod usage;
pub mod webhooks;


// Auto-recharge
pub use auto_recharge::{AutoRechargeService, AutoRechargeSettings, AutoRechargeUpdate};

// Clock
pub use clock::{Clock, FixedClock, SystemClock};

// Config
pub use config::BillingConfig;

// Credits
pub use credits::{
    CreditBalanceReport, CreditService, OneTimeCreditsReport, PayAsYouGoUsage, PlanCreditsReport,
    PlanSummary, PlanType,
};

// Cycle
pub use cycle::{CycleSource, UsageWindow};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ProviderEvent, ProviderEventKind, SubscriptionSnapshot};

// Inbox
pub use inbox::{InboxRunStats, PgWebhookInbox};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Provider
pub use provider::{NewSubscription, PaymentProvider, StripeClient};

// Store
pub use store::{
    CreditGrant, EntitlementStore, InMemoryEntitlementStore, PgEntitlementStore,
    WorkspaceBilling,
};

// Usage
pub use usage::{ActivityStatus, PgUsageAggregator, UsageAggregator};

// Webhooks
pub use webhooks::{Acknowledgement, EventLog, EventOutcome, WebhookEventRecord, WebhookHandler};

use std::sync::Arc;

use sqlx::migrate::Migrator;
use sqlx::PgPool;

/// Schema for every table this crate reads or writes
pub static MIGRATOR: Migrator = sqlx::migrate!();

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub auto_recharge: AutoRechargeService,
    pub credits: CreditService,
    pub inbox: PgWebhookInbox,
    pub invariants: InvariantChecker,
    pub webhooks: Arc<WebhookHandler>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(BillingConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: BillingConfig, pool: PgPool) -> Self {
        let store = Arc::new(PgEntitlementStore::new(pool.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stripe = Arc::new(StripeClient::new(config.clone()));

        Self {
            auto_recharge: AutoRechargeService::new(store.clone()),
            credits: CreditService::new(
                store.clone(),
                Arc::new(PgUsageAggregator::new(pool.clone())),
                clock.clone(),
            ),
            inbox: PgWebhookInbox::new(pool),
            invariants: InvariantChecker::new(store.clone()),
            webhooks: Arc::new(WebhookHandler::new(
                store.clone(),
                store,
                stripe,
                clock,
                config.webhook_secret,
                config.webhook_tolerance_secs,
            )),
        }
    }
}
