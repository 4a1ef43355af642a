#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Intervo Shared
//!
//! Domain vocabulary shared by the billing engine and the background worker.

pub mod types;

pub use types::{
    BillingInterval, CreditSource, ParseEnumError, SubscriptionStatus, WorkspaceId,
    PLAN_CREDITS_MONTHLY, PLAN_CREDITS_YEARLY,
};
