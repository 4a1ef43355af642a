//! Environment configuration for the billing engine

use crate::error::{BillingError, BillingResult};

/// Default accepted clock skew for webhook signatures, in seconds
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe_secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
}

impl BillingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BillingError::Config(format!("{key} must be set")))
        };

        let webhook_tolerance_secs = match lookup("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                BillingError::Config(format!(
                    "STRIPE_WEBHOOK_TOLERANCE_SECS must be an integer, got {raw:?}"
                ))
            })?,
            None => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        Ok(Self {
            stripe_secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            webhook_tolerance_secs,
        })
    }
}
