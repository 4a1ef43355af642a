//! Auto-recharge settings
//!
//! Settings are validated strictly only while auto-recharge is enabled. A
//! disabled configuration may hold any numbers so users can stage values
//! before switching it on.

use std::sync::Arc;

use intervo_shared::WorkspaceId;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::store::{EntitlementStore, WorkspaceBilling};

pub const DEFAULT_THRESHOLD_CREDITS: i64 = 1000;
pub const DEFAULT_AMOUNT_TO_ADD_CREDITS: i64 = 2000;
/// Minor units (cents)
pub const DEFAULT_CHARGE_AMOUNT: i64 = 1000;
pub const DEFAULT_CURRENCY: &str = "usd";

/// Stored auto-recharge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRechargeSettings {
    pub enabled: bool,
    pub threshold_credits: i64,
    pub amount_to_add_credits: i64,
    /// Minor units of `currency`
    pub charge_amount: i64,
    pub currency: String,
}

impl Default for AutoRechargeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_credits: DEFAULT_THRESHOLD_CREDITS,
            amount_to_add_credits: DEFAULT_AMOUNT_TO_ADD_CREDITS,
            charge_amount: DEFAULT_CHARGE_AMOUNT,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

/// Partial update. `enabled` is always required, omitted fields keep their
/// stored values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRechargeUpdate {
    pub enabled: bool,
    pub threshold_credits: Option<i64>,
    pub amount_to_add_credits: Option<i64>,
    pub charge_amount: Option<i64>,
    pub currency: Option<String>,
}

impl AutoRechargeSettings {
    /// Merge `update` into these settings and validate the result.
    pub fn apply(&self, update: &AutoRechargeUpdate) -> BillingResult<Self> {
        let mut next = Self {
            enabled: update.enabled,
            threshold_credits: update.threshold_credits.unwrap_or(self.threshold_credits),
            amount_to_add_credits: update
                .amount_to_add_credits
                .unwrap_or(self.amount_to_add_credits),
            charge_amount: update.charge_amount.unwrap_or(self.charge_amount),
            currency: update
                .currency
                .as_deref()
                .unwrap_or(&self.currency)
                .trim()
                .to_lowercase(),
        };

        if next.enabled {
            next.validate_enabled()?;
        } else if next.currency.is_empty() {
            next.currency = DEFAULT_CURRENCY.to_string();
        }

        Ok(next)
    }

    /// Constraints that hold whenever auto-recharge is switched on
    pub fn validate_enabled(&self) -> BillingResult<()> {
        if self.threshold_credits < 0 {
            return Err(BillingError::invalid(
                "thresholdCredits",
                "must be a non-negative number",
            ));
        }
        if self.amount_to_add_credits <= 0 {
            return Err(BillingError::invalid(
                "amountToAddCredits",
                "must be a positive number",
            ));
        }
        if self.charge_amount <= 0 {
            return Err(BillingError::invalid(
                "chargeAmount",
                "must be a positive integer in minor units",
            ));
        }
        if !is_currency_code(&self.currency) {
            return Err(BillingError::invalid(
                "currency",
                format!("{:?} is not a 3-letter currency code", self.currency),
            ));
        }
        Ok(())
    }
}

fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
}

/// Settings read/update operations for the route layer
pub struct AutoRechargeService {
    store: Arc<dyn EntitlementStore>,
}

impl AutoRechargeService {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    async fn load(&self, workspace_id: WorkspaceId) -> BillingResult<WorkspaceBilling> {
        self.store
            .get_workspace_billing(workspace_id)
            .await?
            .ok_or(BillingError::WorkspaceNotFound(workspace_id))
    }

    pub async fn get_settings(&self, workspace_id: WorkspaceId) -> BillingResult<AutoRechargeSettings> {
        Ok(self.load(workspace_id).await?.auto_recharge)
    }

    /// Apply a partial update. Validation failures come back as
    /// [`BillingError::InvalidSetting`] and leave the stored record untouched.
    pub async fn update_settings(
        &self,
        workspace_id: WorkspaceId,
        update: &AutoRechargeUpdate,
    ) -> BillingResult<AutoRechargeSettings> {
        let current = self.load(workspace_id).await?.auto_recharge;
        let settings = current.apply(update)?;
        self.store.save_auto_recharge(workspace_id, &settings).await?;

        tracing::info!(
            workspace_id = %workspace_id,
            enabled = settings.enabled,
            threshold_credits = settings.threshold_credits,
            amount_to_add_credits = settings.amount_to_add_credits,
            charge_amount = settings.charge_amount,
            currency = %settings.currency,
            "Auto-recharge settings updated"
        );

        Ok(settings)
    }
}
