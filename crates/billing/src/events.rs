//! Typed payment-provider events
//!
//! Raw webhook envelopes (`{id, type, created, data: {object}}`) are decoded
//! into a closed [`ProviderEventKind`] so every kind the reconciler handles
//! carries its own typed payload. Kinds nothing reacts to are kept as
//! [`ProviderEventKind::Unhandled`] with their type string for logging.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use intervo_shared::{BillingInterval, SubscriptionStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Metadata key tagging what a payment intent pays for
pub const INTENT_TYPE_KEY: &str = "intentType";
pub const INTENT_SUBSCRIPTION_SETUP: &str = "subscription_setup";
pub const INTENT_PAYG_TOPUP: &str = "pay_as_you_go_top_up";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurring {
    pub interval: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub id: String,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<PriceSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// The parts of a provider subscription the engine reads. Used both for
/// webhook payloads and for query API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionSnapshot {
    pub fn first_price(&self) -> Option<&PriceSnapshot> {
        self.items.data.first().and_then(|item| item.price.as_ref())
    }

    pub fn price_id(&self) -> Option<&str> {
        self.first_price().map(|price| price.id.as_str())
    }

    /// Interval from the first item's price recurrence, free when absent
    pub fn interval(&self) -> BillingInterval {
        self.first_price()
            .and_then(|price| price.recurring.as_ref())
            .map_or(BillingInterval::Free, |recurring| {
                BillingInterval::from_recurring_interval(&recurring.interval)
            })
    }

    pub fn current_period_start(&self) -> Option<DateTime<Utc>> {
        self.current_period_start.and_then(timestamp)
    }

    pub fn current_period_end(&self) -> Option<DateTime<Utc>> {
        self.current_period_end.and_then(timestamp)
    }

    pub fn trial_end(&self) -> Option<DateTime<Utc>> {
        self.trial_end.and_then(timestamp)
    }
}

/// Unix seconds to UTC. Zero and out-of-range values mean "not set".
pub fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub amount_received: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub setup_future_usage: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What a succeeded payment intent was for, decoded from its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentPurpose<'a> {
    SubscriptionSetup {
        price_id: Option<&'a str>,
        workspace_id: Option<&'a str>,
        user_id: Option<&'a str>,
    },
    PayAsYouGoTopUp {
        workspace_id: Option<&'a str>,
    },
    Other,
}

impl PaymentIntent {
    fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn purpose(&self) -> IntentPurpose<'_> {
        match self.meta(INTENT_TYPE_KEY) {
            Some(INTENT_SUBSCRIPTION_SETUP)
                if self.setup_future_usage.as_deref() == Some("off_session") =>
            {
                IntentPurpose::SubscriptionSetup {
                    price_id: self.meta("priceId"),
                    workspace_id: self.meta("workspaceId"),
                    user_id: self.meta("userId"),
                }
            }
            Some(INTENT_PAYG_TOPUP) => IntentPurpose::PayAsYouGoTopUp {
                workspace_id: self.meta("workspaceId"),
            },
            _ => IntentPurpose::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupIntent {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
}

/// Every event kind the reconciler distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEventKind {
    CheckoutCompleted(CheckoutSession),
    PaymentIntentSucceeded(PaymentIntent),
    SubscriptionCreated(SubscriptionSnapshot),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    InvoicePaid(Invoice),
    InvoicePaymentFailed(Invoice),
    SetupIntentSucceeded(SetupIntent),
    PaymentMethodDetached(PaymentMethod),
    Unhandled(String),
}

impl ProviderEventKind {
    pub fn type_name(&self) -> &str {
        match self {
            ProviderEventKind::CheckoutCompleted(_) => "checkout.session.completed",
            ProviderEventKind::PaymentIntentSucceeded(_) => "payment_intent.succeeded",
            ProviderEventKind::SubscriptionCreated(_) => "customer.subscription.created",
            ProviderEventKind::SubscriptionUpdated(_) => "customer.subscription.updated",
            ProviderEventKind::SubscriptionDeleted(_) => "customer.subscription.deleted",
            ProviderEventKind::InvoicePaid(_) => "invoice.paid",
            ProviderEventKind::InvoicePaymentFailed(_) => "invoice.payment_failed",
            ProviderEventKind::SetupIntentSucceeded(_) => "setup_intent.succeeded",
            ProviderEventKind::PaymentMethodDetached(_) => "payment_method.detached",
            ProviderEventKind::Unhandled(type_) => type_,
        }
    }
}

/// A verified provider event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub id: String,
    pub created: Option<DateTime<Utc>>,
    pub kind: ProviderEventKind,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    created: Option<i64>,
    data: RawEventData,
}

fn object<T: DeserializeOwned>(type_: &str, value: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(value)
        .map_err(|e| BillingError::WebhookPayload(format!("{type_}: {e}")))
}

impl ProviderEvent {
    /// Decode a webhook envelope. Fails only when the envelope itself or the
    /// payload of a handled kind is malformed.
    pub fn from_json(payload: &str) -> BillingResult<Self> {
        let raw: RawEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayload(e.to_string()))?;
        let value = raw.data.object;
        let type_ = raw.type_.as_str();

        let kind = match type_ {
            "checkout.session.completed" => {
                ProviderEventKind::CheckoutCompleted(object(type_, value)?)
            }
            "payment_intent.succeeded" => {
                ProviderEventKind::PaymentIntentSucceeded(object(type_, value)?)
            }
            "customer.subscription.created" => {
                ProviderEventKind::SubscriptionCreated(object(type_, value)?)
            }
            "customer.subscription.updated" => {
                ProviderEventKind::SubscriptionUpdated(object(type_, value)?)
            }
            "customer.subscription.deleted" => {
                ProviderEventKind::SubscriptionDeleted(object(type_, value)?)
            }
            "invoice.paid" => ProviderEventKind::InvoicePaid(object(type_, value)?),
            "invoice.payment_failed" => {
                ProviderEventKind::InvoicePaymentFailed(object(type_, value)?)
            }
            "setup_intent.succeeded" => {
                ProviderEventKind::SetupIntentSucceeded(object(type_, value)?)
            }
            "payment_method.detached" => {
                ProviderEventKind::PaymentMethodDetached(object(type_, value)?)
            }
            other => ProviderEventKind::Unhandled(other.to_string()),
        };

        Ok(Self {
            id: raw.id,
            created: raw.created.and_then(timestamp),
            kind,
        })
    }
}
