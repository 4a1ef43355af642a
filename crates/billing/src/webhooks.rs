//! Event Reconciler
//!
//! Applies payment-provider events to workspace billing records. Delivery is
//! at-least-once and unordered, so every handler reads the current record,
//! checks its guard conditions and writes only when the event changes
//! something ("compare-and-skip"). The provider stays the source of truth for
//! subscription status.
//!
//! [`WebhookHandler::reconcile`] always acknowledges. Guard misses and
//! invalid references are logged, internal errors are logged and recorded
//! in the [`EventLog`] for operators.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use intervo_shared::{CreditSource, ParseEnumError, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutSession, IntentPurpose, Invoice, PaymentIntent, PaymentMethod, ProviderEvent,
    ProviderEventKind, SetupIntent, SubscriptionSnapshot,
};
use crate::provider::{NewSubscription, PaymentProvider};
use crate::store::{CreditGrant, EntitlementStore, WorkspaceBilling};

type HmacSha256 = Hmac<Sha256>;

/// Credits granted per whole USD of a pay-as-you-go top-up
pub const TOP_UP_CREDITS_PER_USD: i64 = 200;
/// Top-ups in any other currency are rejected, not converted
pub const TOP_UP_CURRENCY: &str = "usd";

/// Credits for a top-up of `amount_minor` cents, rounded down
pub fn top_up_credits(amount_minor: i64) -> i64 {
    amount_minor
        .saturating_mul(TOP_UP_CREDITS_PER_USD)
        .div_euclid(100)
}

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// State changed (locally or at the provider)
    Applied,
    /// A guard condition found nothing to do
    Skipped,
    /// Not actionable: unhandled kind or an unresolvable reference
    Ignored,
    /// An internal error stopped processing
    Failed,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Skipped => "skipped",
            EventOutcome::Ignored => "ignored",
            EventOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventOutcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(EventOutcome::Applied),
            "skipped" => Ok(EventOutcome::Skipped),
            "ignored" => Ok(EventOutcome::Ignored),
            "failed" => Ok(EventOutcome::Failed),
            other => Err(ParseEnumError {
                kind: "event outcome",
                value: other.to_string(),
            }),
        }
    }
}

/// Audit entry written for every reconciled event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub outcome: EventOutcome,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Where event outcomes are recorded
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Most recent outcome recorded for `event_id`
    async fn last_outcome(&self, event_id: &str) -> BillingResult<Option<EventOutcome>>;

    async fn record_event(&self, record: &WebhookEventRecord) -> BillingResult<()>;
}

/// Returned to the provider. `received` is always true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub received: bool,
    #[serde(skip)]
    pub outcome: EventOutcome,
}

impl Acknowledgement {
    fn received(outcome: EventOutcome) -> Self {
        Self {
            received: true,
            outcome,
        }
    }
}

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`).
///
/// The signed payload is `"{t}.{payload}"` under HMAC-SHA256 keyed by the
/// endpoint secret. Headers older or newer than `tolerance_secs` relative to
/// `now_unix` are rejected.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let skew = now_unix.saturating_sub(timestamp).saturating_abs();
    if skew > tolerance_secs {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            skew = skew,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Reconciles provider events against the entitlement store
pub struct WebhookHandler {
    store: Arc<dyn EntitlementStore>,
    event_log: Arc<dyn EventLog>,
    provider: Arc<dyn PaymentProvider>,
    clock: Arc<dyn Clock>,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        event_log: Arc<dyn EventLog>,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
        webhook_secret: impl Into<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            store,
            event_log,
            provider,
            clock,
            webhook_secret: webhook_secret.into(),
            tolerance_secs,
        }
    }

    /// Verify the signature header and decode the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<ProviderEvent> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            self.clock.now().timestamp(),
            self.tolerance_secs,
        )?;

        let event = ProviderEvent::from_json(payload)?;
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.kind.type_name(),
            "Webhook signature verified"
        );
        Ok(event)
    }

    /// Entry point for raw deliveries. Only an invalid signature or an
    /// undecodable envelope is an error; everything after that is
    /// acknowledged.
    pub async fn handle_payload(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<Acknowledgement> {
        let event = self.verify_event(payload, signature)?;
        Ok(self.reconcile(&event).await)
    }

    /// Apply one event. Always acknowledges receipt.
    pub async fn reconcile(&self, event: &ProviderEvent) -> Acknowledgement {
        let event_type = event.kind.type_name().to_string();

        match self.event_log.last_outcome(&event.id).await {
            Ok(Some(EventOutcome::Applied)) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event_type,
                    "Duplicate webhook event already applied"
                );
                return Acknowledgement::received(EventOutcome::Skipped);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    error = %e,
                    "Could not read event log, processing anyway"
                );
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event_type,
            "Processing provider event"
        );

        let (outcome, error) = match self.apply(event).await {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event_type,
                    error = %e,
                    "Failed to apply provider event"
                );
                (EventOutcome::Failed, Some(e.to_string()))
            }
        };

        let record = WebhookEventRecord {
            event_id: event.id.clone(),
            event_type,
            outcome,
            error,
            processed_at: self.clock.now(),
        };
        if let Err(e) = self.event_log.record_event(&record).await {
            tracing::warn!(
                event_id = %record.event_id,
                error = %e,
                "Failed to record webhook event outcome"
            );
        }

        Acknowledgement::received(outcome)
    }

    async fn apply(&self, event: &ProviderEvent) -> BillingResult<EventOutcome> {
        match &event.kind {
            ProviderEventKind::CheckoutCompleted(session) => {
                self.handle_checkout_completed(session).await
            }
            ProviderEventKind::PaymentIntentSucceeded(intent) => {
                self.handle_payment_intent_succeeded(intent).await
            }
            ProviderEventKind::SubscriptionCreated(subscription)
            | ProviderEventKind::SubscriptionUpdated(subscription) => {
                self.handle_subscription_changed(subscription).await
            }
            ProviderEventKind::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(subscription).await
            }
            ProviderEventKind::InvoicePaid(invoice) => self.handle_invoice_paid(invoice).await,
            ProviderEventKind::InvoicePaymentFailed(invoice) => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    customer_id = ?invoice.customer,
                    subscription_id = ?invoice.subscription,
                    "Invoice payment failed, waiting for subscription status event"
                );
                Ok(EventOutcome::Ignored)
            }
            ProviderEventKind::SetupIntentSucceeded(intent) => {
                self.handle_setup_intent_succeeded(intent).await
            }
            ProviderEventKind::PaymentMethodDetached(method) => {
                self.handle_payment_method_detached(method)
            }
            ProviderEventKind::Unhandled(type_) => {
                tracing::info!(event_type = %type_, "Unhandled provider event type");
                Ok(EventOutcome::Ignored)
            }
        }
    }

    async fn workspace_for_customer(
        &self,
        customer_id: &str,
        context: &str,
    ) -> BillingResult<Option<WorkspaceBilling>> {
        let record = self.store.find_by_customer(customer_id).await?;
        if record.is_none() {
            tracing::warn!(
                customer_id = %customer_id,
                context = %context,
                "No workspace linked to customer"
            );
        }
        Ok(record)
    }

    /// Workspace named by intent metadata, only if it belongs to `customer_id`
    async fn workspace_by_id_and_customer(
        &self,
        workspace_id: &str,
        customer_id: &str,
    ) -> BillingResult<Option<WorkspaceBilling>> {
        let Ok(id) = workspace_id.parse::<Uuid>() else {
            tracing::warn!(workspace_id = %workspace_id, "Malformed workspace id in metadata");
            return Ok(None);
        };

        let record = self
            .store
            .get_workspace_billing(id)
            .await?
            .filter(|record| record.customer_id.as_deref() == Some(customer_id));

        if record.is_none() {
            tracing::warn!(
                workspace_id = %workspace_id,
                customer_id = %customer_id,
                "Workspace not found or customer mismatch"
            );
        }
        Ok(record)
    }

    // =========================================================================
    // Checkout completed
    // =========================================================================

    async fn handle_checkout_completed(
        &self,
        session: &CheckoutSession,
    ) -> BillingResult<EventOutcome> {
        let (Some(customer_id), Some(subscription_id)) =
            (session.customer.as_deref(), session.subscription.as_deref())
        else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout session missing customer or subscription id"
            );
            return Ok(EventOutcome::Ignored);
        };

        let Some(mut record) = self
            .workspace_for_customer(customer_id, "checkout.session.completed")
            .await?
        else {
            return Ok(EventOutcome::Ignored);
        };

        let subscription = self.provider.retrieve_subscription(subscription_id).await?;

        if record.subscription_id.as_deref() == Some(subscription.id.as_str())
            && record.subscription_status == subscription.status
        {
            tracing::info!(
                workspace_id = %record.workspace_id,
                subscription_id = %subscription.id,
                "Checkout already reconciled"
            );
            return Ok(EventOutcome::Skipped);
        }

        let interval = subscription.interval();
        record.subscription_id = Some(subscription.id.clone());
        record.subscription_status = subscription.status;
        record.price_id = subscription.price_id().map(str::to_string);
        record.billing_cycle_interval = interval;
        record.billing_cycle_anchor = subscription
            .trial_end()
            .or_else(|| subscription.current_period_start());
        record.plan_allocated_credits = Some(interval.plan_allocated_credits());

        self.store.save_workspace_billing(&record).await?;

        tracing::info!(
            workspace_id = %record.workspace_id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            interval = %interval,
            "Checkout completed, workspace linked to subscription"
        );
        Ok(EventOutcome::Applied)
    }

    // =========================================================================
    // Payment intent succeeded
    // =========================================================================

    async fn handle_payment_intent_succeeded(
        &self,
        intent: &PaymentIntent,
    ) -> BillingResult<EventOutcome> {
        match intent.purpose() {
            IntentPurpose::SubscriptionSetup {
                price_id,
                workspace_id,
                user_id,
            } => {
                self.create_subscription_from_intent(intent, price_id, workspace_id, user_id)
                    .await
            }
            IntentPurpose::PayAsYouGoTopUp { workspace_id } => {
                self.apply_top_up(intent, workspace_id).await
            }
            IntentPurpose::Other => {
                tracing::info!(
                    payment_intent_id = %intent.id,
                    "Payment intent is neither subscription setup nor top-up"
                );
                Ok(EventOutcome::Ignored)
            }
        }
    }

    async fn create_subscription_from_intent(
        &self,
        intent: &PaymentIntent,
        price_id: Option<&str>,
        workspace_id: Option<&str>,
        user_id: Option<&str>,
    ) -> BillingResult<EventOutcome> {
        let (Some(price_id), Some(workspace_id), Some(customer_id), Some(payment_method)) = (
            price_id,
            workspace_id,
            intent.customer.as_deref(),
            intent.payment_method.as_deref(),
        ) else {
            tracing::warn!(
                payment_intent_id = %intent.id,
                "Subscription setup intent missing price, workspace, customer or payment method"
            );
            return Ok(EventOutcome::Ignored);
        };

        let Some(mut record) = self
            .workspace_by_id_and_customer(workspace_id, customer_id)
            .await?
        else {
            return Ok(EventOutcome::Ignored);
        };

        let existing = self
            .provider
            .list_subscriptions(customer_id, price_id)
            .await?;
        if let Some(live) = existing.iter().find(|sub| sub.status.is_live()) {
            tracing::info!(
                workspace_id = %record.workspace_id,
                subscription_id = %live.id,
                status = %live.status,
                "Subscription for price already exists, not creating another"
            );
            return Ok(EventOutcome::Skipped);
        }

        if let Err(e) = self
            .provider
            .set_default_payment_method(customer_id, payment_method)
            .await
        {
            tracing::warn!(
                customer_id = %customer_id,
                payment_method_id = %payment_method,
                error = %e,
                "Failed to set default payment method (non-fatal)"
            );
        }

        let mut metadata = HashMap::from([
            ("workspaceId".to_string(), record.workspace_id.to_string()),
            ("triggeringPaymentIntent".to_string(), intent.id.clone()),
        ]);
        if let Some(user_id) = user_id {
            metadata.insert("userId".to_string(), user_id.to_string());
        }

        let subscription = self
            .provider
            .create_subscription(&NewSubscription {
                customer_id: customer_id.to_string(),
                price_id: price_id.to_string(),
                default_payment_method: payment_method.to_string(),
                metadata,
            })
            .await?;

        let interval = subscription.interval();
        record.subscription_id = Some(subscription.id.clone());
        record.subscription_status = subscription.status;
        record.price_id = Some(price_id.to_string());
        record.billing_cycle_interval = interval;
        record.billing_cycle_anchor = subscription.current_period_end();
        record.plan_allocated_credits = Some(interval.plan_allocated_credits());

        if let Err(e) = self.store.save_workspace_billing(&record).await {
            // The subscription exists at the provider; its created event will
            // link it once the store is reachable again.
            tracing::error!(
                workspace_id = %record.workspace_id,
                subscription_id = %subscription.id,
                error = %e,
                "RECONCILIATION NEEDED: subscription created but workspace not updated"
            );
            return Err(e);
        }

        tracing::info!(
            workspace_id = %record.workspace_id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            interval = %interval,
            "Subscription created from setup payment"
        );
        Ok(EventOutcome::Applied)
    }

    async fn apply_top_up(
        &self,
        intent: &PaymentIntent,
        workspace_id: Option<&str>,
    ) -> BillingResult<EventOutcome> {
        let (Some(workspace_id), Some(customer_id)) = (workspace_id, intent.customer.as_deref())
        else {
            tracing::warn!(
                payment_intent_id = %intent.id,
                "Top-up intent missing workspace or customer id"
            );
            return Ok(EventOutcome::Ignored);
        };

        let Some(mut record) = self
            .workspace_by_id_and_customer(workspace_id, customer_id)
            .await?
        else {
            return Ok(EventOutcome::Ignored);
        };

        if !intent.currency.eq_ignore_ascii_case(TOP_UP_CURRENCY) {
            tracing::warn!(
                workspace_id = %record.workspace_id,
                payment_intent_id = %intent.id,
                currency = %intent.currency,
                "Top-up not in USD, no credits added"
            );
            return Ok(EventOutcome::Ignored);
        }

        let credits = top_up_credits(intent.amount_received);
        if credits <= 0 {
            tracing::warn!(
                workspace_id = %record.workspace_id,
                payment_intent_id = %intent.id,
                credits = credits,
                "Top-up yields no credits"
            );
            return Ok(EventOutcome::Ignored);
        }

        let description = format!("Pay As You Go Top-up (PaymentIntent: {})", intent.id);
        if record
            .one_time_credits
            .iter()
            .any(|grant| grant.description == description)
        {
            tracing::info!(
                workspace_id = %record.workspace_id,
                payment_intent_id = %intent.id,
                "Top-up already credited"
            );
            return Ok(EventOutcome::Skipped);
        }

        record.one_time_credits.push(CreditGrant::new(
            credits,
            CreditSource::TopUp,
            description,
            self.clock.now(),
        ));
        self.store.save_workspace_billing(&record).await?;

        tracing::info!(
            workspace_id = %record.workspace_id,
            payment_intent_id = %intent.id,
            credits = credits,
            "Top-up credits added"
        );
        Ok(EventOutcome::Applied)
    }

    // =========================================================================
    // Subscription lifecycle
    // =========================================================================

    async fn handle_subscription_changed(
        &self,
        subscription: &SubscriptionSnapshot,
    ) -> BillingResult<EventOutcome> {
        let Some(customer_id) = subscription.customer.as_deref() else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Subscription event missing customer id"
            );
            return Ok(EventOutcome::Ignored);
        };

        let Some(mut record) = self
            .workspace_for_customer(customer_id, "subscription event")
            .await?
        else {
            return Ok(EventOutcome::Ignored);
        };

        let same_subscription = record
            .subscription_id
            .as_deref()
            .map_or(true, |stored| stored == subscription.id);
        if !same_subscription {
            tracing::info!(
                workspace_id = %record.workspace_id,
                stored_subscription_id = ?record.subscription_id,
                subscription_id = %subscription.id,
                "Subscription event for a different subscription, skipping"
            );
            return Ok(EventOutcome::Skipped);
        }

        let before = record.clone();

        if record.subscription_status != subscription.status || record.billing_cycle_anchor.is_none()
        {
            let interval = subscription.interval();
            record.subscription_id = Some(subscription.id.clone());
            record.subscription_status = subscription.status;
            record.price_id = subscription.price_id().map(str::to_string);
            record.billing_cycle_interval = interval;
            record.billing_cycle_anchor = subscription.current_period_end();
            record.plan_allocated_credits = Some(interval.plan_allocated_credits());
        }

        if subscription.status == SubscriptionStatus::Canceled {
            record.subscription_id = Some(subscription.id.clone());
            record.subscription_status = SubscriptionStatus::Canceled;
            record.reset_plan();
        }

        if record == before {
            tracing::info!(
                workspace_id = %record.workspace_id,
                subscription_id = %subscription.id,
                status = %subscription.status,
                "Subscription state already current"
            );
            return Ok(EventOutcome::Skipped);
        }

        self.store.save_workspace_billing(&record).await?;

        tracing::info!(
            workspace_id = %record.workspace_id,
            subscription_id = %subscription.id,
            status = %record.subscription_status,
            interval = %record.billing_cycle_interval,
            plan_allocated_credits = ?record.plan_allocated_credits,
            "Subscription synced"
        );
        Ok(EventOutcome::Applied)
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: &SubscriptionSnapshot,
    ) -> BillingResult<EventOutcome> {
        let Some(customer_id) = subscription.customer.as_deref() else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Subscription deletion missing customer id"
            );
            return Ok(EventOutcome::Ignored);
        };

        let Some(mut record) = self
            .workspace_for_customer(customer_id, "customer.subscription.deleted")
            .await?
        else {
            return Ok(EventOutcome::Ignored);
        };

        if record.subscription_id.as_deref() != Some(subscription.id.as_str()) {
            tracing::info!(
                workspace_id = %record.workspace_id,
                stored_subscription_id = ?record.subscription_id,
                subscription_id = %subscription.id,
                "Deleted subscription is not the current one, skipping"
            );
            return Ok(EventOutcome::Skipped);
        }

        let before = record.clone();
        record.subscription_status = subscription.status;
        record.reset_plan();

        if record == before {
            return Ok(EventOutcome::Skipped);
        }

        self.store.save_workspace_billing(&record).await?;

        tracing::info!(
            workspace_id = %record.workspace_id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Subscription deleted, plan credits reset"
        );
        Ok(EventOutcome::Applied)
    }

    // =========================================================================
    // Invoices and payment methods
    // =========================================================================

    async fn handle_invoice_paid(&self, invoice: &Invoice) -> BillingResult<EventOutcome> {
        let Some(customer_id) = invoice.customer.as_deref() else {
            tracing::warn!(invoice_id = %invoice.id, "Paid invoice missing customer id");
            return Ok(EventOutcome::Ignored);
        };

        let Some(mut record) = self.workspace_for_customer(customer_id, "invoice.paid").await?
        else {
            return Ok(EventOutcome::Ignored);
        };

        let matches_subscription = invoice.subscription.is_some()
            && invoice.subscription == record.subscription_id;

        if record.subscription_status.is_entitled() || !matches_subscription {
            tracing::debug!(
                workspace_id = %record.workspace_id,
                invoice_id = %invoice.id,
                status = %record.subscription_status,
                "Invoice paid, no status correction needed"
            );
            return Ok(EventOutcome::Skipped);
        }

        record.subscription_status = SubscriptionStatus::Active;
        record.plan_allocated_credits = Some(record.billing_cycle_interval.plan_allocated_credits());
        self.store.save_workspace_billing(&record).await?;

        tracing::info!(
            workspace_id = %record.workspace_id,
            invoice_id = %invoice.id,
            plan_allocated_credits = ?record.plan_allocated_credits,
            "Invoice paid, subscription marked active"
        );
        Ok(EventOutcome::Applied)
    }

    async fn handle_setup_intent_succeeded(
        &self,
        intent: &SetupIntent,
    ) -> BillingResult<EventOutcome> {
        let (Some(customer_id), Some(payment_method)) =
            (intent.customer.as_deref(), intent.payment_method.as_deref())
        else {
            tracing::warn!(
                setup_intent_id = %intent.id,
                "Setup intent missing customer or payment method"
            );
            return Ok(EventOutcome::Ignored);
        };

        let cards = self.provider.list_card_payment_methods(customer_id).await?;
        if cards.len() != 1 {
            tracing::info!(
                customer_id = %customer_id,
                card_count = cards.len(),
                "Customer has other cards, leaving default payment method"
            );
            return Ok(EventOutcome::Ignored);
        }

        self.provider
            .set_default_payment_method(customer_id, payment_method)
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method,
            "First card set as default payment method"
        );
        Ok(EventOutcome::Applied)
    }

    fn handle_payment_method_detached(&self, method: &PaymentMethod) -> BillingResult<EventOutcome> {
        tracing::info!(
            payment_method_id = %method.id,
            customer_id = ?method.customer,
            "Payment method detached"
        );
        Ok(EventOutcome::Ignored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    // =========================================================================
    // Signature verification
    // =========================================================================

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000, SECRET);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_100, 300).is_ok());
    }

    #[test]
    fn test_any_v1_may_match() {
        let payload = r#"{"id":"evt_1"}"#;
        let good = sign(payload, 1_700_000_000, SECRET);
        let header = format!("t=1700000000,v1=deadbeef,{}", good.split_once(',').unwrap().1);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000, 300).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"id":"evt_1"}"#, 1_700_000_000, SECRET);
        let err = verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, 1_700_000_000, 300)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000, "whsec_other");
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000, 300).is_err());
    }

    #[test]
    fn test_stale_and_future_timestamps_rejected() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000, SECRET);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_301, 300).is_err());
        assert!(verify_signature(payload, &header, SECRET, 1_699_999_699, 300).is_err());
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_300, 300).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        for header in ["", "t=abc,v1=00", "v1=00", "t=1700000000", "garbage"] {
            assert!(
                verify_signature("{}", header, SECRET, 1_700_000_000, 300).is_err(),
                "{header:?} should be rejected"
            );
        }
    }

    // =========================================================================
    // Top-up arithmetic
    // =========================================================================

    #[test]
    fn test_top_up_credit_rate() {
        assert_eq!(top_up_credits(2550), 5100);
        assert_eq!(top_up_credits(100), 200);
        assert_eq!(top_up_credits(1), 2);
        assert_eq!(top_up_credits(0), 0);
        assert!(top_up_credits(-500) <= 0);
    }

    #[test]
    fn test_outcome_round_trip() {
        for outcome in [
            EventOutcome::Applied,
            EventOutcome::Skipped,
            EventOutcome::Ignored,
            EventOutcome::Failed,
        ] {
            assert_eq!(outcome.as_str().parse::<EventOutcome>().unwrap(), outcome);
        }
    }
}
