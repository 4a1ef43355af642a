//! Payment provider query API
//!
//! The reconciler reads and writes provider state only through
//! [`PaymentProvider`]. [`StripeClient`] is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CreateSubscription, CreateSubscriptionItems, Customer, CustomerId, CustomerInvoiceSettings,
    ListPaymentMethods, ListSubscriptions, PaymentMethodTypeFilter, PriceId, Subscription,
    SubscriptionId, SubscriptionStatusFilter, UpdateCustomer,
};

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{PriceSnapshot, Recurring, SubscriptionItem, SubscriptionItems, SubscriptionSnapshot};

/// Parameters for creating a subscription from a saved payment method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub customer_id: String,
    pub price_id: String,
    pub default_payment_method: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;

    /// Subscriptions of any status held by `customer_id` for `price_id`
    async fn list_subscriptions(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<Vec<SubscriptionSnapshot>>;

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> BillingResult<SubscriptionSnapshot>;

    /// Ids of the card payment methods attached to `customer_id`
    async fn list_card_payment_methods(&self, customer_id: &str) -> BillingResult<Vec<String>>;
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: BillingConfig,
}

impl StripeClient {
    pub fn new(config: BillingConfig) -> Self {
        let inner = stripe::Client::new(config.stripe_secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(BillingConfig::from_env()?))
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }
}

fn parse_id<T: std::str::FromStr>(kind: &str, raw: &str) -> BillingResult<T> {
    raw.parse()
        .map_err(|_| BillingError::StripeApi(format!("invalid {kind} id: {raw}")))
}

fn snapshot(subscription: &Subscription) -> BillingResult<SubscriptionSnapshot> {
    let items = subscription
        .items
        .data
        .iter()
        .map(|item| SubscriptionItem {
            price: item.price.as_ref().map(|price| PriceSnapshot {
                id: price.id.to_string(),
                recurring: price.recurring.as_ref().map(|recurring| Recurring {
                    interval: recurring.interval.as_str().to_string(),
                }),
            }),
        })
        .collect();

    Ok(SubscriptionSnapshot {
        id: subscription.id.to_string(),
        customer: Some(subscription.customer.id().to_string()),
        status: subscription
            .status
            .as_str()
            .parse()
            .map_err(|e: intervo_shared::ParseEnumError| BillingError::StripeApi(e.to_string()))?,
        current_period_start: Some(subscription.current_period_start),
        current_period_end: Some(subscription.current_period_end),
        trial_end: subscription.trial_end,
        items: SubscriptionItems { data: items },
        metadata: subscription.metadata.clone(),
    })
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id: SubscriptionId = parse_id("subscription", subscription_id)?;
        let subscription = Subscription::retrieve(&self.inner, &id, &[]).await?;
        snapshot(&subscription)
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<Vec<SubscriptionSnapshot>> {
        let mut params = ListSubscriptions::new();
        params.customer = Some(parse_id::<CustomerId>("customer", customer_id)?);
        params.price = Some(parse_id::<PriceId>("price", price_id)?);
        params.status = Some(SubscriptionStatusFilter::All);
        params.limit = Some(10);

        let list = Subscription::list(&self.inner, &params).await?;
        list.data.iter().map(snapshot).collect()
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let id: CustomerId = parse_id("customer", customer_id)?;
        let mut params = UpdateCustomer::new();
        params.invoice_settings = Some(CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.to_string()),
            ..Default::default()
        });

        Customer::update(&self.inner, &id, params).await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> BillingResult<SubscriptionSnapshot> {
        let customer: CustomerId = parse_id("customer", &request.customer_id)?;
        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            ..Default::default()
        }]);
        params.default_payment_method = Some(&request.default_payment_method);
        params.metadata = Some(request.metadata.clone());
        params.expand = &["latest_invoice.payment_intent"];

        let subscription = Subscription::create(&self.inner, params).await?;
        snapshot(&subscription)
    }

    async fn list_card_payment_methods(&self, customer_id: &str) -> BillingResult<Vec<String>> {
        let mut params = ListPaymentMethods::new();
        params.customer = Some(parse_id::<CustomerId>("customer", customer_id)?);
        params.type_ = Some(PaymentMethodTypeFilter::Card);

        let list = stripe::PaymentMethod::list(&self.inner, &params).await?;
        Ok(list.data.iter().map(|pm| pm.id.to_string()).collect())
    }
}
