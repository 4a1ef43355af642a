//! Entitlement Store
//!
//! The durable per-workspace billing record and the contract the rest of the
//! crate uses to read and write it. Two implementations live here:
//!
//! - [`PgEntitlementStore`]: Postgres via sqlx, used in production
//! - [`InMemoryEntitlementStore`]: a lock-guarded map for tests and local runs
//!
//! No transaction spans a read followed by a write. Callers re-check guard
//! conditions on the state they read and the last write wins at record level.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intervo_shared::{BillingInterval, CreditSource, SubscriptionStatus, WorkspaceId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auto_recharge::AutoRechargeSettings;
use crate::error::{BillingError, BillingResult};
use crate::webhooks::{EventLog, EventOutcome, WebhookEventRecord};

/// A one-time credit allotment. Never mutated or deleted once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditGrant {
    pub id: Uuid,
    pub amount: i64,
    pub source: CreditSource,
    pub description: String,
    pub added_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreditGrant {
    pub fn new(
        amount: i64,
        source: CreditSource,
        description: impl Into<String>,
        added_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            amount,
            source,
            description: description.into(),
            added_at: Some(added_at),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// A grant counts toward balances until its expiry instant has passed.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires) => expires > now,
            None => true,
        }
    }
}

/// Billing state of one workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceBilling {
    pub workspace_id: WorkspaceId,
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    pub billing_cycle_interval: BillingInterval,
    /// `None` until a subscription event has written it
    pub plan_allocated_credits: Option<i64>,
    pub one_time_credits: Vec<CreditGrant>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub auto_recharge: AutoRechargeSettings,
}

impl WorkspaceBilling {
    /// The record a workspace starts with: no subscription, no credits.
    pub fn new(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            billing_cycle_anchor: None,
            billing_cycle_interval: BillingInterval::Free,
            plan_allocated_credits: None,
            one_time_credits: Vec::new(),
            customer_id: None,
            subscription_id: None,
            subscription_status: SubscriptionStatus::None,
            price_id: None,
            auto_recharge: AutoRechargeSettings::default(),
        }
    }

    pub fn with_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    /// Grants that have not expired at `now`
    pub fn active_grants(&self, now: DateTime<Utc>) -> impl Iterator<Item = &CreditGrant> {
        self.one_time_credits
            .iter()
            .filter(move |grant| grant.is_active_at(now))
    }

    pub fn has_valid_one_time_credits(&self, now: DateTime<Utc>) -> bool {
        self.active_grants(now).next().is_some()
    }

    /// Drop the subscription allocation after cancellation or deletion.
    pub fn reset_plan(&mut self) {
        self.billing_cycle_interval = BillingInterval::Free;
        self.plan_allocated_credits = Some(0);
        self.billing_cycle_anchor = None;
    }
}

/// Read/write access to workspace billing records
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn get_workspace_billing(
        &self,
        workspace_id: WorkspaceId,
    ) -> BillingResult<Option<WorkspaceBilling>>;

    /// The workspace linked to a payment-provider customer, if any
    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<WorkspaceBilling>>;

    /// Upsert the record. Grants already stored are left untouched.
    async fn save_workspace_billing(&self, record: &WorkspaceBilling) -> BillingResult<()>;

    /// Overwrite only the auto-recharge settings of an existing record.
    /// Subscription fields written concurrently by the reconciler survive.
    async fn save_auto_recharge(
        &self,
        workspace_id: WorkspaceId,
        settings: &AutoRechargeSettings,
    ) -> BillingResult<()>;

    async fn list_workspace_billing(&self) -> BillingResult<Vec<WorkspaceBilling>>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryEntitlementStore {
    records: RwLock<HashMap<WorkspaceId, WorkspaceBilling>>,
    events: RwLock<Vec<WebhookEventRecord>>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, replacing any record for the same workspace
    pub async fn insert(&self, record: WorkspaceBilling) {
        self.records.write().await.insert(record.workspace_id, record);
    }

    /// Every event outcome recorded so far, oldest first
    pub async fn recorded_events(&self) -> Vec<WebhookEventRecord> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn get_workspace_billing(
        &self,
        workspace_id: WorkspaceId,
    ) -> BillingResult<Option<WorkspaceBilling>> {
        Ok(self.records.read().await.get(&workspace_id).cloned())
    }

    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<WorkspaceBilling>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|record| record.customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn save_workspace_billing(&self, record: &WorkspaceBilling) -> BillingResult<()> {
        let mut records = self.records.write().await;
        let mut next = record.clone();

        // Append-only grants: keep anything stored even if the caller's copy is stale.
        if let Some(existing) = records.get(&record.workspace_id) {
            for grant in &existing.one_time_credits {
                if !next.one_time_credits.iter().any(|g| g.id == grant.id) {
                    next.one_time_credits.push(grant.clone());
                }
            }
        }

        records.insert(record.workspace_id, next);
        Ok(())
    }

    async fn save_auto_recharge(
        &self,
        workspace_id: WorkspaceId,
        settings: &AutoRechargeSettings,
    ) -> BillingResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&workspace_id)
            .ok_or(BillingError::WorkspaceNotFound(workspace_id))?;
        record.auto_recharge = settings.clone();
        Ok(())
    }

    async fn list_workspace_billing(&self) -> BillingResult<Vec<WorkspaceBilling>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl EventLog for InMemoryEntitlementStore {
    async fn last_outcome(&self, event_id: &str) -> BillingResult<Option<EventOutcome>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .rev()
            .find(|record| record.event_id == event_id)
            .map(|record| record.outcome))
    }

    async fn record_event(&self, record: &WebhookEventRecord) -> BillingResult<()> {
        self.events.write().await.push(record.clone());
        Ok(())
    }
}

// =============================================================================
// Postgres implementation
// =============================================================================

/// Row type for `workspace_billing`
#[derive(Debug, sqlx::FromRow)]
struct WorkspaceBillingRow {
    workspace_id: Uuid,
    billing_cycle_anchor: Option<DateTime<Utc>>,
    billing_cycle_interval: String,
    plan_allocated_credits: Option<i64>,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    subscription_status: String,
    stripe_price_id: Option<String>,
    auto_recharge_enabled: bool,
    auto_recharge_threshold_credits: i64,
    auto_recharge_amount_to_add_credits: i64,
    auto_recharge_charge_amount: i64,
    auto_recharge_currency: String,
}

/// Row type for `workspace_credit_grants`
#[derive(Debug, sqlx::FromRow)]
struct CreditGrantRow {
    id: Uuid,
    workspace_id: Uuid,
    amount: i64,
    source: String,
    description: String,
    added_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

impl CreditGrantRow {
    fn into_grant(self) -> BillingResult<CreditGrant> {
        Ok(CreditGrant {
            id: self.id,
            amount: self.amount,
            source: self.source.parse()?,
            description: self.description,
            added_at: self.added_at,
            expires_at: self.expires_at,
        })
    }
}

impl WorkspaceBillingRow {
    fn into_record(self, grants: Vec<CreditGrant>) -> BillingResult<WorkspaceBilling> {
        Ok(WorkspaceBilling {
            workspace_id: self.workspace_id,
            billing_cycle_anchor: self.billing_cycle_anchor,
            billing_cycle_interval: self.billing_cycle_interval.parse()?,
            plan_allocated_credits: self.plan_allocated_credits,
            one_time_credits: grants,
            customer_id: self.stripe_customer_id,
            subscription_id: self.stripe_subscription_id,
            subscription_status: self.subscription_status.parse()?,
            price_id: self.stripe_price_id,
            auto_recharge: AutoRechargeSettings {
                enabled: self.auto_recharge_enabled,
                threshold_credits: self.auto_recharge_threshold_credits,
                amount_to_add_credits: self.auto_recharge_amount_to_add_credits,
                charge_amount: self.auto_recharge_charge_amount,
                currency: self.auto_recharge_currency,
            },
        })
    }
}

const BILLING_COLUMNS: &str = r#"
    workspace_id, billing_cycle_anchor, billing_cycle_interval, plan_allocated_credits,
    stripe_customer_id, stripe_subscription_id, subscription_status, stripe_price_id,
    auto_recharge_enabled, auto_recharge_threshold_credits,
    auto_recharge_amount_to_add_credits, auto_recharge_charge_amount, auto_recharge_currency
"#;

const GRANT_COLUMNS: &str =
    "id, workspace_id, amount, source, description, added_at, expires_at";

#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_grants(&self, workspace_id: WorkspaceId) -> BillingResult<Vec<CreditGrant>> {
        let rows: Vec<CreditGrantRow> = sqlx::query_as(&format!(
            "SELECT {GRANT_COLUMNS} FROM workspace_credit_grants WHERE workspace_id = $1 ORDER BY seq"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditGrantRow::into_grant).collect()
    }

    async fn hydrate(&self, row: Option<WorkspaceBillingRow>) -> BillingResult<Option<WorkspaceBilling>> {
        match row {
            Some(row) => {
                let grants = self.load_grants(row.workspace_id).await?;
                Ok(Some(row.into_record(grants)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn get_workspace_billing(
        &self,
        workspace_id: WorkspaceId,
    ) -> BillingResult<Option<WorkspaceBilling>> {
        let row: Option<WorkspaceBillingRow> = sqlx::query_as(&format!(
            "SELECT {BILLING_COLUMNS} FROM workspace_billing WHERE workspace_id = $1"
        ))
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<WorkspaceBilling>> {
        let row: Option<WorkspaceBillingRow> = sqlx::query_as(&format!(
            "SELECT {BILLING_COLUMNS} FROM workspace_billing
             WHERE stripe_customer_id = $1
             ORDER BY created_at
             LIMIT 1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn save_workspace_billing(&self, record: &WorkspaceBilling) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workspace_billing (
                workspace_id, billing_cycle_anchor, billing_cycle_interval, plan_allocated_credits,
                stripe_customer_id, stripe_subscription_id, subscription_status, stripe_price_id,
                auto_recharge_enabled, auto_recharge_threshold_credits,
                auto_recharge_amount_to_add_credits, auto_recharge_charge_amount,
                auto_recharge_currency
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (workspace_id) DO UPDATE SET
                billing_cycle_anchor = EXCLUDED.billing_cycle_anchor,
                billing_cycle_interval = EXCLUDED.billing_cycle_interval,
                plan_allocated_credits = EXCLUDED.plan_allocated_credits,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                subscription_status = EXCLUDED.subscription_status,
                stripe_price_id = EXCLUDED.stripe_price_id,
                auto_recharge_enabled = EXCLUDED.auto_recharge_enabled,
                auto_recharge_threshold_credits = EXCLUDED.auto_recharge_threshold_credits,
                auto_recharge_amount_to_add_credits = EXCLUDED.auto_recharge_amount_to_add_credits,
                auto_recharge_charge_amount = EXCLUDED.auto_recharge_charge_amount,
                auto_recharge_currency = EXCLUDED.auto_recharge_currency,
                updated_at = NOW()
            "#,
        )
        .bind(record.workspace_id)
        .bind(record.billing_cycle_anchor)
        .bind(record.billing_cycle_interval.as_str())
        .bind(record.plan_allocated_credits)
        .bind(&record.customer_id)
        .bind(&record.subscription_id)
        .bind(record.subscription_status.as_str())
        .bind(&record.price_id)
        .bind(record.auto_recharge.enabled)
        .bind(record.auto_recharge.threshold_credits)
        .bind(record.auto_recharge.amount_to_add_credits)
        .bind(record.auto_recharge.charge_amount)
        .bind(&record.auto_recharge.currency)
        .execute(&mut *tx)
        .await?;

        for grant in &record.one_time_credits {
            sqlx::query(
                r#"
                INSERT INTO workspace_credit_grants
                    (id, workspace_id, amount, source, description, added_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(grant.id)
            .bind(record.workspace_id)
            .bind(grant.amount)
            .bind(grant.source.as_str())
            .bind(&grant.description)
            .bind(grant.added_at)
            .bind(grant.expires_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_auto_recharge(
        &self,
        workspace_id: WorkspaceId,
        settings: &AutoRechargeSettings,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workspace_billing SET
                auto_recharge_enabled = $2,
                auto_recharge_threshold_credits = $3,
                auto_recharge_amount_to_add_credits = $4,
                auto_recharge_charge_amount = $5,
                auto_recharge_currency = $6,
                updated_at = NOW()
            WHERE workspace_id = $1
            "#,
        )
        .bind(workspace_id)
        .bind(settings.enabled)
        .bind(settings.threshold_credits)
        .bind(settings.amount_to_add_credits)
        .bind(settings.charge_amount)
        .bind(&settings.currency)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::WorkspaceNotFound(workspace_id));
        }
        Ok(())
    }

    async fn list_workspace_billing(&self) -> BillingResult<Vec<WorkspaceBilling>> {
        let rows: Vec<WorkspaceBillingRow> = sqlx::query_as(&format!(
            "SELECT {BILLING_COLUMNS} FROM workspace_billing ORDER BY workspace_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let grant_rows: Vec<CreditGrantRow> = sqlx::query_as(&format!(
            "SELECT {GRANT_COLUMNS} FROM workspace_credit_grants ORDER BY seq"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut grants_by_workspace: HashMap<Uuid, Vec<CreditGrant>> = HashMap::new();
        for row in grant_rows {
            let workspace_id = row.workspace_id;
            grants_by_workspace
                .entry(workspace_id)
                .or_default()
                .push(row.into_grant()?);
        }

        rows.into_iter()
            .map(|row| {
                let grants = grants_by_workspace
                    .remove(&row.workspace_id)
                    .unwrap_or_default();
                row.into_record(grants)
            })
            .collect()
    }
}

#[async_trait]
impl EventLog for PgEntitlementStore {
    async fn last_outcome(&self, event_id: &str) -> BillingResult<Option<EventOutcome>> {
        let outcome: Option<(String,)> = sqlx::query_as(
            "SELECT outcome FROM billing_webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(outcome
            .map(|(raw,)| raw.parse::<EventOutcome>())
            .transpose()?)
    }

    async fn record_event(&self, record: &WebhookEventRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_webhook_events
                (event_id, event_type, outcome, error_message, processed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO UPDATE SET
                outcome = EXCLUDED.outcome,
                error_message = EXCLUDED.error_message,
                processed_at = EXCLUDED.processed_at
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(record.outcome.as_str())
        .bind(&record.error)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_grant_expiry_boundary() {
        let now = at(2024, 6, 1);
        let grant = CreditGrant::new(100, CreditSource::Promo, "promo", at(2024, 1, 1));
        assert!(grant.is_active_at(now), "no expiry never lapses");

        let expiring = grant.clone().expiring_at(now);
        assert!(!expiring.is_active_at(now), "expiry instant itself is lapsed");

        let later = grant.expiring_at(now + Duration::seconds(1));
        assert!(later.is_active_at(now));
    }

    #[test]
    fn test_new_record_defaults() {
        let record = WorkspaceBilling::new(Uuid::new_v4());
        assert_eq!(record.subscription_status, SubscriptionStatus::None);
        assert_eq!(record.billing_cycle_interval, BillingInterval::Free);
        assert!(record.plan_allocated_credits.is_none());
        assert!(record.billing_cycle_anchor.is_none());
        assert!(!record.auto_recharge.enabled);
    }

    #[test]
    fn test_reset_plan() {
        let mut record = WorkspaceBilling::new(Uuid::new_v4());
        record.billing_cycle_anchor = Some(at(2024, 1, 1));
        record.billing_cycle_interval = BillingInterval::Yearly;
        record.plan_allocated_credits = Some(600_000);
        record.reset_plan();
        assert_eq!(record.billing_cycle_interval, BillingInterval::Free);
        assert_eq!(record.plan_allocated_credits, Some(0));
        assert!(record.billing_cycle_anchor.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_lookup_by_customer() {
        let store = InMemoryEntitlementStore::new();
        let record = WorkspaceBilling::new(Uuid::new_v4()).with_customer("cus_123");
        store.insert(record.clone()).await;
        store.insert(WorkspaceBilling::new(Uuid::new_v4())).await;

        let found = store.find_by_customer("cus_123").await.unwrap();
        assert_eq!(found, Some(record));
        assert!(store.find_by_customer("cus_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_keeps_grants_from_stale_writes() {
        let store = InMemoryEntitlementStore::new();
        let workspace_id = Uuid::new_v4();
        let stale = WorkspaceBilling::new(workspace_id);
        store.insert(stale.clone()).await;

        let mut fresh = stale.clone();
        fresh
            .one_time_credits
            .push(CreditGrant::new(500, CreditSource::TopUp, "top-up", at(2024, 2, 1)));
        store.save_workspace_billing(&fresh).await.unwrap();

        // A writer holding the old copy must not erase the grant.
        let mut stale = stale;
        stale.subscription_status = SubscriptionStatus::Active;
        store.save_workspace_billing(&stale).await.unwrap();

        let stored = store
            .get_workspace_billing(workspace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.one_time_credits.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_auto_recharge_write_is_scoped() {
        let store = InMemoryEntitlementStore::new();
        let mut record = WorkspaceBilling::new(Uuid::new_v4()).with_customer("cus_1");
        record.subscription_status = SubscriptionStatus::Canceled;
        record.reset_plan();
        store.insert(record.clone()).await;

        let settings = AutoRechargeSettings {
            enabled: true,
            threshold_credits: 10,
            ..Default::default()
        };
        store
            .save_auto_recharge(record.workspace_id, &settings)
            .await
            .unwrap();

        let stored = store
            .get_workspace_billing(record.workspace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.auto_recharge, settings);
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(stored.plan_allocated_credits, Some(0));

        let err = store
            .save_auto_recharge(Uuid::new_v4(), &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WorkspaceNotFound(_)));
    }
}
