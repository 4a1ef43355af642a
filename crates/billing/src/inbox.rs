//! Webhook inbox
//!
//! Verified webhook payloads are parked in `billing_webhook_inbox` and
//! reconciled by the worker in arrival order. The inbox is the single channel
//! through which provider events reach the reconciler, so rows are claimed
//! with `FOR UPDATE SKIP LOCKED` and two workers never apply the same row.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::error::BillingResult;
use crate::events::ProviderEvent;
use crate::webhooks::{EventOutcome, WebhookHandler};

/// Rows are given up on after this many failed reconciliation attempts
pub const MAX_INBOX_ATTEMPTS: i32 = 5;

#[derive(Debug, sqlx::FromRow)]
struct InboxRow {
    id: i64,
    event_id: String,
    payload: String,
    attempts: i32,
}

/// Counts from one drain of the inbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InboxRunStats {
    pub claimed: usize,
    pub applied: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub failed: usize,
    /// Rows left pending for another attempt
    pub retried: usize,
    pub undecodable: usize,
}

impl InboxRunStats {
    fn record(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Applied => self.applied += 1,
            EventOutcome::Skipped => self.skipped += 1,
            EventOutcome::Ignored => self.ignored += 1,
            EventOutcome::Failed => self.failed += 1,
        }
    }
}

/// Whether a row whose reconciliation produced `outcome` stays pending
fn should_retry(outcome: EventOutcome, attempts_so_far: i32) -> bool {
    outcome == EventOutcome::Failed && attempts_so_far + 1 < MAX_INBOX_ATTEMPTS
}

#[derive(Clone)]
pub struct PgWebhookInbox {
    pool: PgPool,
}

impl PgWebhookInbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Verify a delivery and queue it. Returns `false` when the event id is
    /// already queued (a provider re-delivery).
    pub async fn enqueue(
        &self,
        handler: &WebhookHandler,
        payload: &str,
        signature: &str,
    ) -> BillingResult<bool> {
        let event = handler.verify_event(payload, signature)?;

        let result = sqlx::query(
            r#"
            INSERT INTO billing_webhook_inbox (event_id, event_type, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(event.kind.type_name())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        let queued = result.rows_affected() > 0;
        tracing::info!(
            event_id = %event.id,
            event_type = %event.kind.type_name(),
            queued = queued,
            "Webhook delivery received"
        );
        Ok(queued)
    }

    /// Claim up to `batch_size` pending rows and reconcile them in order
    pub async fn process_pending(
        &self,
        handler: &WebhookHandler,
        batch_size: i64,
    ) -> BillingResult<InboxRunStats> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<InboxRow> = sqlx::query_as(
            r#"
            SELECT id, event_id, payload, attempts
            FROM billing_webhook_inbox
            WHERE processed_at IS NULL
            ORDER BY id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut stats = InboxRunStats {
            claimed: rows.len(),
            ..Default::default()
        };

        for row in rows {
            let event = match ProviderEvent::from_json(&row.payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        inbox_id = row.id,
                        event_id = %row.event_id,
                        error = %e,
                        "Queued webhook payload no longer decodes"
                    );
                    stats.undecodable += 1;
                    sqlx::query(
                        r#"
                        UPDATE billing_webhook_inbox
                        SET processed_at = NOW(), attempts = attempts + 1, last_error = $2
                        WHERE id = $1
                        "#,
                    )
                    .bind(row.id)
                    .bind(e.to_string())
                    .execute(&mut *tx)
                    .await?;
                    continue;
                }
            };

            let ack = handler.reconcile(&event).await;
            stats.record(ack.outcome);

            if should_retry(ack.outcome, row.attempts) {
                stats.retried += 1;
                sqlx::query(
                    r#"
                    UPDATE billing_webhook_inbox
                    SET attempts = attempts + 1, last_error = 'reconciliation failed'
                    WHERE id = $1
                    "#,
                )
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    r#"
                    UPDATE billing_webhook_inbox
                    SET processed_at = NOW(), attempts = attempts + 1
                    WHERE id = $1
                    "#,
                )
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(stats)
    }

    /// Delete processed rows received before `cutoff`
    pub async fn prune_processed(&self, cutoff: DateTime<Utc>) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM billing_webhook_inbox
            WHERE processed_at IS NOT NULL
              AND received_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_rows_retry_until_limit() {
        assert!(should_retry(EventOutcome::Failed, 0));
        assert!(should_retry(EventOutcome::Failed, MAX_INBOX_ATTEMPTS - 2));
        assert!(!should_retry(EventOutcome::Failed, MAX_INBOX_ATTEMPTS - 1));
    }

    #[test]
    fn test_settled_outcomes_never_retry() {
        for outcome in [
            EventOutcome::Applied,
            EventOutcome::Skipped,
            EventOutcome::Ignored,
        ] {
            assert!(!should_retry(outcome, 0));
        }
    }

    #[test]
    fn test_stats_tally() {
        let mut stats = InboxRunStats::default();
        stats.record(EventOutcome::Applied);
        stats.record(EventOutcome::Applied);
        stats.record(EventOutcome::Ignored);
        stats.record(EventOutcome::Failed);
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 0);
    }
}
