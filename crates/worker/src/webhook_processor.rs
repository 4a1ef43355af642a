//! Webhook inbox processing
//!
//! Drains verified provider events from the inbox into the reconciler and
//! prunes rows that have been processed.

use chrono::{Duration, Utc};
use intervo_billing::BillingService;
use tracing::{debug, error, info, warn};

/// Rows claimed per run
const BATCH_SIZE: i64 = 50;

/// Reconcile pending inbox rows in arrival order
pub async fn process_webhook_queue(billing: &BillingService) {
    match billing
        .inbox
        .process_pending(&billing.webhooks, BATCH_SIZE)
        .await
    {
        Ok(stats) if stats.claimed == 0 => {
            debug!("Webhook inbox empty");
        }
        Ok(stats) => {
            info!(
                claimed = stats.claimed,
                applied = stats.applied,
                skipped = stats.skipped,
                ignored = stats.ignored,
                failed = stats.failed,
                retried = stats.retried,
                undecodable = stats.undecodable,
                "Webhook inbox batch processed"
            );
            if stats.claimed as i64 == BATCH_SIZE {
                warn!("Webhook inbox batch full, backlog may be growing");
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to process webhook inbox");
        }
    }
}

/// Delete processed rows older than `retention_days`
pub async fn cleanup_old_webhooks(billing: &BillingService, retention_days: i64) {
    let cutoff = Utc::now() - Duration::days(retention_days);
    match billing.inbox.prune_processed(cutoff).await {
        Ok(deleted) => {
            info!(
                deleted = deleted,
                retention_days = retention_days,
                "Cleaned up processed webhook inbox rows"
            );
        }
        Err(e) => {
            error!(error = %e, "Failed to clean up webhook inbox");
        }
    }
}
