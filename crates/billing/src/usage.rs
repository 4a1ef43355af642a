//! Usage Aggregator
//!
//! Read side of the activity ledger. Activities are written elsewhere; this
//! crate only sums the credits they consumed inside a window.

use async_trait::async_trait;
use intervo_shared::WorkspaceId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::cycle::UsageWindow;
use crate::error::BillingResult;

/// Lifecycle state of an activity in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityStatus {
    InProgress,
    Completed,
    Missed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::InProgress => "in-progress",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Missed => "missed",
        }
    }
}

#[async_trait]
pub trait UsageAggregator: Send + Sync {
    /// Sum of `credits_used` over activities with `status` whose creation
    /// time falls in `[window.start, window.end)`.
    async fn sum_credits_used(
        &self,
        workspace_id: WorkspaceId,
        status: ActivityStatus,
        window: UsageWindow,
    ) -> BillingResult<i64>;
}

/// Aggregates usage from the `activities` table
#[derive(Clone)]
pub struct PgUsageAggregator {
    pool: PgPool,
}

impl PgUsageAggregator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageAggregator for PgUsageAggregator {
    async fn sum_credits_used(
        &self,
        workspace_id: WorkspaceId,
        status: ActivityStatus,
        window: UsageWindow,
    ) -> BillingResult<i64> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(credits_used), 0)::BIGINT
            FROM activities
            WHERE workspace_id = $1
              AND status = $2
              AND created_at >= $3
              AND created_at < $4
            "#,
        )
        .bind(workspace_id)
        .bind(status.as_str())
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    async fn record_activity(
        pool: &PgPool,
        workspace_id: WorkspaceId,
        status: ActivityStatus,
        credits_used: i64,
        created_at: DateTime<Utc>,
    ) {
        sqlx::query(
            "INSERT INTO activities (id, workspace_id, status, credits_used, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(status.as_str())
        .bind(credits_used)
        .bind(created_at)
        .execute(pool)
        .await
        .expect("seed activity");
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn test_sum_is_half_open_and_completed_only(pool: PgPool) {
        let workspace_id = Uuid::new_v4();
        let window = UsageWindow {
            start: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
        };

        // Counted: exactly at start and one second before end.
        record_activity(&pool, workspace_id, ActivityStatus::Completed, 100, window.start).await;
        record_activity(
            &pool,
            workspace_id,
            ActivityStatus::Completed,
            20,
            window.end - Duration::seconds(1),
        )
        .await;

        // Not counted: at end, before start, other statuses, other workspace.
        record_activity(&pool, workspace_id, ActivityStatus::Completed, 1_000, window.end).await;
        record_activity(
            &pool,
            workspace_id,
            ActivityStatus::Completed,
            1_000,
            window.start - Duration::seconds(1),
        )
        .await;
        let mid = window.start + Duration::days(10);
        record_activity(&pool, workspace_id, ActivityStatus::InProgress, 1_000, mid).await;
        record_activity(&pool, workspace_id, ActivityStatus::Missed, 1_000, mid).await;
        record_activity(&pool, Uuid::new_v4(), ActivityStatus::Completed, 1_000, mid).await;

        let aggregator = PgUsageAggregator::new(pool);
        let total = aggregator
            .sum_credits_used(workspace_id, ActivityStatus::Completed, window)
            .await
            .unwrap();
        assert_eq!(total, 120);

        let empty = aggregator
            .sum_credits_used(Uuid::new_v4(), ActivityStatus::Completed, window)
            .await
            .unwrap();
        assert_eq!(empty, 0);
    }
}
