//! Billing Cycle Resolver
//!
//! Computes the half-open `[start, end)` window that usage is measured
//! against. Every function here is pure: `now` is always passed in.
//!
//! Subscription cycles step forward one interval at a time from the anchor,
//! each cycle starting where the previous one ended. Day-of-month clamping
//! therefore carries over: a Jan 31 anchor yields Feb 29, then Mar 29.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use intervo_shared::BillingInterval;
use serde::{Deserialize, Serialize};

use crate::store::CreditGrant;

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UsageWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Which source decided the window of a balance computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleSource {
    Subscription,
    OneTimeCredits,
    CalendarMonth,
}

/// The subscription cycle containing `now`.
///
/// Returns `None` when there is no recurring cycle (free interval) or the
/// arithmetic leaves chrono's representable range. Callers fall back to
/// [`calendar_month`] in both cases.
///
/// An anchor in the future steps back one interval at a time from the
/// anchor until the window contains `now`.
pub fn subscription_cycle(
    anchor: DateTime<Utc>,
    interval: BillingInterval,
    now: DateTime<Utc>,
) -> Option<UsageWindow> {
    let step = Months::new(interval.months()?);

    if anchor <= now {
        let mut start = anchor;
        let mut end = anchor.checked_add_months(step)?;
        while end <= now {
            start = end;
            end = end.checked_add_months(step)?;
        }
        return Some(UsageWindow { start, end });
    }

    let mut end = anchor;
    let mut start = anchor.checked_sub_months(step)?;
    while start > now {
        end = start;
        start = start.checked_sub_months(step)?;
    }
    Some(UsageWindow { start, end })
}

/// First instant of the month containing `now` up to the first instant of the next
pub fn calendar_month(now: DateTime<Utc>) -> Option<UsageWindow> {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()?;
    let end = start.checked_add_months(Months::new(1))?;
    Some(UsageWindow { start, end })
}

/// Window spanned by one-time credits when no subscription cycle applies.
///
/// Runs from the earliest `added_at` among `grants` to their latest expiry,
/// or to one year from `now` when none of them expire. Without any
/// `added_at` the start falls back to the first of the current month.
/// Callers pass only grants that are still active.
pub fn one_time_credit_window<'a>(
    grants: impl IntoIterator<Item = &'a CreditGrant>,
    now: DateTime<Utc>,
) -> Option<UsageWindow> {
    let mut earliest_added: Option<DateTime<Utc>> = None;
    let mut latest_expiry: Option<DateTime<Utc>> = None;

    for grant in grants {
        if let Some(added) = grant.added_at {
            earliest_added = Some(earliest_added.map_or(added, |e| e.min(added)));
        }
        if let Some(expires) = grant.expires_at {
            latest_expiry = Some(latest_expiry.map_or(expires, |l| l.max(expires)));
        }
    }

    let start = match earliest_added {
        Some(start) => start,
        None => calendar_month(now)?.start,
    };
    let end = match latest_expiry {
        Some(end) => end,
        None => now.checked_add_months(Months::new(12))?,
    };

    Some(UsageWindow { start, end })
}
