//! Billing period model and the billing period clock.
//!
//! Periods are anchored to the subscription start instant and advance one
//! calendar month at a time. Day-of-month overflow clamps to the last valid
//! day of the target month (Jan 31 -> Feb 28/29), which chrono's `Months`
//! addition gives us as long as every candidate is derived from the original
//! anchor rather than from the previous period start.

use crate::error::AppError;
use chrono::{DateTime, Datelike, Months, Utc};
use serde::{Deserialize, Serialize};

/// A single billing period. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AppError> {
        if start >= end {
            return Err(AppError::InvalidPeriod(anyhow::anyhow!(
                "period start {} is not before end {}",
                start,
                end
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether the instant falls inside this period.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Total number of whole days in the period, at least 1.
    pub fn days_total(&self) -> i64 {
        (self.end - self.start).num_days().max(1)
    }

    /// Whole days elapsed from the period start to `at`, clamped to the
    /// period bounds.
    pub fn days_elapsed(&self, at: DateTime<Utc>) -> i64 {
        (at - self.start).num_days().clamp(0, self.days_total())
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Compute the billing period containing `now` for the given anchor.
///
/// Pure and deterministic. Every instant at or after the anchor belongs to
/// exactly one period; consecutive periods tile the timeline with no gaps or
/// overlaps. Fails with `InvalidAnchor` only when the anchor lies in the
/// future.
pub fn current_period(anchor: DateTime<Utc>, now: DateTime<Utc>) -> Result<BillingPeriod, AppError> {
    if anchor > now {
        return Err(AppError::InvalidAnchor(anyhow::anyhow!(
            "anchor {} is after now {}",
            anchor,
            now
        )));
    }

    // First guess from the calendar distance, then adjust. The guess can be
    // off by one around month-length boundaries.
    let approx = (now.year() - anchor.year()) * 12 + now.month() as i32 - anchor.month() as i32;
    let mut months = approx.max(0) as u32;

    while nth_period_start(anchor, months) > now {
        months -= 1;
    }
    while nth_period_start(anchor, months + 1) <= now {
        months += 1;
    }

    BillingPeriod::new(
        nth_period_start(anchor, months),
        nth_period_start(anchor, months + 1),
    )
}

/// Start of the period `months` months after the anchor, clamped to the last
/// valid day of the target month.
fn nth_period_start(anchor: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    anchor + Months::new(months)
}
