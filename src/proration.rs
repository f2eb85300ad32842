//! Proration calculator: boundary rollover and mid-period plan changes.
//!
//! Pure arithmetic only. The Period Transition Coordinator applies the
//! boundary rollover; the plan-change handler applies prorated limits via
//! `QuotaStore::apply_prorated_limits`.

use crate::error::AppError;
use crate::models::BillingPeriod;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Credits carried into the next period at a boundary:
/// `floor(unused * percent)`, clamped to `cap` so rollover can never
/// accumulate past one period's worth of allowance. Plans with a zero
/// percentage always roll over zero.
pub fn rollover_credits(unused: i64, percent: Decimal, cap: i64) -> i64 {
    if unused <= 0 || percent <= Decimal::ZERO || cap <= 0 {
        return 0;
    }
    let raw = (Decimal::from(unused) * percent).floor();
    raw.to_i64().unwrap_or(0).clamp(0, cap)
}

/// Result of a mid-period plan change calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProratedLimits {
    /// Unused portion of the old limit, floored at zero.
    pub rollover: i64,
    /// New limit scaled by the fraction of the period remaining.
    pub prorated_new: i64,
    /// The limit that replaces the remaining allowance: `rollover +
    /// prorated_new`. Overage on the old plan never pushes this below
    /// `prorated_new`.
    pub total: i64,
}

/// Recompute the remaining limit when the plan changes on `change_date`
/// inside `period`.
pub fn calculate_prorated_limits(
    used: i64,
    old_limit: i64,
    new_limit: i64,
    change_date: DateTime<Utc>,
    period: BillingPeriod,
) -> Result<ProratedLimits, AppError> {
    if used < 0 || old_limit < 0 || new_limit < 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "prorated limits require non-negative inputs (used={}, old={}, new={})",
            used,
            old_limit,
            new_limit
        )));
    }

    let rollover = (old_limit - used).max(0);
    let days_total = period.days_total();
    let days_remaining = days_total - period.days_elapsed(change_date);
    let prorated_new = ((new_limit as i128 * days_remaining as i128) / days_total as i128) as i64;

    Ok(ProratedLimits {
        rollover,
        prorated_new,
        total: rollover + prorated_new,
    })
}
