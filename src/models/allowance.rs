//! Live allowance and archived usage history models.

use crate::models::ledger::{CreditSource, UsageBreakdown};
use crate::models::period::BillingPeriod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Live record of remaining credit for an organization in its current
/// billing period. One row per organization; superseded (archived, then
/// replaced), never mutated across a period boundary.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Allowance {
    pub allowance_id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub base_granted: i64,
    pub base_remaining: i64,
    pub rollover_granted: i64,
    pub rollover_remaining: i64,
    pub addon_granted: i64,
    pub addon_remaining: i64,
    pub bonus_granted: i64,
    pub bonus_remaining: i64,
    pub credits_used: i64,
    pub breakdown: Json<UsageBreakdown>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Allowance {
    pub fn period(&self) -> BillingPeriod {
        BillingPeriod {
            start: self.period_start,
            end: self.period_end,
        }
    }

    pub fn granted(&self, source: CreditSource) -> i64 {
        match source {
            CreditSource::Rollover => self.rollover_granted,
            CreditSource::Base => self.base_granted,
            CreditSource::AddOn => self.addon_granted,
            CreditSource::Bonus => self.bonus_granted,
        }
    }

    pub fn remaining(&self, source: CreditSource) -> i64 {
        match source {
            CreditSource::Rollover => self.rollover_remaining,
            CreditSource::Base => self.base_remaining,
            CreditSource::AddOn => self.addon_remaining,
            CreditSource::Bonus => self.bonus_remaining,
        }
    }

    pub fn total_granted(&self) -> i64 {
        self.base_granted + self.rollover_granted + self.addon_granted + self.bonus_granted
    }

    pub fn total_remaining(&self) -> i64 {
        self.base_remaining + self.rollover_remaining + self.addon_remaining + self.bonus_remaining
    }

    /// Fraction of the total allowance already consumed, in [0, 1+].
    pub fn used_fraction(&self) -> f64 {
        let granted = self.total_granted();
        if granted <= 0 {
            return 1.0;
        }
        self.credits_used as f64 / granted as f64
    }

    /// Accounting invariant: credits used equals total granted minus total
    /// remaining, and no sub-balance is negative.
    pub fn is_consistent(&self) -> bool {
        self.credits_used == self.total_granted() - self.total_remaining()
            && self.base_remaining >= 0
            && self.rollover_remaining >= 0
            && self.addon_remaining >= 0
            && self.bonus_remaining >= 0
    }
}

/// Input for inserting a fresh allowance (lazily on first use, or as the
/// replacement row at a period transition).
#[derive(Debug, Clone)]
pub struct NewAllowance {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub period: BillingPeriod,
    pub base_granted: i64,
    pub rollover_granted: i64,
    pub addon_granted: i64,
    pub addon_remaining: i64,
}

/// Write-once archive of a past allowance. Retains the exact period
/// boundaries archived, never recomputed from a possibly-changed anchor.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageHistory {
    pub history_id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub base_granted: i64,
    pub base_remaining: i64,
    pub rollover_granted: i64,
    pub rollover_remaining: i64,
    pub addon_granted: i64,
    pub addon_remaining: i64,
    pub bonus_granted: i64,
    pub bonus_remaining: i64,
    pub credits_used: i64,
    pub breakdown: Json<UsageBreakdown>,
    pub archived_utc: DateTime<Utc>,
}
