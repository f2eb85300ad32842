//! Pure debit planner: splits a debit across sub-balances in the configured
//! precedence order, carrying the remainder when a source drains.
//!
//! Both store backends call this inside their per-organization critical
//! section so the arithmetic is identical regardless of backend.

use crate::error::AppError;
use crate::models::{AddOnGrant, Allowance, CreditSource, DebitBreakdown};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Portion of a debit taken from one add-on grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantDebit {
    pub grant_id: Uuid,
    pub amount: i64,
}

/// A fully resolved debit: per-source split plus the per-grant splits that
/// make up the add-on portion.
#[derive(Debug, Clone, Default)]
pub struct DebitPlan {
    pub sources: DebitBreakdown,
    pub grant_debits: Vec<GrantDebit>,
}

impl DebitPlan {
    pub fn total(&self) -> i64 {
        self.sources.total()
    }
}

/// Total credit currently spendable: remaining sub-balances in the
/// precedence set, with the add-on balance taken from active grants (the
/// source of truth; an expired grant is excluded regardless of the snapshot
/// on the allowance row).
pub fn available_credit(
    allowance: &Allowance,
    grants: &[AddOnGrant],
    order: &[CreditSource],
    now: DateTime<Utc>,
) -> i64 {
    order
        .iter()
        .map(|source| match source {
            CreditSource::AddOn => active_grant_credit(grants, now),
            other => allowance.remaining(*other),
        })
        .sum()
}

/// Remaining credit across active, unexpired grants.
pub fn active_grant_credit(grants: &[AddOnGrant], now: DateTime<Utc>) -> i64 {
    grants
        .iter()
        .filter(|g| g.is_active(now))
        .map(|g| g.credits_remaining)
        .sum()
}

/// Split `amount` across the sources in `order`. Fails with
/// `InsufficientCredit` when the sources together cannot cover it; no
/// partial plans are ever returned.
pub fn plan_debit(
    allowance: &Allowance,
    grants: &[AddOnGrant],
    order: &[CreditSource],
    amount: i64,
    now: DateTime<Utc>,
) -> Result<DebitPlan, AppError> {
    if amount < 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "debit amount must be non-negative, got {}",
            amount
        )));
    }

    let mut plan = DebitPlan::default();
    let mut needed = amount;

    for source in order {
        if needed == 0 {
            break;
        }
        match source {
            CreditSource::AddOn => {
                // Oldest-expiring grant first; never-expiring packs last.
                let mut active: Vec<&AddOnGrant> =
                    grants.iter().filter(|g| g.is_active(now)).collect();
                active.sort_by_key(|g| (g.expires_at.is_none(), g.expires_at, g.purchased_utc));

                for grant in active {
                    if needed == 0 {
                        break;
                    }
                    let take = needed.min(grant.credits_remaining);
                    if take > 0 {
                        plan.grant_debits.push(GrantDebit {
                            grant_id: grant.grant_id,
                            amount: take,
                        });
                        plan.sources.add(CreditSource::AddOn, take);
                        needed -= take;
                    }
                }
            }
            other => {
                let take = needed.min(allowance.remaining(*other).max(0));
                if take > 0 {
                    plan.sources.add(*other, take);
                    needed -= take;
                }
            }
        }
    }

    if needed > 0 {
        return Err(AppError::InsufficientCredit {
            required: amount,
            available: amount - needed,
        });
    }

    Ok(plan)
}
