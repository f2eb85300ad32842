//! Purchased add-on credit packs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A purchased credit pack. Lifecycle is independent of the billing period:
/// purchased and expired on its own schedule, consumed only after the
/// sources ahead of it in precedence are exhausted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AddOnGrant {
    pub grant_id: Uuid,
    pub organization_id: Uuid,
    pub credits_granted: i64,
    pub credits_remaining: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub recurring: bool,
    pub purchased_utc: DateTime<Utc>,
}

impl AddOnGrant {
    /// Active grants contribute to available credit; an expired grant is
    /// excluded regardless of remaining balance.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.credits_remaining > 0 && self.expires_at.map_or(true, |at| at > now)
    }
}

/// Input for recording a purchased pack.
#[derive(Debug, Clone)]
pub struct NewGrant {
    pub organization_id: Uuid,
    pub credits_granted: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub recurring: bool,
}
