//! Reservation model: short-lived pessimistic holds against available credit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Reservation lifecycle. `Held` is the only non-terminal state; a
/// reservation transitions exactly once to one of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "held",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "committed" => ReservationStatus::Committed,
            "released" => ReservationStatus::Released,
            "expired" => ReservationStatus::Expired,
            _ => ReservationStatus::Held,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Held)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A hold preventing concurrent operations from jointly overspending before
/// the real cost is known. While held and unexpired, the estimate counts
/// against available credit though no ledger entry exists yet.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub estimated_amount: i64,
    pub actual_amount: Option<i64>,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Reservation {
    pub fn parsed_status(&self) -> ReservationStatus {
        ReservationStatus::from_string(&self.status)
    }

    /// Whether the hold still counts against available credit at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.parsed_status() == ReservationStatus::Held && self.expires_at > now
    }
}

/// Input for placing a hold.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub estimated_amount: i64,
    pub expires_at: DateTime<Utc>,
}
