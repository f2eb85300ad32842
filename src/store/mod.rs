//! Storage seam for the quota engine.
//!
//! Every state-mutating operation is an atomic per-organization
//! check-and-write inside the backend (row exclusivity or entry locking),
//! never an in-process lock above it — callers may span multiple service
//! instances. The pure arithmetic (precedence walk, rollover) is shared so
//! both backends debit identically.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::AppError;
use crate::models::{
    AddOnGrant, Allowance, BillingPeriod, CreditSource, LedgerEntry, NewAllowance, NewGrant,
    NewReservation, OperationKind, Reservation, UsageHistory,
};
use crate::proration::ProratedLimits;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Parameters for the exactly-once archive-and-reset at a period boundary.
///
/// The rollover is computed inside the backend's critical section from the
/// balances as re-read there, not from the caller's stale view — usage
/// settled between the caller's read and the transition must not be rolled
/// over twice.
#[derive(Debug, Clone)]
pub struct TransitionSpec {
    /// Period start the caller observed; the compare half of the CAS.
    pub expected_period_start: DateTime<Utc>,
    pub new_period: BillingPeriod,
    pub base_granted: i64,
    pub rollover_percent: Decimal,
    pub rollover_cap: i64,
}

/// Parameters for settling a reservation into a ledger entry.
#[derive(Debug, Clone)]
pub struct SettleRequest {
    pub reservation_id: Uuid,
    pub actual_amount: i64,
    pub idempotency_key: String,
    pub operation: OperationKind,
    pub resource_ref: Option<String>,
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Live allowance for an organization, if one exists yet.
    async fn get_allowance(&self, organization_id: Uuid) -> Result<Option<Allowance>, AppError>;

    /// Insert the first allowance for an organization. Racing creators are
    /// absorbed: if a row already exists it is returned unchanged.
    async fn create_allowance(&self, input: &NewAllowance) -> Result<Allowance, AppError>;

    /// Archive the live allowance into usage history and replace it for the
    /// new period, exactly once: fails with `TransitionConflict` when the
    /// stored period no longer matches `expected_period_start`.
    async fn transition_allowance(
        &self,
        organization_id: Uuid,
        spec: &TransitionSpec,
    ) -> Result<Allowance, AppError>;

    /// Archived periods, newest first.
    async fn list_usage_history(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UsageHistory>, AppError>;

    /// Record a purchased add-on pack and reflect it on the live allowance.
    async fn create_grant(&self, input: &NewGrant) -> Result<AddOnGrant, AppError>;

    /// Grants still contributing credit at `now`.
    async fn active_grants(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<AddOnGrant>, AppError>;

    /// Add bonus credits to the live allowance.
    async fn grant_bonus(
        &self,
        organization_id: Uuid,
        amount: i64,
    ) -> Result<Allowance, AppError>;

    /// Atomically check available credit (net of held, unexpired
    /// reservations) and insert a hold; `InsufficientCredit` otherwise.
    async fn try_reserve(
        &self,
        input: &NewReservation,
        order: &[CreditSource],
        now: DateTime<Utc>,
    ) -> Result<Reservation, AppError>;

    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<Reservation>, AppError>;

    /// Commit a reservation: debit the actual amount in precedence order,
    /// append exactly one ledger entry, and mark the reservation committed.
    /// Replays with a known idempotency key return the original entry
    /// without debiting again.
    async fn settle_reservation(
        &self,
        req: &SettleRequest,
        order: &[CreditSource],
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, AppError>;

    /// Release a held reservation without debiting.
    async fn release_reservation(&self, reservation_id: Uuid) -> Result<Reservation, AppError>;

    /// Expire abandoned holds past their TTL; returns how many were swept.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;

    async fn find_ledger_entry(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>, AppError>;

    /// Recent ledger entries for an organization, newest first.
    async fn list_ledger_entries(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, AppError>;

    /// Replace the base and rollover sub-balances with a mid-period
    /// proration result, preserving the consumed portions so the usage
    /// invariant keeps holding.
    async fn apply_prorated_limits(
        &self,
        organization_id: Uuid,
        limits: &ProratedLimits,
    ) -> Result<Allowance, AppError>;
}
