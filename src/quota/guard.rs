//! Quota guard: the single entry point callers meter through.
//!
//! `check_and_reserve` stitches the rate limiter, the period transition
//! coordinator, and the reservation manager into one admission decision;
//! `commit`/`cancel` close the loop after the metered operation ran.

use crate::config::QuotaConfig;
use crate::error::AppError;
use crate::limiter::{ExternalLimiter, FailMode};
use crate::models::{
    AddOnGrant, Allowance, ContextLevel, LedgerEntry, NewGrant, OperationKind, Reservation,
    UsageHistory,
};
use crate::plan::PlanSource;
use crate::proration::{self, ProratedLimits};
use crate::quota::reservation::ReservationManager;
use crate::quota::transition::PeriodTransitionCoordinator;
use crate::services::metrics::record_error;
use crate::store::QuotaStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Why an admission request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    InsufficientCredit,
    RateLimited,
}

/// Outcome of `check_and_reserve`. A denial is a normal decision, not an
/// error; errors are reserved for infrastructure failures.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Present exactly when `allowed`; the caller settles or cancels it.
    pub reservation_id: Option<Uuid>,
    pub reason: Option<DenialReason>,
    /// Set once consumption crosses the configured near-limit fraction, on
    /// allowed and denied decisions alike.
    pub near_limit_warning: bool,
    pub used_fraction: f64,
}

/// Read-only consumption snapshot for dashboards and warnings.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStatus {
    pub allowance: Allowance,
    pub used_fraction: f64,
    pub near_limit: bool,
}

pub struct QuotaGuard {
    store: Arc<dyn QuotaStore>,
    transitions: PeriodTransitionCoordinator,
    reservations: ReservationManager,
    limiter: Arc<dyn ExternalLimiter>,
    config: QuotaConfig,
}

impl QuotaGuard {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        plans: Arc<dyn PlanSource>,
        limiter: Arc<dyn ExternalLimiter>,
        config: QuotaConfig,
    ) -> Self {
        Self {
            transitions: PeriodTransitionCoordinator::new(
                store.clone(),
                plans,
                config.clone(),
            ),
            reservations: ReservationManager::new(store.clone(), config.clone()),
            store,
            limiter,
            config,
        }
    }

    /// Admission check for a metered operation: throttle, roll the period
    /// forward if needed, then hold the estimated cost for the requested
    /// context level.
    #[instrument(skip(self), fields(organization_id = %organization_id, level = level.as_str()))]
    pub async fn check_and_reserve(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        level: ContextLevel,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, AppError> {
        let admitted = match self.limiter.allow(organization_id).await {
            Ok(admitted) => admitted,
            Err(e) => {
                record_error(e.metric_label(), "limiter");
                match self.config.limiter_fail_mode {
                    FailMode::Open => {
                        warn!(organization_id = %organization_id, error = %e, "Limiter unreachable, failing open");
                        true
                    }
                    FailMode::Closed => {
                        warn!(organization_id = %organization_id, error = %e, "Limiter unreachable, failing closed");
                        false
                    }
                }
            }
        };

        let allowance = self
            .transitions
            .ensure_current_period(organization_id, now)
            .await?
            .allowance;
        let used_fraction = allowance.used_fraction();
        let near_limit_warning = used_fraction >= self.config.near_limit_fraction;

        if !admitted {
            return Ok(QuotaDecision {
                allowed: false,
                reservation_id: None,
                reason: Some(DenialReason::RateLimited),
                near_limit_warning,
                used_fraction,
            });
        }

        let cost = self.config.costs.cost_for(level);
        match self
            .reservations
            .reserve(organization_id, user_id, cost, now)
            .await
        {
            Ok(reservation) => Ok(QuotaDecision {
                allowed: true,
                reservation_id: Some(reservation.reservation_id),
                reason: None,
                near_limit_warning,
                used_fraction,
            }),
            Err(AppError::InsufficientCredit { .. }) => Ok(QuotaDecision {
                allowed: false,
                reservation_id: None,
                reason: Some(DenialReason::InsufficientCredit),
                near_limit_warning,
                used_fraction,
            }),
            Err(e) => Err(e),
        }
    }

    /// Settle a reservation at its actual cost. Retries with the same
    /// idempotency key debit exactly once.
    pub async fn commit(
        &self,
        reservation_id: Uuid,
        actual_amount: i64,
        idempotency_key: String,
        operation: OperationKind,
        resource_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, AppError> {
        self.reservations
            .settle(
                reservation_id,
                actual_amount,
                idempotency_key,
                operation,
                resource_ref,
                now,
            )
            .await
    }

    /// Release a reservation without debiting.
    pub async fn cancel(&self, reservation_id: Uuid) -> Result<Reservation, AppError> {
        self.reservations.release(reservation_id).await
    }

    /// Record a purchased add-on pack.
    pub async fn purchase_addon(&self, input: &NewGrant) -> Result<AddOnGrant, AppError> {
        self.store.create_grant(input).await
    }

    /// Add bonus credits (promotions, service-credit awards) to the current
    /// period. Bonus credit does not survive the period boundary.
    pub async fn grant_bonus(
        &self,
        organization_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Allowance, AppError> {
        self.transitions
            .ensure_current_period(organization_id, now)
            .await?;
        self.store.grant_bonus(organization_id, amount).await
    }

    /// Apply a mid-period plan change: the unused old limit rolls into the
    /// rollover balance and the new limit is prorated over the days left.
    #[instrument(skip(self), fields(organization_id = %organization_id, new_limit = new_base_limit))]
    pub async fn change_plan(
        &self,
        organization_id: Uuid,
        new_base_limit: i64,
        change_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(ProratedLimits, Allowance), AppError> {
        let allowance = self
            .transitions
            .ensure_current_period(organization_id, now)
            .await?
            .allowance;

        let old_limit = allowance.base_granted + allowance.rollover_granted;
        let used = (allowance.base_granted - allowance.base_remaining)
            + (allowance.rollover_granted - allowance.rollover_remaining);
        let limits = proration::calculate_prorated_limits(
            used,
            old_limit,
            new_base_limit,
            change_date,
            allowance.period(),
        )?;

        let updated = self
            .store
            .apply_prorated_limits(organization_id, &limits)
            .await?;
        Ok((limits, updated))
    }

    /// Consumption snapshot for the current period.
    pub async fn usage_status(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UsageStatus, AppError> {
        let allowance = self
            .transitions
            .ensure_current_period(organization_id, now)
            .await?
            .allowance;
        let used_fraction = allowance.used_fraction();
        Ok(UsageStatus {
            near_limit: used_fraction >= self.config.near_limit_fraction,
            used_fraction,
            allowance,
        })
    }

    /// Archived periods, newest first.
    pub async fn history(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UsageHistory>, AppError> {
        self.store.list_usage_history(organization_id, limit).await
    }

    /// Recent settled debits, newest first.
    pub async fn recent_entries(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        self.store.list_ledger_entries(organization_id, limit).await
    }

    pub fn reservations(&self) -> &ReservationManager {
        &self.reservations
    }
}
