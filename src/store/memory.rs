//! In-process store backend.
//!
//! Gives the same per-organization atomicity guarantees as the Postgres
//! backend via exclusive map-entry access, so the engine's concurrency
//! properties can be exercised hermetically. Also suitable for embedded
//! single-process deployments.

use crate::error::AppError;
use crate::models::{
    AddOnGrant, Allowance, CreditSource, LedgerEntry, NewAllowance, NewGrant, NewReservation,
    Reservation, ReservationStatus, UsageBreakdown, UsageHistory,
};
use crate::precedence::{self, plan_debit};
use crate::proration::{self, ProratedLimits};
use crate::store::{QuotaStore, SettleRequest, TransitionSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::types::Json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct OrgState {
    allowance: Option<Allowance>,
    history: Vec<UsageHistory>,
    grants: Vec<AddOnGrant>,
    reservations: HashMap<Uuid, Reservation>,
    ledger: Vec<LedgerEntry>,
}

/// Hermetic `QuotaStore` backend. Organizations are independent concurrency
/// units: each operation runs under exclusive access to that organization's
/// entry and never holds it across an await point.
#[derive(Default)]
pub struct MemoryStore {
    orgs: DashMap<Uuid, OrgState>,
    // Secondary indexes for id/key lookups that arrive without an
    // organization id.
    reservation_org: DashMap<Uuid, Uuid>,
    ledger_org: DashMap<String, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn org_for_reservation(&self, reservation_id: Uuid) -> Option<Uuid> {
        self.reservation_org.get(&reservation_id).map(|r| *r)
    }

    fn ledger_entry_in(&self, organization_id: Uuid, key: &str) -> Option<LedgerEntry> {
        self.orgs.get(&organization_id).and_then(|state| {
            state
                .ledger
                .iter()
                .find(|e| e.idempotency_key == key)
                .cloned()
        })
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_allowance(&self, organization_id: Uuid) -> Result<Option<Allowance>, AppError> {
        Ok(self
            .orgs
            .get(&organization_id)
            .and_then(|s| s.allowance.clone()))
    }

    async fn create_allowance(&self, input: &NewAllowance) -> Result<Allowance, AppError> {
        let mut state = self.orgs.entry(input.organization_id).or_default();
        if let Some(existing) = &state.allowance {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let allowance = Allowance {
            allowance_id: Uuid::new_v4(),
            organization_id: input.organization_id,
            user_id: input.user_id,
            period_start: input.period.start,
            period_end: input.period.end,
            base_granted: input.base_granted,
            base_remaining: input.base_granted,
            rollover_granted: input.rollover_granted,
            rollover_remaining: input.rollover_granted,
            addon_granted: input.addon_granted,
            addon_remaining: input.addon_remaining,
            bonus_granted: 0,
            bonus_remaining: 0,
            credits_used: 0,
            breakdown: Json(UsageBreakdown::default()),
            created_utc: now,
            updated_utc: now,
        };
        state.allowance = Some(allowance.clone());
        Ok(allowance)
    }

    async fn transition_allowance(
        &self,
        organization_id: Uuid,
        spec: &TransitionSpec,
    ) -> Result<Allowance, AppError> {
        let mut state = self.orgs.entry(organization_id).or_default();
        let now = Utc::now();

        let old = state
            .allowance
            .clone()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        if old.period_start != spec.expected_period_start {
            return Err(AppError::TransitionConflict(organization_id));
        }
        if state
            .history
            .iter()
            .any(|h| h.period_start == old.period_start)
        {
            return Err(AppError::TransitionConflict(organization_id));
        }

        let unused = old.base_remaining + old.rollover_remaining;
        let rollover =
            proration::rollover_credits(unused, spec.rollover_percent, spec.rollover_cap);
        let addon = precedence::active_grant_credit(&state.grants, now);

        state.history.push(UsageHistory {
            history_id: Uuid::new_v4(),
            organization_id,
            user_id: old.user_id,
            period_start: old.period_start,
            period_end: old.period_end,
            base_granted: old.base_granted,
            base_remaining: old.base_remaining,
            rollover_granted: old.rollover_granted,
            rollover_remaining: old.rollover_remaining,
            addon_granted: old.addon_granted,
            addon_remaining: old.addon_remaining,
            bonus_granted: old.bonus_granted,
            bonus_remaining: old.bonus_remaining,
            credits_used: old.credits_used,
            breakdown: old.breakdown.clone(),
            archived_utc: now,
        });

        let replacement = Allowance {
            allowance_id: Uuid::new_v4(),
            organization_id,
            user_id: old.user_id,
            period_start: spec.new_period.start,
            period_end: spec.new_period.end,
            base_granted: spec.base_granted,
            base_remaining: spec.base_granted,
            rollover_granted: rollover,
            rollover_remaining: rollover,
            addon_granted: addon,
            addon_remaining: addon,
            bonus_granted: 0,
            bonus_remaining: 0,
            credits_used: 0,
            breakdown: Json(UsageBreakdown::default()),
            created_utc: now,
            updated_utc: now,
        };
        state.allowance = Some(replacement.clone());
        Ok(replacement)
    }

    async fn list_usage_history(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UsageHistory>, AppError> {
        let mut rows = self
            .orgs
            .get(&organization_id)
            .map(|s| s.history.clone())
            .unwrap_or_default();
        rows.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn create_grant(&self, input: &NewGrant) -> Result<AddOnGrant, AppError> {
        if input.credits_granted <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Grant must carry positive credits"
            )));
        }
        let mut state = self.orgs.entry(input.organization_id).or_default();
        let grant = AddOnGrant {
            grant_id: Uuid::new_v4(),
            organization_id: input.organization_id,
            credits_granted: input.credits_granted,
            credits_remaining: input.credits_granted,
            expires_at: input.expires_at,
            recurring: input.recurring,
            purchased_utc: Utc::now(),
        };
        state.grants.push(grant.clone());
        if let Some(allowance) = state.allowance.as_mut() {
            allowance.addon_granted += grant.credits_granted;
            allowance.addon_remaining += grant.credits_granted;
            allowance.updated_utc = grant.purchased_utc;
        }
        Ok(grant)
    }

    async fn active_grants(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<AddOnGrant>, AppError> {
        Ok(self
            .orgs
            .get(&organization_id)
            .map(|s| {
                s.grants
                    .iter()
                    .filter(|g| g.is_active(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn grant_bonus(
        &self,
        organization_id: Uuid,
        amount: i64,
    ) -> Result<Allowance, AppError> {
        if amount <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Bonus amount must be positive"
            )));
        }
        let mut state = self.orgs.entry(organization_id).or_default();
        let allowance = state
            .allowance
            .as_mut()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;
        allowance.bonus_granted += amount;
        allowance.bonus_remaining += amount;
        allowance.updated_utc = Utc::now();
        Ok(allowance.clone())
    }

    async fn try_reserve(
        &self,
        input: &NewReservation,
        order: &[CreditSource],
        now: DateTime<Utc>,
    ) -> Result<Reservation, AppError> {
        let mut state = self.orgs.entry(input.organization_id).or_default();
        let OrgState {
            allowance,
            grants,
            reservations,
            ..
        } = &mut *state;

        let allowance = allowance
            .as_ref()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        let held: i64 = reservations
            .values()
            .filter(|r| r.is_active(now))
            .map(|r| r.estimated_amount)
            .sum();
        let available = precedence::available_credit(allowance, grants, order, now) - held;

        if available < input.estimated_amount {
            return Err(AppError::InsufficientCredit {
                required: input.estimated_amount,
                available: available.max(0),
            });
        }

        let reservation = Reservation {
            reservation_id: Uuid::new_v4(),
            organization_id: input.organization_id,
            user_id: input.user_id,
            estimated_amount: input.estimated_amount,
            actual_amount: None,
            status: ReservationStatus::Held.as_str().to_string(),
            expires_at: input.expires_at,
            created_utc: now,
            updated_utc: now,
        };
        reservations.insert(reservation.reservation_id, reservation.clone());
        self.reservation_org
            .insert(reservation.reservation_id, input.organization_id);
        Ok(reservation)
    }

    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<Reservation>, AppError> {
        let Some(org) = self.org_for_reservation(reservation_id) else {
            return Ok(None);
        };
        Ok(self
            .orgs
            .get(&org)
            .and_then(|s| s.reservations.get(&reservation_id).cloned()))
    }

    async fn settle_reservation(
        &self,
        req: &SettleRequest,
        order: &[CreditSource],
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, AppError> {
        // Replay fast path: a known key returns the original outcome.
        if let Some(org) = self.ledger_org.get(&req.idempotency_key).map(|r| *r) {
            if let Some(entry) = self.ledger_entry_in(org, &req.idempotency_key) {
                return Ok(entry);
            }
        }

        let organization_id = self
            .org_for_reservation(req.reservation_id)
            .ok_or(AppError::ReservationNotFound(req.reservation_id))?;

        let mut state = self.orgs.entry(organization_id).or_default();
        let OrgState {
            allowance,
            grants,
            reservations,
            ledger,
            ..
        } = &mut *state;

        // Re-check under the entry lock; a concurrent settle may have won.
        if let Some(entry) = ledger
            .iter()
            .find(|e| e.idempotency_key == req.idempotency_key)
        {
            return Ok(entry.clone());
        }

        let reservation = reservations
            .get_mut(&req.reservation_id)
            .ok_or(AppError::ReservationNotFound(req.reservation_id))?;
        if reservation.parsed_status() != ReservationStatus::Held {
            return Err(AppError::ReservationAlreadySettled(req.reservation_id));
        }

        let allowance = allowance
            .as_mut()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        // All checks precede any mutation: a failing plan leaves balances
        // and the reservation untouched.
        let plan = plan_debit(allowance, grants, order, req.actual_amount, now)?;

        allowance.rollover_remaining -= plan.sources.rollover;
        allowance.base_remaining -= plan.sources.base;
        allowance.bonus_remaining -= plan.sources.bonus;
        allowance.addon_remaining -= plan.sources.add_on;
        for debit in &plan.grant_debits {
            if let Some(grant) = grants.iter_mut().find(|g| g.grant_id == debit.grant_id) {
                grant.credits_remaining -= debit.amount;
            }
        }
        allowance.credits_used += plan.total();
        allowance.breakdown.0.record(req.operation, plan.total());
        allowance.updated_utc = now;

        reservation.status = ReservationStatus::Committed.as_str().to_string();
        reservation.actual_amount = Some(req.actual_amount);
        reservation.updated_utc = now;

        let entry = LedgerEntry {
            entry_id: Uuid::new_v4(),
            organization_id,
            user_id: Some(reservation.user_id),
            reservation_id: Some(req.reservation_id),
            idempotency_key: req.idempotency_key.clone(),
            operation: req.operation.as_str().to_string(),
            resource_ref: req.resource_ref.clone(),
            amount: plan.total(),
            sources: Json(plan.sources),
            balance_after: allowance.total_remaining(),
            posted_utc: now,
        };
        ledger.push(entry.clone());
        self.ledger_org
            .insert(req.idempotency_key.clone(), organization_id);
        Ok(entry)
    }

    async fn release_reservation(&self, reservation_id: Uuid) -> Result<Reservation, AppError> {
        let organization_id = self
            .org_for_reservation(reservation_id)
            .ok_or(AppError::ReservationNotFound(reservation_id))?;
        let mut state = self.orgs.entry(organization_id).or_default();
        let reservation = state
            .reservations
            .get_mut(&reservation_id)
            .ok_or(AppError::ReservationNotFound(reservation_id))?;
        if reservation.parsed_status() != ReservationStatus::Held {
            return Err(AppError::ReservationAlreadySettled(reservation_id));
        }
        reservation.status = ReservationStatus::Released.as_str().to_string();
        reservation.updated_utc = Utc::now();
        Ok(reservation.clone())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut swept = 0u64;
        for mut entry in self.orgs.iter_mut() {
            for reservation in entry.reservations.values_mut() {
                if reservation.parsed_status() == ReservationStatus::Held
                    && reservation.expires_at <= now
                {
                    reservation.status = ReservationStatus::Expired.as_str().to_string();
                    reservation.updated_utc = now;
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }

    async fn find_ledger_entry(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>, AppError> {
        let Some(org) = self.ledger_org.get(idempotency_key).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.ledger_entry_in(org, idempotency_key))
    }

    async fn list_ledger_entries(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        let mut rows = self
            .orgs
            .get(&organization_id)
            .map(|s| s.ledger.clone())
            .unwrap_or_default();
        rows.sort_by(|a, b| b.posted_utc.cmp(&a.posted_utc));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn apply_prorated_limits(
        &self,
        organization_id: Uuid,
        limits: &ProratedLimits,
    ) -> Result<Allowance, AppError> {
        let mut state = self.orgs.entry(organization_id).or_default();
        let allowance = state
            .allowance
            .as_mut()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        let base_used = allowance.base_granted - allowance.base_remaining;
        let rollover_used = allowance.rollover_granted - allowance.rollover_remaining;
        allowance.base_granted = base_used + limits.prorated_new;
        allowance.base_remaining = limits.prorated_new;
        allowance.rollover_granted = rollover_used + limits.rollover;
        allowance.rollover_remaining = limits.rollover;
        allowance.updated_utc = Utc::now();
        Ok(allowance.clone())
    }
}
