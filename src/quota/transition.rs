//! Period transition coordinator.
//!
//! Any operation that touches an organization's allowance first routes
//! through `ensure_current_period`, which lazily creates the first allowance
//! and advances it across period boundaries exactly once. There is no cron:
//! the first request after a boundary pays for the transition.

use crate::config::QuotaConfig;
use crate::error::AppError;
use crate::models::{period, Allowance, NewAllowance};
use crate::plan::PlanSource;
use crate::precedence;
use crate::services::metrics::{record_error, record_transition};
use crate::store::{QuotaStore, TransitionSpec};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Bound on CAS attempts when racing other instances. Each retry re-reads,
/// so two attempts only both fail if the stored period keeps moving.
const MAX_TRANSITION_ATTEMPTS: u32 = 3;

/// Result of `ensure_current_period`. `transitioned` is true only for the
/// caller that actually performed the archive-and-reset; racers that were
/// absorbed report false along with the winner's allowance.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub allowance: Allowance,
    pub transitioned: bool,
}

pub struct PeriodTransitionCoordinator {
    store: Arc<dyn QuotaStore>,
    plans: Arc<dyn PlanSource>,
    config: QuotaConfig,
}

impl PeriodTransitionCoordinator {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        plans: Arc<dyn PlanSource>,
        config: QuotaConfig,
    ) -> Self {
        Self {
            store,
            plans,
            config,
        }
    }

    /// Return the allowance for the period containing `now`, creating or
    /// transitioning it as needed. Losing a transition race is absorbed by
    /// re-reading; callers always get the winner's row.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn ensure_current_period(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, AppError> {
        let plan = self.plans.plan_for(organization_id).await?;
        let current = period::current_period(plan.anchor, now)?;

        for attempt in 0..MAX_TRANSITION_ATTEMPTS {
            let existing = match self.store.get_allowance(organization_id).await? {
                Some(allowance) => allowance,
                None => {
                    let grants = self.store.active_grants(organization_id, now).await?;
                    let addon = precedence::active_grant_credit(&grants, now);
                    let created = self
                        .store
                        .create_allowance(&NewAllowance {
                            organization_id,
                            user_id: None,
                            period: current,
                            base_granted: plan.base_credits,
                            rollover_granted: 0,
                            addon_granted: addon,
                            addon_remaining: addon,
                        })
                        .await?;
                    // A racing creator may have inserted an older period;
                    // loop back so the stale row goes through a transition.
                    if created.period_start == current.start {
                        info!(
                            organization_id = %organization_id,
                            period_start = %created.period_start,
                            "Allowance created"
                        );
                        return Ok(TransitionOutcome {
                            allowance: created,
                            transitioned: false,
                        });
                    }
                    continue;
                }
            };

            if existing.period_start == current.start {
                return Ok(TransitionOutcome {
                    allowance: existing,
                    transitioned: false,
                });
            }

            let rollover_cap = plan
                .rollover_cap
                .unwrap_or_else(|| self.config.rollover_cap(plan.base_credits));
            let spec = TransitionSpec {
                expected_period_start: existing.period_start,
                new_period: current,
                base_granted: plan.base_credits,
                rollover_percent: plan.rollover_percent,
                rollover_cap,
            };

            match self.store.transition_allowance(organization_id, &spec).await {
                Ok(replacement) => {
                    record_transition(&organization_id.to_string(), "applied");
                    info!(
                        organization_id = %organization_id,
                        old_period_start = %existing.period_start,
                        new_period_start = %replacement.period_start,
                        rollover = replacement.rollover_granted,
                        "Period transitioned"
                    );
                    return Ok(TransitionOutcome {
                        allowance: replacement,
                        transitioned: true,
                    });
                }
                Err(AppError::TransitionConflict(_)) => {
                    // A concurrent instance won; its row is authoritative.
                    record_transition(&organization_id.to_string(), "conflict");
                    warn!(
                        organization_id = %organization_id,
                        attempt = attempt,
                        "Lost transition race, re-reading"
                    );
                    continue;
                }
                Err(e) => {
                    record_error(e.metric_label(), "transition_allowance");
                    return Err(e);
                }
            }
        }

        Err(AppError::TransitionConflict(organization_id))
    }
}
