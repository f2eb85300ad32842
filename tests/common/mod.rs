//! Shared test harness: a memory-backed quota stack with a fixed plan.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use metering_service::config::QuotaConfig;
use metering_service::limiter::{ExternalLimiter, NoopLimiter};
use metering_service::plan::{OrgPlan, StaticPlanSource};
use metering_service::quota::{PeriodTransitionCoordinator, QuotaGuard, ReservationManager};
use metering_service::store::MemoryStore;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn utc_hms(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
}

/// Anchor all test plans at 2025-01-01 so period math is easy to eyeball.
pub fn anchor() -> DateTime<Utc> {
    utc(2025, 1, 1)
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub plans: Arc<StaticPlanSource>,
    pub config: QuotaConfig,
    pub org: Uuid,
    pub user: Uuid,
}

impl Harness {
    /// Monthly plan with the given base credits, 20% rollover, default
    /// quota config.
    pub fn new(base_credits: i64) -> Self {
        Self::with_plan(OrgPlan {
            anchor: anchor(),
            base_credits,
            rollover_percent: Decimal::new(2, 1),
            rollover_cap: None,
        })
    }

    pub fn with_plan(plan: OrgPlan) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            plans: Arc::new(StaticPlanSource::new(plan)),
            config: QuotaConfig::default(),
            org: Uuid::new_v4(),
            user: Uuid::new_v4(),
        }
    }

    pub fn guard(&self) -> QuotaGuard {
        self.guard_with_limiter(Arc::new(NoopLimiter))
    }

    pub fn guard_with_limiter(&self, limiter: Arc<dyn ExternalLimiter>) -> QuotaGuard {
        QuotaGuard::new(
            self.store.clone(),
            self.plans.clone(),
            limiter,
            self.config.clone(),
        )
    }

    pub fn coordinator(&self) -> PeriodTransitionCoordinator {
        PeriodTransitionCoordinator::new(
            self.store.clone(),
            self.plans.clone(),
            self.config.clone(),
        )
    }

    pub fn manager(&self) -> ReservationManager {
        ReservationManager::new(self.store.clone(), self.config.clone())
    }
}
