//! Plan resolution seam.
//!
//! Subscription and plan CRUD live in the billing subsystem; this core only
//! needs an organization's anchor and credit policy. Deployments wire a
//! resolver backed by that subsystem; `StaticPlanSource` serves fixed
//! single-plan deployments and tests.

use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

/// The slice of a subscription plan this core acts on.
#[derive(Debug, Clone, Copy)]
pub struct OrgPlan {
    /// Billing anchor: the instant the organization's periods tile from.
    pub anchor: DateTime<Utc>,
    /// Base credits granted each period.
    pub base_credits: i64,
    /// Fraction of unused credit carried over a boundary.
    pub rollover_percent: Decimal,
    /// Per-plan rollover cap override; `None` falls back to
    /// `QuotaConfig::rollover_cap`.
    pub rollover_cap: Option<i64>,
}

#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn plan_for(&self, organization_id: Uuid) -> Result<OrgPlan, AppError>;
}

/// Fixed default plan with optional per-organization overrides.
pub struct StaticPlanSource {
    default_plan: OrgPlan,
    overrides: DashMap<Uuid, OrgPlan>,
}

impl StaticPlanSource {
    pub fn new(default_plan: OrgPlan) -> Self {
        Self {
            default_plan,
            overrides: DashMap::new(),
        }
    }

    pub fn set(&self, organization_id: Uuid, plan: OrgPlan) {
        self.overrides.insert(organization_id, plan);
    }
}

#[async_trait]
impl PlanSource for StaticPlanSource {
    async fn plan_for(&self, organization_id: Uuid) -> Result<OrgPlan, AppError> {
        Ok(self
            .overrides
            .get(&organization_id)
            .map(|p| *p)
            .unwrap_or(self.default_plan))
    }
}
