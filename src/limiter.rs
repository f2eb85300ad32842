//! Pass-through to the network-layer rate limiter.
//!
//! Rate limiting itself is out of scope; this seam exists so the behavior
//! when the limiter is unreachable is explicit configuration (fail-open vs
//! fail-closed) instead of an implicit default.

use crate::error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// What to do when the external limiter cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    Open,
    Closed,
}

impl FailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailMode::Open => "open",
            FailMode::Closed => "closed",
        }
    }
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            _ => Err(format!("Invalid limiter fail mode: {}", s)),
        }
    }
}

/// Decision source for request-level throttling, independent of credit
/// accounting. Errors mean "limiter unreachable" and are resolved by the
/// caller according to `FailMode`.
#[async_trait]
pub trait ExternalLimiter: Send + Sync {
    async fn allow(&self, organization_id: Uuid) -> Result<bool, AppError>;
}

/// Limiter that admits everything; for deployments that throttle upstream.
pub struct NoopLimiter;

#[async_trait]
impl ExternalLimiter for NoopLimiter {
    async fn allow(&self, _organization_id: Uuid) -> Result<bool, AppError> {
        Ok(true)
    }
}

type OrgRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// In-process per-organization token bucket.
pub struct LocalLimiter {
    limiters: DashMap<Uuid, OrgRateLimiter>,
    per_minute: NonZeroU32,
}

impl LocalLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            limiters: DashMap::new(),
            per_minute: NonZeroU32::new(requests_per_minute.max(1))
                .unwrap_or(NonZeroU32::MIN),
        }
    }
}

#[async_trait]
impl ExternalLimiter for LocalLimiter {
    async fn allow(&self, organization_id: Uuid) -> Result<bool, AppError> {
        let limiter = self
            .limiters
            .entry(organization_id)
            .or_insert_with(|| Arc::new(RateLimiter::direct(Quota::per_minute(self.per_minute))))
            .clone();
        Ok(limiter.check().is_ok())
    }
}
