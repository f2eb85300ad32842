//! Admission decisions through the quota guard facade.

mod common;

use async_trait::async_trait;
use common::{utc, Harness};
use metering_service::error::AppError;
use metering_service::limiter::{ExternalLimiter, FailMode};
use metering_service::models::{ContextLevel, OperationKind};
use metering_service::quota::DenialReason;
use metering_service::store::QuotaStore;
use std::sync::Arc;
use uuid::Uuid;

/// Limiter that rejects every request.
struct DenyLimiter;

#[async_trait]
impl ExternalLimiter for DenyLimiter {
    async fn allow(&self, _organization_id: Uuid) -> Result<bool, AppError> {
        Ok(false)
    }
}

/// Limiter that is unreachable.
struct BrokenLimiter;

#[async_trait]
impl ExternalLimiter for BrokenLimiter {
    async fn allow(&self, _organization_id: Uuid) -> Result<bool, AppError> {
        Err(AppError::InternalError(anyhow::anyhow!(
            "limiter connection refused"
        )))
    }
}

#[tokio::test]
async fn allowed_decision_carries_a_reservation() {
    let h = Harness::new(50_000);
    let guard = h.guard();
    let now = utc(2025, 1, 10);

    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Standard, now)
        .await
        .unwrap();

    assert!(decision.allowed);
    assert!(decision.reason.is_none());
    assert!(!decision.near_limit_warning);

    let reservation = h
        .store
        .get_reservation(decision.reservation_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.estimated_amount, 5);
}

#[tokio::test]
async fn context_level_maps_to_configured_cost() {
    let h = Harness::new(50_000);
    let guard = h.guard();
    let now = utc(2025, 1, 10);

    for (level, cost) in [
        (ContextLevel::Compact, 1),
        (ContextLevel::Standard, 5),
        (ContextLevel::Extended, 25),
    ] {
        let decision = guard
            .check_and_reserve(h.org, h.user, level, now)
            .await
            .unwrap();
        let reservation = h
            .store
            .get_reservation(decision.reservation_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.estimated_amount, cost);
        guard.cancel(reservation.reservation_id).await.unwrap();
    }
}

#[tokio::test]
async fn full_flow_reserve_commit_updates_usage() {
    let h = Harness::new(50_000);
    let guard = h.guard();
    let now = utc(2025, 1, 10);

    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Extended, now)
        .await
        .unwrap();
    let entry = guard
        .commit(
            decision.reservation_id.unwrap(),
            19,
            "gen-7".to_string(),
            OperationKind::Generation,
            Some("artifact-7".to_string()),
            now,
        )
        .await
        .unwrap();

    assert_eq!(entry.amount, 19);

    let status = guard.usage_status(h.org, now).await.unwrap();
    assert_eq!(status.allowance.credits_used, 19);
    assert_eq!(status.allowance.breakdown.0.get(OperationKind::Generation), 19);
    assert!(!status.near_limit);

    let recent = guard.recent_entries(h.org, 10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].entry_id, entry.entry_id);
}

#[tokio::test]
async fn insufficient_credit_is_a_denial_not_an_error() {
    let h = Harness::new(3);
    let guard = h.guard();

    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Standard, utc(2025, 1, 10))
        .await
        .unwrap();

    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenialReason::InsufficientCredit));
    assert!(decision.reservation_id.is_none());
}

#[tokio::test]
async fn near_limit_warning_fires_at_the_threshold() {
    let h = Harness::new(50_000);
    let guard = h.guard();
    let now = utc(2025, 1, 10);

    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Standard, now)
        .await
        .unwrap();
    guard
        .commit(
            decision.reservation_id.unwrap(),
            45_000,
            "big-one".to_string(),
            OperationKind::Generation,
            None,
            now,
        )
        .await
        .unwrap();

    // 45_000 of 50_000 is exactly the default 0.9 threshold.
    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Compact, now)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(decision.near_limit_warning);
    assert!((decision.used_fraction - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn rate_limited_requests_are_denied() {
    let h = Harness::new(50_000);
    let guard = h.guard_with_limiter(Arc::new(DenyLimiter));

    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Standard, utc(2025, 1, 10))
        .await
        .unwrap();

    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenialReason::RateLimited));
    assert!(decision.reservation_id.is_none());
}

#[tokio::test]
async fn unreachable_limiter_fails_closed_by_default() {
    let h = Harness::new(50_000);
    let guard = h.guard_with_limiter(Arc::new(BrokenLimiter));

    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Standard, utc(2025, 1, 10))
        .await
        .unwrap();

    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenialReason::RateLimited));
}

#[tokio::test]
async fn unreachable_limiter_can_fail_open() {
    let mut h = Harness::new(50_000);
    h.config.limiter_fail_mode = FailMode::Open;
    let guard = h.guard_with_limiter(Arc::new(BrokenLimiter));

    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Standard, utc(2025, 1, 10))
        .await
        .unwrap();

    assert!(decision.allowed);
    assert!(decision.reservation_id.is_some());
}

#[tokio::test]
async fn cancel_releases_without_usage() {
    let h = Harness::new(50_000);
    let guard = h.guard();
    let now = utc(2025, 1, 10);

    let decision = guard
        .check_and_reserve(h.org, h.user, ContextLevel::Extended, now)
        .await
        .unwrap();
    guard.cancel(decision.reservation_id.unwrap()).await.unwrap();

    let status = guard.usage_status(h.org, now).await.unwrap();
    assert_eq!(status.allowance.credits_used, 0);
    assert!(guard.recent_entries(h.org, 10).await.unwrap().is_empty());
}
