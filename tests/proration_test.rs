//! Add-on grants, precedence splits, and mid-period plan changes.

mod common;

use chrono::Duration;
use common::{utc, Harness};
use metering_service::error::AppError;
use metering_service::models::{CreditSource, NewGrant, OperationKind};
use metering_service::store::QuotaStore;

#[tokio::test]
async fn addon_purchase_extends_available_credit() {
    let h = Harness::new(100);
    let guard = h.guard();
    let manager = h.manager();
    let now = utc(2025, 1, 10);

    guard.usage_status(h.org, now).await.unwrap();
    guard
        .purchase_addon(&NewGrant {
            organization_id: h.org,
            credits_granted: 5_000,
            expires_at: None,
            recurring: false,
        })
        .await
        .unwrap();

    // Well past the 100 base credits.
    manager.reserve(h.org, h.user, 3_000, now).await.unwrap();

    let allowance = h.store.get_allowance(h.org).await.unwrap().unwrap();
    assert_eq!(allowance.addon_granted, 5_000);
    assert!(allowance.is_consistent());
}

#[tokio::test]
async fn expired_grant_contributes_nothing() {
    let h = Harness::new(100);
    let guard = h.guard();
    let manager = h.manager();
    let now = utc(2025, 1, 10);

    guard.usage_status(h.org, now).await.unwrap();
    guard
        .purchase_addon(&NewGrant {
            organization_id: h.org,
            credits_granted: 5_000,
            expires_at: Some(now - Duration::hours(1)),
            recurring: false,
        })
        .await
        .unwrap();

    let err = manager.reserve(h.org, h.user, 3_000, now).await.unwrap_err();
    match err {
        AppError::InsufficientCredit { available, .. } => assert_eq!(available, 100),
        other => panic!("expected InsufficientCredit, got {other}"),
    }
}

#[tokio::test]
async fn debit_drains_rollover_before_base() {
    let h = Harness::new(50_000);
    let coordinator = h.coordinator();
    let manager = h.manager();
    let jan = utc(2025, 1, 10);

    // Build a rollover balance: use 30k in January, cross into February.
    coordinator.ensure_current_period(h.org, jan).await.unwrap();
    let reservation = manager.reserve(h.org, h.user, 30_000, jan).await.unwrap();
    manager
        .settle(
            reservation.reservation_id,
            30_000,
            "jan".to_string(),
            OperationKind::Generation,
            None,
            jan,
        )
        .await
        .unwrap();

    let feb = utc(2025, 2, 10);
    coordinator.ensure_current_period(h.org, feb).await.unwrap();
    let reservation = manager.reserve(h.org, h.user, 5_000, feb).await.unwrap();
    let entry = manager
        .settle(
            reservation.reservation_id,
            5_000,
            "feb".to_string(),
            OperationKind::Generation,
            None,
            feb,
        )
        .await
        .unwrap();

    // 4_000 rolled over (20% of 20_000); it drains first, base covers the
    // remainder.
    assert_eq!(entry.sources.0.rollover, 4_000);
    assert_eq!(entry.sources.0.base, 1_000);
    assert_eq!(entry.sources.0.primary_source(), Some(CreditSource::Rollover));

    let allowance = h.store.get_allowance(h.org).await.unwrap().unwrap();
    assert_eq!(allowance.rollover_remaining, 0);
    assert_eq!(allowance.base_remaining, 49_000);
    assert!(allowance.is_consistent());
}

#[tokio::test]
async fn addon_grants_drain_oldest_expiring_first() {
    let h = Harness::new(10);
    let guard = h.guard();
    let manager = h.manager();
    let now = utc(2025, 1, 10);

    guard.usage_status(h.org, now).await.unwrap();
    guard
        .purchase_addon(&NewGrant {
            organization_id: h.org,
            credits_granted: 1_000,
            expires_at: Some(utc(2025, 3, 1)),
            recurring: false,
        })
        .await
        .unwrap();
    guard
        .purchase_addon(&NewGrant {
            organization_id: h.org,
            credits_granted: 1_000,
            expires_at: Some(utc(2025, 2, 1)),
            recurring: false,
        })
        .await
        .unwrap();

    let reservation = manager.reserve(h.org, h.user, 1_500, now).await.unwrap();
    manager
        .settle(
            reservation.reservation_id,
            1_500,
            "drain".to_string(),
            OperationKind::Analysis,
            None,
            now,
        )
        .await
        .unwrap();

    // Base 10 first, then 1_000 from the February grant, 490 from March.
    let grants = h.store.active_grants(h.org, now).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].expires_at, Some(utc(2025, 3, 1)));
    assert_eq!(grants[0].credits_remaining, 510);

    let allowance = h.store.get_allowance(h.org).await.unwrap().unwrap();
    assert_eq!(allowance.base_remaining, 0);
    assert_eq!(allowance.addon_remaining, 510);
    assert!(allowance.is_consistent());
}

#[tokio::test]
async fn bonus_is_spent_last_under_default_precedence() {
    let h = Harness::new(100);
    let guard = h.guard();
    let manager = h.manager();
    let now = utc(2025, 1, 10);

    guard.grant_bonus(h.org, 50, now).await.unwrap();

    let reservation = manager.reserve(h.org, h.user, 120, now).await.unwrap();
    let entry = manager
        .settle(
            reservation.reservation_id,
            120,
            "spend".to_string(),
            OperationKind::Generation,
            None,
            now,
        )
        .await
        .unwrap();

    assert_eq!(entry.sources.0.base, 100);
    assert_eq!(entry.sources.0.bonus, 20);

    let allowance = h.store.get_allowance(h.org).await.unwrap().unwrap();
    assert_eq!(allowance.bonus_remaining, 30);
    assert!(allowance.is_consistent());
}

#[tokio::test]
async fn plan_change_mid_period_prorates_the_new_limit() {
    let h = Harness::new(50_000);
    let guard = h.guard();
    let manager = h.manager();
    let now = utc(2025, 1, 10);

    guard.usage_status(h.org, now).await.unwrap();
    let reservation = manager.reserve(h.org, h.user, 10_000, now).await.unwrap();
    manager
        .settle(
            reservation.reservation_id,
            10_000,
            "before-upgrade".to_string(),
            OperationKind::Generation,
            None,
            now,
        )
        .await
        .unwrap();

    // Upgrade to 100k on day 16 of a 31-day period.
    let change_date = utc(2025, 1, 16);
    let (limits, allowance) = guard
        .change_plan(h.org, 100_000, change_date, now)
        .await
        .unwrap();

    assert_eq!(limits.rollover, 40_000);
    assert_eq!(limits.prorated_new, 100_000 * 16 / 31);
    assert_eq!(limits.total, limits.rollover + limits.prorated_new);

    assert_eq!(allowance.base_remaining, limits.prorated_new);
    assert_eq!(allowance.rollover_remaining, limits.rollover);
    assert_eq!(allowance.credits_used, 10_000);
    assert!(allowance.is_consistent());
}

#[tokio::test]
async fn downgrade_with_overage_never_goes_negative() {
    let h = Harness::new(50_000);
    let guard = h.guard();
    let manager = h.manager();
    let now = utc(2025, 1, 10);

    guard.usage_status(h.org, now).await.unwrap();
    let reservation = manager.reserve(h.org, h.user, 48_000, now).await.unwrap();
    manager
        .settle(
            reservation.reservation_id,
            48_000,
            "heavy".to_string(),
            OperationKind::Generation,
            None,
            now,
        )
        .await
        .unwrap();

    let (limits, allowance) = guard
        .change_plan(h.org, 10_000, utc(2025, 1, 16), now)
        .await
        .unwrap();

    assert_eq!(limits.rollover, 2_000);
    assert!(limits.prorated_new >= 0);
    assert!(allowance.base_remaining >= 0);
    assert!(allowance.is_consistent());
}

#[tokio::test]
async fn non_positive_grant_or_bonus_is_rejected() {
    let h = Harness::new(100);
    let guard = h.guard();
    let now = utc(2025, 1, 10);

    let err = guard
        .purchase_addon(&NewGrant {
            organization_id: h.org,
            credits_granted: 0,
            expires_at: None,
            recurring: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = guard.grant_bonus(h.org, -5, now).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}
