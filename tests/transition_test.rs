//! Period lifecycle: lazy creation, exactly-once transition, rollover.

mod common;

use common::{utc, Harness};
use metering_service::error::AppError;
use metering_service::models::OperationKind;
use metering_service::plan::OrgPlan;
use metering_service::store::QuotaStore;
use rust_decimal::Decimal;
use std::sync::Arc;

#[tokio::test]
async fn first_touch_creates_allowance_for_current_period() {
    let h = Harness::new(50_000);
    let coordinator = h.coordinator();

    let outcome = coordinator
        .ensure_current_period(h.org, utc(2025, 1, 10))
        .await
        .unwrap();

    assert!(!outcome.transitioned, "lazy creation is not a transition");
    let allowance = outcome.allowance;
    assert_eq!(allowance.period_start, utc(2025, 1, 1));
    assert_eq!(allowance.period_end, utc(2025, 2, 1));
    assert_eq!(allowance.base_granted, 50_000);
    assert_eq!(allowance.base_remaining, 50_000);
    assert_eq!(allowance.rollover_granted, 0);
    assert_eq!(allowance.credits_used, 0);
    assert!(allowance.is_consistent());
}

#[tokio::test]
async fn repeated_touch_in_same_period_returns_same_allowance() {
    let h = Harness::new(50_000);
    let coordinator = h.coordinator();

    let first = coordinator
        .ensure_current_period(h.org, utc(2025, 1, 5))
        .await
        .unwrap();
    let second = coordinator
        .ensure_current_period(h.org, utc(2025, 1, 28))
        .await
        .unwrap();

    assert_eq!(first.allowance.allowance_id, second.allowance.allowance_id);
    assert!(!second.transitioned);
    assert!(h.store.list_usage_history(h.org, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn transition_archives_old_period_and_rolls_over_unused() {
    let h = Harness::new(50_000);
    let coordinator = h.coordinator();
    let manager = h.manager();
    let now = utc(2025, 1, 10);

    coordinator.ensure_current_period(h.org, now).await.unwrap();
    let reservation = manager.reserve(h.org, h.user, 30_000, now).await.unwrap();
    manager
        .settle(
            reservation.reservation_id,
            30_000,
            "jan-usage".to_string(),
            OperationKind::Generation,
            None,
            now,
        )
        .await
        .unwrap();

    let outcome = coordinator
        .ensure_current_period(h.org, utc(2025, 2, 10))
        .await
        .unwrap();
    assert!(outcome.transitioned);
    let feb = outcome.allowance;

    // 20_000 unused at 20% rollover.
    assert_eq!(feb.period_start, utc(2025, 2, 1));
    assert_eq!(feb.base_granted, 50_000);
    assert_eq!(feb.rollover_granted, 4_000);
    assert_eq!(feb.rollover_remaining, 4_000);
    assert_eq!(feb.credits_used, 0);
    assert!(feb.is_consistent());

    let history = h.store.list_usage_history(h.org, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].period_start, utc(2025, 1, 1));
    assert_eq!(history[0].credits_used, 30_000);
    assert_eq!(history[0].base_remaining, 20_000);
}

#[tokio::test]
async fn rollover_is_capped_by_plan_override() {
    let h = Harness::with_plan(OrgPlan {
        anchor: utc(2025, 1, 1),
        base_credits: 50_000,
        rollover_percent: Decimal::ONE,
        rollover_cap: Some(10_000),
    });
    let coordinator = h.coordinator();

    coordinator
        .ensure_current_period(h.org, utc(2025, 1, 10))
        .await
        .unwrap();
    // Nothing used: 50_000 unused at 100% would exceed the cap.
    let feb = coordinator
        .ensure_current_period(h.org, utc(2025, 2, 10))
        .await
        .unwrap()
        .allowance;

    assert_eq!(feb.rollover_granted, 10_000);
}

#[tokio::test]
async fn boundary_instant_belongs_to_new_period() {
    let h = Harness::new(50_000);
    let coordinator = h.coordinator();

    coordinator
        .ensure_current_period(h.org, utc(2025, 1, 31))
        .await
        .unwrap();
    let at_boundary = coordinator
        .ensure_current_period(h.org, utc(2025, 2, 1))
        .await
        .unwrap()
        .allowance;

    assert_eq!(at_boundary.period_start, utc(2025, 2, 1));
    assert_eq!(at_boundary.period_end, utc(2025, 3, 1));
}

#[tokio::test]
async fn bonus_credit_does_not_survive_the_boundary() {
    let h = Harness::new(50_000);
    let guard = h.guard();
    let jan = utc(2025, 1, 10);

    guard.grant_bonus(h.org, 2_000, jan).await.unwrap();
    let feb = guard.usage_status(h.org, utc(2025, 2, 10)).await.unwrap();

    assert_eq!(feb.allowance.bonus_granted, 0);
    assert_eq!(feb.allowance.bonus_remaining, 0);

    let history = guard.history(h.org, 10).await.unwrap();
    assert_eq!(history[0].bonus_granted, 2_000);
    assert_eq!(history[0].bonus_remaining, 2_000);
}

#[tokio::test]
async fn concurrent_transitions_apply_exactly_once() {
    let h = Harness::new(50_000);
    let coordinator = Arc::new(h.coordinator());

    coordinator
        .ensure_current_period(h.org, utc(2025, 1, 10))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        let org = h.org;
        handles.push(tokio::spawn(async move {
            coordinator.ensure_current_period(org, utc(2025, 2, 10)).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.allowance.period_start, utc(2025, 2, 1));
        if outcome.transitioned {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one caller performs the transition");

    let history = h.store.list_usage_history(h.org, 10).await.unwrap();
    assert_eq!(history.len(), 1, "transition must archive exactly one row");
}

#[tokio::test]
async fn future_anchor_is_rejected() {
    let h = Harness::with_plan(OrgPlan {
        anchor: utc(2030, 1, 1),
        base_credits: 50_000,
        rollover_percent: Decimal::new(2, 1),
        rollover_cap: None,
    });
    let coordinator = h.coordinator();

    let err = coordinator
        .ensure_current_period(h.org, utc(2025, 1, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidAnchor(_)));
}
