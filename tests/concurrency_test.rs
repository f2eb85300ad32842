//! Concurrency properties: no joint overspend, exactly-once settlement.

mod common;

use common::{utc, Harness};
use metering_service::models::OperationKind;
use metering_service::store::QuotaStore;
use std::sync::Arc;

#[tokio::test]
async fn concurrent_reservations_within_budget_all_succeed() {
    let h = Harness::new(40_000);
    let coordinator = h.coordinator();
    let manager = Arc::new(h.manager());
    let now = utc(2025, 1, 10);

    coordinator.ensure_current_period(h.org, now).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let manager = manager.clone();
        let (org, user) = (h.org, h.user);
        handles.push(tokio::spawn(async move {
            manager.reserve(org, user, 18_000, now).await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // 36_000 held of 40_000: nothing left for another 18_000.
    assert!(manager.reserve(h.org, h.user, 18_000, now).await.is_err());
}

#[tokio::test]
async fn concurrent_reservations_cannot_jointly_overspend() {
    let h = Harness::new(40_000);
    let coordinator = h.coordinator();
    let manager = Arc::new(h.manager());
    let now = utc(2025, 1, 10);

    coordinator.ensure_current_period(h.org, now).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let manager = manager.clone();
        let (org, user) = (h.org, h.user);
        handles.push(tokio::spawn(async move {
            manager.reserve(org, user, 25_000, now).await
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1, "two 25k holds cannot both fit in 40k");
}

#[tokio::test]
async fn concurrent_settles_with_one_key_debit_once() {
    let h = Harness::new(50_000);
    let coordinator = h.coordinator();
    let manager = Arc::new(h.manager());
    let now = utc(2025, 1, 10);

    coordinator.ensure_current_period(h.org, now).await.unwrap();
    let reservation = manager.reserve(h.org, h.user, 1_000, now).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        let reservation_id = reservation.reservation_id;
        handles.push(tokio::spawn(async move {
            manager
                .settle(
                    reservation_id,
                    1_000,
                    "settle-race".to_string(),
                    OperationKind::Generation,
                    None,
                    now,
                )
                .await
        }));
    }

    let mut entry_ids = Vec::new();
    for handle in handles {
        entry_ids.push(handle.await.unwrap().unwrap().entry_id);
    }
    entry_ids.dedup();
    assert_eq!(entry_ids.len(), 1, "every settle must see the same entry");

    let allowance = h.store.get_allowance(h.org).await.unwrap().unwrap();
    assert_eq!(allowance.credits_used, 1_000);
    assert_eq!(h.store.list_ledger_entries(h.org, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn interleaved_reserve_settle_keeps_balances_consistent() {
    let h = Harness::new(50_000);
    let coordinator = h.coordinator();
    let manager = Arc::new(h.manager());
    let now = utc(2025, 1, 10);

    coordinator.ensure_current_period(h.org, now).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let manager = manager.clone();
        let (org, user) = (h.org, h.user);
        handles.push(tokio::spawn(async move {
            let reservation = manager.reserve(org, user, 1_000, now).await?;
            manager
                .settle(
                    reservation.reservation_id,
                    1_000,
                    format!("op-{i}"),
                    OperationKind::Transformation,
                    None,
                    now,
                )
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let allowance = h.store.get_allowance(h.org).await.unwrap().unwrap();
    assert_eq!(allowance.credits_used, 10_000);
    assert_eq!(allowance.base_remaining, 40_000);
    assert!(allowance.is_consistent());
}
