use std::sync::Arc;

use chrono::Duration;
use commerce_core::{
    clock::{Clock, ManualClock, SharedClock},
    errors::ServiceError,
    events::EventSender,
    models::reservation::{ReleaseReason, ReservationLine, ReservationStatus, StockKey},
    services::inventory_reservation_service::InventoryLedger,
};
use uuid::Uuid;

fn ledger() -> (InventoryLedger, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let shared: SharedClock = clock.clone();
    let (sender, _rx) = EventSender::channel(16);
    (
        InventoryLedger::new(Arc::new(sender), shared, Duration::minutes(15)),
        clock,
    )
}

fn line(key: StockKey, quantity: i64) -> ReservationLine {
    ReservationLine { key, quantity }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_oversell() {
    let (ledger, _) = ledger();
    let key = StockKey::new(Uuid::new_v4(), None);
    ledger.set_stock(key, 10).unwrap();

    // 20 concurrent reservations of 1 unit each, only 10 can succeed
    let mut tasks = vec![];
    for _ in 0..20 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            ledger.reserve(Uuid::new_v4(), &[line(key, 1)]).await
        }));
    }
    let mut success = 0;
    let mut conflicts = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => success += 1,
            Err(ServiceError::StockConflict(shortages)) => {
                assert_eq!(shortages[0].available, 0);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(
        success, 10,
        "exactly 10 reservations should succeed; got {}",
        success
    );
    assert_eq!(conflicts, 10);

    let level = ledger.stock_level(key);
    assert_eq!((level.on_hand, level.held, level.available), (10, 10, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_multi_key_requests_do_not_deadlock() {
    let (ledger, _) = ledger();
    let a = StockKey::new(Uuid::new_v4(), None);
    let b = StockKey::new(Uuid::new_v4(), None);
    ledger.set_stock(a, 50).unwrap();
    ledger.set_stock(b, 50).unwrap();

    // half the callers list the keys one way round, half the other
    let mut tasks = vec![];
    for i in 0..100 {
        let ledger = ledger.clone();
        let lines = if i % 2 == 0 {
            vec![line(a, 1), line(b, 1)]
        } else {
            vec![line(b, 1), line(a, 1)]
        };
        tasks.push(tokio::spawn(async move {
            ledger.reserve(Uuid::new_v4(), &lines).await.is_ok()
        }));
    }

    let joined = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        let mut success = 0;
        for t in tasks {
            if t.await.unwrap() {
                success += 1;
            }
        }
        success
    })
    .await
    .expect("reservations finished");

    assert_eq!(joined, 50);
    assert_eq!(ledger.stock_level(a).held, 50);
    assert_eq!(ledger.stock_level(b).held, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_and_release_race_settles_on_one_outcome() {
    let (ledger, _) = ledger();
    let key = StockKey::new(Uuid::new_v4(), None);
    ledger.set_stock(key, 100).unwrap();

    let mut reservations = vec![];
    for _ in 0..25 {
        reservations.push(
            ledger
                .reserve(Uuid::new_v4(), &[line(key, 2)])
                .await
                .unwrap()
                .id,
        );
    }

    let mut tasks = vec![];
    for id in reservations.iter().copied() {
        let committer = ledger.clone();
        tasks.push(tokio::spawn(async move {
            let _ = committer.commit(id).await;
        }));
        let releaser = ledger.clone();
        tasks.push(tokio::spawn(async move {
            let _ = releaser.release(id, ReleaseReason::Cancelled).await;
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let mut committed = 0;
    for id in &reservations {
        match ledger.get_reservation(*id).unwrap().status {
            ReservationStatus::Committed => committed += 1,
            ReservationStatus::Released => {}
            ReservationStatus::Held => panic!("reservation {id} left held"),
        }
    }

    let level = ledger.stock_level(key);
    assert_eq!(level.held, 0);
    assert_eq!(level.on_hand, 100 - 2 * committed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_and_commit_race_on_expired_holds() {
    let (ledger, clock) = ledger();
    let key = StockKey::new(Uuid::new_v4(), None);
    ledger.set_stock(key, 20).unwrap();

    let mut reservations = vec![];
    for _ in 0..20 {
        reservations.push(
            ledger
                .reserve(Uuid::new_v4(), &[line(key, 1)])
                .await
                .unwrap()
                .id,
        );
    }
    clock.advance(Duration::minutes(16));

    let sweeper = {
        let ledger = ledger.clone();
        let now = clock.now();
        tokio::spawn(async move { ledger.sweep_expired(now).await })
    };
    let mut commits = vec![];
    for id in reservations.iter().copied() {
        let ledger = ledger.clone();
        commits.push(tokio::spawn(async move { ledger.commit(id).await }));
    }

    for c in commits {
        assert!(matches!(
            c.await.unwrap(),
            Err(ServiceError::ReservationExpired(_))
        ));
    }
    sweeper.await.unwrap();

    let level = ledger.stock_level(key);
    assert_eq!((level.on_hand, level.held), (20, 0));
    for id in &reservations {
        let reservation = ledger.get_reservation(*id).unwrap();
        assert_eq!(reservation.release_reason, Some(ReleaseReason::Expired));
    }
}
