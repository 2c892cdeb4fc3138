//! Inventory reservation ledger
//!
//! Holds the per-(product, variant) counters and the reservations taken
//! against them. Every counter sits behind its own mutex; a call that
//! touches several keys locks them in key order, so two checkouts competing
//! for the same stock serialize on that stock and nothing else. No lock is
//! held across an `.await`: events are sent after the guards drop.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    errors::ServiceError,
    events::{Event, EventSender},
    models::reservation::{
        ReleaseReason, ReservationLine, ReservationStatus, StockKey, StockLevel, StockReservation,
        StockShortage, StockSnapshot,
    },
};

/// Recovers the guard from a poisoned mutex. Counter updates are applied
/// only after every check passes, so a panic never leaves half a write.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct InventoryLedger {
    counters: Arc<DashMap<StockKey, Arc<Mutex<StockLevel>>>>,
    reservations: Arc<DashMap<Uuid, Arc<Mutex<StockReservation>>>>,
    event_sender: Arc<EventSender>,
    clock: SharedClock,
    reservation_ttl: Duration,
}

/// What a commit or release actually did.
enum Transition {
    Applied(StockReservation),
    AlreadyDone(StockReservation),
}

impl InventoryLedger {
    pub fn new(event_sender: Arc<EventSender>, clock: SharedClock, reservation_ttl: Duration) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            reservations: Arc::new(DashMap::new()),
            event_sender,
            clock,
            reservation_ttl,
        }
    }

    fn counter(&self, key: StockKey) -> Arc<Mutex<StockLevel>> {
        self.counters
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(StockLevel::default())))
            .value()
            .clone()
    }

    /// Sets on-hand stock for a key. Refuses to go below what is currently held.
    #[instrument(skip(self))]
    pub fn set_stock(&self, key: StockKey, on_hand: i64) -> Result<StockSnapshot, ServiceError> {
        if on_hand < 0 {
            return Err(ServiceError::ValidationError(
                "On-hand stock cannot be negative".to_string(),
            ));
        }
        let counter = self.counter(key);
        let mut level = lock(&counter);
        if on_hand < level.held {
            return Err(ServiceError::Conflict(format!(
                "Cannot set stock for {} to {}: {} units are held",
                key, on_hand, level.held
            )));
        }
        level.on_hand = on_hand;
        Ok(snapshot(key, &level))
    }

    /// Receives (`delta > 0`) or writes off (`delta < 0`) stock.
    #[instrument(skip(self))]
    pub fn adjust_stock(&self, key: StockKey, delta: i64) -> Result<StockSnapshot, ServiceError> {
        let counter = self.counter(key);
        let mut level = lock(&counter);
        let on_hand = level.on_hand + delta;
        if on_hand < level.held || on_hand < 0 {
            return Err(ServiceError::Conflict(format!(
                "Adjusting {} by {} would leave {} on hand with {} held",
                key, delta, on_hand, level.held
            )));
        }
        level.on_hand = on_hand;
        Ok(snapshot(key, &level))
    }

    pub fn stock_level(&self, key: StockKey) -> StockSnapshot {
        match self.counters.get(&key) {
            Some(counter) => snapshot(key, &lock(counter.value())),
            None => snapshot(key, &StockLevel::default()),
        }
    }

    pub fn get_reservation(&self, reservation_id: Uuid) -> Result<StockReservation, ServiceError> {
        self.reservations
            .get(&reservation_id)
            .map(|r| lock(r.value()).clone())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Reservation {} not found", reservation_id))
            })
    }

    /// Holds every requested line or none of them.
    ///
    /// Lines for the same key are summed first. On shortage the error lists
    /// each key that could not be satisfied and nothing is held.
    #[instrument(skip(self, lines), fields(owner_id = %owner_id, lines = lines.len()))]
    pub async fn reserve(
        &self,
        owner_id: Uuid,
        lines: &[ReservationLine],
    ) -> Result<StockReservation, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "Nothing to reserve".to_string(),
            ));
        }
        let mut requested: BTreeMap<StockKey, i64> = BTreeMap::new();
        for line in lines {
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Quantity for {} must be positive",
                    line.key
                )));
            }
            *requested.entry(line.key).or_insert(0) += line.quantity;
        }

        match self.try_hold(owner_id, &requested) {
            Ok(reservation) => {
                info!(
                    reservation_id = %reservation.id,
                    units = reservation.total_quantity(),
                    "Stock reserved"
                );
                self.event_sender
                    .send_or_log(Event::InventoryReserved {
                        reservation_id: reservation.id,
                        owner_id,
                        lines: reservation.lines.clone(),
                        expires_at: reservation.expires_at,
                    })
                    .await;
                Ok(reservation)
            }
            Err(shortages) => {
                warn!(items = shortages.len(), "Stock conflict while reserving");
                self.event_sender
                    .send_or_log(Event::StockConflict {
                        owner_id,
                        shortages: shortages.clone(),
                    })
                    .await;
                Err(ServiceError::StockConflict(shortages))
            }
        }
    }

    fn try_hold(
        &self,
        owner_id: Uuid,
        requested: &BTreeMap<StockKey, i64>,
    ) -> Result<StockReservation, Vec<StockShortage>> {
        // BTreeMap iteration is key order, which is also the lock order
        let counters: Vec<(StockKey, i64, Arc<Mutex<StockLevel>>)> = requested
            .iter()
            .map(|(key, qty)| (*key, *qty, self.counter(*key)))
            .collect();
        let mut guards: Vec<MutexGuard<'_, StockLevel>> =
            counters.iter().map(|(_, _, c)| lock(c)).collect();

        let shortages: Vec<StockShortage> = counters
            .iter()
            .zip(guards.iter())
            .filter(|((_, qty, _), level)| level.available() < *qty)
            .map(|((key, qty, _), level)| StockShortage {
                key: *key,
                requested: *qty,
                available: level.available().max(0),
            })
            .collect();
        if !shortages.is_empty() {
            return Err(shortages);
        }

        for ((_, qty, _), level) in counters.iter().zip(guards.iter_mut()) {
            level.held += qty;
        }

        let now = self.clock.now();
        let reservation = StockReservation {
            id: Uuid::new_v4(),
            owner_id,
            lines: counters
                .iter()
                .map(|(key, qty, _)| ReservationLine {
                    key: *key,
                    quantity: *qty,
                })
                .collect(),
            status: ReservationStatus::Held,
            created_at: now,
            expires_at: now + self.reservation_ttl,
            committed_at: None,
            released_at: None,
            release_reason: None,
        };
        drop(guards);
        // never touch the reservation map while holding counter locks
        self.reservations
            .insert(reservation.id, Arc::new(Mutex::new(reservation.clone())));
        Ok(reservation)
    }

    /// Turns a live hold into a permanent decrement. Committing twice is a
    /// no-op; committing after expiry fails even if the sweep has not run.
    #[instrument(skip(self))]
    pub async fn commit(&self, reservation_id: Uuid) -> Result<StockReservation, ServiceError> {
        let now = self.clock.now();
        match self.transition(reservation_id, |reservation, counters| {
            match reservation.status {
                ReservationStatus::Committed => return Ok(false),
                ReservationStatus::Released => {
                    return Err(match reservation.release_reason {
                        Some(ReleaseReason::Expired) => {
                            ServiceError::ReservationExpired(reservation.id)
                        }
                        _ => ServiceError::InvalidTransition(format!(
                            "Reservation {} was released and cannot be committed",
                            reservation.id
                        )),
                    })
                }
                ReservationStatus::Held if reservation.is_expired_at(now) => {
                    return Err(ServiceError::ReservationExpired(reservation.id))
                }
                ReservationStatus::Held => {}
            }

            for (line, level) in reservation.lines.iter().zip(counters.iter()) {
                if level.held < line.quantity || level.on_hand < line.quantity {
                    return Err(ServiceError::invariant(format!(
                        "Reservation {} holds {} of {} but counter shows on_hand={} held={}",
                        reservation.id, line.quantity, line.key, level.on_hand, level.held
                    )));
                }
            }
            for (line, level) in reservation.lines.iter().zip(counters.iter_mut()) {
                level.on_hand -= line.quantity;
                level.held -= line.quantity;
            }
            reservation.status = ReservationStatus::Committed;
            reservation.committed_at = Some(now);
            Ok(true)
        })? {
            Transition::Applied(reservation) => {
                info!(reservation_id = %reservation.id, "Reservation committed");
                self.event_sender
                    .send_or_log(Event::InventoryCommitted {
                        reservation_id: reservation.id,
                        owner_id: reservation.owner_id,
                    })
                    .await;
                Ok(reservation)
            }
            Transition::AlreadyDone(reservation) => Ok(reservation),
        }
    }

    /// Returns held units to availability. Releasing twice is a no-op;
    /// a committed reservation cannot be released.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        reservation_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<StockReservation, ServiceError> {
        let now = self.clock.now();
        match self.transition(reservation_id, |reservation, counters| {
            match reservation.status {
                ReservationStatus::Released => return Ok(false),
                ReservationStatus::Committed => {
                    return Err(ServiceError::InvalidTransition(format!(
                        "Reservation {} is committed and cannot be released",
                        reservation.id
                    )))
                }
                ReservationStatus::Held => {}
            }

            for (line, level) in reservation.lines.iter().zip(counters.iter()) {
                if level.held < line.quantity {
                    return Err(ServiceError::invariant(format!(
                        "Reservation {} holds {} of {} but only {} are held",
                        reservation.id, line.quantity, line.key, level.held
                    )));
                }
            }
            for (line, level) in reservation.lines.iter().zip(counters.iter_mut()) {
                level.held -= line.quantity;
            }
            reservation.status = ReservationStatus::Released;
            reservation.released_at = Some(now);
            reservation.release_reason = Some(reason);
            Ok(true)
        })? {
            Transition::Applied(reservation) => {
                info!(reservation_id = %reservation.id, %reason, "Reservation released");
                self.event_sender
                    .send_or_log(Event::InventoryReleased {
                        reservation_id: reservation.id,
                        owner_id: reservation.owner_id,
                        reason,
                    })
                    .await;
                Ok(reservation)
            }
            Transition::AlreadyDone(reservation) => Ok(reservation),
        }
    }

    /// Locks the reservation, then its counters in key order, and runs `f`.
    /// `f` returns whether it changed anything.
    fn transition<F>(&self, reservation_id: Uuid, f: F) -> Result<Transition, ServiceError>
    where
        F: FnOnce(&mut StockReservation, &mut [MutexGuard<'_, StockLevel>]) -> Result<bool, ServiceError>,
    {
        let entry = self
            .reservations
            .get(&reservation_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Reservation {} not found", reservation_id))
            })?;
        let mut reservation = lock(&entry);

        // lines are stored in key order by try_hold
        let counters: Vec<Arc<Mutex<StockLevel>>> = reservation
            .lines
            .iter()
            .map(|line| self.counter(line.key))
            .collect();
        let mut guards: Vec<MutexGuard<'_, StockLevel>> = counters.iter().map(|c| lock(c)).collect();

        let mut draft = reservation.clone();
        let changed = f(&mut draft, &mut guards)?;
        drop(guards);
        if changed {
            *reservation = draft.clone();
            Ok(Transition::Applied(draft))
        } else {
            Ok(Transition::AlreadyDone(draft))
        }
    }

    /// Releases every held reservation whose expiry has passed.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<Uuid> = self
            .reservations
            .iter()
            .filter(|entry| {
                let reservation = lock(entry.value());
                reservation.is_held() && reservation.is_expired_at(now)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut released = 0;
        for reservation_id in candidates {
            match self.release(reservation_id, ReleaseReason::Expired).await {
                Ok(reservation) if reservation.release_reason == Some(ReleaseReason::Expired) => {
                    released += 1
                }
                Ok(_) => {}
                // committed between the scan and the release
                Err(ServiceError::InvalidTransition(_)) => {}
                Err(e) => error!(reservation_id = %reservation_id, "Failed to release expired reservation: {}", e),
            }
        }
        if released > 0 {
            info!(released, "Released expired reservations");
        }
        released
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` until the
    /// runtime shuts down.
    pub fn spawn_expiry_sweeper(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let ledger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = ledger.clock.now();
                ledger.sweep_expired(now).await;
            }
        })
    }
}

fn snapshot(key: StockKey, level: &StockLevel) -> StockSnapshot {
    StockSnapshot {
        key,
        on_hand: level.on_hand,
        held: level.held,
        available: level.available(),
    }
}
