//! In-memory record stores.
//!
//! Carts, checkout sessions, payment intents and orders live in
//! [`VersionedStore`]s. Every record carries a version counter; callers that
//! read a record, think, and then write it back go through
//! [`VersionedStore::update`], which rejects the write if anyone else got
//! there first.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::ServiceError;

/// A record with identity and an optimistic-concurrency version.
pub trait Versioned: Clone + Send + Sync + 'static {
    fn id(&self) -> Uuid;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

#[derive(Debug)]
pub struct VersionedStore<T> {
    entity: &'static str,
    records: DashMap<Uuid, T>,
}

impl<T: Versioned> VersionedStore<T> {
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            records: DashMap::new(),
        }
    }

    pub fn shared(entity: &'static str) -> Arc<Self> {
        Arc::new(Self::new(entity))
    }

    /// Inserts a new record at version 1.
    pub fn insert(&self, mut record: T) -> Result<T, ServiceError> {
        record.set_version(1);
        match self.records.entry(record.id()) {
            Entry::Occupied(_) => Err(ServiceError::Conflict(format!(
                "{} {} already exists",
                self.entity,
                record.id()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<T> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub fn require(&self, id: Uuid) -> Result<T, ServiceError> {
        self.get(id)
            .ok_or_else(|| ServiceError::NotFound(format!("{} {} not found", self.entity, id)))
    }

    /// Write-if-unchanged. `f` runs against a copy; the copy replaces the
    /// stored record only if `f` succeeds and the stored version still
    /// equals `expected_version`.
    pub fn update<F>(&self, id: Uuid, expected_version: u64, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&mut T) -> Result<(), ServiceError>,
    {
        let mut slot = self
            .records
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("{} {} not found", self.entity, id)))?;
        let actual = slot.version();
        if actual != expected_version {
            return Err(ServiceError::ConcurrentModification {
                id,
                expected: expected_version,
                actual,
            });
        }
        Self::apply(&mut slot, f)
    }

    /// Atomic read-modify-write without a caller version. Used by internal
    /// state-machine steps (webhooks, sweeps) that act on the latest state.
    pub fn update_unchecked<F>(&self, id: Uuid, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&mut T) -> Result<(), ServiceError>,
    {
        let mut slot = self
            .records
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("{} {} not found", self.entity, id)))?;
        Self::apply(&mut slot, f)
    }

    fn apply<F>(slot: &mut T, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&mut T) -> Result<(), ServiceError>,
    {
        let mut draft = slot.clone();
        f(&mut draft)?;
        draft.set_version(slot.version() + 1);
        *slot = draft.clone();
        Ok(draft)
    }

    pub fn remove(&self, id: Uuid) -> Option<T> {
        self.records.remove(&id).map(|(_, record)| record)
    }

    pub fn values(&self) -> Vec<T> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn find<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.records
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
