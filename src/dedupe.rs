//! Idempotency record storage

use std::collections::HashMap;
use std::sync::RwLock;

use crate::idempotency::{IdempotencyKey, ResultToken};
use crate::{ConsumerId, EventId, StoreError};

/// Processing state of an (event, consumer) pair
#[derive(Clone, Debug, PartialEq)]
pub enum RecordStatus {
    /// A worker admitted the event and is running its handler
    InFlight { claimed_at_millis: u64 },
    /// The handler succeeded; the record is final
    Processed {
        processed_at_millis: u64,
        result_token: Option<ResultToken>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct IdempotencyRecord {
    pub event_id: EventId,
    pub consumer_id: ConsumerId,
    pub status: RecordStatus,
}

impl IdempotencyRecord {
    pub fn claim(event_id: EventId, consumer_id: ConsumerId, now_millis: u64) -> Self {
        Self {
            event_id,
            consumer_id,
            status: RecordStatus::InFlight {
                claimed_at_millis: now_millis,
            },
        }
    }

    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::for_delivery(self.event_id, &self.consumer_id)
    }

    pub fn is_processed(&self) -> bool {
        matches!(self.status, RecordStatus::Processed { .. })
    }
}

/// Result of an insert-if-absent
#[derive(Clone, Debug, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    Existing(IdempotencyRecord),
}

/// Persisted identity ledger shared by every worker of a consumer group.
///
/// Each operation must be atomic with respect to the others on the same key.
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Insert `record` unless a record with the same key exists
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError>;

    /// Turn an in-flight claim into a processed record
    fn complete(
        &self,
        key: &IdempotencyKey,
        processed_at_millis: u64,
        result_token: Option<ResultToken>,
    ) -> Result<(), StoreError>;

    /// Remove an in-flight claim; processed records are never removed here
    fn remove_claim(&self, key: &IdempotencyKey) -> Result<bool, StoreError>;

    /// Replace an in-flight claim made before `stale_before_millis` with `record`
    fn take_over_stale(
        &self,
        record: IdempotencyRecord,
        stale_before_millis: u64,
    ) -> Result<bool, StoreError>;

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Drop processed records older than `processed_before_millis` and claims
    /// older than `claimed_before_millis`
    fn prune(
        &self,
        processed_before_millis: u64,
        claimed_before_millis: u64,
    ) -> Result<usize, StoreError>;
}

/// In-memory idempotency store
pub struct InMemoryIdempotencyStore {
    data: RwLock<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        match data.entry(record.key()) {
            std::collections::hash_map::Entry::Occupied(existing) => {
                Ok(InsertOutcome::Existing(existing.get().clone()))
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    fn complete(
        &self,
        key: &IdempotencyKey,
        processed_at_millis: u64,
        result_token: Option<ResultToken>,
    ) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        match data.get_mut(key) {
            Some(record) if !record.is_processed() => {
                record.status = RecordStatus::Processed {
                    processed_at_millis,
                    result_token,
                };
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict(format!("{key} already processed").into())),
            None => Err(StoreError::Conflict(format!("{key} has no claim").into())),
        }
    }

    fn remove_claim(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        match data.get(key) {
            Some(record) if !record.is_processed() => {
                data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn take_over_stale(
        &self,
        record: IdempotencyRecord,
        stale_before_millis: u64,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        let key = record.key();
        match data.get(&key).map(|r| &r.status) {
            Some(RecordStatus::InFlight { claimed_at_millis })
                if *claimed_at_millis < stale_before_millis =>
            {
                data.insert(key, record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn prune(
        &self,
        processed_before_millis: u64,
        claimed_before_millis: u64,
    ) -> Result<usize, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        let before = data.len();
        data.retain(|_, record| match record.status {
            RecordStatus::Processed {
                processed_at_millis, ..
            } => processed_at_millis >= processed_before_millis,
            RecordStatus::InFlight { claimed_at_millis } => {
                claimed_at_millis >= claimed_before_millis
            }
        });
        Ok(before - data.len())
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}
