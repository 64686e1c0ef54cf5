//! Committed consumer offsets

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{PartitionId, Position, StoreError};

/// Offsets shared by the workers of every consumer group.
///
/// The committed position is the position of the next event to read.
pub trait OffsetStore: Send + Sync + 'static {
    fn committed(
        &self,
        group: &str,
        partition: PartitionId,
    ) -> Result<Option<Position>, StoreError>;

    /// Set the offset to `new` iff it currently equals `expected`
    fn compare_and_swap(
        &self,
        group: &str,
        partition: PartitionId,
        expected: Option<Position>,
        new: Position,
    ) -> Result<bool, StoreError>;
}

/// In-memory offset store
pub struct InMemoryOffsetStore {
    data: RwLock<HashMap<(Box<str>, PartitionId), Position>>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl OffsetStore for InMemoryOffsetStore {
    fn committed(
        &self,
        group: &str,
        partition: PartitionId,
    ) -> Result<Option<Position>, StoreError> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.get(&(group.into(), partition)).copied())
    }

    fn compare_and_swap(
        &self,
        group: &str,
        partition: PartitionId,
        expected: Option<Position>,
        new: Position,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        let key = (group.into(), partition);
        if data.get(&key).copied() != expected {
            return Ok(false);
        }
        data.insert(key, new);
        Ok(true)
    }
}

impl Default for InMemoryOffsetStore {
    fn default() -> Self {
        Self::new()
    }
}
