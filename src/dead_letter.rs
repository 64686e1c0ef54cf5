//! Terminal holding path for events that cannot be processed

use std::sync::RwLock;

use crate::{ErrorCategory, Event, PartitionId, Position, StoreError};

/// What was dead-lettered
#[derive(Clone, Debug, PartialEq)]
pub enum DeadLetterPayload {
    Event(Event),
    /// Record that could not be decoded
    Raw(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeadLetter {
    pub consumer_group: Box<str>,
    pub partition: PartitionId,
    pub position: Position,
    pub payload: DeadLetterPayload,
    pub category: ErrorCategory,
    pub error: Box<str>,
    pub attempts: u32,
    pub dead_lettered_at_millis: u64,
}

impl DeadLetter {
    pub fn event(&self) -> Option<&Event> {
        match &self.payload {
            DeadLetterPayload::Event(event) => Some(event),
            DeadLetterPayload::Raw(_) => None,
        }
    }
}

pub trait DeadLetterSink: Send + Sync + 'static {
    fn route(&self, letter: DeadLetter) -> Result<(), StoreError>;
}

/// In-memory dead-letter queue
pub struct InMemoryDeadLetterQueue {
    letters: RwLock<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self {
            letters: RwLock::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.letters.read().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn route(&self, letter: DeadLetter) -> Result<(), StoreError> {
        self.letters.write().map_err(StoreError::poisoned)?.push(letter);
        Ok(())
    }
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}
