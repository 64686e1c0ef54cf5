//! Identity types and the correlation context carried by saga messages

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current wall-clock time in milliseconds since the UNIX epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unique identifier of an event
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct EventId(pub u128);

impl EventId {
    /// Fresh, time-ordered identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7().as_u128())
    }

    /// Deterministic identifier derived from a namespace id and a name.
    ///
    /// The same inputs always produce the same id, so a message that is
    /// re-emitted after a crash deduplicates downstream.
    pub fn derive(namespace: u128, name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::from_u128(namespace), name.as_bytes()).as_u128())
    }

    /// Get the raw ID value
    pub fn get(&self) -> u128 {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventId({})", Uuid::from_u128(self.0))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0))
    }
}

impl std::str::FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|u| Self(u.as_u128()))
    }
}

/// Unique identifier for a saga execution
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SagaId(pub u128);

impl SagaId {
    /// Saga id for the saga started by `trigger`.
    ///
    /// Derived from the trigger event id so that every party (coordinator and
    /// first participant) and every redelivery agree on it.
    pub fn for_trigger(saga_type: &str, trigger: EventId) -> Self {
        Self(EventId::derive(trigger.0, saga_type).0)
    }

    /// Get the raw ID value
    pub fn get(&self) -> u128 {
        self.0
    }
}

impl std::fmt::Debug for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SagaId({})", Uuid::from_u128(self.0))
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0))
    }
}

impl std::str::FromStr for SagaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|u| Self(u.as_u128()))
    }
}

/// Index of a partition within the event log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record within one partition (0-based)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position(pub u64);

impl Position {
    /// Position of the first record of every partition
    pub const START: Position = Position(0);

    /// The position right after this one
    pub fn next(self) -> Position {
        Position(self.0 + 1)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an event consumer for deduplication purposes
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub Box<str>);

impl ConsumerId {
    /// Consumer id of `handler` running inside `group`
    pub fn new(group: &str, handler: &str) -> Self {
        Self(format!("{group}/{handler}").into_boxed_str())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation context passed with every saga message
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaContext {
    /// Unique saga execution identifier
    pub saga_id: SagaId,
    /// Type of saga (e.g., "appointment_booking")
    pub saga_type: Box<str>,
    /// Name of the current step
    pub step_name: Box<str>,
    /// Index of this step in the workflow (0-based)
    pub step_index: usize,
    /// Correlation ID linking all events in this saga
    pub correlation_id: Box<str>,
    /// Retry attempt number (0 = first attempt)
    pub attempt: u32,
    /// When the saga started (millis since UNIX epoch)
    pub saga_started_at_millis: u64,
}

impl SagaContext {
    /// Context of the first step of a new saga
    pub fn start(
        saga_id: SagaId,
        saga_type: &str,
        first_step: &str,
        correlation_id: &str,
        now_millis: u64,
    ) -> Self {
        Self {
            saga_id,
            saga_type: saga_type.into(),
            step_name: first_step.into(),
            step_index: 0,
            correlation_id: correlation_id.into(),
            attempt: 0,
            saga_started_at_millis: now_millis,
        }
    }

    /// Create a context for the next step in sequence
    pub fn next_step(&self, step_name: &str) -> Self {
        Self {
            step_name: step_name.into(),
            step_index: self.step_index + 1,
            attempt: 0,
            ..self.clone()
        }
    }

    /// Create a context addressed to another step of the same saga
    pub fn for_step(&self, step_index: usize, step_name: &str) -> Self {
        Self {
            step_name: step_name.into(),
            step_index,
            attempt: 0,
            ..self.clone()
        }
    }

    /// Create a context for a retry attempt
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Calculate elapsed time since saga started
    pub fn elapsed_millis(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.saga_started_at_millis)
    }
}

impl std::fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaContext")
            .field("saga_id", &self.saga_id)
            .field("saga_type", &self.saga_type)
            .field("step_name", &self.step_name)
            .field("step_index", &self.step_index)
            .field("attempt", &self.attempt)
            .finish()
    }
}
