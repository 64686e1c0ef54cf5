//! Domain events, saga protocol messages and participant journal events

use std::collections::BTreeMap;

use crate::context::{now_millis, EventId, SagaContext, SagaId};
use crate::schema::SchemaError;

/// A single payload field value
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Kind of this value, `None` for `Null`
    pub fn kind(&self) -> Option<crate::schema::FieldKind> {
        use crate::schema::FieldKind;
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(FieldKind::Bool),
            Self::Int(_) => Some(FieldKind::Int),
            Self::Float(_) => Some(FieldKind::Float),
            Self::Text(_) => Some(FieldKind::Text),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Tagged field map carried by an event.
///
/// Interpreted against the schema registered for the event's
/// (type, schema_version) pair.
#[derive(Clone, Debug, Default, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Payload(pub BTreeMap<String, FieldValue>);

impl Payload {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<FieldValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_text)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(FieldValue::as_int)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Copy every field into `target` under `prefix`
    fn flatten_into(&self, prefix: &str, target: &mut Payload) {
        for (key, value) in &self.0 {
            target.0.insert(format!("{prefix}{key}"), value.clone());
        }
    }

    /// Collect the fields stored under `prefix`, with the prefix removed
    fn extract(&self, prefix: &str) -> Payload {
        Payload(
            self.0
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(prefix).map(|k| (k.to_string(), v.clone())))
                .collect(),
        )
    }
}

/// Immutable domain event.
///
/// Identity is the `id`; two events are equal iff their ids are equal.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub aggregate_id: String,
    pub partition_key: String,
    pub payload: Payload,
    pub schema_version: u32,
    pub produced_at_millis: u64,
    pub causation_id: Option<EventId>,
    pub correlation_id: String,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Event {
    /// Start building an event of `event_type` about `aggregate_id`
    pub fn builder(event_type: &str, aggregate_id: &str) -> EventBuilder {
        EventBuilder {
            id: None,
            event_type: event_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            partition_key: None,
            payload: Payload::new(),
            schema_version: 1,
            produced_at_millis: None,
            causation_id: None,
            correlation_id: None,
        }
    }
}

/// Builder for [`Event`]
#[derive(Clone, Debug)]
pub struct EventBuilder {
    id: Option<EventId>,
    event_type: String,
    aggregate_id: String,
    partition_key: Option<String>,
    payload: Payload,
    schema_version: u32,
    produced_at_millis: Option<u64>,
    causation_id: Option<EventId>,
    correlation_id: Option<String>,
}

impl EventBuilder {
    pub fn id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Defaults to the aggregate id
    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.payload.insert(key, value);
        self
    }

    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn produced_at(mut self, millis: u64) -> Self {
        self.produced_at_millis = Some(millis);
        self
    }

    pub fn caused_by(mut self, cause: &Event) -> Self {
        self.causation_id = Some(cause.id);
        self.correlation_id = Some(cause.correlation_id.clone());
        self
    }

    pub fn causation_id(mut self, id: EventId) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Defaults to the event's own id
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn build(self) -> Event {
        let id = self.id.unwrap_or_default();
        Event {
            id,
            partition_key: self.partition_key.unwrap_or_else(|| self.aggregate_id.clone()),
            event_type: self.event_type,
            aggregate_id: self.aggregate_id,
            payload: self.payload,
            schema_version: self.schema_version,
            produced_at_millis: self.produced_at_millis.unwrap_or_else(now_millis),
            causation_id: self.causation_id,
            correlation_id: self.correlation_id.unwrap_or_else(|| id.to_string()),
        }
    }
}

/// Event types of the saga protocol
pub mod saga_types {
    pub const STEP_REQUESTED: &str = "saga.step_requested";
    pub const STEP_COMPLETED: &str = "saga.step_completed";
    pub const STEP_FAILED: &str = "saga.step_failed";
    pub const COMPENSATION_REQUESTED: &str = "saga.compensation_requested";
    pub const STEP_COMPENSATED: &str = "saga.step_compensated";
    pub const COMPENSATION_FAILED: &str = "saga.compensation_failed";
    pub const SAGA_COMPLETED: &str = "saga.completed";
    pub const SAGA_FAILED: &str = "saga.failed";

    /// Every protocol event type
    pub const ALL: [&str; 8] = [
        STEP_REQUESTED,
        STEP_COMPLETED,
        STEP_FAILED,
        COMPENSATION_REQUESTED,
        STEP_COMPENSATED,
        COMPENSATION_FAILED,
        SAGA_COMPLETED,
        SAGA_FAILED,
    ];
}

const DATA_PREFIX: &str = "data.";
const COMP_PREFIX: &str = "comp.";

/// Messages exchanged between the coordinator and saga participants
#[derive(Clone, Debug, PartialEq)]
pub enum SagaEvent {
    /// Orchestrator asks a participant to execute its step
    StepRequested { context: SagaContext, input: Payload },
    StepCompleted {
        context: SagaContext,
        output: Payload,
        compensation_data: Payload,
    },
    StepFailed { context: SagaContext, reason: Box<str> },
    /// Orchestrator asks a participant to undo its completed step
    CompensationRequested {
        context: SagaContext,
        compensation_data: Payload,
    },
    StepCompensated { context: SagaContext },
    CompensationFailed { context: SagaContext, reason: Box<str> },
    SagaCompleted { context: SagaContext },
    SagaFailed { context: SagaContext, reason: Box<str> },
}

impl SagaEvent {
    pub fn context(&self) -> &SagaContext {
        match self {
            Self::StepRequested { context, .. } => context,
            Self::StepCompleted { context, .. } => context,
            Self::StepFailed { context, .. } => context,
            Self::CompensationRequested { context, .. } => context,
            Self::StepCompensated { context } => context,
            Self::CompensationFailed { context, .. } => context,
            Self::SagaCompleted { context } => context,
            Self::SagaFailed { context, .. } => context,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepRequested { .. } => saga_types::STEP_REQUESTED,
            Self::StepCompleted { .. } => saga_types::STEP_COMPLETED,
            Self::StepFailed { .. } => saga_types::STEP_FAILED,
            Self::CompensationRequested { .. } => saga_types::COMPENSATION_REQUESTED,
            Self::StepCompensated { .. } => saga_types::STEP_COMPENSATED,
            Self::CompensationFailed { .. } => saga_types::COMPENSATION_FAILED,
            Self::SagaCompleted { .. } => saga_types::SAGA_COMPLETED,
            Self::SagaFailed { .. } => saga_types::SAGA_FAILED,
        }
    }

    /// Whether `event_type` belongs to the saga protocol
    pub fn is_saga_event(event_type: &str) -> bool {
        saga_types::ALL.contains(&event_type)
    }

    /// Encode as a log event.
    ///
    /// The id is derived from the saga id, message kind and step, so
    /// re-emitting the same message yields the same event id. All messages of
    /// one saga share the saga id as partition key.
    pub fn to_event(&self, causation_id: Option<EventId>) -> Event {
        let context = self.context();
        let mut payload = Payload::new()
            .with("saga_id", context.saga_id.to_string())
            .with("saga_type", &*context.saga_type)
            .with("step", &*context.step_name)
            .with("step_index", context.step_index as i64)
            .with("attempt", i64::from(context.attempt))
            .with("saga_started_at", context.saga_started_at_millis as i64);

        match self {
            Self::StepRequested { input, .. } => input.flatten_into(DATA_PREFIX, &mut payload),
            Self::StepCompleted {
                output,
                compensation_data,
                ..
            } => {
                output.flatten_into(DATA_PREFIX, &mut payload);
                compensation_data.flatten_into(COMP_PREFIX, &mut payload);
            }
            Self::CompensationRequested {
                compensation_data, ..
            } => compensation_data.flatten_into(COMP_PREFIX, &mut payload),
            Self::StepFailed { reason, .. }
            | Self::CompensationFailed { reason, .. }
            | Self::SagaFailed { reason, .. } => payload.insert("reason", &**reason),
            Self::StepCompensated { .. } | Self::SagaCompleted { .. } => {}
        }

        let name = format!("{}:{}", self.event_type(), context.step_index);
        let mut builder = Event::builder(self.event_type(), &context.saga_id.to_string())
            .id(EventId::derive(context.saga_id.0, &name))
            .payload(payload)
            .correlation_id(&*context.correlation_id);
        if let Some(cause) = causation_id {
            builder = builder.causation_id(cause);
        }
        builder.build()
    }

    /// Decode a saga protocol message from a log event
    pub fn from_event(event: &Event) -> Result<Self, SchemaError> {
        let payload = &event.payload;
        let text = |key: &str| {
            payload.text(key).ok_or_else(|| SchemaError::MissingField {
                event_type: event.event_type.clone(),
                field: key.to_string(),
            })
        };
        let int = |key: &str| {
            payload.int(key).ok_or_else(|| SchemaError::MissingField {
                event_type: event.event_type.clone(),
                field: key.to_string(),
            })
        };

        let saga_id = text("saga_id")?.parse().map_err(|_| SchemaError::InvalidField {
            event_type: event.event_type.clone(),
            field: "saga_id".to_string(),
        })?;
        let context = SagaContext {
            saga_id,
            saga_type: text("saga_type")?.into(),
            step_name: text("step")?.into(),
            step_index: int("step_index")?.max(0) as usize,
            correlation_id: event.correlation_id.as_str().into(),
            attempt: int("attempt").unwrap_or(0).max(0) as u32,
            saga_started_at_millis: int("saga_started_at").unwrap_or(0).max(0) as u64,
        };
        let reason = || text("reason").map(Into::into);

        let message = match event.event_type.as_str() {
            saga_types::STEP_REQUESTED => Self::StepRequested {
                context,
                input: payload.extract(DATA_PREFIX),
            },
            saga_types::STEP_COMPLETED => Self::StepCompleted {
                context,
                output: payload.extract(DATA_PREFIX),
                compensation_data: payload.extract(COMP_PREFIX),
            },
            saga_types::STEP_FAILED => Self::StepFailed {
                reason: reason()?,
                context,
            },
            saga_types::COMPENSATION_REQUESTED => Self::CompensationRequested {
                context,
                compensation_data: payload.extract(COMP_PREFIX),
            },
            saga_types::STEP_COMPENSATED => Self::StepCompensated { context },
            saga_types::COMPENSATION_FAILED => Self::CompensationFailed {
                reason: reason()?,
                context,
            },
            saga_types::SAGA_COMPLETED => Self::SagaCompleted { context },
            saga_types::SAGA_FAILED => Self::SagaFailed {
                reason: reason()?,
                context,
            },
            other => {
                return Err(SchemaError::UnknownSchema {
                    event_type: other.to_string(),
                    version: event.schema_version,
                })
            }
        };
        Ok(message)
    }
}

/// Events stored in a participant's local journal
#[derive(Clone, Debug, PartialEq)]
pub enum ParticipantEvent {
    StepTriggered {
        context: SagaContext,
        triggering_event: EventId,
        triggered_at_millis: u64,
    },
    StepExecutionStarted { attempt: u32, started_at_millis: u64 },
    StepExecutionCompleted {
        output: Payload,
        compensation_data: Payload,
        completed_at_millis: u64,
    },
    StepExecutionFailed { error: Box<str>, failed_at_millis: u64 },
    CompensationStarted { attempt: u32, started_at_millis: u64 },
    CompensationCompleted { completed_at_millis: u64 },
    CompensationFailed {
        error: Box<str>,
        is_ambiguous: bool,
        failed_at_millis: u64,
    },
    Quarantined { reason: Box<str>, quarantined_at_millis: u64 },
}
