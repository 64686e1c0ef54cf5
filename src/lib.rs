//! Event-driven consistency core for clinic services
//!
//! Services publish domain events through a transactional outbox, consume
//! them through an idempotent, partition-ordered dispatcher, and run
//! multi-service workflows as sagas with compensations.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Shared clients and stores
//! let ctx = CoreContext::in_memory(CoreConfig::from_env()?, log, schemas)?;
//! let mut runtime = CoreRuntime::new(ctx.clone());
//!
//! // 2. Publish: business write and event commit together
//! let mut tx = service_store.begin();
//! tx.put("patient/p-1", patient);
//! ctx.outbox_writer().stage(&mut tx, patient_created)?;
//! tx.commit()?;
//! runtime.spawn_relay(service_store);
//!
//! // 3. Consume: one handler per event type per consumer group
//! let handlers = HandlerRegistry::new().with(Arc::new(WelcomeMailer::default()))?;
//! runtime.spawn_consumer("notifications", handlers);
//!
//! // 4. Sagas: a coordinator plus one participant per step
//! let coordinator = SagaCoordinator::new([booking.clone()]);
//! let slots = ctx.participant(SlotService::default(), [booking]);
//! ```

// === Core Types ===
mod context;
mod errors;
mod events;
mod schema;

// === Event Log ===
mod codec;
mod log;

// === Publishing ===
mod outbox;

// === Consuming ===
mod dead_letter;
mod dedupe;
mod dispatcher;
mod handler;
mod idempotency;
mod offsets;

// === Sagas ===
mod coordinator;
mod journal;
mod participant;
mod remote;
mod saga;
mod state;
mod traits;

// === Observability ===
mod observer;
mod stats;

// === Wiring ===
mod config;
mod runtime;

#[cfg(feature = "lmdb")]
mod lmdb;

// === Re-exports ===

// Types
pub use context::{now_millis, ConsumerId, EventId, PartitionId, Position, SagaContext, SagaId};
pub use events::{saga_types, Event, EventBuilder, FieldValue, ParticipantEvent, Payload, SagaEvent};
pub use idempotency::{IdempotencyKey, ResultToken};
pub use schema::{
    register_protocol_schemas, EventSchema, FieldKind, FieldSpec, SchemaError, SchemaInterest,
    SchemaRegistry,
};

// Errors
pub use errors::{CompensationError, ErrorCategory, HandlerError, StepError, StepOutput, StoreError};

// Event log
pub use codec::{decode_event, encode_event, CodecError};
pub use log::{
    partition_for, EventCursor, EventLog, EventLogClient, InMemoryEventLog, LogError, LogRecord,
};

// Outbox
pub use outbox::{
    InMemoryServiceStore, LocalTransaction, OutboxEntry, OutboxRelay, OutboxStatus, OutboxStore,
    OutboxWriter, RelayReport, StagedWrite, TransactionCommitter,
};

// Idempotency
pub use dedupe::{
    IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore, InsertOutcome, RecordStatus,
};
pub use idempotency::{Admission, AdmissionTicket, IdempotencyGuard};

// Dispatch
pub use dead_letter::{DeadLetter, DeadLetterPayload, DeadLetterSink, InMemoryDeadLetterQueue};
pub use dispatcher::{ConsumerDispatcher, DispatcherHandle};
pub use handler::{
    DispatchError, EventHandler, EventPublisher, HandlerContext, HandlerOutcome, HandlerRegistry,
};
pub use offsets::{InMemoryOffsetStore, OffsetStore};

// Sagas
pub use coordinator::SagaCoordinator;
pub use journal::{rebuild_state, InMemoryJournal, JournalEntry, ParticipantJournal};
pub use participant::StepParticipant;
pub use remote::{
    call_with_timeout, RemoteError, RemoteInvoker, RemoteRequest, RemoteResponse, RemoteStep,
};
pub use saga::{
    FailureRecord, InMemorySagaStore, Next, SagaDefinition, SagaError, SagaInstance, SagaState,
    SagaStore, SagaStyle, StepMarker,
};
pub use traits::{DependencySpec, RetryPolicy, SagaParticipant};

// State (typestate)
pub use state::{
    Compensated, Compensating, Completed, Executing, Failed, Idle, Quarantined,
    SagaParticipantState, SagaStateEntry, Triggered,
};

// Observability
pub use observer::{NoOpObserver, SagaObserver, TracingObserver};
pub use stats::{DispatcherStats, DispatcherStatsSnapshot};

// Configuration and wiring
pub use config::{
    ConfigError, CoreConfig, DispatcherConfig, IdempotencyConfig, LogConfig, RelayConfig,
    SagaConfig,
};
pub use runtime::{CoreContext, CoreRuntime};

#[cfg(feature = "lmdb")]
pub use lmdb::{open_env, LmdbIdempotencyStore, LmdbOffsetStore};
