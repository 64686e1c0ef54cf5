//! Shared clients and stores, and the background tasks built on them

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::dead_letter::{DeadLetterSink, InMemoryDeadLetterQueue};
use crate::dedupe::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::dispatcher::{ConsumerDispatcher, DispatcherHandle};
use crate::handler::HandlerRegistry;
use crate::idempotency::IdempotencyGuard;
use crate::log::{EventLog, EventLogClient};
use crate::offsets::{InMemoryOffsetStore, OffsetStore};
use crate::outbox::{OutboxRelay, OutboxStore, OutboxWriter};
use crate::participant::StepParticipant;
use crate::saga::SagaDefinition;
use crate::schema::{register_protocol_schemas, SchemaError, SchemaRegistry};
use crate::{PartitionId, SagaParticipant};

/// Everything components share, passed explicitly at construction
#[derive(Clone)]
pub struct CoreContext {
    pub config: CoreConfig,
    pub schemas: Arc<SchemaRegistry>,
    pub client: Arc<EventLogClient>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub offsets: Arc<dyn OffsetStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl CoreContext {
    /// Context over `log`; saga protocol schemas are added to `schemas`
    pub fn new(
        config: CoreConfig,
        log: Arc<dyn EventLog>,
        schemas: Arc<SchemaRegistry>,
        idempotency: Arc<dyn IdempotencyStore>,
        offsets: Arc<dyn OffsetStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Result<Self, SchemaError> {
        register_protocol_schemas(&schemas)?;
        let client = EventLogClient::new(log)
            .with_registry(schemas.clone())
            .with_retry(config.log.publish_retry.clone())
            .with_read_batch(config.log.read_batch);

        Ok(Self {
            config,
            schemas,
            client: Arc::new(client),
            idempotency,
            offsets,
            dead_letters,
        })
    }

    /// Context with in-memory idempotency, offset and dead-letter stores
    pub fn in_memory(
        config: CoreConfig,
        log: Arc<dyn EventLog>,
        schemas: Arc<SchemaRegistry>,
    ) -> Result<Self, SchemaError> {
        Self::new(
            config,
            log,
            schemas,
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(InMemoryOffsetStore::new()),
            Arc::new(InMemoryDeadLetterQueue::new()),
        )
    }

    pub fn guard(&self) -> Arc<IdempotencyGuard> {
        Arc::new(IdempotencyGuard::new(
            self.idempotency.clone(),
            self.config.idempotency.clone(),
        ))
    }

    /// Dispatcher for consumer group `group`
    pub fn dispatcher(&self, group: &str, handlers: HandlerRegistry) -> ConsumerDispatcher {
        ConsumerDispatcher::new(
            group,
            self.client.clone(),
            self.guard(),
            self.offsets.clone(),
            self.dead_letters.clone(),
            handlers,
        )
        .with_schemas(self.schemas.clone())
        .with_config(self.config.dispatcher.clone())
    }

    pub fn outbox_writer(&self) -> OutboxWriter {
        OutboxWriter::new().with_registry(self.schemas.clone())
    }

    pub fn relay(&self, store: Arc<dyn OutboxStore>) -> OutboxRelay {
        OutboxRelay::new(store, self.client.clone(), self.config.relay.clone())
    }

    /// Wrap `participant` with the configured compensation budget
    pub fn participant<P: SagaParticipant>(
        &self,
        participant: P,
        definitions: impl IntoIterator<Item = SagaDefinition>,
    ) -> StepParticipant<P> {
        StepParticipant::new(participant, definitions)
            .with_compensation_retry(self.config.saga.compensation_retry.clone())
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        (0..self.client.partition_count()).map(PartitionId).collect()
    }
}

/// Owns the background tasks of one service and drains them on shutdown
pub struct CoreRuntime {
    context: CoreContext,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    dispatchers: Vec<Arc<DispatcherHandle>>,
}

impl CoreRuntime {
    pub fn new(context: CoreContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            context,
            shutdown,
            tasks: Vec::new(),
            dispatchers: Vec::new(),
        }
    }

    pub fn context(&self) -> &CoreContext {
        &self.context
    }

    /// Relay `store`'s outbox every poll interval
    pub fn spawn_relay(&mut self, store: Arc<dyn OutboxStore>) {
        let relay = Arc::new(self.context.relay(store));
        self.tasks.push(relay.spawn(self.shutdown.subscribe()));
    }

    /// Prune expired idempotency records every prune interval
    pub fn spawn_pruner(&mut self) {
        let guard = self.context.guard();
        let interval = self.context.config.idempotency.prune_interval();
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                if let Err(e) = guard.prune_expired() {
                    tracing::warn!(error = %e, "Idempotency pruning failed");
                }
            }
        }));
    }

    /// Consume every partition of the log as `group`
    pub fn spawn_consumer(
        &mut self,
        group: &str,
        handlers: HandlerRegistry,
    ) -> Arc<DispatcherHandle> {
        let handle = Arc::new(
            self.context
                .dispatcher(group, handlers)
                .start(self.context.partitions()),
        );
        self.dispatchers.push(handle.clone());
        handle
    }

    /// Stop dispatchers, then background tasks, and wait for all of them
    pub async fn shutdown(self) {
        for dispatcher in &self.dispatchers {
            dispatcher.shutdown().await;
        }
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
        tracing::info!("Runtime stopped");
    }
}
