//! Consumer dispatcher: one worker per assigned partition

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DispatcherConfig;
use crate::dead_letter::{DeadLetter, DeadLetterPayload, DeadLetterSink};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::idempotency::{Admission, AdmissionTicket, IdempotencyGuard, ResultToken};
use crate::log::{EventLogClient, LogError};
use crate::offsets::OffsetStore;
use crate::schema::{SchemaInterest, SchemaRegistry};
use crate::stats::{DispatcherStats, DispatcherStatsSnapshot};
use crate::{
    now_millis, ConsumerId, ErrorCategory, Event, HandlerError, PartitionId, Position, StoreError,
};

/// Delivers a consumer group's partitions to its handlers.
///
/// Every event passes the idempotency guard before its handler runs, and the
/// offset moves past it only once it is processed, a duplicate, skipped or
/// dead-lettered. Failed handlers are retried with backoff up to the
/// configured budget, then dead-lettered. Schema mismatches are
/// dead-lettered without retry.
pub struct ConsumerDispatcher {
    group: Box<str>,
    client: Arc<EventLogClient>,
    guard: Arc<IdempotencyGuard>,
    offsets: Arc<dyn OffsetStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    schemas: Option<Arc<SchemaRegistry>>,
    handlers: HandlerRegistry,
    config: DispatcherConfig,
    stats: Arc<DispatcherStats>,
}

impl ConsumerDispatcher {
    pub fn new(
        group: &str,
        client: Arc<EventLogClient>,
        guard: Arc<IdempotencyGuard>,
        offsets: Arc<dyn OffsetStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            group: group.into(),
            client,
            guard,
            offsets,
            dead_letters,
            schemas: None,
            handlers,
            config: DispatcherConfig::default(),
            stats: Arc::new(DispatcherStats::new()),
        }
    }

    /// Validate payloads against `registry` before dispatch
    pub fn with_schemas(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(registry);
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Start workers for `partitions`
    pub fn start(self, partitions: impl IntoIterator<Item = PartitionId>) -> DispatcherHandle {
        let handle = DispatcherHandle {
            dispatcher: Arc::new(self),
            workers: Mutex::new(HashMap::new()),
        };
        for partition in partitions {
            handle.assign(partition);
        }
        handle
    }

    fn check_schema(&self, interest: &SchemaInterest, event: &Event) -> Result<(), HandlerError> {
        interest.accepts(event)?;
        if let Some(registry) = &self.schemas {
            registry.validate(event)?;
        }
        Ok(())
    }
}

struct Worker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Running dispatcher. Dropping the handle stops every worker.
pub struct DispatcherHandle {
    dispatcher: Arc<ConsumerDispatcher>,
    workers: Mutex<HashMap<PartitionId, Worker>>,
}

impl DispatcherHandle {
    /// Start consuming `partition` from its committed offset
    pub fn assign(&self, partition: PartitionId) {
        let Ok(mut workers) = self.workers.lock() else {
            tracing::error!(group = %self.dispatcher.group, %partition, "Worker table poisoned");
            return;
        };
        if workers.get(&partition).is_some_and(|w| !w.task.is_finished()) {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let worker = PartitionWorker {
            dispatcher: self.dispatcher.clone(),
            partition,
            committed: None,
            stop: stop_rx,
        };
        tracing::info!(group = %self.dispatcher.group, %partition, "Partition assigned");
        let task = tokio::spawn(worker.run());
        workers.insert(partition, Worker { stop, task });
    }

    /// Stop consuming `partition`.
    ///
    /// A handler already running is allowed to finish; an event waiting
    /// for its next retry is abandoned without committing its offset.
    pub async fn revoke(&self, partition: PartitionId) {
        let worker = self.workers.lock().ok().and_then(|mut w| w.remove(&partition));
        if let Some(worker) = worker {
            stop_worker(&self.dispatcher.group, partition, worker).await;
        }
    }

    /// Stop every worker and wait for them to exit
    pub async fn shutdown(&self) {
        let workers: Vec<(PartitionId, Worker)> = self
            .workers
            .lock()
            .map(|mut w| w.drain().collect())
            .unwrap_or_default();
        for (_, worker) in &workers {
            let _ = worker.stop.send(true);
        }
        for (partition, worker) in workers {
            stop_worker(&self.dispatcher.group, partition, worker).await;
        }
        tracing::info!(group = %self.dispatcher.group, "Dispatcher stopped");
    }

    /// Partitions with a live worker
    pub fn assigned(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self
            .workers
            .lock()
            .map(|w| {
                w.iter()
                    .filter(|(_, worker)| !worker.task.is_finished())
                    .map(|(p, _)| *p)
                    .collect()
            })
            .unwrap_or_default();
        partitions.sort();
        partitions
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.dispatcher.stats.snapshot()
    }

    pub fn group(&self) -> &str {
        self.dispatcher.group()
    }
}

async fn stop_worker(group: &str, partition: PartitionId, worker: Worker) {
    let _ = worker.stop.send(true);
    if let Err(e) = worker.task.await {
        tracing::error!(%group, %partition, error = %e, "Partition worker panicked");
    }
    tracing::info!(%group, %partition, "Partition revoked");
}

enum Flow {
    Continue,
    Stop,
}

enum Settlement {
    Complete(Option<ResultToken>),
    Release,
}

struct PartitionWorker {
    dispatcher: Arc<ConsumerDispatcher>,
    partition: PartitionId,
    /// Offset this worker last saw committed
    committed: Option<Position>,
    stop: watch::Receiver<bool>,
}

impl PartitionWorker {
    async fn run(mut self) {
        let Some(start) = self.load_offset().await else {
            return;
        };
        let mut cursor = self.dispatcher.client.read_from(self.partition, start);
        let mut read_failures = 0;

        loop {
            if *self.stop.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                next = cursor.next() => next,
            };

            let flow = match next {
                Ok((position, event)) => {
                    read_failures = 0;
                    self.process(position, event).await
                }
                Err(LogError::Codec { position, reason, .. }) => {
                    let bytes = cursor.take_rejected().map(|r| r.bytes).unwrap_or_default();
                    DispatcherStats::incr(&self.dispatcher.stats.events_received);
                    DispatcherStats::incr(&self.dispatcher.stats.schema_rejections);
                    self.dead_letter(
                        position,
                        DeadLetterPayload::Raw(bytes),
                        ErrorCategory::SchemaIncompatible,
                        format!("undecodable record: {reason}"),
                        0,
                    )
                    .await
                }
                Err(e) => {
                    read_failures += 1;
                    let delay =
                        self.dispatcher.config.storage_retry.delay_for_attempt(read_failures);
                    tracing::warn!(
                        group = %self.dispatcher.group,
                        partition = %self.partition,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Log read failed"
                    );
                    if self.pause(delay).await {
                        Flow::Continue
                    } else {
                        Flow::Stop
                    }
                }
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        tracing::debug!(
            group = %self.dispatcher.group,
            partition = %self.partition,
            "Partition worker exiting"
        );
    }

    async fn load_offset(&mut self) -> Option<Position> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatcher.offsets.committed(&self.dispatcher.group, self.partition) {
                Ok(committed) => {
                    self.committed = committed;
                    return Some(committed.unwrap_or(Position::START));
                }
                Err(e) => {
                    let delay = self.dispatcher.config.storage_retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        group = %self.dispatcher.group,
                        partition = %self.partition,
                        error = %e,
                        "Offset store unavailable"
                    );
                    if !self.pause(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn process(&mut self, position: Position, event: Event) -> Flow {
        let dispatcher = self.dispatcher.clone();
        let stats = &dispatcher.stats;
        DispatcherStats::incr(&stats.events_received);

        let Some((handler, interest)) = dispatcher.handlers.route(&event.event_type) else {
            tracing::debug!(
                group = %dispatcher.group,
                event_type = %event.event_type,
                %position,
                "No handler, skipping"
            );
            DispatcherStats::incr(&stats.events_skipped);
            return self.commit(position).await;
        };

        if let Err(e) = dispatcher.check_schema(interest, &event) {
            DispatcherStats::incr(&stats.schema_rejections);
            return self
                .dead_letter(
                    position,
                    DeadLetterPayload::Event(event),
                    ErrorCategory::SchemaIncompatible,
                    e.to_string(),
                    0,
                )
                .await;
        }

        let consumer = ConsumerId::new(&dispatcher.group, handler.name());
        let timeout = dispatcher.config.handler_timeout();
        let retry = &dispatcher.config.retry;
        let mut attempt = 0;
        loop {
            let ticket = match self.admit(&event, &consumer).await {
                Some(Admission::Proceed(ticket)) => ticket,
                Some(Admission::Duplicate { .. }) => {
                    tracing::debug!(
                        consumer = %consumer,
                        event_id = %event.id,
                        "Duplicate delivery"
                    );
                    DispatcherStats::incr(&stats.duplicate_events);
                    return self.commit(position).await;
                }
                Some(Admission::InFlight { stale_at_millis, .. }) => {
                    // A previous owner died or failed to release; wait out its claim
                    let wait_millis = stale_at_millis.saturating_sub(now_millis()).max(1);
                    let wait = Duration::from_millis(wait_millis);
                    tracing::warn!(
                        consumer = %consumer,
                        event_id = %event.id,
                        %position,
                        wait_ms = wait.as_millis() as u64,
                        "Event claimed by an earlier delivery, waiting for the claim to expire"
                    );
                    if !self.pause(wait).await {
                        return Flow::Stop;
                    }
                    continue;
                }
                None => return Flow::Stop,
            };

            attempt += 1;
            let ctx = HandlerContext {
                consumer_id: consumer.clone(),
                partition: self.partition,
                position,
                attempt,
                publisher: dispatcher.client.clone(),
            };
            let result = tokio::time::timeout(timeout, handler.handle(&event, &ctx))
                .await
                .unwrap_or(Err(HandlerError::Timeout(timeout)));

            let error = match result {
                Ok(outcome) => {
                    if !self.settle(&ticket, Settlement::Complete(outcome.result_token)).await {
                        return Flow::Stop;
                    }
                    DispatcherStats::incr(&stats.events_processed);
                    return self.commit(position).await;
                }
                Err(error) => error,
            };

            if !self.settle(&ticket, Settlement::Release).await {
                return Flow::Stop;
            }

            if !error.is_retriable() || !retry.has_attempts_remaining(attempt) {
                if error.category() == ErrorCategory::SchemaIncompatible {
                    DispatcherStats::incr(&stats.schema_rejections);
                }
                return self
                    .dead_letter(
                        position,
                        DeadLetterPayload::Event(event),
                        error.category(),
                        error.to_string(),
                        attempt,
                    )
                    .await;
            }

            DispatcherStats::incr(&stats.retries);
            let delay = retry.delay_for_attempt(attempt);
            tracing::warn!(
                consumer = %consumer,
                event_id = %event.id,
                %position,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Handler failed, retrying"
            );
            if !self.pause(delay).await {
                tracing::info!(
                    consumer = %consumer,
                    event_id = %event.id,
                    %position,
                    "Revoked during backoff, offset not committed"
                );
                return Flow::Stop;
            }
        }
    }

    /// Admission, retried for as long as the idempotency store is down
    async fn admit(&mut self, event: &Event, consumer: &ConsumerId) -> Option<Admission> {
        let mut failures = 0;
        loop {
            match self.dispatcher.guard.admit(event, consumer).await {
                Ok(admission) => return Some(admission),
                Err(e) => {
                    failures += 1;
                    let delay = self.dispatcher.config.storage_retry.delay_for_attempt(failures);
                    tracing::error!(
                        consumer = %consumer,
                        event_id = %event.id,
                        error = %e,
                        "Idempotency store unavailable"
                    );
                    if !self.pause(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Record the handler outcome in the idempotency store.
    ///
    /// Storage failures hold the event until the write lands or the worker
    /// stops; the offset never moves past an unsettled claim. False if the
    /// worker stopped first.
    async fn settle(&mut self, ticket: &AdmissionTicket, settlement: Settlement) -> bool {
        let mut failures = 0;
        loop {
            let result = match &settlement {
                Settlement::Complete(token) => ticket.complete(token.clone()).await,
                Settlement::Release => ticket.release().await,
            };
            match result {
                Ok(()) => return true,
                Err(StoreError::Conflict(reason)) => {
                    // The claim was taken over or pruned; nothing left to settle
                    tracing::warn!(
                        key = %ticket.key(),
                        %reason,
                        "Claim changed hands before settling"
                    );
                    return true;
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.dispatcher.config.storage_retry.delay_for_attempt(failures);
                    tracing::error!(
                        key = %ticket.key(),
                        error = %e,
                        "Failed to settle idempotency claim"
                    );
                    if !self.pause(delay).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn commit(&mut self, position: Position) -> Flow {
        let next = position.next();
        let retry = self.dispatcher.config.storage_retry.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .dispatcher
                .offsets
                .compare_and_swap(&self.dispatcher.group, self.partition, self.committed, next)
            {
                Ok(true) => {
                    self.committed = Some(next);
                    return Flow::Continue;
                }
                Ok(false) => {
                    tracing::warn!(
                        group = %self.dispatcher.group,
                        partition = %self.partition,
                        expected = ?self.committed,
                        "Offset moved underneath worker, partition is owned elsewhere"
                    );
                    return Flow::Stop;
                }
                Err(e) if retry.has_attempts_remaining(attempt) => {
                    tracing::warn!(
                        group = %self.dispatcher.group,
                        partition = %self.partition,
                        attempt,
                        error = %e,
                        "Offset commit failed, retrying"
                    );
                    if !self.pause(retry.delay_for_attempt(attempt)).await {
                        return Flow::Stop;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        group = %self.dispatcher.group,
                        partition = %self.partition,
                        error = %e,
                        "Offset commit failed, stopping worker"
                    );
                    return Flow::Stop;
                }
            }
        }
    }

    async fn dead_letter(
        &mut self,
        position: Position,
        payload: DeadLetterPayload,
        category: ErrorCategory,
        error: String,
        attempts: u32,
    ) -> Flow {
        let letter = DeadLetter {
            consumer_group: self.dispatcher.group.clone(),
            partition: self.partition,
            position,
            payload,
            category,
            error: error.into_boxed_str(),
            attempts,
            dead_lettered_at_millis: now_millis(),
        };

        let retry = self.dispatcher.config.storage_retry.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatcher.dead_letters.route(letter.clone()) {
                Ok(()) => break,
                Err(e) if retry.has_attempts_remaining(attempt) => {
                    tracing::warn!(
                        group = %self.dispatcher.group,
                        partition = %self.partition,
                        attempt,
                        error = %e,
                        "Dead-letter write failed, retrying"
                    );
                    if !self.pause(retry.delay_for_attempt(attempt)).await {
                        return Flow::Stop;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        group = %self.dispatcher.group,
                        partition = %self.partition,
                        %position,
                        error = %e,
                        "Dead-letter write failed, stopping worker"
                    );
                    return Flow::Stop;
                }
            }
        }

        DispatcherStats::incr(&self.dispatcher.stats.dead_lettered);
        tracing::error!(
            group = %self.dispatcher.group,
            partition = %self.partition,
            %position,
            category = %category,
            attempts,
            error = %letter.error,
            "Event dead-lettered"
        );
        self.commit(position).await
    }

    /// Sleep for `delay`; false if the worker was stopped meanwhile
    async fn pause(&mut self, delay: Duration) -> bool {
        if *self.stop.borrow() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.stop.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
