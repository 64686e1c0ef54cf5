//! Transactional outbox: events staged with local state, relayed to the log

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::log::EventLogClient;
use crate::schema::{SchemaError, SchemaRegistry};
use crate::{now_millis, Event, EventId, Payload, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboxEntry {
    pub event: Event,
    pub status: OutboxStatus,
    pub created_at_millis: u64,
    /// Store-assigned, increasing in staging order
    pub sequence: u64,
}

/// A business write buffered in a [`LocalTransaction`]
#[derive(Clone, Debug, PartialEq)]
pub enum StagedWrite {
    Put { key: Box<str>, value: Payload },
    Delete { key: Box<str> },
}

/// Applies a transaction's writes and outbox entries all-or-nothing
pub trait TransactionCommitter: Send + Sync + 'static {
    fn apply(&self, writes: Vec<StagedWrite>, outbox: Vec<Event>) -> Result<(), StoreError>;
}

/// Relay-side view of the outbox
pub trait OutboxStore: Send + Sync + 'static {
    /// Pending entries in sequence order
    fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    fn mark_sent(&self, event_id: EventId) -> Result<(), StoreError>;

    /// Delete entries already marked sent
    fn purge_sent(&self) -> Result<usize, StoreError>;
}

/// Unit of work over a service's local store.
///
/// Nothing is visible until [`commit`](Self::commit). Dropping the
/// transaction without committing rolls it back.
pub struct LocalTransaction {
    committer: Arc<dyn TransactionCommitter>,
    writes: Vec<StagedWrite>,
    outbox: Vec<Event>,
}

impl LocalTransaction {
    pub fn new(committer: Arc<dyn TransactionCommitter>) -> Self {
        Self {
            committer,
            writes: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn put(&mut self, key: &str, value: Payload) {
        self.writes.push(StagedWrite::Put {
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, key: &str) {
        self.writes.push(StagedWrite::Delete { key: key.into() });
    }

    /// Number of events staged so far
    pub fn staged_events(&self) -> usize {
        self.outbox.len()
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        let writes = std::mem::take(&mut self.writes);
        let outbox = std::mem::take(&mut self.outbox);
        let staged = outbox.len();
        self.committer.apply(writes, outbox)?;
        tracing::debug!(staged, "Local transaction committed");
        Ok(())
    }

    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if !self.writes.is_empty() || !self.outbox.is_empty() {
            tracing::debug!(
                writes = self.writes.len(),
                staged = self.outbox.len(),
                "Local transaction rolled back"
            );
        }
        self.writes.clear();
        self.outbox.clear();
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Stages outgoing events inside local transactions
#[derive(Clone, Default)]
pub struct OutboxWriter {
    registry: Option<Arc<SchemaRegistry>>,
}

impl OutboxWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject events that do not match their registered schema
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Stage `event` for publication when `tx` commits
    pub fn stage(&self, tx: &mut LocalTransaction, event: Event) -> Result<(), SchemaError> {
        if let Some(registry) = &self.registry {
            registry.validate(&event)?;
        }
        tracing::trace!(event_id = %event.id, event_type = %event.event_type, "Event staged");
        tx.outbox.push(event);
        Ok(())
    }
}

#[derive(Default)]
struct ServiceState {
    records: HashMap<Box<str>, Payload>,
    outbox: BTreeMap<u64, OutboxEntry>,
    next_sequence: u64,
}

/// In-memory service store: business records plus the outbox, committed together
pub struct InMemoryServiceStore {
    state: RwLock<ServiceState>,
    fail_commits: AtomicU32,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ServiceState::default()),
            fail_commits: AtomicU32::new(0),
        }
    }

    pub fn begin(self: &Arc<Self>) -> LocalTransaction {
        LocalTransaction::new(self.clone())
    }

    pub fn get(&self, key: &str) -> Option<Payload> {
        self.state.read().ok()?.records.get(key).cloned()
    }

    /// Entries currently in the outbox, in sequence order
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.state
            .read()
            .map(|s| s.outbox.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail the next commit before anything is applied (crash at commit)
    pub fn fail_next_commit(&self) {
        self.fail_commits.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryServiceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCommitter for InMemoryServiceStore {
    fn apply(&self, writes: Vec<StagedWrite>, outbox: Vec<Event>) -> Result<(), StoreError> {
        if self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Storage("commit failed".into()));
        }

        let mut state = self.state.write().map_err(StoreError::poisoned)?;
        for write in writes {
            match write {
                StagedWrite::Put { key, value } => {
                    state.records.insert(key, value);
                }
                StagedWrite::Delete { key } => {
                    state.records.remove(&key);
                }
            }
        }
        let now = now_millis();
        for event in outbox {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.outbox.insert(
                sequence,
                OutboxEntry {
                    event,
                    status: OutboxStatus::Pending,
                    created_at_millis: now,
                    sequence,
                },
            );
        }
        Ok(())
    }
}

impl OutboxStore for InMemoryServiceStore {
    fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let state = self.state.read().map_err(StoreError::poisoned)?;
        Ok(state
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_sent(&self, event_id: EventId) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(StoreError::poisoned)?;
        let entry = state
            .outbox
            .values_mut()
            .find(|e| e.event.id == event_id)
            .ok_or_else(|| StoreError::Conflict(format!("no outbox entry for {event_id}").into()))?;
        entry.status = OutboxStatus::Sent;
        Ok(())
    }

    fn purge_sent(&self) -> Result<usize, StoreError> {
        let mut state = self.state.write().map_err(StoreError::poisoned)?;
        let before = state.outbox.len();
        state.outbox.retain(|_, e| e.status == OutboxStatus::Pending);
        Ok(before - state.outbox.len())
    }
}

/// Outcome of one relay round
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub appended: usize,
    /// Failed appends plus entries held back behind a failure on the same key
    pub failed: usize,
    pub purged: usize,
}

/// Background process moving PENDING outbox entries to the event log
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    client: Arc<EventLogClient>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        client: Arc<EventLogClient>,
        config: RelayConfig,
    ) -> Self {
        Self { store, client, config }
    }

    /// Relay one batch of pending entries.
    ///
    /// A failed append leaves the entry PENDING and holds back later entries
    /// with the same partition key until the next round.
    pub async fn relay_once(&self) -> Result<RelayReport, StoreError> {
        let mut report = RelayReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in self.store.pending(self.config.batch_size)? {
            let event = &entry.event;
            if blocked.contains(&event.partition_key) {
                report.failed += 1;
                continue;
            }
            match self.client.append(event).await {
                Ok((partition, position)) => {
                    tracing::debug!(
                        event_id = %event.id,
                        %partition,
                        %position,
                        "Outbox entry relayed"
                    );
                    if let Err(e) = self.store.mark_sent(event.id) {
                        // Stays PENDING and is appended again next round
                        tracing::warn!(
                            event_id = %event.id,
                            error = %e,
                            "Could not mark outbox entry sent"
                        );
                    }
                    report.appended += 1;
                }
                Err(e) => {
                    if e.is_retriable() {
                        tracing::warn!(
                            event_id = %event.id,
                            sequence = entry.sequence,
                            error = %e,
                            "Relay append failed, will retry"
                        );
                    } else {
                        tracing::error!(
                            event_id = %event.id,
                            sequence = entry.sequence,
                            error = %e,
                            "Relay append rejected"
                        );
                    }
                    blocked.insert(event.partition_key.clone());
                    report.failed += 1;
                }
            }
        }

        report.purged = self.store.purge_sent()?;
        Ok(report)
    }

    /// Run [`relay_once`](Self::relay_once) every poll interval until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_ms = self.config.poll_interval_millis, "Outbox relay started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.relay_once().await {
                    Ok(report) if report.appended > 0 || report.failed > 0 => {
                        tracing::debug!(?report, "Relay round finished");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Outbox store unavailable"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    _ = shutdown.changed() => {}
                }
            }
            tracing::info!("Outbox relay stopped");
        })
    }
}
