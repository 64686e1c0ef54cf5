//! Event log client over a durable, partitioned, append-only log

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::codec::{decode_event, encode_event};
use crate::handler::EventPublisher;
use crate::schema::{SchemaError, SchemaRegistry};
use crate::{Event, PartitionId, Position, RetryPolicy};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LogError {
    #[error("log unavailable: {0}")]
    Unavailable(Box<str>),
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),
    #[error("undecodable record at {partition}/{position}: {reason}")]
    Codec {
        partition: PartitionId,
        position: Position,
        reason: Box<str>,
    },
    #[error("event rejected: {0}")]
    Schema(#[from] SchemaError),
}

impl LogError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One stored record
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub position: Position,
    pub bytes: Vec<u8>,
}

/// Durable partitioned log.
///
/// `append` must persist the record before returning `Ok`. `read` suspends
/// until at least one record at or after `from` exists.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    fn partition_count(&self) -> u32;

    async fn append(&self, key: &str, bytes: Vec<u8>) -> Result<(PartitionId, Position), LogError>;

    async fn read(
        &self,
        partition: PartitionId,
        from: Position,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogError>;
}

/// Stable partition assignment for a key (FNV-1a)
pub fn partition_for(key: &str, partitions: u32) -> PartitionId {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    PartitionId((hash % u64::from(partitions.max(1))) as u32)
}

/// In-memory log for tests and single-process deployments
pub struct InMemoryEventLog {
    partitions: Vec<RwLock<Vec<Vec<u8>>>>,
    appended: tokio::sync::Notify,
    fail_appends: AtomicU32,
    lose_acks: AtomicU32,
}

impl InMemoryEventLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| RwLock::new(Vec::new())).collect(),
            appended: tokio::sync::Notify::new(),
            fail_appends: AtomicU32::new(0),
            lose_acks: AtomicU32::new(0),
        }
    }

    /// Reject the next `n` appends without persisting them
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Persist the next `n` appends but report them as failed
    pub fn lose_next_acks(&self, n: u32) {
        self.lose_acks.store(n, Ordering::SeqCst);
    }

    /// Number of records in a partition
    pub fn len(&self, partition: PartitionId) -> usize {
        self.partitions
            .get(partition.0 as usize)
            .and_then(|p| p.read().ok().map(|records| records.len()))
            .unwrap_or(0)
    }

    /// Total number of records across partitions
    pub fn total_len(&self) -> usize {
        (0..self.partitions.len() as u32).map(|p| self.len(PartitionId(p))).sum()
    }

    /// Overwrite a stored record (simulates on-disk corruption)
    pub fn corrupt(&self, partition: PartitionId, position: Position, bytes: Vec<u8>) {
        let slots = self.partitions.get(partition.0 as usize).map(|p| p.write());
        if let Some(Ok(mut records)) = slots {
            if let Some(slot) = records.get_mut(position.0 as usize) {
                *slot = bytes;
            }
        }
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn try_read(
        &self,
        partition: PartitionId,
        from: Position,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        let records = self
            .partitions
            .get(partition.0 as usize)
            .ok_or(LogError::UnknownPartition(partition))?
            .read()
            .map_err(|_| LogError::Unavailable("partition lock poisoned".into()))?;
        Ok(records
            .iter()
            .enumerate()
            .skip(from.0 as usize)
            .take(max.max(1))
            .map(|(i, bytes)| LogRecord {
                position: Position(i as u64),
                bytes: bytes.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn append(&self, key: &str, bytes: Vec<u8>) -> Result<(PartitionId, Position), LogError> {
        if Self::take_fault(&self.fail_appends) {
            return Err(LogError::Unavailable("broker connection lost".into()));
        }

        let partition = partition_for(key, self.partition_count());
        let position = {
            let mut records = self.partitions[partition.0 as usize]
                .write()
                .map_err(|_| LogError::Unavailable("partition lock poisoned".into()))?;
            records.push(bytes);
            Position(records.len() as u64 - 1)
        };
        self.appended.notify_waiters();

        if Self::take_fault(&self.lose_acks) {
            return Err(LogError::Unavailable("acknowledgement lost".into()));
        }
        Ok((partition, position))
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Position,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.try_read(partition, from, max)?;
            if !records.is_empty() {
                return Ok(records);
            }
            notified.await;
        }
    }
}

/// Typed client over an [`EventLog`]
pub struct EventLogClient {
    log: Arc<dyn EventLog>,
    registry: Option<Arc<SchemaRegistry>>,
    retry: RetryPolicy,
    read_batch: usize,
}

impl EventLogClient {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            registry: None,
            retry: RetryPolicy::default(),
            read_batch: 64,
        }
    }

    /// Validate every appended event against `registry`
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Backoff used by [`append_with_retry`](Self::append_with_retry)
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_read_batch(mut self, read_batch: usize) -> Self {
        self.read_batch = read_batch.max(1);
        self
    }

    pub fn partition_count(&self) -> u32 {
        self.log.partition_count()
    }

    /// Partition that events with `partition_key` land on
    pub fn partition_of(&self, partition_key: &str) -> PartitionId {
        partition_for(partition_key, self.log.partition_count())
    }

    /// Append once, keyed by the event's partition key
    pub async fn append(&self, event: &Event) -> Result<(PartitionId, Position), LogError> {
        if let Some(registry) = &self.registry {
            registry.validate(event)?;
        }
        let bytes = encode_event(event).map_err(|e| LogError::Codec {
            partition: self.partition_of(&event.partition_key),
            position: Position::START,
            reason: e.0,
        })?;
        self.log.append(&event.partition_key, bytes).await
    }

    /// Append with bounded exponential backoff on `Unavailable`
    pub async fn append_with_retry(
        &self,
        event: &Event,
    ) -> Result<(PartitionId, Position), LogError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.append(event).await {
                Ok(placed) => return Ok(placed),
                Err(e) if e.is_retriable() && self.retry.has_attempts_remaining(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        event_id = %event.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Append failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lazy, infinite sequence of events starting at `position`
    pub fn read_from(&self, partition: PartitionId, position: Position) -> EventCursor {
        EventCursor {
            log: self.log.clone(),
            partition,
            position,
            batch: self.read_batch,
            buffer: VecDeque::new(),
            rejected: None,
        }
    }
}

#[async_trait]
impl EventPublisher for EventLogClient {
    async fn publish(&self, event: Event) -> Result<(PartitionId, Position), LogError> {
        self.append_with_retry(&event).await
    }
}

/// Read position within one partition.
///
/// `next` is cancel-safe: dropping its future never skips a record.
pub struct EventCursor {
    log: Arc<dyn EventLog>,
    partition: PartitionId,
    position: Position,
    batch: usize,
    buffer: VecDeque<LogRecord>,
    rejected: Option<LogRecord>,
}

impl EventCursor {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Position of the next record this cursor yields
    pub fn position(&self) -> Position {
        self.position
    }

    /// Raw record behind the last `LogError::Codec`
    pub fn take_rejected(&mut self) -> Option<LogRecord> {
        self.rejected.take()
    }

    /// Next event, waiting for one to be appended if needed.
    ///
    /// An undecodable record yields `LogError::Codec` and is skipped.
    pub async fn next(&mut self) -> Result<(Position, Event), LogError> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                self.position = record.position.next();
                return match decode_event(&record.bytes) {
                    Ok(event) => Ok((record.position, event)),
                    Err(e) => {
                        let error = LogError::Codec {
                            partition: self.partition,
                            position: record.position,
                            reason: e.0,
                        };
                        self.rejected = Some(record);
                        Err(error)
                    }
                };
            }
            let records = self.log.read(self.partition, self.position, self.batch).await?;
            self.buffer.extend(records);
        }
    }
}
