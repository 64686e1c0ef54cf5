//! LMDB-backed idempotency and offset stores

use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use rkyv::rancor;
use rkyv::util::AlignedVec;

use crate::dedupe::{IdempotencyRecord, IdempotencyStore, InsertOutcome, RecordStatus};
use crate::idempotency::{IdempotencyKey, ResultToken};
use crate::offsets::OffsetStore;
use crate::{ConsumerId, EventId, PartitionId, Position, StoreError};

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;

fn storage(e: heed::Error) -> StoreError {
    StoreError::Storage(e.to_string().into_boxed_str())
}

/// Open (creating if needed) the LMDB environment at `path`.
///
/// Open each path once per process and share the returned [`Env`] between
/// stores.
pub fn open_env(path: &Path) -> Result<Env, StoreError> {
    std::fs::create_dir_all(path).map_err(|e| StoreError::Storage(e.to_string().into_boxed_str()))?;
    // SAFETY: callers open a given path once per process, and nothing else
    // maps the same files while the environment is alive.
    unsafe {
        EnvOpenOptions::new()
            .map_size(DEFAULT_MAP_SIZE)
            .max_dbs(4)
            .open(path)
    }
    .map_err(storage)
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct StoredRecord {
    event_id: u128,
    consumer_id: String,
    processed: bool,
    /// Claim time while in flight, processing time once processed
    at_millis: u64,
    result_token: Option<String>,
}

impl From<&IdempotencyRecord> for StoredRecord {
    fn from(record: &IdempotencyRecord) -> Self {
        let (processed, at_millis, result_token) = match &record.status {
            RecordStatus::InFlight { claimed_at_millis } => (false, *claimed_at_millis, None),
            RecordStatus::Processed {
                processed_at_millis,
                result_token,
            } => (
                true,
                *processed_at_millis,
                result_token.as_ref().map(|t| t.as_str().to_string()),
            ),
        };
        Self {
            event_id: record.event_id.get(),
            consumer_id: record.consumer_id.as_str().to_string(),
            processed,
            at_millis,
            result_token,
        }
    }
}

impl From<StoredRecord> for IdempotencyRecord {
    fn from(stored: StoredRecord) -> Self {
        let status = if stored.processed {
            RecordStatus::Processed {
                processed_at_millis: stored.at_millis,
                result_token: stored.result_token.map(ResultToken::from),
            }
        } else {
            RecordStatus::InFlight {
                claimed_at_millis: stored.at_millis,
            }
        };
        Self {
            event_id: EventId(stored.event_id),
            consumer_id: ConsumerId(stored.consumer_id.into_boxed_str()),
            status,
        }
    }
}

fn encode(record: &IdempotencyRecord) -> Result<Vec<u8>, StoreError> {
    rkyv::to_bytes::<rancor::Error>(&StoredRecord::from(record))
        .map(|bytes| bytes.to_vec())
        .map_err(|e| StoreError::Codec(e.to_string().into_boxed_str()))
}

fn decode(bytes: &[u8]) -> Result<IdempotencyRecord, StoreError> {
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<StoredRecord, rancor::Error>(&aligned)
        .map(IdempotencyRecord::from)
        .map_err(|e| StoreError::Codec(e.to_string().into_boxed_str()))
}

/// Idempotency records keyed by [`IdempotencyKey`]
pub struct LmdbIdempotencyStore {
    env: Env,
    db: Database<Str, Bytes>,
}

impl LmdbIdempotencyStore {
    pub fn new(env: &Env) -> Result<Self, StoreError> {
        let mut wtxn = env.write_txn().map_err(storage)?;
        let db = env
            .create_database(&mut wtxn, Some("idempotency"))
            .map_err(storage)?;
        wtxn.commit().map_err(storage)?;
        Ok(Self { env: env.clone(), db })
    }

    /// Read, modify and write back one record in a single write transaction
    fn update<T>(
        &self,
        key: &IdempotencyKey,
        apply: impl FnOnce(
            Option<IdempotencyRecord>,
        ) -> Result<(Option<IdempotencyRecord>, T), StoreError>,
    ) -> Result<T, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let current = match self.db.get(&wtxn, key.as_str()).map_err(storage)? {
            Some(bytes) => Some(decode(bytes)?),
            None => None,
        };
        let (write, result) = apply(current)?;
        if let Some(record) = write {
            self.db
                .put(&mut wtxn, key.as_str(), &encode(&record)?)
                .map_err(storage)?;
            wtxn.commit().map_err(storage)?;
        }
        Ok(result)
    }
}

impl IdempotencyStore for LmdbIdempotencyStore {
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError> {
        let key = record.key();
        self.update(&key, |current| match current {
            Some(existing) => Ok((None, InsertOutcome::Existing(existing))),
            None => Ok((Some(record), InsertOutcome::Inserted)),
        })
    }

    fn complete(
        &self,
        key: &IdempotencyKey,
        processed_at_millis: u64,
        result_token: Option<ResultToken>,
    ) -> Result<(), StoreError> {
        self.update(key, |current| match current {
            Some(mut record) if !record.is_processed() => {
                record.status = RecordStatus::Processed {
                    processed_at_millis,
                    result_token,
                };
                Ok((Some(record), ()))
            }
            Some(_) => Err(StoreError::Conflict(format!("{key} already processed").into())),
            None => Err(StoreError::Conflict(format!("{key} has no claim").into())),
        })
    }

    fn remove_claim(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let in_flight = match self.db.get(&wtxn, key.as_str()).map_err(storage)? {
            Some(bytes) => !decode(bytes)?.is_processed(),
            None => false,
        };
        if in_flight {
            self.db.delete(&mut wtxn, key.as_str()).map_err(storage)?;
            wtxn.commit().map_err(storage)?;
        }
        Ok(in_flight)
    }

    fn take_over_stale(
        &self,
        record: IdempotencyRecord,
        stale_before_millis: u64,
    ) -> Result<bool, StoreError> {
        let key = record.key();
        self.update(&key, |current| match current.map(|r| r.status) {
            Some(RecordStatus::InFlight { claimed_at_millis })
                if claimed_at_millis < stale_before_millis =>
            {
                Ok((Some(record), true))
            }
            _ => Ok((None, false)),
        })
    }

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        match self.db.get(&rtxn, key.as_str()).map_err(storage)? {
            Some(bytes) => decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn prune(
        &self,
        processed_before_millis: u64,
        claimed_before_millis: u64,
    ) -> Result<usize, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let mut expired = Vec::new();
        for entry in self.db.iter(&wtxn).map_err(storage)? {
            let (key, bytes) = entry.map_err(storage)?;
            let keep = match decode(bytes)?.status {
                RecordStatus::Processed {
                    processed_at_millis, ..
                } => processed_at_millis >= processed_before_millis,
                RecordStatus::InFlight { claimed_at_millis } => {
                claimed_at_millis >= claimed_before_millis
            }
            };
            if !keep {
                expired.push(key.to_string());
            }
        }
        for key in &expired {
            self.db.delete(&mut wtxn, key).map_err(storage)?;
        }
        wtxn.commit().map_err(storage)?;
        Ok(expired.len())
    }
}

/// Consumer offsets keyed by `{group}/{partition}`
pub struct LmdbOffsetStore {
    env: Env,
    db: Database<Str, Bytes>,
}

impl LmdbOffsetStore {
    pub fn new(env: &Env) -> Result<Self, StoreError> {
        let mut wtxn = env.write_txn().map_err(storage)?;
        let db = env.create_database(&mut wtxn, Some("offsets")).map_err(storage)?;
        wtxn.commit().map_err(storage)?;
        Ok(Self { env: env.clone(), db })
    }
}

fn offset_key(group: &str, partition: PartitionId) -> String {
    format!("{group}/{partition}")
}

fn decode_position(bytes: &[u8]) -> Result<Position, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Codec("offset is not 8 bytes".into()))?;
    Ok(Position(u64::from_le_bytes(raw)))
}

impl OffsetStore for LmdbOffsetStore {
    fn committed(
        &self,
        group: &str,
        partition: PartitionId,
    ) -> Result<Option<Position>, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        self.db
            .get(&rtxn, &offset_key(group, partition))
            .map_err(storage)?
            .map(decode_position)
            .transpose()
    }

    fn compare_and_swap(
        &self,
        group: &str,
        partition: PartitionId,
        expected: Option<Position>,
        new: Position,
    ) -> Result<bool, StoreError> {
        let key = offset_key(group, partition);
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let current = self
            .db
            .get(&wtxn, &key)
            .map_err(storage)?
            .map(decode_position)
            .transpose()?;
        if current != expected {
            return Ok(false);
        }
        self.db
            .put(&mut wtxn, &key, &new.0.to_le_bytes())
            .map_err(storage)?;
        wtxn.commit().map_err(storage)?;
        Ok(true)
    }
}
