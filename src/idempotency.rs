//! Idempotency keys and the guard deduplicating inbound event processing

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::IdempotencyConfig;
use crate::dedupe::{IdempotencyRecord, IdempotencyStore, InsertOutcome, RecordStatus};
use crate::{now_millis, ConsumerId, Event, EventId, RetryPolicy, SagaId, StoreError};

/// Idempotency key for deduplicating side effects
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(pub Box<str>);

impl IdempotencyKey {
    /// Key of one event delivered to one consumer
    pub fn for_delivery(event_id: EventId, consumer_id: &ConsumerId) -> Self {
        Self(format!("evt:{}:consumer:{}", event_id, consumer_id).into_boxed_str())
    }

    /// Key of a step execution, shared by all its attempts
    pub fn for_step(saga_id: SagaId, step_name: &str) -> Self {
        Self(format!("saga:{}:step:{}", saga_id, step_name).into_boxed_str())
    }

    /// Create an idempotency key for compensation
    pub fn for_compensation(saga_id: SagaId, step_name: &str) -> Self {
        Self(format!("saga:{}:compensate:{}", saga_id, step_name).into_boxed_str())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque response stored with a processed record and replayed on duplicates
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultToken(pub Box<str>);

impl ResultToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResultToken {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for ResultToken {
    fn from(value: String) -> Self {
        Self(value.into_boxed_str())
    }
}

/// Outcome of [`IdempotencyGuard::admit`]
#[derive(Debug)]
pub enum Admission {
    /// First delivery to this consumer: run the handler, then settle the ticket
    Proceed(AdmissionTicket),
    /// Already processed by this consumer
    Duplicate { result_token: Option<ResultToken> },
    /// Another claim is outstanding and not yet stale. The event has not been
    /// processed; admit again once the claim can be taken over.
    InFlight { claimed_at_millis: u64, stale_at_millis: u64 },
}

impl Admission {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Claim on an (event, consumer) pair held while its handler runs.
///
/// Settle it with [`complete`](Self::complete) on success or
/// [`release`](Self::release) on failure. A ticket dropped unsettled leaves
/// the claim in place until the claim TTL expires.
#[must_use = "an unsettled ticket blocks redelivery until the claim TTL expires"]
pub struct AdmissionTicket {
    key: IdempotencyKey,
    store: Arc<dyn IdempotencyStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket").field("key", &self.key).finish()
    }
}

impl AdmissionTicket {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Record successful processing; later deliveries are duplicates.
    ///
    /// Storage failures are retried with the storage policy. A conflict is
    /// returned at once.
    pub async fn complete(&self, result_token: Option<ResultToken>) -> Result<(), StoreError> {
        with_storage_retry(&self.retry, &self.key, || {
            self.store.complete(&self.key, now_millis(), result_token.clone())
        })
        .await
    }

    /// Drop the claim so a redelivery may proceed again
    pub async fn release(&self) -> Result<(), StoreError> {
        with_storage_retry(&self.retry, &self.key, || self.store.remove_claim(&self.key)).await?;
        Ok(())
    }
}

async fn with_storage_retry<T>(
    retry: &RetryPolicy,
    key: &IdempotencyKey,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e @ StoreError::Conflict(_)) => return Err(e),
            Err(e) if retry.has_attempts_remaining(attempt) => {
                tracing::warn!(
                    %key,
                    attempt,
                    error = %e,
                    "Idempotency store unavailable, retrying"
                );
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Deduplicates event processing per consumer
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Admit `event` for `consumer`.
    ///
    /// Storage failures are retried with the configured storage policy before
    /// being returned.
    pub async fn admit(
        &self,
        event: &Event,
        consumer: &ConsumerId,
    ) -> Result<Admission, StoreError> {
        let key = IdempotencyKey::for_delivery(event.id, consumer);
        with_storage_retry(&self.config.storage_retry, &key, || {
            self.try_admit(event.id, consumer)
        })
        .await
    }

    fn try_admit(&self, event_id: EventId, consumer: &ConsumerId) -> Result<Admission, StoreError> {
        let now = now_millis();
        let claim = IdempotencyRecord::claim(event_id, consumer.clone(), now);
        let key = claim.key();

        match self.store.insert_if_absent(claim.clone())? {
            InsertOutcome::Inserted => Ok(self.ticket(key)),
            InsertOutcome::Existing(existing) => match existing.status {
                RecordStatus::Processed { result_token, .. } => {
                    Ok(Admission::Duplicate { result_token })
                }
                RecordStatus::InFlight { claimed_at_millis } => {
                    let stale_before = now.saturating_sub(self.config.claim_ttl_millis);
                    if self.store.take_over_stale(claim, stale_before)? {
                        tracing::warn!(%key, claimed_at_millis, "Took over abandoned claim");
                        Ok(self.ticket(key))
                    } else {
                        Ok(Admission::InFlight {
                            claimed_at_millis,
                            stale_at_millis: claimed_at_millis
                                .saturating_add(self.config.claim_ttl_millis)
                                .saturating_add(1),
                        })
                    }
                }
            },
        }
    }

    fn ticket(&self, key: IdempotencyKey) -> Admission {
        Admission::Proceed(AdmissionTicket {
            key,
            store: self.store.clone(),
            retry: self.config.storage_retry.clone(),
        })
    }

    /// Delete records past the retention window and abandoned claims
    pub fn prune_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let pruned = self.store.prune(
            now.saturating_sub(self.config.retention_millis),
            now.saturating_sub(self.config.claim_ttl_millis),
        )?;
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned idempotency records");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::InMemoryIdempotencyStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn guard(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> IdempotencyGuard {
        IdempotencyGuard::new(store, config)
    }

    fn quick_storage_retry() -> IdempotencyConfig {
        IdempotencyConfig::default().with_storage_retry(
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(1)),
        )
    }

    fn event() -> Event {
        Event::builder("patient.created", "patient-1").build()
    }

    /// In-memory store whose next `remove_claim` and `complete` calls fail
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryIdempotencyStore,
        remove_failures: AtomicU32,
        complete_failures: AtomicU32,
    }

    fn fail_once(counter: &AtomicU32) -> Result<(), StoreError> {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Storage("disk busy".into()));
        }
        Ok(())
    }

    impl IdempotencyStore for FlakyStore {
        fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError> {
            self.inner.insert_if_absent(record)
        }

        fn complete(
            &self,
            key: &IdempotencyKey,
            processed_at_millis: u64,
            result_token: Option<ResultToken>,
        ) -> Result<(), StoreError> {
            fail_once(&self.complete_failures)?;
            self.inner.complete(key, processed_at_millis, result_token)
        }

        fn remove_claim(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
            fail_once(&self.remove_failures)?;
            self.inner.remove_claim(key)
        }

        fn take_over_stale(
            &self,
            record: IdempotencyRecord,
            stale_before_millis: u64,
        ) -> Result<bool, StoreError> {
            self.inner.take_over_stale(record, stale_before_millis)
        }

        fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
            self.inner.get(key)
        }

        fn prune(
            &self,
            processed_before_millis: u64,
            claimed_before_millis: u64,
        ) -> Result<usize, StoreError> {
            self.inner.prune(processed_before_millis, claimed_before_millis)
        }
    }

    #[tokio::test]
    async fn proceed_at_most_once_per_consumer() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = guard(store.clone(), IdempotencyConfig::default());
        let event = event();
        let notifier = ConsumerId::new("notifications", "welcome");

        let Admission::Proceed(ticket) = guard.admit(&event, &notifier).await.unwrap() else {
            panic!("first delivery must proceed");
        };
        ticket.complete(Some("mail-17".into())).await.unwrap();

        for _ in 0..5 {
            match guard.admit(&event, &notifier).await.unwrap() {
                Admission::Duplicate { result_token } => {
                    assert_eq!(result_token, Some(ResultToken::from("mail-17")))
                }
                other => panic!("processed event admitted as {other:?}"),
            }
        }

        let auditor = ConsumerId::new("audit", "trail");
        assert!(guard.admit(&event, &auditor).await.unwrap().is_proceed());
    }

    #[tokio::test]
    async fn outstanding_claim_is_in_flight_not_duplicate() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = guard(store.clone(), IdempotencyConfig::default().with_claim_ttl_millis(1_000));
        let event = event();
        let consumer = ConsumerId::new("billing", "invoice");

        let Admission::Proceed(_abandoned) = guard.admit(&event, &consumer).await.unwrap() else {
            panic!("first delivery must proceed");
        };
        match guard.admit(&event, &consumer).await.unwrap() {
            Admission::InFlight {
                claimed_at_millis,
                stale_at_millis,
            } => assert_eq!(stale_at_millis, claimed_at_millis + 1_001),
            other => panic!("outstanding claim admitted as {other:?}"),
        }
        let record = store.get(&IdempotencyKey::for_delivery(event.id, &consumer)).unwrap();
        assert!(!record.unwrap().is_processed());
    }

    #[tokio::test]
    async fn released_claim_allows_retry() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = guard(store.clone(), IdempotencyConfig::default());
        let event = event();
        let consumer = ConsumerId::new("billing", "invoice");

        let Admission::Proceed(ticket) = guard.admit(&event, &consumer).await.unwrap() else {
            panic!("first delivery must proceed");
        };
        assert!(!guard.admit(&event, &consumer).await.unwrap().is_proceed());
        ticket.release().await.unwrap();

        assert!(guard.admit(&event, &consumer).await.unwrap().is_proceed());
    }

    #[tokio::test]
    async fn release_retries_a_failing_store() {
        let store = Arc::new(FlakyStore::default());
        store.remove_failures.store(1, Ordering::SeqCst);
        let guard = guard(store.clone(), quick_storage_retry());
        let event = event();
        let consumer = ConsumerId::new("billing", "invoice");

        let Admission::Proceed(ticket) = guard.admit(&event, &consumer).await.unwrap() else {
            panic!("first delivery must proceed");
        };
        ticket.release().await.unwrap();

        assert_eq!(store.remove_failures.load(Ordering::SeqCst), 0);
        assert!(guard.admit(&event, &consumer).await.unwrap().is_proceed());
    }

    #[tokio::test]
    async fn complete_retries_a_failing_store() {
        let store = Arc::new(FlakyStore::default());
        store.complete_failures.store(2, Ordering::SeqCst);
        let guard = guard(store.clone(), quick_storage_retry());
        let event = event();
        let consumer = ConsumerId::new("notifications", "welcome");

        let Admission::Proceed(ticket) = guard.admit(&event, &consumer).await.unwrap() else {
            panic!("first delivery must proceed");
        };
        ticket.complete(Some("mail-1".into())).await.unwrap();

        assert!(guard.admit(&event, &consumer).await.unwrap().is_duplicate());
    }

    #[tokio::test]
    async fn settle_gives_up_after_storage_budget() {
        let store = Arc::new(FlakyStore::default());
        store.remove_failures.store(5, Ordering::SeqCst);
        let guard = guard(store.clone(), quick_storage_retry());
        let event = event();
        let consumer = ConsumerId::new("billing", "invoice");

        let Admission::Proceed(ticket) = guard.admit(&event, &consumer).await.unwrap() else {
            panic!("first delivery must proceed");
        };
        assert!(matches!(ticket.release().await, Err(StoreError::Storage(_))));
        assert_eq!(store.remove_failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_claim_is_taken_over_after_ttl() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = guard(store.clone(), IdempotencyConfig::default().with_claim_ttl_millis(0));
        let event = event();
        let consumer = ConsumerId::new("billing", "invoice");
        store
            .insert_if_absent(IdempotencyRecord::claim(event.id, consumer.clone(), 0))
            .unwrap();

        assert!(guard.admit(&event, &consumer).await.unwrap().is_proceed());
    }

    #[tokio::test]
    async fn prune_keeps_records_inside_retention() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = guard(store.clone(), IdempotencyConfig::default());
        let event = event();
        let consumer = ConsumerId::new("notifications", "welcome");
        if let Admission::Proceed(ticket) = guard.admit(&event, &consumer).await.unwrap() {
            ticket.complete(None).await.unwrap();
        }

        assert_eq!(guard.prune_expired().unwrap(), 0);
        assert_eq!(store.len(), 1);
    }
}
