//! Shared helpers for the delivery and saga integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use clinic_event_core::{
    CoreConfig, CoreContext, Event, EventHandler, EventSchema, FieldKind, HandlerContext,
    HandlerError, HandlerOutcome, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    InMemoryDeadLetterQueue, InMemoryEventLog, InMemoryIdempotencyStore, InMemoryOffsetStore,
    InsertOutcome, ResultToken, RetryPolicy, SchemaInterest, SchemaRegistry, StoreError,
};

static TRACING: Once = Once::new();

/// Route library logs to the test output; `RUST_LOG` selects the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Millisecond backoff so retry paths finish quickly.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_initial_delay(Duration::from_millis(2))
        .with_max_delay(Duration::from_millis(20))
}

pub fn test_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.log.publish_retry = fast_retry(5);
    config.relay = config.relay.with_poll_interval(Duration::from_millis(5));
    config.idempotency = config.idempotency.with_storage_retry(fast_retry(3));
    config.dispatcher = config
        .dispatcher
        .with_handler_timeout(Duration::from_secs(2))
        .with_retry(fast_retry(3))
        .with_storage_retry(fast_retry(3));
    config.saga.compensation_retry = fast_retry(3);
    config
}

/// Business schemas used by the clinic scenarios
pub fn clinic_schemas() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry
        .register(
            EventSchema::new("patient.created", 1)
                .field("patient_id", FieldKind::Text)
                .field("name", FieldKind::Text),
        )
        .unwrap();
    registry
        .register(
            EventSchema::new("appointment.requested", 1)
                .field("patient_id", FieldKind::Text)
                .field("slot", FieldKind::Text)
                .optional("amount", FieldKind::Int),
        )
        .unwrap();
    Arc::new(registry)
}

/// One service's view of a shared in-memory log
pub struct Cluster {
    pub log: Arc<InMemoryEventLog>,
    pub offsets: Arc<InMemoryOffsetStore>,
    pub dead_letters: Arc<InMemoryDeadLetterQueue>,
    pub ctx: CoreContext,
}

impl Cluster {
    pub fn new(partitions: u32) -> Self {
        Self::with_config(partitions, test_config())
    }

    pub fn with_config(partitions: u32, config: CoreConfig) -> Self {
        Self::with_idempotency(partitions, config, Arc::new(InMemoryIdempotencyStore::new()))
    }

    pub fn with_idempotency(
        partitions: u32,
        config: CoreConfig,
        store: Arc<dyn IdempotencyStore>,
    ) -> Self {
        init_tracing();
        let log = Arc::new(InMemoryEventLog::new(partitions));
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterQueue::new());
        let ctx = CoreContext::new(
            config,
            log.clone(),
            clinic_schemas(),
            store,
            offsets.clone(),
            dead_letters.clone(),
        )
        .unwrap();
        Self {
            log,
            offsets,
            dead_letters,
            ctx,
        }
    }
}

pub fn patient_created(patient_id: &str) -> Event {
    Event::builder("patient.created", patient_id)
        .field("patient_id", patient_id)
        .field("name", "Ada Lovelace")
        .build()
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Sends a welcome notification per new patient
#[derive(Default)]
pub struct WelcomeMailer {
    pub sent: Mutex<Vec<String>>,
    pub calls: AtomicU32,
    /// Panic inside the next call, killing the partition worker
    pub crash_next: AtomicBool,
    /// Fail this many calls with a transient error
    pub transient_failures: AtomicU32,
}

impl WelcomeMailer {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for WelcomeMailer {
    fn name(&self) -> &str {
        "welcome-mailer"
    }

    fn interests(&self) -> Vec<SchemaInterest> {
        vec![SchemaInterest::v1("patient.created")]
    }

    async fn handle(
        &self,
        event: &Event,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.crash_next.swap(false, Ordering::SeqCst) {
            panic!("mail server connection dropped mid-send");
        }
        if take_one(&self.transient_failures) {
            return Err(HandlerError::transient("mail server busy"));
        }
        let patient = event
            .payload
            .text("patient_id")
            .ok_or_else(|| HandlerError::logic("patient_id missing"))?;
        if patient.starts_with("poison") {
            return Err(HandlerError::logic(format!("mailbox rejects {patient}")));
        }
        self.sent.lock().unwrap().push(patient.to_string());
        Ok(HandlerOutcome::with_token(format!("mail:{patient}")))
    }
}

/// Decrement `counter` if positive; true when it was
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory idempotency store whose claim removals fail on demand
#[derive(Default)]
pub struct FlakyIdempotencyStore {
    pub inner: InMemoryIdempotencyStore,
    pub remove_failures: AtomicU32,
}

impl IdempotencyStore for FlakyIdempotencyStore {
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError> {
        self.inner.insert_if_absent(record)
    }

    fn complete(
        &self,
        key: &IdempotencyKey,
        processed_at_millis: u64,
        result_token: Option<ResultToken>,
    ) -> Result<(), StoreError> {
        self.inner.complete(key, processed_at_millis, result_token)
    }

    fn remove_claim(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        if take_one(&self.remove_failures) {
            return Err(StoreError::Storage("idempotency table locked".into()));
        }
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
