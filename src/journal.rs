//! Participant journal storage trait

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::state::{SagaParticipantState, SagaStateEntry};
use crate::{now_millis, ParticipantEvent, SagaId, StoreError};

/// Append-only log of a participant's per-saga events, replayed on restart
pub trait ParticipantJournal: Send + Sync + 'static {
    fn append(&self, saga_id: SagaId, event: ParticipantEvent) -> Result<u64, StoreError>;
    fn read(&self, saga_id: SagaId) -> Result<Vec<JournalEntry>, StoreError>;
    fn list_sagas(&self) -> Result<Vec<SagaId>, StoreError>;
    /// Forget a saga once it has ended
    fn discard(&self, saga_id: SagaId) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct JournalEntry {
    pub sequence: u64,
    pub recorded_at_millis: u64,
    pub event: ParticipantEvent,
}

/// Rebuild a participant's state from its journal.
///
/// Returns `None` when the journal does not start with `StepTriggered`.
pub fn rebuild_state(entries: &[JournalEntry]) -> Option<SagaStateEntry> {
    let (first, rest) = entries.split_first()?;
    let ParticipantEvent::StepTriggered { context, .. } = &first.event else {
        return None;
    };
    let idle = SagaStateEntry::Idle(SagaParticipantState::new(
        context.clone(),
        first.recorded_at_millis,
    ));
    let triggered = idle.apply(&first.event, first.recorded_at_millis);
    Some(
        rest.iter()
            .fold(triggered, |state, entry| state.apply(&entry.event, entry.recorded_at_millis)),
    )
}

/// In-memory journal for testing
pub struct InMemoryJournal {
    data: RwLock<HashMap<SagaId, Vec<JournalEntry>>>,
    counter: AtomicU64,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }
}

impl ParticipantJournal for InMemoryJournal {
    fn append(&self, saga_id: SagaId, event: ParticipantEvent) -> Result<u64, StoreError> {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let entry = JournalEntry {
            sequence,
            recorded_at_millis: now_millis(),
            event,
        };

        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        data.entry(saga_id).or_default().push(entry);

        Ok(sequence)
    }

    fn read(&self, saga_id: SagaId) -> Result<Vec<JournalEntry>, StoreError> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.get(&saga_id).cloned().unwrap_or_default())
    }

    fn list_sagas(&self) -> Result<Vec<SagaId>, StoreError> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.keys().copied().collect())
    }

    fn discard(&self, saga_id: SagaId) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        data.remove(&saga_id);
        Ok(())
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventId, Payload, SagaContext};

    #[test]
    fn rebuilds_completed_step() {
        let journal = InMemoryJournal::new();
        let saga = SagaId(11);
        let context = SagaContext::start(saga, "appointment_booking", "charge_payment", "corr", 0);

        journal
            .append(
                saga,
                ParticipantEvent::StepTriggered {
                    context,
                    triggering_event: EventId(3),
                    triggered_at_millis: 1,
                },
            )
            .unwrap();
        journal
            .append(
                saga,
                ParticipantEvent::StepExecutionStarted {
                    attempt: 1,
                    started_at_millis: 2,
                },
            )
            .unwrap();
        journal
            .append(
                saga,
                ParticipantEvent::StepExecutionCompleted {
                    output: Payload::new().with("charge_id", "ch-1"),
                    compensation_data: Payload::new().with("charge_id", "ch-1"),
                    completed_at_millis: 3,
                },
            )
            .unwrap();

        let entries = journal.read(saga).unwrap();
        assert!(entries.windows(2).all(|w| w[0].sequence < w[1].sequence));
        match rebuild_state(&entries) {
            Some(SagaStateEntry::Completed(s)) => {
                assert_eq!(s.state.output.text("charge_id"), Some("ch-1"));
                assert_eq!(&*s.context.step_name, "charge_payment");
            }
            other => panic!("unexpected {other:?}"),
        }

        journal.discard(saga).unwrap();
        assert!(journal.list_sagas().unwrap().is_empty());
    }

    #[test]
    fn journal_without_trigger_is_not_rebuilt() {
        let entries = vec![JournalEntry {
            sequence: 1,
            recorded_at_millis: 0,
            event: ParticipantEvent::CompensationCompleted { completed_at_millis: 0 },
        }];
        assert!(rebuild_state(&entries).is_none());
    }
}
