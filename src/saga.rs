//! Saga definitions, instances and their state machine

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::traits::DependencySpec;
use crate::{ErrorCategory, Payload, SagaContext, SagaId, StoreError};

/// How a saga's steps are driven
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStyle {
    /// The coordinator emits every step and compensation request
    Orchestration,
    /// Each participant reacts to the previous step's outcome; the
    /// coordinator only tracks progress
    Choreography,
}

/// Static description of a saga type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub saga_type: Box<str>,
    /// Event type that starts an instance
    pub trigger_event_type: Box<str>,
    /// Step names in execution order
    pub steps: Vec<Box<str>>,
    pub style: SagaStyle,
}

impl SagaDefinition {
    pub fn new(
        saga_type: &str,
        trigger_event_type: &str,
        steps: &[&str],
        style: SagaStyle,
    ) -> Self {
        Self {
            saga_type: saga_type.into(),
            trigger_event_type: trigger_event_type.into(),
            steps: steps.iter().map(|s| (*s).into()).collect(),
            style,
        }
    }

    pub fn index_of(&self, step: &str) -> Option<usize> {
        self.steps.iter().position(|s| &**s == step)
    }

    pub fn step(&self, index: usize) -> Option<&str> {
        self.steps.get(index).map(|s| &**s)
    }

    pub fn last_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// What the step at `index` waits for under choreography
    pub fn dependency_of(&self, index: usize) -> DependencySpec {
        match index.checked_sub(1).and_then(|prev| self.step(prev)) {
            Some(prev) => DependencySpec::After(prev.into()),
            None => DependencySpec::OnSagaStart,
        }
    }
}

/// Lifecycle of a saga instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SagaState {
    Started,
    /// Step with this index is in progress
    Step(usize),
    Compensating,
    Completed,
    Failed,
}

impl SagaState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => f.write_str("STARTED"),
            Self::Step(i) => write!(f, "STEP_{}", i + 1),
            Self::Compensating => f.write_str("COMPENSATING"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

/// Entry of a saga's step log
#[derive(Clone, Debug, PartialEq)]
pub enum StepMarker {
    Completed {
        step_index: usize,
        step_name: Box<str>,
        compensation_data: Payload,
        at_millis: u64,
    },
    Compensated {
        step_index: usize,
        step_name: Box<str>,
        at_millis: u64,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FailureRecord {
    pub step_index: usize,
    pub step_name: Box<str>,
    pub reason: Box<str>,
    pub category: ErrorCategory,
    pub at_millis: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SagaError {
    #[error("saga {saga_id} is {state} and can no longer change")]
    Terminal { saga_id: SagaId, state: SagaState },
    #[error("saga {saga_id} is {state}; unexpected message for step {step_index}")]
    OutOfOrder {
        saga_id: SagaId,
        state: SagaState,
        step_index: usize,
    },
    #[error("saga {saga_id} awaits manual intervention")]
    Frozen { saga_id: SagaId },
    #[error("unknown saga type {0}")]
    UnknownSagaType(Box<str>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the coordinator does after a transition
#[derive(Clone, Debug, PartialEq)]
pub enum Next {
    /// Start the step at this index
    Step(usize),
    /// Compensate a completed step
    Compensate {
        step_index: usize,
        step_name: Box<str>,
        compensation_data: Payload,
    },
    Completed,
    Failed,
}

/// One execution of a saga, owned by the coordinator
#[derive(Clone, Debug, PartialEq)]
pub struct SagaInstance {
    pub saga_id: SagaId,
    pub saga_type: Box<str>,
    pub correlation_id: Box<str>,
    pub steps: Vec<Box<str>>,
    pub state: SagaState,
    pub step_log: Vec<StepMarker>,
    /// Step failure that sent the saga into compensation
    pub failure: Option<FailureRecord>,
    /// Compensation failure awaiting an operator
    pub compensation_failure: Option<FailureRecord>,
    pub started_at_millis: u64,
    pub updated_at_millis: u64,
}

impl SagaInstance {
    pub fn new(definition: &SagaDefinition, context: &SagaContext, now_millis: u64) -> Self {
        Self {
            saga_id: context.saga_id,
            saga_type: definition.saga_type.clone(),
            correlation_id: context.correlation_id.clone(),
            steps: definition.steps.clone(),
            state: SagaState::Started,
            step_log: Vec::new(),
            failure: None,
            compensation_failure: None,
            started_at_millis: context.saga_started_at_millis,
            updated_at_millis: now_millis,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Compensation failed and the saga is frozen
    pub fn needs_intervention(&self) -> bool {
        self.compensation_failure.is_some()
    }

    /// Context of this saga addressed to `step_index`
    pub fn context_for(&self, step_index: usize) -> SagaContext {
        SagaContext {
            saga_id: self.saga_id,
            saga_type: self.saga_type.clone(),
            step_name: self.steps.get(step_index).cloned().unwrap_or_default(),
            step_index,
            correlation_id: self.correlation_id.clone(),
            attempt: 0,
            saga_started_at_millis: self.started_at_millis,
        }
    }

    /// Completed steps, in completion order
    pub fn completed_steps(&self) -> impl Iterator<Item = usize> + '_ {
        self.step_log.iter().filter_map(|m| match m {
            StepMarker::Completed { step_index, .. } => Some(*step_index),
            StepMarker::Compensated { .. } => None,
        })
    }

    /// Compensated steps, in compensation order
    pub fn compensated_steps(&self) -> impl Iterator<Item = usize> + '_ {
        self.step_log.iter().filter_map(|m| match m {
            StepMarker::Compensated { step_index, .. } => Some(*step_index),
            StepMarker::Completed { .. } => None,
        })
    }

    fn guard_mutable(&self) -> Result<(), SagaError> {
        if self.is_terminal() {
            return Err(SagaError::Terminal {
                saga_id: self.saga_id,
                state: self.state,
            });
        }
        if self.needs_intervention() {
            return Err(SagaError::Frozen { saga_id: self.saga_id });
        }
        Ok(())
    }

    fn out_of_order(&self, step_index: usize) -> SagaError {
        SagaError::OutOfOrder {
            saga_id: self.saga_id,
            state: self.state,
            step_index,
        }
    }

    /// Mark the first step as requested
    pub fn begin(&mut self, now_millis: u64) -> Result<Next, SagaError> {
        self.guard_mutable()?;
        if self.state != SagaState::Started {
            return Err(self.out_of_order(0));
        }
        self.state = SagaState::Step(0);
        self.updated_at_millis = now_millis;
        Ok(Next::Step(0))
    }

    pub fn record_step_completed(
        &mut self,
        step_index: usize,
        compensation_data: Payload,
        now_millis: u64,
    ) -> Result<Next, SagaError> {
        self.guard_mutable()?;
        let in_progress = match self.state {
            SagaState::Started => 0,
            SagaState::Step(i) => i,
            _ => return Err(self.out_of_order(step_index)),
        };
        if step_index != in_progress {
            return Err(self.out_of_order(step_index));
        }

        self.step_log.push(StepMarker::Completed {
            step_index,
            step_name: self.steps.get(step_index).cloned().unwrap_or_default(),
            compensation_data,
            at_millis: now_millis,
        });
        self.updated_at_millis = now_millis;

        if step_index + 1 < self.steps.len() {
            self.state = SagaState::Step(step_index + 1);
            Ok(Next::Step(step_index + 1))
        } else {
            self.state = SagaState::Completed;
            Ok(Next::Completed)
        }
    }

    /// Step failure: compensate completed steps, or fail outright if none
    pub fn record_step_failed(
        &mut self,
        step_index: usize,
        reason: &str,
        now_millis: u64,
    ) -> Result<Next, SagaError> {
        self.guard_mutable()?;
        let in_progress = match self.state {
            SagaState::Started => 0,
            SagaState::Step(i) => i,
            _ => return Err(self.out_of_order(step_index)),
        };
        if step_index != in_progress {
            return Err(self.out_of_order(step_index));
        }

        self.failure = Some(FailureRecord {
            step_index,
            step_name: self.steps.get(step_index).cloned().unwrap_or_default(),
            reason: reason.into(),
            category: ErrorCategory::HandlerLogic,
            at_millis: now_millis,
        });
        self.updated_at_millis = now_millis;
        self.state = SagaState::Compensating;
        Ok(self.next_compensation())
    }

    /// Next compensation to run, strictly in reverse completion order
    pub fn next_compensation(&mut self) -> Next {
        let compensated: Vec<usize> = self.compensated_steps().collect();
        let pending = self.step_log.iter().rev().find_map(|m| match m {
            StepMarker::Completed {
                step_index,
                step_name,
                compensation_data,
                ..
            } if !compensated.contains(step_index) => Some(Next::Compensate {
                step_index: *step_index,
                step_name: step_name.clone(),
                compensation_data: compensation_data.clone(),
            }),
            _ => None,
        });
        match pending {
            Some(next) => next,
            None => {
                self.state = SagaState::Failed;
                Next::Failed
            }
        }
    }

    pub fn record_compensated(
        &mut self,
        step_index: usize,
        now_millis: u64,
    ) -> Result<Next, SagaError> {
        self.guard_mutable()?;
        if self.state != SagaState::Compensating {
            return Err(self.out_of_order(step_index));
        }
        match self.next_compensation() {
            Next::Compensate {
                step_index: expected,
                step_name,
                ..
            } if expected == step_index => {
                self.step_log.push(StepMarker::Compensated {
                    step_index,
                    step_name,
                    at_millis: now_millis,
                });
                self.updated_at_millis = now_millis;
                Ok(self.next_compensation())
            }
            _ => Err(self.out_of_order(step_index)),
        }
    }

    /// Freeze the saga in COMPENSATING until an operator steps in
    pub fn record_compensation_failure(
        &mut self,
        step_index: usize,
        reason: &str,
        now_millis: u64,
    ) -> Result<(), SagaError> {
        self.guard_mutable()?;
        if self.state != SagaState::Compensating {
            return Err(self.out_of_order(step_index));
        }
        self.compensation_failure = Some(FailureRecord {
            step_index,
            step_name: self.steps.get(step_index).cloned().unwrap_or_default(),
            reason: reason.into(),
            category: ErrorCategory::CompensationFailure,
            at_millis: now_millis,
        });
        self.updated_at_millis = now_millis;
        Ok(())
    }
}

/// Durable saga instances owned by the coordinator
pub trait SagaStore: Send + Sync + 'static {
    fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError>;

    /// Insert or replace; replacing a terminal instance is a conflict
    fn put(&self, instance: SagaInstance) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<SagaInstance>, StoreError>;
}

/// In-memory saga store
pub struct InMemorySagaStore {
    data: RwLock<HashMap<SagaId, SagaInstance>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySagaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SagaStore for InMemorySagaStore {
    fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.get(&saga_id).cloned())
    }

    fn put(&self, instance: SagaInstance) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        if let Some(existing) = data.get(&instance.saga_id) {
            if existing.is_terminal() && *existing != instance {
                return Err(StoreError::Conflict(
                    format!("saga {} is {}", existing.saga_id, existing.state).into(),
                ));
            }
        }
        data.insert(instance.saga_id, instance);
        Ok(())
    }

    fn list(&self) -> Result<Vec<SagaInstance>, StoreError> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking() -> SagaDefinition {
        SagaDefinition::new(
            "appointment_booking",
            "appointment.requested",
            &["reserve_slot", "charge_payment", "verify_insurance", "confirm_appointment"],
            SagaStyle::Orchestration,
        )
    }

    fn instance() -> SagaInstance {
        let context =
            SagaContext::start(SagaId(5), "appointment_booking", "reserve_slot", "corr", 0);
        SagaInstance::new(&booking(), &context, 0)
    }

    fn data(step: &str) -> Payload {
        Payload::new().with("step", step)
    }

    #[test]
    fn success_path_reaches_completed() {
        let mut saga = instance();
        assert_eq!(saga.begin(1).unwrap(), Next::Step(0));
        for i in 0..3 {
            assert_eq!(
                saga.record_step_completed(i, Payload::new(), 2).unwrap(),
                Next::Step(i + 1)
            );
            assert_eq!(saga.state, SagaState::Step(i + 1));
        }
        assert_eq!(saga.record_step_completed(3, Payload::new(), 3).unwrap(), Next::Completed);
        assert_eq!(saga.state.to_string(), "COMPLETED");

        assert!(matches!(
            saga.record_step_failed(3, "late", 4),
            Err(SagaError::Terminal { .. })
        ));
    }

    #[test]
    fn failure_compensates_in_strict_reverse_order() {
        let mut saga = instance();
        saga.begin(0).unwrap();
        saga.record_step_completed(0, data("reserve_slot"), 1).unwrap();
        saga.record_step_completed(1, data("charge_payment"), 2).unwrap();

        let next = saga.record_step_failed(2, "insurance rejected", 3).unwrap();
        assert_eq!(saga.state, SagaState::Compensating);
        match next {
            Next::Compensate {
                step_index,
                compensation_data,
                ..
            } => {
                assert_eq!(step_index, 1);
                assert_eq!(compensation_data.text("step"), Some("charge_payment"));
            }
            other => panic!("expected a compensation, got {other:?}"),
        }

        // Compensating the older step first is refused
        assert!(matches!(
            saga.record_compensated(0, 4),
            Err(SagaError::OutOfOrder { step_index: 0, .. })
        ));

        let next = saga.record_compensated(1, 4).unwrap();
        assert!(matches!(next, Next::Compensate { step_index: 0, .. }));
        assert_eq!(saga.record_compensated(0, 5).unwrap(), Next::Failed);

        assert_eq!(saga.state, SagaState::Failed);
        assert_eq!(saga.compensated_steps().collect::<Vec<_>>(), vec![1, 0]);
        assert_eq!(saga.failure.as_ref().map(|f| &*f.step_name), Some("verify_insurance"));
    }

    #[test]
    fn first_step_failure_fails_without_compensation() {
        let mut saga = instance();
        assert_eq!(saga.record_step_failed(0, "no slots", 1).unwrap(), Next::Failed);
        assert_eq!(saga.state, SagaState::Failed);
        assert!(saga.step_log.is_empty());
    }

    #[test]
    fn compensation_failure_freezes_the_saga() {
        let mut saga = instance();
        saga.begin(0).unwrap();
        saga.record_step_completed(0, data("reserve_slot"), 1).unwrap();
        saga.record_step_failed(1, "card declined", 2).unwrap();

        saga.record_compensation_failure(0, "slot service rejected release", 3).unwrap();
        assert_eq!(saga.state, SagaState::Compensating);
        assert!(saga.needs_intervention());
        assert!(matches!(saga.record_compensated(0, 4), Err(SagaError::Frozen { .. })));
        assert_eq!(
            saga.compensation_failure.as_ref().map(|f| f.category),
            Some(ErrorCategory::CompensationFailure)
        );
    }

    #[test]
    fn duplicate_completion_is_out_of_order() {
        let mut saga = instance();
        saga.record_step_completed(0, Payload::new(), 1).unwrap();
        assert!(matches!(
            saga.record_step_completed(0, Payload::new(), 2),
            Err(SagaError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn store_refuses_to_rewrite_terminal_instances() {
        let store = InMemorySagaStore::new();
        let mut saga = instance();
        saga.record_step_failed(0, "no slots", 1).unwrap();
        store.put(saga.clone()).unwrap();
        store.put(saga.clone()).unwrap();

        let mut reopened = saga.clone();
        reopened.state = SagaState::Started;
        assert!(matches!(store.put(reopened), Err(StoreError::Conflict(_))));
        assert_eq!(store.get(saga.saga_id).unwrap().unwrap().state, SagaState::Failed);
    }

    #[test]
    fn choreography_dependencies_follow_step_order() {
        let definition = booking();
        assert!(definition.dependency_of(0).is_on_saga_start());
        assert!(definition.dependency_of(2).is_satisfied_by("charge_payment"));
        assert_eq!(definition.index_of("confirm_appointment"), Some(3));
        assert_eq!(definition.last_index(), 3);
    }
}
