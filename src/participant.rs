//! Event handler running one saga step on behalf of a [`SagaParticipant`]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::events::saga_types;
use crate::handler::{EventHandler, HandlerContext, HandlerOutcome};
use crate::journal::{rebuild_state, InMemoryJournal, ParticipantJournal};
use crate::observer::{SagaObserver, TracingObserver};
use crate::saga::{SagaDefinition, SagaStyle};
use crate::schema::SchemaInterest;
use crate::state::{
    Compensating, Completed, Executing, SagaParticipantState, SagaStateEntry, Triggered,
};
use crate::{
    now_millis, CompensationError, Event, HandlerError, ParticipantEvent, Payload, RetryPolicy,
    SagaContext, SagaEvent, SagaId, SagaParticipant, StepError, StoreError,
};

/// Wraps a [`SagaParticipant`] as an [`EventHandler`].
///
/// Under orchestration it reacts to requests addressed to its step. Under
/// choreography the first step reacts to the saga's trigger event, later
/// steps to the previous step's completion, and compensation chains
/// backwards from the failure or compensation of the following step.
///
/// Step executions retry [`StepError::Retriable`] per the participant's retry
/// policy, compensations retry [`CompensationError::SafeToRetry`] per the
/// compensation policy. Every transition is journaled before it is
/// announced, and a redelivered request for a finished step republishes the
/// recorded outcome.
pub struct StepParticipant<P: SagaParticipant> {
    participant: Arc<P>,
    name: Box<str>,
    /// Sagas joined, with this step's index in each
    definitions: Vec<(SagaDefinition, usize)>,
    journal: Arc<dyn ParticipantJournal>,
    observer: Arc<dyn SagaObserver>,
    compensation_retry: RetryPolicy,
    states: Mutex<HashMap<SagaId, SagaStateEntry>>,
}

impl<P: SagaParticipant> StepParticipant<P> {
    pub fn new(participant: P, definitions: impl IntoIterator<Item = SagaDefinition>) -> Self {
        let step = participant.step_name().to_string();
        let joined = participant.saga_types().to_vec();
        let definitions = definitions
            .into_iter()
            .filter(|d| joined.iter().any(|t| *t == &*d.saga_type))
            .filter_map(|d| {
                let index = d.index_of(&step);
                if index.is_none() {
                    tracing::warn!(
                        saga_type = %d.saga_type,
                        step = %step,
                        "Step is not part of saga definition"
                    );
                }
                index.map(|i| (d, i))
            })
            .collect();

        Self {
            name: format!("step:{step}").into_boxed_str(),
            participant: Arc::new(participant),
            definitions,
            journal: Arc::new(InMemoryJournal::new()),
            observer: Arc::new(TracingObserver),
            compensation_retry: RetryPolicy::default(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn ParticipantJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SagaObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Budget for compensations failing with `SafeToRetry`
    pub fn with_compensation_retry(mut self, retry: RetryPolicy) -> Self {
        self.compensation_retry = retry;
        self
    }

    pub fn participant(&self) -> &P {
        &self.participant
    }

    /// This participant's current state in a saga
    pub fn state(&self, saga_id: SagaId) -> Option<SagaStateEntry> {
        self.states.lock().ok()?.get(&saga_id).cloned()
    }

    /// Sagas this participant still has work or data for
    pub fn active_sagas(&self) -> Vec<SagaId> {
        self.states
            .lock()
            .map(|states| {
                states
                    .iter()
                    .filter(|(_, entry)| !entry.is_terminal())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rebuild local state from the journal after a restart.
    ///
    /// Returns the sagas left mid-flight; their pending messages are
    /// redelivered from the last committed offset and resume from the
    /// rebuilt state.
    pub fn recover(&self) -> Result<Vec<SagaId>, StoreError> {
        let mut unfinished = Vec::new();
        for saga_id in self.journal.list_sagas()? {
            let entries = self.journal.read(saga_id)?;
            let Some(entry) = rebuild_state(&entries) else {
                continue;
            };
            if !entry.is_terminal() {
                tracing::info!(
                    saga_id = %saga_id,
                    state = entry.state_name(),
                    step = %entry.step_name(),
                    "Recovered saga state"
                );
                unfinished.push(saga_id);
            }
            self.set_state(entry);
        }
        Ok(unfinished)
    }

    fn step_name(&self) -> &str {
        self.participant.step_name()
    }

    fn definition(&self, saga_type: &str) -> Option<&(SagaDefinition, usize)> {
        self.definitions.iter().find(|(d, _)| &*d.saga_type == saga_type)
    }

    fn set_state(&self, entry: SagaStateEntry) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(entry.saga_id(), entry);
        }
    }

    fn record(&self, saga_id: SagaId, event: ParticipantEvent) -> Result<(), StoreError> {
        self.journal.append(saga_id, event).map(|_| ())
    }

    async fn publish(
        &self,
        message: SagaEvent,
        cause: &Event,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        ctx.publisher.publish(message.to_event(Some(cause.id))).await?;
        Ok(())
    }

    async fn run_step(
        &self,
        context: SagaContext,
        input: Payload,
        cause: &Event,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let saga_id = context.saga_id;
        let mut executing = match self.state(saga_id) {
            Some(SagaStateEntry::Completed(s)) => {
                tracing::debug!(
                    saga_id = %saga_id,
                    step = %self.step_name(),
                    "Step already completed, republishing result"
                );
                let message = SagaEvent::StepCompleted {
                    context: s.context,
                    output: s.state.output,
                    compensation_data: s.state.compensation_data,
                };
                return self.publish(message, cause, ctx).await;
            }
            Some(SagaStateEntry::Failed(s)) => {
                let message = SagaEvent::StepFailed {
                    context: s.context,
                    reason: s.state.error,
                };
                return self.publish(message, cause, ctx).await;
            }
            Some(entry @ (SagaStateEntry::Compensating(_)
            | SagaStateEntry::Compensated(_)
            | SagaStateEntry::Quarantined(_))) => {
                tracing::debug!(
                    saga_id = %saga_id,
                    state = entry.state_name(),
                    "Ignoring step request during compensation"
                );
                return Ok(());
            }
            Some(SagaStateEntry::Executing(s)) => {
                tracing::info!(
                    saga_id = %saga_id,
                    attempt = s.state.attempt,
                    "Resuming interrupted step"
                );
                s
            }
            Some(SagaStateEntry::Triggered(s)) => self.start_execution(s)?,
            Some(SagaStateEntry::Idle(_)) | None => {
                let now = now_millis();
                self.record(
                    saga_id,
                    ParticipantEvent::StepTriggered {
                        context: context.clone(),
                        triggering_event: cause.id,
                        triggered_at_millis: now,
                    },
                )?;
                let triggered = SagaParticipantState::new(context, now).trigger(cause.id, now);
                self.start_execution(triggered)?
            }
        };

        let policy = self.participant.retry_policy();
        let timeout = self.participant.step_timeout();
        loop {
            self.set_state(SagaStateEntry::Executing(executing.clone()));
            self.observer.on_step_started(&executing.context, self.step_name());

            let started = now_millis();
            let execution = self.participant.execute_step(&executing.context, &input);
            let result = tokio::time::timeout(timeout, execution)
                .await
                .unwrap_or_else(|_| {
                    Err(StepError::Retriable {
                        reason: format!("step timed out after {timeout:?}").into(),
                    })
                });

            match result {
                Ok(step_output) => {
                    let now = now_millis();
                    self.record(
                        saga_id,
                        ParticipantEvent::StepExecutionCompleted {
                            output: step_output.output.clone(),
                            compensation_data: step_output.compensation_data.clone(),
                            completed_at_millis: now,
                        },
                    )?;
                    let completed =
                        executing.complete(step_output.output, step_output.compensation_data, now);
                    self.set_state(SagaStateEntry::Completed(completed.clone()));
                    self.observer.on_step_completed(
                        &completed.context,
                        self.step_name(),
                        now.saturating_sub(started),
                    );

                    let message = SagaEvent::StepCompleted {
                        context: completed.context,
                        output: completed.state.output,
                        compensation_data: completed.state.compensation_data,
                    };
                    return self.publish(message, cause, ctx).await;
                }
                Err(error)
                    if error.is_retriable()
                        && policy.has_attempts_remaining(executing.state.attempt) =>
                {
                    let delay = policy.delay_for_attempt(executing.state.attempt);
                    tracing::warn!(
                        saga_id = %saga_id,
                        step = %self.step_name(),
                        attempt = executing.state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.reason(),
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;

                    executing = executing.retry(now_millis());
                    self.record(
                        saga_id,
                        ParticipantEvent::StepExecutionStarted {
                            attempt: executing.state.attempt,
                            started_at_millis: executing.state.started_at_millis,
                        },
                    )?;
                }
                Err(error) => {
                    let now = now_millis();
                    let reason: Box<str> = error.reason().into();
                    self.record(
                        saga_id,
                        ParticipantEvent::StepExecutionFailed {
                            error: reason.clone(),
                            failed_at_millis: now,
                        },
                    )?;
                    let failed = executing.fail(reason.clone(), now);
                    self.set_state(SagaStateEntry::Failed(failed.clone()));
                    self.observer.on_step_failed(&failed.context, self.step_name(), &reason);

                    let message = SagaEvent::StepFailed {
                        context: failed.context,
                        reason,
                    };
                    return self.publish(message, cause, ctx).await;
                }
            }
        }
    }

    fn start_execution(
        &self,
        triggered: SagaParticipantState<Triggered>,
    ) -> Result<SagaParticipantState<Executing>, StoreError> {
        let executing = triggered.start_execution(now_millis());
        self.record(
            executing.saga_id(),
            ParticipantEvent::StepExecutionStarted {
                attempt: executing.state.attempt,
                started_at_millis: executing.state.started_at_millis,
            },
        )?;
        Ok(executing)
    }

    async fn run_compensation(
        &self,
        context: SagaContext,
        provided: Option<Payload>,
        cause: &Event,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let saga_id = context.saga_id;
        let mut compensating = match (self.state(saga_id), provided) {
            (Some(SagaStateEntry::Completed(s)), _) => self.start_compensation(s)?,
            (Some(SagaStateEntry::Compensating(s)), _) => {
                tracing::info!(
                    saga_id = %saga_id,
                    attempt = s.state.attempt,
                    "Resuming interrupted compensation"
                );
                s
            }
            (Some(SagaStateEntry::Compensated(s)), _) => {
                let message = SagaEvent::StepCompensated { context: s.context };
                return self.publish(message, cause, ctx).await;
            }
            (Some(SagaStateEntry::Quarantined(s)), _) => {
                let message = SagaEvent::CompensationFailed {
                    context: s.context,
                    reason: s.state.reason,
                };
                return self.publish(message, cause, ctx).await;
            }
            (None, Some(data)) => {
                tracing::warn!(
                    saga_id = %saga_id,
                    step = %self.step_name(),
                    "No local record of the step, compensating from coordinator data"
                );
                let record = SagaParticipantState::from_record(context, data, now_millis());
                self.start_compensation(record)?
            }
            (entry, _) => {
                tracing::warn!(
                    saga_id = %saga_id,
                    step = %self.step_name(),
                    state = entry.as_ref().map(SagaStateEntry::state_name).unwrap_or("unknown"),
                    "Compensation requested for a step that never completed"
                );
                return Ok(());
            }
        };

        let timeout = self.participant.step_timeout();
        loop {
            self.set_state(SagaStateEntry::Compensating(compensating.clone()));
            self.observer.on_compensation_started(&compensating.context, self.step_name());

            let result = tokio::time::timeout(
                timeout,
                self.participant
                    .compensate_step(&compensating.context, &compensating.state.compensation_data),
            )
            .await
            .unwrap_or_else(|_| {
                Err(CompensationError::Ambiguous {
                    reason: format!("compensation timed out after {timeout:?}").into(),
                })
            });

            let error = match result {
                Ok(()) => {
                    let now = now_millis();
                    self.record(
                        saga_id,
                        ParticipantEvent::CompensationCompleted {
                            completed_at_millis: now,
                        },
                    )?;
                    let compensated = compensating.complete_compensation(now);
                    self.set_state(SagaStateEntry::Compensated(compensated.clone()));
                    self.observer
                        .on_compensation_completed(&compensated.context, self.step_name());
                    let message = SagaEvent::StepCompensated {
                        context: compensated.context,
                    };
                    return self.publish(message, cause, ctx).await;
                }
                Err(error) => error,
            };

            self.record(
                saga_id,
                ParticipantEvent::CompensationFailed {
                    error: error.reason().into(),
                    is_ambiguous: error.is_ambiguous(),
                    failed_at_millis: now_millis(),
                },
            )?;

            let attempt = compensating.state.attempt;
            if error.is_safe_to_retry() && self.compensation_retry.has_attempts_remaining(attempt) {
                let delay = self.compensation_retry.delay_for_attempt(attempt);
                tracing::warn!(
                    saga_id = %saga_id,
                    step = %self.step_name(),
                    attempt,
                    error = %error.reason(),
                    "Compensation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                compensating = compensating.retry(now_millis());
                self.record(
                    saga_id,
                    ParticipantEvent::CompensationStarted {
                        attempt: compensating.state.attempt,
                        started_at_millis: compensating.state.started_at_millis,
                    },
                )?;
                continue;
            }

            let now = now_millis();
            let reason: Box<str> = error.reason().into();
            self.record(
                saga_id,
                ParticipantEvent::Quarantined {
                    reason: reason.clone(),
                    quarantined_at_millis: now,
                },
            )?;
            let quarantined = compensating.quarantine(reason.clone(), now);
            self.set_state(SagaStateEntry::Quarantined(quarantined.clone()));
            self.observer
                .on_saga_quarantined(&quarantined.context, self.step_name(), &reason);

            let message = SagaEvent::CompensationFailed {
                context: quarantined.context,
                reason,
            };
            return self.publish(message, cause, ctx).await;
        }
    }

    fn start_compensation(
        &self,
        completed: SagaParticipantState<Completed>,
    ) -> Result<SagaParticipantState<Compensating>, StoreError> {
        let compensating = completed.start_compensation(now_millis());
        self.record(
            compensating.saga_id(),
            ParticipantEvent::CompensationStarted {
                attempt: compensating.state.attempt,
                started_at_millis: compensating.state.started_at_millis,
            },
        )?;
        Ok(compensating)
    }

    /// Drop local state once the saga has ended
    fn release(&self, saga_id: SagaId) -> Result<(), StoreError> {
        let removed = self.states.lock().map_err(StoreError::poisoned)?.remove(&saga_id);
        if let Some(entry) = removed {
            tracing::debug!(saga_id = %saga_id, state = entry.state_name(), "Released saga state");
        }
        self.journal.discard(saga_id)
    }

    async fn on_trigger(&self, event: &Event, ctx: &HandlerContext) -> Result<(), HandlerError> {
        for (definition, index) in &self.definitions {
            let starts_here = definition.style == SagaStyle::Choreography
                && *index == 0
                && *definition.trigger_event_type == *event.event_type;
            if !starts_here {
                continue;
            }
            let context = SagaContext::start(
                SagaId::for_trigger(&definition.saga_type, event.id),
                &definition.saga_type,
                self.step_name(),
                &event.correlation_id,
                event.produced_at_millis,
            );
            self.run_step(context, event.payload.clone(), event, ctx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<P: SagaParticipant> EventHandler for StepParticipant<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn interests(&self) -> Vec<SchemaInterest> {
        let mut protocol = BTreeSet::from([saga_types::SAGA_COMPLETED, saga_types::SAGA_FAILED]);
        let mut triggers = BTreeSet::new();
        for (definition, index) in &self.definitions {
            match definition.style {
                SagaStyle::Orchestration => {
                    protocol.insert(saga_types::STEP_REQUESTED);
                    protocol.insert(saga_types::COMPENSATION_REQUESTED);
                }
                SagaStyle::Choreography => {
                    if *index == 0 {
                        triggers.insert(&*definition.trigger_event_type);
                    } else {
                        protocol.insert(saga_types::STEP_COMPLETED);
                    }
                    if *index < definition.last_index() {
                        protocol.insert(saga_types::STEP_FAILED);
                        protocol.insert(saga_types::STEP_COMPENSATED);
                    }
                }
            }
        }
        protocol
            .into_iter()
            .map(SchemaInterest::v1)
            .chain(triggers.into_iter().map(|t| SchemaInterest::new(t, 1, u32::MAX)))
            .collect()
    }

    async fn handle(
        &self,
        event: &Event,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        if !SagaEvent::is_saga_event(&event.event_type) {
            self.on_trigger(event, ctx).await?;
            return Ok(HandlerOutcome::done());
        }

        let message = SagaEvent::from_event(event)?;
        let Some((definition, index)) = self.definition(&message.context().saga_type) else {
            return Ok(HandlerOutcome::done());
        };
        let (style, index) = (definition.style, *index);
        let dependency = definition.dependency_of(index);
        let step = self.step_name().to_string();

        match message {
            SagaEvent::StepRequested { context, input }
                if style == SagaStyle::Orchestration && context.step_index == index =>
            {
                self.run_step(context, input, event, ctx).await?;
            }
            SagaEvent::CompensationRequested {
                context,
                compensation_data,
            } if style == SagaStyle::Orchestration && context.step_index == index => {
                self.run_compensation(context, Some(compensation_data), event, ctx).await?;
            }
            SagaEvent::StepCompleted { context, output, .. }
                if style == SagaStyle::Choreography
                    && context.step_index + 1 == index
                    && dependency.is_satisfied_by(&context.step_name) =>
            {
                self.run_step(context.next_step(&step), output, event, ctx).await?;
            }
            SagaEvent::StepFailed { context, .. } | SagaEvent::StepCompensated { context }
                if style == SagaStyle::Choreography && context.step_index == index + 1 =>
            {
                self.run_compensation(context.for_step(index, &step), None, event, ctx).await?;
            }
            SagaEvent::SagaCompleted { context } | SagaEvent::SagaFailed { context, .. } => {
                self.release(context.saga_id)?;
            }
            _ => {}
        }
        Ok(HandlerOutcome::done())
    }
}
