//! Saga coordinator: owns saga instances and drives or tracks their steps

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::events::saga_types;
use crate::handler::{EventHandler, HandlerContext, HandlerOutcome};
use crate::observer::{SagaObserver, TracingObserver};
use crate::saga::{
    InMemorySagaStore, Next, SagaDefinition, SagaError, SagaInstance, SagaStore, SagaStyle,
};
use crate::schema::SchemaInterest;
use crate::{now_millis, Event, HandlerError, Payload, SagaContext, SagaEvent, SagaId, StoreError};

/// Tracks every saga instance of the registered definitions.
///
/// Under orchestration the coordinator requests each step and each
/// compensation. Under choreography participants chain themselves and the
/// coordinator only records progress. Under both styles it announces the
/// saga's end with `SagaCompleted` or `SagaFailed`.
///
/// Follow-up messages are published before the updated instance is stored.
/// A crash in between replays the transition on redelivery, and the
/// re-emitted messages carry the same derived ids.
pub struct SagaCoordinator {
    name: Box<str>,
    definitions: HashMap<Box<str>, SagaDefinition>,
    /// Trigger event type -> saga types it starts
    triggers: HashMap<Box<str>, Vec<Box<str>>>,
    store: Arc<dyn SagaStore>,
    observer: Arc<dyn SagaObserver>,
}

impl SagaCoordinator {
    pub fn new(definitions: impl IntoIterator<Item = SagaDefinition>) -> Self {
        let mut triggers: HashMap<Box<str>, Vec<Box<str>>> = HashMap::new();
        let definitions: HashMap<Box<str>, SagaDefinition> = definitions
            .into_iter()
            .map(|d| (d.saga_type.clone(), d))
            .collect();
        for definition in definitions.values() {
            triggers
                .entry(definition.trigger_event_type.clone())
                .or_default()
                .push(definition.saga_type.clone());
        }

        Self {
            name: "saga-coordinator".into(),
            definitions,
            triggers,
            store: Arc::new(InMemorySagaStore::new()),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SagaStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SagaObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn instance(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError> {
        self.store.get(saga_id)
    }

    /// Saga started by `trigger`, if any
    pub fn instance_for_trigger(
        &self,
        saga_type: &str,
        trigger: &Event,
    ) -> Result<Option<SagaInstance>, StoreError> {
        self.store.get(SagaId::for_trigger(saga_type, trigger.id))
    }

    /// Sagas frozen in COMPENSATING after a compensation failure
    pub fn awaiting_intervention(&self) -> Result<Vec<SagaInstance>, StoreError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(SagaInstance::needs_intervention)
            .collect())
    }

    async fn start(
        &self,
        definition: &SagaDefinition,
        trigger: &Event,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let saga_id = SagaId::for_trigger(&definition.saga_type, trigger.id);
        if let Some(existing) = self.store.get(saga_id)? {
            tracing::debug!(saga_id = %saga_id, state = %existing.state, "Saga already started");
            return Ok(());
        }

        let first_step = definition.step(0).unwrap_or_default();
        let context = SagaContext::start(
            saga_id,
            &definition.saga_type,
            first_step,
            &trigger.correlation_id,
            trigger.produced_at_millis,
        );
        let mut instance = SagaInstance::new(definition, &context, now_millis());
        self.observer.on_saga_started(&context);

        if definition.style == SagaStyle::Orchestration {
            instance.begin(now_millis()).map_err(HandlerError::logic)?;
            let request = SagaEvent::StepRequested {
                context,
                input: trigger.payload.clone(),
            };
            ctx.publisher.publish(request.to_event(Some(trigger.id))).await?;
        }
        self.store.put(instance)?;
        Ok(())
    }

    async fn advance(
        &self,
        message: SagaEvent,
        cause: &Event,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let context = message.context().clone();
        let Some(definition) = self.definitions.get(&context.saga_type) else {
            tracing::debug!(saga_type = %context.saga_type, "No definition for saga type");
            return Ok(());
        };

        let mut instance = match self.store.get(context.saga_id)? {
            Some(instance) => instance,
            None => {
                self.observer.on_saga_started(&context);
                SagaInstance::new(definition, &context, now_millis())
            }
        };

        let now = now_millis();
        let index = context.step_index;
        let (transition, input) = match &message {
            SagaEvent::StepCompleted {
                output,
                compensation_data,
                ..
            } => (
                instance
                    .record_step_completed(index, compensation_data.clone(), now)
                    .map(Some),
                output.clone(),
            ),
            SagaEvent::StepFailed { reason, .. } => {
                (instance.record_step_failed(index, reason, now).map(Some), Payload::new())
            }
            SagaEvent::StepCompensated { .. } => {
                (instance.record_compensated(index, now).map(Some), Payload::new())
            }
            SagaEvent::CompensationFailed { reason, .. } => {
                let frozen = instance.record_compensation_failure(index, reason, now);
                if frozen.is_ok() {
                    self.observer
                        .on_manual_intervention(&context, &context.step_name, reason);
                }
                (frozen.map(|_| None), Payload::new())
            }
            _ => return Ok(()),
        };

        let next = match transition {
            Ok(next) => next,
            Err(SagaError::Store(e)) => return Err(e.into()),
            Err(error) => {
                tracing::debug!(saga_id = %context.saga_id, %error, "Ignoring saga message");
                return Ok(());
            }
        };

        if let Some(next) = next {
            self.emit(definition.style, &instance, next, input, cause, ctx).await?;
        }
        self.store.put(instance)?;
        Ok(())
    }

    async fn emit(
        &self,
        style: SagaStyle,
        instance: &SagaInstance,
        next: Next,
        input: Payload,
        cause: &Event,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let message = match next {
            Next::Step(index) if style == SagaStyle::Orchestration => SagaEvent::StepRequested {
                context: instance.context_for(index),
                input,
            },
            Next::Compensate {
                step_index,
                compensation_data,
                ..
            } if style == SagaStyle::Orchestration => SagaEvent::CompensationRequested {
                context: instance.context_for(step_index),
                compensation_data,
            },
            Next::Step(_) | Next::Compensate { .. } => return Ok(()),
            Next::Completed => {
                let context = instance.context_for(instance.steps.len().saturating_sub(1));
                self.observer.on_saga_completed(&context);
                SagaEvent::SagaCompleted { context }
            }
            Next::Failed => {
                let (index, reason) = instance
                    .failure
                    .as_ref()
                    .map(|f| (f.step_index, f.reason.clone()))
                    .unwrap_or_else(|| (0, "saga failed".into()));
                let context = instance.context_for(index);
                self.observer.on_saga_failed(&context, &reason);
                SagaEvent::SagaFailed { context, reason }
            }
        };
        ctx.publisher.publish(message.to_event(Some(cause.id))).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SagaCoordinator {
    fn name(&self) -> &str {
        &self.name
    }

    fn interests(&self) -> Vec<SchemaInterest> {
        let triggers: BTreeSet<&str> = self.triggers.keys().map(|t| &**t).collect();
        [
            saga_types::STEP_COMPLETED,
            saga_types::STEP_FAILED,
            saga_types::STEP_COMPENSATED,
            saga_types::COMPENSATION_FAILED,
        ]
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
        if SagaEvent::is_saga_event(&event.event_type) {
            let message = SagaEvent::from_event(event)?;
            self.advance(message, event, ctx).await?;
            return Ok(HandlerOutcome::done());
        }

        let saga_types = self.triggers.get(event.event_type.as_str()).cloned().unwrap_or_default();
        for saga_type in saga_types {
            if let Some(definition) = self.definitions.get(&saga_type) {
                self.start(definition, event, ctx).await?;
            }
        }
        Ok(HandlerOutcome::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EventLogClient, InMemoryEventLog};
    use crate::observer::NoOpObserver;
    use crate::saga::SagaState;
    use crate::{ConsumerId, PartitionId, Position};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        log: Arc<InMemoryEventLog>,
        ctx: HandlerContext,
    }

    impl Harness {
        fn new() -> Self {
            let log = Arc::new(InMemoryEventLog::new(1));
            let client = Arc::new(EventLogClient::new(log.clone()));
            Self {
                log,
                ctx: HandlerContext {
                    consumer_id: ConsumerId::new("coordinator", "saga-coordinator"),
                    partition: PartitionId(0),
                    position: Position::START,
                    attempt: 1,
                    publisher: client,
                },
            }
        }

        /// Protocol messages published so far, in order
        async fn published(&self) -> Vec<SagaEvent> {
            let client = EventLogClient::new(self.log.clone());
            let mut cursor = client.read_from(PartitionId(0), Position::START);
            let mut messages = Vec::new();
            for _ in 0..self.log.total_len() {
                let (_, event) = cursor.next().await.unwrap();
                messages.push(SagaEvent::from_event(&event).unwrap());
            }
            messages
        }
    }

    fn booking(style: SagaStyle) -> SagaDefinition {
        SagaDefinition::new(
            "appointment_booking",
            "appointment.requested",
            &["reserve_slot", "charge_payment", "confirm_appointment"],
            style,
        )
    }

    fn trigger() -> Event {
        Event::builder("appointment.requested", "appt-7")
            .field("patient_id", "p-1")
            .build()
    }

    fn completed(context: SagaContext, key: &str) -> Event {
        SagaEvent::StepCompleted {
            output: Payload::new().with(key, "v"),
            compensation_data: Payload::new().with(key, "v"),
            context,
        }
        .to_event(None)
    }

    #[tokio::test]
    async fn orchestrated_failure_compensates_and_fails() {
        let h = Harness::new();
        let coordinator = SagaCoordinator::new([booking(SagaStyle::Orchestration)]);
        let trigger = trigger();

        coordinator.handle(&trigger, &h.ctx).await.unwrap();
        let instance = coordinator
            .instance_for_trigger("appointment_booking", &trigger)
            .unwrap()
            .unwrap();
        assert_eq!(instance.state, SagaState::Step(0));

        coordinator
            .handle(&completed(instance.context_for(0), "slot_id"), &h.ctx)
            .await
            .unwrap();
        let failure = SagaEvent::StepFailed {
            context: instance.context_for(1),
            reason: "card declined".into(),
        };
        coordinator.handle(&failure.to_event(None), &h.ctx).await.unwrap();
        let compensated = SagaEvent::StepCompensated {
            context: instance.context_for(0),
        };
        coordinator.handle(&compensated.to_event(None), &h.ctx).await.unwrap();

        let messages = h.published().await;
        assert!(matches!(&messages[0], SagaEvent::StepRequested { context, input }
            if context.step_index == 0 && input.text("patient_id") == Some("p-1")));
        assert!(matches!(&messages[1], SagaEvent::StepRequested { context, input }
            if context.step_index == 1 && input.text("slot_id") == Some("v")));
        assert!(matches!(&messages[2],
            SagaEvent::CompensationRequested { context, compensation_data }
            if context.step_index == 0 && compensation_data.text("slot_id") == Some("v")));
        assert!(matches!(&messages[3], SagaEvent::SagaFailed { reason, .. }
            if &**reason == "card declined"));
        assert_eq!(messages.len(), 4);

        let instance = coordinator.instance(instance.saga_id).unwrap().unwrap();
        assert_eq!(instance.state, SagaState::Failed);
        assert_eq!(instance.compensated_steps().collect::<Vec<_>>(), vec![0]);
    }

    #[tokio::test]
    async fn redelivered_trigger_and_stale_messages_are_ignored() {
        let h = Harness::new();
        let coordinator = SagaCoordinator::new([booking(SagaStyle::Orchestration)]);
        let trigger = trigger();

        coordinator.handle(&trigger, &h.ctx).await.unwrap();
        coordinator.handle(&trigger, &h.ctx).await.unwrap();
        let instance = coordinator
            .instance_for_trigger("appointment_booking", &trigger)
            .unwrap()
            .unwrap();

        let step0 = completed(instance.context_for(0), "slot_id");
        coordinator.handle(&step0, &h.ctx).await.unwrap();
        coordinator.handle(&step0, &h.ctx).await.unwrap();

        assert_eq!(h.published().await.len(), 2);
        let instance = coordinator.instance(instance.saga_id).unwrap().unwrap();
        assert_eq!(instance.state, SagaState::Step(1));
    }

    #[tokio::test]
    async fn choreographed_saga_is_tracked_without_requests() {
        let h = Harness::new();
        let coordinator = SagaCoordinator::new([booking(SagaStyle::Choreography)]);
        let trigger = trigger();
        let saga_id = SagaId::for_trigger("appointment_booking", trigger.id);
        let context = SagaContext::start(
            saga_id,
            "appointment_booking",
            "reserve_slot",
            &trigger.correlation_id,
            trigger.produced_at_millis,
        );

        // Step completion may overtake the trigger
        coordinator.handle(&completed(context.clone(), "slot_id"), &h.ctx).await.unwrap();
        coordinator.handle(&trigger, &h.ctx).await.unwrap();
        let step1 = context.next_step("charge_payment");
        coordinator.handle(&completed(step1.clone(), "charge_id"), &h.ctx).await.unwrap();
        let step2 = step1.next_step("confirm_appointment");
        coordinator.handle(&completed(step2, "confirmation"), &h.ctx).await.unwrap();

        let messages = h.published().await;
        assert!(matches!(messages.as_slice(), [SagaEvent::SagaCompleted { .. }]));
        assert_eq!(coordinator.instance(saga_id).unwrap().unwrap().state, SagaState::Completed);
    }

    struct Alerts(AtomicU32);

    impl SagaObserver for Alerts {
        fn on_manual_intervention(&self, _context: &SagaContext, _step: &str, _reason: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn compensation_failure_freezes_saga() {
        let h = Harness::new();
        let alerts = Arc::new(Alerts(AtomicU32::new(0)));
        let coordinator =
            SagaCoordinator::new([booking(SagaStyle::Orchestration)]).with_observer(alerts.clone());
        let trigger = trigger();

        coordinator.handle(&trigger, &h.ctx).await.unwrap();
        let instance = coordinator
            .instance_for_trigger("appointment_booking", &trigger)
            .unwrap()
            .unwrap();
        coordinator
            .handle(&completed(instance.context_for(0), "slot_id"), &h.ctx)
            .await
            .unwrap();
        let failure = SagaEvent::StepFailed {
            context: instance.context_for(1),
            reason: "card declined".into(),
        };
        coordinator.handle(&failure.to_event(None), &h.ctx).await.unwrap();
        let stuck = SagaEvent::CompensationFailed {
            context: instance.context_for(0),
            reason: "slot service rejected release".into(),
        };
        coordinator.handle(&stuck.to_event(None), &h.ctx).await.unwrap();
        // Late success report does not unfreeze it
        let late = SagaEvent::StepCompensated {
            context: instance.context_for(0),
        };
        coordinator.handle(&late.to_event(None), &h.ctx).await.unwrap();

        assert_eq!(alerts.0.load(Ordering::SeqCst), 1);
        let frozen = coordinator.awaiting_intervention().unwrap();
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].state, SagaState::Compensating);
        assert!(!h
            .published()
            .await
            .iter()
            .any(|m| matches!(m, SagaEvent::SagaFailed { .. })));
    }

    #[test]
    fn interests_cover_triggers_and_outcomes() {
        let coordinator = SagaCoordinator::new([booking(SagaStyle::Choreography)])
            .with_observer(Arc::new(NoOpObserver));
        let types: Vec<String> =
            coordinator.interests().into_iter().map(|i| i.event_type).collect();
        assert!(types.contains(&"appointment.requested".to_string()));
        assert!(types.contains(&saga_types::COMPENSATION_FAILED.to_string()));
        assert!(!types.contains(&saga_types::STEP_REQUESTED.to_string()));
    }
}
