//! Appointment booking across three services, run as a saga under both
//! coordination styles.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clinic_event_core::{
    CompensationError, CoreRuntime, Event, HandlerRegistry, Payload, SagaContext, SagaCoordinator,
    SagaDefinition, SagaInstance, SagaObserver, SagaParticipant, SagaState, SagaStateEntry,
    SagaStyle, StepError, StepOutput, StepParticipant,
};
use common::{wait_until, Cluster};

const BOOKING: &str = "appointment_booking";

fn booking(style: SagaStyle) -> SagaDefinition {
    SagaDefinition::new(
        BOOKING,
        "appointment.requested",
        &["reserve_slot", "charge_payment", "confirm_appointment"],
        style,
    )
}

#[derive(Default)]
struct SlotCalendar {
    reserved: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    refuse_release: bool,
}

#[async_trait]
impl SagaParticipant for SlotCalendar {
    fn step_name(&self) -> &str {
        "reserve_slot"
    }

    fn saga_types(&self) -> &[&'static str] {
        &[BOOKING]
    }

    async fn execute_step(
        &self,
        _context: &SagaContext,
        input: &Payload,
    ) -> Result<StepOutput, StepError> {
        let slot = input.text("slot").ok_or(StepError::Terminal {
            reason: "no slot requested".into(),
        })?;
        self.reserved.lock().unwrap().push(slot.to_string());
        Ok(StepOutput::new(
            Payload::new().with("slot_id", slot).with("amount", 40i64),
            Payload::new().with("slot_id", slot),
        ))
    }

    async fn compensate_step(
        &self,
        _context: &SagaContext,
        data: &Payload,
    ) -> Result<(), CompensationError> {
        if self.refuse_release {
            return Err(CompensationError::Terminal {
                reason: "slot already handed to another patient".into(),
            });
        }
        let slot = data.text("slot_id").unwrap_or_default();
        self.released.lock().unwrap().push(slot.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct Billing {
    decline: bool,
    charges: AtomicU32,
}

#[async_trait]
impl SagaParticipant for Billing {
    fn step_name(&self) -> &str {
        "charge_payment"
    }

    fn saga_types(&self) -> &[&'static str] {
        &[BOOKING]
    }

    async fn execute_step(
        &self,
        _context: &SagaContext,
        input: &Payload,
    ) -> Result<StepOutput, StepError> {
        self.charges.fetch_add(1, Ordering::SeqCst);
        if self.decline {
            return Err(StepError::Terminal {
                reason: "card declined".into(),
            });
        }
        let amount = input.int("amount").unwrap_or_default();
        Ok(StepOutput::new(
            Payload::new().with("charge_id", "ch-1"),
            Payload::new().with("charge_id", "ch-1").with("amount", amount),
        ))
    }

    async fn compensate_step(
        &self,
        _context: &SagaContext,
        _data: &Payload,
    ) -> Result<(), CompensationError> {
        Ok(())
    }
}

#[derive(Default)]
struct Confirmations {
    confirmed: AtomicU32,
}

#[async_trait]
impl SagaParticipant for Confirmations {
    fn step_name(&self) -> &str {
        "confirm_appointment"
    }

    fn saga_types(&self) -> &[&'static str] {
        &[BOOKING]
    }

    async fn execute_step(
        &self,
        _context: &SagaContext,
        _input: &Payload,
    ) -> Result<StepOutput, StepError> {
        self.confirmed.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutput::new(Payload::new(), Payload::new()))
    }

    async fn compensate_step(
        &self,
        _context: &SagaContext,
        _data: &Payload,
    ) -> Result<(), CompensationError> {
        Ok(())
    }
}

/// Counts operator alerts
#[derive(Default)]
struct Alerts {
    raised: Mutex<Vec<String>>,
}

impl SagaObserver for Alerts {
    fn on_manual_intervention(&self, _context: &SagaContext, step: &str, _reason: &str) {
        self.raised.lock().unwrap().push(step.to_string());
    }
}

/// Three services and a coordinator, each in its own consumer group
struct Clinic {
    cluster: Cluster,
    runtime: CoreRuntime,
    coordinator: Arc<SagaCoordinator>,
    slots: Arc<StepParticipant<SlotCalendar>>,
    billing: Arc<StepParticipant<Billing>>,
    confirmations: Arc<StepParticipant<Confirmations>>,
    alerts: Arc<Alerts>,
}

impl Clinic {
    fn start(style: SagaStyle, slots: SlotCalendar, billing: Billing) -> Self {
        let cluster = Cluster::new(4);
        let ctx = cluster.ctx.clone();
        let mut runtime = CoreRuntime::new(ctx.clone());
        let alerts = Arc::new(Alerts::default());

        let coordinator =
            Arc::new(SagaCoordinator::new([booking(style)]).with_observer(alerts.clone()));
        let slots = Arc::new(ctx.participant(slots, [booking(style)]));
        let billing = Arc::new(ctx.participant(billing, [booking(style)]));
        let confirmations = Arc::new(ctx.participant(Confirmations::default(), [booking(style)]));

        let groups = [
            ("saga-coordinator", HandlerRegistry::new().with(coordinator.clone())),
            ("scheduling", HandlerRegistry::new().with(slots.clone())),
            ("billing", HandlerRegistry::new().with(billing.clone())),
            ("front-desk", HandlerRegistry::new().with(confirmations.clone())),
        ];
        for (group, registry) in groups {
            runtime.spawn_consumer(group, registry.unwrap());
        }

        Self {
            cluster,
            runtime,
            coordinator,
            slots,
            billing,
            confirmations,
            alerts,
        }
    }

    async fn request_appointment(&self) -> Event {
        let trigger = Event::builder("appointment.requested", "appt-42")
            .field("patient_id", "p-1")
            .field("slot", "mon-9am")
            .build();
        self.cluster.ctx.client.append(&trigger).await.unwrap();
        trigger
    }

    fn saga(&self, trigger: &Event) -> Option<SagaInstance> {
        self.coordinator.instance_for_trigger(BOOKING, trigger).unwrap()
    }

    async fn wait_for_state(&self, trigger: &Event, state: SagaState) -> SagaInstance {
        wait_until("saga state", || self.saga(trigger).is_some_and(|s| s.state == state)).await;
        self.saga(trigger).unwrap()
    }
}

async fn declined_payment_releases_the_slot(style: SagaStyle) {
    let billing = Billing {
        decline: true,
        ..Billing::default()
    };
    let clinic = Clinic::start(style, SlotCalendar::default(), billing);
    let trigger = clinic.request_appointment().await;

    let saga = clinic.wait_for_state(&trigger, SagaState::Failed).await;

    assert_eq!(*clinic.slots.participant().reserved.lock().unwrap(), vec!["mon-9am"]);
    assert_eq!(*clinic.slots.participant().released.lock().unwrap(), vec!["mon-9am"]);
    assert_eq!(clinic.billing.participant().charges.load(Ordering::SeqCst), 1);
    assert_eq!(clinic.confirmations.participant().confirmed.load(Ordering::SeqCst), 0);

    let failure = saga.failure.clone().unwrap();
    assert_eq!(&*failure.step_name, "charge_payment");
    assert_eq!(&*failure.reason, "card declined");
    assert_eq!(saga.compensated_steps().collect::<Vec<_>>(), vec![0]);
    assert!(saga.compensation_failure.is_none());
    assert!(clinic.alerts.raised.lock().unwrap().is_empty());

    clinic.runtime.shutdown().await;
}

#[tokio::test]
async fn orchestrated_booking_compensates_declined_payment() {
    declined_payment_releases_the_slot(SagaStyle::Orchestration).await;
}

#[tokio::test]
async fn choreographed_booking_compensates_declined_payment() {
    declined_payment_releases_the_slot(SagaStyle::Choreography).await;
}

#[tokio::test]
async fn orchestrated_booking_completes() {
    let clinic =
        Clinic::start(SagaStyle::Orchestration, SlotCalendar::default(), Billing::default());
    let trigger = clinic.request_appointment().await;

    let saga = clinic.wait_for_state(&trigger, SagaState::Completed).await;

    assert_eq!(saga.completed_steps().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(clinic.confirmations.participant().confirmed.load(Ordering::SeqCst), 1);
    assert!(clinic.slots.participant().released.lock().unwrap().is_empty());
    // Participants drop their saga data once the outcome is announced
    wait_until("participants released", || clinic.slots.active_sagas().is_empty()).await;

    clinic.runtime.shutdown().await;
}

#[tokio::test]
async fn failed_compensation_freezes_the_saga_for_an_operator() {
    let slots = SlotCalendar {
        refuse_release: true,
        ..SlotCalendar::default()
    };
    let billing = Billing {
        decline: true,
        ..Billing::default()
    };
    let clinic = Clinic::start(SagaStyle::Orchestration, slots, billing);
    let trigger = clinic.request_appointment().await;

    wait_until("operator alert", || {
        !clinic.alerts.raised.lock().unwrap().is_empty()
            && clinic.coordinator.awaiting_intervention().unwrap().len() == 1
    })
    .await;

    let saga = clinic.saga(&trigger).unwrap();
    assert_eq!(saga.state, SagaState::Compensating);
    assert!(saga.needs_intervention());
    let stuck = saga.compensation_failure.clone().unwrap();
    assert_eq!(&*stuck.step_name, "reserve_slot");
    assert_eq!(*clinic.alerts.raised.lock().unwrap(), vec!["reserve_slot"]);

    let awaiting = clinic.coordinator.awaiting_intervention().unwrap();
    assert_eq!(awaiting.len(), 1);
    assert_eq!(awaiting[0].saga_id, saga.saga_id);
    assert!(matches!(clinic.slots.state(saga.saga_id), Some(SagaStateEntry::Quarantined(_))));

    clinic.runtime.shutdown().await;
}
