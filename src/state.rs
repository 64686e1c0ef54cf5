//! Typestate states for saga participants

use crate::{EventId, ParticipantEvent, Payload, SagaContext, SagaId};

pub mod markers {
    pub trait StepState: Send + 'static {}
}

// State types
#[derive(Clone, Debug, PartialEq)]
pub struct Idle;
#[derive(Clone, Debug, PartialEq)]
pub struct Triggered {
    pub triggered_at_millis: u64,
    pub triggering_event: EventId,
}
#[derive(Clone, Debug, PartialEq)]
pub struct Executing {
    pub started_at_millis: u64,
    pub attempt: u32,
}
#[derive(Clone, Debug, PartialEq)]
pub struct Completed {
    pub completed_at_millis: u64,
    pub output: Payload,
    pub compensation_data: Payload,
}
#[derive(Clone, Debug, PartialEq)]
pub struct Failed {
    pub failed_at_millis: u64,
    pub error: Box<str>,
}
#[derive(Clone, Debug, PartialEq)]
pub struct Compensating {
    pub started_at_millis: u64,
    pub attempt: u32,
    pub compensation_data: Payload,
}
#[derive(Clone, Debug, PartialEq)]
pub struct Compensated {
    pub completed_at_millis: u64,
}
#[derive(Clone, Debug, PartialEq)]
pub struct Quarantined {
    pub quarantined_at_millis: u64,
    pub reason: Box<str>,
}

impl markers::StepState for Idle {}
impl markers::StepState for Triggered {}
impl markers::StepState for Executing {}
impl markers::StepState for Completed {}
impl markers::StepState for Failed {}
impl markers::StepState for Compensating {}
impl markers::StepState for Compensated {}
impl markers::StepState for Quarantined {}

/// One participant's view of one saga, typed by its current state
#[derive(Clone, Debug, PartialEq)]
pub struct SagaParticipantState<S: markers::StepState> {
    /// Context addressed to this participant's step
    pub context: SagaContext,
    pub last_updated_at_millis: u64,
    pub state: S,
}

impl<S: markers::StepState> SagaParticipantState<S> {
    pub fn saga_id(&self) -> SagaId {
        self.context.saga_id
    }

    fn into_state<T: markers::StepState>(
        self,
        state: T,
        now_millis: u64,
    ) -> SagaParticipantState<T> {
        SagaParticipantState {
            context: self.context,
            last_updated_at_millis: now_millis,
            state,
        }
    }
}

impl SagaParticipantState<Idle> {
    pub fn new(context: SagaContext, now_millis: u64) -> Self {
        Self {
            context,
            last_updated_at_millis: now_millis,
            state: Idle,
        }
    }

    pub fn trigger(
        self,
        triggering_event: EventId,
        now_millis: u64,
    ) -> SagaParticipantState<Triggered> {
        self.into_state(
            Triggered {
                triggered_at_millis: now_millis,
                triggering_event,
            },
            now_millis,
        )
    }
}

impl SagaParticipantState<Triggered> {
    pub fn start_execution(self, now_millis: u64) -> SagaParticipantState<Executing> {
        self.into_state(
            Executing {
                started_at_millis: now_millis,
                attempt: 1,
            },
            now_millis,
        )
    }
}

impl SagaParticipantState<Executing> {
    /// Next execution attempt after a retriable failure
    pub fn retry(self, now_millis: u64) -> SagaParticipantState<Executing> {
        let attempt = self.state.attempt + 1;
        let mut next = self.into_state(
            Executing {
                started_at_millis: now_millis,
                attempt,
            },
            now_millis,
        );
        next.context.attempt = attempt - 1;
        next
    }

    pub fn complete(
        self,
        output: Payload,
        compensation_data: Payload,
        now_millis: u64,
    ) -> SagaParticipantState<Completed> {
        self.into_state(
            Completed {
                completed_at_millis: now_millis,
                output,
                compensation_data,
            },
            now_millis,
        )
    }

    pub fn fail(self, error: Box<str>, now_millis: u64) -> SagaParticipantState<Failed> {
        self.into_state(
            Failed {
                failed_at_millis: now_millis,
                error,
            },
            now_millis,
        )
    }
}

impl SagaParticipantState<Completed> {
    /// A completed step known only from the compensation data handed back
    /// by the coordinator
    pub fn from_record(context: SagaContext, compensation_data: Payload, now_millis: u64) -> Self {
        Self {
            context,
            last_updated_at_millis: now_millis,
            state: Completed {
                completed_at_millis: now_millis,
                output: Payload::new(),
                compensation_data,
            },
        }
    }

    pub fn start_compensation(self, now_millis: u64) -> SagaParticipantState<Compensating> {
        let compensation_data = self.state.compensation_data.clone();
        self.into_state(
            Compensating {
                started_at_millis: now_millis,
                attempt: 1,
                compensation_data,
            },
            now_millis,
        )
    }
}

impl SagaParticipantState<Compensating> {
    pub fn retry(self, now_millis: u64) -> SagaParticipantState<Compensating> {
        let state = Compensating {
            started_at_millis: now_millis,
            attempt: self.state.attempt + 1,
            compensation_data: self.state.compensation_data.clone(),
        };
        self.into_state(state, now_millis)
    }

    pub fn complete_compensation(self, now_millis: u64) -> SagaParticipantState<Compensated> {
        self.into_state(
            Compensated {
                completed_at_millis: now_millis,
            },
            now_millis,
        )
    }

    pub fn quarantine(
        self,
        reason: Box<str>,
        now_millis: u64,
    ) -> SagaParticipantState<Quarantined> {
        self.into_state(
            Quarantined {
                quarantined_at_millis: now_millis,
                reason,
            },
            now_millis,
        )
    }
}

/// Type-erased state entry for HashMap storage
#[derive(Clone, Debug, PartialEq)]
pub enum SagaStateEntry {
    Idle(SagaParticipantState<Idle>),
    Triggered(SagaParticipantState<Triggered>),
    Executing(SagaParticipantState<Executing>),
    Completed(SagaParticipantState<Completed>),
    Failed(SagaParticipantState<Failed>),
    Compensating(SagaParticipantState<Compensating>),
    Compensated(SagaParticipantState<Compensated>),
    Quarantined(SagaParticipantState<Quarantined>),
}

macro_rules! each_state {
    ($entry:expr, $s:ident => $body:expr) => {
        match $entry {
            SagaStateEntry::Idle($s) => $body,
            SagaStateEntry::Triggered($s) => $body,
            SagaStateEntry::Executing($s) => $body,
            SagaStateEntry::Completed($s) => $body,
            SagaStateEntry::Failed($s) => $body,
            SagaStateEntry::Compensating($s) => $body,
            SagaStateEntry::Compensated($s) => $body,
            SagaStateEntry::Quarantined($s) => $body,
        }
    };
}

impl SagaStateEntry {
    pub fn saga_id(&self) -> SagaId {
        each_state!(self, s => s.context.saga_id)
    }

    pub fn context(&self) -> &SagaContext {
        each_state!(self, s => &s.context)
    }

    pub fn last_updated_at_millis(&self) -> u64 {
        each_state!(self, s => s.last_updated_at_millis)
    }

    pub fn step_name(&self) -> &str {
        &self.context().step_name
    }

    /// Nothing is left for this participant to do in the saga
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Compensated(_) | Self::Quarantined(_))
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Idle(_) => "idle",
            Self::Triggered(_) => "triggered",
            Self::Executing(_) => "executing",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Compensating(_) => "compensating",
            Self::Compensated(_) => "compensated",
            Self::Quarantined(_) => "quarantined",
        }
    }

    /// Apply a journaled event; events that do not fit the current state
    /// leave it unchanged
    pub fn apply(self, event: &ParticipantEvent, at_millis: u64) -> SagaStateEntry {
        match (self, event) {
            (Self::Idle(s), ParticipantEvent::StepTriggered { triggering_event, .. }) => {
                Self::Triggered(s.trigger(*triggering_event, at_millis))
            }
            (Self::Triggered(s), ParticipantEvent::StepExecutionStarted { attempt, .. }) => {
                let mut executing = s.start_execution(at_millis);
                executing.state.attempt = *attempt;
                Self::Executing(executing)
            }
            (Self::Executing(mut s), ParticipantEvent::StepExecutionStarted { attempt, .. }) => {
                s.state.attempt = *attempt;
                s.last_updated_at_millis = at_millis;
                Self::Executing(s)
            }
            (
                Self::Executing(s),
                ParticipantEvent::StepExecutionCompleted {
                    output,
                    compensation_data,
                    ..
                },
            ) => Self::Completed(s.complete(output.clone(), compensation_data.clone(), at_millis)),
            (Self::Executing(s), ParticipantEvent::StepExecutionFailed { error, .. }) => {
                Self::Failed(s.fail(error.clone(), at_millis))
            }
            (Self::Completed(s), ParticipantEvent::CompensationStarted { attempt, .. }) => {
                let mut compensating = s.start_compensation(at_millis);
                compensating.state.attempt = *attempt;
                Self::Compensating(compensating)
            }
            (Self::Compensating(mut s), ParticipantEvent::CompensationStarted { attempt, .. }) => {
                s.state.attempt = *attempt;
                s.last_updated_at_millis = at_millis;
                Self::Compensating(s)
            }
            (Self::Compensating(s), ParticipantEvent::CompensationCompleted { .. }) => {
                Self::Compensated(s.complete_compensation(at_millis))
            }
            (Self::Compensating(s), ParticipantEvent::Quarantined { reason, .. }) => {
                Self::Quarantined(s.quarantine(reason.clone(), at_millis))
            }
            (entry, _) => entry,
        }
    }
}
