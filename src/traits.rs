//! Core traits for saga participants

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{CompensationError, Payload, SagaContext, StepError, StepOutput};

/// A service taking part in sagas by owning exactly one step.
///
/// The participant is wrapped in a [`StepParticipant`](crate::StepParticipant),
/// which subscribes it to the saga protocol, runs its step and compensation
/// with retries, and keeps its per-saga state.
///
/// # Example
///
/// ```rust,ignore
/// #[async_trait]
/// impl SagaParticipant for SlotService {
///     fn step_name(&self) -> &str { "reserve_slot" }
///     fn saga_types(&self) -> &[&'static str] { &["appointment_booking"] }
///
///     async fn execute_step(&self, ctx: &SagaContext, input: &Payload)
///         -> Result<StepOutput, StepError>
///     {
///         // Hold the slot, return its id as compensation data
///     }
///
///     async fn compensate_step(&self, ctx: &SagaContext, data: &Payload)
///         -> Result<(), CompensationError>
///     {
///         // Release the slot
///     }
/// }
/// ```
#[async_trait]
pub trait SagaParticipant: Send + Sync + 'static {
    /// The step name this participant handles
    fn step_name(&self) -> &str;

    /// Which saga types this participant joins
    fn saga_types(&self) -> &[&'static str];

    /// Execute the forward step
    async fn execute_step(
        &self,
        context: &SagaContext,
        input: &Payload,
    ) -> Result<StepOutput, StepError>;

    /// Execute compensation (undo)
    async fn compensate_step(
        &self,
        context: &SagaContext,
        compensation_data: &Payload,
    ) -> Result<(), CompensationError>;

    /// Retry policy for step execution
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Timeout for a single execution attempt
    fn step_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// Dependency specification - when does a step execute under choreography?
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependencySpec {
    /// Execute when the saga's trigger event arrives
    OnSagaStart,
    /// Execute after this specific step completes
    After(Box<str>),
}

impl DependencySpec {
    /// Check if a completed step satisfies this dependency
    pub fn is_satisfied_by(&self, completed_step: &str) -> bool {
        match self {
            DependencySpec::OnSagaStart => false,
            DependencySpec::After(step) => completed_step == &**step,
        }
    }

    /// Check if this is OnSagaStart
    pub fn is_on_saga_start(&self) -> bool {
        matches!(self, DependencySpec::OnSagaStart)
    }
}

/// Bounded exponential backoff
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_millis: 1000,
            max_delay_millis: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_millis: 0,
            max_delay_millis: 0,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_millis = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_millis = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Calculate delay for a given attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn has_attempts_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        // Would be 512s but capped at max
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        assert!(policy.has_attempts_remaining(1));
        assert!(!policy.has_attempts_remaining(2));
        assert!(!RetryPolicy::no_retry().has_attempts_remaining(1));
    }

    #[test]
    fn test_dependency_spec() {
        let spec = DependencySpec::After("reserve_slot".into());
        assert!(spec.is_satisfied_by("reserve_slot"));
        assert!(!spec.is_satisfied_by("charge_payment"));
        assert!(!spec.is_on_saga_start());
        assert!(DependencySpec::OnSagaStart.is_on_saga_start());
    }
}
