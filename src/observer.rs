//! Saga lifecycle hooks

use crate::SagaContext;

/// Receives saga lifecycle notifications from coordinators and participants.
///
/// Every hook defaults to doing nothing, so an observer only implements
/// the notifications it cares about. Hooks run inline on the handler task
/// and must not block.
pub trait SagaObserver: Send + Sync + 'static {
    fn on_saga_started(&self, _context: &SagaContext) {}

    fn on_step_started(&self, _context: &SagaContext, _step: &str) {}

    fn on_step_completed(&self, _context: &SagaContext, _step: &str, _duration_millis: u64) {}

    /// The step gave up; the saga will compensate
    fn on_step_failed(&self, _context: &SagaContext, _step: &str, _error: &str) {}

    fn on_compensation_started(&self, _context: &SagaContext, _step: &str) {}

    fn on_compensation_completed(&self, _context: &SagaContext, _step: &str) {}

    fn on_saga_completed(&self, _context: &SagaContext) {}

    fn on_saga_failed(&self, _context: &SagaContext, _reason: &str) {}

    /// A participant gave up compensating its step
    fn on_saga_quarantined(&self, _context: &SagaContext, _step: &str, _reason: &str) {}

    /// The saga is frozen in COMPENSATING and needs an operator
    fn on_manual_intervention(&self, _context: &SagaContext, _step: &str, _reason: &str) {}
}

/// Ignores every notification
pub struct NoOpObserver;

impl SagaObserver for NoOpObserver {}

/// Logs the lifecycle through `tracing`; the default observer.
///
/// Progress is logged at info, failures that the saga absorbs at warn, and
/// anything that needs a human at error.
pub struct TracingObserver;

impl SagaObserver for TracingObserver {
    fn on_saga_started(&self, context: &SagaContext) {
        tracing::info!(
            saga_id = %context.saga_id,
            saga_type = %context.saga_type,
            correlation_id = %context.correlation_id,
            "Saga started"
        );
    }

    fn on_step_started(&self, context: &SagaContext, step: &str) {
        tracing::debug!(
            saga_id = %context.saga_id,
            %step,
            attempt = context.attempt,
            "Executing step"
        );
    }

    fn on_step_completed(&self, context: &SagaContext, step: &str, duration_millis: u64) {
        tracing::info!(
            saga_id = %context.saga_id,
            %step,
            duration_ms = duration_millis,
            "Step done"
        );
    }

    fn on_step_failed(&self, context: &SagaContext, step: &str, error: &str) {
        tracing::warn!(
            saga_id = %context.saga_id,
            %step,
            %error,
            "Step gave up, saga will compensate"
        );
    }

    fn on_compensation_started(&self, context: &SagaContext, step: &str) {
        tracing::info!(
            saga_id = %context.saga_id,
            %step,
            attempt = context.attempt,
            "Compensating step"
        );
    }

    fn on_compensation_completed(&self, context: &SagaContext, step: &str) {
        tracing::info!(saga_id = %context.saga_id, %step, "Step compensated");
    }

    fn on_saga_completed(&self, context: &SagaContext) {
        tracing::info!(
            saga_id = %context.saga_id,
            saga_type = %context.saga_type,
            "Saga completed"
        );
    }

    fn on_saga_failed(&self, context: &SagaContext, reason: &str) {
        tracing::warn!(
            saga_id = %context.saga_id,
            saga_type = %context.saga_type,
            %reason,
            "Saga failed, all compensations applied"
        );
    }

    fn on_saga_quarantined(&self, context: &SagaContext, step: &str, reason: &str) {
        tracing::error!(
            saga_id = %context.saga_id,
            %step,
            %reason,
            "Compensation abandoned, step quarantined"
        );
    }

    fn on_manual_intervention(&self, context: &SagaContext, step: &str, reason: &str) {
        tracing::error!(
            saga_id = %context.saga_id,
            saga_type = %context.saga_type,
            correlation_id = %context.correlation_id,
            %step,
            %reason,
            "Compensation failed, manual intervention required"
        );
    }
}
