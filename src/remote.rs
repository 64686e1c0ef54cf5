//! Request/response calls to other services from saga steps

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::idempotency::IdempotencyKey;
use crate::{
    CompensationError, ErrorCategory, Payload, RetryPolicy, SagaContext, SagaParticipant, StepError,
    StepOutput,
};

/// One call to a remote service
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteRequest {
    pub service: Box<str>,
    pub operation: Box<str>,
    pub payload: Payload,
    pub correlation_id: Box<str>,
    /// Lets the callee deduplicate retried calls
    pub idempotency_key: IdempotencyKey,
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteResponse {
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// No answer in time; the call may or may not have taken effect
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    /// The call was not delivered
    #[error("remote service unavailable: {0}")]
    Unavailable(Box<str>),
    #[error("remote call rejected: {0}")]
    Rejected(Box<str>),
}

impl RemoteError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => ErrorCategory::TransientIo,
            Self::Rejected(_) => ErrorCategory::HandlerLogic,
        }
    }
}

/// Transport used to reach other services
#[async_trait]
pub trait RemoteInvoker: Send + Sync + 'static {
    async fn invoke(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError>;
}

/// Invoke `request`, giving up after its timeout
pub async fn call_with_timeout(
    invoker: &dyn RemoteInvoker,
    request: RemoteRequest,
) -> Result<RemoteResponse, RemoteError> {
    let timeout = request.timeout;
    match tokio::time::timeout(timeout, invoker.invoke(request)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

/// Saga step that delegates its work and its compensation to a remote
/// service.
///
/// The response payload becomes both the step output and the compensation
/// data. Execution keys calls with [`IdempotencyKey::for_step`], compensation
/// with [`IdempotencyKey::for_compensation`], so retries of either are safe
/// for a callee that deduplicates on the key.
pub struct RemoteStep {
    step: Box<str>,
    saga_types: Vec<&'static str>,
    service: Box<str>,
    operation: Box<str>,
    compensation: Box<str>,
    invoker: Arc<dyn RemoteInvoker>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RemoteStep {
    /// Step `step` calling `service`; operations default to the step name
    /// and `undo_{step}`
    pub fn new(step: &str, service: &str, invoker: Arc<dyn RemoteInvoker>) -> Self {
        Self {
            step: step.into(),
            saga_types: Vec::new(),
            service: service.into(),
            operation: step.into(),
            compensation: format!("undo_{step}").into_boxed_str(),
            invoker,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    pub fn joins(mut self, saga_types: &[&'static str]) -> Self {
        self.saga_types.extend_from_slice(saga_types);
        self
    }

    pub fn with_operations(mut self, operation: &str, compensation: &str) -> Self {
        self.operation = operation.into();
        self.compensation = compensation.into();
        self
    }

    /// Timeout of a single remote call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(
        &self,
        operation: &str,
        context: &SagaContext,
        payload: &Payload,
        key: IdempotencyKey,
    ) -> RemoteRequest {
        RemoteRequest {
            service: self.service.clone(),
            operation: operation.into(),
            payload: payload.clone(),
            correlation_id: context.correlation_id.clone(),
            idempotency_key: key,
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl SagaParticipant for RemoteStep {
    fn step_name(&self) -> &str {
        &self.step
    }

    fn saga_types(&self) -> &[&'static str] {
        &self.saga_types
    }

    async fn execute_step(
        &self,
        context: &SagaContext,
        input: &Payload,
    ) -> Result<StepOutput, StepError> {
        let key = IdempotencyKey::for_step(context.saga_id, &context.step_name);
        let request = self.request(&self.operation, context, input, key);
        match call_with_timeout(self.invoker.as_ref(), request).await {
            Ok(response) => Ok(StepOutput::new(response.payload.clone(), response.payload)),
            Err(e @ (RemoteError::Timeout(_) | RemoteError::Unavailable(_))) => {
                Err(StepError::Retriable {
                    reason: e.to_string().into(),
                })
            }
            Err(e @ RemoteError::Rejected(_)) => Err(StepError::Terminal {
                reason: e.to_string().into(),
            }),
        }
    }

    async fn compensate_step(
        &self,
        context: &SagaContext,
        compensation_data: &Payload,
    ) -> Result<(), CompensationError> {
        let key = IdempotencyKey::for_compensation(context.saga_id, &context.step_name);
        let request = self.request(&self.compensation, context, compensation_data, key);
        call_with_timeout(self.invoker.as_ref(), request)
            .await
            .map(|_| ())
            .map_err(|e| {
                let reason = e.to_string().into();
                match e {
                    RemoteError::Unavailable(_) => CompensationError::SafeToRetry { reason },
                    RemoteError::Timeout(_) => CompensationError::Ambiguous { reason },
                    RemoteError::Rejected(_) => CompensationError::Terminal { reason },
                }
            })
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    fn step_timeout(&self) -> Duration {
        // The call timeout fires first; this bounds the surrounding work
        self.timeout + Duration::from_secs(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SagaId;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<RemoteResponse, RemoteError>>>,
        seen: Mutex<Vec<RemoteRequest>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(replies: Vec<Result<RemoteResponse, RemoteError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl RemoteInvoker for Scripted {
        async fn invoke(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
            self.seen.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn context() -> SagaContext {
        SagaContext::start(SagaId(5), "appointment_booking", "charge_payment", "corr-5", 0)
    }

    #[tokio::test]
    async fn execution_carries_correlation_and_step_key() {
        let invoker = Scripted::new(vec![Ok(RemoteResponse {
            payload: Payload::new().with("charge_id", "ch-9"),
        })]);
        let step = RemoteStep::new("charge_payment", "billing", invoker.clone())
            .joins(&["appointment_booking"]);

        let output = step
            .execute_step(&context(), &Payload::new().with("amount", 40i64))
            .await
            .unwrap();

        assert_eq!(output.compensation_data.text("charge_id"), Some("ch-9"));
        let seen = invoker.seen.lock().unwrap();
        assert_eq!(&*seen[0].operation, "charge_payment");
        assert_eq!(&*seen[0].correlation_id, "corr-5");
        assert_eq!(seen[0].idempotency_key, IdempotencyKey::for_step(SagaId(5), "charge_payment"));
        assert_eq!(seen[0].payload.int("amount"), Some(40));
    }

    #[tokio::test]
    async fn errors_map_to_step_and_compensation_outcomes() {
        let invoker = Scripted::new(vec![
            Err(RemoteError::Unavailable("billing down".into())),
            Err(RemoteError::Rejected("card declined".into())),
            Err(RemoteError::Unavailable("billing down".into())),
            Err(RemoteError::Rejected("already refunded".into())),
        ]);
        let step = RemoteStep::new("charge_payment", "billing", invoker.clone());

        assert!(step.execute_step(&context(), &Payload::new()).await.unwrap_err().is_retriable());
        assert!(!step.execute_step(&context(), &Payload::new()).await.unwrap_err().is_retriable());
        assert!(step
            .compensate_step(&context(), &Payload::new())
            .await
            .unwrap_err()
            .is_safe_to_retry());
        assert!(matches!(
            step.compensate_step(&context(), &Payload::new()).await,
            Err(CompensationError::Terminal { .. })
        ));
        let seen = invoker.seen.lock().unwrap();
        assert_eq!(&*seen[2].operation, "undo_charge_payment");
        assert_eq!(
            seen[2].idempotency_key,
            IdempotencyKey::for_compensation(SagaId(5), "charge_payment")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_compensation_is_ambiguous() {
        let invoker = Arc::new(Scripted {
            replies: Mutex::new(vec![Ok(RemoteResponse::default())]),
            seen: Mutex::new(Vec::new()),
            delay: Duration::from_secs(60),
        });
        let step = RemoteStep::new("reserve_slot", "calendar", invoker)
            .with_timeout(Duration::from_secs(2));

        let err = step.compensate_step(&context(), &Payload::new()).await.unwrap_err();
        assert!(err.is_ambiguous());
    }
}
