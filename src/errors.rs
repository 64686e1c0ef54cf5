//! Error taxonomy shared by all components

use std::time::Duration;

use crate::events::Payload;
use crate::schema::SchemaError;

/// How a failure is treated by the delivery machinery
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network or storage hiccup, retried with bounded backoff
    TransientIo,
    /// Normal deduplication outcome, not an error
    Duplicate,
    /// Payload does not match a compatible schema; never retried
    SchemaIncompatible,
    /// Handler rejected the event; retried a bounded number of times
    HandlerLogic,
    /// A saga compensation could not be applied; needs an operator
    CompensationFailure,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TransientIo => "transient_io",
            Self::Duplicate => "duplicate",
            Self::SchemaIncompatible => "schema_incompatible",
            Self::HandlerLogic => "handler_logic",
            Self::CompensationFailure => "compensation_failure",
        };
        f.write_str(name)
    }
}

/// Error from a shared store (idempotency, offsets, outbox, saga state)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    #[error("Conflict: {0}")]
    Conflict(Box<str>),
    #[error("Codec error: {0}")]
    Codec(Box<str>),
}

impl StoreError {
    pub(crate) fn poisoned<T>(_: T) -> Self {
        Self::Storage("lock poisoned".into())
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::TransientIo
    }
}

/// Error returned by an event handler
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(Box<str>),
    #[error("handler logic error: {0}")]
    Logic(Box<str>),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::Transient(reason.to_string().into_boxed_str())
    }

    pub fn logic(reason: impl std::fmt::Display) -> Self {
        Self::Logic(reason.to_string().into_boxed_str())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient(_) | Self::Timeout(_) => ErrorCategory::TransientIo,
            Self::Logic(_) => ErrorCategory::HandlerLogic,
            Self::Schema(_) => ErrorCategory::SchemaIncompatible,
        }
    }

    /// Schema mismatches can never succeed on redelivery
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Schema(_))
    }
}

impl From<StoreError> for HandlerError {
    fn from(error: StoreError) -> Self {
        Self::transient(error)
    }
}

impl From<crate::log::LogError> for HandlerError {
    fn from(error: crate::log::LogError) -> Self {
        match error {
            crate::log::LogError::Schema(e) => Self::Schema(e),
            other => Self::transient(other),
        }
    }
}

/// Output from step execution
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOutput {
    /// Output data (passed to the next step)
    pub output: Payload,
    /// Data needed for compensation (kept until the saga ends)
    pub compensation_data: Payload,
}

impl StepOutput {
    pub fn new(output: Payload, compensation_data: Payload) -> Self {
        Self {
            output,
            compensation_data,
        }
    }
}

/// Error from step execution
#[derive(Clone, Debug, PartialEq)]
pub enum StepError {
    /// Temporary error - can retry with exponential backoff
    Retriable {
        /// Error description
        reason: Box<str>,
    },
    /// Permanent error - the saga compensates the steps completed so far
    Terminal {
        /// Error description
        reason: Box<str>,
    },
}

impl StepError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retriable { reason } | Self::Terminal { reason } => reason,
        }
    }
}

/// Error from compensation execution
#[derive(Clone, Debug, PartialEq)]
pub enum CompensationError {
    /// Safe to retry - no side effects were applied
    SafeToRetry {
        /// Error description
        reason: Box<str>,
    },
    /// Ambiguous state - compensation may or may not have applied
    Ambiguous {
        /// Error description
        reason: Box<str>,
    },
    /// Terminal failure - cannot compensate
    Terminal {
        /// Error description
        reason: Box<str>,
    },
}

impl CompensationError {
    /// Check if safe to retry
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(self, Self::SafeToRetry { .. })
    }

    /// Check if state is ambiguous
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::SafeToRetry { reason }
            | Self::Ambiguous { reason }
            | Self::Terminal { reason } => reason,
        }
    }
}
