//! Event handler seam used by the consumer dispatcher

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::idempotency::ResultToken;
use crate::log::LogError;
use crate::schema::SchemaInterest;
use crate::{ConsumerId, Event, HandlerError, PartitionId, Position};

/// Publishes events on behalf of handlers
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, event: Event) -> Result<(PartitionId, Position), LogError>;
}

/// Per-delivery information handed to a handler
#[derive(Clone)]
pub struct HandlerContext {
    pub consumer_id: ConsumerId,
    pub partition: PartitionId,
    pub position: Position,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    pub publisher: Arc<dyn EventPublisher>,
}

/// Successful handler result
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandlerOutcome {
    /// Response replayed to callers when a duplicate of this event arrives
    pub result_token: Option<ResultToken>,
}

impl HandlerOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<ResultToken>) -> Self {
        Self {
            result_token: Some(token.into()),
        }
    }
}

/// Reaction to events of the types listed in `interests`.
///
/// Handlers must be safe to re-execute: an event can be redelivered after a
/// crash between handler success and offset commit.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Stable name; part of the consumer id used for deduplication
    fn name(&self) -> &str;

    /// Event types and versions this handler accepts
    fn interests(&self) -> Vec<SchemaInterest>;

    async fn handle(
        &self,
        event: &Event,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("event type {event_type} already handled by {existing}")]
    DuplicateHandler { event_type: String, existing: String },
}

/// Handler lookup by event type, one handler per type
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: HashMap<String, (Arc<dyn EventHandler>, SchemaInterest)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) -> Result<(), DispatchError> {
        let interests = handler.interests();
        if let Some(taken) = interests.iter().find_map(|i| self.routes.get(&i.event_type)) {
            return Err(DispatchError::DuplicateHandler {
                event_type: taken.1.event_type.clone(),
                existing: taken.0.name().to_string(),
            });
        }
        for interest in interests {
            self.routes
                .insert(interest.event_type.clone(), (handler.clone(), interest));
        }
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, handler: Arc<dyn EventHandler>) -> Result<Self, DispatchError> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn route(&self, event_type: &str) -> Option<(&Arc<dyn EventHandler>, &SchemaInterest)> {
        self.routes.get(event_type).map(|(h, i)| (h, i))
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}
