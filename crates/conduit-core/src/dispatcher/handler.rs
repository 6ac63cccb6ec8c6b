//! Inbound event handlers.
//!
//! Handlers are registered per event type into a [`HandlerRegistry`] that is
//! built once at startup. An event whose type has no handler fails with a
//! validation error and is dead-lettered; it is never silently dropped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::outbound::OutboundSender;
use super::DispatchError;
use crate::event_store::InboundEvent;
use crate::provider::Provider;
use crate::{CorrelationId, ErrorCategory, ValidationError};

/// Handler failure, classified by what the dispatcher should do next.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Malformed payload; the event is dead-lettered without retry.
    #[error("Invalid event: {message}")]
    Validation { message: String },

    /// Terminal failure such as a 4xx from a downstream call; marked failed.
    #[error("Permanent failure: {message}")]
    Permanent { message: String },

    /// Timeout, connection error or 5xx; retried with backoff.
    #[error("Transient failure: {message}")]
    Transient { message: String },
}

impl HandlerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Permanent { .. } => ErrorCategory::Validation,
            Self::Transient { .. } => ErrorCategory::Transient,
        }
    }
}

impl From<DispatchError> for HandlerError {
    /// Map a failed outbound call made from inside a handler.
    fn from(err: DispatchError) -> Self {
        match &err {
            DispatchError::Validation(_) => Self::validation(err.to_string()),
            _ if err.is_transient() || matches!(err, DispatchError::CircuitOpen(_)) => {
                Self::transient(err.to_string())
            }
            _ => Self::permanent(err.to_string()),
        }
    }
}

/// Per-invocation context passed to a handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub provider: Arc<Provider>,
    /// 1-based attempt number for this event
    pub attempt: u32,
    pub max_attempts: u32,
    pub correlation_id: CorrelationId,
    /// Outbound client for calls back to providers.
    ///
    /// Pass an `operation_id` derived from the event key so that retried
    /// handler attempts reuse the same idempotency key.
    pub outbound: Arc<OutboundSender>,
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("provider", &self.provider.name)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// Business logic for one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent, ctx: &HandlerContext)
        -> Result<(), HandlerError>;

    /// Deadline for one invocation on behalf of `source`.
    ///
    /// Handlers that make outbound calls should extend this to cover them.
    fn timeout(&self, source: &Provider) -> Duration {
        source.timeout
    }
}

/// Mapping from event type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register(
        mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    /// Find the handler for `event_type`.
    pub fn resolve(&self, event_type: &str) -> Result<Arc<dyn EventHandler>, ValidationError> {
        self.handlers
            .get(event_type)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownEventType {
                event_type: event_type.to_string(),
            })
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types in sorted order.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
