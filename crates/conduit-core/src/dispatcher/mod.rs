//! # Dispatcher
//!
//! Runs handlers for admitted inbound events and sends outbound calls.
//!
//! Inbound processing for one event key:
//!
//! 1. Claim the event (`received → processing`). Losing the claim means
//!    another worker owns the event, and this worker leaves it alone.
//! 2. Resolve the handler for the event type. An unknown type is a
//!    validation failure and the event is dead-lettered.
//! 3. Invoke the handler, bounded by its deadline (the provider timeout
//!    unless the handler extends it), and classify the result:
//!    - success → `processed`
//!    - validation error → `deadlettered` with no retry
//!    - permanent error → `failed`
//!    - transient error → retry with exponential backoff; once the attempt
//!      budget is spent → `deadlettered`
//! 4. Backoff sleeps are abandoned as soon as the provider's circuit opens;
//!    the event is then marked `failed` so an operator can re-drive it.
//!
//! Handlers run outside any store lock. The ledger only sees short state
//! transitions, so a slow handler never blocks admission of other events.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{self, AuditRecord, AuditSink, TracingAuditSink};
use crate::authorization::AuthorizationError;
use crate::circuit_breaker::{CircuitBreaker, CircuitOpenError};
use crate::event_store::{
    EventKey, EventQuery, EventState, EventStore, EventStoreError, InboundEvent,
};
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use crate::provider::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::{CorrelationId, ErrorCategory, ValidationError};

mod handler;
mod outbound;
mod routing;
mod worker_pool;

pub use handler::{EventHandler, HandlerContext, HandlerError, HandlerRegistry};
pub use outbound::{
    idempotency_key, OutboundRequest, OutboundResponse, OutboundSender, OutboundTransport,
    ReqwestTransport, TransportError, TransportRequest, TransportResponse, API_KEY_HEADER,
    IDEMPOTENCY_KEY_HEADER, SIGNATURE_HEADER,
};
pub use routing::{ForwardingHandler, RouteConfig};
pub use worker_pool::{QueueError, QueueSlot, WorkQueue, WorkerPool};

// ============================================================================
// Errors
// ============================================================================

/// Dispatch failure.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown provider '{provider}'")]
    UnknownProvider { provider: String },

    #[error("Provider '{provider}' is inactive")]
    InactiveProvider { provider: String },

    #[error("Tenant '{tenant_id}' is not authorized to call provider '{provider}'")]
    Unauthorized { tenant_id: String, provider: String },

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Provider '{provider}' rejected the request with HTTP {status}")]
    Rejected {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Call to provider '{provider}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        provider: String,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Workers did not stop within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },
}

impl DispatchError {
    /// Check if error is transient and the operation may be retried later
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownProvider { .. }
            | Self::InactiveProvider { .. }
            | Self::Unauthorized { .. } => ErrorCategory::Authentication,
            Self::Validation(_) | Self::Rejected { .. } => ErrorCategory::Validation,
            Self::CircuitOpen(_) => ErrorCategory::CircuitOpen,
            Self::Authorization(_) | Self::Exhausted { .. } | Self::ShutdownTimeout { .. } => {
                ErrorCategory::Transient
            }
            Self::Store(e) => e.category(),
            Self::Queue(QueueError::Full) => ErrorCategory::Transient,
            Self::Queue(QueueError::Closed) => ErrorCategory::Configuration,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Worker pool and queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of concurrent workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Bounded work queue capacity; a full queue sheds load with 503
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Time allowed for in-flight work on shutdown
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

fn default_worker_count() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

impl DispatcherConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.worker_count == 0 {
            return Err(ValidationError::InvalidFormat {
                field: "dispatcher.worker_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ValidationError::InvalidFormat {
                field: "dispatcher.queue_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Terminal outcome of inbound processing.
enum Verdict {
    Processed,
    Failed(String),
    DeadLettered(String),
}

/// Routes admitted events to handlers and outbound calls to providers.
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn EventStore>,
    breaker: Arc<CircuitBreaker>,
    handlers: HandlerRegistry,
    sender: Arc<OutboundSender>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricsCollector>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn EventStore>,
        breaker: Arc<CircuitBreaker>,
        handlers: HandlerRegistry,
        sender: Arc<OutboundSender>,
    ) -> Self {
        Self {
            registry,
            store,
            breaker,
            handlers,
            sender,
            audit: Arc::new(TracingAuditSink),
            metrics: Arc::new(NoOpMetricsCollector),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn outbound(&self) -> &Arc<OutboundSender> {
        &self.sender
    }

    /// Process one admitted event to a terminal state.
    ///
    /// Returns the state the event ended in. If another worker already owns
    /// the event, returns its current state without touching it.
    #[instrument(skip(self, key), fields(event = %key))]
    pub async fn handle_inbound(&self, key: &EventKey) -> Result<EventState, DispatchError> {
        let event = match self.store.mark_processing(key).await {
            Ok(event) => event,
            Err(EventStoreError::InvalidTransition { from, .. }) => {
                debug!(state = %from, "Event already claimed, skipping");
                return Ok(from);
            }
            Err(e) => return Err(e.into()),
        };

        let correlation_id = CorrelationId::new();
        debug!(
            correlation_id = %correlation_id,
            event_type = %event.event_type,
            "Dispatching inbound event"
        );

        let provider = match self.registry.get(&key.provider) {
            Some(provider) => provider.clone(),
            None => {
                let reason = format!("unknown provider '{}'", key.provider);
                return self.finish(&event, Verdict::DeadLettered(reason), 0).await;
            }
        };

        let handler = match self.handlers.resolve(&event.event_type) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(event_type = %event.event_type, "No handler registered for event type");
                return self.finish(&event, Verdict::DeadLettered(e.to_string()), 0).await;
            }
        };

        let policy = RetryPolicy::for_provider(&provider);
        let deadline = handler.timeout(&provider);

        loop {
            let attempt = self.store.increment_attempt(key).await?;
            let ctx = HandlerContext {
                provider: provider.clone(),
                attempt,
                max_attempts: policy.max_attempts,
                correlation_id,
                outbound: self.sender.clone(),
            };

            let invocation = tokio::time::timeout(deadline, handler.handle(&event, &ctx));
            let message = match invocation.await {
                Ok(Ok(())) => return self.finish(&event, Verdict::Processed, attempt).await,
                Ok(Err(HandlerError::Validation { message })) => {
                    return self
                        .finish(&event, Verdict::DeadLettered(message), attempt)
                        .await;
                }
                Ok(Err(HandlerError::Permanent { message })) => {
                    return self.finish(&event, Verdict::Failed(message), attempt).await;
                }
                Ok(Err(HandlerError::Transient { message })) => message,
                Err(_) => format!("handler timed out after {}ms", deadline.as_millis()),
            };

            if !policy.should_retry(attempt) {
                let reason = format!("retries exhausted after {} attempts: {}", attempt, message);
                return self
                    .finish(&event, Verdict::DeadLettered(reason), attempt)
                    .await;
            }

            let delay = policy.calculate_delay(attempt - 1);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Handler failed transiently, retrying"
            );
            self.metrics.record_retry(&key.provider);

            if let Err(open) = self.breaker.sleep_unless_open(&key.provider, delay).await {
                let reason = format!("retry abandoned: {}", open);
                return self.finish(&event, Verdict::Failed(reason), attempt).await;
            }
        }
    }

    /// Mark an event `failed` when its handling task ended without a verdict.
    ///
    /// Events no longer in `processing` are left alone.
    pub async fn fail_abandoned(
        &self,
        key: &EventKey,
        reason: &str,
    ) -> Result<EventState, DispatchError> {
        let event = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| EventStoreError::NotFound { key: key.clone() })?;
        if event.state != EventState::Processing {
            return Ok(event.state);
        }

        let attempts = event.attempt_count;
        self.finish(&event, Verdict::Failed(reason.to_string()), attempts)
            .await
    }

    /// Send an outbound call on behalf of application code.
    pub async fn send_outbound(
        &self,
        request: OutboundRequest,
    ) -> Result<OutboundResponse, DispatchError> {
        self.sender.send(request).await
    }

    /// Queue every event still in `received`, oldest first.
    ///
    /// Called at startup so events admitted before a restart are not
    /// stranded. Waits for queue space rather than shedding.
    pub async fn recover_pending(&self, queue: &WorkQueue) -> Result<usize, DispatchError> {
        let mut pending = self
            .store
            .list(&EventQuery {
                state: Some(EventState::Received),
                ..EventQuery::default()
            })
            .await?;
        pending.reverse();

        let count = pending.len();
        for event in pending {
            queue.enqueue(event.key).await?;
        }

        if count > 0 {
            info!(count, "Re-queued pending events");
        }
        Ok(count)
    }

    /// Operator re-drive of a `failed` or `deadlettered` event.
    ///
    /// Reserves queue space before touching the ledger, so a full queue
    /// leaves the event unchanged.
    #[instrument(skip(self, key, queue), fields(event = %key))]
    pub async fn redrive(
        &self,
        key: &EventKey,
        queue: &WorkQueue,
    ) -> Result<InboundEvent, DispatchError> {
        let slot = queue.try_reserve()?;
        let previous = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| EventStoreError::NotFound { key: key.clone() })?
            .state;

        let event = self.store.requeue(key).await?;
        slot.submit(key.clone());

        debug!(previous = %previous, "Re-driven event queued");
        audit::emit(
            &self.audit,
            AuditRecord::EventRedriven {
                key: key.clone(),
                previous,
            },
        );
        Ok(event)
    }

    /// Write the terminal state, then report it.
    async fn finish(
        &self,
        event: &InboundEvent,
        verdict: Verdict,
        attempts: u32,
    ) -> Result<EventState, DispatchError> {
        let key = &event.key;
        let (state, error) = match verdict {
            Verdict::Processed => {
                self.store.mark_processed(key).await?;
                info!(attempts, "Event processed");
                (EventState::Processed, None)
            }
            Verdict::Failed(reason) => {
                self.store.mark_failed(key, &reason).await?;
                warn!(attempts, error = %reason, "Event failed");
                (EventState::Failed, Some(reason))
            }
            Verdict::DeadLettered(reason) => {
                self.store.mark_dead_lettered(key, &reason).await?;
                error!(attempts, error = %reason, "Event dead-lettered");
                (EventState::DeadLettered, Some(reason))
            }
        };

        self.metrics
            .record_handler_outcome(&key.provider, &event.event_type, state.as_str());
        audit::emit(
            &self.audit,
            AuditRecord::InboundEvent {
                key: key.clone(),
                event_type: event.event_type.clone(),
                state,
                attempts,
                error,
            },
        );
        Ok(state)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("providers", &self.registry.names())
            .field("handlers", &self.handlers)
            .finish()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
