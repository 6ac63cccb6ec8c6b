//! # Conduit Core
//!
//! Core logic for the Conduit external integration engine.
//!
//! The engine receives signed webhooks from third-party providers, admits each
//! event exactly once into an idempotency ledger, runs the registered handler
//! on a bounded worker pool, and pushes calls back out to the same providers
//! with retry, backoff and a per-provider circuit breaker. A health monitor
//! folds probe results and call telemetry into a snapshot per provider.
//!
//! ## Architecture
//!
//! - Components are constructed explicitly and shared via `Arc`; there is no
//!   ambient global state.
//! - Storage, auditing, tenant authorization and HTTP transport sit behind
//!   traits so that infrastructure can be swapped at startup.
//!
//! ## Usage
//!
//! ```rust
//! use conduit_core::{CorrelationId, Timestamp};
//!
//! let correlation_id = CorrelationId::new();
//! let now = Timestamp::now();
//! assert!(now <= Timestamp::now());
//! # let _ = correlation_id;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use uuid::Uuid;

// ============================================================================
// Time and Metadata Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

/// Identifier for tracing requests across system boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate new correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get string representation
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s.parse::<Uuid>().map_err(|_| ParseError::InvalidFormat {
            expected: "UUID format".to_string(),
            actual: s.to_string(),
        })?;
        Ok(Self(uuid))
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error taxonomy shared by every component.
///
/// Determines how a failure is surfaced: rejected at the edge, retried with
/// backoff, failed fast, or escalated to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad or missing signature, unknown or inactive provider. Never retried.
    Authentication,
    /// Malformed payload or unknown event type. Terminal.
    Validation,
    /// Timeout, connection failure or 5xx. Retried per backoff policy.
    Transient,
    /// Provider currently isolated by its circuit breaker. Fails fast.
    CircuitOpen,
    /// Illegal ledger state change. Logged and surfaced to operators.
    InvalidTransition,
    /// Invalid static configuration preventing startup.
    Configuration,
}

impl ErrorCategory {
    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::CircuitOpen => "circuit_open",
            Self::InvalidTransition => "invalid_transition",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },

    #[error("No handler registered for event type '{event_type}'")]
    UnknownEventType { event_type: String },
}

/// Error type for string parsing failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Provider catalogue loaded from configuration
pub mod provider;

/// Inbound webhook signature verification
pub mod signature;

/// Idempotency ledger for inbound events
pub mod event_store;

/// Per-provider circuit breaker
pub mod circuit_breaker;

/// Exponential backoff with jitter
pub mod retry;

/// Inbound handler execution and outbound calls
pub mod dispatcher;

/// Provider health tracking
pub mod health;

/// Webhook admission entry point
pub mod receiver;

/// Fire-and-forget audit reporting
pub mod audit;

/// Tenant-scoped authorization gate for outbound calls
pub mod authorization;

/// Metrics collection traits
pub mod monitoring;

/// Infrastructure adapters
pub mod adapters;

// Re-export key types for convenience
pub use adapters::InMemoryEventStore;
pub use audit::{AuditError, AuditRecord, AuditSink, OutboundCallRecord, TracingAuditSink};
pub use authorization::{AllowAllGate, AuthorizationError, AuthorizationGate};
pub use circuit_breaker::{
    CircuitBreaker, CircuitOpenError, CircuitPermit, CircuitSettings, CircuitSnapshot,
    CircuitStatus,
};
pub use dispatcher::{
    DispatchError, Dispatcher, DispatcherConfig, EventHandler, ForwardingHandler, HandlerContext,
    HandlerError, HandlerRegistry, OutboundRequest, OutboundResponse, OutboundSender,
    OutboundTransport, QueueError, QueueSlot, ReqwestTransport, RouteConfig, TransportError,
    TransportRequest, TransportResponse, WorkQueue, WorkerPool,
};
pub use event_store::{
    AdmitOutcome, EventKey, EventQuery, EventState, EventStore, EventStoreError, InboundEvent,
};
pub use health::{
    CallObserver, HealthConfig, HealthMonitor, HealthSnapshot, HealthStatus, HttpProbe,
    ProbeResult, ProviderHealth, ProviderProbe,
};
pub use monitoring::{MetricsCollector, NoOpMetricsCollector};
pub use provider::{
    AuthType, Provider, ProviderConfig, ProviderConfigError, ProviderName, ProviderRegistry,
    SecretString,
};
pub use receiver::{ReceiveError, ReceiveOutcome, WebhookEnvelope, WebhookReceiver};
pub use retry::RetryPolicy;
pub use signature::{SignatureError, SignatureVerifier};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
