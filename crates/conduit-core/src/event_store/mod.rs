//! # Event Store
//!
//! Idempotency ledger for inbound events.
//!
//! Every admitted event is keyed by `(provider, event_id)`. The event id is
//! opaque and scoped to its provider, so two providers may reuse the same id
//! without colliding. Admission is a single atomic check-and-insert, which is
//! the one place that guarantees a handler runs at most once per key.
//!
//! ## State machine
//!
//! ```text
//! received ──► processing ──► processed
//!    ▲              │
//!    │              ├──────► failed ───────┐
//!    │              └──────► deadlettered ─┤
//!    └──────────── requeue (operator) ◄────┘
//! ```
//!
//! Transitions are validated against the stored state; an illegal transition
//! fails with [`EventStoreError::InvalidTransition`] and leaves the record
//! untouched. `requeue` is the only backward edge and is reserved for
//! operator re-drive. A `processed` event can never be re-driven.
//!
//! Records are never deleted; retention belongs to the storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ErrorCategory, ParseError, Timestamp};

// ============================================================================
// Keys and States
// ============================================================================

/// Composite ledger key: provider name plus provider-supplied event id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub provider: String,
    pub event_id: String,
}

impl EventKey {
    pub fn new(provider: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            event_id: event_id.into(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.event_id)
    }
}

/// Processing state of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Received,
    Processing,
    Processed,
    Failed,
    DeadLettered,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::DeadLettered => "deadlettered",
        }
    }

    /// Whether the dispatcher has finished with the event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::DeadLettered)
    }

    /// Whether an operator may re-drive an event in this state.
    pub fn is_redrivable(&self) -> bool {
        matches!(self, Self::Failed | Self::DeadLettered)
    }

    /// Forward transitions taken by the dispatcher.
    pub fn can_transition_to(&self, next: EventState) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Processing)
                | (Self::Processing, Self::Processed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::DeadLettered)
        )
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "received" => Ok(Self::Received),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "deadlettered" | "dead_lettered" => Ok(Self::DeadLettered),
            _ => Err(ParseError::InvalidFormat {
                expected: "received, processing, processed, failed or deadlettered".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// An admitted inbound event as recorded in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub key: EventKey,
    pub event_type: String,
    /// Request body exactly as received, kept for re-verification and audit
    pub raw_payload: Bytes,
    pub state: EventState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub received_at: Timestamp,
    pub updated_at: Timestamp,
    pub processed_at: Option<Timestamp>,
    /// Number of operator re-drives
    pub redrive_count: u32,
}

impl InboundEvent {
    /// Build a freshly admitted record in state `received`.
    pub fn admitted(key: EventKey, event_type: impl Into<String>, raw_payload: Bytes) -> Self {
        let now = Timestamp::now();
        Self {
            key,
            event_type: event_type.into(),
            raw_payload,
            state: EventState::Received,
            attempt_count: 0,
            last_error: None,
            received_at: now,
            updated_at: now,
            processed_at: None,
            redrive_count: 0,
        }
    }
}

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A new record was inserted in state `received`.
    Admitted,
    /// A record already existed; its current state is returned.
    Duplicate { state: EventState },
}

/// Operator query over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventQuery {
    pub provider: Option<String>,
    pub state: Option<EventState>,
    pub limit: Option<usize>,
}

impl EventQuery {
    /// Whether a record matches the query filters.
    pub fn matches(&self, event: &InboundEvent) -> bool {
        self.provider
            .as_deref()
            .map_or(true, |p| p == event.key.provider)
            && self.state.map_or(true, |s| s == event.state)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Ledger operation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStoreError {
    #[error("Event '{key}' not found")]
    NotFound { key: EventKey },

    #[error("Event '{key}' cannot move from {from} to {to}")]
    InvalidTransition {
        key: EventKey,
        from: EventState,
        to: EventState,
    },

    #[error("Event store unavailable: {message}")]
    Unavailable { message: String },
}

impl EventStoreError {
    /// Check if error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::Validation,
            Self::InvalidTransition { .. } => ErrorCategory::InvalidTransition,
            Self::Unavailable { .. } => ErrorCategory::Transient,
        }
    }
}

// ============================================================================
// EventStore Trait
// ============================================================================

/// Durable idempotency ledger.
///
/// Implementations must make [`EventStore::try_admit`] a single atomic
/// insert-if-absent (unique constraint or compare-and-swap), so that any
/// number of concurrent duplicate deliveries yield exactly one `Admitted`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new event in state `received` unless the key already exists.
    async fn try_admit(
        &self,
        key: &EventKey,
        event_type: &str,
        raw_payload: Bytes,
    ) -> Result<AdmitOutcome, EventStoreError>;

    /// Claim the event for processing (`received → processing`).
    ///
    /// Returns the claimed record. Only one caller can win the claim, which
    /// serializes handling per key.
    async fn mark_processing(&self, key: &EventKey) -> Result<InboundEvent, EventStoreError>;

    /// `processing → processed`
    async fn mark_processed(&self, key: &EventKey) -> Result<(), EventStoreError>;

    /// `processing → failed`, recording the error.
    async fn mark_failed(&self, key: &EventKey, error: &str) -> Result<(), EventStoreError>;

    /// `processing → deadlettered`, recording the reason.
    async fn mark_dead_lettered(&self, key: &EventKey, error: &str)
        -> Result<(), EventStoreError>;

    /// Bump the attempt counter of a `processing` event and return the new count.
    async fn increment_attempt(&self, key: &EventKey) -> Result<u32, EventStoreError>;

    /// Fetch a single record.
    async fn get(&self, key: &EventKey) -> Result<Option<InboundEvent>, EventStoreError>;

    /// Records matching `query`, newest admission first.
    async fn list(&self, query: &EventQuery) -> Result<Vec<InboundEvent>, EventStoreError>;

    /// Operator re-drive: `failed | deadlettered → received`.
    ///
    /// Clears `last_error` and resets `attempt_count`.
    async fn requeue(&self, key: &EventKey) -> Result<InboundEvent, EventStoreError>;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
