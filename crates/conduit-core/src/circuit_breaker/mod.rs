//! Per-provider circuit breaker.
//!
//! Isolates a misbehaving provider without blocking the others, and stops
//! hammering a provider that is down while still probing for recovery.
//!
//! # Circuit States
//!
//! - **Closed**: all calls allowed; consecutive failures are counted
//! - **Open**: calls rejected with [`CircuitOpenError`] until the open
//!   duration has elapsed
//! - **Half-Open**: exactly one trial call is let through; its result
//!   closes or re-opens the circuit
//!
//! Callers ask for a [`CircuitPermit`] with [`CircuitBreaker::allow`] and hand
//! it back with [`CircuitBreaker::record_result`]. A rejected call never
//! reaches the network and is not counted as a failure.
//!
//! # Example
//!
//! ```rust
//! use conduit_core::circuit_breaker::{CircuitBreaker, CircuitSettings};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::from_settings([(
//!     "payment_service".to_string(),
//!     CircuitSettings::default(),
//! )]);
//!
//! let permit = breaker.allow("payment_service").unwrap();
//! breaker.record_result(permit, true, Duration::from_millis(35));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::provider::Provider;
use crate::{ErrorCategory, Timestamp};

mod breaker;
pub use breaker::CircuitBreaker;

// ============================================================================
// Circuit State
// ============================================================================

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric gauge value: 0 closed, 1 open, 2 half-open.
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds for one provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before allowing a trial call
    pub open_duration: Duration,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl From<&Provider> for CircuitSettings {
    fn from(provider: &Provider) -> Self {
        Self {
            failure_threshold: provider.failure_threshold,
            open_duration: provider.open_duration,
        }
    }
}

// ============================================================================
// Permits and Errors
// ============================================================================

/// Token proving a call was allowed.
///
/// Carries the circuit generation it was issued in. Results reported for a
/// permit from an earlier generation update statistics only and never move
/// the state machine.
#[must_use = "a permit must be handed back through record_result"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitPermit {
    provider: String,
    generation: u64,
    trial: bool,
}

impl CircuitPermit {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether this permit is the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Call rejected because the provider's circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit open for provider '{provider}'")]
pub struct CircuitOpenError {
    pub provider: String,

    /// Time until a trial call may be allowed, when known
    pub retry_after: Option<Duration>,
}

impl CircuitOpenError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::CircuitOpen
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time view of one circuit for operators and health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
    pub opened_at: Option<Timestamp>,
    pub last_probe_at: Option<Timestamp>,
    /// Held open by an operator until explicitly closed
    pub forced_open: bool,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_latency_ms: Option<u64>,
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
