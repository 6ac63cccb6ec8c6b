//! Metrics collection.
//!
//! Core components report what happened through [`MetricsCollector`]; the API
//! crate implements it with Prometheus. Recording is best-effort and never
//! fails, so a broken metrics backend can't block event processing.
//!
//! # Examples
//!
//! ```rust
//! use conduit_core::monitoring::{MetricsCollector, NoOpMetricsCollector};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let metrics: Arc<dyn MetricsCollector> = Arc::new(NoOpMetricsCollector);
//! metrics.record_webhook("user_service", "accepted");
//! metrics.record_outbound_attempt("payment_service", true, Duration::from_millis(40));
//! ```

use std::time::Duration;

use crate::circuit_breaker::CircuitStatus;

/// Metrics collector for engine operations.
///
/// All methods take `&self` so one collector can be shared as
/// `Arc<dyn MetricsCollector>` across tasks.
pub trait MetricsCollector: Send + Sync {
    /// Record the outcome of an inbound webhook request.
    ///
    /// `outcome` is one of `accepted`, `duplicate`, `rejected`, `invalid`,
    /// `overloaded` or `error`.
    fn record_webhook(&self, provider: &str, outcome: &str);

    /// Record a signature verification failure with its reason label.
    fn record_signature_failure(&self, provider: &str, reason: &str);

    /// Record the terminal state of an inbound event handled by the dispatcher.
    fn record_handler_outcome(&self, provider: &str, event_type: &str, state: &str);

    /// Record one outbound HTTP attempt.
    fn record_outbound_attempt(&self, provider: &str, success: bool, latency: Duration);

    /// Record a retry scheduled after a transient failure.
    fn record_retry(&self, provider: &str);

    /// Record a circuit state change.
    fn record_circuit_transition(&self, provider: &str, status: CircuitStatus);

    /// Record a webhook shed because the work queue was full.
    fn record_queue_rejection(&self);
}

/// Collector that discards everything; the default for tests and tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsCollector;

impl MetricsCollector for NoOpMetricsCollector {
    fn record_webhook(&self, _provider: &str, _outcome: &str) {}

    fn record_signature_failure(&self, _provider: &str, _reason: &str) {}

    fn record_handler_outcome(&self, _provider: &str, _event_type: &str, _state: &str) {}

    fn record_outbound_attempt(&self, _provider: &str, _success: bool, _latency: Duration) {}

    fn record_retry(&self, _provider: &str) {}

    fn record_circuit_transition(&self, _provider: &str, _status: CircuitStatus) {}

    fn record_queue_rejection(&self) {}
}
