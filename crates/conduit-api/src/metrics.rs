//! Prometheus metrics for the service.
//!
//! Metrics live in a registry owned by [`ServiceMetrics`] rather than the
//! process-global default registry, so several instances can coexist in one
//! process (tests build one per router).

use conduit_core::{CircuitStatus, MetricsCollector};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Service metrics for observability
#[derive(Debug)]
pub struct ServiceMetrics {
    registry: Registry,

    // HTTP request metrics
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,

    // Webhook intake metrics
    pub webhook_requests_total: IntCounterVec,
    pub signature_validation_failures: IntCounterVec,
    pub queue_rejections_total: IntCounter,
    pub queue_depth: IntGauge,

    // Handler metrics
    pub handler_outcomes_total: IntCounterVec,

    // Outbound call metrics
    pub outbound_attempts_total: IntCounterVec,
    pub outbound_duration: HistogramVec,
    pub retry_attempts_total: IntCounterVec,

    // Circuit breaker metrics
    pub circuit_breaker_state: IntGaugeVec,
    pub circuit_transitions_total: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new_custom(Some("conduit".to_string()), None)?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request processing time",
            )
            .buckets(vec![0.001, 0.01, 0.1, 1.0, 10.0]),
            &["method", "path"],
        )?;

        let webhook_requests_total = IntCounterVec::new(
            Opts::new(
                "webhook_requests_total",
                "Webhooks received by provider and outcome",
            ),
            &["provider", "outcome"],
        )?;
        let signature_validation_failures = IntCounterVec::new(
            Opts::new(
                "signature_validation_failures_total",
                "Webhooks rejected by signature verification",
            ),
            &["provider", "reason"],
        )?;
        let queue_rejections_total = IntCounter::new(
            "queue_rejections_total",
            "Webhooks shed because the work queue was full",
        )?;
        let queue_depth = IntGauge::new("queue_depth", "Event keys waiting for a worker")?;

        let handler_outcomes_total = IntCounterVec::new(
            Opts::new(
                "handler_outcomes_total",
                "Inbound events reaching a terminal state",
            ),
            &["provider", "event_type", "state"],
        )?;

        let outbound_attempts_total = IntCounterVec::new(
            Opts::new("outbound_attempts_total", "Outbound call attempts"),
            &["provider", "result"],
        )?;
        let outbound_duration = HistogramVec::new(
            HistogramOpts::new(
                "outbound_duration_seconds",
                "Outbound call latency per attempt",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["provider"],
        )?;
        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Retries scheduled after transient failures"),
            &["provider"],
        )?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit state per provider (0 closed, 1 open, 2 half-open)",
            ),
            &["provider"],
        )?;
        let circuit_transitions_total = IntCounterVec::new(
            Opts::new("circuit_transitions_total", "Circuit state changes"),
            &["provider", "status"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(webhook_requests_total.clone()))?;
        registry.register(Box::new(signature_validation_failures.clone()))?;
        registry.register(Box::new(queue_rejections_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(handler_outcomes_total.clone()))?;
        registry.register(Box::new(outbound_attempts_total.clone()))?;
        registry.register(Box::new(outbound_duration.clone()))?;
        registry.register(Box::new(retry_attempts_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(circuit_transitions_total.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            http_request_duration,
            webhook_requests_total,
            signature_validation_failures,
            queue_rejections_total,
            queue_depth,
            handler_outcomes_total,
            outbound_attempts_total,
            outbound_duration,
            retry_attempts_total,
            circuit_breaker_state,
            circuit_transitions_total,
        }))
    }

    /// Record a completed HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration: Duration) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, status.as_str()])
            .inc();
        self.http_request_duration
            .with_label_values(&[method, path])
            .observe(duration.as_secs_f64());
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsCollector for ServiceMetrics {
    fn record_webhook(&self, provider: &str, outcome: &str) {
        self.webhook_requests_total
            .with_label_values(&[provider, outcome])
            .inc();
    }

    fn record_signature_failure(&self, provider: &str, reason: &str) {
        self.signature_validation_failures
            .with_label_values(&[provider, reason])
            .inc();
    }

    fn record_handler_outcome(&self, provider: &str, event_type: &str, state: &str) {
        self.handler_outcomes_total
            .with_label_values(&[provider, event_type, state])
            .inc();
    }

    fn record_outbound_attempt(&self, provider: &str, success: bool, latency: Duration) {
        let result = if success { "success" } else { "failure" };
        self.outbound_attempts_total
            .with_label_values(&[provider, result])
            .inc();
        self.outbound_duration
            .with_label_values(&[provider])
            .observe(latency.as_secs_f64());
    }

    fn record_retry(&self, provider: &str) {
        self.retry_attempts_total.with_label_values(&[provider]).inc();
    }

    fn record_circuit_transition(&self, provider: &str, status: CircuitStatus) {
        self.circuit_breaker_state
            .with_label_values(&[provider])
            .set(status.as_gauge());
        self.circuit_transitions_total
            .with_label_values(&[provider, status.as_str()])
            .inc();
    }

    fn record_queue_rejection(&self) {
        self.queue_rejections_total.inc();
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
