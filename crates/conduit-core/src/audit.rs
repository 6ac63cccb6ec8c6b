//! Audit reporting.
//!
//! Terminal outcomes and operator actions are handed to an [`AuditSink`].
//! Storage of the audit log is external; the engine only reports. Reporting
//! is fire-and-forget: [`emit`] spawns the write and logs a failure, so an
//! unavailable audit backend never blocks or fails event processing.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitStatus;
use crate::event_store::{EventKey, EventState};
use crate::Timestamp;

/// Outbound call that ended without success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundCallRecord {
    pub provider: String,
    pub endpoint: String,
    pub idempotency_key: Uuid,
    pub tenant_id: Option<String>,
    pub attempts: u32,
    pub started_at: Timestamp,
    /// Last HTTP status received, if any response arrived
    pub result_status: Option<u16>,
    pub error: String,
}

/// Something worth an audit entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    /// Inbound event reached a terminal state
    InboundEvent {
        key: EventKey,
        event_type: String,
        state: EventState,
        attempts: u32,
        error: Option<String>,
    },
    /// Outbound call failed terminally
    OutboundCall(OutboundCallRecord),
    /// Operator re-drove a failed or dead-lettered event
    EventRedriven { key: EventKey, previous: EventState },
    /// Operator forced a circuit state
    CircuitOverride {
        provider: String,
        status: CircuitStatus,
    },
}

/// Audit write failure.
#[derive(Debug, thiserror::Error)]
#[error("Audit write failed: {message}")]
pub struct AuditError {
    pub message: String,
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Sink that writes audit records to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&record).map_err(|e| AuditError {
            message: e.to_string(),
        })?;
        info!(target: "audit", record = %payload, "Audit record");
        Ok(())
    }
}

/// Report `record` without waiting for the sink.
pub fn emit(sink: &Arc<dyn AuditSink>, record: AuditRecord) {
    let sink = sink.clone();
    tokio::spawn(async move {
        if let Err(e) = sink.record(record).await {
            warn!(error = %e, "Failed to write audit record");
        }
    });
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
