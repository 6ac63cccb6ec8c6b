//! Response types and query parameters for the API.

use conduit_core::{
    CircuitSnapshot, EventKey, EventQuery, EventState, HealthSnapshot, HealthStatus,
    InboundEvent, ProviderHealth, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of records returned by the event listing.
pub const DEFAULT_EVENT_LIMIT: usize = 100;

/// Largest listing an operator can request.
pub const MAX_EVENT_LIMIT: usize = 1000;

// ============================================================================
// Webhook
// ============================================================================

/// Webhook processing response
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub provider: String,
    pub event_id: String,
    /// `accepted` for a new event, `duplicate` for a known one
    pub status: String,
    /// State of the existing record for duplicates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EventState>,
}

impl WebhookResponse {
    pub fn accepted(key: &EventKey) -> Self {
        Self {
            provider: key.provider.clone(),
            event_id: key.event_id.clone(),
            status: "accepted".to_string(),
            state: None,
        }
    }

    pub fn duplicate(key: &EventKey, state: EventState) -> Self {
        Self {
            provider: key.provider.clone(),
            event_id: key.event_id.clone(),
            status: "duplicate".to_string(),
            state: Some(state),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Worst status across all providers
    pub status: HealthStatus,
    pub timestamp: Timestamp,
    pub generated_at: Timestamp,
    pub providers: BTreeMap<String, ProviderHealth>,
    pub version: String,
}

impl HealthResponse {
    pub fn from_snapshot(snapshot: &HealthSnapshot) -> Self {
        let status = snapshot
            .providers
            .values()
            .map(|p| p.status)
            .fold(HealthStatus::Healthy, worst);

        Self {
            status,
            timestamp: Timestamp::now(),
            generated_at: snapshot.generated_at,
            providers: snapshot.providers.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn worst(a: HealthStatus, b: HealthStatus) -> HealthStatus {
    match (a, b) {
        (HealthStatus::Down, _) | (_, HealthStatus::Down) => HealthStatus::Down,
        (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub timestamp: Timestamp,
    /// Free slots in the work queue
    pub queue_available: usize,
    pub queue_capacity: usize,
}

// ============================================================================
// Admin
// ============================================================================

/// Query parameters for `GET /admin/events`
#[derive(Debug, Default, Deserialize)]
pub struct EventListParams {
    pub provider: Option<String>,
    pub state: Option<EventState>,
    pub limit: Option<usize>,
}

impl EventListParams {
    pub fn to_query(&self) -> EventQuery {
        EventQuery {
            provider: self.provider.clone(),
            state: self.state,
            limit: Some(
                self.limit
                    .unwrap_or(DEFAULT_EVENT_LIMIT)
                    .clamp(1, MAX_EVENT_LIMIT),
            ),
        }
    }
}

/// One ledger record as shown to operators.
///
/// The payload is included as JSON when it parses, otherwise only its size
/// is reported.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventRecordResponse {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub state: EventState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub received_at: Timestamp,
    pub updated_at: Timestamp,
    pub processed_at: Option<Timestamp>,
    pub redrive_count: u32,
    pub payload_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EventRecordResponse {
    /// Summary without the payload, for listings.
    pub fn summary(event: &InboundEvent) -> Self {
        Self {
            provider: event.key.provider.clone(),
            event_id: event.key.event_id.clone(),
            event_type: event.event_type.clone(),
            state: event.state,
            attempt_count: event.attempt_count,
            last_error: event.last_error.clone(),
            received_at: event.received_at,
            updated_at: event.updated_at,
            processed_at: event.processed_at,
            redrive_count: event.redrive_count,
            payload_size: event.raw_payload.len(),
            payload: None,
        }
    }

    /// Full record including the decoded payload.
    pub fn detail(event: &InboundEvent) -> Self {
        Self {
            payload: serde_json::from_slice(&event.raw_payload).ok(),
            ..Self::summary(event)
        }
    }
}

/// Event list response
#[derive(Debug, Serialize, Deserialize)]
pub struct EventListResponse {
    pub events: Vec<EventRecordResponse>,
    pub total: usize,
}

/// Circuit list response
#[derive(Debug, Serialize)]
pub struct CircuitListResponse {
    pub circuits: Vec<CircuitSnapshot>,
}
