//! # Conduit API
//!
//! HTTP surface of the Conduit integration engine.
//!
//! - `POST /webhooks/{provider}` admits inbound webhooks through the
//!   [`WebhookReceiver`] and answers before any handler runs
//! - `/health`, `/ready` and `/metrics` expose provider health, readiness and
//!   Prometheus metrics
//! - `/admin/*` lets operators inspect the event ledger, re-drive failed
//!   events and force circuit states
//!
//! Admin routes carry no authentication of their own; bind the service on an
//! internal interface or put it behind a gateway that does.

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use conduit_core::{
    audit::{self, AuditRecord},
    dispatcher::SIGNATURE_HEADER,
    AuditSink, CircuitSnapshot, Dispatcher, EventKey, EventStore, HealthMonitor, ReceiveOutcome,
    TracingAuditSink, WebhookReceiver, WorkQueue,
};
use std::future::{Future, IntoFuture};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};

pub mod config;
pub mod errors;
pub mod metrics;
pub mod responses;

pub use config::{LoggingConfig, ServerConfig, ServiceConfig};
pub use errors::{AdminError, ConfigError, ServiceError, WebhookHandlerError};
pub use metrics::ServiceMetrics;
pub use responses::*;

/// Header carrying the request correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

// ============================================================================
// Application State
// ============================================================================

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub receiver: WebhookReceiver,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: WorkQueue,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<ServiceMetrics>,
    pub audit: Arc<dyn AuditSink>,
    pub max_body_size: usize,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        receiver: WebhookReceiver,
        dispatcher: Arc<Dispatcher>,
        queue: WorkQueue,
        health: Arc<HealthMonitor>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            receiver,
            dispatcher,
            queue,
            health,
            metrics,
            audit: Arc::new(TracingAuditSink),
            max_body_size: ServerConfig::default().max_body_size,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Report ready once the worker pool is consuming the queue.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Stop reporting ready, e.g. when shutdown begins.
    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.queue.is_closed()
    }
}

// ============================================================================
// HTTP Server
// ============================================================================

/// Create HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let webhook_routes = Router::new()
        .route("/webhooks/{provider}", post(handle_webhook))
        .layer(DefaultBodyLimit::max(state.max_body_size));

    let health_routes = Router::new()
        .route("/health", get(handle_health_check))
        .route("/ready", get(handle_readiness_check));

    let observability_routes = Router::new().route("/metrics", get(metrics_endpoint));

    let admin_routes = Router::new()
        .route("/admin/events", get(list_events))
        .route("/admin/events/{provider}/{event_id}", get(get_event))
        .route(
            "/admin/events/{provider}/{event_id}/redrive",
            post(redrive_event),
        )
        .route("/admin/circuits", get(list_circuits))
        .route("/admin/circuits/{provider}/open", post(open_circuit))
        .route("/admin/circuits/{provider}/close", post(close_circuit));

    Router::new()
        .merge(webhook_routes)
        .merge(health_routes)
        .merge(observability_routes)
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(request_logging_middleware))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                ))
                .into_inner(),
        )
        .with_state(state)
}

/// Serve `state` on the configured address until `shutdown` resolves.
///
/// In-flight requests are allowed to finish after `shutdown` fires, for at
/// most `shutdown_timeout_seconds`; new connections are refused immediately.
pub async fn start_server<F>(
    config: &ServerConfig,
    state: AppState,
    shutdown: F,
) -> Result<(), ServiceError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.socket_addr()?;
    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::BindFailed {
                address: addr.to_string(),
                message: e.to_string(),
            })?;

    info!("Starting HTTP server on {}", addr);

    let drain_timeout = Duration::from_secs(config.shutdown_timeout_seconds);
    let (draining_tx, draining_rx) = oneshot::channel::<()>();
    let shutdown = async move {
        shutdown.await;
        let _ = draining_tx.send(());
    };

    let app = create_router(state);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .into_future();
    tokio::pin!(server);

    let drain_deadline = async move {
        match draining_rx.await {
            Ok(()) => tokio::time::sleep(drain_timeout).await,
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = &mut server => {
            result.map_err(|e| ServiceError::ServerFailed {
                message: e.to_string(),
            })?;
            info!("HTTP server shutdown complete");
        }
        _ = drain_deadline => {
            warn!(
                timeout_seconds = drain_timeout.as_secs(),
                "In-flight requests did not finish before the shutdown timeout"
            );
        }
    }

    Ok(())
}

// ============================================================================
// Webhook Handlers
// ============================================================================

/// Handle an inbound provider webhook
///
/// Responds as soon as the event is admitted and queued:
/// - `202 Accepted` for a new event
/// - `200 OK` for a repeated delivery, whatever state the original is in
///
/// Failures map through [`WebhookHandlerError`].
#[instrument(skip(state, headers, body), fields(body_len = body.len()))]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), WebhookHandlerError> {
    // A non-text header cannot match any digest; the verifier rejects it.
    let signature = headers
        .get(SIGNATURE_HEADER)
        .map(|value| String::from_utf8_lossy(value.as_bytes()));

    let outcome = state
        .receiver
        .receive_http(&provider, body, signature.as_deref())
        .await?;

    let response = match outcome {
        ReceiveOutcome::Accepted { ref key } => {
            (StatusCode::ACCEPTED, Json(WebhookResponse::accepted(key)))
        }
        ReceiveOutcome::Duplicate {
            ref key,
            state: existing,
        } => (
            StatusCode::OK,
            Json(WebhookResponse::duplicate(key, existing)),
        ),
    };
    Ok(response)
}

// ============================================================================
// Health Check Handlers
// ============================================================================

/// Latest published provider health
#[instrument(skip(state))]
async fn handle_health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::from_snapshot(&state.health.snapshot()))
}

/// Readiness check for load balancers and orchestrators
#[instrument(skip(state))]
async fn handle_readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let ready = state.is_ready();
    let response = ReadinessResponse {
        ready,
        timestamp: conduit_core::Timestamp::now(),
        queue_available: state.queue.capacity(),
        queue_capacity: state.queue.max_capacity(),
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

// ============================================================================
// Observability Handlers
// ============================================================================

/// Prometheus metrics endpoint
#[instrument(skip_all)]
async fn metrics_endpoint(State(state): State<AppState>) -> Result<String, StatusCode> {
    let depth = state.queue.max_capacity() - state.queue.capacity();
    state.metrics.queue_depth.set(depth as i64);

    state.metrics.encode().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

// ============================================================================
// Admin Handlers
// ============================================================================

/// List ledger records, newest first
#[instrument(skip(state))]
async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventListParams>,
) -> Result<Json<EventListResponse>, AdminError> {
    let events = state.dispatcher.store().list(&params.to_query()).await?;

    let events: Vec<_> = events.iter().map(EventRecordResponse::summary).collect();
    Ok(Json(EventListResponse {
        total: events.len(),
        events,
    }))
}

/// Fetch one ledger record with its payload
#[instrument(skip(state))]
async fn get_event(
    State(state): State<AppState>,
    Path((provider, event_id)): Path<(String, String)>,
) -> Result<Json<EventRecordResponse>, AdminError> {
    let key = EventKey::new(provider, event_id);
    let event = state
        .dispatcher
        .store()
        .get(&key)
        .await?
        .ok_or_else(|| AdminError::NotFound {
            what: format!("Event '{}'", key),
        })?;

    Ok(Json(EventRecordResponse::detail(&event)))
}

/// Move a failed or dead-lettered event back to `received` and queue it
#[instrument(skip(state))]
async fn redrive_event(
    State(state): State<AppState>,
    Path((provider, event_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<EventRecordResponse>), AdminError> {
    let key = EventKey::new(provider, event_id);
    let event = state.dispatcher.redrive(&key, &state.queue).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EventRecordResponse::summary(&event)),
    ))
}

/// Snapshot of every provider circuit
#[instrument(skip(state))]
async fn list_circuits(State(state): State<AppState>) -> Json<CircuitListResponse> {
    Json(CircuitListResponse {
        circuits: state.dispatcher.breaker().snapshots(),
    })
}

/// Hold a provider's circuit open until it is explicitly closed
#[instrument(skip(state))]
async fn open_circuit(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<CircuitSnapshot>, AdminError> {
    let snapshot = state
        .dispatcher
        .breaker()
        .force_open(&provider)
        .ok_or_else(|| circuit_not_found(&provider))?;

    warn!(provider = %provider, "Circuit forced open by operator");
    audit_override(&state, &snapshot);
    Ok(Json(snapshot))
}

/// Close a provider's circuit and clear its failure count
#[instrument(skip(state))]
async fn close_circuit(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<CircuitSnapshot>, AdminError> {
    let snapshot = state
        .dispatcher
        .breaker()
        .force_close(&provider)
        .ok_or_else(|| circuit_not_found(&provider))?;

    info!(provider = %provider, "Circuit forced closed by operator");
    audit_override(&state, &snapshot);
    Ok(Json(snapshot))
}

fn circuit_not_found(provider: &str) -> AdminError {
    AdminError::NotFound {
        what: format!("Circuit for provider '{}'", provider),
    }
}

fn audit_override(state: &AppState, snapshot: &CircuitSnapshot) {
    audit::emit(
        &state.audit,
        AuditRecord::CircuitOverride {
            provider: snapshot.provider.clone(),
            status: snapshot.status,
        },
    );
}

// ============================================================================
// Middleware
// ============================================================================

/// Request logging middleware with correlation ID tracking
///
/// Uses the caller's `x-correlation-id` when present, otherwise generates
/// one. The id is recorded on the span, stored in request extensions and
/// echoed on the response.
#[instrument(skip(request, next), fields(
    method = %request.method(),
    uri = %request.uri(),
    correlation_id
))]
async fn request_logging_middleware(
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::Span::current().record("correlation_id", correlation_id.as_str());
    request.extensions_mut().insert(correlation_id.clone());

    let mut response = next.run(request).await;
    let duration = start.elapsed();

    if let Ok(header_value) = correlation_id.parse() {
        response
            .headers_mut()
            .insert(CORRELATION_ID_HEADER, header_value);
    }

    let status = response.status();

    if status.is_server_error() {
        error!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed with server error"
        );
    } else if status.is_client_error() {
        warn!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed with client error"
        );
    } else {
        info!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed successfully"
        );
    }

    response
}

/// Metrics collection middleware
///
/// Labels requests with the matched route template rather than the raw path
/// so provider names and event ids don't explode label cardinality.
async fn metrics_middleware(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let start = std::time::Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    state.metrics.record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed(),
    );
    response
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
