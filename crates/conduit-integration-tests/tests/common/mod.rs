//! Common test utilities for conduit integration tests
//!
//! This module provides:
//! - A fully wired service stack with a running worker pool
//! - Scripted event handlers
//! - Helpers for building signed webhook requests and polling the ledger

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use conduit_api::{create_router, AppState, ServiceMetrics};
use conduit_core::{
    CircuitBreaker, Dispatcher, DispatcherConfig, EventHandler, EventKey, EventState, EventStore,
    HandlerContext, HandlerError, HandlerRegistry, HealthConfig, HealthMonitor, HttpProbe,
    InMemoryEventStore, InboundEvent, OutboundSender, ProviderConfig, ProviderRegistry,
    ReqwestTransport, SecretString, SignatureVerifier, WebhookReceiver, WorkerPool,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const USERS: &str = "user_service";
pub const USERS_SECRET: &str = "user-webhook-secret";

/// How long to wait for a worker to move an event to the expected state.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Scripted handler
// ============================================================================

/// Handler that replays a script of results, then succeeds.
#[derive(Default)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Result<(), HandlerError>>>,
    calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(script: Vec<Result<(), HandlerError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(
        &self,
        _event: &InboundEvent,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

// ============================================================================
// Service stack
// ============================================================================

/// A service wired the way the binary wires it, minus the listener.
pub struct TestStack {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryEventStore>,
    pub registry: Arc<ProviderRegistry>,
    pool: Option<WorkerPool>,
}

impl TestStack {
    /// Start a stack with `providers` and the handlers built by `handlers`.
    pub fn start(
        providers: Vec<ProviderConfig>,
        handlers: impl FnOnce(&ProviderRegistry) -> HandlerRegistry,
    ) -> Self {
        let registry = Arc::new(ProviderRegistry::from_configs(providers).unwrap());
        let handlers = handlers(registry.as_ref());

        let metrics = ServiceMetrics::new().unwrap();
        let store = Arc::new(InMemoryEventStore::new());
        let breaker = Arc::new(CircuitBreaker::new(&registry).with_metrics(metrics.clone()));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            breaker.clone(),
            Arc::new(HttpProbe::default()),
            HealthConfig::default(),
        ));
        let sender = Arc::new(
            OutboundSender::new(
                registry.clone(),
                breaker.clone(),
                Arc::new(ReqwestTransport::default()),
            )
            .with_observer(health.clone())
            .with_metrics(metrics.clone()),
        );
        let dispatcher = Arc::new(
            Dispatcher::new(registry.clone(), store.clone(), breaker, handlers, sender)
                .with_metrics(metrics.clone()),
        );

        let config = DispatcherConfig {
            worker_count: 2,
            queue_capacity: 16,
            ..DispatcherConfig::default()
        };
        let (pool, queue) =
            WorkerPool::start(dispatcher.clone(), &config, CancellationToken::new());

        let receiver = WebhookReceiver::new(
            SignatureVerifier::new(registry.clone()),
            store.clone(),
            queue.clone(),
        )
        .with_metrics(metrics.clone());
        let state = AppState::new(receiver, dispatcher, queue, health, metrics);
        state.mark_ready();

        Self {
            router: create_router(state.clone()),
            state,
            store,
            registry,
            pool: Some(pool),
        }
    }

    /// Start a stack with only the source provider and a single handler.
    pub fn with_handler(event_type: &str, handler: Arc<dyn EventHandler>) -> Self {
        let event_type = event_type.to_string();
        Self::start(vec![source_provider()], move |_| {
            HandlerRegistry::new().register(event_type, handler)
        })
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    /// Poll the ledger until the event reaches `expected`.
    pub async fn wait_for_state(&self, event_id: &str, expected: EventState) -> InboundEvent {
        let key = EventKey::new(USERS, event_id);
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            if let Some(event) = self.store.get(&key).await.unwrap() {
                if event.state == expected {
                    return event;
                }
            }
            assert!(
                Instant::now() < deadline,
                "event {} never reached {}",
                key,
                expected
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// The webhook source with fast retries: three attempts, millisecond backoff.
pub fn source_provider() -> ProviderConfig {
    let mut config = ProviderConfig::new(USERS, "http://users.test/", USERS_SECRET);
    config.max_retries = 3;
    config.backoff_base_ms = 1;
    config.backoff_cap_ms = 5;
    config
}

/// A target provider served by a mock server, one attempt per call.
pub fn target_provider(name: &str, base_url: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new(name, base_url, format!("{}-secret", name));
    config.max_retries = 1;
    config.backoff_base_ms = 1;
    config.backoff_cap_ms = 5;
    config
}

pub fn webhook_body(event_id: &str, event_type: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": event_id,
        "event_type": event_type,
        "data": { "user_id": 42 }
    }))
    .unwrap()
}

pub fn webhook_request(body: Vec<u8>, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{}", USERS))
        .header("content-type", "application/json")
        .header("x-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

pub fn signed_webhook(event_id: &str, event_type: &str) -> Request<Body> {
    let body = webhook_body(event_id, event_type);
    let signature = SignatureVerifier::sign(&SecretString::new(USERS_SECRET), &body);
    webhook_request(body, &signature)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}
