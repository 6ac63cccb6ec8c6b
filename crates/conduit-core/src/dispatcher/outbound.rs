//! Outbound calls to providers.
//!
//! [`OutboundSender::send`] drives one logical call through the provider's
//! circuit breaker and retry policy:
//!
//! 1. Tenant-scoped calls are checked against the [`AuthorizationGate`].
//! 2. The circuit is consulted before every attempt. An open circuit fails
//!    fast with no network traffic and no retry.
//! 3. Each attempt is bounded by the provider timeout.
//! 4. 2xx succeeds. 408, 429, 5xx, timeouts and connection errors are
//!    transient and retried with backoff. Any other status is a permanent
//!    rejection returned to the caller without retry.
//! 5. A backoff sleep is abandoned as soon as the circuit opens.
//!
//! Every attempt of one logical call carries the same `X-Idempotency-Key`,
//! a UUIDv5 derived from the provider name and the operation id. Callers that
//! pass a stable operation id therefore keep the same key across process
//! restarts.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::DispatchError;
use crate::audit::{self, AuditRecord, AuditSink, OutboundCallRecord, TracingAuditSink};
use crate::authorization::{AllowAllGate, AuthorizationGate};
use crate::circuit_breaker::CircuitBreaker;
use crate::health::CallObserver;
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use crate::provider::{AuthType, Provider, ProviderRegistry};
use crate::retry::RetryPolicy;
use crate::signature::SignatureVerifier;
use crate::{Timestamp, ValidationError};

/// Namespace for deriving outbound idempotency keys.
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_5b0e_9a3d_4f4b_8e2a_1d7c_3b5e_9f01);

pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Deterministic idempotency key for one logical send.
pub fn idempotency_key(provider: &str, operation_id: &str) -> Uuid {
    Uuid::new_v5(
        &IDEMPOTENCY_NAMESPACE,
        format!("{}:{}", provider, operation_id).as_bytes(),
    )
}

// ============================================================================
// Requests and Responses
// ============================================================================

/// A logical outbound call requested by application code or a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub provider: String,
    /// Path relative to the provider's base URL
    pub endpoint: String,
    pub payload: serde_json::Value,
    /// Stable id for this logical operation; generated when absent
    pub operation_id: Option<String>,
    /// Set for tenant-scoped calls, which pass the authorization gate first
    pub tenant_id: Option<String>,
    /// Caps the provider's attempt budget for this call
    pub max_attempts: Option<u32>,
}

impl OutboundRequest {
    pub fn new(
        provider: impl Into<String>,
        endpoint: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
            payload,
            operation_id: None,
            tenant_id: None,
            max_attempts: None,
        }
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Make one attempt only and leave any retry to the caller.
    pub fn single_attempt(mut self) -> Self {
        self.max_attempts = Some(1);
        self
    }
}

/// Successful provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: Bytes,
    pub attempts: u32,
    pub idempotency_key: Uuid,
}

// ============================================================================
// Transport
// ============================================================================

/// One HTTP exchange as seen by the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Transport-level failure; all variants are retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {message}")]
    Connect { message: String },

    #[error("Request failed: {message}")]
    Request { message: String },
}

/// HTTP client abstraction so that tests can script provider behavior.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// [`OutboundTransport`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OutboundTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(TransportResponse { status, body })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect {
            message: err.to_string(),
        }
    } else {
        TransportError::Request {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Outcome classification
// ============================================================================

#[derive(Debug)]
enum AttemptOutcome {
    Success(TransportResponse),
    Rejected(TransportResponse),
    Transient {
        status: Option<u16>,
        message: String,
    },
}

impl AttemptOutcome {
    fn from_response(response: TransportResponse) -> Self {
        match response.status {
            200..=299 => Self::Success(response),
            408 | 429 | 500..=599 => Self::Transient {
                status: Some(response.status),
                message: format!("HTTP {}", response.status),
            },
            _ => Self::Rejected(response),
        }
    }

    /// Whether the provider answered in a way that shows it is up.
    ///
    /// A 4xx rejection is the caller's fault, not the provider's.
    fn provider_healthy(&self) -> bool {
        !matches!(self, Self::Transient { .. })
    }
}

// ============================================================================
// OutboundSender
// ============================================================================

/// Sends outbound calls with circuit breaking, retry and auditing.
pub struct OutboundSender {
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn OutboundTransport>,
    gate: Arc<dyn AuthorizationGate>,
    audit: Arc<dyn AuditSink>,
    observer: Option<Arc<dyn CallObserver>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl OutboundSender {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn OutboundTransport>,
    ) -> Self {
        Self {
            registry,
            breaker,
            transport,
            gate: Arc::new(AllowAllGate),
            audit: Arc::new(TracingAuditSink),
            observer: None,
            metrics: Arc::new(NoOpMetricsCollector),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AuthorizationGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Feed per-attempt latency and success to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Send one logical call.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::CircuitOpen`] if the circuit is open at any attempt
    ///   or opens during a backoff sleep
    /// - [`DispatchError::Rejected`] for a non-retryable HTTP status
    /// - [`DispatchError::Exhausted`] once the attempt budget is spent
    /// - [`DispatchError::Unauthorized`] if the tenant gate denies the call
    #[instrument(
        skip(self, request),
        fields(provider = %request.provider, endpoint = %request.endpoint)
    )]
    pub async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, DispatchError> {
        let provider = self.provider(&request.provider)?;

        if let Some(tenant_id) = &request.tenant_id {
            let authorized = self
                .gate
                .is_authorized(tenant_id, &request.provider, &request.endpoint)
                .await?;
            if !authorized {
                warn!(tenant_id = %tenant_id, "Outbound call denied for tenant");
                return Err(DispatchError::Unauthorized {
                    tenant_id: tenant_id.clone(),
                    provider: request.provider.clone(),
                });
            }
        }

        let url = provider.endpoint_url(&request.endpoint)?;
        let body = Bytes::from(serde_json::to_vec(&request.payload).map_err(|e| {
            ValidationError::InvalidFormat {
                field: "payload".to_string(),
                message: e.to_string(),
            }
        })?);
        let operation_id = request
            .operation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = idempotency_key(&request.provider, &operation_id);
        let headers = build_headers(&provider, &body, key)?;

        let mut policy = RetryPolicy::for_provider(&provider);
        if let Some(limit) = request.max_attempts {
            policy.max_attempts = policy.max_attempts.min(limit.max(1));
        }
        let started_at = Timestamp::now();
        let mut attempts = 0u32;
        let mut last_status = None;

        loop {
            let permit = match self.breaker.allow(&request.provider) {
                Ok(permit) => permit,
                Err(open) => {
                    if attempts > 0 {
                        self.audit_failure(
                            &request,
                            key,
                            attempts,
                            started_at,
                            last_status,
                            &open.to_string(),
                        );
                    }
                    return Err(open.into());
                }
            };
            attempts += 1;

            let transport_request = TransportRequest {
                method: Method::POST,
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
            };

            let started = Instant::now();
            let attempt =
                tokio::time::timeout(provider.timeout, self.transport.send(transport_request));
            let outcome = match attempt.await {
                Ok(Ok(response)) => AttemptOutcome::from_response(response),
                Ok(Err(e)) => AttemptOutcome::Transient {
                    status: None,
                    message: e.to_string(),
                },
                Err(_) => AttemptOutcome::Transient {
                    status: None,
                    message: format!("timed out after {}ms", provider.timeout.as_millis()),
                },
            };
            let latency = started.elapsed();
            let healthy = outcome.provider_healthy();

            self.breaker.record_result(permit, healthy, latency);
            self.metrics
                .record_outbound_attempt(&request.provider, healthy, latency);
            if let Some(observer) = &self.observer {
                observer.record_call(&request.provider, latency, healthy);
            }

            match outcome {
                AttemptOutcome::Success(response) => {
                    debug!(
                        attempts,
                        status = response.status,
                        latency_ms = latency.as_millis() as u64,
                        "Outbound call succeeded"
                    );
                    return Ok(OutboundResponse {
                        status: response.status,
                        body: response.body,
                        attempts,
                        idempotency_key: key,
                    });
                }
                AttemptOutcome::Rejected(response) => {
                    let body_text = String::from_utf8_lossy(&response.body).into_owned();
                    warn!(
                        attempts,
                        status = response.status,
                        "Outbound call rejected by provider"
                    );
                    self.audit_failure(
                        &request,
                        key,
                        attempts,
                        started_at,
                        Some(response.status),
                        &format!("HTTP {}", response.status),
                    );
                    return Err(DispatchError::Rejected {
                        provider: request.provider.clone(),
                        status: response.status,
                        body: body_text,
                    });
                }
                AttemptOutcome::Transient { status, message } => {
                    last_status = status.or(last_status);

                    if !policy.should_retry(attempts) {
                        warn!(attempts, error = %message, "Outbound call exhausted retries");
                        self.audit_failure(
                            &request,
                            key,
                            attempts,
                            started_at,
                            last_status,
                            &message,
                        );
                        return Err(DispatchError::Exhausted {
                            provider: request.provider.clone(),
                            attempts,
                            last_error: message,
                        });
                    }

                    let delay = policy.calculate_delay(attempts - 1);
                    info!(
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Outbound call failed, retrying"
                    );
                    self.metrics.record_retry(&request.provider);

                    if let Err(open) = self
                        .breaker
                        .sleep_unless_open(&request.provider, delay)
                        .await
                    {
                        warn!(attempts, "Circuit opened during backoff, abandoning call");
                        self.audit_failure(
                            &request,
                            key,
                            attempts,
                            started_at,
                            last_status,
                            &open.to_string(),
                        );
                        return Err(open.into());
                    }
                }
            }
        }
    }

    fn provider(&self, name: &str) -> Result<Arc<Provider>, DispatchError> {
        let provider = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::UnknownProvider {
                provider: name.to_string(),
            })?;
        if !provider.is_active {
            return Err(DispatchError::InactiveProvider {
                provider: name.to_string(),
            });
        }
        Ok(provider.clone())
    }

    fn audit_failure(
        &self,
        request: &OutboundRequest,
        key: Uuid,
        attempts: u32,
        started_at: Timestamp,
        result_status: Option<u16>,
        error: &str,
    ) {
        audit::emit(
            &self.audit,
            AuditRecord::OutboundCall(OutboundCallRecord {
                provider: request.provider.clone(),
                endpoint: request.endpoint.clone(),
                idempotency_key: key,
                tenant_id: request.tenant_id.clone(),
                attempts,
                started_at,
                result_status,
                error: error.to_string(),
            }),
        );
    }
}

impl std::fmt::Debug for OutboundSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSender")
            .field("providers", &self.registry.len())
            .finish()
    }
}

/// Content type, idempotency key and provider-specific auth headers.
fn build_headers(
    provider: &Provider,
    body: &[u8],
    key: Uuid,
) -> Result<HeaderMap, DispatchError> {
    let invalid_header = |field: &str| {
        DispatchError::Validation(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "not a valid HTTP header value".to_string(),
        })
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
        HeaderValue::from_str(&key.to_string()).map_err(|_| invalid_header("idempotency_key"))?,
    );

    let credential = || {
        provider
            .api_credential
            .as_ref()
            .map(|c| c.expose_secret())
            .unwrap_or_default()
    };

    match provider.auth_type {
        AuthType::ApiKey => {
            let mut value =
                HeaderValue::from_str(credential()).map_err(|_| invalid_header("api_credential"))?;
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
        }
        AuthType::OAuth2 => {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", credential()))
                .map_err(|_| invalid_header("api_credential"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        AuthType::Hmac => {
            let signature = SignatureVerifier::sign(&provider.webhook_secret, body);
            headers.insert(
                HeaderName::from_static(SIGNATURE_HEADER),
                HeaderValue::from_str(&signature).map_err(|_| invalid_header("signature"))?,
            );
        }
    }

    Ok(headers)
}

#[cfg(test)]
#[path = "outbound_tests.rs"]
mod tests;
