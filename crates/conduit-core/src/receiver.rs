//! # Webhook Receiver
//!
//! Entry point for inbound webhooks: authenticate, deduplicate, enqueue.
//!
//! The receiver never waits for a handler. Once an event is admitted and its
//! key is queued the caller gets `Accepted`; handling happens on the worker
//! pool. A repeated delivery of a known key gets `Duplicate` whatever state
//! the original is in, so provider-side retries see a success response.
//!
//! A queue slot is reserved before the ledger insert. If no slot is free the
//! webhook is shed with [`ReceiveError::Overloaded`] and nothing is recorded,
//! so the provider's own retry delivers it later.

use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::{QueueError, WorkQueue};
use crate::event_store::{AdmitOutcome, EventKey, EventState, EventStore, EventStoreError};
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use crate::signature::{SignatureError, SignatureVerifier};
use crate::{ErrorCategory, ValidationError};

const MAX_ID_LENGTH: usize = 256;

/// Minimal JSON body every provider webhook carries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEnvelope {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Successful receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Newly admitted and queued
    Accepted { key: EventKey },
    /// Already known; nothing was done
    Duplicate { key: EventKey, state: EventState },
}

impl ReceiveOutcome {
    pub fn key(&self) -> &EventKey {
        match self {
            Self::Accepted { key } | Self::Duplicate { key, .. } => key,
        }
    }
}

/// Rejected receive.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] SignatureError),

    #[error("Invalid webhook: {0}")]
    Validation(#[from] ValidationError),

    #[error("Webhook queue is full")]
    Overloaded,

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl ReceiveError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Overloaded => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Overloaded => ErrorCategory::Transient,
            Self::Store(e) => e.category(),
        }
    }
}

/// Authenticates, deduplicates and queues inbound webhooks.
#[derive(Clone)]
pub struct WebhookReceiver {
    verifier: SignatureVerifier,
    store: Arc<dyn EventStore>,
    queue: WorkQueue,
    metrics: Arc<dyn MetricsCollector>,
}

impl WebhookReceiver {
    pub fn new(verifier: SignatureVerifier, store: Arc<dyn EventStore>, queue: WorkQueue) -> Self {
        Self {
            verifier,
            store,
            queue,
            metrics: Arc::new(NoOpMetricsCollector),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Receive a webhook whose id and type are already known.
    #[instrument(skip(self, raw_body, signature_header), fields(body_len = raw_body.len()))]
    pub async fn receive(
        &self,
        provider: &str,
        raw_body: Bytes,
        signature_header: Option<&str>,
        event_id: &str,
        event_type: &str,
    ) -> Result<ReceiveOutcome, ReceiveError> {
        self.authenticate(provider, &raw_body, signature_header)?;
        let result = self.admit(provider, raw_body, event_id, event_type).await;
        self.record(provider, &result);
        result
    }

    /// Receive a webhook from its raw HTTP body.
    ///
    /// The signature is checked before the body is parsed.
    #[instrument(skip(self, raw_body, signature_header), fields(body_len = raw_body.len()))]
    pub async fn receive_http(
        &self,
        provider: &str,
        raw_body: Bytes,
        signature_header: Option<&str>,
    ) -> Result<ReceiveOutcome, ReceiveError> {
        self.authenticate(provider, &raw_body, signature_header)?;

        let result = match parse_envelope(&raw_body) {
            Ok(envelope) => {
                self.admit(provider, raw_body, &envelope.event_id, &envelope.event_type)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        self.record(provider, &result);
        result
    }

    fn authenticate(
        &self,
        provider: &str,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<(), ReceiveError> {
        self.verifier
            .verify(provider, raw_body, signature_header)
            .map_err(|e| {
                self.metrics.record_signature_failure(provider, e.reason());
                self.metrics.record_webhook(provider, "rejected");
                ReceiveError::from(e)
            })
    }

    async fn admit(
        &self,
        provider: &str,
        raw_body: Bytes,
        event_id: &str,
        event_type: &str,
    ) -> Result<ReceiveOutcome, ReceiveError> {
        validate_id("event_id", event_id)?;
        validate_id("event_type", event_type)?;

        let key = EventKey::new(provider, event_id);

        // Duplicates are answered without taking a queue slot
        if let Some(existing) = self.store.get(&key).await? {
            debug!(event = %key, state = %existing.state, "Duplicate webhook");
            return Ok(ReceiveOutcome::Duplicate {
                key,
                state: existing.state,
            });
        }

        let slot = self.queue.try_reserve().map_err(|e| {
            match e {
                QueueError::Full => {
                    warn!(event = %key, "Work queue full, shedding webhook");
                    self.metrics.record_queue_rejection();
                }
                QueueError::Closed => warn!(event = %key, "Work queue closed, rejecting webhook"),
            }
            ReceiveError::Overloaded
        })?;

        match self.store.try_admit(&key, event_type, raw_body).await? {
            AdmitOutcome::Admitted => {
                slot.submit(key.clone());
                info!(event = %key, event_type = %event_type, "Webhook accepted");
                Ok(ReceiveOutcome::Accepted { key })
            }
            AdmitOutcome::Duplicate { state } => {
                debug!(event = %key, state = %state, "Duplicate webhook lost admission race");
                Ok(ReceiveOutcome::Duplicate { key, state })
            }
        }
    }

    fn record(&self, provider: &str, result: &Result<ReceiveOutcome, ReceiveError>) {
        let outcome = match result {
            Ok(ReceiveOutcome::Accepted { .. }) => "accepted",
            Ok(ReceiveOutcome::Duplicate { .. }) => "duplicate",
            Err(ReceiveError::Authentication(_)) => "rejected",
            Err(ReceiveError::Validation(_)) => "invalid",
            Err(ReceiveError::Overloaded) => "overloaded",
            Err(ReceiveError::Store(_)) => "error",
        };
        self.metrics.record_webhook(provider, outcome);
    }
}

impl std::fmt::Debug for WebhookReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookReceiver")
            .field("queue_capacity", &self.queue.max_capacity())
            .finish()
    }
}

fn parse_envelope(raw_body: &[u8]) -> Result<WebhookEnvelope, ValidationError> {
    serde_json::from_slice(raw_body).map_err(|e| ValidationError::InvalidFormat {
        field: "body".to_string(),
        message: e.to_string(),
    })
}

fn validate_id(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max_length: MAX_ID_LENGTH,
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;
