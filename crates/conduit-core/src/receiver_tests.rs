//! Tests for webhook admission.

use super::*;
use crate::adapters::InMemoryEventStore;
use crate::circuit_breaker::CircuitStatus;
use crate::event_store::EventQuery;
use crate::provider::{ProviderConfig, ProviderRegistry, SecretString};
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

const USERS: &str = "user_service";
const PAYMENTS: &str = "payment_service";
const USERS_SECRET: &str = "user-webhook-secret";
const PAYMENTS_SECRET: &str = "payment-webhook-secret";

#[derive(Default)]
struct RecordingMetrics {
    webhooks: Mutex<Vec<(String, String)>>,
    signature_failures: Mutex<Vec<String>>,
    queue_rejections: Mutex<u32>,
}

impl MetricsCollector for RecordingMetrics {
    fn record_webhook(&self, provider: &str, outcome: &str) {
        self.webhooks
            .lock()
            .unwrap()
            .push((provider.to_string(), outcome.to_string()));
    }

    fn record_signature_failure(&self, _provider: &str, reason: &str) {
        self.signature_failures
            .lock()
            .unwrap()
            .push(reason.to_string());
    }

    fn record_handler_outcome(&self, _provider: &str, _event_type: &str, _state: &str) {}

    fn record_outbound_attempt(&self, _provider: &str, _success: bool, _latency: Duration) {}

    fn record_retry(&self, _provider: &str) {}

    fn record_circuit_transition(&self, _provider: &str, _status: CircuitStatus) {}

    fn record_queue_rejection(&self) {
        *self.queue_rejections.lock().unwrap() += 1;
    }
}

struct Fixture {
    receiver: WebhookReceiver,
    store: Arc<InMemoryEventStore>,
    queue_rx: mpsc::Receiver<EventKey>,
    metrics: Arc<RecordingMetrics>,
}

fn fixture(queue_capacity: usize) -> Fixture {
    let registry = Arc::new(
        ProviderRegistry::from_configs(vec![
            ProviderConfig::new(USERS, "http://users.test", USERS_SECRET),
            ProviderConfig::new(PAYMENTS, "http://payments.test", PAYMENTS_SECRET),
        ])
        .unwrap(),
    );
    let store = Arc::new(InMemoryEventStore::new());
    let (queue, queue_rx) = WorkQueue::bounded(queue_capacity);
    let metrics = Arc::new(RecordingMetrics::default());
    let receiver = WebhookReceiver::new(SignatureVerifier::new(registry), store.clone(), queue)
        .with_metrics(metrics.clone());
    Fixture {
        receiver,
        store,
        queue_rx,
        metrics,
    }
}

fn body(event_id: &str) -> Bytes {
    Bytes::from(
        serde_json::to_vec(&json!({
            "event_id": event_id,
            "event_type": "user.created",
            "data": { "user_id": 42 }
        }))
        .unwrap(),
    )
}

fn sign(secret: &str, body: &[u8]) -> String {
    SignatureVerifier::sign(&SecretString::new(secret), body)
}

// ============================================================================
// Admission
// ============================================================================

mod admission_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_delivery_is_accepted_once() {
        let mut f = fixture(8);
        let payload = body("evt_123");
        let signature = sign(USERS_SECRET, &payload);

        let first = f
            .receiver
            .receive_http(USERS, payload.clone(), Some(&signature))
            .await
            .unwrap();
        let second = f
            .receiver
            .receive_http(USERS, payload, Some(&signature))
            .await
            .unwrap();

        let key = EventKey::new(USERS, "evt_123");
        assert_eq!(first, ReceiveOutcome::Accepted { key: key.clone() });
        assert_eq!(
            second,
            ReceiveOutcome::Duplicate {
                key: key.clone(),
                state: EventState::Received
            }
        );
        assert_eq!(f.queue_rx.try_recv().unwrap(), key);
        assert!(f.queue_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_raw_payload_is_stored_verbatim() {
        let f = fixture(8);
        let payload =
            Bytes::from_static(b"{\"event_id\":\"evt_9\",  \"event_type\":\"user.created\"}");
        let signature = sign(USERS_SECRET, &payload);

        f.receiver
            .receive_http(USERS, payload.clone(), Some(&signature))
            .await
            .unwrap();

        let stored = f
            .store
            .get(&EventKey::new(USERS, "evt_9"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.raw_payload, payload);
        assert_eq!(stored.event_type, "user.created");
    }

    #[tokio::test]
    async fn test_event_ids_are_scoped_per_provider() {
        let f = fixture(8);
        let users_body = body("evt_1");
        let payments_body = body("evt_1");

        let users = f
            .receiver
            .receive_http(USERS, users_body.clone(), Some(&sign(USERS_SECRET, &users_body)))
            .await
            .unwrap();
        let payments = f
            .receiver
            .receive_http(
                PAYMENTS,
                payments_body.clone(),
                Some(&sign(PAYMENTS_SECRET, &payments_body)),
            )
            .await
            .unwrap();

        assert!(matches!(users, ReceiveOutcome::Accepted { .. }));
        assert!(matches!(payments, ReceiveOutcome::Accepted { .. }));
        assert_eq!(f.store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_admit_exactly_once() {
        let f = fixture(64);
        let receiver = Arc::new(f.receiver);
        let payload = body("evt_race");
        let signature = sign(USERS_SECRET, &payload);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let receiver = receiver.clone();
                let payload = payload.clone();
                let signature = signature.clone();
                tokio::spawn(async move {
                    receiver
                        .receive_http(USERS, payload, Some(&signature))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), ReceiveOutcome::Accepted { .. }) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_with_explicit_ids() {
        let f = fixture(8);
        let payload = Bytes::from_static(b"opaque provider payload");
        let signature = sign(USERS_SECRET, &payload);

        let outcome = f
            .receiver
            .receive(USERS, payload, Some(&signature), "evt_raw", "user.deleted")
            .await
            .unwrap();

        assert_eq!(outcome.key(), &EventKey::new(USERS, "evt_raw"));
    }
}

// ============================================================================
// Rejection
// ============================================================================

mod rejection_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_signature_creates_no_record() {
        let f = fixture(8);
        let payload = body("evt_bad");
        let forged = sign("not-the-secret", &payload);

        let result = f.receiver.receive_http(USERS, payload, Some(&forged)).await;

        assert!(matches!(
            result,
            Err(ReceiveError::Authentication(SignatureError::InvalidSignature))
        ));
        assert!(f.store.is_empty());
        assert_eq!(
            *f.metrics.signature_failures.lock().unwrap(),
            vec!["invalid_signature".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_signature_rejected() {
        let f = fixture(8);

        let result = f.receiver.receive_http(USERS, body("evt_1"), None).await;

        assert!(matches!(
            result,
            Err(ReceiveError::Authentication(SignatureError::MissingSignature))
        ));
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let f = fixture(8);
        let payload = body("evt_1");
        let signature = sign(USERS_SECRET, &payload);

        let result = f.receiver.receive_http("ghost", payload, Some(&signature)).await;

        assert!(matches!(
            result,
            Err(ReceiveError::Authentication(SignatureError::UnknownProvider { .. }))
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_is_validation_error() {
        let f = fixture(8);
        let payload = Bytes::from_static(b"not json");
        let signature = sign(USERS_SECRET, &payload);

        let result = f.receiver.receive_http(USERS, payload, Some(&signature)).await;

        assert!(matches!(result, Err(ReceiveError::Validation(_))));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_event_id_is_validation_error() {
        let f = fixture(8);
        let payload = Bytes::from(
            serde_json::to_vec(&json!({ "event_id": " ", "event_type": "user.created" })).unwrap(),
        );
        let signature = sign(USERS_SECRET, &payload);

        let result = f.receiver.receive_http(USERS, payload, Some(&signature)).await;

        assert!(matches!(
            result,
            Err(ReceiveError::Validation(ValidationError::Required { ref field }))
                if field == "event_id"
        ));
    }

    #[tokio::test]
    async fn test_full_queue_sheds_without_admitting() {
        let f = fixture(1);
        let first = body("evt_1");
        let second = body("evt_2");
        f.receiver
            .receive_http(USERS, first.clone(), Some(&sign(USERS_SECRET, &first)))
            .await
            .unwrap();

        let result = f
            .receiver
            .receive_http(USERS, second.clone(), Some(&sign(USERS_SECRET, &second)))
            .await;

        assert!(matches!(result, Err(ReceiveError::Overloaded)));
        assert!(f
            .store
            .get(&EventKey::new(USERS, "evt_2"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(*f.metrics.queue_rejections.lock().unwrap(), 1);

        // A duplicate of an admitted event needs no queue slot
        let again = f
            .receiver
            .receive_http(USERS, first.clone(), Some(&sign(USERS_SECRET, &first)))
            .await
            .unwrap();
        assert!(matches!(again, ReceiveOutcome::Duplicate { .. }));
    }
}

#[tokio::test]
async fn test_outcomes_are_counted() {
    let f = fixture(8);
    let payload = body("evt_1");
    let signature = sign(USERS_SECRET, &payload);

    f.receiver
        .receive_http(USERS, payload.clone(), Some(&signature))
        .await
        .unwrap();
    f.receiver
        .receive_http(USERS, payload.clone(), Some(&signature))
        .await
        .unwrap();
    let _ = f.receiver.receive_http(USERS, payload, Some("sha256=00")).await;

    let outcomes: Vec<String> = f
        .metrics
        .webhooks
        .lock()
        .unwrap()
        .iter()
        .map(|(_, outcome)| outcome.clone())
        .collect();
    assert_eq!(outcomes, vec!["accepted", "duplicate", "rejected"]);
    assert_eq!(
        f.store
            .list(&EventQuery::default())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_receive_error_classification() {
    assert_eq!(
        ReceiveError::Authentication(SignatureError::MissingSignature).category(),
        ErrorCategory::Authentication
    );
    assert!(ReceiveError::Overloaded.is_transient());
    assert!(!ReceiveError::Validation(ValidationError::Required {
        field: "event_id".to_string()
    })
    .is_transient());
}
