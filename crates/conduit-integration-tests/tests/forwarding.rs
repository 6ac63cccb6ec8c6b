//! Config-routed forwarding to provider APIs served by a mock server.

mod common;

use axum::http::StatusCode;
use common::{post_empty, signed_webhook, source_provider, target_provider, TestStack, USERS};
use conduit_core::{
    AuthType, CircuitStatus, EventState, HandlerRegistry, ProviderRegistry, RouteConfig,
    SecretString,
};
use serde_json::Value;
use wiremock::{
    matchers::{header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

const CRM: &str = "crm";

fn crm_route() -> RouteConfig {
    RouteConfig {
        event_type: "user.created".to_string(),
        source: Some(USERS.to_string()),
        target: CRM.to_string(),
        endpoint: "contacts".to_string(),
    }
}

fn forwarding_stack(server: &MockServer) -> TestStack {
    let mut crm = target_provider(CRM, &format!("{}/api/", server.uri()));
    crm.auth_type = AuthType::ApiKey;
    crm.api_credential = Some(SecretString::new("crm-api-key"));
    crm.failure_threshold = 10;

    TestStack::start(vec![source_provider(), crm], |providers: &ProviderRegistry| {
        HandlerRegistry::new()
            .with_routes(&[crm_route()], providers)
            .unwrap()
    })
}

#[tokio::test]
async fn test_event_payload_is_forwarded_with_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/contacts"))
        .and(header("x-api-key", "crm-api-key"))
        .and(header_exists("x-idempotency-key"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    let stack = forwarding_stack(&server);

    let (status, _) = stack.send(signed_webhook("evt_1", "user.created")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    stack.wait_for_state("evt_1", EventState::Processed).await;

    let requests = server.received_requests().await.unwrap();
    let forwarded: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(forwarded["event_id"], "evt_1");
    assert_eq!(forwarded["data"]["user_id"], 42);
    stack.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_target_dead_letters_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;
    let stack = forwarding_stack(&server);

    stack.send(signed_webhook("evt_2", "user.created")).await;
    let event = stack.wait_for_state("evt_2", EventState::DeadLettered).await;

    assert_eq!(event.attempt_count, 3);
    assert_eq!(
        stack.state.dispatcher.breaker().status(CRM),
        Some(CircuitStatus::Closed)
    );
    stack.shutdown().await;
}

#[tokio::test]
async fn test_target_rejection_marks_event_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("email is required"))
        .expect(1)
        .mount(&server)
        .await;
    let stack = forwarding_stack(&server);

    stack.send(signed_webhook("evt_3", "user.created")).await;
    let event = stack.wait_for_state("evt_3", EventState::Failed).await;

    assert!(event.last_error.unwrap().contains("422"));
    stack.shutdown().await;
}

/// Redelivery after an outage reuses the idempotency key of the first try.
#[tokio::test]
async fn test_redrive_after_outage_reuses_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let stack = forwarding_stack(&server);

    stack.send(signed_webhook("evt_4", "user.created")).await;
    stack.wait_for_state("evt_4", EventState::DeadLettered).await;

    let (status, _) = stack
        .send(post_empty(&format!("/admin/events/{}/evt_4/redrive", USERS)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    stack.wait_for_state("evt_4", EventState::Processed).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 4);
    let keys: Vec<_> = requests
        .iter()
        .map(|r| r.headers.get("x-idempotency-key").unwrap().clone())
        .collect();
    assert!(keys.iter().all(|k| *k == keys[0]));
    stack.shutdown().await;
}
