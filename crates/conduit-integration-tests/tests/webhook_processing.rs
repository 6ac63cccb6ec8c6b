//! End-to-end webhook intake and dispatch through a running worker pool.

mod common;

use axum::http::StatusCode;
use common::{
    get, post_empty, signed_webhook, webhook_body, webhook_request, ScriptedHandler, TestStack,
    USERS,
};
use conduit_core::{EventKey, EventState, EventStore, HandlerError};

/// A provider retrying a delivery gets a success response, and the handler
/// still runs only once.
#[tokio::test]
async fn test_duplicate_delivery_is_handled_once() {
    let handler = ScriptedHandler::succeeding();
    let stack = TestStack::with_handler("user.created", handler.clone());

    let (first, body) = stack.send(signed_webhook("evt_1", "user.created")).await;
    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");

    stack.wait_for_state("evt_1", EventState::Processed).await;

    let (second, body) = stack.send(signed_webhook("evt_1", "user.created")).await;
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");
    assert_eq!(body["state"], "processed");

    assert_eq!(handler.call_count(), 1);
    stack.shutdown().await;
}

/// A forged webhook is rejected before anything is recorded.
#[tokio::test]
async fn test_invalid_signature_leaves_no_record() {
    let handler = ScriptedHandler::succeeding();
    let stack = TestStack::with_handler("user.created", handler.clone());

    let request = webhook_request(webhook_body("evt_forged", "user.created"), "sha256=deadbeef");
    let (status, _) = stack.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let stored = stack
        .store
        .get(&EventKey::new(USERS, "evt_forged"))
        .await
        .unwrap();
    assert!(stored.is_none());
    assert_eq!(handler.call_count(), 0);
    stack.shutdown().await;
}

/// Transient handler failures are retried until the budget is spent.
#[tokio::test]
async fn test_persistent_transient_failure_dead_letters() {
    let handler = ScriptedHandler::new(vec![
        Err(HandlerError::transient("upstream 503")),
        Err(HandlerError::transient("upstream 503")),
        Err(HandlerError::transient("upstream 503")),
    ]);
    let stack = TestStack::with_handler("user.created", handler.clone());

    stack.send(signed_webhook("evt_2", "user.created")).await;
    let event = stack.wait_for_state("evt_2", EventState::DeadLettered).await;

    assert_eq!(event.attempt_count, 3);
    assert_eq!(handler.call_count(), 3);
    assert!(event.last_error.unwrap().contains("upstream 503"));
    stack.shutdown().await;
}

/// A transient failure followed by success ends processed.
#[tokio::test]
async fn test_transient_failure_then_success_is_processed() {
    let handler = ScriptedHandler::new(vec![Err(HandlerError::transient("timeout"))]);
    let stack = TestStack::with_handler("user.created", handler.clone());

    stack.send(signed_webhook("evt_3", "user.created")).await;
    let event = stack.wait_for_state("evt_3", EventState::Processed).await;

    assert_eq!(event.attempt_count, 2);
    assert!(event.processed_at.is_some());
    stack.shutdown().await;
}

/// An event type without a handler is dead-lettered, never dropped.
#[tokio::test]
async fn test_unknown_event_type_is_dead_lettered() {
    let handler = ScriptedHandler::succeeding();
    let stack = TestStack::with_handler("user.created", handler.clone());

    let (status, _) = stack.send(signed_webhook("evt_4", "user.renamed")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let event = stack.wait_for_state("evt_4", EventState::DeadLettered).await;
    assert_eq!(event.attempt_count, 0);
    assert_eq!(handler.call_count(), 0);
    stack.shutdown().await;
}

/// An operator re-drives a failed event and it is processed on the second run.
#[tokio::test]
async fn test_redrive_reprocesses_failed_event() {
    let handler = ScriptedHandler::new(vec![Err(HandlerError::permanent("HTTP 409 from crm"))]);
    let stack = TestStack::with_handler("user.created", handler.clone());

    stack.send(signed_webhook("evt_5", "user.created")).await;
    stack.wait_for_state("evt_5", EventState::Failed).await;

    let (status, body) = stack
        .send(post_empty(&format!("/admin/events/{}/evt_5/redrive", USERS)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["redrive_count"], 1);

    let event = stack.wait_for_state("evt_5", EventState::Processed).await;
    assert_eq!(event.redrive_count, 1);
    assert_eq!(handler.call_count(), 2);

    let (_, detail) = stack
        .send(get(&format!("/admin/events/{}/evt_5", USERS)))
        .await;
    assert_eq!(detail["state"], "processed");
    assert_eq!(detail["payload"]["data"]["user_id"], 42);
    stack.shutdown().await;
}
