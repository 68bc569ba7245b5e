//! HTTP endpoint tests driven through the router with `oneshot`

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use meshcall_core::{CallRegistry, ParticipantId};
use meshcall_relay::api::{ErrorBody, HealthResponse, SignalingResponse};
use meshcall_relay::{router, AppState, BearerTokenResolver, TrustedHeaderResolver};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> (Router, Arc<CallRegistry>) {
    let registry = Arc::new(CallRegistry::default());
    let state = AppState::new(
        Arc::clone(&registry),
        Arc::new(TrustedHeaderResolver::default()),
    );
    (router(state), registry)
}

fn post(as_participant: Option<&str>, body: Value) -> Request<Body> {
    let mut request = Request::post("/api/signaling").header("content-type", "application/json");
    if let Some(p) = as_participant {
        request = request.header("x-participant-id", p);
    }
    request.body(Body::from(body.to_string())).unwrap()
}

fn get(as_participant: &str, query: &str) -> Request<Body> {
    Request::get(format!("/api/signaling?{query}"))
        .header("x-participant-id", as_participant)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn join(app: &Router, who: &str, call: &str) {
    let (status, _) = send(app, post(Some(who), json!({"callId": call, "type": "join"}))).await;
    assert_eq!(status, StatusCode::OK);
}

fn error_code(body: Value) -> String {
    let body: ErrorBody = serde_json::from_value(body).unwrap();
    assert!(!body.success);
    body.code
}

#[tokio::test]
async fn health_reports_active_calls() {
    let (app, _) = app();
    join(&app, "alice", "abc").await;

    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.active_calls, 1);
}

#[tokio::test]
async fn join_offer_and_fetch() {
    let (app, _) = app();
    join(&app, "alice", "abc").await;
    join(&app, "bob", "abc").await;

    let (status, body) = send(
        &app,
        post(
            Some("alice"),
            json!({
                "callId": "abc",
                "type": "offer",
                "data": {"type": "offer", "sdp": "v=0\r\n"},
                "targetParticipantId": "bob"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: SignalingResponse = serde_json::from_value(body).unwrap();
    assert!(response.success);
    assert_eq!(response.call_id, "abc");
    assert!(response.timestamp.is_some());

    let (status, body) = send(&app, get("bob", "callId=abc&since=0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["callId"], "abc");
    assert_eq!(body["participants"], json!(["alice", "bob"]));
    assert_eq!(body["totalMessages"], 3);
    let messages = body["messages"].as_array().unwrap();
    // alice's join and her offer; bob's own join is not echoed
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["type"], "offer");
    assert_eq!(messages[1]["fromParticipant"], "alice");
    assert_eq!(messages[1]["toParticipant"], "bob");
    assert_eq!(messages[1]["payload"]["sdp"], "v=0\r\n");
}

#[tokio::test]
async fn since_cursor_excludes_older_messages() {
    let (app, _) = app();
    join(&app, "alice", "abc").await;
    join(&app, "bob", "abc").await;

    let (_, body) = send(&app, get("alice", "callId=abc")).await;
    let cursor = body["messages"][0]["timestamp"].as_i64().unwrap();

    let (_, body) = send(&app, get("alice", &format!("callId=abc&since={cursor}"))).await;
    assert_eq!(body["messages"], json!([]));
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let (app, registry) = app();
    let (status, body) = send(&app, post(None, json!({"callId": "abc", "type": "join"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(body), "UNAUTHORIZED");
    assert_eq!(registry.active_calls(), 0);
}

#[tokio::test]
async fn bearer_tokens_identify_callers() {
    let registry = Arc::new(CallRegistry::default());
    let resolver =
        BearerTokenResolver::new().with_token(ParticipantId::parse("alice").unwrap(), "t0ken");
    let app = router(AppState::new(Arc::clone(&registry), Arc::new(resolver)));

    let request = Request::post("/api/signaling")
        .header("content-type", "application/json")
        .header("authorization", "Bearer t0ken")
        .body(Body::from(json!({"callId": "abc", "type": "join"}).to_string()))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    // The trusted header means nothing to this resolver
    let (status, _) = send(&app, post(Some("alice"), json!({"callId": "abc", "type": "leave"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        registry
            .participants(&meshcall_core::CallId::parse("abc").unwrap())
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn unknown_call_is_not_found() {
    let (app, _) = app();
    let (status, body) = send(&app, get("alice", "callId=nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(body), "CALL_NOT_FOUND");

    let (status, _) = send(
        &app,
        post(
            Some("alice"),
            json!({"callId": "nope", "type": "offer", "data": {"sdp": "v=0"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn outsider_cannot_relay() {
    let (app, _) = app();
    join(&app, "alice", "abc").await;

    let (status, body) = send(
        &app,
        post(
            Some("eve"),
            json!({"callId": "abc", "type": "offer", "data": {"sdp": "v=0"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(body), "NOT_IN_CALL");
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let (app, _) = app();
    join(&app, "alice", "abc").await;

    let bad = [
        json!({"callId": "abc", "type": "hangup"}),
        json!({"callId": "", "type": "join"}),
        json!({"callId": "abc", "type": "offer", "data": {"sdp": ""}}),
        json!({"callId": "abc", "type": "answer"}),
        json!({"callId": "abc", "type": "ice-candidate", "data": {"sdpMid": "0"}}),
        json!({"type": "join"}),
    ];
    for body in bad {
        let (status, response) = send(&app, post(Some("alice"), body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(error_code(response), "INVALID_MESSAGE_FORMAT");
    }

    let request = Request::post("/api/signaling")
        .header("content-type", "application/json")
        .header("x-participant-id", "alice")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, response) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response), "INVALID_MESSAGE_FORMAT");

    let (status, _) = send(&app, get("alice", "since=5")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_join_and_leave_are_noops() {
    let (app, registry) = app();
    join(&app, "alice", "abc").await;
    join(&app, "bob", "abc").await;

    let (status, body) = send(&app, post(Some("alice"), json!({"callId": "abc", "type": "join"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("timestamp").is_none());

    for _ in 0..2 {
        let (status, _) = send(&app, post(Some("alice"), json!({"callId": "abc", "type": "leave"}))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let call = meshcall_core::CallId::parse("abc").unwrap();
    assert_eq!(
        registry.participants(&call).unwrap(),
        vec![ParticipantId::parse("bob").unwrap()]
    );

    send(&app, post(Some("bob"), json!({"callId": "abc", "type": "leave"}))).await;
    let (status, _) = send(&app, get("bob", "callId=abc")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
