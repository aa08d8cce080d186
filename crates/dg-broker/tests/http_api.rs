//! HTTP API tests, served in-process

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{Harness, TunnelMode};
use dg_broker::session::SessionState;
use dg_broker::{api, DaemonState};
use dg_core::config::BrokerConfig;
use dg_core::traits::MachineRegistry;
use dg_core::MachineId;
use dg_protocol::{Instruction, SessionId};

fn app(h: &Harness) -> Router {
    let state = DaemonState::new(
        BrokerConfig::default(),
        Arc::clone(&h.registry) as Arc<dyn MachineRegistry>,
        Arc::clone(&h.broker),
    );
    api::router(Arc::new(state))
}

async fn call_raw(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, String) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, text) = call_raw(app, method, uri, body).await;
    let value = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_root_answers() {
    let h = Harness::new();
    let (status, body) = call(&app(&h), Method::GET, "/api/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("deskgate"));
}

#[tokio::test]
async fn test_machines_hide_credentials() {
    let h = Harness::new();
    let app = app(&h);

    let (status, body) = call(&app, Method::GET, "/api/machines", None).await;
    assert_eq!(status, StatusCode::OK);
    let machines = body.as_array().unwrap();
    assert_eq!(machines.len(), 2);
    assert_eq!(machines[0]["id"], "m1");
    assert_eq!(machines[0]["status"], "inactive");
    assert!(!body.to_string().contains("hunter2"));

    let (status, _) = call(&app, Method::GET, "/api/machines/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_connection_lifecycle_over_http() {
    let h = Harness::new();
    let app = app(&h);

    let (status, created) = call(
        &app,
        Method::POST,
        "/api/connections",
        Some(json!({ "server_id": "m1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["state"], "pending");
    assert_eq!(created["machine_id"], "m1");
    let id = SessionId::new(created["id"].as_u64().unwrap() as u32);

    h.wait_for(id, SessionState::Connected).await;
    let (_, machine) = call(&app, Method::GET, "/api/machines/m1", None).await;
    assert_eq!(machine["status"], "active");

    let (status, active) = call(&app, Method::GET, "/api/connections/active", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active.as_array().unwrap().len(), 1);

    let (status, dup) = call(
        &app,
        Method::POST,
        "/api/connections",
        Some(json!({ "server_id": "m1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(dup["detail"].as_str().unwrap().contains("m1"));

    let (status, input) = call(
        &app,
        Method::POST,
        &format!("/api/connections/{}/input", id.as_u32()),
        Some(json!({ "type": "key", "keysym": 65, "pressed": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(input["disposition"], "queued");

    let uri = format!("/api/connections/{}", id);
    let (status, closed) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(closed["outcome"], "closed");

    let (status, again) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["outcome"], "already_terminated");

    h.wait_released("m1").await;
    let (_, machine) = call(&app, Method::GET, "/api/machines/m1", None).await;
    assert_eq!(machine["status"], "inactive");

    let (_, history) = call(&app, Method::GET, &format!("{}/history", uri), None).await;
    assert_eq!(history.as_array().unwrap().last().unwrap(), "closed");

    let (_, all) = call(&app, Method::GET, "/api/connections", None).await;
    assert_eq!(all[0]["state"], "closed");
    let (_, active) = call(&app, Method::GET, "/api/connections/active", None).await;
    assert!(active.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_ids() {
    let h = Harness::new();
    h.gateway.set_tunnel(TunnelMode::Silent);
    let app = app(&h);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/connections",
        Some(json!({ "server_id": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].is_string());

    let (status, body) = call(&app, Method::DELETE, "/api/connections/77", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "not_found");

    let (status, _) = call(&app, Method::GET, "/api/connections/77", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::GET, "/api/connections/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_events_stream_status_and_output() {
    let h = Harness::new();
    let app = app(&h);
    let info = h.broker.create(&MachineId::new("m1")).await.unwrap();
    h.wait_for(info.id, SessionState::Connected).await;

    let request = Request::builder()
        .uri(format!("/api/connections/{}/events", info.id.as_u32()))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = tokio::spawn(to_bytes(response.into_body(), usize::MAX));

    // Close only once the frame has been published
    let output = h.broker.subscribe(info.id).unwrap().output_stream();
    futures::pin_mut!(output);
    h.gateway
        .tunnel_for(info.id)
        .unwrap()
        .push(Instruction::new("size", ["0", "1024", "768"]));
    tokio::time::timeout(Duration::from_secs(5), output.next())
        .await
        .unwrap()
        .unwrap();
    h.broker.close(info.id).await;

    let body = tokio::time::timeout(Duration::from_secs(5), body)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("event: status"), "{}", text);
    assert!(text.contains("data: connected"), "{}", text);
    assert!(text.contains("event: output"), "{}", text);
    assert!(text.contains(r#"data: "4.size,1.0,4.1024,3.768;""#), "{}", text);
    assert!(text.trim_end().ends_with("data: closed"), "{}", text);
}

#[tokio::test]
async fn test_events_for_ended_session_finish_at_once() {
    let h = Harness::new();
    let app = app(&h);
    let info = h.broker.create(&MachineId::new("m1")).await.unwrap();
    h.wait_for(info.id, SessionState::Connected).await;
    h.broker.close(info.id).await;

    let uri = format!("/api/connections/{}/events", info.id.as_u32());
    let (status, text) = call_raw(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("data: closed"), "{}", text);

    let (status, _) = call_raw(&app, Method::GET, "/api/connections/77/events", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_oversized_wheel_is_rejected() {
    let h = Harness::new();
    let app = app(&h);
    let info = h.broker.create(&MachineId::new("m1")).await.unwrap();
    h.wait_for(info.id, SessionState::Connected).await;

    let uri = format!("/api/connections/{}/input", info.id.as_u32());
    let (status, body) = call(
        &app,
        Method::POST,
        &uri,
        Some(json!({ "type": "pointer_wheel", "delta": i32::MIN })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("wheel"));

    let (status, body) = call(
        &app,
        Method::POST,
        &uri,
        Some(json!({ "type": "pointer_wheel", "delta": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"], "queued");
}
