// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the `GameLinkSdk` facade and the global registry.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gamelink_protocol::{ClientError, ControlSocket};
use gamelink_sdk::{
    ConnectionState, GameLinkSdk, Headers, HttpResponse, HttpTransport, Identity, MemoryStore,
    Method, RequestEnvelope, SdkConfig, SdkError, SocketConnector, TelemetryEvent, register_sdk,
    sdk, try_sdk,
};
use serde_json::json;

#[derive(Default)]
struct RecordingTransport {
    requests: Mutex<Vec<RequestEnvelope>>,
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn perform(&self, request: &RequestEnvelope) -> gamelink_sdk::Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(HttpResponse::new(200, Headers::new(), "{}"))
    }
}

struct Refusing;

#[async_trait]
impl SocketConnector for Refusing {
    async fn open(&self, _url: &str, _identity: &str) -> Result<Box<dyn ControlSocket>, ClientError> {
        Err(ClientError::Closed)
    }
}

fn test_sdk(transport: Arc<RecordingTransport>) -> GameLinkSdk {
    let config = SdkConfig::new("https://api.example.net/", "mygame").with_environment("test");
    GameLinkSdk::with_parts(
        config,
        transport,
        Arc::new(Refusing),
        Arc::new(MemoryStore::new()),
    )
}

#[tokio::test]
async fn test_request_builder_joins_url_and_authorizes() {
    let sdk = test_sdk(Arc::new(RecordingTransport::default()));

    let anonymous = sdk.request(Method::Get, "/social/v1/profile").build().unwrap();
    assert_eq!(anonymous.url(), "https://api.example.net/social/v1/profile");
    assert!(!anonymous.headers().contains("Authorization"));

    sdk.sign_in(Identity::new("user-1", "token-1"));
    let authorized = sdk.request(Method::Post, "leaderboard/v1/scores").build().unwrap();
    assert_eq!(authorized.url(), "https://api.example.net/leaderboard/v1/scores");
    assert_eq!(authorized.method(), Method::Post);
    assert_eq!(
        authorized.headers().get("authorization"),
        Some("Bearer token-1")
    );
}

#[tokio::test]
async fn test_sign_out_stops_scheduler_until_sign_in() {
    let transport = Arc::new(RecordingTransport::default());
    let sdk = test_sdk(transport.clone());
    sdk.sign_in(Identity::new("user-1", "token-1"));

    sdk.sign_out();
    assert!(!sdk.session().is_valid());
    assert!(!sdk.scheduler().is_accepting());

    let request = sdk.request(Method::Get, "/ping").build().unwrap();
    let err = sdk.scheduler().submit(request, |_| {}).unwrap_err();
    assert_eq!(err, SdkError::Stopped);

    sdk.sign_in(Identity::new("user-1", "token-2"));
    assert!(sdk.scheduler().is_accepting());
    let request = sdk.request(Method::Get, "/ping").build().unwrap();
    let response = sdk.scheduler().send(request).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(transport.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_telemetry_through_facade() {
    let transport = Arc::new(RecordingTransport::default());
    let sdk = test_sdk(transport.clone());
    sdk.sign_in(Identity::new("user-1", "token-1"));

    let event = sdk.event("level_start", json!({"level": 3}));
    assert_eq!(event.namespace, "mygame");
    sdk.telemetry().send(event).await;
    sdk.telemetry().flush().await.unwrap();

    let requests = transport.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].url(),
        "https://api.example.net/game-telemetry/v1/protected/events"
    );
    let sent: Vec<TelemetryEvent> =
        serde_json::from_slice(requests[0].body().unwrap()).unwrap();
    assert_eq!(sent[0].name, "level_start");
    assert_eq!(sent[0].payload, json!({"level": 3}));
}

#[tokio::test]
async fn test_shutdown_disconnects_watchdog() {
    let sdk = test_sdk(Arc::new(RecordingTransport::default()));
    sdk.sign_in(Identity::new("user-1", "token-1"));

    sdk.watchdog().connect("ds-1").unwrap();
    assert_eq!(sdk.watchdog().state(), ConnectionState::Connecting);

    sdk.shutdown().await;
    assert_eq!(sdk.watchdog().state(), ConnectionState::Disconnected);
    assert!(!sdk.scheduler().is_accepting());

    // Safe to call twice.
    sdk.shutdown().await;
}

#[tokio::test]
async fn test_global_registry() {
    // One test owns the process-wide registry.
    assert!(try_sdk().is_none());
    assert!(matches!(sdk(), Err(SdkError::Config(_))));

    register_sdk(test_sdk(Arc::new(RecordingTransport::default()))).unwrap();
    assert_eq!(sdk().unwrap().config().namespace, "mygame");
    assert!(try_sdk().is_some());

    let err = register_sdk(test_sdk(Arc::new(RecordingTransport::default()))).unwrap_err();
    assert!(matches!(err, SdkError::Config(_)));
}
