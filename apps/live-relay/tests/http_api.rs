use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use live_relay::connection::ConnectionHandle;
use live_relay::lifecycle::{Clock, ManualClock};
use live_relay::store::MemorySessionStore;
use live_relay::{build_router, RelayConfig, RelayState};

struct Api {
    router: Router,
    state: RelayState,
    clock: Arc<ManualClock>,
}

impl Api {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = RelayConfig {
            public_url: Some("https://relay.example.com/".into()),
            ..RelayConfig::default()
        };
        let state = RelayState::new(config, MemorySessionStore::new(), clock.clone(), None);
        Self {
            router: build_router(state.clone()),
            state,
            clock,
        }
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, _, body) = self.call_with_headers(method, uri, body).await;
        (status, body)
    }

    async fn call_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, value)
    }
}

#[test_timeout::tokio_timeout_test]
async fn health_reports_room_count() {
    let api = Api::new();
    let (status, body) = api.call(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["rooms"], 0);
}

#[test_timeout::tokio_timeout_test]
async fn create_then_describe_room() {
    let api = Api::new();
    let (status, body) = api
        .call(
            Method::POST,
            "/rooms",
            Some(json!({"room_id": "r1", "host_id": "host"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["room_id"], "r1");
    assert_eq!(body["status"], "scheduled");
    assert_eq!(body["host_id"], "host");

    let (status, body) = api
        .call(
            Method::POST,
            "/rooms",
            Some(json!({"room_id": "r1", "host_id": "other"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already-exists");

    let (status, body) = api.call(Method::GET, "/rooms/r1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "scheduled");

    let (status, body) = api.call(Method::GET, "/rooms/nowhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "room-not-found");
}

#[test_timeout::tokio_timeout_test]
async fn blank_fields_are_bad_requests() {
    let api = Api::new();
    let (status, body) = api
        .call(
            Method::POST,
            "/rooms",
            Some(json!({"room_id": " ", "host_id": "host"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad-request");
}

#[test_timeout::tokio_timeout_test]
async fn early_start_is_425_with_retry_after() {
    let api = Api::new();
    let scheduled_for = api.clock.now() + chrono::Duration::seconds(3600);
    api.call(
        Method::POST,
        "/rooms",
        Some(json!({"room_id": "r1", "host_id": "host", "scheduled_for": scheduled_for})),
    )
    .await;

    let (status, headers, body) = api
        .call_with_headers(Method::POST, "/rooms/r1/start", Some(json!({})))
        .await;
    assert_eq!(status.as_u16(), 425);
    assert_eq!(body["error"], "too-early");
    assert_eq!(body["retry_after_secs"], 3600);
    assert_eq!(
        headers
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok()),
        Some("3600")
    );

    api.clock.advance(chrono::Duration::seconds(3600));
    let (status, body) = api
        .call(
            Method::POST,
            "/rooms/r1/start",
            Some(json!({"actor_id": "guest"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "not-host");

    let (status, body) = api
        .call(
            Method::POST,
            "/rooms/r1/start",
            Some(json!({"actor_id": "host"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "live");

    let (status, body) = api
        .call(Method::POST, "/rooms/r1/start", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid-transition");
}

#[test_timeout::tokio_timeout_test]
async fn join_preflight_returns_socket_endpoint() {
    let api = Api::new();
    let (status, body) = api
        .call(
            Method::POST,
            "/rooms/adhoc/join",
            Some(json!({"user_id": "u1", "user_name": "Ada"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["websocket_url"], "wss://relay.example.com/ws");
    assert_eq!(body["room_id"], "adhoc");
    assert_eq!(body["user_id"], "u1");
    // the pre-flight never registers a member
    assert!(api.state.registry.snapshot("adhoc").unwrap().members.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn ending_closes_members_and_blocks_joins() {
    let api = Api::new();
    api.call(
        Method::POST,
        "/rooms",
        Some(json!({"room_id": "r2", "host_id": "host"})),
    )
    .await;
    let (handle, _rx) = ConnectionHandle::channel(8);
    api.state
        .lifecycle
        .join("r2", "host", "Host", handle.clone())
        .await
        .unwrap();
    api.clock.advance(chrono::Duration::seconds(75));

    let (status, body) = api
        .call(Method::POST, "/rooms/r2/end", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ended");
    assert_eq!(body["notified"], 1);
    assert_eq!(body["duration_secs"], 75);
    assert!(handle.is_closed());

    let (status, body) = api
        .call(
            Method::POST,
            "/rooms/r2/join",
            Some(json!({"user_id": "late"})),
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "room-ended");

    let (status, _) = api
        .call(Method::POST, "/rooms/r2/end", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
