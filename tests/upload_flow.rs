use anyhow::anyhow;
use axum::body::{to_bytes, Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use rbxl_relay::app::{build_router, AppState};
use rbxl_relay::publish::{PublishApi, PublishRequest, PublishResponse};
use rbxl_relay::quota::QuotaTracker;
use rbxl_relay::settings::{SettingsStore, DEFAULT_TOKENS, RATE_LIMIT_SECONDS};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt;

const BOUNDARY: &str = "relay-test-boundary";
const CLIENT: &str = "198.51.100.23";

enum Reply {
    Status(u16, &'static str),
    Unreachable,
}

struct FakePublisher {
    reply: Reply,
    calls: Mutex<Vec<PublishRequest>>,
}

#[async_trait::async_trait]
impl PublishApi for FakePublisher {
    async fn publish_place(&self, request: PublishRequest) -> anyhow::Result<PublishResponse> {
        self.calls.lock().unwrap().push(request);
        match self.reply {
            Reply::Status(status, body) => Ok(PublishResponse {
                status,
                body: body.to_string(),
            }),
            Reply::Unreachable => Err(anyhow!("connection refused")),
        }
    }
}

struct Harness {
    router: Router,
    settings: Arc<SettingsStore>,
    quotas: Arc<QuotaTracker>,
    publisher: Arc<FakePublisher>,
}

async fn harness(reply: Reply, window: i64, tokens: i64) -> Harness {
    let settings = Arc::new(SettingsStore::in_memory());
    assert!(settings.update(RATE_LIMIT_SECONDS, json!(window)).await);
    assert!(settings.update(DEFAULT_TOKENS, json!(tokens)).await);
    let quotas = Arc::new(QuotaTracker::new(settings.clone()));
    let publisher = Arc::new(FakePublisher {
        reply,
        calls: Mutex::new(Vec::new()),
    });
    let state = AppState {
        settings: settings.clone(),
        quotas: quotas.clone(),
        publisher: publisher.clone(),
        trust_proxy_headers: true,
        max_upload_bytes: 1024 * 1024,
    };
    Harness {
        router: build_router(state),
        settings,
        quotas,
        publisher,
    }
}

struct Part<'a> {
    name: &'a str,
    file_name: Option<&'a str>,
    data: &'a [u8],
}

fn text(name: &'static str, value: &'static str) -> Part<'static> {
    Part {
        name,
        file_name: None,
        data: value.as_bytes(),
    }
}

fn place_file(file_name: &'static str, data: &'static [u8]) -> Part<'static> {
    Part {
        name: "file",
        file_name: Some(file_name),
        data,
    }
}

fn full_form() -> Vec<Part<'static>> {
    vec![
        text("apikey", "secret-key"),
        text("universe_id", "42"),
        text("place_id", "1337"),
        place_file("obby.rbxl", b"<roblox!>binary"),
    ]
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part.file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    part.name, file_name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                    .as_bytes(),
            ),
        }
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(parts: &[Part<'_>]) -> Request<Body> {
    let body = multipart_body(parts);
    Request::post("/upload_game")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("content-length", body.len())
        .header("x-real-ip", CLIENT)
        .body(Body::from(body))
        .expect("failed to build request")
}

fn status_request() -> Request<Body> {
    Request::get("/check_status")
        .header("x-real-ip", CLIENT)
        .body(Body::empty())
        .expect("failed to build request")
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let res = router.clone().oneshot(request).await.unwrap();
    let status = res.status();
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

async fn tokens_left(h: &Harness) -> i64 {
    let (status, body) = send(&h.router, status_request()).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    json["tokens_remaining"].as_i64().unwrap()
}

#[tokio::test]
async fn first_contact_status_reports_full_allowance() {
    let h = harness(Reply::Status(200, "{}"), 60, 5).await;
    let (status, body) = send(&h.router, status_request()).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        json,
        json!({ "tokens_remaining": 5, "cooldown_remaining": 0, "can_upload": true })
    );
}

#[tokio::test]
async fn successful_upload_is_relayed_and_charged() {
    let h = harness(Reply::Status(200, r#"{"versionNumber":7}"#), 60, 5).await;

    let (status, body) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#"{"versionNumber":7}"#));

    let calls = h.publisher.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].api_key, "secret-key");
    assert_eq!(calls[0].universe_id, 42);
    assert_eq!(calls[0].place_id, 1337);
    assert_eq!(calls[0].place_file, Bytes::from_static(b"<roblox!>binary"));
    drop(calls);

    let (_, body) = send(&h.router, status_request()).await;
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["tokens_remaining"], 4);
    assert_eq!(json["can_upload"], false);
    assert!(json["cooldown_remaining"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn second_upload_inside_cooldown_is_429() {
    let h = harness(Reply::Status(201, "ok"), 60, 5).await;
    let (status, _) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::CREATED);

    let res = h
        .router
        .clone()
        .oneshot(upload_request(&full_form()))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(res.headers().get("retry-after").is_some());
    assert_eq!(h.publisher.calls.lock().unwrap().len(), 1);
    assert_eq!(tokens_left(&h).await, 4);
}

#[tokio::test]
async fn sixth_upload_of_the_day_is_403() {
    let h = harness(Reply::Status(200, "ok"), 0, 5).await;
    for _ in 0..5 {
        let (status, _) = send(&h.router, upload_request(&full_form())).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("MT Token"));
    assert_eq!(h.publisher.calls.lock().unwrap().len(), 5);
    assert_eq!(tokens_left(&h).await, 0);
}

#[tokio::test]
async fn missing_apikey_is_400_and_free() {
    let h = harness(Reply::Status(200, "ok"), 60, 5).await;
    let parts = vec![
        text("universe_id", "42"),
        text("place_id", "1337"),
        place_file("obby.rbxl", b"data"),
    ];
    let (status, _) = send(&h.router, upload_request(&parts)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.publisher.calls.lock().unwrap().is_empty());
    assert_eq!(tokens_left(&h).await, 5);
}

#[tokio::test]
async fn wrong_extension_is_400_and_free() {
    let h = harness(Reply::Status(200, "ok"), 60, 5).await;
    let parts = vec![
        text("apikey", "secret-key"),
        text("universe_id", "42"),
        text("place_id", "1337"),
        place_file("obby.zip", b"data"),
    ];
    let (status, body) = send(&h.router, upload_request(&parts)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains(".rbxl"));
    assert_eq!(tokens_left(&h).await, 5);
}

#[tokio::test]
async fn upstream_rejection_passes_status_through_and_still_charges() {
    let h = harness(Reply::Status(401, "Invalid API key"), 60, 5).await;
    let (status, body) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("401"));
    assert!(body.contains("Invalid API key"));
    assert_eq!(tokens_left(&h).await, 4);
}

#[tokio::test]
async fn transport_failure_is_500_and_still_charges() {
    let h = harness(Reply::Unreachable, 60, 5).await;
    let (status, body) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("connection refused"));
    assert_eq!(tokens_left(&h).await, 4);
}

#[tokio::test]
async fn clients_are_tracked_separately() {
    let h = harness(Reply::Status(200, "ok"), 60, 5).await;
    let (status, _) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::OK);

    let other = Request::get("/check_status")
        .header("x-real-ip", "192.0.2.200")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&h.router, other).await;
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["tokens_remaining"], 5);
    assert_eq!(h.quotas.tracked_clients().await, 2);
}

#[tokio::test]
async fn allowance_change_applies_without_restart() {
    let h = harness(Reply::Status(200, "ok"), 0, 5).await;
    assert!(h.settings.update(DEFAULT_TOKENS, json!(1)).await);
    let (status, _) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn oversized_body_is_rejected_without_charge() {
    let h = harness(Reply::Status(200, "ok"), 60, 5).await;
    let big = vec![b'x'; 2 * 1024 * 1024];
    let parts = vec![
        text("apikey", "secret-key"),
        text("universe_id", "42"),
        text("place_id", "1337"),
        Part {
            name: "file",
            file_name: Some("huge.rbxl"),
            data: &big,
        },
    ];
    let (status, _) = send(&h.router, upload_request(&parts)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(h.publisher.calls.lock().unwrap().is_empty());
    assert_eq!(tokens_left(&h).await, 5);
}

fn form_urlencoded_request() -> Request<Body> {
    let body = "apikey=secret-key&universe_id=42&place_id=1337";
    Request::post("/upload_game")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("content-length", body.len())
        .header("x-real-ip", CLIENT)
        .body(Body::from(body))
        .expect("failed to build request")
}

#[tokio::test]
async fn non_multipart_post_during_cooldown_is_429() {
    let h = harness(Reply::Status(200, "ok"), 60, 5).await;
    let (status, _) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::OK);

    let res = h
        .router
        .clone()
        .oneshot(form_urlencoded_request())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(res.headers().get("retry-after").is_some());
    assert_eq!(h.publisher.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn non_multipart_post_is_400_and_free() {
    let h = harness(Reply::Status(200, "ok"), 60, 5).await;
    let (status, body) = send(&h.router, form_urlencoded_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Thiếu thông tin bắt buộc."));
    assert!(h.publisher.calls.lock().unwrap().is_empty());
    assert_eq!(tokens_left(&h).await, 5);
}

#[tokio::test]
async fn empty_place_file_is_relayed() {
    let h = harness(Reply::Status(200, "ok"), 60, 5).await;
    let parts = vec![
        text("apikey", "secret-key"),
        text("universe_id", "42"),
        text("place_id", "1337"),
        place_file("blank.rbxl", b""),
    ];
    let (status, _) = send(&h.router, upload_request(&parts)).await;
    assert_eq!(status, StatusCode::OK);
    let calls = h.publisher.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].place_file.is_empty());
}

#[tokio::test]
async fn maximal_cooldown_window_does_not_break_status() {
    let h = harness(Reply::Status(200, "ok"), i64::MAX, 5).await;
    let (status, _) = send(&h.router, upload_request(&full_form())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&h.router, status_request()).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["can_upload"], false);
    assert!(json["cooldown_remaining"].as_i64().unwrap() > 0);
}
