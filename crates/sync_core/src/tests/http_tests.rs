use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use super::*;
use crate::credentials::CredentialPair;

#[derive(Clone)]
struct AuthServerState {
    expected_token: Arc<StdMutex<String>>,
    refresh_calls: Arc<AtomicUsize>,
    refresh_succeeds: bool,
    issued_token: String,
}

async fn handle_protected(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
) -> StatusCode {
    let expected = format!("Bearer {}", state.expected_token.lock().expect("lock"));
    match headers.get("authorization") {
        Some(value) if value.to_str().ok() == Some(expected.as_str()) => StatusCode::OK,
        _ => StatusCode::UNAUTHORIZED,
    }
}

async fn handle_always_unauthorized() -> StatusCode {
    StatusCode::UNAUTHORIZED
}

async fn handle_unauthenticated_only(headers: HeaderMap) -> StatusCode {
    if headers.contains_key("authorization") {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn handle_refresh(
    State(state): State<AuthServerState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    assert!(body.get("refresh_token").is_some(), "refresh token missing");
    // Hold the refresh open long enough for every concurrent caller to pile
    // onto the in-flight slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    if !state.refresh_succeeds {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    *state.expected_token.lock().expect("lock") = state.issued_token.clone();
    (
        StatusCode::OK,
        Json(json!({
            "access_token": state.issued_token,
            "refresh_token": "rotated-refresh",
        })),
    )
}

async fn spawn_auth_server(refresh_succeeds: bool) -> (String, AuthServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = AuthServerState {
        expected_token: Arc::new(StdMutex::new("fresh".to_string())),
        refresh_calls: Arc::new(AtomicUsize::new(0)),
        refresh_succeeds,
        issued_token: "fresh".to_string(),
    };
    let app = Router::new()
        .route("/protected", get(handle_protected))
        .route("/always-unauthorized", get(handle_always_unauthorized))
        .route("/open", get(handle_unauthenticated_only))
        .route("/auth/refresh", post(handle_refresh))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn pipeline(
    server_url: &str,
    sign_outs: &Arc<AtomicUsize>,
    pair: CredentialPair,
) -> (Arc<AuthHttp>, Arc<CredentialStore>) {
    let credentials = Arc::new(CredentialStore::new());
    credentials.replace(pair).await;
    let refresh_url = Url::parse(&format!("{server_url}/auth/refresh")).expect("refresh url");
    let counter = Arc::clone(sign_outs);
    let on_sign_out: SignOutHandler = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let http = AuthHttp::new(Arc::clone(&credentials), refresh_url, on_sign_out);
    (http, credentials)
}

fn stale_pair() -> CredentialPair {
    CredentialPair {
        access_token: Some("stale".into()),
        refresh_token: Some("refresh-1".into()),
    }
}

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let (server_url, server) = spawn_auth_server(true).await;
    let sign_outs = Arc::new(AtomicUsize::new(0));
    let (http, credentials) = pipeline(&server_url, &sign_outs, stale_pair()).await;

    let calls = (0..8).map(|_| {
        let http = Arc::clone(&http);
        let url = format!("{server_url}/protected");
        async move {
            let request = http.client().get(url).build().expect("request");
            http.execute(request).await.expect("execute")
        }
    });
    let responses = join_all(calls).await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(credentials.access_token().await.as_deref(), Some("fresh"));
    assert_eq!(
        credentials.refresh_token().await.as_deref(),
        Some("rotated-refresh")
    );
    assert_eq!(sign_outs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn replayed_request_is_not_retried_a_second_time() {
    let (server_url, server) = spawn_auth_server(true).await;
    let sign_outs = Arc::new(AtomicUsize::new(0));
    let (http, _credentials) = pipeline(&server_url, &sign_outs, stale_pair()).await;

    let request = http
        .client()
        .get(format!("{server_url}/always-unauthorized"))
        .build()
        .expect("request");
    let response = http.execute(request).await.expect("execute");

    // The replay came back unauthorized too; it is handed to the caller
    // rather than triggering another refresh cycle.
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refresh_clears_credentials_and_signs_out_once() {
    let (server_url, server) = spawn_auth_server(false).await;
    let sign_outs = Arc::new(AtomicUsize::new(0));
    let (http, credentials) = pipeline(&server_url, &sign_outs, stale_pair()).await;

    let calls = (0..4).map(|_| {
        let http = Arc::clone(&http);
        let url = format!("{server_url}/protected");
        async move {
            let request = http.client().get(url).build().expect("request");
            http.execute(request).await.expect("execute")
        }
    });
    let responses = join_all(calls).await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sign_outs.load(Ordering::SeqCst), 1);
    assert_eq!(credentials.access_token().await, None);
    assert_eq!(credentials.refresh_token().await, None);
}

#[tokio::test]
async fn unauthorized_refresh_call_passes_through_unchanged() {
    let (server_url, server) = spawn_auth_server(false).await;
    let sign_outs = Arc::new(AtomicUsize::new(0));
    let (http, _credentials) = pipeline(&server_url, &sign_outs, stale_pair()).await;

    let request = http
        .client()
        .post(format!("{server_url}/auth/refresh"))
        .json(&json!({"refresh_token": "refresh-1"}))
        .build()
        .expect("request");
    let response = http.execute(request).await.expect("execute");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // Only the direct call hit the endpoint; the pipeline did not recurse.
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sign_outs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn absent_token_sends_unauthenticated() {
    let (server_url, server) = spawn_auth_server(true).await;
    let sign_outs = Arc::new(AtomicUsize::new(0));
    let (http, _credentials) =
        pipeline(&server_url, &sign_outs, CredentialPair::default()).await;

    let request = http
        .client()
        .get(format!("{server_url}/open"))
        .build()
        .expect("request");
    let response = http.execute(request).await.expect("execute");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 0);
}
