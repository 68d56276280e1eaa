use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use super::*;
use shared::{
    domain::{MessageId, UserId},
    protocol::UserMessage,
};

async fn handle_login(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["username"] == "maren" && body["password"] == "hunter2" {
        (
            StatusCode::OK,
            Json(json!({"access_token": "a1", "refresh_token": "r1"})),
        )
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({})))
    }
}

async fn handle_messages(
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some("Bearer a1");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    let snapshot = vec![
        TimelineItem::User {
            user_message: UserMessage {
                message_id: MessageId(1),
                channel_id: ChannelId(channel_id),
                sender_id: UserId(9),
                sender_username: Some("maren".into()),
                body: "first".into(),
                created_at: Utc.timestamp_millis_opt(1_000).unwrap(),
            },
        },
        TimelineItem::User {
            user_message: UserMessage {
                message_id: MessageId(2),
                channel_id: ChannelId(channel_id),
                sender_id: UserId(9),
                sender_username: Some("maren".into()),
                body: "second".into(),
                created_at: Utc.timestamp_millis_opt(2_000).unwrap(),
            },
        },
    ];
    (
        StatusCode::OK,
        Json(serde_json::to_value(snapshot).expect("snapshot json")),
    )
}

async fn spawn_api_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/auth/login", post(handle_login))
        .route("/channels/:id/messages", get(handle_messages));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn test_settings(server_url: &str) -> Settings {
    Settings {
        endpoint_base: server_url.to_string(),
        heartbeat_interval_ms: 50,
        reconnect_delay_ms: 100,
        event_buffer: 64,
    }
}

#[tokio::test]
async fn login_stores_credentials_and_snapshot_fetch_is_authenticated() {
    let server_url = spawn_api_server().await;
    let client = SyncClient::new(
        test_settings(&server_url),
        LeaderBus::new(),
        Arc::new(|| {}),
    )
    .expect("client");

    client.login("maren", "hunter2").await.expect("login");
    assert!(client.credentials().is_authenticated().await);

    let snapshot = client
        .fetch_timeline(ChannelId(42), 50)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].channel_id(), ChannelId(42));
}

#[tokio::test]
async fn rejected_login_leaves_the_store_empty() {
    let server_url = spawn_api_server().await;
    let client = SyncClient::new(
        test_settings(&server_url),
        LeaderBus::new(),
        Arc::new(|| {}),
    )
    .expect("client");

    assert!(client.login("maren", "wrong").await.is_err());
    assert!(!client.credentials().is_authenticated().await);
}

#[tokio::test]
async fn logout_clears_credentials_and_idles_the_connection() {
    let server_url = spawn_api_server().await;
    let client = SyncClient::new(
        test_settings(&server_url),
        LeaderBus::new(),
        Arc::new(|| {}),
    )
    .expect("client");

    client.login("maren", "hunter2").await.expect("login");
    client.logout().await;

    assert!(!client.credentials().is_authenticated().await);
    assert_eq!(client.manager().phase().await, ConnectionPhase::Idle);
}
