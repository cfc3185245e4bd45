//! New-session flow and protocol edge cases over a real WebSocket.

mod common;

use common::*;
use futures::SinkExt;
use serde_json::json;
use shellgate::config::Config;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn new_session_echoes_shell_output() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    let session_id = authenticate(&mut ws, json!({"type": "auth", "accessToken": access_token()})).await;
    assert!(!session_id.is_empty());

    send_json(&mut ws, json!({"type": "data", "payload": "echo hi\n"})).await;
    let output = recv_output_until(&mut ws, "hi").await;
    assert!(String::from_utf8_lossy(&output).contains("hi"));

    // The session is accounted in the authenticated bucket.
    assert_eq!(server.broker.registry.counts(), (0, 1));
}

#[tokio::test]
async fn anonymous_sessions_are_admitted() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    let _session_id = authenticate(&mut ws, json!({"type": "auth"})).await;
    assert_eq!(server.broker.registry.counts(), (1, 0));
}

#[tokio::test]
async fn connected_details_carry_iso_timestamps() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    send_json(&mut ws, json!({"type": "auth"})).await;
    let connecting = recv_status(&mut ws).await;
    assert_eq!(connecting["payload"], "connecting");
    let connected = recv_status(&mut ws).await;
    assert_eq!(connected["payload"], "connected");

    let created_at = connected["details"]["createdAt"].as_str().unwrap();
    let connected_at = connected["details"]["connectedAt"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(created_at).is_ok());
    assert!(chrono::DateTime::parse_from_rfc3339(connected_at).is_ok());
}

#[tokio::test]
async fn auth_window_times_out() {
    let config = Config {
        auth_timeout: Duration::from_millis(100),
        ..Config::default()
    };
    let server = spawn_server(config).await;
    let mut ws = server.connect().await;

    // Say nothing; the broker closes us with auth_timeout.
    let status = recv_status(&mut ws).await;
    assert_eq!(status["payload"], "error");
    assert_eq!(status["reason"], "auth_timeout");
    assert_eq!(server.broker.registry.len(), 0);
}

#[tokio::test]
async fn first_frame_must_be_auth() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    send_json(&mut ws, json!({"type": "data", "payload": "ls\n"})).await;
    let status = recv_status(&mut ws).await;
    assert_eq!(status["payload"], "error");
    assert_eq!(status["reason"], "protocol_error");
    assert_eq!(server.broker.registry.len(), 0);
}

#[tokio::test]
async fn unknown_frame_type_is_a_protocol_error() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    send_json(&mut ws, json!({"type": "ping"})).await;
    let status = recv_status(&mut ws).await;
    assert_eq!(status["reason"], "protocol_error");
}

#[tokio::test]
async fn malformed_api_key_fails_auth() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    send_json(&mut ws, json!({"type": "auth", "apiKey": "not-a-key"})).await;
    let status = recv_status(&mut ws).await;
    assert_eq!(status["payload"], "error");
    assert_eq!(status["reason"], "auth_failed");
}

#[tokio::test]
async fn garbage_access_token_fails_strict_auth() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    send_json(&mut ws, json!({"type": "auth", "accessToken": "garbage"})).await;
    let status = recv_status(&mut ws).await;
    assert_eq!(status["reason"], "auth_failed");
}

#[tokio::test]
async fn permissive_mode_accepts_unverified_tokens() {
    let config = Config {
        jwt_validation_mode: shellgate::config::JwtMode::Permissive,
        ..Config::default()
    };
    let server = spawn_server(config).await;
    let mut ws = server.connect().await;

    // Expired token, never signature-checked: permissive lets it through.
    let expired = {
        #[derive(serde::Serialize)]
        struct Claims {
            sub: String,
            exp: i64,
        }
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &Claims {
                sub: "dev".into(),
                exp: chrono::Utc::now().timestamp() - 3600,
            },
            &jsonwebtoken::EncodingKey::from_secret(b"dev"),
        )
        .unwrap()
    };
    let _session = authenticate(&mut ws, json!({"type": "auth", "accessToken": expired})).await;
}

#[tokio::test]
async fn oversized_frames_close_with_message_too_large() {
    let config = Config {
        max_ws_message_size: 1024,
        ..Config::default()
    };
    let server = spawn_server(config).await;
    let mut ws = server.connect().await;

    let _session = authenticate(&mut ws, json!({"type": "auth"})).await;

    let big = "x".repeat(2048);
    send_json(&mut ws, json!({"type": "data", "payload": big})).await;
    let status = recv_status(&mut ws).await;
    assert_eq!(status["payload"], "error");
    assert_eq!(status["reason"], "message_too_large");

    // The session itself survives (detached, within grace).
    assert_eq!(server.broker.registry.len(), 1);
}

#[tokio::test]
async fn binary_client_frames_are_protocol_errors() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    let _session = authenticate(&mut ws, json!({"type": "auth"})).await;
    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    let status = recv_status(&mut ws).await;
    assert_eq!(status["reason"], "protocol_error");
}

#[tokio::test]
async fn invalid_environment_overrides_are_rejected() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    send_json(
        &mut ws,
        json!({"type": "auth", "environmentVariables": {"bad-name": "v"}}),
    )
    .await;
    let status = recv_status(&mut ws).await;
    assert_eq!(status["reason"], "protocol_error");
    assert_eq!(server.broker.registry.len(), 0);
}

#[tokio::test]
async fn environment_overrides_reach_the_container() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    let session_id = authenticate(
        &mut ws,
        json!({"type": "auth", "environmentVariables": {"GREETING": "hello"}}),
    )
    .await;

    let session = server.broker.registry.get(&session_id).unwrap();
    let env = server.sandbox.env_of(&session.container).unwrap();
    assert_eq!(env["GREETING"], "hello");
}

#[tokio::test]
async fn resize_frames_reach_the_container() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;

    let session_id = authenticate(&mut ws, json!({"type": "auth"})).await;
    send_json(&mut ws, json!({"type": "resize", "cols": 120, "rows": 40})).await;

    // Resize is fire-and-forget; poll briefly for the effect.
    let session = server.broker.registry.get(&session_id).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let resizes = server.sandbox.resizes_of(&session.container);
        if resizes.contains(&(40, 120)) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "resize never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn container_create_failure_surfaces_cleanly() {
    let server = spawn_server(Config::default()).await;
    server.sandbox.fail_next_create();
    let mut ws = server.connect().await;

    send_json(&mut ws, json!({"type": "auth"})).await;
    let connecting = recv_status(&mut ws).await;
    assert_eq!(connecting["payload"], "connecting");
    let status = recv_status(&mut ws).await;
    assert_eq!(status["payload"], "error");
    assert_eq!(status["reason"], "container_create_failed");
    assert_eq!(server.broker.registry.counts(), (0, 0));
}

#[tokio::test]
async fn health_endpoint_reflects_live_sessions() {
    let server = spawn_server(Config::default()).await;
    let mut ws = server.connect().await;
    let _session = authenticate(&mut ws, json!({"type": "auth", "accessToken": access_token()})).await;

    let body: serde_json::Value = reqwest::get(server.health_url())
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessionCounts"]["authenticated"], 1);
    assert_eq!(body["sessionCounts"]["anonymous"], 0);
    assert!(body["uptimeSeconds"].is_u64());
}
