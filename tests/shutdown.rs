//! Graceful shutdown behavior.

mod common;

use common::*;
use serde_json::json;
use shellgate::config::Config;
use shellgate::supervisor;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite};

#[tokio::test]
async fn shutdown_notifies_attached_clients() {
    let config = Config {
        shutdown_grace: Duration::from_millis(200),
        ..Config::default()
    };
    let server = spawn_server(config).await;
    let mut ws = server.connect().await;
    let _session = authenticate(&mut ws, json!({"type": "auth"})).await;

    let broker = server.broker.clone();
    let shutdown = tokio::spawn(async move {
        supervisor::shutdown_sequence(&broker).await;
    });

    let status = recv_status(&mut ws).await;
    assert_eq!(status["payload"], "disconnected");
    assert_eq!(status["reason"], "shutdown");

    shutdown.await.unwrap();
    assert_eq!(server.broker.registry.len(), 0);
    assert_eq!(server.sandbox.remove_calls().len(), 1);
}

#[tokio::test]
async fn shutdown_refuses_new_upgrades() {
    let server = spawn_server(Config::default()).await;
    server.broker.shutdown.begin();

    match connect_async(server.ws_url()).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        Ok(_) => panic!("upgrade should be refused during shutdown"),
        Err(other) => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_with_no_sessions_is_immediate() {
    let config = Config {
        shutdown_grace: Duration::from_secs(5),
        ..Config::default()
    };
    let server = spawn_server(config).await;

    let start = tokio::time::Instant::now();
    supervisor::shutdown_sequence(&server.broker).await;
    // No attached sockets: the grace is not consumed.
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn shutdown_terminates_detached_sessions_too() {
    let server = spawn_server(Config::default()).await;

    // Create a session and abandon the socket (detached, within grace).
    {
        let mut ws = server.connect().await;
        let _session = authenticate(&mut ws, json!({"type": "auth"})).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.broker.registry.len(), 1);

    supervisor::shutdown_sequence(&server.broker).await;
    assert_eq!(server.broker.registry.len(), 0);
    assert_eq!(server.sandbox.remove_calls().len(), 1);
}
