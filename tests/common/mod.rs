#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use shellgate::broker::Broker;
use shellgate::config::Config;
use shellgate::container::fake::FakeSandbox;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// An in-process broker serving on an ephemeral port, backed by the fake
/// sandbox. Tests construct the broker directly; nothing global.
pub struct TestServer {
    pub addr: SocketAddr,
    pub broker: Arc<Broker>,
    pub sandbox: Arc<FakeSandbox>,
}

pub async fn spawn_server(config: Config) -> TestServer {
    let sandbox = Arc::new(FakeSandbox::new());
    let broker = Broker::new(config, sandbox.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    let app = shellgate::api::router(broker.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("test server failed");
    });

    TestServer {
        addr,
        broker,
        sandbox,
    }
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.addr)
    }

    pub async fn connect(&self) -> Ws {
        let (ws, _) = connect_async(self.ws_url()).await.expect("ws connect");
        ws
    }
}

/// A syntactically valid JWT that passes strict validation (exp one hour
/// out, unverified signature).
pub fn access_token() -> String {
    token_for_subject("itest-user")
}

pub fn token_for_subject(sub: &str) -> String {
    #[derive(serde::Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        exp: i64,
    }
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &Claims {
            sub,
            exp: chrono::Utc::now().timestamp() + 3600,
        },
        &jsonwebtoken::EncodingKey::from_secret(b"itest"),
    )
    .expect("encode token")
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next frame of any kind, bounded by the receive timeout.
pub async fn recv_frame(ws: &mut Ws) -> Option<Message> {
    match tokio::time::timeout(RECV_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(msg))) => Some(msg),
        Ok(Some(Err(_))) | Ok(None) => None,
        Err(_) => panic!("timed out waiting for a frame"),
    }
}

/// Next `status` frame, skipping binary output along the way.
pub async fn recv_status(ws: &mut Ws) -> serde_json::Value {
    loop {
        match recv_frame(ws).await {
            Some(Message::Text(text)) => {
                let value: serde_json::Value =
                    serde_json::from_str(text.as_str()).expect("status json");
                assert_eq!(value["type"], "status", "unexpected frame: {value}");
                return value;
            }
            Some(Message::Binary(_)) => continue,
            Some(Message::Ping(_)) | Some(Message::Pong(_)) => continue,
            Some(Message::Close(_)) | None => panic!("socket closed while awaiting status"),
            Some(other) => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Collect binary output until `needle` appears, skipping status frames.
pub async fn recv_output_until(ws: &mut Ws, needle: &str) -> Vec<u8> {
    let mut collected = Vec::new();
    loop {
        match recv_frame(ws).await {
            Some(Message::Binary(data)) => {
                collected.extend_from_slice(&data);
                if String::from_utf8_lossy(&collected).contains(needle) {
                    return collected;
                }
            }
            Some(Message::Text(_)) | Some(Message::Ping(_)) | Some(Message::Pong(_)) => continue,
            Some(Message::Close(_)) | None => {
                panic!(
                    "socket closed before {:?} appeared; got {:?}",
                    needle,
                    String::from_utf8_lossy(&collected)
                )
            }
            Some(other) => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Run the auth handshake and return the session id from the connected
/// status frame.
pub async fn authenticate(ws: &mut Ws, auth: serde_json::Value) -> String {
    send_json(ws, auth).await;
    let connecting = recv_status(ws).await;
    assert_eq!(connecting["payload"], "connecting");
    let connected = recv_status(ws).await;
    assert_eq!(connected["payload"], "connected", "got: {connected}");
    connected["details"]["sessionId"]
        .as_str()
        .expect("sessionId in details")
        .to_string()
}
