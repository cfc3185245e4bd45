//! HTTP handlers: health probe and the WebSocket terminal endpoint.
//!
//! The WebSocket flow is: upgrade (per-IP limiter, shutdown gate) →
//! authentication window (first frame must be `auth`) → resume-or-create →
//! bind → `status:connected` → ring replay → streaming loop. Every
//! server-initiated close is preceded by a `status` frame carrying a reason
//! from the closed set in [`crate::protocol::reason`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::auth::Credentials;
use crate::broker::Broker;
use crate::protocol::{
    clamp_dimension, reason, validate_environment, ClientFrame, Status, StatusFrame,
};
use crate::session::{CreateError, DisconnectReason, Session, SocketBinding};

use super::error::ApiError;
use super::AppState;

/// Slack on top of the configured message cap so the explicit size check
/// (which produces the documented close reason) fires before the transport
/// cap (which produces a bare protocol error).
const MESSAGE_SIZE_SLACK: usize = 4096;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    #[serde(rename = "sessionCounts")]
    session_counts: SessionCounts,
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: u64,
}

#[derive(Serialize)]
pub(super) struct SessionCounts {
    anonymous: usize,
    authenticated: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (anonymous, authenticated) = state.broker.registry.counts();
    Json(HealthResponse {
        status: "ok",
        session_counts: SessionCounts {
            anonymous,
            authenticated,
        },
        uptime_seconds: state.broker.uptime_seconds(),
    })
}

pub(super) async fn ws_terminal(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let broker = state.broker.clone();

    if broker.shutdown.in_progress() {
        return Err(ApiError::ShuttingDown);
    }

    let ip = addr.ip();

    if !broker.limiters.check_connection(ip).is_allowed() {
        if broker.config.security_audit_log {
            tracing::info!(target: "audit", event = "connection_rate_limited", %ip);
        }
        return Err(ApiError::RateLimited);
    }

    let max_message = broker.config.max_ws_message_size;
    Ok(ws
        .max_message_size(max_message + MESSAGE_SIZE_SLACK)
        .on_upgrade(move |socket| handle_terminal_socket(socket, broker, ip)))
}

/// Send a final status frame and a close frame, ignoring failures: the
/// peer may already be gone.
async fn refuse(mut socket: WebSocket, status: StatusFrame) {
    let _ = socket.send(Message::Text(status.to_json().into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: "".into(),
        })))
        .await;
}

async fn handle_terminal_socket(mut socket: WebSocket, broker: Arc<Broker>, ip: IpAddr) {
    let (_guard, mut shutdown_rx) = broker.shutdown.register();

    // ── Authentication window ────────────────────────────────────
    let first = tokio::time::timeout(broker.config.auth_timeout, socket.recv()).await;
    let frame = match first {
        Err(_) => {
            refuse(socket, StatusFrame::with_reason(Status::Error, reason::AUTH_TIMEOUT)).await;
            return;
        }
        Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
        Ok(Some(Ok(Message::Text(text)))) => {
            if text.len() > broker.config.max_ws_message_size {
                refuse(
                    socket,
                    StatusFrame::with_reason(Status::Error, reason::MESSAGE_TOO_LARGE),
                )
                .await;
                return;
            }
            match ClientFrame::parse(text.as_str()) {
                Ok(frame) => frame,
                Err(_) => {
                    refuse(
                        socket,
                        StatusFrame::with_reason(Status::Error, reason::PROTOCOL_ERROR),
                    )
                    .await;
                    return;
                }
            }
        }
        Ok(Some(Ok(_))) => {
            refuse(
                socket,
                StatusFrame::with_reason(Status::Error, reason::PROTOCOL_ERROR),
            )
            .await;
            return;
        }
    };

    let ClientFrame::Auth {
        api_key,
        access_token,
        session_id,
        environment_variables,
    } = frame
    else {
        refuse(
            socket,
            StatusFrame::with_reason(Status::Error, reason::PROTOCOL_ERROR),
        )
        .await;
        return;
    };

    let credentials = Credentials::new(api_key, access_token);
    if let Err(e) = credentials.validate(broker.config.jwt_validation_mode) {
        if broker.config.security_audit_log {
            tracing::info!(target: "audit", event = "auth_failed", %ip, error = %e);
        }
        metrics::counter!("shellgate_auth_failures_total").increment(1);
        refuse(socket, StatusFrame::with_reason(Status::Error, reason::AUTH_FAILED)).await;
        return;
    }

    let env = environment_variables.unwrap_or_default();
    if let Err(e) = validate_environment(&env) {
        tracing::debug!(%ip, error = %e, "rejected environment overrides");
        refuse(
            socket,
            StatusFrame::with_reason(Status::Error, reason::PROTOCOL_ERROR),
        )
        .await;
        return;
    }

    if socket
        .send(Message::Text(StatusFrame::new(Status::Connecting).to_json().into()))
        .await
        .is_err()
    {
        return;
    }

    // ── Resume or create ─────────────────────────────────────────
    let credential_hash = credentials.hash();
    let session = match session_id {
        Some(ref id) => match broker.registry.try_resume(id, &credential_hash) {
            Ok(session) => {
                metrics::counter!("shellgate_sessions_resumed_total").increment(1);
                session
            }
            Err(e) => {
                refuse(
                    socket,
                    StatusFrame::with_reason(Status::Error, e.protocol_reason()),
                )
                .await;
                return;
            }
        },
        None => match broker.registry.create(&credentials, &env).await {
            Ok(session) => session,
            Err(e) => {
                let why = match e {
                    CreateError::AtCapacity => reason::CAPACITY,
                    CreateError::Container(_) => reason::CONTAINER_CREATE_FAILED,
                    CreateError::Attach(_) => reason::CONTAINER_ATTACH_FAILED,
                };
                tracing::warn!(%ip, error = %e, "session creation failed");
                refuse(socket, StatusFrame::with_reason(Status::Error, why)).await;
                return;
            }
        },
    };

    let binding = match broker.registry.bind_socket(&session) {
        Ok(binding) => binding,
        Err(e) => {
            refuse(
                socket,
                StatusFrame::with_reason(Status::Error, e.protocol_reason()),
            )
            .await;
            return;
        }
    };

    let connected = StatusFrame::new(Status::Connected).with_details(serde_json::json!({
        "sessionId": session.id,
        "createdAt": session.created_at.to_rfc3339(),
        "connectedAt": chrono::Utc::now().to_rfc3339(),
    }));
    if socket
        .send(Message::Text(connected.to_json().into()))
        .await
        .is_err()
    {
        broker.registry.detach(&session, binding.attachment_id);
        return;
    }

    // Replay before the first live byte; the binding's receiver starts at
    // exactly the snapshot point so the two cannot interleave.
    if !binding.replay.is_empty()
        && socket
            .send(Message::Binary(binding.replay.clone()))
            .await
            .is_err()
    {
        broker.registry.detach(&session, binding.attachment_id);
        return;
    }

    tracing::info!(session = %session.id, %ip, "socket attached");
    stream_session(socket, broker, session, binding, &mut shutdown_rx).await;
}

/// Outcome of the streaming loop, deciding the teardown path.
enum LoopEnd {
    /// Client went away (close, error, protocol violation): detach and let
    /// the orphan grace run.
    Detach(Option<&'static str>),
    /// The attachment was cancelled under us (takeover or terminate); the
    /// registry already holds the reason.
    Cancelled,
    /// Broker shutdown: supervisor owns session teardown.
    Shutdown,
}

async fn stream_session(
    socket: WebSocket,
    broker: Arc<Broker>,
    session: Arc<Session>,
    binding: SocketBinding,
    shutdown_rx: &mut tokio::sync::watch::Receiver<bool>,
) {
    let SocketBinding {
        attachment_id,
        cancel,
        reason: disconnect_reason,
        live: mut output_rx,
        ..
    } = binding;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let max_message = broker.config.max_ws_message_size;

    let end = loop {
        tokio::select! {
            // Takeover or terminate cut this attachment.
            _ = cancel.cancelled() => break LoopEnd::Cancelled,

            // Broker shutdown: tell the client, then leave teardown to the
            // supervisor.
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break LoopEnd::Shutdown;
                }
            }

            // Shell output -> client.
            result = output_rx.recv() => {
                match result {
                    Ok(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break LoopEnd::Detach(None);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break LoopEnd::Detach(None),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(session = %session.id, skipped = n, "client lagged on live output");
                    }
                }
            }

            // Client frames.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > max_message {
                            break LoopEnd::Detach(Some(reason::MESSAGE_TOO_LARGE));
                        }
                        match ClientFrame::parse(text.as_str()) {
                            Ok(ClientFrame::Data { payload }) => {
                                session.activity.touch();
                                if session.input_tx.send(Bytes::from(payload)).await.is_err() {
                                    // Shell side is gone; the exit watcher
                                    // will terminate the session.
                                    break LoopEnd::Detach(None);
                                }
                            }
                            Ok(ClientFrame::Resize { cols, rows }) => {
                                let rows = clamp_dimension(rows);
                                let cols = clamp_dimension(cols);
                                if let Err(e) = session.resize(rows, cols) {
                                    tracing::warn!(session = %session.id, error = %e, "resize failed");
                                }
                            }
                            Ok(ClientFrame::Auth { .. }) => {
                                break LoopEnd::Detach(Some(reason::PROTOCOL_ERROR));
                            }
                            Err(_) => break LoopEnd::Detach(Some(reason::PROTOCOL_ERROR)),
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        break LoopEnd::Detach(Some(reason::PROTOCOL_ERROR));
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break LoopEnd::Detach(None),
                    Some(Err(_)) => break LoopEnd::Detach(None),
                }
            }
        }
    };

    match end {
        LoopEnd::Detach(why) => {
            if let Some(why) = why {
                send_final(&mut ws_tx, StatusFrame::with_reason(Status::Error, why)).await;
            } else {
                send_final(&mut ws_tx, StatusFrame::new(Status::Disconnected)).await;
            }
            broker.registry.detach(&session, attachment_id);
        }
        LoopEnd::Cancelled => {
            let why = (*disconnect_reason.lock())
                .map(DisconnectReason::protocol_reason)
                .unwrap_or(reason::SHUTDOWN);
            send_final(
                &mut ws_tx,
                StatusFrame::with_reason(Status::Disconnected, why),
            )
            .await;
            // No detach: the attachment is already gone from the registry.
        }
        LoopEnd::Shutdown => {
            send_final(
                &mut ws_tx,
                StatusFrame::with_reason(Status::Disconnected, reason::SHUTDOWN),
            )
            .await;
            // Session teardown belongs to the supervisor here.
        }
    }

    tracing::debug!(session = %session.id, "socket loop ended");
}

/// Best-effort final status + close frame, bounded so a dead peer cannot
/// stall teardown.
async fn send_final(ws_tx: &mut SplitSink<WebSocket, Message>, status: StatusFrame) {
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        let _ = ws_tx.send(Message::Text(status.to_json().into())).await;
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "".into(),
            })))
            .await;
    })
    .await;
}
