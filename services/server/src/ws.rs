//! Client WebSocket endpoint.
//!
//! Admission checks happen before the upgrade; the in-band `auth {token}`
//! handshake happens right after. One select loop per socket keeps inbound
//! handling serial (per-socket ordering) while draining the outbound
//! channel the registry writes to.

use crate::state::AppState;
use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mp_core::collab::AuthClaims;
use mp_core::registry::OutboundFrame;
use mp_protocol::{AuthSuccess, ClientMessage, ScopedError, ServerMessage, UserCount};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_client_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.core.allow_connect(addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if !state.core.should_accept() {
        // Transient refusal; the client should retry against another
        // instance.
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_client_socket(socket, state))
        .into_response()
}

async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    }
}

async fn send_auth_error(socket: &mut WebSocket, message: &str) {
    let _ = send_json(
        socket,
        &ServerMessage::AuthError(ScopedError {
            message: message.to_owned(),
        }),
    )
    .await;
}

/// First message must be `auth {token}`; anything else (or silence) closes
/// the socket with `auth:error`.
async fn await_auth(socket: &mut WebSocket, state: &AppState) -> Option<AuthClaims> {
    let text = match tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            send_auth_error(socket, "expected an auth message").await;
            return None;
        }
        Err(_) => {
            send_auth_error(socket, "authentication timed out").await;
            return None;
        }
    };
    let token = match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::Auth(req)) => req.token,
        Ok(_) => {
            send_auth_error(socket, "expected an auth message").await;
            return None;
        }
        Err(_) => {
            send_auth_error(socket, "invalid JSON").await;
            return None;
        }
    };
    match state.core.authenticate(&token).await {
        Ok(claims) => {
            state.directory.observe(&claims.user_id, &claims.username);
            Some(claims)
        }
        Err(e) => {
            send_auth_error(socket, &e.public_message()).await;
            None
        }
    }
}

async fn handle_client_socket(mut socket: WebSocket, state: AppState) {
    let Some(claims) = await_auth(&mut socket, &state).await else {
        return;
    };

    let core = state.core.clone();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(core.config.socket_buffer);
    let user = match core.attach(&claims, tx).await {
        Ok(user) => user,
        Err(e) => {
            send_auth_error(&mut socket, &e.public_message()).await;
            return;
        }
    };

    if !send_json(
        &mut socket,
        &ServerMessage::AuthSuccess(AuthSuccess {
            socket_id: user.socket_id.clone(),
            user_id: user.user_id.clone(),
            username: user.username.clone(),
        }),
    )
    .await
    {
        core.detach(&user).await;
        return;
    }
    info!(user_id = %user.user_id, socket_id = %user.socket_id, "client connected");

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => core.handle(&user, msg).await,
                            Err(_) => {
                                let err = ServerMessage::Error(mp_protocol::ErrorMessage {
                                    code: mp_protocol::error_codes::VALIDATION.to_owned(),
                                    message: "unrecognized message".to_owned(),
                                    retryable: false,
                                });
                                if !send_json(&mut socket, &err).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(user_id = %user.user_id, error = %e, "websocket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            outbound = rx.recv() => {
                let Some(frame) = outbound else {
                    // Registry dropped the sender: force-closed.
                    break;
                };
                let Ok(json) = serde_json::to_string(&frame.msg) else { continue };
                match tokio::time::timeout(WRITE_TIMEOUT, socket.send(Message::Text(json))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                let _ = core.registry.touch_presence(&user.user_id).await;
                core.registry
                    .emit_to_socket(
                        &user.user_id,
                        &user.socket_id,
                        ServerMessage::UserCount(UserCount {
                            n: core.registry.connection_count(),
                        }),
                    )
                    .await;
            }
        }
    }

    core.detach(&user).await;
    info!(user_id = %user.user_id, socket_id = %user.socket_id, "client disconnected");
}
