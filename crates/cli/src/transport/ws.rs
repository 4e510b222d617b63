// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket streaming surface: token-authenticated upgrade, then a
//! per-connection loop multiplexing the client's bridge queue against its
//! incoming messages.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Extension, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::bridge::{ClientConnection, OVER_CAPACITY_CLOSE};
use crate::transport::ws_msg::{ClientMessage, ServerMessage};
use crate::transport::{auth, ClientAddr, Store};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// `GET /ws?token=...`. Authentication happens during the upgrade handshake;
/// a bad token aborts with 401 and nothing later can re-authenticate.
pub async fn ws_handler(
    State(state): State<Arc<Store>>,
    Query(query): Query<WsQuery>,
    Extension(addr): Extension<ClientAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if auth::validate_ws_token(query.token.as_deref(), &state.auth_token).is_err() {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(state, socket, addr.0))
        .into_response()
}

async fn handle_connection(state: Arc<Store>, socket: WebSocket, addr: String) {
    let Some(conn) = state.bridge.register(addr) else {
        refuse_over_capacity(socket).await;
        return;
    };

    // Full session list first, before any per-session frames.
    conn.queue.push(ServerMessage::Sessions { sessions: state.supervisor.list().await });

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            frame = conn.queue.pop() => {
                let Some(frame) = frame else { break };
                if send_json(&mut ws_tx, &frame).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &conn, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("ws receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.bridge.unregister(conn.id);
}

/// One inbound client message. Malformed input answers with an error frame
/// and never terminates the connection.
async fn handle_client_message(state: &Arc<Store>, conn: &ClientConnection, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            conn.queue.push(ServerMessage::Error { message: format!("malformed message: {e}") });
            return;
        }
    };

    let result = match msg {
        ClientMessage::Subscribe { session_id, cols, rows } => {
            state.bridge.subscribe(conn.id, &session_id, cols, rows).await
        }
        ClientMessage::Unsubscribe { session_id } => {
            state.bridge.unsubscribe(conn.id, &session_id);
            Ok(())
        }
        ClientMessage::Input { session_id, data } => {
            let result = state.bridge.handle_input(&session_id, &data).await;
            if result.is_ok() {
                state.audit.emit("ws", "session.input", &session_id);
            }
            result
        }
        ClientMessage::Resize { session_id, cols, rows } => {
            state.bridge.handle_resize(&session_id, cols, rows).await
        }
    };

    if let Err(e) = result {
        conn.queue.push(ServerMessage::Error { message: e.message });
    }
}

async fn refuse_over_capacity(socket: WebSocket) {
    let (mut tx, _rx) = socket.split();
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code: OVER_CAPACITY_CLOSE,
            reason: "at capacity".into(),
        })))
        .await;
}

async fn send_json(
    tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(msg)?;
    tx.send(Message::Text(json.into())).await?;
    Ok(())
}
