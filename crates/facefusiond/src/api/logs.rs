//! WebSocket log firehose.
//!
//! Broadcasts formatted `<ISO-ts> - <LEVEL> - <message>` lines to every
//! connected client. The socket is one-way: client messages are read only to
//! detect disconnects, never interpreted.

use std::net::SocketAddr;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::AppState;

/// WebSocket policy close code (RFC 6455).
const POLICY_VIOLATION: u16 = 1008;

pub async fn stream(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| serve_client(socket, state, addr))
}

async fn serve_client(mut socket: WebSocket, state: AppState, addr: SocketAddr) {
    if !state.config.allow_remote && !addr.ip().is_loopback() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "remote access disabled".into(),
            })))
            .await;
        return;
    }

    let mut lines = state.broadcaster.subscribe();
    debug!("log stream client connected: {}", addr);

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Ok(line) => {
                    if socket.send(Message::Text(line.into())).await.is_err() {
                        break;
                    }
                }
                // Backlog overflowed: skip what was lost and continue with
                // the newest retained lines.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            message = socket.recv() => {
                if !matches!(message, Some(Ok(_))) {
                    break;
                }
            }
        }
    }
    debug!("log stream client disconnected: {}", addr);
}
