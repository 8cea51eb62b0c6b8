//! # WebSocket Channels
//!
//! Four channels, distinguished purely by path at the upgrade handshake:
//!
//! | path | direction | payload |
//! |------------|-----------|---------|
//! | `/control` | both | JSON input up, JSON commands down |
//! | `/screen` | down | BMP snapshots at 10 fps |
//! | `/display` | down | raw serial chunks, verbatim |
//! | `/audio` | down | `[0x00|pcm]` and `[0x01|json]` frames |
//!
//! Every socket runs its own task over its own broadcast receiver, so a
//! dead or slow consumer only ever takes itself down. Inbound garbage on
//! `/control` is ignored; it never costs the connection.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

use super::AppState;
use crate::input::{Key, DEFAULT_VELOCITY};

/// `GET /control`
pub async fn control(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("control socket connected");
    ws.on_upgrade(move |socket| control_socket(socket, state))
}

/// `GET /screen`
pub async fn screen(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("screen socket connected");
    let rx = state.fanout.subscribe_images();
    ws.on_upgrade(move |socket| forward_binary(socket, rx, "screen"))
}

/// `GET /display`
pub async fn display(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("display socket connected");
    let rx = state.raw_tx.subscribe();
    ws.on_upgrade(move |socket| forward_binary(socket, rx, "display"))
}

/// `GET /audio`: the first consumer lazily starts the capture helper.
pub async fn audio(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("audio socket connected");
    state.capture.ensure_started().await;
    let rx = state.hub.subscribe_frames();
    ws.on_upgrade(move |socket| forward_binary(socket, rx, "audio"))
}

/// Bidirectional control channel: delta-filtered commands down, input up.
async fn control_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut commands = state.fanout.subscribe_commands();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Ok(json) => {
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("control socket lagged {n} commands");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatch_control(&state, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong: nothing to do
                Some(Err(e)) => {
                    debug!("control socket errored: {e}");
                    break;
                }
            },
        }
    }
    info!("control socket closed");
}

/// Parses one inbound control message and fires the matching input
/// sequence. Unknown types and malformed payloads are dropped silently; the
/// input sequences run on their own task so their hold timings never stall
/// the socket.
fn dispatch_control(state: &AppState, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        debug!("ignoring non-JSON control message");
        return;
    };
    let input = state.input.clone();

    match value.get("type").and_then(Value::as_str) {
        Some("key") => {
            let Some(key) = value.get("key").and_then(Value::as_str).and_then(|s| s.parse::<Key>().ok()) else {
                return;
            };
            tokio::spawn(async move {
                if let Err(e) = input.press_key(key).await {
                    debug!("control key not delivered: {e}");
                }
            });
        }
        Some("keys") => {
            let Some(press) = value.get("press").and_then(Value::as_str).and_then(|s| s.parse::<Key>().ok()) else {
                return;
            };
            let hold = value
                .get("hold")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Key>().ok());
            tokio::spawn(async move {
                let result = match hold {
                    Some(hold) => input.press_combo(hold, press).await,
                    None => input.press_key(press).await,
                };
                if let Err(e) = result {
                    debug!("control combo not delivered: {e}");
                }
            });
        }
        Some("note") => {
            let Some(note) = value.get("note").and_then(Value::as_u64).filter(|&n| n <= 0xFF) else {
                return;
            };
            let vel = value
                .get("vel")
                .and_then(Value::as_u64)
                .filter(|&v| v <= 0xFF)
                .map(|v| v as u8)
                .unwrap_or(DEFAULT_VELOCITY);
            tokio::spawn(async move {
                if let Err(e) = input.note_on(note as u8, vel).await {
                    debug!("control note not delivered: {e}");
                }
            });
        }
        Some("noteOff") => {
            tokio::spawn(async move {
                if let Err(e) = input.note_off().await {
                    debug!("control note-off not delivered: {e}");
                }
            });
        }
        other => debug!("ignoring control message type {other:?}"),
    }
}

/// Push-only channel: forwards a broadcast of byte payloads until either
/// side goes away.
async fn forward_binary(socket: WebSocket, rx: broadcast::Receiver<Bytes>, label: &'static str) {
    let (mut sink, mut stream) = socket.split();
    let mut payloads = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            payload = payloads.next() => match payload {
                Some(Ok(bytes)) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                // Lagged: skip ahead; the next payload supersedes anyway.
                Some(Err(_)) => {}
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    info!("{label} socket closed");
}
