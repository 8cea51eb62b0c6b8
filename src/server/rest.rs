//! # REST Handlers
//!
//! Thin translations between HTTP and the gateway internals. Validation
//! failures are always `400` with a JSON body; a missing device downgrades
//! input endpoints to `503`, never `500`. Bodies are parsed by hand so that
//! malformed JSON is a clean `400` as well.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use super::AppState;
use crate::input::{Key, DEFAULT_VELOCITY};
use crate::serial::link::LinkError;
use crate::serial::{LinkEvent, SerialLink};

/// How long `/api/reconnect` waits for the link to come back.
const RECONNECT_WAIT: Duration = Duration::from_secs(2);

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn link_error(err: LinkError) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "ok": false, "error": err.to_string() })),
    )
        .into_response()
}

/// Parses a request body as JSON, or yields a 400.
fn parse_body(body: &Bytes) -> Result<Value, Response> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| {
        debug!("rejecting malformed body: {e}");
        bad_request("invalid JSON body")
    })
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "connected": state.link.is_connected(),
        "port": state.link.port(),
        "clients": state.tcp.client_count(),
        "audio": state.capture.is_running(),
    }))
}

/// `GET /api/screen`
pub async fn screen(State(state): State<AppState>) -> Json<Value> {
    Json(state.fanout.screen_json())
}

/// `GET /api/screen/text`
pub async fn screen_text(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.fanout.screen_text(),
    )
        .into_response()
}

/// `GET /api/screen/image`
pub async fn screen_image(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "image/bmp")],
        state.fanout.snapshot_bmp(),
    )
        .into_response()
}

/// `POST /api/key/{name}`
pub async fn press_key(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Ok(key) = name.parse::<Key>() else {
        return bad_request("unknown key name");
    };
    match state.input.press_key(key).await {
        Ok(()) => Json(json!({ "ok": true, "key": key.name() })).into_response(),
        Err(e) => link_error(e),
    }
}

/// `POST /api/keys` with `{hold?, press}`
pub async fn press_keys(State(state): State<AppState>, body: Bytes) -> Response {
    let value = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(press_name) = value.get("press").and_then(Value::as_str) else {
        return bad_request("missing press key");
    };
    let Ok(press) = press_name.parse::<Key>() else {
        return bad_request("unknown press key");
    };

    let hold = match value.get("hold").and_then(Value::as_str) {
        Some(name) => match name.parse::<Key>() {
            Ok(key) => Some(key),
            Err(()) => return bad_request("unknown hold key"),
        },
        None => None,
    };

    let result = match hold {
        Some(hold) => state.input.press_combo(hold, press).await,
        None => state.input.press_key(press).await,
    };
    match result {
        Ok(()) => Json(json!({
            "ok": true,
            "hold": hold.map(Key::name),
            "press": press.name(),
        }))
        .into_response(),
        Err(e) => link_error(e),
    }
}

/// `POST /api/raw` with `{bitmask, holdMs?, release?}`
pub async fn raw_bitmask(State(state): State<AppState>, body: Bytes) -> Response {
    let value = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(bitmask) = value.get("bitmask").and_then(Value::as_u64) else {
        return bad_request("missing bitmask");
    };
    if bitmask > 0xFF {
        return bad_request("bitmask out of range 0..255");
    }
    let hold_ms = value.get("holdMs").and_then(Value::as_u64);
    let release = value.get("release").and_then(Value::as_bool).unwrap_or(true);

    let result = state
        .input
        .raw_bitmask(bitmask as u8, hold_ms.map(Duration::from_millis), release)
        .await;
    match result {
        Ok(()) => Json(json!({
            "ok": true,
            "bitmask": bitmask,
            "holdMs": hold_ms,
        }))
        .into_response(),
        Err(e) => link_error(e),
    }
}

/// `POST /api/note` with `{note, vel?}`
pub async fn note_on(State(state): State<AppState>, body: Bytes) -> Response {
    let value = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(note) = value.get("note").and_then(Value::as_u64) else {
        return bad_request("missing note");
    };
    if note > 0xFF {
        return bad_request("note out of range 0..255");
    }
    let vel = match value.get("vel").and_then(Value::as_u64) {
        Some(vel) if vel <= 0xFF => vel as u8,
        Some(_) => return bad_request("vel out of range 0..255"),
        None => DEFAULT_VELOCITY,
    };

    match state.input.note_on(note as u8, vel).await {
        Ok(()) => Json(json!({ "ok": true, "note": note, "vel": vel })).into_response(),
        Err(e) => link_error(e),
    }
}

/// `POST /api/note/off`
pub async fn note_off(State(state): State<AppState>) -> Response {
    match state.input.note_off().await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => link_error(e),
    }
}

/// `POST /api/reset`: full device redraw. The delta cache is dropped so the
/// redraw passes through to every consumer, and the tracked state snaps to
/// the known post-reset position.
pub async fn reset(State(state): State<AppState>) -> Response {
    match state.link.reset_display().await {
        Ok(()) => {
            state.fanout.invalidate_cache();
            state.input.mark_reset();
            Json(json!({ "ok": true })).into_response()
        }
        Err(e) => link_error(e),
    }
}

/// `GET /api/state`
pub async fn state(State(state): State<AppState>) -> Json<Value> {
    Json(state.input.state_json())
}

/// `GET /api/ports`
pub async fn ports() -> Json<Value> {
    Json(json!({ "ports": SerialLink::list_ports() }))
}

/// `POST /api/port` with `{port}`
pub async fn set_port(State(state): State<AppState>, body: Bytes) -> Response {
    let value = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(port) = value.get("port").and_then(Value::as_str) else {
        return bad_request("missing port");
    };

    state.link.set_preferred_path(Some(port.to_string()));
    state.link.request_reconnect().await;
    Json(json!({ "status": "ok", "port": port })).into_response()
}

/// `POST /api/reconnect`: cycles the link and reports where it landed.
pub async fn reconnect(State(state): State<AppState>) -> Json<Value> {
    let mut events = state.link.subscribe_events();
    state.link.request_reconnect().await;

    // Give the supervisor one scan's worth of time to come back.
    let deadline = tokio::time::sleep(RECONNECT_WAIT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LinkEvent::Connected { .. }) => break,
                Ok(LinkEvent::Disconnected) => continue,
                Ok(LinkEvent::Error { .. }) => continue,
                Err(_) => break,
            },
            _ = &mut deadline => break,
        }
    }

    Json(json!({
        "status": if state.link.is_connected() { "ok" } else { "scanning" },
        "port": state.link.port(),
        "connected": state.link.is_connected(),
    }))
}
