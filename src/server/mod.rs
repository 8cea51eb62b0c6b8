//! # HTTP Server Module
//!
//! One Axum listener carries the whole browser-facing surface: the REST API
//! under `/api` and the four WebSocket channels at `/control`, `/screen`,
//! `/display`, and `/audio`.
//!
//! CORS is wide open (`*`, GET/POST/OPTIONS, Content-Type) because the
//! expected client is a UI served from anywhere on the LAN; preflights come
//! back `204 No Content`.

pub mod rest;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::audio::{AudioCapture, AudioHub};
use crate::config::Config;
use crate::gateway::{FanoutState, TcpBroadcaster};
use crate::input::InputController;
use crate::serial::SerialLink;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub link: Arc<SerialLink>,
    pub fanout: Arc<FanoutState>,
    pub hub: Arc<AudioHub>,
    pub capture: Arc<AudioCapture>,
    pub input: Arc<InputController>,
    pub tcp: Arc<TcpBroadcaster>,
    /// Raw serial chunk channel, subscribed per `/display` socket.
    pub raw_tx: broadcast::Sender<Bytes>,
}

/// Builds the full route table.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/health", get(rest::health))
        .route("/api/screen", get(rest::screen))
        .route("/api/screen/text", get(rest::screen_text))
        .route("/api/screen/image", get(rest::screen_image))
        .route("/api/key/{name}", post(rest::press_key))
        .route("/api/keys", post(rest::press_keys))
        .route("/api/raw", post(rest::raw_bitmask))
        .route("/api/note", post(rest::note_on))
        .route("/api/note/off", post(rest::note_off))
        .route("/api/reset", post(rest::reset))
        .route("/api/state", get(rest::state))
        .route("/api/ports", get(rest::ports))
        .route("/api/port", post(rest::set_port))
        .route("/api/reconnect", post(rest::reconnect))
        .route("/control", get(ws::control))
        .route("/screen", get(ws::screen))
        .route("/display", get(ws::display))
        .route("/audio", get(ws::audio))
        .layer(cors)
        // Outermost, so it also rewrites preflights answered by the CORS
        // layer itself.
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(state)
}

/// Binds the HTTP listener; a busy port is a startup failure.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding http server to port {port}"))?;
    info!("http server listening on port {port}");
    Ok(listener)
}

/// Serves until the shutdown flag flips.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("http server terminated")?;
    Ok(())
}

/// Preflights answer `204 No Content` rather than Axum's default `200`.
async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_preflight = req.method() == Method::OPTIONS;
    let mut res = next.run(req).await;
    if is_preflight && res.status() == StatusCode::OK {
        *res.status_mut() = StatusCode::NO_CONTENT;
    }
    res
}
