//! # m8-bridge Library
//!
//! Remote-access gateway for the Dirtywave M8 tracker: ingests the device's
//! SLIP-framed USB serial stream, rebuilds the screen as a text grid and a
//! pixel framebuffer, captures the USB audio stream through a helper
//! process, and fans everything out to TCP proxy clients, WebSocket
//! consumers, and a REST API.
//!
//! ## Responsibilities
//! *   **Wiring**: builds the channel topology between the serial link, the
//!     fan-out coordinator, the audio hub, and the transports.
//! *   **Lifecycle**: startup ordering, reconnect supervision, and the
//!     ordered shutdown sequence.
//!
//! ## Architecture
//! One mpsc channel carries parsed commands from the serial reader to the
//! single fan-out coordinator task; everything outbound is a
//! `tokio::sync::broadcast` channel whose receivers are the consumer sets.
//! Projection state lives behind `std::sync::Mutex` and is only mutated on
//! the coordinator task.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub mod audio;
pub mod config;
pub mod display;
pub mod gateway;
pub mod input;
pub mod protocol;
pub mod serial;
pub mod server;

use audio::{AudioCapture, AudioHub};
use config::Config;
use gateway::{fanout, tcp, FanoutState, TcpBroadcaster};
use input::InputController;
use serial::{LinkEvent, SerialLink};
use server::AppState;

/// Builds the gateway, runs it until SIGINT, then shuts it down in order.
///
/// # Errors
/// Returns an error (and the process exits non-zero) only for unrecoverable
/// startup failures, which in practice means a listener port that cannot be
/// bound. A missing device is not an error: the sockets come up and the
/// gateway waits for the hardware.
pub async fn run() -> Result<()> {
    let cfg = Arc::new(Config::load());
    init_tracing(&cfg.log_level);
    info!(
        "m8-bridge starting: http={}, tcp={}, audio={}",
        cfg.http_port, cfg.tcp_port, cfg.audio
    );

    // Channel topology. The raw channel fans serial chunks out to the TCP
    // batcher and /display sockets; the command channel funnels parsed
    // commands into the one coordinator task.
    let (raw_tx, _) = broadcast::channel(1024);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let link = SerialLink::new(cfg.link_config(), raw_tx.clone(), cmd_tx);
    let fanout_state = Arc::new(FanoutState::new());
    let hub = Arc::new(AudioHub::new());
    let capture = AudioCapture::new(cfg.audio_helper.clone(), cfg.audio, Arc::clone(&hub));
    let input = InputController::new(Arc::clone(&link));
    let tcp_broadcaster = Arc::new(TcpBroadcaster::new());

    // Core tasks: command application, the 10 fps screen timer, and the
    // serial supervisor.
    tokio::spawn(fanout::run(Arc::clone(&fanout_state), cmd_rx));
    tokio::spawn(fanout::screen_timer(
        Arc::clone(&fanout_state),
        shutdown_rx.clone(),
    ));
    tokio::spawn(Arc::clone(&link).run(shutdown_rx.clone()));

    // The device re-enumerates on reconnect, which tears down the audio
    // interface; cycle capture whenever the link comes back.
    {
        let capture = Arc::clone(&capture);
        let mut events = link.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, LinkEvent::Connected { .. }) {
                    capture.restart_if_running().await;
                }
            }
        });
    }

    // Raw TCP proxy, unless disabled. Binding happens here so a busy port
    // is fatal at startup.
    if cfg.tcp_port != 0 {
        let listener = tcp::bind(cfg.tcp_port).await?;
        tokio::spawn(tcp::run(
            Arc::clone(&tcp_broadcaster),
            listener,
            Arc::clone(&link),
            raw_tx.subscribe(),
            hub.subscribe_pcm(),
            shutdown_rx.clone(),
        ));
        // The proxy stream is configured to carry audio, so capture starts
        // now rather than waiting for the first /audio socket.
        if cfg.audio {
            capture.ensure_started().await;
        }
    }

    let state = AppState {
        cfg: Arc::clone(&cfg),
        link: Arc::clone(&link),
        fanout: Arc::clone(&fanout_state),
        hub: Arc::clone(&hub),
        capture: Arc::clone(&capture),
        input,
        tcp: Arc::clone(&tcp_broadcaster),
        raw_tx,
    };
    let http_listener = server::bind(cfg.http_port).await?;
    let mut http_task = tokio::spawn(server::serve(http_listener, state, shutdown_rx));

    // Run until asked to stop, or until the server dies underneath us.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        result = &mut http_task => {
            error!("http server exited unexpectedly");
            return result?;
        }
    }

    // Ordered shutdown: timers and transports first (with the TCP batch
    // flush), then audio, then the device gets its goodbye sentinel.
    let _ = shutdown_tx.send(true);
    capture.stop().await;
    hub.stop_recording();
    link.send_disconnect_sentinel().await;
    let _ = http_task.await;

    info!("m8-bridge stopped");
    Ok(())
}

/// Log setup: `M8_LOG`/`-l` pick the default level, `RUST_LOG` still wins
/// for per-target filtering.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("m8_bridge={level},warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
