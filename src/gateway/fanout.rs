//! # Fan-out Coordinator
//!
//! Every parsed command passes through here exactly once, on a single task,
//! as one indivisible step: text grid, framebuffer, delta cache, then the
//! JSON command broadcast. Consumers therefore never observe a broadcast
//! whose state projection has not happened yet.
//!
//! The coordinator also owns the 10 fps screen timer that snapshots the
//! framebuffer to BMP for `/screen` subscribers. The snapshot is taken under
//! the framebuffer lock and serialized outside of it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace};

use crate::display::delta_cache::{CacheStats, DeltaCache};
use crate::display::framebuffer::Framebuffer;
use crate::display::text_grid::TextGrid;
use crate::protocol::Command;

/// `/screen` broadcast period (10 fps).
pub const SCREEN_PERIOD: Duration = Duration::from_millis(100);

/// Shared projection state plus the outbound display channels.
pub struct FanoutState {
    grid: StdMutex<TextGrid>,
    framebuffer: StdMutex<Framebuffer>,
    delta: StdMutex<DeltaCache>,
    /// JSON-serialized commands for `/control` subscribers.
    cmd_tx: broadcast::Sender<String>,
    /// BMP snapshots for `/screen` subscribers.
    img_tx: broadcast::Sender<Bytes>,
    /// Epoch millis of the last applied command.
    last_update_ms: AtomicU64,
}

impl Default for FanoutState {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutState {
    pub fn new() -> Self {
        let (cmd_tx, _) = broadcast::channel(1024);
        let (img_tx, _) = broadcast::channel(8);
        FanoutState {
            grid: StdMutex::new(TextGrid::new()),
            framebuffer: StdMutex::new(Framebuffer::new()),
            delta: StdMutex::new(DeltaCache::new()),
            cmd_tx,
            img_tx,
            last_update_ms: AtomicU64::new(0),
        }
    }

    pub fn subscribe_commands(&self) -> broadcast::Receiver<String> {
        self.cmd_tx.subscribe()
    }

    pub fn subscribe_images(&self) -> broadcast::Receiver<Bytes> {
        self.img_tx.subscribe()
    }

    /// Applies one command to every projection and routes it downstream.
    /// This is the indivisible step of the pipeline.
    pub fn apply(&self, cmd: &Command) {
        self.grid.lock().expect("grid lock").apply(cmd);
        self.framebuffer.lock().expect("framebuffer lock").apply(cmd);

        let emit = self.delta.lock().expect("delta lock").should_send(cmd);
        if emit && self.cmd_tx.receiver_count() > 0 {
            match serde_json::to_string(cmd) {
                Ok(json) => {
                    let _ = self.cmd_tx.send(json);
                }
                Err(e) => debug!("command serialization failed: {e}"),
            }
        }

        self.last_update_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Epoch millis of the most recent command, 0 before the first one.
    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::Relaxed)
    }

    /// Consistent BMP snapshot of the framebuffer.
    pub fn snapshot_bmp(&self) -> Bytes {
        self.framebuffer.lock().expect("framebuffer lock").to_bmp()
    }

    /// Grid snapshot for `GET /api/screen`.
    pub fn screen_json(&self) -> serde_json::Value {
        let (rows, cursor) = {
            let grid = self.grid.lock().expect("grid lock");
            (grid.rows(), grid.cursor())
        };
        serde_json::json!({
            "rows": rows,
            "cursor": cursor,
            "lastUpdate": self.last_update_ms(),
        })
    }

    /// Plain-text grid rendering for `GET /api/screen/text`.
    pub fn screen_text(&self) -> String {
        self.grid.lock().expect("grid lock").render()
    }

    /// Drops all delta-cache memory, forcing the next command at every
    /// position to re-emit. Used around device resets.
    pub fn invalidate_cache(&self) {
        self.delta.lock().expect("delta lock").reset();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.delta.lock().expect("delta lock").stats()
    }

    /// Live `/control` subscriber count.
    pub fn command_consumers(&self) -> usize {
        self.cmd_tx.receiver_count()
    }

    /// Live `/screen` subscriber count.
    pub fn image_consumers(&self) -> usize {
        self.img_tx.receiver_count()
    }
}

/// Coordinator task: drains the command channel until the link side closes.
pub async fn run(state: Arc<FanoutState>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = cmd_rx.recv().await {
        trace!(?cmd, "applying command");
        state.apply(&cmd);
    }
    debug!("command channel closed, fan-out coordinator exiting");
}

/// Screen timer task: broadcasts a BMP snapshot every 100 ms while anyone
/// is listening.
pub async fn screen_timer(state: Arc<FanoutState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SCREEN_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if state.image_consumers() > 0 {
                    let bmp = state.snapshot_bmp();
                    let _ = state.img_tx.send(bmp);
                }
            }
            _ = shutdown.changed() => {
                debug!("screen timer stopped");
                return;
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
