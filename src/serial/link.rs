//! # Serial Link
//!
//! The one owner of the device's CDC endpoint. Detection matches the USB
//! vendor/product ids unless a path is pinned in the configuration; the open
//! port is split into a reader task and a shared writer.
//!
//! ## Data Flow
//!
//! ```text
//! [SerialStream reader] --chunk--> raw broadcast (TCP batcher, /display)
//!                        `-------> SlipDecoder -> CommandParser -> command mpsc (fan-out)
//! ```
//!
//! The raw sink always sees a chunk before the decoder does, so proxied
//! consumers never observe derived state ahead of the bytes it came from.
//!
//! ## Reconnect
//!
//! Losing the port marks the link disconnected, clears the path, emits
//! [`LinkEvent::Disconnected`], and (when auto-reconnect is on) starts a
//! periodic scan. Three failed scans escalate to the USB recovery ladder,
//! then scanning resumes. The loop ends when a device is acquired or the
//! gateway shuts down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialPortType, SerialStream, StopBits,
};
use tracing::{debug, error, info, warn};

use super::{recovery, RecoveryConfig, DEVICE_PIDS, DEVICE_VID};
use crate::protocol::{Command, CommandParser, SlipDecoder};

/// Outbound control bytes the device understands.
pub mod ctrl {
    /// `0x43 <bitmask>`: controller (button) state.
    pub const CONTROLLER: u8 = 0x43;
    /// `0x4B <note> <vel>` for note-on, `0x4B 0xFF` for note-off.
    pub const NOTE: u8 = 0x4B;
    /// Note-off marker byte.
    pub const NOTE_OFF: u8 = 0xFF;
    /// Enable the display stream.
    pub const ENABLE: u8 = 0x45;
    /// Reset (full redraw of) the display.
    pub const RESET: u8 = 0x52;
    /// Graceful-disconnect sentinel sent at shutdown.
    pub const DISCONNECT: u8 = 0x44;
}

/// Pause between the enable and reset bytes of the wake-up sequence.
const ENABLE_SETTLE: Duration = Duration::from_millis(500);
/// Failed scans before the recovery ladder is invoked.
const SCANS_BEFORE_RECOVERY: u32 = 3;
/// Serial read buffer size.
const READ_BUF_SIZE: usize = 1024;

/// Typed failure surface for outbound writes.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial link is not connected")]
    NotConnected,
    #[error("serial write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected { path: String },
    Disconnected,
    /// Unrecoverable trouble (a failed recovery ladder pass); the reconnect
    /// loop keeps running regardless.
    Error { message: String },
}

/// Static link configuration, resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct SerialLinkConfig {
    /// Explicit device path; set, it bypasses the vendor/product scan.
    pub path: Option<String>,
    pub baud: u32,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub recovery: RecoveryConfig,
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        SerialLinkConfig {
            path: None,
            baud: 115_200,
            auto_reconnect: true,
            reconnect_interval: Duration::from_millis(1000),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// One serial port as reported to `GET /api/ports`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub path: String,
    pub manufacturer: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub is_m8: bool,
}

/// The serial link. Created once at startup and shared for the process
/// lifetime; connection state flips underneath it any number of times.
pub struct SerialLink {
    cfg: SerialLinkConfig,
    /// Path override from `POST /api/port`; takes precedence over `cfg.path`.
    preferred_path: StdMutex<Option<String>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    connected: AtomicBool,
    port_path: StdMutex<Option<String>>,
    raw_tx: broadcast::Sender<Bytes>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_tx: broadcast::Sender<LinkEvent>,
    /// Bumped on every successful open; a reader whose generation is stale
    /// discards what it read and exits instead of polluting the stream.
    generation: AtomicU64,
    /// Total connection attempts, successful or not. Diagnostic only.
    scan_attempts: AtomicU64,
    /// Pinged whenever the link drops, waking the supervisor. `notify_one`
    /// stores a permit, so a drop that lands before the supervisor parks is
    /// not lost.
    disconnected: Notify,
    /// Pinged by `/api/reconnect` and `/api/port` to skip the scan wait.
    nudge: Notify,
}

impl SerialLink {
    pub fn new(
        cfg: SerialLinkConfig,
        raw_tx: broadcast::Sender<Bytes>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(16);
        Arc::new(SerialLink {
            preferred_path: StdMutex::new(cfg.path.clone()),
            cfg,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            port_path: StdMutex::new(None),
            raw_tx,
            cmd_tx,
            event_tx,
            generation: AtomicU64::new(0),
            scan_attempts: AtomicU64::new(0),
            disconnected: Notify::new(),
            nudge: Notify::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Path of the currently open port, if any.
    pub fn port(&self) -> Option<String> {
        self.port_path.lock().expect("port path lock").clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// Pins the device path for the next connection attempt and wakes the
    /// supervisor.
    pub fn set_preferred_path(&self, path: Option<String>) {
        *self.preferred_path.lock().expect("preferred path lock") = path;
        self.nudge.notify_one();
    }

    /// Drops the current connection (if any) and wakes the supervisor for an
    /// immediate rescan.
    pub async fn request_reconnect(&self) {
        if self.is_connected() {
            self.writer.lock().await.take();
            self.finish_disconnect();
        }
        self.nudge.notify_one();
    }

    /// Enumerates every visible serial port, flagging matching devices.
    pub fn list_ports() -> Vec<PortInfo> {
        tokio_serial::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    path: p.port_name,
                    manufacturer: usb.manufacturer,
                    vendor_id: Some(usb.vid),
                    product_id: Some(usb.pid),
                    is_m8: usb.vid == DEVICE_VID && DEVICE_PIDS.contains(&usb.pid),
                },
                _ => PortInfo {
                    path: p.port_name,
                    manufacturer: None,
                    vendor_id: None,
                    product_id: None,
                    is_m8: false,
                },
            })
            .collect()
    }

    /// Writes `bytes` and drains the port before returning. On a
    /// disconnected link this fails fast with [`LinkError::NotConnected`];
    /// an I/O failure tears the connection down and starts the reconnect
    /// path.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("serial write failed, dropping link: {e}");
                guard.take();
                drop(guard);
                self.finish_disconnect();
                Err(LinkError::Io(e))
            }
        }
    }

    /// Wakes the device display stream: enable, settle, reset.
    pub async fn enable_device(&self) -> Result<(), LinkError> {
        self.write(&[ctrl::ENABLE]).await?;
        tokio::time::sleep(ENABLE_SETTLE).await;
        self.write(&[ctrl::RESET]).await
    }

    /// Asks the device for a full redraw.
    pub async fn reset_display(&self) -> Result<(), LinkError> {
        self.write(&[ctrl::RESET]).await
    }

    /// Best-effort graceful-disconnect sentinel, sent at shutdown.
    pub async fn send_disconnect_sentinel(&self) {
        if let Err(e) = self.write(&[ctrl::DISCONNECT]).await {
            debug!("disconnect sentinel not delivered: {e}");
        }
    }

    /// Supervisor: keeps the link connected until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut failed_scans: u32 = 0;
        let mut reader_task: Option<tokio::task::JoinHandle<()>> = None;
        loop {
            if *shutdown.borrow() {
                if let Some(task) = reader_task.take() {
                    task.abort();
                }
                break;
            }

            if !self.is_connected() {
                // A stale reader from the previous session must not outlive
                // the reconnect.
                if let Some(task) = reader_task.take() {
                    task.abort();
                }
                match self.try_connect().await {
                    Some((path, reader, generation)) => {
                        failed_scans = 0;
                        info!("device connected on {path}");
                        reader_task =
                            Some(tokio::spawn(Arc::clone(&self).read_loop(reader, generation)));
                        if let Err(e) = self.enable_device().await {
                            warn!("device enable sequence failed: {e}");
                        }
                    }
                    None => {
                        failed_scans += 1;
                        debug!("device scan {failed_scans} found nothing");
                        if self.cfg.auto_reconnect && failed_scans >= SCANS_BEFORE_RECOVERY {
                            failed_scans = 0;
                            let report = recovery::run_auto(&self.cfg.recovery).await;
                            info!(
                                procedure = report.procedure,
                                success = report.success,
                                device_found = report.device_found,
                                "usb recovery pass finished: {}",
                                report.message
                            );
                            if !report.device_found {
                                let _ = self.event_tx.send(LinkEvent::Error {
                                    message: format!(
                                        "usb recovery ({}) did not bring the device back",
                                        report.procedure
                                    ),
                                });
                            }
                        }
                        if self.cfg.auto_reconnect {
                            tokio::select! {
                                _ = tokio::time::sleep(self.cfg.reconnect_interval) => {}
                                _ = self.nudge.notified() => {}
                                _ = shutdown.changed() => {}
                            }
                        } else {
                            // Manual mode: no periodic scan. The next
                            // attempt waits for /api/reconnect or /api/port.
                            tokio::select! {
                                _ = self.nudge.notified() => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        continue;
                    }
                }
            }

            // Connected: sleep until the link drops, a reconnect is forced,
            // or the gateway stops.
            tokio::select! {
                _ = self.disconnected.notified() => {
                    warn!("serial link lost");
                    if !self.cfg.auto_reconnect {
                        // Manual mode: hold off until /api/reconnect.
                        tokio::select! {
                            _ = self.nudge.notified() => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                _ = self.nudge.notified() => {
                    info!("reconnect requested, cycling the link");
                    self.writer.lock().await.take();
                    self.finish_disconnect();
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One detection + open attempt. On success the link is marked
    /// connected and the caller receives the read half to pump, tagged with
    /// this session's generation.
    async fn try_connect(&self) -> Option<(String, ReadHalf<SerialStream>, u64)> {
        self.scan_attempts.fetch_add(1, Ordering::SeqCst);
        let path = self.find_device()?;
        let stream = match self.open_port(&path) {
            Ok(stream) => stream,
            Err(e) => {
                // Transient: the device may still be enumerating.
                debug!("open {path} failed: {e}");
                return None;
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(writer);
        *self.port_path.lock().expect("port path lock") = Some(path.clone());
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(LinkEvent::Connected { path: path.clone() });
        Some((path, reader, generation))
    }

    /// Resolves the port to open: pinned path if set, otherwise the first
    /// port matching the device ids.
    fn find_device(&self) -> Option<String> {
        if let Some(path) = self.preferred_path.lock().expect("preferred path lock").clone() {
            return Some(path);
        }
        Self::list_ports().into_iter().find(|p| p.is_m8).map(|p| p.path)
    }

    fn open_port(&self, path: &str) -> Result<SerialStream, tokio_serial::Error> {
        let mut stream = tokio_serial::new(path, self.cfg.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open_native_async()?;
        #[cfg(unix)]
        if let Err(e) = stream.set_exclusive(false) {
            debug!("could not release exclusive lock on {path}: {e}");
        }
        Ok(stream)
    }

    /// Receiver: pumps chunks to the raw sink first, then the decoder, until
    /// the port errors out or the session is superseded.
    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<SerialStream>, generation: u64) {
        let mut decoder = SlipDecoder::new();
        let mut parser = CommandParser::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    warn!("serial port closed by the device");
                    break;
                }
                Ok(n) => {
                    if self.generation.load(Ordering::SeqCst) != generation {
                        // Superseded mid-read; these bytes belong to a dead
                        // session.
                        return;
                    }
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    // Raw consumers first, then derived commands.
                    let _ = self.raw_tx.send(chunk.clone());
                    for frame in decoder.feed(&chunk) {
                        if let Some(cmd) = parser.parse(&frame) {
                            if self.cmd_tx.send(cmd).is_err() {
                                error!("command channel closed, stopping reader");
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("serial read failed: {e}");
                    break;
                }
            }
        }

        if self.generation.load(Ordering::SeqCst) == generation {
            self.writer.lock().await.take();
            self.finish_disconnect();
        }
    }

    /// Final stretch of every disconnect path: flip state, clear the path,
    /// fire the hook, wake the supervisor. Idempotent.
    fn finish_disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.port_path.lock().expect("port path lock").take();
            let _ = self.event_tx.send(LinkEvent::Disconnected);
            self.disconnected.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_link() -> Arc<SerialLink> {
        let (raw_tx, _) = broadcast::channel(8);
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        SerialLink::new(SerialLinkConfig::default(), raw_tx, cmd_tx)
    }

    #[tokio::test]
    async fn write_on_disconnected_link_fails_fast() {
        let link = test_link();
        let err = link.write(&[ctrl::RESET]).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
    }

    #[tokio::test]
    async fn finish_disconnect_is_idempotent() {
        let link = test_link();
        let mut events = link.subscribe_events();

        // Pretend we were connected.
        link.connected.store(true, Ordering::SeqCst);
        *link.port_path.lock().unwrap() = Some("/dev/ttyACM0".into());

        link.finish_disconnect();
        link.finish_disconnect();

        assert!(!link.is_connected());
        assert_eq!(link.port(), None);
        assert!(matches!(events.try_recv(), Ok(LinkEvent::Disconnected)));
        // Only one event for the two calls.
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn preferred_path_bypasses_scan() {
        let link = test_link();
        link.set_preferred_path(Some("/dev/ttyTEST".into()));
        assert_eq!(link.find_device(), Some("/dev/ttyTEST".into()));
    }

    /// A config whose connect attempts always fail fast: the pinned path
    /// can never open, and the recovery ladder points at a directory that
    /// does not exist so it cannot touch the host's real sysfs.
    fn unconnectable_config(auto_reconnect: bool) -> SerialLinkConfig {
        let sandbox = std::env::temp_dir().join(format!(
            "m8-bridge-link-test-missing-{}",
            std::process::id()
        ));
        SerialLinkConfig {
            path: Some("/dev/null/nonexistent".into()),
            auto_reconnect,
            reconnect_interval: Duration::from_millis(10),
            recovery: RecoveryConfig {
                usb_devices: sandbox.join("usb"),
                pci_drivers: sandbox.join("pci/drivers"),
                pci_devices: sandbox.join("pci/devices"),
                pci_rescan: sandbox.join("pci/rescan"),
                settle_short: Duration::from_millis(1),
                settle_medium: Duration::from_millis(1),
                settle_long: Duration::from_millis(1),
                auto_max_level: 1,
                ..RecoveryConfig::default()
            },
            ..SerialLinkConfig::default()
        }
    }

    fn supervised_link(auto_reconnect: bool) -> Arc<SerialLink> {
        let (raw_tx, _) = broadcast::channel(8);
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        SerialLink::new(unconnectable_config(auto_reconnect), raw_tx, cmd_tx)
    }

    async fn wait_for_attempts(link: &SerialLink, at_least: u64) {
        for _ in 0..500 {
            if link.scan_attempts.load(Ordering::SeqCst) >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "supervisor stuck at {} attempts, wanted {at_least}",
            link.scan_attempts.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn manual_mode_rescans_only_when_nudged() {
        let link = supervised_link(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(Arc::clone(&link).run(shutdown_rx));

        // Exactly one boot-time attempt, then the supervisor parks: many
        // reconnect intervals pass without another scan.
        wait_for_attempts(&link, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(link.scan_attempts.load(Ordering::SeqCst), 1);

        // An explicit request buys exactly one more attempt.
        link.request_reconnect().await;
        wait_for_attempts(&link, 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(link.scan_attempts.load(Ordering::SeqCst), 2);

        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(1), supervisor).await;
    }

    #[tokio::test]
    async fn auto_mode_rescans_on_the_interval() {
        let link = supervised_link(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(Arc::clone(&link).run(shutdown_rx));

        // No nudges: the periodic scan alone keeps attempting (and crosses
        // the three-failure recovery escalation on the way).
        wait_for_attempts(&link, 4).await;

        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(1), supervisor).await;
    }
}
