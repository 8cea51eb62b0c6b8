//! # Audio Capture Subprocess
//!
//! USB isochronous handling stays out of this process: a helper binary
//! claims the device's audio interface and writes raw S16LE 44.1 kHz stereo
//! PCM to its stdout. This module owns that child's lifecycle.
//!
//! *   **Lazy start**: capture spawns on the first audio consumer, or at
//!     boot when the TCP stream is configured to carry audio.
//! *   **Restart on reconnect**: a serial reconnect means the device
//!     re-enumerated, so a running capture is cycled.
//! *   **Cooperative stop**: SIGTERM first, one second of grace, then kill.
//!
//! A helper crash is reported to audio consumers as a framed control
//! message; capture stays stopped until re-requested.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::AudioHub;

/// Default helper binary, resolved via PATH.
pub const DEFAULT_HELPER: &str = "m8-audio-capture";

/// Grace period between SIGTERM and the hard kill.
const TERM_GRACE: Duration = Duration::from_secs(1);
/// stdout read size; two USB iso packets fit comfortably.
const CHUNK_SIZE: usize = 4096;

/// Capture subprocess manager.
pub struct AudioCapture {
    helper: PathBuf,
    enabled: bool,
    hub: Arc<AudioHub>,
    child: Mutex<Option<Child>>,
    running: AtomicBool,
    /// Set while `stop` runs so the reader does not report the exit as a
    /// crash.
    stopping: AtomicBool,
}

impl AudioCapture {
    pub fn new(helper: Option<PathBuf>, enabled: bool, hub: Arc<AudioHub>) -> Arc<Self> {
        Arc::new(AudioCapture {
            helper: helper.unwrap_or_else(|| PathBuf::from(DEFAULT_HELPER)),
            enabled,
            hub,
            child: Mutex::new(None),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the helper unless capture is disabled or already up.
    pub async fn ensure_started(self: &Arc<Self>) {
        if !self.enabled || self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut child = match Command::new(&self.helper)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("audio capture helper {:?} failed to spawn: {e}", self.helper);
                self.running.store(false, Ordering::SeqCst);
                self.hub.publish_control(&serde_json::json!({
                    "type": "error",
                    "source": "audio-capture",
                    "message": format!("helper spawn failed: {e}"),
                }));
                return;
            }
        };

        let Some(stdout) = child.stdout.take() else {
            warn!("audio capture helper came up without a stdout pipe");
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        info!("audio capture started ({:?})", self.helper);
        *self.child.lock().await = Some(child);
        self.hub.publish_control(&serde_json::json!({
            "type": "status",
            "source": "audio-capture",
            "running": true,
        }));

        let capture = Arc::clone(self);
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => capture.hub.handle_chunk(Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        warn!("audio capture read failed: {e}");
                        break;
                    }
                }
            }
            capture.on_reader_exit().await;
        });
    }

    /// Reader cleanup; reports a crash unless a deliberate stop is in
    /// flight.
    async fn on_reader_exit(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.wait().await;
        }
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if was_running && !self.stopping.load(Ordering::SeqCst) {
            warn!("audio capture helper exited unexpectedly");
            self.hub.publish_control(&serde_json::json!({
                "type": "error",
                "source": "audio-capture",
                "message": "capture stream ended unexpectedly",
            }));
        }
    }

    /// Stops the helper: SIGTERM, grace, then kill. Idempotent.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                // Ask nicely first; the helper flushes and releases the
                // interface on SIGTERM.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    Ok(_) => info!("audio capture stopped"),
                    Err(_) => {
                        warn!("audio capture ignored SIGTERM, killing");
                        let _ = child.kill().await;
                    }
                }
            } else {
                let _ = child.kill().await;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);
        self.hub.publish_control(&serde_json::json!({
            "type": "status",
            "source": "audio-capture",
            "running": false,
        }));
    }

    /// Cycles the helper; used when the device re-enumerates after a serial
    /// reconnect.
    pub async fn restart_if_running(self: &Arc<Self>) {
        if self.is_running() {
            info!("cycling audio capture after reconnect");
            self.stop().await;
            self.ensure_started().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Arc<AudioHub> {
        Arc::new(AudioHub::new())
    }

    #[tokio::test]
    async fn disabled_capture_never_starts() {
        let capture = AudioCapture::new(None, false, hub());
        capture.ensure_started().await;
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn missing_helper_reports_an_error_frame() {
        let hub = hub();
        let mut frames = hub.subscribe_frames();
        let capture = AudioCapture::new(
            Some(PathBuf::from("/nonexistent/m8-audio-capture")),
            true,
            hub,
        );
        capture.ensure_started().await;
        assert!(!capture.is_running());

        let frame = frames.try_recv().unwrap();
        assert_eq!(frame[0], super::super::hub::FRAME_CONTROL);
        let parsed: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(parsed["type"], "error");
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let capture = AudioCapture::new(None, true, hub());
        capture.stop().await;
        capture.stop().await;
        assert!(!capture.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn capture_pumps_helper_stdout_to_the_hub() {
        use std::os::unix::fs::PermissionsExt;

        // Stand-in helper: a script that emits a known byte stream and exits.
        let script = std::env::temp_dir().join(format!("m8-bridge-fake-capture-{}", std::process::id()));
        std::fs::write(&script, "#!/bin/sh\nprintf 'abcd'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let hub = hub();
        let mut pcm = hub.subscribe_pcm();
        let capture = AudioCapture::new(Some(script.clone()), true, Arc::clone(&hub));
        capture.ensure_started().await;

        assert_eq!(pcm.recv().await.unwrap(), Bytes::from_static(b"abcd"));

        // The helper exits on its own and the reader marks capture stopped.
        for _ in 0..200 {
            if !capture.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!capture.is_running());
        let _ = std::fs::remove_file(&script);
    }
}
