//! # Audio Hub
//!
//! Takes raw PCM chunks from the capture subprocess and multiplexes them to
//! every audio consumer:
//!
//! *   `/audio` WebSocket clients get each chunk framed `[0x00, <pcm>]`, and
//!     control/status metadata framed `[0x01, <json>]`.
//! *   The TCP broadcaster gets the unframed chunk (it applies its own
//!     `0x41` packet framing).
//! *   A ring buffer keeps the most recent audio for late-join catch-up.
//! *   An optional WAV sink appends every chunk to a file.
//!
//! The WAV sink runs on a dedicated OS thread fed through a bounded
//! crossbeam channel, keeping blocking file I/O out of the async runtime.
//! At most one recording is active; starting a new one closes the previous.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{RingBuffer, BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE};

/// Frame tag for PCM payloads on the audio WebSocket.
pub const FRAME_PCM: u8 = 0x00;
/// Frame tag for JSON control messages on the audio WebSocket.
pub const FRAME_CONTROL: u8 = 0x01;

/// Ring capacity: about 1.5 s of 44.1 kHz stereo S16LE.
const RING_CAPACITY: usize = 256 * 1024;
/// Recorder channel depth before the producer side starts dropping.
const RECORDER_QUEUE: usize = 64;

/// The audio fan-out hub.
pub struct AudioHub {
    ring: StdMutex<RingBuffer>,
    /// Framed `[tag, payload]` messages for WebSocket consumers.
    frame_tx: broadcast::Sender<Bytes>,
    /// Raw PCM for the TCP broadcaster's own framing.
    pcm_tx: broadcast::Sender<Bytes>,
    recorder: StdMutex<Option<WavRecorder>>,
}

impl Default for AudioHub {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHub {
    pub fn new() -> Self {
        let (frame_tx, _) = broadcast::channel(256);
        let (pcm_tx, _) = broadcast::channel(256);
        AudioHub {
            ring: StdMutex::new(RingBuffer::overwriting(RING_CAPACITY)),
            frame_tx,
            pcm_tx,
            recorder: StdMutex::new(None),
        }
    }

    /// Framed message stream for one WebSocket consumer.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Bytes> {
        self.frame_tx.subscribe()
    }

    /// Raw PCM stream for the TCP broadcaster.
    pub fn subscribe_pcm(&self) -> broadcast::Receiver<Bytes> {
        self.pcm_tx.subscribe()
    }

    /// Live `/audio` consumer count.
    pub fn frame_consumers(&self) -> usize {
        self.frame_tx.receiver_count()
    }

    /// Ingests one PCM chunk from the capture subprocess.
    pub fn handle_chunk(&self, chunk: Bytes) {
        // Overwriting ring: push cannot fail.
        let _ = self.ring.lock().expect("audio ring lock").push(&chunk);

        let mut framed = BytesMut::with_capacity(1 + chunk.len());
        framed.put_u8(FRAME_PCM);
        framed.extend_from_slice(&chunk);
        let _ = self.frame_tx.send(framed.freeze());

        let _ = self.pcm_tx.send(chunk.clone());

        if let Some(recorder) = self.recorder.lock().expect("recorder lock").as_ref() {
            // A saturated sink loses chunks rather than stalling capture.
            if recorder.tx.try_send(chunk).is_err() {
                warn!("wav sink behind, dropping a chunk");
            }
        }
    }

    /// Publishes a control/status message to every WebSocket consumer.
    pub fn publish_control(&self, value: &serde_json::Value) {
        let json = value.to_string();
        let mut framed = BytesMut::with_capacity(1 + json.len());
        framed.put_u8(FRAME_CONTROL);
        framed.extend_from_slice(json.as_bytes());
        let _ = self.frame_tx.send(framed.freeze());
    }

    /// Copies out up to `out.len()` of the most recently buffered bytes.
    pub fn catch_up(&self, out: &mut [u8]) -> usize {
        self.ring.lock().expect("audio ring lock").peek(out)
    }

    /// Starts a WAV recording, closing any previous one first.
    pub fn start_recording(&self, path: &Path) -> Result<()> {
        let recorder = WavRecorder::spawn(path)?;
        let previous = self.recorder.lock().expect("recorder lock").replace(recorder);
        if let Some(previous) = previous {
            previous.finish();
        }
        info!("recording audio to {}", path.display());
        self.publish_control(&serde_json::json!({
            "type": "recording",
            "active": true,
            "path": path.display().to_string(),
        }));
        Ok(())
    }

    /// Stops and finalizes the active recording, if any.
    pub fn stop_recording(&self) {
        if let Some(recorder) = self.recorder.lock().expect("recorder lock").take() {
            let path = recorder.path.clone();
            recorder.finish();
            info!("recording closed: {}", path.display());
            self.publish_control(&serde_json::json!({
                "type": "recording",
                "active": false,
            }));
        }
    }
}

/// Dedicated WAV-writer thread plus its feeding channel.
struct WavRecorder {
    tx: crossbeam_channel::Sender<Bytes>,
    handle: JoinHandle<()>,
    path: PathBuf,
}

impl WavRecorder {
    fn spawn(path: &Path) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("creating wav file {}", path.display()))?;

        let (tx, rx) = crossbeam_channel::bounded::<Bytes>(RECORDER_QUEUE);
        let thread_path = path.to_path_buf();
        let handle = std::thread::spawn(move || {
            // Runs until the sender side is dropped.
            for chunk in rx {
                for sample in chunk.chunks_exact(2) {
                    let value = i16::from_le_bytes([sample[0], sample[1]]);
                    if writer.write_sample(value).is_err() {
                        warn!("wav write failed, abandoning {}", thread_path.display());
                        return;
                    }
                }
            }
            if let Err(e) = writer.finalize() {
                warn!("wav finalize failed: {e}");
            }
        });

        Ok(WavRecorder {
            tx,
            handle,
            path: path.to_path_buf(),
        })
    }

    /// Closes the channel and waits for the header to be finalized.
    fn finish(self) {
        drop(self.tx);
        let _ = self.handle.join();
    }
}
