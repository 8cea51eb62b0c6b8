//! # TCP Broadcaster
//!
//! The raw binary proxy (default port 3333) for native reimplementations of
//! the device's viewer. Each client receives the SLIP stream and the audio
//! stream as tagged, length-prefixed packets, and may write raw device
//! commands upstream at any time.
//!
//! ## Packet Format (server to client)
//!
//! ```text
//! byte 0   : tag      0x44 'D' display / 0x41 'A' audio
//! bytes 1-2: length   u16, BIG-endian (unlike the device dialect!)
//! bytes 3+ : payload
//! ```
//!
//! Display packets are coalesced for up to 5 ms and flushed as one write per
//! client; audio packets go out unbatched. Both travel the same per-client
//! channel, so each client sees them in emission order.
//!
//! A slow or broken client is dropped on its own task; nobody else stalls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::serial::SerialLink;

/// Display-stream packet tag ('D').
pub const TAG_DISPLAY: u8 = 0x44;
/// Audio-stream packet tag ('A').
pub const TAG_AUDIO: u8 = 0x41;

/// Batching window for display packets. Must stay under 16 ms to keep the
/// proxy within one frame of the device.
pub const BATCH_INTERVAL: Duration = Duration::from_millis(5);

/// Per-client packet queue depth before a laggard is dropped.
const CLIENT_QUEUE: usize = 512;
/// Client input read buffer.
const INPUT_BUF_SIZE: usize = 256;

/// Frames `payload` as one or more tagged packets. Payloads beyond the u16
/// length field are split, preserving byte order.
pub fn frame_packet(tag: u8, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 3);
    if payload.is_empty() {
        out.put_u8(tag);
        out.put_u16(0);
        return out.freeze();
    }
    for piece in payload.chunks(u16::MAX as usize) {
        out.put_u8(tag);
        // Length prefix is BIG-endian on the proxy wire.
        out.put_u16(piece.len() as u16);
        out.extend_from_slice(piece);
    }
    out.freeze()
}

/// Shared handle: client accounting for `/api/health`.
pub struct TcpBroadcaster {
    clients: AtomicUsize,
}

impl Default for TcpBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpBroadcaster {
    pub fn new() -> Self {
        TcpBroadcaster {
            clients: AtomicUsize::new(0),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

/// Binds the broadcaster socket. Separate from [`run`] so a busy port is a
/// startup error with a non-zero exit, not a background log line.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding tcp broadcaster to port {port}"))?;
    info!("tcp broadcaster listening on port {port}");
    Ok(listener)
}

/// Runs the broadcaster on a bound listener until shutdown.
pub async fn run(
    broadcaster: Arc<TcpBroadcaster>,
    listener: TcpListener,
    link: Arc<SerialLink>,
    raw_rx: broadcast::Receiver<Bytes>,
    pcm_rx: broadcast::Receiver<Bytes>,
    shutdown: watch::Receiver<bool>,
) {
    // One packet channel feeds every client writer, in emission order.
    let (packet_tx, _) = broadcast::channel::<Bytes>(CLIENT_QUEUE);
    tokio::spawn(batch_task(
        raw_rx,
        pcm_rx,
        packet_tx.clone(),
        shutdown.clone(),
    ));

    let mut shutdown_accept = shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        info!("tcp client connected: {peer}");
                        broadcaster.clients.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(client_task(
                            socket,
                            packet_tx.subscribe(),
                            Arc::clone(&link),
                            Arc::clone(&broadcaster),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!("tcp accept failed: {e}"),
                }
            }
            _ = shutdown_accept.changed() => {
                info!("tcp broadcaster shutting down");
                return;
            }
        }
    }
}

/// Coalesces display chunks on a 5 ms tick; audio packets bypass the batch.
async fn batch_task(
    mut raw_rx: broadcast::Receiver<Bytes>,
    mut pcm_rx: broadcast::Receiver<Bytes>,
    packet_tx: broadcast::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch = BytesMut::new();
    let mut ticker = tokio::time::interval(BATCH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            chunk = raw_rx.recv() => match chunk {
                Ok(chunk) => batch.extend_from_slice(&frame_packet(TAG_DISPLAY, &chunk)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("tcp batcher lagged {n} serial chunks");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            chunk = pcm_rx.recv() => match chunk {
                Ok(chunk) => {
                    // Audio is fire-and-forget: no batching, no retry.
                    let _ = packet_tx.send(frame_packet(TAG_AUDIO, &chunk));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    let _ = packet_tx.send(batch.split().freeze());
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Best-effort final flush so clients see the tail of the stream.
    if !batch.is_empty() {
        let _ = packet_tx.send(batch.split().freeze());
    }
}

/// One connected client: packets down, raw device commands up.
async fn client_task(
    socket: TcpStream,
    mut packet_rx: broadcast::Receiver<Bytes>,
    link: Arc<SerialLink>,
    broadcaster: Arc<TcpBroadcaster>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("set_nodelay failed: {e}");
    }
    let (mut reader, mut writer) = socket.into_split();
    let mut input = [0u8; INPUT_BUF_SIZE];

    loop {
        tokio::select! {
            packet = packet_rx.recv() => match packet {
                Ok(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // A laggard has an undecodable SLIP stream now; cut it
                    // loose rather than feed it a corrupted tail.
                    warn!("tcp client lagged {n} packets, dropping");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            read = reader.read(&mut input) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Inbound bytes are raw device commands; merge them onto
                    // the link verbatim.
                    if let Err(e) = link.write(&input[..n]).await {
                        debug!("client input not delivered: {e}");
                    }
                }
            },
            _ = shutdown.changed() => {
                // Drain whatever the batcher already flushed, then close.
                while let Ok(bytes) = packet_rx.try_recv() {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    broadcaster.clients.fetch_sub(1, Ordering::SeqCst);
    debug!("tcp client gone");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parses a byte string as the `tag || len || payload` packet grammar,
    /// returning (tag, payload) pairs.
    fn parse_packets(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            assert!(bytes.len() >= 3, "truncated packet header");
            let tag = bytes[0];
            assert!(tag == TAG_DISPLAY || tag == TAG_AUDIO, "unknown tag {tag:#x}");
            let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
            assert!(bytes.len() >= 3 + len, "truncated packet payload");
            out.push((tag, bytes[3..3 + len].to_vec()));
            bytes = &bytes[3 + len..];
        }
        out
    }

    #[test]
    fn framing_is_big_endian_tagged() {
        let packet = frame_packet(TAG_DISPLAY, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(&packet[..], &[0x44, 0x00, 0x03, 0xAA, 0xBB, 0xCC]);

        let parsed = parse_packets(&packet);
        assert_eq!(parsed, vec![(TAG_DISPLAY, vec![0xAA, 0xBB, 0xCC])]);
    }

    #[test]
    fn oversized_payloads_split_into_valid_packets() {
        let payload = vec![0x55u8; u16::MAX as usize + 10];
        let packet = frame_packet(TAG_AUDIO, &payload);
        let parsed = parse_packets(&packet);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].1.len(), u16::MAX as usize);
        assert_eq!(parsed[1].1.len(), 10);
        let rejoined: Vec<u8> = parsed.into_iter().flat_map(|(_, p)| p).collect();
        assert_eq!(rejoined, payload);
    }

    #[test]
    fn empty_payload_is_a_zero_length_packet() {
        let packet = frame_packet(TAG_DISPLAY, &[]);
        assert_eq!(parse_packets(&packet), vec![(TAG_DISPLAY, vec![])]);
    }

    #[tokio::test]
    async fn batcher_coalesces_display_and_passes_audio_through() {
        let (raw_tx, raw_rx) = broadcast::channel(16);
        let (pcm_tx, pcm_rx) = broadcast::channel(16);
        let (packet_tx, mut packet_rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(batch_task(raw_rx, pcm_rx, packet_tx, shutdown_rx));

        raw_tx.send(Bytes::from_static(&[1, 2])).unwrap();
        raw_tx.send(Bytes::from_static(&[3])).unwrap();
        pcm_tx.send(Bytes::from_static(&[9, 9, 9, 9])).unwrap();

        // Collect emissions until both streams have come through. Relative
        // ordering between audio and display is unspecified.
        let mut audio_payloads = Vec::new();
        let mut display_bytes = Vec::new();
        while audio_payloads.is_empty() || display_bytes.len() < 3 {
            let emission = tokio::time::timeout(Duration::from_millis(500), packet_rx.recv())
                .await
                .expect("batcher stalled")
                .unwrap();
            for (tag, payload) in parse_packets(&emission) {
                match tag {
                    TAG_AUDIO => audio_payloads.push(payload),
                    _ => display_bytes.extend(payload),
                }
            }
        }
        assert_eq!(audio_payloads, vec![vec![9, 9, 9, 9]]);
        // Display bytes arrive in source order regardless of batching cuts.
        assert_eq!(display_bytes, vec![1, 2, 3]);

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn two_clients_survive_one_dropping() {
        // Scenario S7: client A closes mid-stream; B keeps receiving intact
        // packets.
        let broadcaster = Arc::new(TcpBroadcaster::new());
        let (raw_tx, raw_rx) = broadcast::channel(16);
        let (_pcm_tx, pcm_rx) = broadcast::channel::<Bytes>(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (link_raw_tx, _) = broadcast::channel(16);
        let (cmd_tx, _cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let link = SerialLink::new(Default::default(), link_raw_tx, cmd_tx);

        // Port 0: the kernel hands us an ephemeral port.
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(run(
            Arc::clone(&broadcaster),
            listener,
            link,
            raw_rx,
            pcm_rx,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broadcaster.client_count(), 2);

        raw_tx.send(Bytes::from_static(&[0x10, 0x20])).unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(1), a.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse_packets(&buf[..n]), vec![(TAG_DISPLAY, vec![0x10, 0x20])]);

        // A disappears; the next packet still reaches B intact.
        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        raw_tx.send(Bytes::from_static(&[0x30])).unwrap();

        let mut rejoined = Vec::new();
        while !rejoined.ends_with(&[0x30]) {
            let n = tokio::time::timeout(Duration::from_secs(1), b.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "b closed before the packet arrived");
            for (_, payload) in parse_packets(&buf[..n]) {
                rejoined.extend(payload);
            }
        }
        assert_eq!(rejoined, vec![0x10, 0x20, 0x30]);

        let _ = shutdown_tx.send(true);
        let _ = server.await;
    }
}
