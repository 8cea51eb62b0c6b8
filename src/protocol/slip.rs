//! # SLIP Framing
//!
//! The M8 delimits display commands on its CDC serial endpoint with classic
//! SLIP byte stuffing (RFC 1055). This module provides a streaming decoder
//! that tolerates arbitrary chunk fragmentation, plus the matching encoder.
//!
//! ## Wire Scheme
//!
//! | Byte | Meaning |
//! |------|---------|
//! | `0xC0` | END - terminates a frame |
//! | `0xDB` | ESC - next byte is an escape code |
//! | `0xDC` | ESC_END - escaped `0xC0` payload byte |
//! | `0xDD` | ESC_ESC - escaped `0xDB` payload byte |
//!
//! Consecutive END bytes are a legal no-op; an empty frame is never emitted.

/// Frame terminator.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped END payload byte.
pub const ESC_END: u8 = 0xDC;
/// Escaped ESC payload byte.
pub const ESC_ESC: u8 = 0xDD;

/// Streaming SLIP decoder.
///
/// Feed it byte chunks as they arrive from the serial port; completed frames
/// come back in arrival order. Partial frames are held internally until the
/// terminating END is seen, so any fragmentation of the input yields the same
/// frame sequence as feeding the concatenation.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    escaped: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of raw serial bytes, returning every frame completed
    /// by this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if self.escaped {
                // Anything other than the two escape codes is taken literally.
                match byte {
                    ESC_END => self.buf.push(END),
                    ESC_ESC => self.buf.push(ESC),
                    other => self.buf.push(other),
                }
                self.escaped = false;
                continue;
            }
            match byte {
                END => {
                    if !self.buf.is_empty() {
                        frames.push(std::mem::take(&mut self.buf));
                    }
                }
                ESC => self.escaped = true,
                other => self.buf.push(other),
            }
        }
        frames
    }

    /// Discards any partially accumulated frame and escape state.
    ///
    /// Called when the serial link drops so a half-received frame from the
    /// old session cannot prefix the first frame of the next one.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.escaped = false;
    }

    /// Number of bytes buffered for the frame currently in flight.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Encodes one frame, returning the stuffed bytes including the trailing END.
///
/// `decode(encode(frame))` reproduces `frame` exactly, and frames encoded
/// back-to-back decode in the same order.
pub fn encode(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 2);
    for &byte in frame {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(END);
    out
}
