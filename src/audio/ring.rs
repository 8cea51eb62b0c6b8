//! # Ring Buffer
//!
//! A fixed-capacity circular byte store backing the audio hub. The producer
//! is the capture task, the consumer the broadcast path; neither ever blocks
//! on the other. With the overwrite policy on, a full buffer sheds its
//! oldest bytes instead of rejecting the push, so late joiners always see
//! the freshest audio.

use thiserror::Error;

/// Push refusal on a non-overwriting buffer.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("ring buffer overflow: {needed} bytes needed, {available} available")]
pub struct Overflow {
    pub needed: usize,
    pub available: usize,
}

/// Circular byte store with wrap-around in at most two segments.
pub struct RingBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
    count: usize,
    overwrite: bool,
}

impl RingBuffer {
    /// A buffer that rejects pushes which would not fit.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, false)
    }

    /// A buffer that frees the oldest bytes to make room.
    pub fn overwriting(capacity: usize) -> Self {
        Self::with_policy(capacity, true)
    }

    fn with_policy(capacity: usize, overwrite: bool) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        RingBuffer {
            data: vec![0; capacity],
            read: 0,
            write: 0,
            count: 0,
            overwrite,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Free space.
    pub fn available(&self) -> usize {
        self.capacity() - self.count
    }

    /// Appends `data`, returning the number of bytes written.
    ///
    /// Overwriting buffers advance the read index just far enough to fit;
    /// input longer than the whole buffer keeps only its trailing
    /// `capacity` bytes. Non-overwriting buffers refuse oversized pushes
    /// outright.
    pub fn push(&mut self, data: &[u8]) -> Result<usize, Overflow> {
        let capacity = self.capacity();

        if data.len() > self.available() {
            if !self.overwrite {
                return Err(Overflow {
                    needed: data.len(),
                    available: self.available(),
                });
            }
            if data.len() >= capacity {
                // Only the trailing window survives.
                let tail = &data[data.len() - capacity..];
                self.data.copy_from_slice(tail);
                self.read = 0;
                self.write = 0;
                self.count = capacity;
                return Ok(capacity);
            }
            // Shed just enough of the oldest bytes.
            let shed = data.len() - self.available();
            self.read = (self.read + shed) % capacity;
            self.count -= shed;
        }

        // At most two contiguous segments.
        let first = (capacity - self.write).min(data.len());
        self.data[self.write..self.write + first].copy_from_slice(&data[..first]);
        let rest = &data[first..];
        self.data[..rest.len()].copy_from_slice(rest);
        self.write = (self.write + data.len()) % capacity;
        self.count += data.len();
        Ok(data.len())
    }

    /// Moves up to `out.len()` bytes into `out`, advancing the read index.
    /// Returns the number of bytes transferred.
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.copy_out(out);
        self.read = (self.read + n) % self.capacity();
        self.count -= n;
        n
    }

    /// Like [`RingBuffer::pop`] without consuming.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.copy_out(out)
    }

    fn copy_out(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.count);
        let first = (self.capacity() - self.read).min(n);
        out[..first].copy_from_slice(&self.data[self.read..self.read + first]);
        out[first..n].copy_from_slice(&self.data[..n - first]);
        n
    }

    /// Forgets the contents without touching the backing memory.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let mut ring = RingBuffer::new(8);
        assert_eq!(ring.push(b"abc").unwrap(), 3);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.available(), 5);

        let mut out = [0u8; 8];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_in_two_segments() {
        let mut ring = RingBuffer::new(8);
        ring.push(b"12345").unwrap();
        let mut out = [0u8; 3];
        ring.pop(&mut out);
        // Read index is now 3; this push wraps.
        ring.push(b"abcdef").unwrap();
        assert_eq!(ring.len(), 8);

        let mut all = [0u8; 8];
        assert_eq!(ring.pop(&mut all), 8);
        assert_eq!(&all, b"45abcdef");
    }

    #[test]
    fn non_overwriting_rejects_overflow() {
        let mut ring = RingBuffer::new(4);
        ring.push(b"abc").unwrap();
        let err = ring.push(b"de").unwrap_err();
        assert_eq!(
            err,
            Overflow {
                needed: 2,
                available: 1,
            }
        );
        // The refused push left the contents alone.
        let mut out = [0u8; 4];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn overwriting_sheds_oldest() {
        let mut ring = RingBuffer::overwriting(4);
        ring.push(b"abcd").unwrap();
        ring.push(b"ef").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(ring.pop(&mut out), 4);
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn oversized_push_keeps_trailing_window() {
        // Scenario S6 scaled down: push far more than capacity, pop the lot.
        let mut ring = RingBuffer::overwriting(100);
        let data: Vec<u8> = (0..1000u16).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(64) {
            ring.push(chunk).unwrap();
        }
        let mut out = vec![0u8; 100];
        assert_eq!(ring.pop(&mut out), 100);
        assert_eq!(&out[..], &data[900..]);
    }

    #[test]
    fn single_oversized_push() {
        let mut ring = RingBuffer::overwriting(4);
        ring.push(b"0123456789").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(ring.pop(&mut out), 4);
        assert_eq!(&out, b"6789");
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = RingBuffer::new(8);
        ring.push(b"xyz").unwrap();
        let mut a = [0u8; 3];
        let mut b = [0u8; 3];
        assert_eq!(ring.peek(&mut a), 3);
        assert_eq!(ring.pop(&mut b), 3);
        assert_eq!(a, b);
    }

    #[test]
    fn clear_resets_counters() {
        let mut ring = RingBuffer::new(8);
        ring.push(b"abcdef").unwrap();
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.available(), 8);
        // Reusable after the clear.
        ring.push(b"Z").unwrap();
        let mut out = [0u8; 1];
        ring.pop(&mut out);
        assert_eq!(&out, b"Z");
    }

    #[test]
    fn invariants_hold_over_a_fill_drain_cycle() {
        let mut ring = RingBuffer::new(16);
        let mut out = [0u8; 16];
        for round in 0..50usize {
            let n = (round % 11) + 1;
            let data: Vec<u8> = vec![round as u8; n];
            if ring.push(&data).is_ok() {
                assert!(ring.len() <= ring.capacity());
            }
            let take = (round % 7) + 1;
            let got = ring.pop(&mut out[..take.min(16)]);
            assert!(got <= take);
            assert_eq!(ring.available(), ring.capacity() - ring.len());
        }
    }
}
