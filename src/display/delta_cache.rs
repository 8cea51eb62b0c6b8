//! # Delta Cache
//!
//! The device repaints aggressively: the same cell is often re-sent with
//! identical content many times a second. Remote consumers apply commands
//! idempotently, so the gateway can drop any command whose effect is already
//! on their screens. This cache is that filter: a command goes downstream
//! only when it differs from what was last sent for its position.
//!
//! A rectangle at or above the clear threshold invalidates everything, since
//! the screen underneath the cached entries is gone. The threshold is
//! deliberately smaller than the full screen: the device clears with large
//! rectangles that do not always reach 320x240.

use std::collections::HashMap;

use crate::protocol::{Color, Command};

/// Rectangles with `w * h` at or above this area wipe the cache.
const CLEAR_AREA: u32 = 320 * 200;

/// Cached text record, keyed by pixel position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TextEntry {
    c: u8,
    fg: Color,
    bg: Color,
}

/// Emission statistics; separate from the cache so they can be reset
/// independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub sent: u64,
    pub skipped: u64,
}

impl CacheStats {
    pub fn total(&self) -> u64 {
        self.sent + self.skipped
    }

    /// Fraction of commands that actually went downstream.
    pub fn ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        self.sent as f64 / total as f64
    }
}

/// Per-position memoization of text and rectangle commands.
pub struct DeltaCache {
    text: HashMap<(u16, u16), TextEntry>,
    rects: HashMap<(u16, u16, u16, u16), Color>,
    stats: CacheStats,
}

impl Default for DeltaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaCache {
    pub fn new() -> Self {
        DeltaCache {
            text: HashMap::new(),
            rects: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Decides whether `cmd` must be re-emitted downstream, updating the
    /// cache in the same step. Wave, joypad, and system commands are never
    /// cached.
    pub fn should_send(&mut self, cmd: &Command) -> bool {
        let send = match cmd {
            Command::Text { c, x, y, fg, bg } => {
                let entry = TextEntry {
                    c: *c,
                    fg: *fg,
                    bg: *bg,
                };
                match self.text.get(&(*x, *y)) {
                    Some(cached) if *cached == entry => false,
                    _ => {
                        self.text.insert((*x, *y), entry);
                        true
                    }
                }
            }
            Command::Rectangle { x, y, w, h, color } => {
                if *w as u32 * *h as u32 >= CLEAR_AREA {
                    // Screen clear: everything cached is stale now.
                    self.text.clear();
                    self.rects.clear();
                    self.rects.insert((*x, *y, *w, *h), *color);
                    true
                } else {
                    match self.rects.get(&(*x, *y, *w, *h)) {
                        Some(cached) if *cached == *color => false,
                        _ => {
                            self.rects.insert((*x, *y, *w, *h), *color);
                            true
                        }
                    }
                }
            }
            Command::Wave { .. } | Command::Joypad { .. } | Command::System { .. } => true,
        };

        if send {
            self.stats.sent += 1;
        } else {
            self.stats.skipped += 1;
        }
        send
    }

    /// Empties both maps. Statistics are untouched.
    pub fn reset(&mut self) {
        self.text.clear();
        self.rects.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }

    /// Number of cached entries across both maps.
    pub fn len(&self) -> usize {
        self.text.len() + self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.rects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(x: u16, y: u16) -> Command {
        Command::Text {
            c: b'A',
            x,
            y,
            fg: Color::WHITE,
            bg: Color::BLACK,
        }
    }

    fn rect(x: u16, y: u16, w: u16, h: u16, color: Color) -> Command {
        Command::Rectangle { x, y, w, h, color }
    }

    #[test]
    fn duplicate_text_is_skipped() {
        let mut cache = DeltaCache::new();
        assert!(cache.should_send(&text(8, 10)));
        assert!(!cache.should_send(&text(8, 10)));
        // Different position: new entry.
        assert!(cache.should_send(&text(16, 10)));
        // Same position, different glyph: re-sent.
        assert!(cache.should_send(&Command::Text {
            c: b'B',
            x: 8,
            y: 10,
            fg: Color::WHITE,
            bg: Color::BLACK,
        }));
    }

    #[test]
    fn duplicate_rect_is_skipped_until_color_changes() {
        let mut cache = DeltaCache::new();
        let red = Color::new(255, 0, 0);
        let blue = Color::new(0, 0, 255);
        assert!(cache.should_send(&rect(4, 4, 10, 10, red)));
        assert!(!cache.should_send(&rect(4, 4, 10, 10, red)));
        assert!(cache.should_send(&rect(4, 4, 10, 10, blue)));
        // A different geometry is a different key.
        assert!(cache.should_send(&rect(4, 4, 10, 11, blue)));
    }

    #[test]
    fn clear_rectangle_invalidates_both_maps() {
        let mut cache = DeltaCache::new();
        assert!(cache.should_send(&text(8, 10)));
        assert!(cache.should_send(&rect(4, 4, 10, 10, Color::BLACK)));

        // 320x200 meets the threshold even though it is below full screen.
        assert!(cache.should_send(&rect(0, 0, 320, 200, Color::BLACK)));

        // Everything cached before the clear is re-admitted.
        assert!(cache.should_send(&text(8, 10)));
        assert!(cache.should_send(&rect(4, 4, 10, 10, Color::BLACK)));
    }

    #[test]
    fn sub_threshold_large_rect_does_not_clear() {
        let mut cache = DeltaCache::new();
        assert!(cache.should_send(&text(8, 10)));
        assert!(cache.should_send(&rect(0, 0, 319, 200, Color::BLACK)));
        assert!(!cache.should_send(&text(8, 10)));
    }

    #[test]
    fn wave_joypad_system_always_send() {
        let mut cache = DeltaCache::new();
        let wave = Command::Wave {
            color: Color::WHITE,
            samples: vec![1, 2, 3],
        };
        let joypad = Command::Joypad { state: 0 };
        let system = Command::System {
            hw_type: 2,
            fw_major: 3,
            fw_minor: 0,
            fw_patch: 0,
            font_mode: 0,
        };
        for _ in 0..3 {
            assert!(cache.should_send(&wave));
            assert!(cache.should_send(&joypad));
            assert!(cache.should_send(&system));
        }
    }

    #[test]
    fn reset_empties_cache_but_not_stats() {
        let mut cache = DeltaCache::new();
        cache.should_send(&text(8, 10));
        cache.should_send(&text(8, 10));
        cache.reset();
        assert!(cache.is_empty());
        assert!(cache.should_send(&text(8, 10)));

        let stats = cache.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.total(), 3);

        cache.reset_stats();
        assert_eq!(cache.stats().total(), 0);
        // An empty window counts as fully sent.
        assert_eq!(cache.stats().ratio(), 1.0);
    }

    #[test]
    fn stats_arithmetic_holds() {
        let mut cache = DeltaCache::new();
        for i in 0..10u16 {
            cache.should_send(&text(i * 8, 0));
        }
        for i in 0..10u16 {
            cache.should_send(&text(i * 8, 0));
        }
        let stats = cache.stats();
        assert_eq!(stats.sent + stats.skipped, stats.total());
        assert!((stats.ratio() - 0.5).abs() < f64::EPSILON);
    }
}
