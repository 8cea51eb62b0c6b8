//! # Device Protocol Module
//!
//! Everything needed to turn the M8's USB serial byte stream into structured
//! display commands, and to frame bytes going the other way.
//!
//! ## Sub-modules
//! *   `slip`: Streaming SLIP frame decoder and encoder.
//! *   `command`: Frame-to-command parser for the five display command kinds.
//!
//! ## Pipeline Position
//!
//! ```text
//! [Serial Link] --bytes--> [SlipDecoder] --frames--> [CommandParser] --commands--> [Fan-out]
//! ```
//!
//! The decoder and parser are both pure state machines: they own no I/O and
//! are driven entirely by the serial reader task.

pub mod command;
pub mod slip;

pub use command::{Color, Command, CommandParser};
pub use slip::SlipDecoder;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::delta_cache::DeltaCache;
    use crate::display::text_grid::{Cursor, TextGrid};

    /// Drives raw wire bytes through the same decoder/parser/projection
    /// steps the serial reader and fan-out coordinator take.
    struct Pipeline {
        decoder: SlipDecoder,
        parser: CommandParser,
        grid: TextGrid,
        delta: DeltaCache,
    }

    impl Pipeline {
        fn new() -> Self {
            Pipeline {
                decoder: SlipDecoder::new(),
                parser: CommandParser::new(),
                grid: TextGrid::new(),
                delta: DeltaCache::new(),
            }
        }

        /// Returns the commands that made it past the delta cache.
        fn feed(&mut self, bytes: &[u8]) -> Vec<Command> {
            let mut emitted = Vec::new();
            for frame in self.decoder.feed(bytes) {
                if let Some(cmd) = self.parser.parse(&frame) {
                    self.grid.apply(&cmd);
                    if self.delta.should_send(&cmd) {
                        emitted.push(cmd);
                    }
                }
            }
            emitted
        }
    }

    #[test]
    fn highlight_text_lands_in_the_grid_with_cursor() {
        let mut pipe = Pipeline::new();
        let emitted = pipe.feed(&[
            0xFD, 0x41, 0x10, 0x00, 0x14, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0xC0,
        ]);
        assert_eq!(emitted.len(), 1);

        let cell = pipe.grid.cell(2, 2).unwrap();
        assert_eq!(cell.ch, 'A');
        assert_eq!(cell.fg, Color::WHITE);
        assert_eq!(cell.bg, Color::BLACK);
        assert_eq!(pipe.grid.cursor(), Cursor { row: 2, col: 2 });
    }

    #[test]
    fn full_screen_rect_resets_grid_and_reopens_cache() {
        let mut pipe = Pipeline::new();
        let text = [
            0xFD, 0x41, 0x10, 0x00, 0x14, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0xC0,
        ];
        pipe.feed(&text);
        assert!(pipe.feed(&text).is_empty(), "repeat is suppressed");

        // 320x240 black rectangle at the origin.
        pipe.feed(&[
            0xFE, 0x00, 0x00, 0x00, 0x00, 0x40, 0x01, 0xF0, 0x00, 0x00, 0x00, 0x00, 0xC0,
        ]);
        assert_eq!(pipe.grid.render(), "");

        // The identical text command passes through again.
        assert_eq!(pipe.feed(&text).len(), 1);
    }

    #[test]
    fn short_rectangle_form_inherits_the_last_color() {
        let mut pipe = Pipeline::new();
        let with_color = pipe.feed(&[
            0xFE, 0x0A, 0x00, 0x14, 0x00, 0x0A, 0x00, 0x05, 0x00, 0xFF, 0x00, 0x00, 0xC0,
        ]);
        // Same geometry, length-9 form with the color bytes omitted.
        let inherited = pipe.feed(&[
            0xFE, 0x0B, 0x00, 0x14, 0x00, 0x0A, 0x00, 0x05, 0x00, 0xC0,
        ]);

        let color_of = |cmd: &Command| match cmd {
            Command::Rectangle { color, .. } => *color,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(color_of(&with_color[0]), Color::new(255, 0, 0));
        assert_eq!(color_of(&inherited[0]), Color::new(255, 0, 0));
    }

    #[test]
    fn fragmented_wire_bytes_replay_identically() {
        let frames: Vec<u8> = [
            vec![0xFD, 0x42, 0x08, 0x00, 0x0A, 0x00, 0x10, 0x10, 0x10, 0x00, 0x00, 0x00, 0xC0],
            vec![0xFE, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x0A, 0x00, 0xC0],
            vec![0xFC, 0x20, 0x30, 0x40, 0x01, 0x02, 0x03, 0xC0],
        ]
        .concat();

        let mut whole = Pipeline::new();
        let expected = whole.feed(&frames);

        let mut trickled = Pipeline::new();
        let mut got = Vec::new();
        for byte in &frames {
            got.extend(trickled.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(got, expected);
        assert_eq!(expected.len(), 3);
    }
}
