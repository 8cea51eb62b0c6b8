//! # Tracked Input State
//!
//! The gateway cannot read the device's mind; it can only watch what it
//! sends. This module keeps a best-effort guess of which tracker screen is
//! up and where the cursor sits, derived purely from the inputs the gateway
//! itself has delivered.
//!
//! Every applied input decays a confidence scalar, because each guess
//! compounds the chance that the device did something we did not model
//! (edge wrapping, modal views, a human pressing physical buttons). An
//! explicit verification, such as the known post-reset position, snaps
//! confidence back to one.

use serde::Serialize;

use super::Key;

/// Multiplicative decay applied per tracked input.
const CONFIDENCE_DECAY: f32 = 0.95;
/// Raw bitmasks are less predictable than named keys.
const RAW_DECAY: f32 = 0.85;
/// Floor, so the scalar stays meaningful instead of denormal.
const CONFIDENCE_FLOOR: f32 = 0.01;

/// Row/column bounds of the cursor guess, matching the densest screen.
const MAX_ROWS: u8 = 16;
const MAX_COLS: u8 = 8;

/// The tracker screens reachable by shift-navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Screen {
    Song,
    Chain,
    Phrase,
    Instrument,
    Table,
    Project,
    Mixer,
    Effects,
}

impl Screen {
    /// Shift+Right neighbor.
    fn right(self) -> Screen {
        use Screen::*;
        match self {
            Song => Chain,
            Chain => Phrase,
            Phrase => Instrument,
            Instrument => Table,
            Table => Table,
            Project => Mixer,
            Mixer => Effects,
            Effects => Effects,
        }
    }

    /// Shift+Left neighbor.
    fn left(self) -> Screen {
        use Screen::*;
        match self {
            Song => Song,
            Chain => Song,
            Phrase => Chain,
            Instrument => Phrase,
            Table => Instrument,
            Project => Project,
            Mixer => Project,
            Effects => Mixer,
        }
    }
}

/// Best-effort model of the device's UI position.
#[derive(Debug)]
pub struct InputTracker {
    screen: Screen,
    cursor_row: u8,
    cursor_col: u8,
    selection: u8,
    chain_row: u8,
    confidence: f32,
}

impl Default for InputTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InputTracker {
    pub fn new() -> Self {
        InputTracker {
            screen: Screen::Song,
            cursor_row: 0,
            cursor_col: 0,
            selection: 0,
            chain_row: 0,
            confidence: 1.0,
        }
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// A plain key press: arrows move the cursor, everything else only
    /// costs confidence.
    pub fn apply_key(&mut self, key: Key) {
        match key {
            Key::Up => self.cursor_row = self.cursor_row.saturating_sub(1),
            Key::Down => self.cursor_row = (self.cursor_row + 1).min(MAX_ROWS - 1),
            Key::Left => self.cursor_col = self.cursor_col.saturating_sub(1),
            Key::Right => self.cursor_col = (self.cursor_col + 1).min(MAX_COLS - 1),
            _ => {}
        }
        if self.screen == Screen::Chain {
            self.chain_row = self.cursor_row;
        }
        self.decay(CONFIDENCE_DECAY);
    }

    /// A combo: shift navigates between screens, opt adjusts the selection.
    pub fn apply_combo(&mut self, hold: Key, press: Key) {
        match (hold, press) {
            (Key::Shift, Key::Right) => self.change_screen(self.screen.right()),
            (Key::Shift, Key::Left) => self.change_screen(self.screen.left()),
            (Key::Shift, Key::Up) => self.change_screen(Screen::Project),
            (Key::Shift, Key::Down) => {
                let target = if self.screen == Screen::Mixer {
                    Screen::Effects
                } else {
                    Screen::Mixer
                };
                self.change_screen(target);
            }
            (Key::Opt, Key::Up) => self.selection = self.selection.wrapping_add(1),
            (Key::Opt, Key::Down) => self.selection = self.selection.wrapping_sub(1),
            _ => {}
        }
        self.decay(CONFIDENCE_DECAY);
    }

    /// A raw bitmask: effects are opaque, so the guess gets much weaker.
    pub fn apply_raw(&mut self, _mask: u8) {
        self.decay(RAW_DECAY);
    }

    /// The device returns to the song view at the origin after a reset;
    /// seeing one is the strongest signal the tracker gets.
    pub fn verify_reset(&mut self) {
        self.screen = Screen::Song;
        self.cursor_row = 0;
        self.cursor_col = 0;
        self.confidence = 1.0;
    }

    fn change_screen(&mut self, screen: Screen) {
        if self.screen != screen {
            self.screen = screen;
            self.cursor_row = 0;
            self.cursor_col = 0;
        }
    }

    fn decay(&mut self, factor: f32) {
        self.confidence = (self.confidence * factor).max(CONFIDENCE_FLOOR);
    }

    /// JSON shape served by `GET /api/state`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "screen": self.screen,
            "cursor": { "row": self.cursor_row, "col": self.cursor_col },
            "selection": self.selection,
            "chainCursor": self.chain_row,
            "confidence": self.confidence,
        })
    }
}
