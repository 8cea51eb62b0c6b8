//! # Input Encoder
//!
//! Turns named keys and combos into the timed `0x43 <bitmask>` sequences the
//! device expects, plus the `0x4B` note passthrough. All three ingress paths
//! (REST, `/control` WebSocket, raw TCP bytes) end up here or go straight to
//! the link.
//!
//! ## Bit Table
//!
//! | key | bit | mask |
//! |-------|-----|------|
//! | edit | 0 | 1 |
//! | opt | 1 | 2 |
//! | right | 2 | 4 |
//! | start | 3 | 8 |
//! | shift | 4 | 16 |
//! | down | 5 | 32 |
//! | up | 6 | 64 |
//! | left | 7 | 128 |
//!
//! A single press holds for 50 ms. A combo is four timed steps: hold alone,
//! ~20 ms, hold plus press for 50 ms, hold alone again, ~20 ms, all clear.

pub mod tracker;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::debug;

use crate::serial::link::{ctrl, LinkError};
use crate::serial::SerialLink;
use tracker::InputTracker;

/// Hold time for a single key press.
pub const KEY_HOLD: Duration = Duration::from_millis(50);
/// Settle time around combo transitions.
pub const COMBO_STEP: Duration = Duration::from_millis(20);
/// Default note-on velocity.
pub const DEFAULT_VELOCITY: u8 = 100;

/// The eight device buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Key {
    Edit,
    Opt,
    Right,
    Start,
    Shift,
    Down,
    Up,
    Left,
}

impl Key {
    pub const ALL: [Key; 8] = [
        Key::Edit,
        Key::Opt,
        Key::Right,
        Key::Start,
        Key::Shift,
        Key::Down,
        Key::Up,
        Key::Left,
    ];

    /// Bit position in the controller bitmask.
    pub const fn bit(self) -> u8 {
        match self {
            Key::Edit => 0,
            Key::Opt => 1,
            Key::Right => 2,
            Key::Start => 3,
            Key::Shift => 4,
            Key::Down => 5,
            Key::Up => 6,
            Key::Left => 7,
        }
    }

    pub const fn mask(self) -> u8 {
        1 << self.bit()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Key::Edit => "edit",
            Key::Opt => "opt",
            Key::Right => "right",
            Key::Start => "start",
            Key::Shift => "shift",
            Key::Down => "down",
            Key::Up => "up",
            Key::Left => "left",
        }
    }
}

impl FromStr for Key {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "edit" => Ok(Key::Edit),
            "opt" | "option" => Ok(Key::Opt),
            "right" => Ok(Key::Right),
            "start" | "play" => Ok(Key::Start),
            "shift" => Ok(Key::Shift),
            "down" => Ok(Key::Down),
            "up" => Ok(Key::Up),
            "left" => Ok(Key::Left),
            _ => Err(()),
        }
    }
}

/// Encodes validated input into timed byte sequences on the link, and keeps
/// the tracked-state guess current.
pub struct InputController {
    link: Arc<SerialLink>,
    tracker: StdMutex<InputTracker>,
}

impl InputController {
    pub fn new(link: Arc<SerialLink>) -> Arc<Self> {
        Arc::new(InputController {
            link,
            tracker: StdMutex::new(InputTracker::new()),
        })
    }

    /// Snapshot of the tracked input state for `GET /api/state`.
    pub fn state_json(&self) -> serde_json::Value {
        self.tracker.lock().expect("tracker lock").to_json()
    }

    /// Marks the tracked state verified at the device's post-reset position.
    pub fn mark_reset(&self) {
        self.tracker.lock().expect("tracker lock").verify_reset();
    }

    /// Single press: mask down, 50 ms, all clear.
    pub async fn press_key(&self, key: Key) -> Result<(), LinkError> {
        debug!("key press: {}", key.name());
        self.send_state(key.mask()).await?;
        sleep(KEY_HOLD).await;
        self.send_state(0).await?;
        self.tracker.lock().expect("tracker lock").apply_key(key);
        Ok(())
    }

    /// Combo: hold alone, settle, hold+press, hold alone, settle, clear.
    pub async fn press_combo(&self, hold: Key, press: Key) -> Result<(), LinkError> {
        debug!("combo: {}+{}", hold.name(), press.name());
        let held = hold.mask();
        self.send_state(held).await?;
        sleep(COMBO_STEP).await;
        self.send_state(held | press.mask()).await?;
        sleep(KEY_HOLD).await;
        self.send_state(held).await?;
        sleep(COMBO_STEP).await;
        self.send_state(0).await?;
        self.tracker
            .lock()
            .expect("tracker lock")
            .apply_combo(hold, press);
        Ok(())
    }

    /// Writes a raw bitmask. With a hold duration a release to zero is
    /// scheduled, unless the caller suppresses it.
    pub async fn raw_bitmask(
        &self,
        mask: u8,
        hold: Option<Duration>,
        release: bool,
    ) -> Result<(), LinkError> {
        self.send_state(mask).await?;
        self.tracker.lock().expect("tracker lock").apply_raw(mask);
        if let Some(hold) = hold {
            if release {
                let link = Arc::clone(&self.link);
                tokio::spawn(async move {
                    sleep(hold).await;
                    if let Err(e) = link.write(&[ctrl::CONTROLLER, 0]).await {
                        debug!("scheduled release not delivered: {e}");
                    }
                });
            }
        }
        Ok(())
    }

    pub async fn note_on(&self, note: u8, velocity: u8) -> Result<(), LinkError> {
        self.link.write(&[ctrl::NOTE, note, velocity]).await
    }

    pub async fn note_off(&self) -> Result<(), LinkError> {
        self.link.write(&[ctrl::NOTE, ctrl::NOTE_OFF]).await
    }

    async fn send_state(&self, mask: u8) -> Result<(), LinkError> {
        self.link.write(&[ctrl::CONTROLLER, mask]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_table_matches_the_device() {
        assert_eq!(Key::Edit.mask(), 1);
        assert_eq!(Key::Opt.mask(), 2);
        assert_eq!(Key::Right.mask(), 4);
        assert_eq!(Key::Start.mask(), 8);
        assert_eq!(Key::Shift.mask(), 16);
        assert_eq!(Key::Down.mask(), 32);
        assert_eq!(Key::Up.mask(), 64);
        assert_eq!(Key::Left.mask(), 128);
    }

    #[test]
    fn masks_are_disjoint_and_cover_the_byte() {
        let mut seen = 0u8;
        for key in Key::ALL {
            assert_eq!(seen & key.mask(), 0, "{} overlaps", key.name());
            seen |= key.mask();
        }
        assert_eq!(seen, 0xFF);
    }

    #[test]
    fn names_round_trip() {
        for key in Key::ALL {
            assert_eq!(key.name().parse::<Key>(), Ok(key));
        }
        assert!("select".parse::<Key>().is_err());
        assert_eq!("UP".parse::<Key>(), Ok(Key::Up));
    }
}
