//! # Serial Link Module
//!
//! Owns the USB CDC connection to the device and keeps it alive.
//!
//! ## Sub-modules
//! *   `link`: device detection, the reader task, outbound writes, and the
//!     auto-reconnect supervisor.
//! *   `recovery`: the ladder of increasingly invasive host-side USB reset
//!     procedures the supervisor escalates to when plain rescanning fails.
//!
//! ## Lifecycle
//!
//! ```text
//! [scan] --found--> [connected] --I/O error--> [disconnected]
//!    ^                                               |
//!    |            every 1000 ms, recovery            |
//!    +-------------- after 3 failed scans -----------+
//! ```

pub mod link;
pub mod recovery;

pub use link::{LinkEvent, SerialLink, SerialLinkConfig};
pub use recovery::{RecoveryConfig, RecoveryReport};

/// USB vendor id shared by all device revisions.
pub const DEVICE_VID: u16 = 0x16c0;
/// Product ids: Model:02 hardware and the headless unit.
pub const DEVICE_PIDS: [u16; 2] = [0x048a, 0x048b];
