//! # Gateway Module
//!
//! The routing heart of the bridge.
//!
//! ## Sub-modules
//! *   `fanout`: the coordinator that applies every parsed command to the
//!     display projections and pushes it out on the consumer channels.
//! *   `tcp`: the raw binary proxy for native viewer reimplementations.
//!
//! ## Channel Topology
//!
//! ```text
//!                         raw bytes            commands (post delta-cache)
//! [Serial Link] ----+--- broadcast ---> /display    +--- broadcast ---> /control
//!                   |        `--------> tcp batcher |
//!                   `-- decoder --> [fanout] -------+--- 100 ms timer -> /screen (BMP)
//!                                      |
//! [Audio Hub] --- pcm broadcast -------+-----------------> tcp audio packets
//! ```
//!
//! Consumer membership is the set of live broadcast receivers; a consumer
//! that fails its write simply ends its own task and drops out. Emission
//! never blocks on a slow consumer.

pub mod fanout;
pub mod tcp;

pub use fanout::FanoutState;
pub use tcp::TcpBroadcaster;
