//! m8-bridge: remote-access gateway for the Dirtywave M8 (binary entry
//! point).
//!
//! This file stays minimal; all wiring and lifecycle management lives in
//! the library crate (`lib.rs`).

/// Starts the tokio runtime and hands control to the library.
///
/// Exits non-zero on unrecoverable startup failure (a listener port that
/// cannot be bound); a clean SIGINT shutdown exits zero.
#[tokio::main]
async fn main() {
    if let Err(e) = m8_bridge::run().await {
        eprintln!("m8-bridge: {e:#}");
        std::process::exit(1);
    }
}
