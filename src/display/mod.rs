//! # Display Reconstruction Module
//!
//! The gateway keeps two parallel pictures of the device screen, both rebuilt
//! purely from the command stream:
//!
//! 1. **Text grid** (`text_grid`): a 40x24 character-cell view. Cheap, good
//!    for the REST text endpoints and for scripting against screen content.
//! 2. **Framebuffer** (`framebuffer`): a 320x240 RGB pixel view with glyph
//!    stamping and the waveform band, serialized to BMP for the 10 fps
//!    `/screen` broadcast.
//!
//! `delta_cache` sits between the parser and the outbound channels and drops
//! commands that would repaint what consumers already have.
//!
//! Everything in here is pure state: no I/O, no channels, no locking. The
//! fan-out coordinator owns the mutation path.

pub mod delta_cache;
pub mod font;
pub mod framebuffer;
pub mod text_grid;

/// Device screen width in pixels.
pub const SCREEN_WIDTH: usize = 320;
/// Device screen height in pixels.
pub const SCREEN_HEIGHT: usize = 240;
/// Text grid width in cells.
pub const GRID_COLS: usize = 40;
/// Text grid height in cells.
pub const GRID_ROWS: usize = 24;
/// Horizontal pixels per grid cell.
pub const CELL_WIDTH: usize = 8;
/// Vertical pixels per grid cell.
pub const CELL_HEIGHT: usize = 10;
