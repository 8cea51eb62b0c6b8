//! # Pixel Framebuffer
//!
//! The 320x240 RGB reconstruction of the device screen. Rectangle fills,
//! glyph stamping, and the scrolling waveform band are all replayed from the
//! command stream; the result serializes to a BMP byte sequence for the
//! `/screen` broadcast and `GET /api/screen/image`.
//!
//! All writes clip silently to the screen; reads outside the screen return
//! black. A full-screen fill additionally becomes the new background color,
//! which is what the waveform band is wiped with between frames.

use bytes::Bytes;

use super::font::{self, FontMode};
use super::{SCREEN_HEIGHT, SCREEN_WIDTH};
use crate::protocol::{Color, Command};

/// BMP header size: 14-byte file header + 40-byte BITMAPINFOHEADER.
const BMP_HEADER_SIZE: usize = 54;

/// Remembered extent of the last waveform draw, so the next draw can wipe it.
#[derive(Debug, Clone, Copy)]
struct WaveFootprint {
    /// Number of rightmost columns the waveform occupied.
    columns: usize,
    /// Row depth that was painted (the clamp height at draw time).
    height: usize,
}

/// The reconstructed pixel screen.
pub struct Framebuffer {
    pixels: Vec<Color>,
    background: Color,
    font: FontMode,
    footprint: Option<WaveFootprint>,
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framebuffer {
    pub fn new() -> Self {
        Framebuffer {
            pixels: vec![Color::BLACK; SCREEN_WIDTH * SCREEN_HEIGHT],
            background: Color::BLACK,
            font: FontMode::default(),
            footprint: None,
        }
    }

    /// Applies one display command to the pixel state.
    pub fn apply(&mut self, cmd: &Command) {
        match cmd {
            Command::Rectangle { x, y, w, h, color } => {
                self.fill_rect(*x as i32, *y as i32, *w as i32, *h as i32, *color);
                // A fill covering the whole screen defines the background the
                // waveform band is cleared with.
                if *x == 0 && *y == 0 && *w as usize >= SCREEN_WIDTH && *h as usize >= SCREEN_HEIGHT
                {
                    self.background = *color;
                }
            }
            Command::Text { c, x, y, fg, bg } => {
                self.stamp_glyph(*c, *x as i32, *y as i32, *fg, *bg)
            }
            Command::Wave { color, samples } => self.draw_waveform(*color, samples),
            Command::System { font_mode, .. } => self.font = FontMode::from_wire(*font_mode),
            Command::Joypad { .. } => {}
        }
    }

    /// Current background color (adopted from the last full-screen fill).
    pub fn background(&self) -> Color {
        self.background
    }

    /// Active font mode (from the last System command).
    pub fn font_mode(&self) -> FontMode {
        self.font
    }

    /// Pixel at (x, y); out-of-range reads are black.
    pub fn pixel(&self, x: i32, y: i32) -> Color {
        if x < 0 || y < 0 || x as usize >= SCREEN_WIDTH || y as usize >= SCREEN_HEIGHT {
            return Color::BLACK;
        }
        self.pixels[y as usize * SCREEN_WIDTH + x as usize]
    }

    #[inline]
    fn set_pixel(&mut self, x: i32, y: i32, color: Color) {
        if x < 0 || y < 0 || x as usize >= SCREEN_WIDTH || y as usize >= SCREEN_HEIGHT {
            return;
        }
        self.pixels[y as usize * SCREEN_WIDTH + x as usize] = color;
    }

    /// Paints `[x, x+w) x [y, y+h)`, clipped to the screen.
    pub fn fill_rect(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color) {
        if w <= 0 || h <= 0 {
            return;
        }
        let x0 = x.max(0) as usize;
        let y0 = y.max(0) as usize;
        let x1 = x.saturating_add(w).clamp(0, SCREEN_WIDTH as i32) as usize;
        let y1 = y.saturating_add(h).clamp(0, SCREEN_HEIGHT as i32) as usize;
        for row in y0..y1 {
            let base = row * SCREEN_WIDTH;
            self.pixels[base + x0..base + x1].fill(color);
        }
    }

    /// Stamps one character at `(x, y + text_offset_y)` in the active font.
    ///
    /// The glyph's bounding box (`stride` wide, glyph-height tall) is painted
    /// in `bg`, then the atlas bits in `fg`. Codes below the atlas base do
    /// not stamp at all.
    fn stamp_glyph(&mut self, code: u8, x: i32, y: i32, fg: Color, bg: Color) {
        let Some(columns) = font::glyph(code) else {
            return;
        };
        let spec = self.font.spec();
        let top = y + spec.text_offset_y + spec.baseline_shift;

        for dy in 0..spec.glyph_height as i32 {
            for dx in 0..spec.stride as i32 {
                self.set_pixel(x + dx, top + dy, bg);
            }
        }
        for (dx, &bits) in columns.iter().enumerate() {
            for dy in 0..spec.glyph_height {
                if bits >> dy & 1 == 1 {
                    self.set_pixel(x + dx as i32, top + dy as i32, fg);
                }
            }
        }
    }

    /// Draws the waveform band along the top-right of the screen: one column
    /// per sample, sample value as the row, clamped to the font's maximum
    /// height. The previous band is wiped with the current background first.
    fn draw_waveform(&mut self, color: Color, samples: &[u8]) {
        let max_h = self.font.spec().waveform_max_height;

        if let Some(fp) = self.footprint.take() {
            let x0 = (SCREEN_WIDTH - fp.columns) as i32;
            self.fill_rect(x0, 0, fp.columns as i32, fp.height as i32 + 1, self.background);
        }

        let columns = samples.len().min(SCREEN_WIDTH);
        // Longer-than-screen captures keep their trailing samples, matching
        // the rightmost-band rule.
        let visible = &samples[samples.len() - columns..];
        let x0 = (SCREEN_WIDTH - columns) as i32;
        for (i, &sample) in visible.iter().enumerate() {
            let y = (sample as usize).min(max_h) as i32;
            self.set_pixel(x0 + i as i32, y, color);
        }

        if columns > 0 {
            self.footprint = Some(WaveFootprint {
                columns,
                height: max_h,
            });
        }
    }

    /// Serializes the screen as a 24-bit BMP: 54-byte header, BGR rows,
    /// bottom-up, rows padded to a 4-byte stride.
    pub fn to_bmp(&self) -> Bytes {
        let row_stride = (SCREEN_WIDTH * 3).div_ceil(4) * 4;
        let image_size = row_stride * SCREEN_HEIGHT;
        let file_size = BMP_HEADER_SIZE + image_size;

        let mut out = Vec::with_capacity(file_size);

        // File header.
        out.extend_from_slice(b"BM");
        out.extend_from_slice(&(file_size as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(BMP_HEADER_SIZE as u32).to_le_bytes());

        // BITMAPINFOHEADER.
        out.extend_from_slice(&40u32.to_le_bytes());
        out.extend_from_slice(&(SCREEN_WIDTH as i32).to_le_bytes());
        out.extend_from_slice(&(SCREEN_HEIGHT as i32).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // planes
        out.extend_from_slice(&24u16.to_le_bytes()); // bits per pixel
        out.extend_from_slice(&0u32.to_le_bytes()); // compression
        out.extend_from_slice(&(image_size as u32).to_le_bytes());
        out.extend_from_slice(&2835i32.to_le_bytes()); // 72 dpi
        out.extend_from_slice(&2835i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // palette colors
        out.extend_from_slice(&0u32.to_le_bytes()); // important colors

        // Pixel rows, bottom-up.
        let padding = row_stride - SCREEN_WIDTH * 3;
        for y in (0..SCREEN_HEIGHT).rev() {
            let base = y * SCREEN_WIDTH;
            for x in 0..SCREEN_WIDTH {
                let px = self.pixels[base + x];
                out.extend_from_slice(&[px.b, px.g, px.r]);
            }
            out.extend(std::iter::repeat(0u8).take(padding));
        }

        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: u16, y: u16, w: u16, h: u16, color: Color) -> Command {
        Command::Rectangle { x, y, w, h, color }
    }

    #[test]
    fn rectangle_fill_and_clipping() {
        let mut fb = Framebuffer::new();
        let red = Color::new(255, 0, 0);
        fb.fill_rect(310, 230, 100, 100, red);
        // Inside the clipped region.
        assert_eq!(fb.pixel(310, 230), red);
        assert_eq!(fb.pixel(319, 239), red);
        // Just outside the rectangle.
        assert_eq!(fb.pixel(309, 230), Color::BLACK);
        assert_eq!(fb.pixel(310, 229), Color::BLACK);
        // Out-of-range reads are black, never a panic.
        assert_eq!(fb.pixel(320, 0), Color::BLACK);
        assert_eq!(fb.pixel(-1, -1), Color::BLACK);
    }

    #[test]
    fn negative_origin_clips() {
        let mut fb = Framebuffer::new();
        let c = Color::new(1, 2, 3);
        fb.fill_rect(-10, -10, 20, 20, c);
        assert_eq!(fb.pixel(0, 0), c);
        assert_eq!(fb.pixel(9, 9), c);
        assert_eq!(fb.pixel(10, 10), Color::BLACK);
    }

    #[test]
    fn only_pixels_inside_the_intersection_change() {
        let mut fb = Framebuffer::new();
        let c = Color::new(77, 88, 99);
        fb.fill_rect(315, 5, 50, 3, c);
        for x in 0..SCREEN_WIDTH as i32 {
            for y in 0..SCREEN_HEIGHT as i32 {
                let expect = if (315..320).contains(&x) && (5..8).contains(&y) {
                    c
                } else {
                    Color::BLACK
                };
                assert_eq!(fb.pixel(x, y), expect, "at ({x},{y})");
            }
        }
    }

    #[test]
    fn full_screen_fill_adopts_background() {
        let mut fb = Framebuffer::new();
        let navy = Color::new(0, 0, 64);
        fb.apply(&rect(0, 0, 320, 240, navy));
        assert_eq!(fb.background(), navy);
        // A partial fill does not.
        fb.apply(&rect(0, 0, 319, 240, Color::WHITE));
        assert_eq!(fb.background(), navy);
    }

    #[test]
    fn glyph_stamp_stays_inside_its_box() {
        let mut fb = Framebuffer::new();
        let fg = Color::new(255, 255, 255);
        let bg = Color::new(40, 40, 40);
        fb.apply(&Command::Text {
            c: b'A',
            x: 100,
            y: 100,
            fg,
            bg,
        });
        let spec = fb.font_mode().spec();
        let top = 100 + spec.text_offset_y + spec.baseline_shift;
        let mut lit = 0;
        for dy in 0..spec.glyph_height as i32 {
            for dx in 0..spec.stride as i32 {
                let px = fb.pixel(100 + dx, top + dy);
                assert!(px == fg || px == bg, "box pixel is neither fg nor bg");
                if px == fg {
                    lit += 1;
                }
            }
        }
        assert!(lit > 0, "'A' must light at least one pixel");
        // Nothing outside the box is touched.
        assert_eq!(fb.pixel(99, top), Color::BLACK);
        assert_eq!(fb.pixel(100, top - 1), Color::BLACK);
    }

    #[test]
    fn control_codes_do_not_stamp() {
        let mut fb = Framebuffer::new();
        fb.apply(&Command::Text {
            c: 0x07,
            x: 10,
            y: 10,
            fg: Color::WHITE,
            bg: Color::new(9, 9, 9),
        });
        for x in 0..SCREEN_WIDTH as i32 {
            for y in 0..SCREEN_HEIGHT as i32 {
                assert_eq!(fb.pixel(x, y), Color::BLACK);
            }
        }
    }

    #[test]
    fn space_stamp_is_all_background() {
        let mut fb = Framebuffer::new();
        let bg = Color::new(10, 20, 30);
        fb.apply(&Command::Text {
            c: b' ',
            x: 0,
            y: 0,
            fg: Color::WHITE,
            bg,
        });
        let spec = fb.font_mode().spec();
        let top = spec.text_offset_y + spec.baseline_shift;
        for dy in 0..spec.glyph_height as i32 {
            for dx in 0..spec.stride as i32 {
                assert_eq!(fb.pixel(dx, top + dy), bg);
            }
        }
    }

    #[test]
    fn waveform_draws_in_rightmost_band() {
        let mut fb = Framebuffer::new();
        let c = Color::new(0, 255, 0);
        fb.apply(&Command::Wave {
            color: c,
            samples: vec![0, 5, 10],
        });
        assert_eq!(fb.pixel(317, 0), c);
        assert_eq!(fb.pixel(318, 5), c);
        assert_eq!(fb.pixel(319, 10), c);
    }

    #[test]
    fn waveform_samples_clamp_to_font_height() {
        let mut fb = Framebuffer::new();
        let c = Color::new(0, 255, 0);
        let max = fb.font_mode().spec().waveform_max_height as i32;
        fb.apply(&Command::Wave {
            color: c,
            samples: vec![255],
        });
        assert_eq!(fb.pixel(319, max), c);
    }

    #[test]
    fn new_waveform_clears_previous_footprint() {
        let mut fb = Framebuffer::new();
        let c1 = Color::new(200, 0, 0);
        let c2 = Color::new(0, 0, 200);
        fb.apply(&Command::Wave {
            color: c1,
            samples: vec![3; 100],
        });
        // Second wave is narrower and at a different height.
        fb.apply(&Command::Wave {
            color: c2,
            samples: vec![7; 10],
        });
        for x in 0..SCREEN_WIDTH as i32 {
            for y in 0..SCREEN_HEIGHT as i32 {
                assert_ne!(fb.pixel(x, y), c1, "stale waveform pixel at ({x},{y})");
            }
        }
        assert_eq!(fb.pixel(319, 7), c2);
    }

    #[test]
    fn waveform_wipe_uses_current_background() {
        let mut fb = Framebuffer::new();
        let bg = Color::new(16, 16, 16);
        fb.apply(&rect(0, 0, 320, 240, bg));
        fb.apply(&Command::Wave {
            color: Color::WHITE,
            samples: vec![4; 20],
        });
        fb.apply(&Command::Wave {
            color: Color::WHITE,
            samples: vec![],
        });
        // The wiped band is background, not black.
        assert_eq!(fb.pixel(319, 4), bg);
    }

    #[test]
    fn bmp_layout_is_exact() {
        let mut fb = Framebuffer::new();
        let c = Color::new(0x11, 0x22, 0x33);
        fb.fill_rect(0, 0, 1, 1, c); // top-left pixel
        let bmp = fb.to_bmp();

        let row_stride = (SCREEN_WIDTH * 3).div_ceil(4) * 4;
        assert_eq!(bmp.len(), 54 + row_stride * SCREEN_HEIGHT);
        assert_eq!(&bmp[0..2], b"BM");
        assert_eq!(
            u32::from_le_bytes(bmp[2..6].try_into().unwrap()) as usize,
            bmp.len()
        );
        assert_eq!(u32::from_le_bytes(bmp[10..14].try_into().unwrap()), 54);
        assert_eq!(
            i32::from_le_bytes(bmp[18..22].try_into().unwrap()),
            SCREEN_WIDTH as i32
        );
        assert_eq!(
            i32::from_le_bytes(bmp[22..26].try_into().unwrap()),
            SCREEN_HEIGHT as i32
        );
        assert_eq!(u16::from_le_bytes(bmp[28..30].try_into().unwrap()), 24);

        // Bottom-up: the top-left pixel is the first pixel of the LAST row,
        // stored BGR.
        let last_row = 54 + (SCREEN_HEIGHT - 1) * row_stride;
        assert_eq!(&bmp[last_row..last_row + 3], &[0x33, 0x22, 0x11]);
    }
}
