//! # Glyph Atlas
//!
//! A 1-bit 5x7 ASCII atlas plus the per-font-mode metrics the framebuffer
//! needs for stamping and for sizing the waveform band. The device reports
//! its active font mode in the System command; modes share the atlas and
//! differ only in metrics.
//!
//! Atlas layout: column-major, five bytes per glyph, bit 0 of each byte is
//! the top row. Codes run `0x20..=0x7F`; anything below the base never
//! stamps, anything above maps to space before lookup.

/// First code present in the atlas.
pub const GLYPH_BASE: u8 = 0x20;
/// Last printable code; everything past it renders as space.
pub const GLYPH_LAST: u8 = 0x7E;
/// Atlas glyph width in pixels.
pub const GLYPH_WIDTH: usize = 5;
/// Atlas glyph height in pixels.
pub const GLYPH_HEIGHT: usize = 7;

/// The five font modes the device firmware can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FontMode {
    #[default]
    SmallV1 = 0,
    LargeV1 = 1,
    Huge = 2,
    SmallV2 = 3,
    LargeV2 = 4,
}

impl FontMode {
    /// Maps the raw System-command byte; out-of-range values keep the
    /// current default rather than wedging rendering.
    pub fn from_wire(raw: u8) -> FontMode {
        match raw {
            0 => FontMode::SmallV1,
            1 => FontMode::LargeV1,
            2 => FontMode::Huge,
            3 => FontMode::SmallV2,
            4 => FontMode::LargeV2,
            _ => FontMode::default(),
        }
    }

    /// Metrics for this mode.
    pub const fn spec(self) -> FontSpec {
        match self {
            FontMode::SmallV1 => FontSpec {
                glyph_width: GLYPH_WIDTH,
                glyph_height: GLYPH_HEIGHT,
                stride: 8,
                text_offset_y: 3,
                baseline_shift: 0,
                waveform_max_height: 24,
            },
            FontMode::LargeV1 => FontSpec {
                glyph_width: GLYPH_WIDTH,
                glyph_height: GLYPH_HEIGHT,
                stride: 8,
                text_offset_y: 2,
                baseline_shift: 1,
                waveform_max_height: 24,
            },
            FontMode::Huge => FontSpec {
                glyph_width: GLYPH_WIDTH,
                glyph_height: GLYPH_HEIGHT,
                stride: 8,
                text_offset_y: 1,
                baseline_shift: 2,
                waveform_max_height: 38,
            },
            FontMode::SmallV2 => FontSpec {
                glyph_width: GLYPH_WIDTH,
                glyph_height: GLYPH_HEIGHT,
                stride: 8,
                text_offset_y: 3,
                baseline_shift: 0,
                waveform_max_height: 24,
            },
            FontMode::LargeV2 => FontSpec {
                glyph_width: GLYPH_WIDTH,
                glyph_height: GLYPH_HEIGHT,
                stride: 8,
                text_offset_y: 2,
                baseline_shift: 1,
                waveform_max_height: 38,
            },
        }
    }
}

/// Per-mode rendering metrics.
#[derive(Debug, Clone, Copy)]
pub struct FontSpec {
    /// Lit-pixel width of a glyph.
    pub glyph_width: usize,
    /// Lit-pixel height of a glyph.
    pub glyph_height: usize,
    /// Horizontal advance; also the width of the background box stamped
    /// behind each glyph.
    pub stride: usize,
    /// Vertical offset applied to the command's y before stamping.
    pub text_offset_y: i32,
    /// Additional downward shift of the glyph rows inside the cell box.
    pub baseline_shift: i32,
    /// Clamp applied to waveform sample values for this mode.
    pub waveform_max_height: usize,
}

/// Returns the five column bytes for `code`, or `None` for codes below the
/// atlas base (those do not stamp at all). Codes above the printable range
/// fold to space.
pub fn glyph(code: u8) -> Option<&'static [u8; GLYPH_WIDTH]> {
    if code < GLYPH_BASE {
        return None;
    }
    let printable = if code > GLYPH_LAST { GLYPH_BASE } else { code };
    Some(&ATLAS[(printable - GLYPH_BASE) as usize])
}

/// 5x7 column-major atlas for `0x20..=0x7F`.
#[rustfmt::skip]
static ATLAS: [[u8; GLYPH_WIDTH]; 96] = [
    [0x00, 0x00, 0x00, 0x00, 0x00], // 0x20 ' '
    [0x00, 0x00, 0x5F, 0x00, 0x00], // 0x21 '!'
    [0x00, 0x07, 0x00, 0x07, 0x00], // 0x22 '"'
    [0x14, 0x7F, 0x14, 0x7F, 0x14], // 0x23 '#'
    [0x24, 0x2A, 0x7F, 0x2A, 0x12], // 0x24 '$'
    [0x23, 0x13, 0x08, 0x64, 0x62], // 0x25 '%'
    [0x36, 0x49, 0x55, 0x22, 0x50], // 0x26 '&'
    [0x00, 0x05, 0x03, 0x00, 0x00], // 0x27 '\''
    [0x00, 0x1C, 0x22, 0x41, 0x00], // 0x28 '('
    [0x00, 0x41, 0x22, 0x1C, 0x00], // 0x29 ')'
    [0x14, 0x08, 0x3E, 0x08, 0x14], // 0x2A '*'
    [0x08, 0x08, 0x3E, 0x08, 0x08], // 0x2B '+'
    [0x00, 0x50, 0x30, 0x00, 0x00], // 0x2C ','
    [0x08, 0x08, 0x08, 0x08, 0x08], // 0x2D '-'
    [0x00, 0x60, 0x60, 0x00, 0x00], // 0x2E '.'
    [0x20, 0x10, 0x08, 0x04, 0x02], // 0x2F '/'
    [0x3E, 0x51, 0x49, 0x45, 0x3E], // 0x30 '0'
    [0x00, 0x42, 0x7F, 0x40, 0x00], // 0x31 '1'
    [0x42, 0x61, 0x51, 0x49, 0x46], // 0x32 '2'
    [0x21, 0x41, 0x45, 0x4B, 0x31], // 0x33 '3'
    [0x18, 0x14, 0x12, 0x7F, 0x10], // 0x34 '4'
    [0x27, 0x45, 0x45, 0x45, 0x39], // 0x35 '5'
    [0x3C, 0x4A, 0x49, 0x49, 0x30], // 0x36 '6'
    [0x01, 0x71, 0x09, 0x05, 0x03], // 0x37 '7'
    [0x36, 0x49, 0x49, 0x49, 0x36], // 0x38 '8'
    [0x06, 0x49, 0x49, 0x29, 0x1E], // 0x39 '9'
    [0x00, 0x36, 0x36, 0x00, 0x00], // 0x3A ':'
    [0x00, 0x56, 0x36, 0x00, 0x00], // 0x3B ';'
    [0x00, 0x08, 0x14, 0x22, 0x41], // 0x3C '<'
    [0x14, 0x14, 0x14, 0x14, 0x14], // 0x3D '='
    [0x41, 0x22, 0x14, 0x08, 0x00], // 0x3E '>'
    [0x02, 0x01, 0x51, 0x09, 0x06], // 0x3F '?'
    [0x32, 0x49, 0x79, 0x41, 0x3E], // 0x40 '@'
    [0x7E, 0x11, 0x11, 0x11, 0x7E], // 0x41 'A'
    [0x7F, 0x49, 0x49, 0x49, 0x36], // 0x42 'B'
    [0x3E, 0x41, 0x41, 0x41, 0x22], // 0x43 'C'
    [0x7F, 0x41, 0x41, 0x22, 0x1C], // 0x44 'D'
    [0x7F, 0x49, 0x49, 0x49, 0x41], // 0x45 'E'
    [0x7F, 0x09, 0x09, 0x01, 0x01], // 0x46 'F'
    [0x3E, 0x41, 0x41, 0x51, 0x32], // 0x47 'G'
    [0x7F, 0x08, 0x08, 0x08, 0x7F], // 0x48 'H'
    [0x00, 0x41, 0x7F, 0x41, 0x00], // 0x49 'I'
    [0x20, 0x40, 0x41, 0x3F, 0x01], // 0x4A 'J'
    [0x7F, 0x08, 0x14, 0x22, 0x41], // 0x4B 'K'
    [0x7F, 0x40, 0x40, 0x40, 0x40], // 0x4C 'L'
    [0x7F, 0x02, 0x0C, 0x02, 0x7F], // 0x4D 'M'
    [0x7F, 0x04, 0x08, 0x10, 0x7F], // 0x4E 'N'
    [0x3E, 0x41, 0x41, 0x41, 0x3E], // 0x4F 'O'
    [0x7F, 0x09, 0x09, 0x09, 0x06], // 0x50 'P'
    [0x3E, 0x41, 0x51, 0x21, 0x5E], // 0x51 'Q'
    [0x7F, 0x09, 0x19, 0x29, 0x46], // 0x52 'R'
    [0x46, 0x49, 0x49, 0x49, 0x31], // 0x53 'S'
    [0x01, 0x01, 0x7F, 0x01, 0x01], // 0x54 'T'
    [0x3F, 0x40, 0x40, 0x40, 0x3F], // 0x55 'U'
    [0x1F, 0x20, 0x40, 0x20, 0x1F], // 0x56 'V'
    [0x7F, 0x20, 0x18, 0x20, 0x7F], // 0x57 'W'
    [0x63, 0x14, 0x08, 0x14, 0x63], // 0x58 'X'
    [0x03, 0x04, 0x78, 0x04, 0x03], // 0x59 'Y'
    [0x61, 0x51, 0x49, 0x45, 0x43], // 0x5A 'Z'
    [0x00, 0x00, 0x7F, 0x41, 0x41], // 0x5B '['
    [0x02, 0x04, 0x08, 0x10, 0x20], // 0x5C '\\'
    [0x41, 0x41, 0x7F, 0x00, 0x00], // 0x5D ']'
    [0x04, 0x02, 0x01, 0x02, 0x04], // 0x5E '^'
    [0x40, 0x40, 0x40, 0x40, 0x40], // 0x5F '_'
    [0x00, 0x01, 0x02, 0x04, 0x00], // 0x60 '`'
    [0x20, 0x54, 0x54, 0x54, 0x78], // 0x61 'a'
    [0x7F, 0x48, 0x44, 0x44, 0x38], // 0x62 'b'
    [0x38, 0x44, 0x44, 0x44, 0x20], // 0x63 'c'
    [0x38, 0x44, 0x44, 0x48, 0x7F], // 0x64 'd'
    [0x38, 0x54, 0x54, 0x54, 0x18], // 0x65 'e'
    [0x08, 0x7E, 0x09, 0x01, 0x02], // 0x66 'f'
    [0x08, 0x14, 0x54, 0x54, 0x3C], // 0x67 'g'
    [0x7F, 0x08, 0x04, 0x04, 0x78], // 0x68 'h'
    [0x00, 0x44, 0x7D, 0x40, 0x00], // 0x69 'i'
    [0x20, 0x40, 0x44, 0x3D, 0x00], // 0x6A 'j'
    [0x00, 0x7F, 0x10, 0x28, 0x44], // 0x6B 'k'
    [0x00, 0x41, 0x7F, 0x40, 0x00], // 0x6C 'l'
    [0x7C, 0x04, 0x18, 0x04, 0x78], // 0x6D 'm'
    [0x7C, 0x08, 0x04, 0x04, 0x78], // 0x6E 'n'
    [0x38, 0x44, 0x44, 0x44, 0x38], // 0x6F 'o'
    [0x7C, 0x14, 0x14, 0x14, 0x08], // 0x70 'p'
    [0x08, 0x14, 0x14, 0x18, 0x7C], // 0x71 'q'
    [0x7C, 0x08, 0x04, 0x04, 0x08], // 0x72 'r'
    [0x48, 0x54, 0x54, 0x54, 0x20], // 0x73 's'
    [0x04, 0x3F, 0x44, 0x40, 0x20], // 0x74 't'
    [0x3C, 0x40, 0x40, 0x20, 0x7C], // 0x75 'u'
    [0x1C, 0x20, 0x40, 0x20, 0x1C], // 0x76 'v'
    [0x3C, 0x40, 0x30, 0x40, 0x3C], // 0x77 'w'
    [0x44, 0x28, 0x10, 0x28, 0x44], // 0x78 'x'
    [0x0C, 0x50, 0x50, 0x50, 0x3C], // 0x79 'y'
    [0x44, 0x64, 0x54, 0x4C, 0x44], // 0x7A 'z'
    [0x00, 0x08, 0x36, 0x41, 0x00], // 0x7B '{'
    [0x00, 0x00, 0x7F, 0x00, 0x00], // 0x7C '|'
    [0x00, 0x41, 0x36, 0x08, 0x00], // 0x7D '}'
    [0x08, 0x04, 0x08, 0x10, 0x08], // 0x7E '~'
    [0x00, 0x00, 0x00, 0x00, 0x00], // 0x7F DEL
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_below_base_do_not_stamp() {
        assert!(glyph(0x00).is_none());
        assert!(glyph(0x1F).is_none());
    }

    #[test]
    fn nonprintable_high_codes_fold_to_space() {
        assert_eq!(glyph(0xFF), glyph(b' '));
        assert_eq!(glyph(0x80), glyph(b' '));
    }

    #[test]
    fn space_is_blank() {
        assert_eq!(glyph(b' '), Some(&[0u8; GLYPH_WIDTH]));
    }

    #[test]
    fn every_mode_has_sane_metrics() {
        for raw in 0u8..=4 {
            let spec = FontMode::from_wire(raw).spec();
            assert!(spec.glyph_width <= spec.stride);
            assert!(spec.glyph_height <= 10);
            assert!(spec.waveform_max_height >= 1);
        }
        // Out-of-range wire values fall back instead of panicking.
        assert_eq!(FontMode::from_wire(9), FontMode::SmallV1);
    }
}
