//! Shared frame types used between pipeline stages.
//!
//! These are **internal** representations handed from the capture
//! collaborator to the encoder and from the recovery stage to the
//! renderer. The serialisable wire types live in [`crate::transport`].

use std::time::Instant;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// A raw, uncompressed video frame.
///
/// The `data` buffer holds tightly packed rows of
/// `width * bytes_per_pixel` bytes each; the capture collaborator is
/// responsible for stripping any GPU row padding before hand-off.
///
/// Ownership follows the pipeline: the capture side owns a frame until
/// it is handed to the encoder controller, which owns it for the
/// duration of encoding.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic capture sequence number.
    pub seq: u64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, `width * bpp * height` bytes.
    pub data: Vec<u8>,
    /// Monotonic capture timestamp.
    pub captured_at: Instant,
    /// Latest time this frame may still be presented in order.
    pub deadline: Instant,
}

impl Frame {
    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel() * self.height as usize
    }

    /// Row pitch in bytes.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Returns the row slice for row `y`.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.row_bytes();
        &self.data[start..start + self.row_bytes()]
    }

    /// Returns the pixel bytes at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.row_bytes() + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }
}
