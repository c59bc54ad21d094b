//! Codec abstraction and the zstd reference codec.
//!
//! The pipeline is codec-agnostic: the encoder controller drives any
//! [`VideoCodec`], the recovery stage any [`VideoDecoder`]. The
//! implementations here ([`ZstdCodec`] / [`ZstdDecoder`]) trade
//! compression efficiency for simplicity and determinism. Keyframes
//! carry the full bitmap; delta frames carry only the hinted regions.
//! The lossy knob is per-region bit-depth quantization applied before
//! entropy coding, so higher-importance regions keep more low bits.

use crate::error::BeamError;
use crate::types::{Frame, PixelFormat};

// ── Configuration and hint types ─────────────────────────────────

/// Parameters a codec is (re)configured with at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecConfig {
    /// Target output bitrate in bits per second.
    pub target_bitrate_bps: u64,
    /// Keyframe interval in frames.
    pub gop_size: u32,
    /// Nominal capture rate, used to budget per-frame output.
    pub fps: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            target_bitrate_bps: 3_000_000,
            gop_size: 30,
            fps: 30,
        }
    }
}

/// A rectangular fidelity hint for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityHint {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Fidelity in `[0, 1]`; `1.0` preserves the region losslessly.
    pub quality: f32,
}

/// Per-frame fidelity plan: hinted regions plus a floor for the rest.
#[derive(Debug, Clone)]
pub struct QualityMap {
    pub regions: Vec<QualityHint>,
    /// Fidelity applied outside all hinted regions.
    pub base_quality: f32,
}

impl QualityMap {
    /// A map that encodes the whole frame at uniform quality.
    pub fn uniform(quality: f32) -> Self {
        Self {
            regions: Vec::new(),
            base_quality: quality,
        }
    }
}

/// Compressed output for one input frame.
#[derive(Debug, Clone)]
pub struct CodecFrame {
    /// True when the payload is independently decodable.
    pub keyframe: bool,
    pub payload: Vec<u8>,
}

// ── Traits ───────────────────────────────────────────────────────

/// Encoding half of a codec.
///
/// Implementations own their GOP state: they decide when a keyframe is
/// emitted, subject to [`VideoCodec::force_keyframe`] requests.
pub trait VideoCodec: Send {
    /// Apply new encoding parameters. Takes effect on the next frame.
    fn configure(&mut self, config: CodecConfig) -> Result<(), BeamError>;

    /// Emit a keyframe for the next encoded frame regardless of GOP
    /// position.
    fn force_keyframe(&mut self);

    /// Compress one frame under the given fidelity plan.
    fn encode(&mut self, frame: &Frame, quality: &QualityMap) -> Result<CodecFrame, BeamError>;
}

/// Decoding half of a codec. Stateful: delta payloads patch the last
/// reconstructed bitmap.
pub trait VideoDecoder: Send {
    /// Apply one payload, returning the full reconstructed bitmap.
    fn decode(
        &mut self,
        frame_id: u64,
        width: u32,
        height: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, BeamError>;
}

// ── Payload layout ───────────────────────────────────────────────
//
// After zstd decompression:
//   [0]      kind, 0 = keyframe, 1 = delta
//   key:     width * height * bpp raw pixel bytes
//   delta:   u32 LE region count, then per region
//            x, y, w, h as u32 LE followed by w * h * bpp pixel bytes

const KIND_KEY: u8 = 0;
const KIND_DELTA: u8 = 1;

// ── ZstdCodec ────────────────────────────────────────────────────

/// Reference encoder: region-quantized bitmaps compressed with zstd.
pub struct ZstdCodec {
    format: PixelFormat,
    config: CodecConfig,
    frames_since_key: u32,
    pending_keyframe: bool,
}

impl ZstdCodec {
    pub fn new(format: PixelFormat, config: CodecConfig) -> Self {
        Self {
            format,
            config,
            frames_since_key: 0,
            // First frame is always a keyframe.
            pending_keyframe: true,
        }
    }

    /// zstd compression level derived from the bitrate budget. A
    /// tighter budget buys more CPU for compression.
    fn level(&self) -> i32 {
        match self.config.target_bitrate_bps {
            0..=1_000_000 => 19,
            1_000_001..=2_500_000 => 12,
            2_500_001..=5_000_000 => 7,
            _ => 3,
        }
    }

    fn quantize_region(
        frame: &Frame,
        out: &mut Vec<u8>,
        x0: usize,
        y0: usize,
        w: usize,
        h: usize,
        quality: f32,
    ) {
        let shift = quality_shift(quality);
        let bpp = frame.format.bytes_per_pixel();
        let row = frame.row_bytes();
        for y in y0..y0 + h {
            let start = y * row + x0 * bpp;
            let src = &frame.data[start..start + w * bpp];
            if shift == 0 {
                out.extend_from_slice(src);
            } else {
                out.extend(src.iter().map(|b| (b >> shift) << shift));
            }
        }
    }

    fn encode_key(&self, frame: &Frame, quality: &QualityMap) -> Vec<u8> {
        let w = frame.width as usize;
        let h = frame.height as usize;
        let mut raw = Vec::with_capacity(1 + frame.byte_len());
        raw.push(KIND_KEY);

        let base_shift = quality_shift(quality.base_quality);
        raw.extend(frame.data.iter().map(|b| (b >> base_shift) << base_shift));

        // Re-stamp hinted regions at their own fidelity over the base.
        let bpp = frame.format.bytes_per_pixel();
        for hint in &quality.regions {
            let shift = quality_shift(hint.quality);
            if shift >= base_shift {
                continue;
            }
            let (x0, y0, rw, rh) = clip(hint, w, h);
            for y in y0..y0 + rh {
                let start = 1 + (y * w + x0) * bpp;
                let src_start = y * frame.row_bytes() + x0 * bpp;
                for (dst, src) in raw[start..start + rw * bpp]
                    .iter_mut()
                    .zip(&frame.data[src_start..src_start + rw * bpp])
                {
                    *dst = (src >> shift) << shift;
                }
            }
        }
        raw
    }

    fn encode_delta(&self, frame: &Frame, quality: &QualityMap) -> Vec<u8> {
        let w = frame.width as usize;
        let h = frame.height as usize;
        let mut raw = Vec::new();
        raw.push(KIND_DELTA);
        raw.extend_from_slice(&(quality.regions.len() as u32).to_le_bytes());
        for hint in &quality.regions {
            let (x0, y0, rw, rh) = clip(hint, w, h);
            raw.extend_from_slice(&(x0 as u32).to_le_bytes());
            raw.extend_from_slice(&(y0 as u32).to_le_bytes());
            raw.extend_from_slice(&(rw as u32).to_le_bytes());
            raw.extend_from_slice(&(rh as u32).to_le_bytes());
            Self::quantize_region(frame, &mut raw, x0, y0, rw, rh, hint.quality);
        }
        raw
    }
}

impl VideoCodec for ZstdCodec {
    fn configure(&mut self, config: CodecConfig) -> Result<(), BeamError> {
        if config.target_bitrate_bps == 0 {
            return Err(BeamError::InvalidDirective("bitrate must be positive"));
        }
        if config.gop_size == 0 {
            return Err(BeamError::InvalidDirective("gop size must be positive"));
        }
        self.config = config;
        Ok(())
    }

    fn force_keyframe(&mut self) {
        self.pending_keyframe = true;
    }

    fn encode(&mut self, frame: &Frame, quality: &QualityMap) -> Result<CodecFrame, BeamError> {
        if frame.format != self.format {
            return Err(BeamError::CodecEncodeFailure {
                frame_id: frame.seq,
                reason: format!("unexpected pixel format {:?}", frame.format),
            });
        }
        if frame.data.len() != frame.byte_len() {
            return Err(BeamError::CodecEncodeFailure {
                frame_id: frame.seq,
                reason: format!(
                    "bitmap is {} bytes, dimensions imply {}",
                    frame.data.len(),
                    frame.byte_len()
                ),
            });
        }

        let keyframe = self.pending_keyframe || self.frames_since_key >= self.config.gop_size;
        let raw = if keyframe {
            self.encode_key(frame, quality)
        } else {
            self.encode_delta(frame, quality)
        };

        let payload =
            zstd::encode_all(&raw[..], self.level()).map_err(|e| BeamError::CodecEncodeFailure {
                frame_id: frame.seq,
                reason: e.to_string(),
            })?;

        if keyframe {
            self.pending_keyframe = false;
            self.frames_since_key = 1;
        } else {
            self.frames_since_key += 1;
        }
        Ok(CodecFrame { keyframe, payload })
    }
}

/// Clip a hint rectangle to the frame bounds.
fn clip(hint: &QualityHint, w: usize, h: usize) -> (usize, usize, usize, usize) {
    let x0 = (hint.x as usize).min(w);
    let y0 = (hint.y as usize).min(h);
    let rw = (hint.width as usize).min(w - x0);
    let rh = (hint.height as usize).min(h - y0);
    (x0, y0, rw, rh)
}

/// Low bits dropped per channel for a given fidelity. `1.0` keeps all
/// bits, `0.0` keeps only the top two.
fn quality_shift(quality: f32) -> u32 {
    ((1.0 - quality.clamp(0.0, 1.0)) * 6.0).round() as u32
}

// ── ZstdDecoder ──────────────────────────────────────────────────

/// Stateful decoder holding the last reconstructed bitmap.
pub struct ZstdDecoder {
    format: PixelFormat,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
    have_key: bool,
}

impl ZstdDecoder {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            width: 0,
            height: 0,
            buffer: Vec::new(),
            have_key: false,
        }
    }

    fn fail(frame_id: u64, reason: impl Into<String>) -> BeamError {
        BeamError::CodecDecodeFailure {
            frame_id,
            reason: reason.into(),
        }
    }
}

impl VideoDecoder for ZstdDecoder {
    fn decode(
        &mut self,
        frame_id: u64,
        width: u32,
        height: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, BeamError> {
        let raw = zstd::decode_all(payload).map_err(|e| Self::fail(frame_id, e.to_string()))?;
        let Some((&kind, body)) = raw.split_first() else {
            return Err(Self::fail(frame_id, "empty payload"));
        };
        let bpp = self.format.bytes_per_pixel();

        match kind {
            KIND_KEY => {
                let expected = width as usize * height as usize * bpp;
                if body.len() != expected {
                    return Err(Self::fail(
                        frame_id,
                        format!("keyframe is {} bytes, expected {expected}", body.len()),
                    ));
                }
                self.width = width;
                self.height = height;
                self.buffer = body.to_vec();
                self.have_key = true;
            }
            KIND_DELTA => {
                if !self.have_key {
                    return Err(Self::fail(frame_id, "delta before first keyframe"));
                }
                if width != self.width || height != self.height {
                    return Err(Self::fail(
                        frame_id,
                        "delta frame after resolution change, keyframe required",
                    ));
                }
                apply_delta(frame_id, body, &mut self.buffer, self.width, bpp)?;
            }
            other => return Err(Self::fail(frame_id, format!("unknown payload kind {other}"))),
        }
        Ok(self.buffer.clone())
    }
}

fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if cursor.len() < n {
        return None;
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Some(head)
}

fn take_u32(cursor: &mut &[u8]) -> Option<u32> {
    take(cursor, 4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn apply_delta(
    frame_id: u64,
    body: &[u8],
    buffer: &mut [u8],
    frame_width: u32,
    bpp: usize,
) -> Result<(), BeamError> {
    let fail = |reason: &str| BeamError::CodecDecodeFailure {
        frame_id,
        reason: reason.to_string(),
    };
    let row_bytes = frame_width as usize * bpp;
    if row_bytes == 0 {
        return Err(fail("zero-width frame"));
    }
    let frame_rows = buffer.len() / row_bytes;

    let mut cursor = body;
    let count = take_u32(&mut cursor).ok_or_else(|| fail("truncated delta payload"))?;
    for _ in 0..count {
        let x = take_u32(&mut cursor).ok_or_else(|| fail("truncated delta payload"))? as usize;
        let y = take_u32(&mut cursor).ok_or_else(|| fail("truncated delta payload"))? as usize;
        let w = take_u32(&mut cursor).ok_or_else(|| fail("truncated delta payload"))? as usize;
        let h = take_u32(&mut cursor).ok_or_else(|| fail("truncated delta payload"))? as usize;
        if w == 0 || h == 0 {
            continue;
        }

        // Bounds first: the header values are untrusted, so no size
        // arithmetic until the region is known to fit the frame.
        let fits = x
            .checked_add(w)
            .is_some_and(|right| right <= frame_width as usize)
            && y.checked_add(h).is_some_and(|bottom| bottom <= frame_rows);
        if !fits {
            return Err(fail("delta region out of bounds"));
        }

        // In-bounds regions cannot exceed the buffer, so this product
        // cannot overflow.
        let pixels =
            take(&mut cursor, w * h * bpp).ok_or_else(|| fail("truncated delta payload"))?;
        for (i, row) in pixels.chunks_exact(w * bpp).enumerate() {
            let start = (y + i) * row_bytes + x * bpp;
            buffer[start..start + w * bpp].copy_from_slice(row);
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
