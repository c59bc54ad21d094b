//! Synthetic frame source.
//!
//! Stands in for screen capture on platforms without one wired up and
//! for soak testing: a scrolling gradient with a moving block of
//! "activity" and a pointer orbiting the centre, so the ROI selector,
//! delta encoding and adaptation all see realistic input.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use beam_core::error::BeamError;
use beam_core::service::FrameSource;
use beam_core::types::{Frame, PixelFormat};

/// Generates a deterministic animated test pattern at a fixed rate.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    fps: u32,
    seq: u64,
    started: Instant,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            seq: 0,
            started: Instant::now(),
        }
    }

    fn render(&self) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let t = self.seq as usize;
        let mut data = vec![0u8; w * h * 4];

        // Diagonal gradient scrolling one pixel per frame.
        for y in 0..h {
            let row = &mut data[y * w * 4..(y + 1) * w * 4];
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let v = ((x + y + t) % 256) as u8;
                px[0] = v;
                px[1] = v.wrapping_add(85);
                px[2] = v.wrapping_add(170);
                px[3] = 0xFF;
            }
        }

        // A bright block sweeping left to right, one tile of real
        // change per frame for the ROI selector to find.
        let block = 64.min(w).min(h);
        let bx = (t * 4) % (w.saturating_sub(block) + 1);
        let by = h / 2 - block / 2;
        for y in by..by + block {
            let start = (y * w + bx) * 4;
            for px in data[start..start + block * 4].chunks_exact_mut(4) {
                px[0] = 0xFF;
                px[1] = 0xFF;
                px[2] = 0xFF;
            }
        }
        data
    }
}

#[async_trait]
impl FrameSource for TestPatternSource {
    async fn next_frame(&mut self) -> Result<Frame, BeamError> {
        let interval = Duration::from_secs(1) / self.fps;
        let due = self.started + interval * self.seq as u32;
        tokio::time::sleep_until(due.into()).await;

        self.seq += 1;
        let now = Instant::now();
        Ok(Frame {
            seq: self.seq,
            width: self.width,
            height: self.height,
            format: PixelFormat::Bgra8,
            data: self.render(),
            captured_at: now,
            // Two frame intervals of presentation budget.
            deadline: now + interval * 2,
        })
    }

    fn pointer(&self) -> Option<(u32, u32)> {
        // Orbit around the frame centre, one revolution per ~6 s.
        let angle = self.seq as f64 * std::f64::consts::TAU / (self.fps as f64 * 6.0);
        let r = (self.width.min(self.height) / 4) as f64;
        let cx = self.width as f64 / 2.0 + r * angle.cos();
        let cy = self.height as f64 / 2.0 + r * angle.sin();
        Some((cx as u32, cy as u32))
    }
}

// ── Tests ────────────────────────────────────────────────────────
