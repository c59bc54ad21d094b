//! Region-of-interest selection.
//!
//! Divides each frame into fixed-size tiles and scores every tile by
//! two signals: proximity to the pointer (linear decay inside a
//! configurable radius) and pixel change magnitude versus the previous
//! frame. The top-scoring tiles become the [`RegionMap`] handed to the
//! encoder controller; everything uncovered falls back to the default
//! importance.
//!
//! Selection is fully deterministic: identical `(frame, previous,
//! pointer)` inputs always produce the identical map. Ties are broken
//! in row-major tile order, never randomly, so encoding stays
//! reproducible under test.

use std::cmp;

use crate::types::Frame;

// ── Region ───────────────────────────────────────────────────────

/// A rectangular area of the frame with an importance score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Importance in `[0, 1]`; higher means encode at higher fidelity.
    pub importance: f32,
}

// ── RegionMap ────────────────────────────────────────────────────

/// Prioritized, non-overlapping regions for one frame.
///
/// Produced once per frame by the selector and consumed exactly once
/// by the encoder controller. Area not covered by any region carries
/// `default_importance`.
#[derive(Debug, Clone)]
pub struct RegionMap {
    regions: Vec<Region>,
    default_importance: f32,
}

impl RegionMap {
    pub fn new(regions: Vec<Region>, default_importance: f32) -> Self {
        Self {
            regions,
            default_importance,
        }
    }

    /// Regions in descending importance order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Importance assigned to uncovered area.
    pub fn default_importance(&self) -> f32 {
        self.default_importance
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

// ── RoiConfig ────────────────────────────────────────────────────

/// Tuning knobs for [`RoiSelector`].
#[derive(Debug, Clone)]
pub struct RoiConfig {
    /// Tile edge length in pixels.
    pub tile_size: u32,
    /// Pointer influence radius in pixels; importance decays linearly
    /// to zero at this distance.
    pub pointer_radius: f32,
    /// Per-channel difference below which a pixel counts as unchanged.
    pub change_threshold: u8,
    /// Maximum number of regions emitted per frame.
    pub max_regions: usize,
    /// Importance floor below which a tile is not emitted at all.
    pub min_importance: f32,
    /// Importance assigned to uncovered area.
    pub default_importance: f32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            tile_size: 64,
            pointer_radius: 200.0,
            change_threshold: 20,
            max_regions: 16,
            min_importance: 0.05,
            default_importance: 0.1,
        }
    }
}

// ── RoiSelector ──────────────────────────────────────────────────

/// Stateful selector that remembers the previous frame for change
/// detection.
pub struct RoiSelector {
    config: RoiConfig,
    previous: Option<Frame>,
}

impl RoiSelector {
    pub fn new(config: RoiConfig) -> Self {
        assert!(config.tile_size > 0, "tile_size must be > 0");
        Self {
            config,
            previous: None,
        }
    }

    /// Forget the previous frame; the next call scores every tile as
    /// fully changed.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Score the frame's tiles and return the prioritized map.
    pub fn select(&mut self, frame: &Frame, pointer: Option<(u32, u32)>) -> RegionMap {
        let ts = self.config.tile_size as usize;
        let w = frame.width as usize;
        let h = frame.height as usize;
        let tiles_x = w.div_ceil(ts);
        let tiles_y = h.div_ceil(ts);

        let mut scored: Vec<Region> = Vec::with_capacity(tiles_x * tiles_y);

        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let x0 = tx * ts;
                let y0 = ty * ts;
                let x1 = cmp::min(x0 + ts, w);
                let y1 = cmp::min(y0 + ts, h);

                let change = self.change_score(frame, x0, y0, x1, y1);
                let proximity = self.pointer_score(pointer, x0, y0, x1, y1);
                let importance = change.max(proximity).clamp(0.0, 1.0);

                if importance >= self.config.min_importance {
                    scored.push(Region {
                        x: x0 as u32,
                        y: y0 as u32,
                        width: (x1 - x0) as u32,
                        height: (y1 - y0) as u32,
                        importance,
                    });
                }
            }
        }

        // Stable sort keeps row-major order between equal scores, so
        // the top-N cut is deterministic.
        scored.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(cmp::Ordering::Equal)
        });
        scored.truncate(self.config.max_regions);

        self.previous = Some(frame.clone());
        RegionMap::new(scored, self.config.default_importance)
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Fraction of tile pixels whose any-channel difference exceeds
    /// the change threshold, in `[0, 1]`. Without a previous frame of
    /// matching dimensions every tile counts as fully changed.
    fn change_score(&self, frame: &Frame, x0: usize, y0: usize, x1: usize, y1: usize) -> f32 {
        let prev = match &self.previous {
            Some(p) if p.width == frame.width && p.height == frame.height => p,
            _ => return 1.0,
        };

        let bpp = frame.format.bytes_per_pixel();
        let row = frame.row_bytes();
        let threshold = self.config.change_threshold;
        let mut changed = 0usize;

        for y in y0..y1 {
            let base = y * row;
            for x in x0..x1 {
                let off = base + x * bpp;
                let differs = frame.data[off..off + bpp]
                    .iter()
                    .zip(&prev.data[off..off + bpp])
                    .any(|(a, b)| a.abs_diff(*b) > threshold);
                if differs {
                    changed += 1;
                }
            }
        }

        let total = (x1 - x0) * (y1 - y0);
        if total == 0 {
            0.0
        } else {
            changed as f32 / total as f32
        }
    }

    /// Linear pointer-proximity decay, measured from the tile centre.
    fn pointer_score(
        &self,
        pointer: Option<(u32, u32)>,
        x0: usize,
        y0: usize,
        x1: usize,
        y1: usize,
    ) -> f32 {
        let Some((px, py)) = pointer else {
            return 0.0;
        };
        let cx = (x0 + x1) as f32 / 2.0;
        let cy = (y0 + y1) as f32 / 2.0;
        let dx = cx - px as f32;
        let dy = cy - py as f32;
        let distance = (dx * dx + dy * dy).sqrt();
        if distance >= self.config.pointer_radius {
            0.0
        } else {
            1.0 - distance / self.config.pointer_radius
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
