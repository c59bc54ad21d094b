//! Predictive adaptation of encoding parameters.
//!
//! The adapter reads the estimator's recent [`NetworkState`] history
//! and emits one [`EncodingDirective`] per tick, ahead of the next
//! measured degradation. Bandwidth and loss are extrapolated linearly
//! over the last few samples, with the prediction capped at the most
//! optimistic recent measurement so the adapter never overshoots into
//! congestion. A relative hysteresis threshold keeps the bitrate from
//! oscillating on small prediction jitter.

use std::time::Duration;

use crate::estimator::{NetworkHistory, NetworkState};

// ── EncodingDirective ────────────────────────────────────────────

/// Target encoding parameters for the upcoming adaptation interval.
///
/// Computed once per tick; immutable once issued; superseded by the
/// next tick's directive.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingDirective {
    /// Target bitrate in bits per second.
    pub target_bitrate_bps: u64,
    /// Frames between forced keyframes.
    pub gop_size: u32,
    /// Extra parity fraction applied by the transport, `[0, 1]`.
    pub fec_redundancy_ratio: f64,
    /// Emit a keyframe on the next encoded frame.
    pub force_keyframe: bool,
}

// ── AdapterConfig ────────────────────────────────────────────────

/// Tuning knobs for [`PredictiveAdapter`].
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Lower bitrate bound in bits per second.
    pub min_bitrate_bps: u64,
    /// Upper bitrate bound in bits per second.
    pub max_bitrate_bps: u64,
    /// Bitrate before the first measurement arrives.
    pub start_bitrate_bps: u64,
    /// Fraction of predicted available bandwidth actually targeted.
    pub headroom: f64,
    /// Relative change below which the bitrate is left untouched.
    pub hysteresis: f64,
    /// Parity ratio band.
    pub min_redundancy: f64,
    pub max_redundancy: f64,
    /// Redundancy per unit of predicted loss (before clamping).
    pub loss_to_redundancy: f64,
    /// GOP size on a healthy link.
    pub base_gop: u32,
    /// GOP floor under heavy degradation.
    pub min_gop: u32,
    /// How far ahead the trend is extrapolated.
    pub horizon: Duration,
    /// Number of recent samples the trend is fitted over.
    pub trend_samples: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            min_bitrate_bps: 500_000,
            max_bitrate_bps: 10_000_000,
            start_bitrate_bps: 3_000_000,
            headroom: 0.8,
            hysteresis: 0.10,
            min_redundancy: 0.05,
            max_redundancy: 0.40,
            loss_to_redundancy: 2.0,
            base_gop: 30,
            min_gop: 10,
            horizon: Duration::from_millis(500),
            trend_samples: 5,
        }
    }
}

// ── PredictiveAdapter ────────────────────────────────────────────

/// Turns the network history into per-tick encoding directives.
pub struct PredictiveAdapter {
    config: AdapterConfig,
    current: EncodingDirective,
    /// Loss rate seen on the previous tick, for the monotonicity rule:
    /// bitrate never increases while loss is rising.
    last_loss: f64,
    keyframe_pending: bool,
}

impl PredictiveAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        let current = EncodingDirective {
            target_bitrate_bps: config.start_bitrate_bps,
            gop_size: config.base_gop,
            fec_redundancy_ratio: config.min_redundancy,
            force_keyframe: false,
        };
        Self {
            config,
            current,
            last_loss: 0.0,
            keyframe_pending: false,
        }
    }

    /// Request a keyframe on the next directive (e.g. after prolonged
    /// irrecoverable loss on the receiver). Consumed exactly once.
    pub fn request_keyframe(&mut self) {
        self.keyframe_pending = true;
    }

    /// The directive currently in effect.
    pub fn current(&self) -> &EncodingDirective {
        &self.current
    }

    /// Compute the directive for the next interval.
    pub fn on_tick(&mut self, history: &NetworkHistory) -> EncodingDirective {
        let directive = match history.latest() {
            None => self.conservative(),
            Some(latest) if latest.stale => self.conservative(),
            Some(latest) => self.adapt(history, latest),
        };

        let force = std::mem::take(&mut self.keyframe_pending);
        self.current = EncodingDirective {
            force_keyframe: false,
            ..directive.clone()
        };
        EncodingDirective {
            force_keyframe: force,
            ..directive
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Fallback when telemetry is missing or stale: lowest bitrate,
    /// highest redundancy, short GOP.
    fn conservative(&mut self) -> EncodingDirective {
        EncodingDirective {
            target_bitrate_bps: self.config.min_bitrate_bps,
            gop_size: self.config.min_gop,
            fec_redundancy_ratio: self.config.max_redundancy,
            force_keyframe: false,
        }
    }

    fn adapt(&mut self, history: &NetworkHistory, latest: &NetworkState) -> EncodingDirective {
        let (predicted_bw, predicted_loss) = self.predict(history, latest);

        // Loss-discounted available bandwidth with headroom.
        let available = predicted_bw * (1.0 - predicted_loss);
        let mut candidate = available * self.config.headroom;

        // Bound the per-tick step to [0.5x, 1.5x] of the current rate.
        let cur = self.current.target_bitrate_bps as f64;
        candidate = candidate.clamp(cur * 0.5, cur * 1.5);
        candidate = candidate.clamp(
            self.config.min_bitrate_bps as f64,
            self.config.max_bitrate_bps as f64,
        );

        // Never raise the bitrate while loss is rising.
        if predicted_loss > self.last_loss + 1e-9 {
            candidate = candidate.min(cur);
        }

        // Hysteresis: hold the current bitrate on small deltas.
        let bitrate = if cur > 0.0 && ((candidate - cur).abs() / cur) <= self.config.hysteresis {
            self.current.target_bitrate_bps
        } else {
            candidate as u64
        };

        let redundancy = (self.config.min_redundancy
            + predicted_loss * self.config.loss_to_redundancy)
            .clamp(self.config.min_redundancy, self.config.max_redundancy);

        self.last_loss = predicted_loss;

        EncodingDirective {
            target_bitrate_bps: bitrate,
            gop_size: self.gop_for(predicted_loss, latest.rtt_ms),
            fec_redundancy_ratio: redundancy,
            force_keyframe: false,
        }
    }

    /// Two-point linear extrapolation over the trend window, biased
    /// conservatively: the bandwidth prediction never exceeds the most
    /// optimistic recent measurement.
    fn predict(&self, history: &NetworkHistory, latest: &NetworkState) -> (f64, f64) {
        let recent: Vec<&NetworkState> = history
            .iter()
            .rev()
            .take(self.config.trend_samples)
            .collect();

        if recent.len() < 2 {
            return (latest.bandwidth_bps as f64, latest.loss_rate);
        }

        let newest = recent[0];
        let oldest = recent[recent.len() - 1];
        let span = newest
            .timestamp
            .saturating_duration_since(oldest.timestamp)
            .as_secs_f64();
        if span <= 0.0 {
            return (latest.bandwidth_bps as f64, latest.loss_rate);
        }

        let ahead = self.config.horizon.as_secs_f64();
        let bw_slope = (newest.bandwidth_bps as f64 - oldest.bandwidth_bps as f64) / span;
        let loss_slope = (newest.loss_rate - oldest.loss_rate) / span;

        let best_recent = recent
            .iter()
            .map(|s| s.bandwidth_bps)
            .max()
            .unwrap_or(latest.bandwidth_bps) as f64;

        let bw = (newest.bandwidth_bps as f64 + bw_slope * ahead)
            .max(0.0)
            .min(best_recent);
        let loss = (newest.loss_rate + loss_slope * ahead).clamp(0.0, 1.0);
        (bw, loss)
    }

    fn gop_for(&self, loss: f64, rtt_ms: f64) -> u32 {
        let base = self.config.base_gop;
        let gop = if loss < 0.02 && rtt_ms < 100.0 {
            base
        } else if loss < 0.05 && rtt_ms < 200.0 {
            base * 2 / 3
        } else if loss < 0.10 && rtt_ms < 300.0 {
            base / 2
        } else {
            base / 3
        };
        gop.max(self.config.min_gop)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sample(at: Instant, bw: u64, loss: f64) -> NetworkState {
        NetworkState {
            bandwidth_bps: bw,
            rtt_ms: 30.0,
            jitter_ms: 2.0,
            loss_rate: loss,
            timestamp: at,
            stale: false,
        }
    }

    fn history_of(samples: &[NetworkState]) -> NetworkHistory {
        let mut h = NetworkHistory::new(32);
        for s in samples {
            h.push(*s);
        }
        h
    }

    #[test]
    fn empty_history_yields_conservative_directive() {
        let mut adapter = PredictiveAdapter::new(AdapterConfig::default());
        let d = adapter.on_tick(&NetworkHistory::new(8));
        assert_eq!(d.target_bitrate_bps, 500_000);
        assert!((d.fec_redundancy_ratio - 0.40).abs() < 1e-9);
        assert_eq!(d.gop_size, 10);
    }

    #[test]
    fn clean_link_targets_headroom_scaled_bandwidth() {
        let mut adapter = PredictiveAdapter::new(AdapterConfig::default());
        let t0 = Instant::now();
        let h = history_of(&[
            sample(t0, 2_000_000, 0.0),
            sample(t0 + Duration::from_millis(200), 2_000_000, 0.0),
        ]);
        let d = adapter.on_tick(&h);
        // 2 Mbps * 0.8 = 1.6 Mbps, within the step clamp from 3 Mbps.
        assert_eq!(d.target_bitrate_bps, 1_600_000);
        assert!((d.fec_redundancy_ratio - 0.05).abs() < 1e-9);
    }

    #[test]
    fn rising_loss_raises_redundancy_and_never_raises_bitrate() {
        let mut adapter = PredictiveAdapter::new(AdapterConfig::default());
        let t0 = Instant::now();
        let clean = history_of(&[
            sample(t0, 2_000_000, 0.0),
            sample(t0 + Duration::from_millis(200), 2_000_000, 0.0),
        ]);
        let d1 = adapter.on_tick(&clean);

        let lossy = history_of(&[
            sample(t0, 2_000_000, 0.0),
            sample(t0 + Duration::from_millis(200), 2_000_000, 0.0),
            sample(t0 + Duration::from_millis(400), 2_000_000, 0.15),
        ]);
        let d2 = adapter.on_tick(&lossy);

        assert!(d2.fec_redundancy_ratio > d1.fec_redundancy_ratio);
        assert!(d2.target_bitrate_bps <= d1.target_bitrate_bps);
    }

    #[test]
    fn hysteresis_holds_bitrate_on_small_changes() {
        let mut adapter = PredictiveAdapter::new(AdapterConfig::default());
        let t0 = Instant::now();
        let h = history_of(&[
            sample(t0, 2_000_000, 0.0),
            sample(t0 + Duration::from_millis(200), 2_000_000, 0.0),
        ]);
        let d1 = adapter.on_tick(&h);

        // 5% bandwidth wiggle is inside the 10% hysteresis band.
        let h2 = history_of(&[
            sample(t0, 2_000_000, 0.0),
            sample(t0 + Duration::from_millis(200), 2_000_000, 0.0),
            sample(t0 + Duration::from_millis(400), 2_100_000, 0.0),
        ]);
        let d2 = adapter.on_tick(&h2);
        assert_eq!(d1.target_bitrate_bps, d2.target_bitrate_bps);
    }

    #[test]
    fn prediction_capped_at_best_recent_measurement() {
        let mut adapter = PredictiveAdapter::new(AdapterConfig::default());
        let t0 = Instant::now();
        // Steeply rising trend would extrapolate past any measurement.
        let h = history_of(&[
            sample(t0, 1_000_000, 0.0),
            sample(t0 + Duration::from_millis(200), 4_000_000, 0.0),
        ]);
        let d = adapter.on_tick(&h);
        // Capped at 4 Mbps * 0.8 = 3.2 Mbps (within 1.5x step of 3 Mbps).
        assert!(d.target_bitrate_bps <= 3_200_000);
    }

    #[test]
    fn keyframe_request_is_one_shot() {
        let mut adapter = PredictiveAdapter::new(AdapterConfig::default());
        let t0 = Instant::now();
        let h = history_of(&[
            sample(t0, 2_000_000, 0.0),
            sample(t0 + Duration::from_millis(200), 2_000_000, 0.0),
        ]);
        adapter.request_keyframe();
        let d1 = adapter.on_tick(&h);
        assert!(d1.force_keyframe);
        let d2 = adapter.on_tick(&h);
        assert!(!d2.force_keyframe);
    }

    #[test]
    fn stale_history_falls_back_to_conservative() {
        let mut adapter = PredictiveAdapter::new(AdapterConfig::default());
        let t0 = Instant::now();
        let mut stale = sample(t0, 5_000_000, 0.0);
        stale.stale = true;
        let h = history_of(&[stale]);
        let d = adapter.on_tick(&h);
        assert_eq!(d.target_bitrate_bps, 500_000);
        assert!((d.fec_redundancy_ratio - 0.40).abs() < 1e-9);
    }

    #[test]
    fn redundancy_stays_in_band() {
        let mut adapter = PredictiveAdapter::new(AdapterConfig::default());
        let t0 = Instant::now();
        let h = history_of(&[
            sample(t0, 2_000_000, 0.9),
            sample(t0 + Duration::from_millis(200), 2_000_000, 0.9),
        ]);
        let d = adapter.on_tick(&h);
        assert!((d.fec_redundancy_ratio - 0.40).abs() < 1e-9);
    }
}
