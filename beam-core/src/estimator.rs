//! Network state estimation from transport telemetry.
//!
//! The transport feeds per-packet acknowledgement and loss events into
//! the estimator; on a fixed tick (default 200 ms) the estimator folds
//! them into a smoothed [`NetworkState`] sample and appends it to a
//! bounded history. Bandwidth and RTT use an exponentially-weighted
//! moving average so single-sample noise is suppressed while the
//! estimate still tracks real changes within about a second. Loss rate
//! is computed over a sliding window of the most recent packet
//! outcomes, not a lifetime average, so recovery from a transient
//! burst is reflected promptly.
//!
//! If no events arrive within the staleness timeout the estimator
//! holds the last known state and flags it stale; the adapter then
//! falls back to its most conservative directive.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ── PacketEvent ──────────────────────────────────────────────────

/// A single transport-layer telemetry event.
#[derive(Debug, Clone, Copy)]
pub enum PacketEvent {
    /// A data packet was acknowledged by the receiver.
    Acked { bytes: usize, rtt: Duration },
    /// The receiver reported a packet as lost.
    Lost,
}

// ── NetworkState ─────────────────────────────────────────────────

/// A smoothed snapshot of link conditions.
#[derive(Debug, Clone, Copy)]
pub struct NetworkState {
    /// Estimated goodput in bits per second.
    pub bandwidth_bps: u64,
    /// Smoothed round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Smoothed RTT deviation in milliseconds.
    pub jitter_ms: f64,
    /// Fraction of packets lost over the recent window, `[0, 1]`.
    pub loss_rate: f64,
    /// When this sample was computed.
    pub timestamp: Instant,
    /// No fresh telemetry arrived within the staleness timeout.
    pub stale: bool,
}

// ── NetworkHistory ───────────────────────────────────────────────

/// Bounded, append-only series of recent [`NetworkState`] samples.
///
/// Only the estimator writes to it, and samples are `Copy`, so a
/// reader never observes a partially updated one.
#[derive(Debug, Clone, Default)]
pub struct NetworkHistory {
    samples: VecDeque<NetworkState>,
    cap: usize,
}

impl NetworkHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub(crate) fn push(&mut self, state: NetworkState) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(state);
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<&NetworkState> {
        self.samples.back()
    }

    /// Oldest retained sample.
    pub fn oldest(&self) -> Option<&NetworkState> {
        self.samples.front()
    }

    /// All retained samples, oldest first. Double-ended so callers
    /// can walk the most recent samples via `rev()`.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &NetworkState> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ── EstimatorConfig ──────────────────────────────────────────────

/// Tuning knobs for [`NetworkEstimator`].
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    /// Interval between state recomputations.
    pub tick: Duration,
    /// Number of recent packet outcomes used for the loss rate
    /// (sized to cover roughly one second of traffic).
    pub loss_window: usize,
    /// Consecutive losses that trigger an early recomputation.
    pub loss_burst: usize,
    /// Telemetry silence after which the state is flagged stale.
    pub stale_after: Duration,
    /// Hard cap on the bandwidth estimate in bits per second.
    pub max_bandwidth_bps: u64,
    /// Rolling window for the raw throughput measurement.
    pub bandwidth_window: Duration,
    /// Number of state samples retained in the history.
    pub history_len: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            loss_window: 256,
            loss_burst: 8,
            stale_after: Duration::from_secs(1),
            max_bandwidth_bps: 100_000_000,
            bandwidth_window: Duration::from_secs(1),
            history_len: 32,
        }
    }
}

// ── NetworkEstimator ─────────────────────────────────────────────

/// Folds raw packet events into smoothed [`NetworkState`] samples.
pub struct NetworkEstimator {
    config: EstimatorConfig,
    /// Raw throughput samples `(when, bytes)` over the rolling window.
    bytes_window: VecDeque<(Instant, u64)>,
    window_total: u64,
    /// Smoothed bandwidth in bits per second (EWMA over window rates).
    smoothed_bps: f64,
    /// Smoothed RTT in microseconds (EWMA, α = 1/8).
    smoothed_rtt_us: f64,
    /// Smoothed RTT deviation in microseconds (EWMA, α = 1/4).
    rtt_var_us: f64,
    /// Outcome of the last `loss_window` packets, `true` = lost.
    outcomes: VecDeque<bool>,
    consecutive_losses: usize,
    last_event_at: Option<Instant>,
    last_state: Option<NetworkState>,
    history: NetworkHistory,
}

impl NetworkEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let history = NetworkHistory::new(config.history_len);
        Self {
            config,
            bytes_window: VecDeque::with_capacity(256),
            window_total: 0,
            smoothed_bps: 0.0,
            smoothed_rtt_us: 0.0,
            rtt_var_us: 0.0,
            outcomes: VecDeque::with_capacity(256),
            consecutive_losses: 0,
            last_event_at: None,
            last_state: None,
            history,
        }
    }

    /// Record a telemetry event at the current instant.
    pub fn record(&mut self, event: PacketEvent) {
        self.record_at(Instant::now(), event);
    }

    /// Record with an explicit timestamp (useful for testing).
    pub fn record_at(&mut self, now: Instant, event: PacketEvent) {
        self.last_event_at = Some(now);
        match event {
            PacketEvent::Acked { bytes, rtt } => {
                self.record_bytes(now, bytes as u64);
                self.record_rtt(rtt);
                self.push_outcome(false);
            }
            PacketEvent::Lost => {
                self.push_outcome(true);
            }
        }
    }

    /// Whether a burst of consecutive losses warrants recomputing the
    /// state ahead of the regular tick.
    pub fn loss_burst(&self) -> bool {
        self.consecutive_losses >= self.config.loss_burst
    }

    /// Recompute the smoothed state, append it to the history, and
    /// return it. Called on the fixed tick or on a loss burst.
    pub fn on_tick(&mut self, now: Instant) -> NetworkState {
        let stale = match self.last_event_at {
            Some(at) => now.duration_since(at) > self.config.stale_after,
            None => true,
        };

        if stale {
            // Hold the last known state, flagged stale.
            let mut state = self.last_state.unwrap_or(NetworkState {
                bandwidth_bps: 0,
                rtt_ms: 0.0,
                jitter_ms: 0.0,
                loss_rate: 0.0,
                timestamp: now,
                stale: true,
            });
            state.timestamp = now;
            state.stale = true;
            self.last_state = Some(state);
            self.history.push(state);
            return state;
        }

        self.evict_bytes(now);
        let raw_bps = self.window_rate_bps(now);
        // EWMA over tick-level rate samples, α = 1/8.
        if self.smoothed_bps == 0.0 {
            self.smoothed_bps = raw_bps;
        } else {
            self.smoothed_bps = self.smoothed_bps * 0.875 + raw_bps * 0.125;
        }

        let lost = self.outcomes.iter().filter(|&&l| l).count();
        let loss_rate = if self.outcomes.is_empty() {
            0.0
        } else {
            lost as f64 / self.outcomes.len() as f64
        };

        let state = NetworkState {
            bandwidth_bps: (self.smoothed_bps as u64).min(self.config.max_bandwidth_bps),
            rtt_ms: self.smoothed_rtt_us / 1000.0,
            jitter_ms: self.rtt_var_us / 1000.0,
            loss_rate: loss_rate.clamp(0.0, 1.0),
            timestamp: now,
            stale: false,
        };
        self.last_state = Some(state);
        self.consecutive_losses = 0;
        self.history.push(state);
        state
    }

    /// The bounded state history the adapter plans against.
    pub fn history(&self) -> &NetworkHistory {
        &self.history
    }

    /// Smoothed round-trip time, or zero before the first sample.
    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.smoothed_rtt_us as u64)
    }

    // ── Internal ─────────────────────────────────────────────────

    fn record_bytes(&mut self, now: Instant, bytes: u64) {
        self.bytes_window.push_back((now, bytes));
        self.window_total += bytes;
        self.evict_bytes(now);
    }

    fn record_rtt(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as f64;
        if self.smoothed_rtt_us == 0.0 {
            self.smoothed_rtt_us = rtt_us;
            self.rtt_var_us = rtt_us / 2.0;
        } else {
            // srtt = 7/8 srtt + 1/8 sample; rttvar = 3/4 var + 1/4 |dev|
            let dev = (rtt_us - self.smoothed_rtt_us).abs();
            self.smoothed_rtt_us = self.smoothed_rtt_us * 0.875 + rtt_us * 0.125;
            self.rtt_var_us = self.rtt_var_us * 0.75 + dev * 0.25;
        }
    }

    fn push_outcome(&mut self, lost: bool) {
        if self.outcomes.len() == self.config.loss_window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(lost);
        if lost {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }

    fn evict_bytes(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.bytes_window.front() {
            if now.duration_since(ts) > self.config.bandwidth_window {
                self.bytes_window.pop_front();
                self.window_total = self.window_total.saturating_sub(bytes);
            } else {
                break;
            }
        }
    }

    fn window_rate_bps(&self, now: Instant) -> f64 {
        let Some(&(first, _)) = self.bytes_window.front() else {
            return 0.0;
        };
        let elapsed = now.duration_since(first).as_secs_f64().max(0.001);
        self.window_total as f64 * 8.0 / elapsed
    }
}

// ── Tests ────────────────────────────────────────────────────────
