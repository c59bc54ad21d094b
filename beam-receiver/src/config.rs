//! Configuration for the receiver.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use beam_core::recovery::RecoveryConfig;
use beam_core::service::ReceiverOptions;
use beam_core::transport::ReassemblyConfig;
use beam_core::types::PixelFormat;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Reassembly and recovery tuning.
    pub recovery: RecoveryTuning,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address to listen on.
    pub bind: SocketAddr,
}

/// Reassembly and recovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryTuning {
    /// Delay before the single retransmission round, in milliseconds.
    pub nack_delay_ms: u64,
    /// Incomplete frames tracked concurrently.
    pub max_pending: usize,
    /// Consecutive irrecoverable frames before a keyframe is demanded.
    pub keyframe_request_after: u32,
    /// Good frames retained for hold and synthesis.
    pub history_len: usize,
    /// Statistics log cadence in seconds.
    pub stats_interval_s: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            recovery: RecoveryTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7410".parse().expect("valid default bind"),
        }
    }
}

impl Default for RecoveryTuning {
    fn default() -> Self {
        Self {
            nack_delay_ms: 20,
            max_pending: 16,
            keyframe_request_after: 3,
            history_len: 5,
            stats_interval_s: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Translate file settings into service options.
    pub fn to_receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            bind: self.network.bind,
            format: PixelFormat::Bgra8,
            reassembly: ReassemblyConfig {
                nack_delay: Duration::from_millis(self.recovery.nack_delay_ms),
                max_pending: self.recovery.max_pending.max(1),
                keyframe_request_after: self.recovery.keyframe_request_after.max(1),
                ..ReassemblyConfig::default()
            },
            recovery: RecoveryConfig {
                history_len: self.recovery.history_len.max(1),
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
