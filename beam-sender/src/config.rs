//! Configuration for the sender.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use beam_core::adapter::AdapterConfig;
use beam_core::estimator::EstimatorConfig;
use beam_core::roi::RoiConfig;
use beam_core::service::SenderOptions;
use beam_core::transport::SenderConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Capture and encoding settings.
    pub video: VideoConfig,
    /// Adaptation tuning.
    pub adaptation: AdaptationConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP address to bind.
    pub bind: SocketAddr,
    /// Receiver address to stream to.
    pub peer: SocketAddr,
    /// Shard payload size in bytes.
    pub chunk_size: usize,
}

/// Capture and encoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Target frames per second.
    pub fps: u32,
    /// Test pattern width in pixels.
    pub width: u32,
    /// Test pattern height in pixels.
    pub height: u32,
    /// Capture-to-encode queue depth.
    pub queue_depth: usize,
    /// ROI tile edge length in pixels.
    pub tile_size: u32,
    /// Pointer influence radius in pixels.
    pub pointer_radius: f32,
}

/// Adaptation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Bitrate bounds in bits per second.
    pub min_bitrate_bps: u64,
    pub max_bitrate_bps: u64,
    pub start_bitrate_bps: u64,
    /// Parity ratio band.
    pub min_redundancy: f64,
    pub max_redundancy: f64,
    /// Estimator tick in milliseconds.
    pub tick_ms: u64,
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
            video: VideoConfig::default(),
            adaptation: AdaptationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:0".parse().expect("valid default bind"),
            peer: "127.0.0.1:7410".parse().expect("valid default peer"),
            chunk_size: 1152,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            width: 1280,
            height: 720,
            queue_depth: 4,
            tile_size: 64,
            pointer_radius: 200.0,
        }
    }
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            min_bitrate_bps: 500_000,
            max_bitrate_bps: 10_000_000,
            start_bitrate_bps: 3_000_000,
            min_redundancy: 0.05,
            max_redundancy: 0.40,
            tick_ms: 200,
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
    pub fn to_sender_options(&self) -> SenderOptions {
        SenderOptions {
            bind: self.network.bind,
            peer: self.network.peer,
            fps: self.video.fps.clamp(1, 120),
            queue_depth: self.video.queue_depth.max(1),
            estimator: EstimatorConfig {
                tick: Duration::from_millis(self.adaptation.tick_ms.max(50)),
                ..EstimatorConfig::default()
            },
            adapter: AdapterConfig {
                min_bitrate_bps: self.adaptation.min_bitrate_bps,
                max_bitrate_bps: self.adaptation.max_bitrate_bps,
                start_bitrate_bps: self.adaptation.start_bitrate_bps,
                min_redundancy: self.adaptation.min_redundancy,
                max_redundancy: self.adaptation.max_redundancy,
                ..AdapterConfig::default()
            },
            roi: RoiConfig {
                tile_size: self.video.tile_size.max(8),
                pointer_radius: self.video.pointer_radius,
                ..RoiConfig::default()
            },
            packet: SenderConfig {
                chunk_size: self.network.chunk_size.clamp(256, 60_000),
                ..SenderConfig::default()
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = AppConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("peer"));
        assert!(text.contains("fps"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = AppConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.video.fps, 30);
        assert_eq!(parsed.adaptation.start_bitrate_bps, 3_000_000);
    }

    #[test]
    fn to_sender_options_clamps() {
        let mut cfg = AppConfig::default();
        cfg.video.fps = 500;
        cfg.video.queue_depth = 0;
        let opts = cfg.to_sender_options();
        assert_eq!(opts.fps, 120);
        assert_eq!(opts.queue_depth, 1);
    }
}
