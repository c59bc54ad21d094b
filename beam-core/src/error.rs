//! Domain-specific error types for the beam pipeline.
//!
//! All fallible operations return `Result<T, BeamError>`.
//! Failures scoped to a single frame are never fatal to the pipeline;
//! only failing to bind the socket tears a service down.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the streaming pipeline.
#[derive(Debug, Error)]
pub enum BeamError {
    // ── Adaptation Errors ────────────────────────────────────────
    /// A malformed encoding directive was rejected at the controller
    /// boundary; the previous directive stays in effect.
    #[error("invalid directive: {0}")]
    InvalidDirective(&'static str),

    /// No fresh network samples arrived within the staleness timeout.
    #[error("telemetry stale for {0:?}")]
    StaleTelemetry(Duration),

    // ── Codec Errors ─────────────────────────────────────────────
    /// The underlying codec rejected a frame on the encode side.
    /// The frame is skipped; sequence numbering still advances.
    #[error("codec failed to encode frame {frame_id}: {reason}")]
    CodecEncodeFailure { frame_id: u64, reason: String },

    /// The underlying decoder failed despite having data. Treated as
    /// irrecoverable and routed to the hold/synthesis path.
    #[error("codec failed to decode frame {frame_id}: {reason}")]
    CodecDecodeFailure { frame_id: u64, reason: String },

    // ── Transport Errors ─────────────────────────────────────────
    /// A frame's reassembly or retransmission missed its presentation
    /// deadline. Routed to frame-hold/synthesis, never propagated up.
    #[error("frame {frame_id} missed its presentation deadline")]
    DeadlineExceeded { frame_id: u64 },

    /// Too few packets survived to reconstruct a frame via the
    /// erasure code.
    #[error("erasure code needs {need} shards, only {have} available")]
    InsufficientShards { have: usize, need: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A datagram was shorter than its declared layout.
    #[error("packet too short: {actual} bytes (need {expected})")]
    PacketTooShort { expected: usize, actual: usize },

    /// The packet payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A field in the packet header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The UDP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for BeamError {
    fn from(s: String) -> Self {
        BeamError::Other(s)
    }
}

impl From<&str> for BeamError {
    fn from(s: &str) -> Self {
        BeamError::Other(s.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for BeamError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        BeamError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = BeamError::InvalidDirective("bitrate must be positive");
        assert!(e.to_string().contains("bitrate"));

        let e = BeamError::InsufficientShards { have: 7, need: 10 };
        assert!(e.to_string().contains('7'));
        assert!(e.to_string().contains("10"));
    }

    #[test]
    fn from_string() {
        let e: BeamError = "something broke".into();
        assert!(matches!(e, BeamError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: BeamError = io_err.into();
        assert!(matches!(e, BeamError::Connection(_)));
    }
}
