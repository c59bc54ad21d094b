//! Encoder control: turns directives and region maps into encoded
//! frames.
//!
//! The controller sits between the adapter and the codec. It validates
//! incoming [`EncodingDirective`]s at the boundary, translates region
//! importance into codec quality hints, and stamps every encoded frame
//! with a monotonic wire identifier. A codec failure skips the frame
//! but never stalls the stream: numbering still advances so the
//! receiver sees an honest gap instead of a frozen sequence.

use std::time::Instant;

use tracing::{debug, warn};

use crate::adapter::EncodingDirective;
use crate::codec::{CodecConfig, QualityHint, QualityMap, VideoCodec};
use crate::error::BeamError;
use crate::roi::RegionMap;
use crate::types::Frame;

// ── EncodedFrame ─────────────────────────────────────────────────

/// A compressed frame ready for packetization.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Monotonic wire identifier. Advances even when a frame is
    /// skipped after a codec error.
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub keyframe: bool,
    pub captured_at: Instant,
    /// Latest time the frame may still be presented.
    pub deadline: Instant,
    pub payload: Vec<u8>,
}

// ── EncoderController ────────────────────────────────────────────

/// Drives a [`VideoCodec`] under the adapter's directives.
pub struct EncoderController<C: VideoCodec> {
    codec: C,
    fps: u32,
    current: EncodingDirective,
    next_frame_id: u64,
}

impl<C: VideoCodec> EncoderController<C> {
    pub fn new(mut codec: C, initial: EncodingDirective, fps: u32) -> Result<Self, BeamError> {
        validate(&initial)?;
        codec.configure(CodecConfig {
            target_bitrate_bps: initial.target_bitrate_bps,
            gop_size: initial.gop_size,
            fps,
        })?;
        Ok(Self {
            codec,
            fps,
            current: initial,
            next_frame_id: 1,
        })
    }

    /// The directive currently in effect.
    pub fn directive(&self) -> &EncodingDirective {
        &self.current
    }

    /// Apply a new directive. A malformed directive is rejected and
    /// the previous one stays in effect.
    pub fn configure(&mut self, directive: &EncodingDirective) -> Result<(), BeamError> {
        validate(directive)?;
        self.codec.configure(CodecConfig {
            target_bitrate_bps: directive.target_bitrate_bps,
            gop_size: directive.gop_size,
            fps: self.fps,
        })?;

        // A large downward step means the reference state the receiver
        // holds was encoded under a very different budget. Resync.
        let prev = self.current.target_bitrate_bps as f64;
        let next = directive.target_bitrate_bps as f64;
        if directive.force_keyframe || next < prev * 0.5 {
            self.codec.force_keyframe();
        }

        if *directive != self.current {
            debug!(
                bitrate = directive.target_bitrate_bps,
                gop = directive.gop_size,
                redundancy = directive.fec_redundancy_ratio,
                "directive applied"
            );
        }
        self.current = directive.clone();
        Ok(())
    }

    /// Encode one frame under the current directive.
    ///
    /// Returns `None` when the codec rejected the frame; the wire
    /// identifier still advances.
    pub fn encode(&mut self, frame: Frame, regions: &RegionMap) -> Option<EncodedFrame> {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let quality = quality_map(regions);
        match self.codec.encode(&frame, &quality) {
            Ok(out) => Some(EncodedFrame {
                frame_id,
                width: frame.width,
                height: frame.height,
                keyframe: out.keyframe,
                captured_at: frame.captured_at,
                deadline: frame.deadline,
                payload: out.payload,
            }),
            Err(e) => {
                warn!(frame_id, error = %e, "frame skipped");
                None
            }
        }
    }
}

fn validate(directive: &EncodingDirective) -> Result<(), BeamError> {
    if directive.target_bitrate_bps == 0 {
        return Err(BeamError::InvalidDirective("bitrate must be positive"));
    }
    if directive.gop_size == 0 {
        return Err(BeamError::InvalidDirective("gop size must be positive"));
    }
    if !(0.0..=1.0).contains(&directive.fec_redundancy_ratio) {
        return Err(BeamError::InvalidDirective(
            "redundancy ratio must lie in [0, 1]",
        ));
    }
    Ok(())
}

/// Importance maps 1:1 onto codec quality.
fn quality_map(regions: &RegionMap) -> QualityMap {
    QualityMap {
        regions: regions
            .regions()
            .iter()
            .map(|r| QualityHint {
                x: r.x,
                y: r.y,
                width: r.width,
                height: r.height,
                quality: r.importance,
            })
            .collect(),
        base_quality: regions.default_importance(),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecFrame;
    use crate::types::PixelFormat;
    use std::time::Duration;

    /// Codec double that records calls and can be told to fail.
    struct StubCodec {
        fail: bool,
        forced: u32,
        configured: Vec<CodecConfig>,
    }

    impl StubCodec {
        fn new() -> Self {
            Self {
                fail: false,
                forced: 0,
                configured: Vec::new(),
            }
        }
    }

    impl VideoCodec for StubCodec {
        fn configure(&mut self, config: CodecConfig) -> Result<(), BeamError> {
            self.configured.push(config);
            Ok(())
        }

        fn force_keyframe(&mut self) {
            self.forced += 1;
        }

        fn encode(&mut self, frame: &Frame, _quality: &QualityMap) -> Result<CodecFrame, BeamError> {
            if self.fail {
                return Err(BeamError::CodecEncodeFailure {
                    frame_id: frame.seq,
                    reason: "stub failure".into(),
                });
            }
            Ok(CodecFrame {
                keyframe: false,
                payload: vec![0; 8],
            })
        }
    }

    fn directive(bitrate: u64) -> EncodingDirective {
        EncodingDirective {
            target_bitrate_bps: bitrate,
            gop_size: 30,
            fec_redundancy_ratio: 0.1,
            force_keyframe: false,
        }
    }

    fn frame(seq: u64) -> Frame {
        let now = Instant::now();
        Frame {
            seq,
            width: 16,
            height: 16,
            format: PixelFormat::Bgra8,
            data: vec![0; 16 * 16 * 4],
            captured_at: now,
            deadline: now + Duration::from_millis(100),
        }
    }

    fn empty_map() -> RegionMap {
        RegionMap::new(Vec::new(), 0.5)
    }

    #[test]
    fn frame_ids_are_monotonic_and_advance_past_failures() {
        let mut ctl = EncoderController::new(StubCodec::new(), directive(3_000_000), 30).unwrap();
        let a = ctl.encode(frame(1), &empty_map()).unwrap();
        assert_eq!(a.frame_id, 1);

        ctl.codec.fail = true;
        assert!(ctl.encode(frame(2), &empty_map()).is_none());

        ctl.codec.fail = false;
        let c = ctl.encode(frame(3), &empty_map()).unwrap();
        // The failed frame consumed id 2.
        assert_eq!(c.frame_id, 3);
    }

    #[test]
    fn invalid_directive_keeps_previous() {
        let mut ctl = EncoderController::new(StubCodec::new(), directive(3_000_000), 30).unwrap();
        let bad = EncodingDirective {
            target_bitrate_bps: 0,
            ..directive(0)
        };
        assert!(matches!(
            ctl.configure(&bad),
            Err(BeamError::InvalidDirective(_))
        ));
        assert_eq!(ctl.directive().target_bitrate_bps, 3_000_000);

        let bad_ratio = EncodingDirective {
            fec_redundancy_ratio: 1.5,
            ..directive(2_000_000)
        };
        assert!(ctl.configure(&bad_ratio).is_err());
        assert_eq!(ctl.directive().target_bitrate_bps, 3_000_000);
    }

    #[test]
    fn sharp_bitrate_drop_forces_keyframe() {
        let mut ctl = EncoderController::new(StubCodec::new(), directive(4_000_000), 30).unwrap();
        ctl.configure(&directive(3_600_000)).unwrap();
        assert_eq!(ctl.codec.forced, 0);
        ctl.configure(&directive(1_000_000)).unwrap();
        assert_eq!(ctl.codec.forced, 1);
    }

    #[test]
    fn explicit_keyframe_request_reaches_codec() {
        let mut ctl = EncoderController::new(StubCodec::new(), directive(3_000_000), 30).unwrap();
        let mut d = directive(3_000_000);
        d.force_keyframe = true;
        ctl.configure(&d).unwrap();
        assert_eq!(ctl.codec.forced, 1);
    }

    #[test]
    fn deadline_and_capture_time_are_preserved() {
        let mut ctl = EncoderController::new(StubCodec::new(), directive(3_000_000), 30).unwrap();
        let f = frame(1);
        let deadline = f.deadline;
        let out = ctl.encode(f, &empty_map()).unwrap();
        assert_eq!(out.deadline, deadline);
    }
}
