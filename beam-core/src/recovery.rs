//! Frame recovery: the last line of defence before presentation.
//!
//! The reassembler classifies every frame as complete or expired; this
//! stage decides what actually reaches the screen. Complete frames are
//! decoded and shown. Expired frames are salvaged in order of
//! preference: a partial decode when enough of the payload survived, a
//! synthesized frame when a [`FrameSynthesizer`] is installed, and
//! otherwise a hold of the last good frame. The viewer sees a frozen
//! or approximated picture, never a torn one.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

use crate::codec::VideoDecoder;
use crate::transport::recv::AssembledFrame;
use crate::types::{Frame, PixelFormat};

// ── FrameSynthesizer ─────────────────────────────────────────────

/// Produces a substitute frame from recent history, e.g. by motion
/// extrapolation. Returning `None` falls back to frame hold.
pub trait FrameSynthesizer: Send {
    fn synthesize(&self, history: &[Frame]) -> Option<Frame>;
}

// ── Outcomes ─────────────────────────────────────────────────────

/// How a presentation slot was filled.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// Decoded from real (possibly partially received) data.
    Delivered(Frame),
    /// The previous good frame, held.
    Held(Frame),
    /// Approximated from history by the synthesizer.
    Synthesized(Frame),
}

impl RecoveryOutcome {
    pub fn frame(&self) -> &Frame {
        match self {
            RecoveryOutcome::Delivered(f)
            | RecoveryOutcome::Held(f)
            | RecoveryOutcome::Synthesized(f) => f,
        }
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub delivered: u64,
    pub held: u64,
    pub synthesized: u64,
    /// Decode failures on complete frames; usually a missed keyframe.
    pub decode_failures: u64,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Good frames retained for hold and synthesis.
    pub history_len: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { history_len: 5 }
    }
}

// ── FrameRecovery ────────────────────────────────────────────────

/// Decodes assembled frames and fills gaps from history.
pub struct FrameRecovery<D: VideoDecoder> {
    decoder: D,
    format: PixelFormat,
    config: RecoveryConfig,
    history: VecDeque<Frame>,
    synthesizer: Option<Box<dyn FrameSynthesizer>>,
    stats: RecoveryStats,
}

impl<D: VideoDecoder> FrameRecovery<D> {
    pub fn new(decoder: D, format: PixelFormat, config: RecoveryConfig) -> Self {
        Self {
            decoder,
            format,
            config,
            history: VecDeque::new(),
            synthesizer: None,
            stats: RecoveryStats::default(),
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Box<dyn FrameSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }

    /// Present a fully reassembled frame.
    ///
    /// Returns `None` only when decoding fails and no history exists
    /// yet, in which case there is nothing to show at all.
    pub fn on_complete(&mut self, frame: &AssembledFrame, now: Instant) -> Option<RecoveryOutcome> {
        match self.decode(frame, now) {
            Some(decoded) => {
                self.remember(decoded.clone());
                self.stats.delivered += 1;
                Some(RecoveryOutcome::Delivered(decoded))
            }
            None => {
                self.stats.decode_failures += 1;
                self.fill_gap(frame.frame_id)
            }
        }
    }

    /// Present the slot of a frame that could not be completed in
    /// time. `partial` is the surviving payload prefix, if any.
    pub fn on_expired(
        &mut self,
        frame_id: u64,
        partial: Option<&AssembledFrame>,
        now: Instant,
    ) -> Option<RecoveryOutcome> {
        if let Some(fragment) = partial
            && let Some(decoded) = self.decode(fragment, now)
        {
            debug!(frame_id, "partial decode succeeded");
            self.remember(decoded.clone());
            self.stats.delivered += 1;
            return Some(RecoveryOutcome::Delivered(decoded));
        }
        self.fill_gap(frame_id)
    }

    // ── Internal ─────────────────────────────────────────────────

    fn decode(&mut self, frame: &AssembledFrame, now: Instant) -> Option<Frame> {
        match self.decoder.decode(
            frame.frame_id,
            frame.width,
            frame.height,
            &frame.payload,
        ) {
            Ok(data) => Some(Frame {
                seq: frame.frame_id,
                width: frame.width,
                height: frame.height,
                format: self.format,
                data,
                captured_at: now,
                deadline: frame.deadline,
            }),
            Err(e) => {
                debug!(frame_id = frame.frame_id, error = %e, "decode failed");
                None
            }
        }
    }

    fn fill_gap(&mut self, frame_id: u64) -> Option<RecoveryOutcome> {
        if let Some(synth) = &self.synthesizer
            && let Some(frame) = synth.synthesize(self.history.make_contiguous())
        {
            debug!(frame_id, "gap synthesized");
            self.stats.synthesized += 1;
            return Some(RecoveryOutcome::Synthesized(frame));
        }
        let held = self.history.back()?.clone();
        debug!(frame_id, held_seq = held.seq, "gap filled by frame hold");
        self.stats.held += 1;
        Some(RecoveryOutcome::Held(held))
    }

    fn remember(&mut self, frame: Frame) {
        self.history.push_back(frame);
        while self.history.len() > self.config.history_len {
            self.history.pop_front();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{
        CodecConfig, QualityMap, VideoCodec, ZstdCodec, ZstdDecoder,
    };
    use std::time::Duration;

    fn raw_frame(seq: u64, fill: u8) -> Frame {
        let now = Instant::now();
        Frame {
            seq,
            width: 32,
            height: 32,
            format: PixelFormat::Bgra8,
            data: vec![fill; 32 * 32 * 4],
            captured_at: now,
            deadline: now + Duration::from_millis(100),
        }
    }

    fn assembled(frame_id: u64, keyframe: bool, payload: Vec<u8>) -> AssembledFrame {
        AssembledFrame {
            frame_id,
            width: 32,
            height: 32,
            keyframe,
            deadline: Instant::now() + Duration::from_millis(100),
            payload,
        }
    }

    fn encode(codec: &mut ZstdCodec, frame: &Frame) -> (bool, Vec<u8>) {
        let out = codec.encode(frame, &QualityMap::uniform(1.0)).unwrap();
        (out.keyframe, out.payload)
    }

    fn recovery() -> FrameRecovery<ZstdDecoder> {
        FrameRecovery::new(
            ZstdDecoder::new(PixelFormat::Bgra8),
            PixelFormat::Bgra8,
            RecoveryConfig::default(),
        )
    }

    #[test]
    fn complete_frames_are_decoded_and_delivered() {
        let mut codec = ZstdCodec::new(PixelFormat::Bgra8, CodecConfig::default());
        let mut rec = recovery();
        let frame = raw_frame(1, 0x42);
        let (keyframe, payload) = encode(&mut codec, &frame);
        assert!(keyframe);

        let outcome = rec
            .on_complete(&assembled(1, true, payload), Instant::now())
            .unwrap();
        match outcome {
            RecoveryOutcome::Delivered(f) => assert_eq!(f.data, frame.data),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(rec.stats().delivered, 1);
    }

    #[test]
    fn expired_frame_holds_last_good_picture() {
        let mut codec = ZstdCodec::new(PixelFormat::Bgra8, CodecConfig::default());
        let mut rec = recovery();
        let frame = raw_frame(1, 0x42);
        let (_, payload) = encode(&mut codec, &frame);
        let _ = rec.on_complete(&assembled(1, true, payload), Instant::now());

        let outcome = rec.on_expired(2, None, Instant::now()).unwrap();
        match outcome {
            RecoveryOutcome::Held(f) => {
                assert_eq!(f.seq, 1);
                assert_eq!(f.data, frame.data);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(rec.stats().held, 1);
    }

    #[test]
    fn gap_before_any_frame_presents_nothing() {
        let mut rec = recovery();
        assert!(rec.on_expired(1, None, Instant::now()).is_none());
    }

    #[test]
    fn truncated_partial_payload_falls_back_to_hold() {
        let mut codec = ZstdCodec::new(PixelFormat::Bgra8, CodecConfig::default());
        let mut rec = recovery();
        let (_, payload) = encode(&mut codec, &raw_frame(1, 0x11));
        let _ = rec.on_complete(&assembled(1, true, payload), Instant::now());

        let (_, p2) = encode(&mut codec, &raw_frame(2, 0x22));
        let fragment = assembled(2, false, p2[..p2.len() / 2].to_vec());
        let outcome = rec.on_expired(2, Some(&fragment), Instant::now()).unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Held(_)));
    }

    #[test]
    fn synthesizer_takes_priority_over_hold() {
        struct Doubler;
        impl FrameSynthesizer for Doubler {
            fn synthesize(&self, history: &[Frame]) -> Option<Frame> {
                let mut f = history.last()?.clone();
                f.seq += 1;
                Some(f)
            }
        }

        let mut codec = ZstdCodec::new(PixelFormat::Bgra8, CodecConfig::default());
        let mut rec = recovery().with_synthesizer(Box::new(Doubler));
        let (_, payload) = encode(&mut codec, &raw_frame(1, 0x33));
        let _ = rec.on_complete(&assembled(1, true, payload), Instant::now());

        let outcome = rec.on_expired(2, None, Instant::now()).unwrap();
        match outcome {
            RecoveryOutcome::Synthesized(f) => assert_eq!(f.seq, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(rec.stats().synthesized, 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut codec = ZstdCodec::new(PixelFormat::Bgra8, CodecConfig::default());
        let mut rec = recovery();
        for id in 1..=10u64 {
            let (_, payload) = encode(&mut codec, &raw_frame(id, id as u8));
            let _ = rec.on_complete(&assembled(id, id == 1, payload), Instant::now());
        }
        assert_eq!(rec.history.len(), 5);
        // The hold frame is the most recent delivered one.
        let outcome = rec.on_expired(11, None, Instant::now()).unwrap();
        assert_eq!(outcome.frame().seq, 10);
    }
}
