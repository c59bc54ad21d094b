//! Adaptive screen-video streaming over lossy networks.
//!
//! The crate implements a closed adaptation loop: transport telemetry
//! feeds a [`estimator::NetworkEstimator`], whose history drives a
//! [`adapter::PredictiveAdapter`]; the resulting directives steer the
//! [`encoder::EncoderController`] and the parity overhead of the
//! [`transport::PacketSender`]. On the far side the
//! [`transport::FrameReassembler`] rebuilds frames from surviving
//! shards and [`recovery::FrameRecovery`] guarantees something
//! presentable even when a frame is lost for good.
//!
//! [`service::SenderService`] and [`service::ReceiverService`] wire
//! the stages to a UDP socket; everything below them is sans-IO and
//! deterministic under test.

pub mod adapter;
pub mod codec;
pub mod encoder;
pub mod error;
pub mod estimator;
pub mod fec;
pub mod recovery;
pub mod roi;
pub mod service;
pub mod transport;
pub mod types;

pub use adapter::{AdapterConfig, EncodingDirective, PredictiveAdapter};
pub use codec::{
    CodecConfig, CodecFrame, QualityHint, QualityMap, VideoCodec, VideoDecoder, ZstdCodec,
    ZstdDecoder,
};
pub use encoder::{EncodedFrame, EncoderController};
pub use error::BeamError;
pub use estimator::{
    EstimatorConfig, NetworkEstimator, NetworkHistory, NetworkState, PacketEvent,
};
pub use recovery::{FrameRecovery, FrameSynthesizer, RecoveryConfig, RecoveryOutcome};
pub use roi::{Region, RegionMap, RoiConfig, RoiSelector};
pub use service::{
    FrameQueue, FrameSource, ReceiverHandle, ReceiverOptions, ReceiverService, ReceiverStats,
    SenderOptions, SenderService,
};
pub use types::{Frame, PixelFormat};
