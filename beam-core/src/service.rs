//! Async services wiring the pipeline stages to a UDP socket.
//!
//! [`SenderService`] runs the capture-encode-send half, [`ReceiverService`]
//! the receive-recover-present half. All stage state lives inside the
//! service loop; stages talk through values, not shared mutexes. The
//! capture side is decoupled from encoding by a bounded [`FrameQueue`]
//! that drops the oldest frame under pressure, so a slow encoder costs
//! latency on one frame instead of back-pressuring capture.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterConfig, PredictiveAdapter};
use crate::codec::{VideoCodec, VideoDecoder};
use crate::encoder::EncoderController;
use crate::error::BeamError;
use crate::estimator::{EstimatorConfig, NetworkEstimator};
use crate::recovery::{FrameRecovery, RecoveryConfig, RecoveryOutcome};
use crate::roi::{RoiConfig, RoiSelector};
use crate::transport::recv::{FrameReassembler, ReassemblyConfig, ReceiverEvent};
use crate::transport::send::{PacketSender, SenderConfig, SenderEvent};
use crate::transport::wire::{self, ControlMessage};
use crate::types::{Frame, PixelFormat};

const RECV_BUFFER: usize = 65_536;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const RECEIVER_POLL: Duration = Duration::from_millis(5);

// ── FrameSource ──────────────────────────────────────────────────

/// Supplies raw frames to a sender service. Implemented by screen
/// capture in production and by synthetic pattern generators in tests.
#[async_trait]
pub trait FrameSource: Send {
    /// Produce the next frame. Pends at the capture cadence.
    async fn next_frame(&mut self) -> Result<Frame, BeamError>;

    /// Current pointer position, when one is being tracked.
    fn pointer(&self) -> Option<(u32, u32)> {
        None
    }
}

// ── FrameQueue ───────────────────────────────────────────────────

/// Bounded hand-off queue that drops the oldest entry when full.
pub struct FrameQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T: Send> FrameQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0);
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue, evicting the oldest entry when at capacity. Never
    /// blocks the producer.
    pub fn push(&self, item: T) {
        {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Dequeue the oldest entry, waiting for one if empty.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Entries evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── SenderService ────────────────────────────────────────────────

/// Configuration for one sender service instance.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub bind: SocketAddr,
    pub peer: SocketAddr,
    /// Nominal capture rate, also the per-frame presentation budget.
    pub fps: u32,
    /// Capture-to-encode queue depth.
    pub queue_depth: usize,
    pub estimator: EstimatorConfig,
    pub adapter: AdapterConfig,
    pub roi: RoiConfig,
    pub packet: SenderConfig,
}

/// Capture, adaptation and transmission, driven until cancelled.
pub struct SenderService {
    options: SenderOptions,
}

impl SenderService {
    pub fn new(options: SenderOptions) -> Self {
        Self { options }
    }

    /// Run the sender loop until cancelled. Only binding the socket is
    /// fatal; per-frame failures and transient socket errors (e.g. the
    /// receiver being down) are logged and skipped.
    pub async fn run<S, C>(
        self,
        source: S,
        codec: C,
        cancel: CancellationToken,
    ) -> Result<(), BeamError>
    where
        S: FrameSource + 'static,
        C: VideoCodec,
    {
        let opts = self.options;
        let socket = UdpSocket::bind(opts.bind).await?;
        socket.connect(opts.peer).await?;
        info!(bind = %opts.bind, peer = %opts.peer, "sender up");

        let mut estimator = NetworkEstimator::new(opts.estimator.clone());
        let mut adapter = PredictiveAdapter::new(opts.adapter.clone());
        let mut roi = RoiSelector::new(opts.roi.clone());
        let mut packets = PacketSender::new(opts.packet.clone());

        let initial = adapter.current().clone();
        packets.set_redundancy(initial.fec_redundancy_ratio);
        let mut encoder = EncoderController::new(codec, initial, opts.fps)?;

        let queue: Arc<FrameQueue<(Frame, Option<(u32, u32)>)>> =
            FrameQueue::new(opts.queue_depth);
        let capture = tokio::spawn(capture_loop(source, Arc::clone(&queue), cancel.clone()));

        let mut tick = tokio::time::interval(opts.estimator.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut telemetry_stale = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                (frame, pointer) = queue.pop() => {
                    let regions = roi.select(&frame, pointer);
                    let Some(encoded) = encoder.encode(frame, &regions) else {
                        continue;
                    };
                    match packets.packetize(&encoded, Instant::now()) {
                        Ok(datagrams) => {
                            for datagram in &datagrams {
                                // A connected UDP socket surfaces ICMP
                                // unreachable here while the receiver
                                // is down; the frame is sacrificed,
                                // the stream is not.
                                if let Err(e) = socket.send(datagram).await {
                                    debug!(error = %e, "send failed, rest of frame dropped");
                                    break;
                                }
                            }
                        }
                        Err(BeamError::DeadlineExceeded { frame_id }) => {
                            debug!(frame_id, "frame dropped before send");
                        }
                        Err(e) => warn!(error = %e, "packetize failed"),
                    }
                }

                received = socket.recv(&mut buf) => {
                    let n = match received {
                        Ok(n) => n,
                        Err(e) => {
                            debug!(error = %e, "recv failed");
                            continue;
                        }
                    };
                    let msg = match ControlMessage::decode(&buf[..n]) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(error = %e, "bad control datagram");
                            continue;
                        }
                    };
                    if let ControlMessage::TelemetryReport {
                        received,
                        lost,
                        bytes,
                        interval_ms,
                    } = &msg
                    {
                        let goodput_bps = if *interval_ms > 0 {
                            bytes * 8_000 / u64::from(*interval_ms)
                        } else {
                            0
                        };
                        debug!(received, lost, goodput_bps, "receiver report");
                    }
                    let now = Instant::now();
                    for event in packets.handle_control(&msg, now) {
                        match event {
                            SenderEvent::Telemetry(sample) => estimator.record(sample),
                            SenderEvent::Resend(datagram) => {
                                if let Err(e) = socket.send(&datagram).await {
                                    debug!(error = %e, "resend failed");
                                }
                            }
                            SenderEvent::KeyframeRequested => {
                                adapter.request_keyframe();
                            }
                        }
                    }
                    // A loss burst re-plans immediately instead of
                    // waiting out the tick.
                    if estimator.loss_burst() {
                        estimator.on_tick(now);
                        apply_directive(&mut adapter, &mut encoder, &mut packets, &estimator);
                    }
                }

                _ = tick.tick() => {
                    let now = Instant::now();
                    let state = estimator.on_tick(now);
                    if state.stale && !telemetry_stale {
                        warn!(
                            error = %BeamError::StaleTelemetry(opts.estimator.stale_after),
                            "holding conservative directives"
                        );
                    }
                    telemetry_stale = state.stale;
                    packets.expire(now);
                    apply_directive(&mut adapter, &mut encoder, &mut packets, &estimator);
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = socket.send(&ControlMessage::Heartbeat.encode()?).await {
                        debug!(error = %e, "heartbeat failed");
                    }
                }
            }
        }

        capture.abort();
        info!(dropped = queue.dropped(), "sender down");
        Ok(())
    }
}

async fn capture_loop<S: FrameSource>(
    mut source: S,
    queue: Arc<FrameQueue<(Frame, Option<(u32, u32)>)>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => match frame {
                Ok(frame) => {
                    let pointer = source.pointer();
                    queue.push((frame, pointer));
                }
                Err(e) => {
                    warn!(error = %e, "capture failed, stopping");
                    break;
                }
            },
        }
    }
}

fn apply_directive<C: VideoCodec>(
    adapter: &mut PredictiveAdapter,
    encoder: &mut EncoderController<C>,
    packets: &mut PacketSender,
    estimator: &NetworkEstimator,
) {
    let directive = adapter.on_tick(estimator.history());
    packets.set_redundancy(directive.fec_redundancy_ratio);
    if let Err(e) = encoder.configure(&directive) {
        warn!(error = %e, "directive rejected, keeping previous");
    }
}

// ── ReceiverService ──────────────────────────────────────────────

/// Configuration for one receiver service instance.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub bind: SocketAddr,
    /// Pixel format frames are decoded into.
    pub format: PixelFormat,
    pub reassembly: ReassemblyConfig,
    pub recovery: RecoveryConfig,
}

/// Aggregated receive-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub delivered: u64,
    pub held: u64,
    pub synthesized: u64,
    pub expired: u64,
    pub discarded_late: u64,
}

/// Watch-channel view of a running receiver.
#[derive(Clone)]
pub struct ReceiverHandle {
    /// Latest presentable frame. `None` until the first one decodes.
    pub frames: watch::Receiver<Option<Frame>>,
    pub stats: watch::Receiver<ReceiverStats>,
}

/// Reception, recovery and presentation, driven until cancelled.
pub struct ReceiverService {
    options: ReceiverOptions,
    frames_tx: watch::Sender<Option<Frame>>,
    stats_tx: watch::Sender<ReceiverStats>,
}

impl ReceiverService {
    pub fn new(options: ReceiverOptions) -> (Self, ReceiverHandle) {
        let (frames_tx, frames) = watch::channel(None);
        let (stats_tx, stats) = watch::channel(ReceiverStats::default());
        (
            Self {
                options,
                frames_tx,
                stats_tx,
            },
            ReceiverHandle { frames, stats },
        )
    }

    /// Run the receiver loop until cancelled. Only binding the socket
    /// is fatal; malformed datagrams and transient socket errors are
    /// logged and dropped.
    pub async fn run<D: VideoDecoder>(
        self,
        decoder: D,
        cancel: CancellationToken,
    ) -> Result<(), BeamError> {
        let socket = UdpSocket::bind(self.options.bind).await?;
        info!(bind = %self.options.bind, "receiver up");

        let mut reassembler = FrameReassembler::new(self.options.reassembly.clone());
        let mut recovery = FrameRecovery::new(
            decoder,
            self.options.format,
            self.options.recovery.clone(),
        );
        let mut peer: Option<SocketAddr> = None;
        let mut poll = tokio::time::interval(RECEIVER_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                received = socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "recv failed");
                            continue;
                        }
                    };
                    peer = Some(from);
                    let datagram = &buf[..n];
                    match wire::datagram_kind(datagram) {
                        Some(wire::KIND_DATA) => {
                            match reassembler.handle_packet(datagram, Instant::now()) {
                                Ok(events) => {
                                    self.process(events, &mut recovery, &socket, peer).await?;
                                }
                                Err(e) => debug!(error = %e, "bad data datagram"),
                            }
                        }
                        Some(wire::KIND_CONTROL) => {
                            // Only heartbeats flow this way; they just
                            // refresh the peer address.
                            if let Err(e) = ControlMessage::decode(datagram) {
                                debug!(error = %e, "bad control datagram");
                            }
                        }
                        _ => debug!("unknown datagram kind"),
                    }
                }

                _ = poll.tick() => {
                    let events = reassembler.poll(Instant::now());
                    self.process(events, &mut recovery, &socket, peer).await?;
                }
            }
        }

        let stats = *self.stats_tx.borrow();
        info!(?stats, "receiver down");
        Ok(())
    }

    async fn process<D: VideoDecoder>(
        &self,
        events: Vec<ReceiverEvent>,
        recovery: &mut FrameRecovery<D>,
        socket: &UdpSocket,
        peer: Option<SocketAddr>,
    ) -> Result<(), BeamError> {
        let mut stats = *self.stats_tx.borrow();
        for event in events {
            match event {
                ReceiverEvent::Deliver(frame) => {
                    let outcome = recovery.on_complete(&frame, Instant::now());
                    if let Some(msg) = present(&self.frames_tx, &mut stats, outcome) {
                        // A complete frame that fails to decode means
                        // the reference state is gone.
                        self.send_control(socket, peer, &msg).await?;
                    }
                }
                ReceiverEvent::Expired {
                    frame_id,
                    keyframe,
                    partial,
                } => {
                    stats.expired += 1;
                    let outcome = recovery.on_expired(frame_id, partial.as_ref(), Instant::now());
                    let _ = present(&self.frames_tx, &mut stats, outcome);
                    if keyframe {
                        // Without this keyframe every following delta
                        // is undecodable; do not wait for the counter.
                        self.send_control(socket, peer, &ControlMessage::KeyframeRequest)
                            .await?;
                    }
                }
                ReceiverEvent::DiscardedLate { frame_id } => {
                    stats.discarded_late += 1;
                    debug!(frame_id, "late frame discarded");
                }
                ReceiverEvent::Send(msg) => {
                    self.send_control(socket, peer, &msg).await?;
                }
            }
        }
        self.stats_tx.send_replace(stats);
        Ok(())
    }

    async fn send_control(
        &self,
        socket: &UdpSocket,
        peer: Option<SocketAddr>,
        msg: &ControlMessage,
    ) -> Result<(), BeamError> {
        let Some(addr) = peer else {
            return Ok(());
        };
        // The sender vanishing must not tear the receiver down; the
        // message is simply lost like any other datagram.
        if let Err(e) = socket.send_to(&msg.encode()?, addr).await {
            debug!(error = %e, "control send failed");
        }
        Ok(())
    }
}

/// Publish a recovery outcome and bump the matching counter. Returns
/// a control message when the outcome demands one.
fn present(
    frames_tx: &watch::Sender<Option<Frame>>,
    stats: &mut ReceiverStats,
    outcome: Option<RecoveryOutcome>,
) -> Option<ControlMessage> {
    match outcome {
        Some(RecoveryOutcome::Delivered(frame)) => {
            stats.delivered += 1;
            frames_tx.send_replace(Some(frame));
            None
        }
        Some(RecoveryOutcome::Held(frame)) => {
            stats.held += 1;
            frames_tx.send_replace(Some(frame));
            None
        }
        Some(RecoveryOutcome::Synthesized(frame)) => {
            stats.synthesized += 1;
            frames_tx.send_replace(Some(frame));
            None
        }
        // Nothing presentable yet: ask for a fresh reference.
        None => Some(ControlMessage::KeyframeRequest),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_queue_drops_oldest_under_pressure() {
        let queue: Arc<FrameQueue<u32>> = FrameQueue::new(3);
        for i in 1..=5 {
            queue.push(i);
        }
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.pop().await, 3);
        assert_eq!(queue.pop().await, 4);
        assert_eq!(queue.pop().await, 5);
    }

    #[test]
    fn frame_queue_pop_waits_for_push() {
        let queue: Arc<FrameQueue<u32>> = FrameQueue::new(2);
        let mut pop = tokio_test::task::spawn(queue.pop());
        tokio_test::assert_pending!(pop.poll());
        queue.push(7);
        assert!(pop.is_woken());
        assert_eq!(tokio_test::assert_ready!(pop.poll()), 7);
    }

    #[tokio::test]
    async fn frame_queue_is_fifo() {
        let queue: Arc<FrameQueue<u32>> = FrameQueue::new(8);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop().await, 1);
        assert_eq!(queue.pop().await, 2);
    }
}
