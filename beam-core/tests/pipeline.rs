//! End-to-end pipeline tests over a localhost UDP socket pair.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use beam_core::{
    BeamError, CodecConfig, Frame, FrameSource, PixelFormat, ReceiverOptions, ReceiverService,
    RecoveryConfig, SenderOptions, SenderService, ZstdCodec, ZstdDecoder,
};
use beam_core::adapter::AdapterConfig;
use beam_core::estimator::EstimatorConfig;
use beam_core::roi::RoiConfig;
use beam_core::transport::{ReassemblyConfig, SenderConfig};

const FRAME_SIZE: u32 = 64;

/// Grab an ephemeral localhost address. The socket is dropped before
/// the service binds; collisions are unlikely enough for tests.
fn local_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    socket.local_addr().expect("probe addr")
}

/// Synthetic capture source: a solid frame whose colour advances each
/// tick, so every frame differs from the previous one.
struct PatternSource {
    seq: u64,
    interval: Duration,
}

impl PatternSource {
    fn new(interval: Duration) -> Self {
        Self { seq: 0, interval }
    }
}

#[async_trait]
impl FrameSource for PatternSource {
    async fn next_frame(&mut self) -> Result<Frame, BeamError> {
        tokio::time::sleep(self.interval).await;
        self.seq += 1;
        let now = Instant::now();
        let fill = (self.seq % 251) as u8;
        Ok(Frame {
            seq: self.seq,
            width: FRAME_SIZE,
            height: FRAME_SIZE,
            format: PixelFormat::Bgra8,
            data: vec![fill; (FRAME_SIZE * FRAME_SIZE * 4) as usize],
            captured_at: now,
            deadline: now + Duration::from_millis(250),
        })
    }

    fn pointer(&self) -> Option<(u32, u32)> {
        Some((FRAME_SIZE / 2, FRAME_SIZE / 2))
    }
}

fn sender_options(bind: SocketAddr, peer: SocketAddr) -> SenderOptions {
    SenderOptions {
        bind,
        peer,
        fps: 30,
        queue_depth: 4,
        estimator: EstimatorConfig::default(),
        adapter: AdapterConfig::default(),
        roi: RoiConfig::default(),
        packet: SenderConfig::default(),
    }
}

fn receiver_options(bind: SocketAddr) -> ReceiverOptions {
    ReceiverOptions {
        bind,
        format: PixelFormat::Bgra8,
        reassembly: ReassemblyConfig::default(),
        recovery: RecoveryConfig::default(),
    }
}

#[tokio::test]
async fn frames_flow_from_sender_to_receiver() {
    let sender_addr = local_addr();
    let receiver_addr = local_addr();
    let cancel = CancellationToken::new();

    let (receiver, mut handle) = ReceiverService::new(receiver_options(receiver_addr));
    let rx_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { receiver.run(ZstdDecoder::new(PixelFormat::Bgra8), cancel).await })
    };

    let sender = SenderService::new(sender_options(sender_addr, receiver_addr));
    let tx_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sender
                .run(
                    PatternSource::new(Duration::from_millis(15)),
                    ZstdCodec::new(PixelFormat::Bgra8, CodecConfig::default()),
                    cancel,
                )
                .await
        })
    };

    // Wait for the first presentable frame.
    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            handle.frames.changed().await.expect("receiver alive");
            if let Some(frame) = handle.frames.borrow_and_update().clone() {
                return frame;
            }
        }
    })
    .await
    .expect("no frame arrived in time");

    assert_eq!((frame.width, frame.height), (FRAME_SIZE, FRAME_SIZE));
    assert_eq!(frame.data.len(), (FRAME_SIZE * FRAME_SIZE * 4) as usize);

    // Let the loop run long enough for several adaptation ticks and
    // telemetry reports, then check the stream kept flowing.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let stats = *handle.stats.borrow();
    assert!(stats.delivered >= 5, "stats = {stats:?}");

    cancel.cancel();
    tx_task.await.unwrap().unwrap();
    rx_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn sender_outlives_unreachable_peer() {
    // No receiver listening: on localhost every send draws an ICMP
    // port-unreachable, surfaced as ECONNREFUSED on the connected
    // socket. The sender must keep streaming until cancelled.
    let cancel = CancellationToken::new();
    let sender = SenderService::new(sender_options(local_addr(), local_addr()));
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sender
                .run(
                    PatternSource::new(Duration::from_millis(15)),
                    ZstdCodec::new(PixelFormat::Bgra8, CodecConfig::default()),
                    cancel,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!task.is_finished(), "sender died with no receiver present");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

/// Bidirectional UDP relay that drops a fixed share of the data
/// packets flowing towards the receiver. Control traffic is never
/// dropped; real networks lose it too, but the test should exercise
/// FEC and retransmission, not control-plane resilience.
async fn lossy_proxy(
    facing_sender: tokio::net::UdpSocket,
    facing_receiver: tokio::net::UdpSocket,
    receiver_addr: SocketAddr,
    drop_every: u64,
    cancel: CancellationToken,
) {
    let mut from_sender: Option<SocketAddr> = None;
    let mut buf_a = vec![0u8; 65_536];
    let mut buf_b = vec![0u8; 65_536];
    let mut data_seen = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = facing_sender.recv_from(&mut buf_a) => {
                let Ok((n, from)) = received else { break };
                from_sender = Some(from);
                let datagram = &buf_a[..n];
                if datagram.first() == Some(&beam_core::transport::wire::KIND_DATA) {
                    data_seen += 1;
                    if data_seen % drop_every == 0 {
                        continue;
                    }
                }
                let _ = facing_receiver.send_to(datagram, receiver_addr).await;
            }
            received = facing_receiver.recv_from(&mut buf_b) => {
                let Ok((n, _)) = received else { break };
                if let Some(sender) = from_sender {
                    let _ = facing_sender.send_to(&buf_b[..n], sender).await;
                }
            }
        }
    }
}

#[tokio::test]
async fn stream_survives_packet_loss() {
    let receiver_addr = local_addr();
    let proxy_addr = local_addr();
    let cancel = CancellationToken::new();

    let facing_sender = tokio::net::UdpSocket::bind(proxy_addr).await.expect("proxy bind");
    let facing_receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("proxy bind");
    let proxy = tokio::spawn(lossy_proxy(
        facing_sender,
        facing_receiver,
        receiver_addr,
        5, // every fifth data packet vanishes
        cancel.clone(),
    ));

    let (receiver, mut handle) = ReceiverService::new(receiver_options(receiver_addr));
    let rx_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { receiver.run(ZstdDecoder::new(PixelFormat::Bgra8), cancel).await })
    };

    let sender = SenderService::new(sender_options(local_addr(), proxy_addr));
    let tx_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sender
                .run(
                    PatternSource::new(Duration::from_millis(15)),
                    ZstdCodec::new(PixelFormat::Bgra8, CodecConfig::default()),
                    cancel,
                )
                .await
        })
    };

    // Despite the loss, frames must keep reaching presentation via
    // parity recovery, retransmission or frame hold.
    let got = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            handle.frames.changed().await.expect("receiver alive");
            if handle.frames.borrow_and_update().is_some() {
                return;
            }
        }
    })
    .await;
    assert!(got.is_ok(), "no frame survived the lossy link");

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = *handle.stats.borrow();
    assert!(stats.delivered >= 5, "stats = {stats:?}");

    cancel.cancel();
    tx_task.await.unwrap().unwrap();
    rx_task.await.unwrap().unwrap();
    proxy.await.unwrap();
}
