//! Frame reassembly, NACK scheduling and loss accounting.
//!
//! [`FrameReassembler`] is the receive-side mirror of the packet
//! sender and equally sans-IO: datagrams go in, events come out, and
//! the service layer moves bytes. Time is always passed in explicitly
//! so deadline and NACK behaviour can be tested without sleeping.
//!
//! Delivery order is non-decreasing by frame id. A frame that
//! completes after a newer frame was already delivered is discarded,
//! never presented out of order.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::BeamError;
use crate::fec;
use crate::transport::wire::{ControlMessage, PacketFlags, PacketHeader};

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// How long a frame may sit incomplete before one retransmission
    /// round is requested.
    pub nack_delay: Duration,
    /// Frames tracked concurrently; the oldest is abandoned beyond
    /// this.
    pub max_pending: usize,
    /// Telemetry report cadence.
    pub report_interval: Duration,
    /// Consecutive irrecoverable frames before a keyframe is demanded.
    pub keyframe_request_after: u32,
    /// Resolved frame ids remembered to suppress stragglers.
    pub resolved_memory: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            nack_delay: Duration::from_millis(20),
            max_pending: 16,
            report_interval: Duration::from_millis(200),
            keyframe_request_after: 3,
            resolved_memory: 128,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────

/// A fully reassembled encoded frame.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub keyframe: bool,
    /// Local presentation deadline, derived from the wire TTL.
    pub deadline: Instant,
    pub payload: Vec<u8>,
}

/// What the service layer must do in response to received datagrams
/// or the passage of time.
#[derive(Debug)]
pub enum ReceiverEvent {
    /// Hand the frame to the recovery stage.
    Deliver(AssembledFrame),
    /// The frame can no longer be completed in time.
    Expired {
        frame_id: u64,
        keyframe: bool,
        /// Contiguous prefix of source data, when any arrived. The
        /// recovery stage may still attempt a partial decode.
        partial: Option<AssembledFrame>,
    },
    /// A complete frame arrived after a newer one was delivered.
    DiscardedLate { frame_id: u64 },
    /// Put this control message on the wire.
    Send(ControlMessage),
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub delivered: u64,
    pub expired: u64,
    pub discarded_late: u64,
}

// ── FrameReassembler ─────────────────────────────────────────────

struct PendingFrame {
    source_count: usize,
    width: u32,
    height: u32,
    keyframe: bool,
    frame_bytes: usize,
    chunk: usize,
    shards: Vec<Option<Vec<u8>>>,
    received: usize,
    first_seen: Instant,
    deadline: Instant,
    nacked: bool,
}

impl PendingFrame {
    fn missing_indices(&self) -> Vec<u16> {
        self.shards
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.is_none().then_some(i as u16))
            .collect()
    }

    /// Contiguous prefix of source shards, truncated to frame bytes.
    fn partial_payload(&self) -> Option<Vec<u8>> {
        let first = self.shards[..self.source_count]
            .iter()
            .take_while(|s| s.is_some())
            .count();
        if first == 0 {
            return None;
        }
        let mut out = Vec::with_capacity(first * self.chunk);
        for shard in self.shards[..first].iter().flatten() {
            out.extend_from_slice(shard);
        }
        out.truncate(self.frame_bytes);
        Some(out)
    }
}

/// Reassembles frames out of shards, schedules NACKs and produces
/// telemetry reports.
pub struct FrameReassembler {
    config: ReassemblyConfig,
    pending: HashMap<u64, PendingFrame>,
    /// Highest delivered frame id; anything at or below is late.
    delivered_watermark: u64,
    resolved: VecDeque<u64>,
    consecutive_expired: u32,
    stats: ReassemblyStats,
    // Report-interval counters.
    report_received: u32,
    report_lost: u32,
    report_bytes: u64,
    last_report: Option<Instant>,
}

impl FrameReassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            delivered_watermark: 0,
            resolved: VecDeque::new(),
            consecutive_expired: 0,
            stats: ReassemblyStats::default(),
            report_received: 0,
            report_lost: 0,
            report_bytes: 0,
            last_report: None,
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Ingest one data datagram.
    pub fn handle_packet(
        &mut self,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Vec<ReceiverEvent>, BeamError> {
        let (header, payload) = PacketHeader::decode(datagram)?;
        let mut events = Vec::new();

        // Every shard that arrives intact is acknowledged; acks drive
        // the sender's RTT and bandwidth estimates even for frames we
        // no longer want.
        events.push(ReceiverEvent::Send(ControlMessage::Ack {
            frame_id: header.frame_id,
            shard_index: header.shard_index,
        }));
        self.report_received += 1;
        self.report_bytes += datagram.len() as u64;

        if header.frame_id <= self.delivered_watermark
            || self.resolved.contains(&header.frame_id)
        {
            trace!(frame_id = header.frame_id, "straggler shard dropped");
            return Ok(events);
        }

        let frame = self
            .pending
            .entry(header.frame_id)
            .or_insert_with(|| PendingFrame {
                source_count: header.source_count as usize,
                width: header.width as u32,
                height: header.height as u32,
                keyframe: header.flags.contains(PacketFlags::KEYFRAME),
                frame_bytes: header.frame_bytes as usize,
                chunk: header.payload_len as usize,
                shards: vec![None; header.total_shards as usize],
                received: 0,
                first_seen: now,
                deadline: now + Duration::from_millis(header.ttl_ms as u64),
                nacked: false,
            });
        if header.total_shards as usize != frame.shards.len()
            || header.source_count as usize != frame.source_count
            || header.payload_len as usize != frame.chunk
        {
            return Err(BeamError::InvalidHeader(
                "shard layout disagrees with earlier shards of the frame",
            ));
        }
        let slot = &mut frame.shards[header.shard_index as usize];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            frame.received += 1;
        }

        if frame.received >= frame.source_count {
            let frame_id = header.frame_id;
            events.extend(self.complete(frame_id, now)?);
        }
        events.extend(self.enforce_pending_bound());
        Ok(events)
    }

    /// Advance time: expire frames, schedule NACKs, emit telemetry.
    pub fn poll(&mut self, now: Instant) -> Vec<ReceiverEvent> {
        let mut events = Vec::new();

        let mut expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, f)| now >= f.deadline)
            .map(|(&id, _)| id)
            .collect();
        expired.sort_unstable();
        for id in expired {
            events.extend(self.expire_frame(id));
        }
        events.extend(self.keyframe_demand());

        // One retransmission round per frame, only while the deadline
        // still leaves room for the reply.
        let mut nacks: Vec<(u64, Vec<u16>, u16)> = Vec::new();
        for (&id, frame) in self.pending.iter_mut() {
            let waited = now.saturating_duration_since(frame.first_seen);
            if frame.nacked || waited < self.config.nack_delay || now >= frame.deadline {
                continue;
            }
            frame.nacked = true;
            let budget = frame
                .deadline
                .saturating_duration_since(now)
                .as_millis()
                .min(u16::MAX as u128) as u16;
            nacks.push((id, frame.missing_indices(), budget));
        }
        nacks.sort_unstable_by_key(|(id, _, _)| *id);
        for (frame_id, missing, deadline_ms) in nacks {
            if !missing.is_empty() {
                events.push(ReceiverEvent::Send(ControlMessage::RetransmitRequest {
                    frame_id,
                    missing,
                    deadline_ms,
                }));
            }
        }

        if let Some(report) = self.telemetry_report(now) {
            events.push(ReceiverEvent::Send(report));
        }
        events
    }

    // ── Internal ─────────────────────────────────────────────────

    fn complete(&mut self, frame_id: u64, now: Instant) -> Result<Vec<ReceiverEvent>, BeamError> {
        let mut frame = self
            .pending
            .remove(&frame_id)
            .ok_or(BeamError::InvalidHeader("completing unknown frame"))?;
        self.report_lost += (frame.shards.len() - frame.received) as u32;
        self.remember_resolved(frame_id);

        if now > frame.deadline {
            self.stats.discarded_late += 1;
            return Ok(vec![ReceiverEvent::DiscardedLate { frame_id }]);
        }

        fec::reconstruct(frame.source_count, &mut frame.shards)?;
        let mut payload = Vec::with_capacity(frame.source_count * frame.chunk);
        for shard in frame.shards[..frame.source_count].iter().flatten() {
            payload.extend_from_slice(shard);
        }
        payload.truncate(frame.frame_bytes);

        self.delivered_watermark = frame_id;
        self.consecutive_expired = 0;
        self.stats.delivered += 1;

        let mut events = vec![ReceiverEvent::Deliver(AssembledFrame {
            frame_id,
            width: frame.width,
            height: frame.height,
            keyframe: frame.keyframe,
            deadline: frame.deadline,
            payload,
        })];

        // Older frames can no longer be presented in order.
        let mut stale: Vec<u64> = self
            .pending
            .keys()
            .copied()
            .filter(|&id| id < frame_id)
            .collect();
        stale.sort_unstable();
        for id in stale {
            events.extend(self.expire_frame(id));
        }
        events.extend(self.keyframe_demand());
        Ok(events)
    }

    fn expire_frame(&mut self, frame_id: u64) -> Vec<ReceiverEvent> {
        let Some(frame) = self.pending.remove(&frame_id) else {
            return Vec::new();
        };
        self.report_lost += (frame.shards.len() - frame.received) as u32;
        self.remember_resolved(frame_id);
        self.stats.expired += 1;
        self.consecutive_expired += 1;

        let partial = frame.partial_payload().map(|payload| AssembledFrame {
            frame_id,
            width: frame.width,
            height: frame.height,
            keyframe: frame.keyframe,
            deadline: frame.deadline,
            payload,
        });
        vec![ReceiverEvent::Expired {
            frame_id,
            keyframe: frame.keyframe,
            partial,
        }]
    }

    fn keyframe_demand(&mut self) -> Option<ReceiverEvent> {
        if self.consecutive_expired >= self.config.keyframe_request_after {
            self.consecutive_expired = 0;
            Some(ReceiverEvent::Send(ControlMessage::KeyframeRequest))
        } else {
            None
        }
    }

    fn enforce_pending_bound(&mut self) -> Vec<ReceiverEvent> {
        let mut events = Vec::new();
        while self.pending.len() > self.config.max_pending {
            let Some(&oldest) = self.pending.keys().min() else {
                break;
            };
            events.extend(self.expire_frame(oldest));
        }
        events
    }

    fn remember_resolved(&mut self, frame_id: u64) {
        self.resolved.push_back(frame_id);
        while self.resolved.len() > self.config.resolved_memory {
            self.resolved.pop_front();
        }
    }

    fn telemetry_report(&mut self, now: Instant) -> Option<ControlMessage> {
        let last = *self.last_report.get_or_insert(now);
        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.config.report_interval {
            return None;
        }
        self.last_report = Some(now);
        let report = ControlMessage::TelemetryReport {
            received: self.report_received,
            lost: self.report_lost,
            bytes: self.report_bytes,
            interval_ms: elapsed.as_millis().min(u32::MAX as u128) as u32,
        };
        self.report_received = 0;
        self.report_lost = 0;
        self.report_bytes = 0;
        Some(report)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncodedFrame;
    use crate::transport::send::{PacketSender, SenderConfig};

    fn sender(redundancy: f64) -> PacketSender {
        let mut s = PacketSender::new(SenderConfig::default());
        s.set_redundancy(redundancy);
        s
    }

    fn encoded(frame_id: u64, bytes: usize, now: Instant) -> EncodedFrame {
        EncodedFrame {
            frame_id,
            width: 320,
            height: 240,
            keyframe: frame_id == 1,
            captured_at: now,
            deadline: now + Duration::from_millis(100),
            payload: (0..bytes).map(|i| (i * 7 % 256) as u8).collect(),
        }
    }

    fn reassembler() -> FrameReassembler {
        FrameReassembler::new(ReassemblyConfig::default())
    }

    fn delivered(events: &[ReceiverEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                ReceiverEvent::Deliver(f) => Some(f.frame_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn complete_frame_is_delivered_intact() {
        let now = Instant::now();
        let mut tx = sender(0.2);
        let mut rx = reassembler();
        let frame = encoded(1, 3000, now);
        let datagrams = tx.packetize(&frame, now).unwrap();

        let mut all = Vec::new();
        for d in &datagrams {
            all.extend(rx.handle_packet(d, now).unwrap());
        }
        assert_eq!(delivered(&all), [1]);
        let ReceiverEvent::Deliver(out) = all
            .iter()
            .find(|e| matches!(e, ReceiverEvent::Deliver(_)))
            .unwrap()
        else {
            unreachable!()
        };
        assert_eq!(out.payload, frame.payload);
        assert!(out.keyframe);
        assert_eq!((out.width, out.height), (320, 240));
    }

    #[test]
    fn parity_covers_lost_sources_without_retransmission() {
        let now = Instant::now();
        let mut tx = sender(0.5);
        let mut rx = reassembler();
        let frame = encoded(2, 4000, now);
        // 4 sources + 2 parity; drop two source shards.
        let datagrams = tx.packetize(&frame, now).unwrap();
        assert_eq!(datagrams.len(), 6);

        let mut all = Vec::new();
        for (i, d) in datagrams.iter().enumerate() {
            if i == 0 || i == 2 {
                continue;
            }
            all.extend(rx.handle_packet(d, now).unwrap());
        }
        assert_eq!(delivered(&all), [2]);
        let ReceiverEvent::Deliver(out) = all
            .iter()
            .find(|e| matches!(e, ReceiverEvent::Deliver(_)))
            .unwrap()
        else {
            unreachable!()
        };
        assert_eq!(out.payload, frame.payload);
    }

    #[test]
    fn every_shard_is_acked() {
        let now = Instant::now();
        let mut tx = sender(0.0);
        let mut rx = reassembler();
        let datagrams = tx.packetize(&encoded(1, 3000, now), now).unwrap();

        let events = rx.handle_packet(&datagrams[0], now).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            ReceiverEvent::Send(ControlMessage::Ack {
                frame_id: 1,
                shard_index: 0
            })
        )));
    }

    #[test]
    fn nack_lists_missing_shards_once() {
        let now = Instant::now();
        let mut tx = sender(0.0);
        let mut rx = reassembler();
        let datagrams = tx.packetize(&encoded(1, 4000, now), now).unwrap();

        // Deliver only the first of four shards.
        let _ = rx.handle_packet(&datagrams[0], now).unwrap();

        // Too early for a NACK.
        assert!(
            rx.poll(now + Duration::from_millis(5))
                .iter()
                .all(|e| !matches!(e, ReceiverEvent::Send(ControlMessage::RetransmitRequest { .. })))
        );

        let events = rx.poll(now + Duration::from_millis(30));
        let nack = events
            .iter()
            .find_map(|e| match e {
                ReceiverEvent::Send(ControlMessage::RetransmitRequest {
                    frame_id, missing, ..
                }) => Some((*frame_id, missing.clone())),
                _ => None,
            })
            .expect("expected a retransmit request");
        assert_eq!(nack, (1, vec![1, 2, 3]));

        // Only one round per frame.
        let again = rx.poll(now + Duration::from_millis(60));
        assert!(
            again
                .iter()
                .all(|e| !matches!(e, ReceiverEvent::Send(ControlMessage::RetransmitRequest { .. })))
        );
    }

    #[test]
    fn deadline_expiry_yields_partial_prefix() {
        let now = Instant::now();
        let mut tx = sender(0.0);
        let mut rx = reassembler();
        let frame = encoded(3, 4000, now);
        let datagrams = tx.packetize(&frame, now).unwrap();

        let _ = rx.handle_packet(&datagrams[0], now).unwrap();
        let _ = rx.handle_packet(&datagrams[1], now).unwrap();

        let events = rx.poll(now + Duration::from_millis(150));
        let (id, partial) = events
            .iter()
            .find_map(|e| match e {
                ReceiverEvent::Expired {
                    frame_id, partial, ..
                } => Some((*frame_id, partial.clone())),
                _ => None,
            })
            .expect("expected expiry");
        assert_eq!(id, 3);
        let partial = partial.unwrap();
        assert_eq!(partial.payload, frame.payload[..partial.payload.len()]);
        assert!(!partial.payload.is_empty());
        assert_eq!(rx.stats().expired, 1);
    }

    #[test]
    fn delivery_order_is_non_decreasing() {
        let now = Instant::now();
        let mut tx = sender(0.0);
        let mut rx = reassembler();
        let f1 = encoded(1, 1000, now);
        let f2 = encoded(2, 1000, now);
        let d1 = tx.packetize(&f1, now).unwrap();
        let d2 = tx.packetize(&f2, now).unwrap();

        // Frame 2 completes first.
        let mut all = Vec::new();
        for d in &d2 {
            all.extend(rx.handle_packet(d, now).unwrap());
        }
        assert_eq!(delivered(&all), [2]);

        // Frame 1 arriving afterwards is dropped as a straggler, not
        // delivered out of order.
        let mut late = Vec::new();
        for d in &d1 {
            late.extend(rx.handle_packet(d, now).unwrap());
        }
        assert!(delivered(&late).is_empty());
    }

    #[test]
    fn repeated_expiry_demands_keyframe() {
        let now = Instant::now();
        let mut tx = sender(0.0);
        let mut rx = reassembler();

        for id in 1..=3 {
            let datagrams = tx.packetize(&encoded(id, 3000, now), now).unwrap();
            // Only one shard of three arrives.
            let _ = rx.handle_packet(&datagrams[0], now).unwrap();
        }
        let events = rx.poll(now + Duration::from_millis(150));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ReceiverEvent::Send(ControlMessage::KeyframeRequest)))
        );
    }

    #[test]
    fn telemetry_report_counts_received_and_lost() {
        let now = Instant::now();
        let mut tx = sender(0.0);
        let mut rx = reassembler();
        let datagrams = tx.packetize(&encoded(1, 3000, now), now).unwrap();
        assert_eq!(datagrams.len(), 3);

        let _ = rx.handle_packet(&datagrams[0], now).unwrap();
        let _ = rx.poll(now); // arms the report clock
        let _ = rx.handle_packet(&datagrams[1], now).unwrap();

        let events = rx.poll(now + Duration::from_millis(250));
        let report = events
            .iter()
            .find_map(|e| match e {
                ReceiverEvent::Send(ControlMessage::TelemetryReport {
                    received, lost, ..
                }) => Some((*received, *lost)),
                _ => None,
            })
            .expect("expected telemetry report");
        // Two shards arrived; the frame expired missing one.
        assert_eq!(report, (2, 1));
    }

    #[test]
    fn corrupted_datagram_is_rejected() {
        let now = Instant::now();
        let mut tx = sender(0.0);
        let mut rx = reassembler();
        let mut datagrams = tx.packetize(&encoded(1, 1000, now), now).unwrap();
        let last = datagrams[0].len() - 1;
        datagrams[0][last] ^= 0x01;
        assert!(rx.handle_packet(&datagrams[0], now).is_err());
    }
}
