//! Packetization, parity generation and the retransmit store.
//!
//! [`PacketSender`] is sans-IO: it turns encoded frames into ready
//! datagrams and answers control messages with events; the service
//! layer owns the socket. That keeps every branch here testable
//! without binding a port.

use std::collections::HashMap;
use std::time::Instant;

use tracing::trace;

use crate::error::BeamError;
use crate::estimator::PacketEvent;
use crate::encoder::EncodedFrame;
use crate::fec::{self, MAX_SHARDS};
use crate::transport::wire::{ControlMessage, PacketFlags, PacketHeader};

/// Flags live at a fixed offset so retransmits can be re-stamped
/// without re-encoding the datagram.
const FLAGS_OFFSET: usize = 15;

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Shard payload size in bytes. Grows automatically for frames
    /// that would otherwise exceed the shard-count limit.
    pub chunk_size: usize,
    /// Parity floor whenever redundancy is non-zero.
    pub min_parity: usize,
    /// Maximum frames retained for retransmission.
    pub store_limit: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1152,
            min_parity: 1,
            store_limit: 32,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────

/// What the service layer must do in response to a control message.
#[derive(Debug)]
pub enum SenderEvent {
    /// Feed the network estimator.
    Telemetry(PacketEvent),
    /// Put this datagram back on the wire.
    Resend(Vec<u8>),
    /// Receiver lost its reference state; force a keyframe upstream.
    KeyframeRequested,
}

// ── PacketSender ─────────────────────────────────────────────────

struct StoredFrame {
    datagrams: Vec<Vec<u8>>,
    sent_at: Instant,
    deadline: Instant,
}

/// Splits encoded frames into FEC-protected datagrams and serves
/// bounded retransmission out of a per-frame store.
pub struct PacketSender {
    config: SenderConfig,
    redundancy: f64,
    store: HashMap<u64, StoredFrame>,
}

impl PacketSender {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            redundancy: 0.0,
            store: HashMap::new(),
        }
    }

    /// Update the parity overhead ratio. Applied from the next frame.
    pub fn set_redundancy(&mut self, ratio: f64) {
        self.redundancy = ratio.clamp(0.0, 1.0);
    }

    /// Frames currently held for retransmission.
    pub fn stored_frames(&self) -> usize {
        self.store.len()
    }

    /// Split one encoded frame into datagrams, sources then parity.
    ///
    /// Fails with [`BeamError::DeadlineExceeded`] when the frame's
    /// presentation budget is already spent; sending it would only
    /// waste bandwidth the next frame needs.
    pub fn packetize(
        &mut self,
        frame: &EncodedFrame,
        now: Instant,
    ) -> Result<Vec<Vec<u8>>, BeamError> {
        if now >= frame.deadline {
            return Err(BeamError::DeadlineExceeded {
                frame_id: frame.frame_id,
            });
        }
        let len = frame.payload.len();
        if len == 0 {
            return Err(BeamError::InvalidHeader("empty encoded frame"));
        }

        // Keep k small enough that parity always fits in the field.
        let chunk = self.config.chunk_size.max(len.div_ceil(128));
        if chunk > u16::MAX as usize {
            return Err(BeamError::PayloadTooLarge {
                size: len,
                max: 128 * u16::MAX as usize,
            });
        }
        let k = len.div_ceil(chunk);
        let m = if self.redundancy > 0.0 {
            ((k as f64 * self.redundancy).ceil() as usize)
                .max(self.config.min_parity)
                .min(MAX_SHARDS - k)
        } else {
            0
        };

        let mut padded = frame.payload.clone();
        padded.resize(k * chunk, 0);
        let sources: Vec<&[u8]> = padded.chunks(chunk).collect();
        let parity = if m > 0 {
            fec::encode_parity(&sources, m)
        } else {
            Vec::new()
        };

        let ttl_ms = frame
            .deadline
            .saturating_duration_since(now)
            .as_millis()
            .min(u16::MAX as u128) as u16;
        let base_flags = if frame.keyframe {
            PacketFlags::KEYFRAME
        } else {
            PacketFlags::empty()
        };

        let mut datagrams = Vec::with_capacity(k + m);
        let shards = sources
            .iter()
            .copied()
            .map(|s| (s, PacketFlags::empty()))
            .chain(parity.iter().map(|p| (p.as_slice(), PacketFlags::PARITY)));
        for (index, (payload, extra)) in shards.enumerate() {
            let header = PacketHeader {
                frame_id: frame.frame_id,
                shard_index: index as u16,
                source_count: k as u16,
                total_shards: (k + m) as u16,
                flags: base_flags | extra,
                ttl_ms,
                frame_bytes: len as u32,
                width: frame.width as u16,
                height: frame.height as u16,
                payload_len: payload.len() as u16,
            };
            datagrams.push(header.encode(payload));
        }

        trace!(
            frame_id = frame.frame_id,
            sources = k,
            parity = m,
            bytes = len,
            "frame packetized"
        );
        self.remember(frame.frame_id, &datagrams, now, frame.deadline);
        Ok(datagrams)
    }

    /// React to a control message from the receiver.
    pub fn handle_control(&mut self, msg: &ControlMessage, now: Instant) -> Vec<SenderEvent> {
        match msg {
            ControlMessage::Ack {
                frame_id,
                shard_index,
            } => {
                let Some(stored) = self.store.get(frame_id) else {
                    return Vec::new();
                };
                let Some(datagram) = stored.datagrams.get(*shard_index as usize) else {
                    return Vec::new();
                };
                vec![SenderEvent::Telemetry(PacketEvent::Acked {
                    bytes: datagram.len(),
                    rtt: now.saturating_duration_since(stored.sent_at),
                })]
            }
            ControlMessage::RetransmitRequest {
                frame_id, missing, ..
            } => self.retransmit(*frame_id, missing, now),
            ControlMessage::TelemetryReport { lost, .. } => (0..*lost)
                .map(|_| SenderEvent::Telemetry(PacketEvent::Lost))
                .collect(),
            ControlMessage::KeyframeRequest => vec![SenderEvent::KeyframeRequested],
            ControlMessage::Heartbeat => Vec::new(),
        }
    }

    /// Drop frames whose presentation deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        self.store.retain(|_, stored| now < stored.deadline);
    }

    // ── Internal ─────────────────────────────────────────────────

    fn retransmit(&mut self, frame_id: u64, missing: &[u16], now: Instant) -> Vec<SenderEvent> {
        let Some(stored) = self.store.get(&frame_id) else {
            return Vec::new();
        };
        if now >= stored.deadline {
            return Vec::new();
        }
        missing
            .iter()
            .filter_map(|&index| stored.datagrams.get(index as usize))
            .map(|datagram| {
                let mut copy = datagram.clone();
                // Flags are outside the payload checksum.
                copy[FLAGS_OFFSET] |= PacketFlags::RETRANSMIT.bits();
                SenderEvent::Resend(copy)
            })
            .collect()
    }

    fn remember(&mut self, frame_id: u64, datagrams: &[Vec<u8>], now: Instant, deadline: Instant) {
        self.expire(now);
        if self.store.len() >= self.config.store_limit {
            // Evict the oldest frame; it is the least likely to still
            // meet its deadline.
            if let Some(&oldest) = self.store.keys().min() {
                self.store.remove(&oldest);
            }
        }
        self.store.insert(
            frame_id,
            StoredFrame {
                datagrams: datagrams.to_vec(),
                sent_at: now,
                deadline,
            },
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────
