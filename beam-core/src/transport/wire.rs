//! Datagram wire format.
//!
//! Two datagram kinds share the socket. Data packets carry one shard
//! of an encoded frame under a fixed 32-byte header, laid out manually
//! in little-endian so the format is stable across compiler versions.
//! Control messages flow the other way (and heartbeats both ways) as
//! bincode-encoded enums behind a one-byte discriminant.
//!
//! Layout of a data packet:
//!
//! ```text
//! [0]      kind (0 = data, 1 = control)
//! [1..9]   frame_id          u64
//! [9..11]  shard_index       u16   position within the frame
//! [11..13] source_count      u16   k, shards needed to reconstruct
//! [13..15] total_shards      u16   k + m, sources then parity
//! [15]     flags             u8
//! [16..18] ttl_ms            u16   presentation budget remaining
//! [18..22] frame_bytes       u32   encoded frame size before padding
//! [22..24] width             u16
//! [24..26] height            u16
//! [26..28] payload_len       u16
//! [28..32] checksum          u32   truncated blake3 of the payload
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::BeamError;

/// Data packet header size on the wire, including the kind byte.
pub const HEADER_LEN: usize = 32;

/// Datagram kind discriminants.
pub const KIND_DATA: u8 = 0;
pub const KIND_CONTROL: u8 = 1;

bitflags! {
    /// Per-packet flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        /// The frame this shard belongs to is a keyframe.
        const KEYFRAME = 0b0000_0001;
        /// This shard is parity, not source data.
        const PARITY = 0b0000_0010;
        /// This shard was sent in response to a retransmit request.
        const RETRANSMIT = 0b0000_0100;
    }
}

// ── PacketHeader ─────────────────────────────────────────────────

/// Parsed header of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u64,
    pub shard_index: u16,
    pub source_count: u16,
    pub total_shards: u16,
    pub flags: PacketFlags,
    /// Milliseconds of presentation budget remaining at send time.
    pub ttl_ms: u16,
    /// Byte length of the encoded frame before shard padding.
    pub frame_bytes: u32,
    pub width: u16,
    pub height: u16,
    pub payload_len: u16,
}

impl PacketHeader {
    /// Serialize header and payload into one datagram.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        debug_assert_eq!(payload.len(), self.payload_len as usize);
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.push(KIND_DATA);
        buf.extend_from_slice(&self.frame_id.to_le_bytes());
        buf.extend_from_slice(&self.shard_index.to_le_bytes());
        buf.extend_from_slice(&self.source_count.to_le_bytes());
        buf.extend_from_slice(&self.total_shards.to_le_bytes());
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.ttl_ms.to_le_bytes());
        buf.extend_from_slice(&self.frame_bytes.to_le_bytes());
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.payload_len.to_le_bytes());
        buf.extend_from_slice(&checksum(payload).to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Parse a data datagram, verifying length and checksum.
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), BeamError> {
        if datagram.len() < HEADER_LEN {
            return Err(BeamError::PacketTooShort {
                expected: HEADER_LEN,
                actual: datagram.len(),
            });
        }
        if datagram[0] != KIND_DATA {
            return Err(BeamError::InvalidHeader("not a data packet"));
        }

        let u16_at = |off: usize| u16::from_le_bytes([datagram[off], datagram[off + 1]]);
        let header = PacketHeader {
            frame_id: u64::from_le_bytes(datagram[1..9].try_into().unwrap()),
            shard_index: u16_at(9),
            source_count: u16_at(11),
            total_shards: u16_at(13),
            flags: PacketFlags::from_bits_truncate(datagram[15]),
            ttl_ms: u16_at(16),
            frame_bytes: u32::from_le_bytes(datagram[18..22].try_into().unwrap()),
            width: u16_at(22),
            height: u16_at(24),
            payload_len: u16_at(26),
        };
        let expected_sum = u32::from_le_bytes(datagram[28..32].try_into().unwrap());

        if header.source_count == 0 || header.total_shards < header.source_count {
            return Err(BeamError::InvalidHeader("inconsistent shard counts"));
        }
        // The erasure code works in GF(2^8); a shard count past the
        // field size can only come from corruption or a hostile peer.
        if header.total_shards as usize > crate::fec::MAX_SHARDS {
            return Err(BeamError::InvalidHeader("shard count exceeds field size"));
        }
        if header.shard_index >= header.total_shards {
            return Err(BeamError::InvalidHeader("shard index out of range"));
        }
        let payload = &datagram[HEADER_LEN..];
        if payload.len() != header.payload_len as usize {
            return Err(BeamError::PacketTooShort {
                expected: HEADER_LEN + header.payload_len as usize,
                actual: datagram.len(),
            });
        }
        if checksum(payload) != expected_sum {
            return Err(BeamError::ChecksumMismatch);
        }
        Ok((header, payload))
    }
}

/// Truncated blake3 of the payload. Catches corruption and stale
/// buffers; cryptographic integrity is out of scope here.
pub fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    u32::from_le_bytes(hash.as_bytes()[..4].try_into().unwrap())
}

// ── ControlMessage ───────────────────────────────────────────────

/// Receiver-to-sender signalling (heartbeats flow both ways).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Acknowledges receipt of one shard; drives the sender's RTT and
    /// bandwidth estimates.
    Ack { frame_id: u64, shard_index: u16 },
    /// Selective retransmission request for shards still missing.
    RetransmitRequest {
        frame_id: u64,
        missing: Vec<u16>,
        /// Presentation budget left when the request was issued.
        deadline_ms: u16,
    },
    /// Periodic loss accounting over the last report interval.
    TelemetryReport {
        received: u32,
        lost: u32,
        bytes: u64,
        interval_ms: u32,
    },
    /// The receiver lost its reference state and needs a keyframe.
    KeyframeRequest,
    /// Keepalive.
    Heartbeat,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, BeamError> {
        let body = bincode::serialize(self)?;
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(KIND_CONTROL);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, BeamError> {
        match datagram.first() {
            Some(&KIND_CONTROL) => Ok(bincode::deserialize(&datagram[1..])?),
            Some(_) => Err(BeamError::InvalidHeader("not a control packet")),
            None => Err(BeamError::PacketTooShort {
                expected: 1,
                actual: 0,
            }),
        }
    }
}

/// Peek at a datagram's kind without parsing it.
pub fn datagram_kind(datagram: &[u8]) -> Option<u8> {
    datagram.first().copied()
}

// ── Tests ────────────────────────────────────────────────────────
