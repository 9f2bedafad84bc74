//! Decoded RTP packet
//!
//! The recovery layer never looks at RTP header bits directly. Ingestion hands
//! it a [`Packet`] whose header fields are already decoded and whose payload
//! is classified as plain media, ULP FEC parity, or an RFC 2198 redundant
//! wrapper.

use crate::config::PayloadTypes;
use crate::red::{BlockKind, RedError, RedundantPayload};
use crate::sequence::compose;
use bytes::Bytes;

/// Maximum CSRC count (4-bit field)
pub const MAX_CSRC_COUNT: u8 = 0x0F;

/// Maximum payload type (7-bit field)
pub const MAX_PAYLOAD_TYPE: u8 = 0x7F;

/// Payload classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    /// Plain media payload
    Media,
    /// ULP FEC parity payload
    FecParity,
    /// RFC 2198 wrapper with decoded blocks
    Redundant(RedundantPayload),
}

/// Decoded RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Synchronization source
    pub ssrc: u32,
    /// Sequence number as carried on the wire
    pub seq: u16,
    /// Number of sequence number wraps preceding this packet
    pub cycles: u64,
    /// Marker bit
    pub marker: bool,
    /// Padding bit
    pub padding: bool,
    /// Header extension bit
    pub extension: bool,
    /// CSRC count (4 bits)
    pub csrc_count: u8,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// RTP timestamp
    pub timestamp: u32,
    /// Payload bytes
    pub payload: Bytes,
    /// Payload classification
    pub kind: PacketKind,
    /// Local arrival time in milliseconds
    pub arrival_ms: u64,
    /// Whether this packet was reconstructed from parity data
    pub recovered: bool,
}

impl Packet {
    /// Create a new media packet
    pub fn new(ssrc: u32, seq: u16, payload_type: u8, timestamp: u32, payload: Bytes) -> Self {
        Packet {
            ssrc,
            seq,
            cycles: 0,
            marker: false,
            padding: false,
            extension: false,
            csrc_count: 0,
            payload_type: payload_type & MAX_PAYLOAD_TYPE,
            timestamp,
            payload,
            kind: PacketKind::Media,
            arrival_ms: 0,
            recovered: false,
        }
    }

    /// Extended sequence number
    #[inline]
    pub fn ext_seq(&self) -> u64 {
        compose(self.cycles, self.seq)
    }

    /// Set sequence number and cycles from an extended sequence number
    pub fn set_ext_seq(&mut self, extended: u64) {
        self.seq = extended as u16;
        self.cycles = extended >> 16;
    }

    /// Builder-style variant of [`Packet::set_ext_seq`]
    pub fn with_ext_seq(mut self, extended: u64) -> Self {
        self.set_ext_seq(extended);
        self
    }

    /// Set the marker bit
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Set the payload classification
    pub fn with_kind(mut self, kind: PacketKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the arrival time
    pub fn with_arrival(mut self, arrival_ms: u64) -> Self {
        self.arrival_ms = arrival_ms;
        self
    }

    /// Check if this packet carries plain media
    pub fn is_media(&self) -> bool {
        matches!(self.kind, PacketKind::Media)
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Copy of this packet's header carrying a different media payload
    ///
    /// Used to turn the primary block of a redundant wrapper into a plain
    /// media packet.
    pub fn with_media_payload(&self, payload_type: u8, payload: Bytes) -> Packet {
        Packet {
            payload_type: payload_type & MAX_PAYLOAD_TYPE,
            payload,
            kind: PacketKind::Media,
            ..self.clone()
        }
    }

    /// Classify the payload according to the negotiated payload types
    ///
    /// Redundant wrappers are decoded one level deep; nested wrappers are left
    /// as [`BlockKind::Redundant`] blocks.
    pub fn classify(mut self, types: &PayloadTypes) -> Result<Self, RedError> {
        self.kind = match types.classify(self.payload_type) {
            BlockKind::Media => PacketKind::Media,
            BlockKind::FecParity => PacketKind::FecParity,
            BlockKind::Redundant => {
                PacketKind::Redundant(RedundantPayload::parse(&self.payload, types)?)
            }
        };
        Ok(self)
    }
}
