//! ULP FEC (RFC 5109) parity handling and single-loss recovery
//!
//! A parity packet is the XOR of a set of media packets, selected by a
//! protection mask relative to a base sequence number. When every protected
//! packet but one is on hand, XOR-ing them back out of the parity yields the
//! missing packet's header fields and payload.
//!
//! Wire layout consumed (level 0 only, short mask):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |E|L|P|X|   CC  |M| PT recovery |            SN base            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          TS recovery                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        length recovery        |       protection length       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             mask              |   level 0 payload ...         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::config::{PayloadTypes, RecoveryConfig};
use crate::packet::{Packet, PacketKind, MAX_CSRC_COUNT, MAX_PAYLOAD_TYPE};
use crate::red::{BlockKind, RedBlock, RedundantPayload};
use crate::sequence::unwrap_near;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Size of the FEC header
pub const FEC_HEADER_SIZE: usize = 10;

/// Size of the level 0 header with a short mask
pub const LEVEL_HEADER_SIZE: usize = 4;

/// Number of sequence numbers a parity entry can describe, and the width of
/// the retention window behind the newest media packet
pub const PROTECTION_WINDOW: u64 = 64;

/// Number of mask bits carried by a short (L = 0) wire mask
pub const SHORT_MASK_BITS: u64 = 16;

/// FEC parsing and encoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FecError {
    #[error("Truncated FEC packet: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("FEC extension flag set")]
    ExtensionFlagSet,

    #[error("Long-mask FEC packets are not supported")]
    LongMaskUnsupported,

    #[error("FEC protection length too large: {size} bytes (max {mtu})")]
    ProtectionTooLarge { size: usize, mtu: usize },

    #[error("FEC packet protects no media packets")]
    EmptyProtectedSet,

    #[error("Protected packet {seq} is outside the protection window of base {base}")]
    OutOfWindow { base: u64, seq: u64 },

    #[error("Payload of {size} bytes does not fit the 16-bit length field")]
    PayloadTooLarge { size: usize },
}

/// Header fields XOR-combined across a protected set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryFields {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub timestamp: u32,
    /// Payload length
    pub length: u16,
}

impl RecoveryFields {
    /// Fields of a single media packet
    pub fn of(packet: &Packet) -> Result<Self, FecError> {
        let length = u16::try_from(packet.payload.len()).map_err(|_| FecError::PayloadTooLarge {
            size: packet.payload.len(),
        })?;
        Ok(RecoveryFields {
            padding: packet.padding,
            extension: packet.extension,
            csrc_count: packet.csrc_count & MAX_CSRC_COUNT,
            marker: packet.marker,
            payload_type: packet.payload_type & MAX_PAYLOAD_TYPE,
            timestamp: packet.timestamp,
            length,
        })
    }

    /// XOR `other` into `self`
    pub fn xor(&mut self, other: &RecoveryFields) {
        self.padding ^= other.padding;
        self.extension ^= other.extension;
        self.csrc_count ^= other.csrc_count;
        self.marker ^= other.marker;
        self.payload_type ^= other.payload_type;
        self.timestamp ^= other.timestamp;
        self.length ^= other.length;
    }
}

/// XOR the common prefix of `src` into `dst`
fn xor_prefix(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// ULP FEC parity entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecParity {
    /// Base sequence number as carried on the wire
    pub base_seq: u16,
    /// Bit `i` set means the packet at `base + i` is protected
    pub mask: u64,
    /// Pre-XORed header fields of the protected set
    pub recovery: RecoveryFields,
    /// Level 0 parity payload
    pub payload: Bytes,
}

impl FecParity {
    /// Parse a ULP FEC payload
    pub fn parse(data: &[u8]) -> Result<Self, FecError> {
        const MIN_SIZE: usize = FEC_HEADER_SIZE + LEVEL_HEADER_SIZE;

        if data.len() < MIN_SIZE {
            return Err(FecError::Truncated {
                expected: MIN_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let flags = buf.get_u8();
        let second = buf.get_u8();

        if flags & 0x80 != 0 {
            return Err(FecError::ExtensionFlagSet);
        }
        if flags & 0x40 != 0 {
            return Err(FecError::LongMaskUnsupported);
        }

        let base_seq = buf.get_u16();
        let timestamp = buf.get_u32();
        let length = buf.get_u16();
        let protection_length = buf.get_u16() as usize;
        let wire_mask = buf.get_u16();

        if buf.remaining() < protection_length {
            return Err(FecError::Truncated {
                expected: MIN_SIZE + protection_length,
                actual: data.len(),
            });
        }

        // The wire mask's most significant bit is the base packet
        let mask = u64::from(wire_mask.reverse_bits());
        if mask == 0 {
            return Err(FecError::EmptyProtectedSet);
        }

        Ok(FecParity {
            base_seq,
            mask,
            recovery: RecoveryFields {
                padding: flags & 0x20 != 0,
                extension: flags & 0x10 != 0,
                csrc_count: flags & 0x0F,
                marker: second & 0x80 != 0,
                payload_type: second & 0x7F,
                timestamp,
                length,
            },
            payload: Bytes::copy_from_slice(&buf[..protection_length]),
        })
    }

    /// Serialize to the short-mask wire layout
    pub fn to_bytes(&self) -> Result<Bytes, FecError> {
        if self.mask >> SHORT_MASK_BITS != 0 {
            return Err(FecError::LongMaskUnsupported);
        }
        if self.payload.len() > usize::from(u16::MAX) {
            return Err(FecError::ProtectionTooLarge {
                size: self.payload.len(),
                mtu: usize::from(u16::MAX),
            });
        }

        let r = &self.recovery;
        let mut buf =
            BytesMut::with_capacity(FEC_HEADER_SIZE + LEVEL_HEADER_SIZE + self.payload.len());

        let mut flags = r.csrc_count & MAX_CSRC_COUNT;
        if r.padding {
            flags |= 0x20;
        }
        if r.extension {
            flags |= 0x10;
        }
        buf.put_u8(flags);
        buf.put_u8(((r.marker as u8) << 7) | (r.payload_type & MAX_PAYLOAD_TYPE));
        buf.put_u16(self.base_seq);
        buf.put_u32(r.timestamp);
        buf.put_u16(r.length);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u16((self.mask as u16).reverse_bits());
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Build a parity entry protecting `packets`
    ///
    /// The base is the lowest extended sequence number in the set and the
    /// parity payload covers the shortest protected payload.
    pub fn protect(packets: &[&Packet]) -> Result<Self, FecError> {
        let base = packets
            .iter()
            .map(|p| p.ext_seq())
            .min()
            .ok_or(FecError::EmptyProtectedSet)?;
        let protection_length = packets.iter().map(|p| p.payload.len()).min().unwrap_or(0);

        let mut mask = 0u64;
        let mut recovery = RecoveryFields::default();
        let mut payload = BytesMut::zeroed(protection_length);

        for packet in packets {
            let offset = packet.ext_seq() - base;
            if offset >= PROTECTION_WINDOW {
                return Err(FecError::OutOfWindow {
                    base,
                    seq: packet.ext_seq(),
                });
            }
            mask |= 1 << offset;
            recovery.xor(&RecoveryFields::of(packet)?);
            xor_prefix(&mut payload, &packet.payload);
        }

        Ok(FecParity {
            base_seq: base as u16,
            mask,
            recovery,
            payload: payload.freeze(),
        })
    }

    /// Check if the packet `offset` positions after the base is protected
    #[inline]
    pub fn protects(&self, offset: u64) -> bool {
        offset < PROTECTION_WINDOW && self.mask & (1 << offset) != 0
    }

    /// Number of protected packets
    pub fn protected_count(&self) -> u32 {
        self.mask.count_ones()
    }
}

/// FEC decoder statistics
#[derive(Debug, Clone, Default)]
pub struct FecStats {
    /// Media packets retained
    pub media_admitted: u64,
    /// Media packets ignored as duplicates
    pub duplicates: u64,
    /// Parity entries retained
    pub parity_admitted: u64,
    /// Parity payloads dropped as malformed or oversized
    pub parity_dropped: u64,
    /// Media packets too far behind the newest to retain
    pub stale: u64,
    /// Packets reconstructed
    pub recovered: u64,
}

/// Position of a block inside a (possibly nested) redundant wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Primary,
    Secondary,
}

/// Single-parity recovery engine
///
/// Retains recent media packets and parity entries, both keyed by extended
/// sequence number and windowed to [`PROTECTION_WINDOW`] positions behind the
/// newest media packet.
pub struct FecDecoder {
    /// Retained media packets
    medias: BTreeMap<u64, Packet>,
    /// Retained parity entries, keyed by extended base sequence
    codes: BTreeMap<u64, Vec<FecParity>>,
    /// Number of entries across all `codes` buckets
    parity_count: usize,
    /// Payload types used to decode nested wrappers
    payload_types: PayloadTypes,
    /// Maximum parity and reconstructed payload length
    mtu: usize,
    /// Upper bound on `parity_count`
    max_parity_entries: usize,
    stats: FecStats,
}

impl FecDecoder {
    /// Create a decoder from a stream configuration
    pub fn new(config: &RecoveryConfig) -> Self {
        FecDecoder {
            medias: BTreeMap::new(),
            codes: BTreeMap::new(),
            parity_count: 0,
            payload_types: config.payload_types,
            mtu: config.mtu,
            max_parity_entries: config.max_parity_entries.max(1),
            stats: FecStats::default(),
        }
    }

    /// Admit a packet
    ///
    /// Returns `true` if the packet contributed a new media packet that is
    /// now retained.
    pub fn add_packet(&mut self, packet: &Packet) -> bool {
        match self.admit(packet) {
            Some(media) => self.medias.contains_key(&media.ext_seq()),
            None => false,
        }
    }

    /// Admit a packet and return the media it carries
    ///
    /// The returned packet is the media itself or the primary block of a
    /// redundant wrapper. Media older than the protection window is returned
    /// without being retained. Duplicates of retained media return `None`.
    pub fn admit(&mut self, packet: &Packet) -> Option<Packet> {
        let media = match &packet.kind {
            PacketKind::Media => self.admit_media(packet.clone()),
            PacketKind::FecParity => {
                self.admit_parity(packet.ext_seq(), &packet.payload);
                None
            }
            PacketKind::Redundant(red) => self.admit_redundant(packet, red),
        };

        self.prune();
        media
    }

    fn admit_media(&mut self, packet: Packet) -> Option<Packet> {
        let seq = packet.ext_seq();
        if self.medias.contains_key(&seq) {
            trace!(seq, "duplicate media packet");
            self.stats.duplicates += 1;
            return None;
        }

        if self.cutoff().is_some_and(|cutoff| seq < cutoff) {
            trace!(seq, "media older than protection window");
            self.stats.stale += 1;
            return Some(packet);
        }

        self.medias.insert(seq, packet.clone());
        self.stats.media_admitted += 1;
        Some(packet)
    }

    fn admit_parity(&mut self, carrier_seq: u64, data: &[u8]) {
        let parity = match FecParity::parse(data) {
            Ok(parity) => parity,
            Err(e) => {
                warn!(carrier_seq, "dropping FEC payload: {}", e);
                self.stats.parity_dropped += 1;
                return;
            }
        };

        if parity.payload.len() > self.mtu {
            warn!(
                carrier_seq,
                "dropping FEC payload: {}",
                FecError::ProtectionTooLarge {
                    size: parity.payload.len(),
                    mtu: self.mtu,
                }
            );
            self.stats.parity_dropped += 1;
            return;
        }

        let base = unwrap_near(carrier_seq, parity.base_seq);
        self.insert_parity(base, parity);
    }

    /// Walk a redundant wrapper without recursion
    fn admit_redundant(&mut self, packet: &Packet, red: &RedundantPayload) -> Option<Packet> {
        let carrier_seq = packet.ext_seq();
        let mut produced = None;
        let mut work: VecDeque<(Role, RedBlock)> = VecDeque::new();
        Self::queue_blocks(&mut work, red, Role::Primary);

        while let Some((role, block)) = work.pop_front() {
            match (block.kind, role) {
                (BlockKind::FecParity, _) => self.admit_parity(carrier_seq, &block.data),
                (BlockKind::Media, Role::Primary) => {
                    let media = packet.with_media_payload(block.payload_type, block.data);
                    if let Some(media) = self.admit_media(media) {
                        produced = Some(media);
                    }
                }
                (BlockKind::Media, Role::Secondary) => {
                    trace!(carrier_seq, "ignoring redundant media block");
                }
                (BlockKind::Redundant, role) => {
                    match RedundantPayload::parse(&block.data, &self.payload_types) {
                        Ok(nested) => Self::queue_blocks(&mut work, &nested, role),
                        Err(e) => warn!(carrier_seq, "dropping nested RED block: {}", e),
                    }
                }
            }
        }

        produced
    }

    fn queue_blocks(work: &mut VecDeque<(Role, RedBlock)>, red: &RedundantPayload, role: Role) {
        work.push_back((role, red.primary.clone()));
        for block in &red.redundant {
            work.push_back((Role::Secondary, block.clone()));
        }
    }

    /// Retain a parity entry whose base is already extended
    pub fn insert_parity(&mut self, base: u64, parity: FecParity) {
        debug!(
            base,
            mask = parity.mask,
            len = parity.payload.len(),
            "FEC parity retained"
        );

        self.codes.entry(base).or_default().push(parity);
        self.parity_count += 1;
        self.stats.parity_admitted += 1;

        while self.parity_count > self.max_parity_entries {
            let mut oldest = match self.codes.first_entry() {
                Some(entry) => entry,
                None => break,
            };
            oldest.get_mut().remove(0);
            if oldest.get().is_empty() {
                oldest.remove();
            }
            self.parity_count -= 1;
        }
    }

    /// Lowest sequence number still inside the protection window
    fn cutoff(&self) -> Option<u64> {
        let &newest = self.medias.keys().next_back()?;
        newest.checked_sub(PROTECTION_WINDOW - 1)
    }

    /// Drop everything more than `PROTECTION_WINDOW - 1` behind the newest media
    fn prune(&mut self) {
        let cutoff = match self.cutoff() {
            Some(cutoff) => cutoff,
            None => return,
        };

        self.medias = self.medias.split_off(&cutoff);

        let kept = self.codes.split_off(&cutoff);
        let dropped: usize = self.codes.values().map(Vec::len).sum();
        self.codes = kept;
        self.parity_count -= dropped;
    }

    /// Try to reconstruct one missing media packet
    ///
    /// On success the packet is admitted as media (so it can help recover
    /// further packets) and returned.
    pub fn recover(&mut self) -> Option<Packet> {
        let packet = self.find_recoverable()?;

        debug!(
            seq = packet.ext_seq(),
            len = packet.payload.len(),
            ts = packet.timestamp,
            "recovered packet"
        );
        self.stats.recovered += 1;
        self.add_packet(&packet);
        Some(packet)
    }

    fn find_recoverable(&self) -> Option<Packet> {
        let (&min_seq, first) = self.medias.first_key_value()?;
        let (&max_seq, newest) = self.medias.last_key_value()?;

        let holes = (min_seq..=max_seq).filter(|seq| !self.medias.contains_key(seq));

        for hole in holes {
            let lowest_base = hole.saturating_sub(PROTECTION_WINDOW - 1);
            for (&base, entries) in self.codes.range(lowest_base..=hole) {
                let bit = hole - base;
                for parity in entries.iter().filter(|p| p.protects(bit)) {
                    let required = parity.mask & !(1u64 << bit);
                    let available = self.presence_mask(base, required);
                    if required & available != required {
                        let missing = (required & !available).count_ones();
                        trace!(hole, base, missing, "insufficient coverage");
                        continue;
                    }

                    if let Some(mut packet) = self.reconstruct(hole, base, required, parity) {
                        packet.ssrc = first.ssrc;
                        packet.arrival_ms = newest.arrival_ms;
                        return Some(packet);
                    }
                }
            }
        }
        None
    }

    /// Which of the positions in `wanted` (relative to `base`) are retained
    fn presence_mask(&self, base: u64, wanted: u64) -> u64 {
        let mut available = 0u64;
        let mut bits = wanted;
        while bits != 0 {
            let offset = bits.trailing_zeros();
            if self.medias.contains_key(&(base + u64::from(offset))) {
                available |= 1 << offset;
            }
            bits &= bits - 1;
        }
        available
    }

    fn reconstruct(&self, hole: u64, base: u64, required: u64, parity: &FecParity) -> Option<Packet> {
        let protection_length = parity.payload.len();
        if protection_length > self.mtu {
            warn!(hole, base, protection_length, "FEC level 0 data too large");
            return None;
        }

        let mut fields = parity.recovery;
        let mut data = BytesMut::from(&parity.payload[..]);

        let mut bits = required;
        while bits != 0 {
            let offset = u64::from(bits.trailing_zeros());
            bits &= bits - 1;

            let media = self.medias.get(&(base + offset))?;
            match RecoveryFields::of(media) {
                Ok(media_fields) => fields.xor(&media_fields),
                Err(e) => {
                    warn!(hole, base, "cannot recover: {}", e);
                    return None;
                }
            }
            xor_prefix(&mut data, &media.payload);
        }

        let length = usize::from(fields.length);
        if length > self.mtu {
            warn!(hole, base, length, "recovered payload too large");
            return None;
        }
        // Bytes past the protection length are not covered by parity
        data.resize(length, 0);

        let mut packet = Packet::new(0, 0, fields.payload_type, fields.timestamp, data.freeze());
        packet.set_ext_seq(hole);
        packet.padding = fields.padding;
        packet.extension = fields.extension;
        packet.csrc_count = fields.csrc_count;
        packet.marker = fields.marker;
        packet.recovered = true;
        Some(packet)
    }

    /// Retained media packet at an extended sequence number
    pub fn media(&self, seq: u64) -> Option<&Packet> {
        self.medias.get(&seq)
    }

    /// Number of retained media packets
    pub fn media_len(&self) -> usize {
        self.medias.len()
    }

    /// Number of retained parity entries
    pub fn parity_len(&self) -> usize {
        self.parity_count
    }

    /// Lowest and highest retained media sequence numbers
    pub fn media_bounds(&self) -> Option<(u64, u64)> {
        let (&min, _) = self.medias.first_key_value()?;
        let (&max, _) = self.medias.last_key_value()?;
        Some((min, max))
    }

    /// Decoder statistics
    pub fn stats(&self) -> &FecStats {
        &self.stats
    }

    /// Drop all retained state
    pub fn reset(&mut self) {
        self.medias.clear();
        self.codes.clear();
        self.parity_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(seq: u64, payload: &[u8]) -> Packet {
        let mut packet = Packet::new(0x1234, 0, 96, 9000 + seq as u32 * 3000, Bytes::copy_from_slice(payload));
        packet.set_ext_seq(seq);
        packet.marker = seq % 3 == 0;
        packet.arrival_ms = 100 + seq;
        packet
    }

    fn parity_packet(seq: u64, parity: &FecParity) -> Packet {
        let types = PayloadTypes::default();
        Packet::new(0x1234, 0, types.ulpfec, 0, parity.to_bytes().unwrap())
            .with_kind(PacketKind::FecParity)
            .with_ext_seq(seq)
    }

    fn decoder() -> FecDecoder {
        FecDecoder::new(&RecoveryConfig::default())
    }

    fn group(range: std::ops::Range<u64>) -> Vec<Packet> {
        range.map(|seq| media(seq, &[seq as u8; 20])).collect()
    }

    #[test]
    fn test_parse_roundtrip() {
        let packets = group(10..14);
        let refs: Vec<&Packet> = packets.iter().collect();
        let parity = FecParity::protect(&refs).unwrap();

        assert_eq!(parity.base_seq, 10);
        assert_eq!(parity.mask, 0b1111);
        assert_eq!(parity.payload.len(), 20);

        let bytes = parity.to_bytes().unwrap();
        assert_eq!(bytes.len(), FEC_HEADER_SIZE + LEVEL_HEADER_SIZE + 20);
        // Base packet is the most significant mask bit on the wire
        assert_eq!(&bytes[12..14], &[0xF0, 0x00]);
        assert_eq!(FecParity::parse(&bytes).unwrap(), parity);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(FecParity::parse(&[0u8; 5]), Err(FecError::Truncated { .. })));

        let mut bytes = [0u8; 14];
        bytes[0] = 0x80;
        assert_eq!(FecParity::parse(&bytes), Err(FecError::ExtensionFlagSet));

        bytes[0] = 0x40;
        assert_eq!(FecParity::parse(&bytes), Err(FecError::LongMaskUnsupported));

        bytes[0] = 0;
        assert_eq!(FecParity::parse(&bytes), Err(FecError::EmptyProtectedSet));

        // Protection length of 8 with no data behind it
        bytes[11] = 8;
        bytes[12] = 0x80;
        assert!(matches!(FecParity::parse(&bytes), Err(FecError::Truncated { .. })));
    }

    #[test]
    fn test_protect_shortest_payload() {
        let a = media(0, &[1, 2, 3, 4]);
        let b = media(1, &[5, 6]);
        let parity = FecParity::protect(&[&a, &b]).unwrap();
        assert_eq!(&parity.payload[..], &[1 ^ 5, 2 ^ 6]);
        assert_eq!(parity.recovery.length, 4 ^ 2);
    }

    #[test]
    fn test_protect_out_of_window() {
        let a = media(0, &[1]);
        let b = media(64, &[1]);
        assert!(matches!(
            FecParity::protect(&[&a, &b]),
            Err(FecError::OutOfWindow { .. })
        ));
    }

    #[test]
    fn test_recover_single_loss() {
        let packets = group(100..106);
        let refs: Vec<&Packet> = packets.iter().collect();
        let parity = FecParity::protect(&refs).unwrap();

        let mut fec = decoder();
        for (i, packet) in packets.iter().enumerate() {
            if i != 3 {
                assert!(fec.add_packet(packet));
            }
        }
        assert!(!fec.add_packet(&parity_packet(106, &parity)));

        let recovered = fec.recover().unwrap();
        let original = &packets[3];
        assert_eq!(recovered.ext_seq(), original.ext_seq());
        assert_eq!(recovered.payload, original.payload);
        assert_eq!(recovered.timestamp, original.timestamp);
        assert_eq!(recovered.marker, original.marker);
        assert_eq!(recovered.payload_type, original.payload_type);
        assert_eq!(recovered.ssrc, original.ssrc);
        assert!(recovered.recovered);

        // Admitted, so nothing else to do
        assert!(fec.media(103).is_some());
        assert!(fec.recover().is_none());
        assert_eq!(fec.stats().recovered, 1);
    }

    #[test]
    fn test_two_losses_not_recoverable() {
        let packets = group(0..6);
        let refs: Vec<&Packet> = packets.iter().collect();
        let parity = FecParity::protect(&refs).unwrap();

        let mut fec = decoder();
        for packet in packets.iter().filter(|p| p.ext_seq() != 2 && p.ext_seq() != 4) {
            fec.add_packet(packet);
        }
        fec.insert_parity(0, parity);

        assert!(fec.recover().is_none());
        assert_eq!(fec.media_len(), 4);
        assert_eq!(fec.parity_len(), 1);
    }

    #[test]
    fn test_chained_recovery() {
        // A covers {0, 1, 2, 4}, B covers {3, 4, 5}; with 2 and 4 lost only
        // B can act, and its output completes A
        let packets = group(0..6);
        let a = FecParity::protect(&[&packets[0], &packets[1], &packets[2], &packets[4]]).unwrap();
        let b = FecParity::protect(&[&packets[3], &packets[4], &packets[5]]).unwrap();

        let mut fec = decoder();
        for seq in [0, 1, 3, 5] {
            fec.add_packet(&packets[seq]);
        }
        fec.insert_parity(0, a);
        fec.insert_parity(3, b);

        let first = fec.recover().unwrap();
        assert_eq!(first.ext_seq(), 4);
        let second = fec.recover().unwrap();
        assert_eq!(second.ext_seq(), 2);
        assert_eq!(second.payload, packets[2].payload);
        assert!(fec.recover().is_none());
    }

    #[test]
    fn test_recover_longer_payload_prefix() {
        let short = media(0, &[0; 3]);
        let long = media(1, &[1, 2, 3, 4, 5, 6]);
        let parity = FecParity::protect(&[&short, &long]).unwrap();
        assert_eq!(parity.payload.len(), 3);

        let mut fec = decoder();
        fec.add_packet(&short);
        fec.add_packet(&media(2, &[0; 3]));
        fec.insert_parity(0, parity);

        let recovered = fec.recover().unwrap();
        assert_eq!(recovered.ext_seq(), 1);
        assert_eq!(recovered.payload.len(), 6);
        // Only the protected prefix is meaningful
        assert_eq!(&recovered.payload[..3], &[1, 2, 3]);
        assert_eq!(&recovered.payload[3..], &[0, 0, 0]);
    }

    #[test]
    fn test_hole_before_lowest_media_ignored() {
        let a = media(0, b"abc");
        let b = media(1, b"def");
        let parity = FecParity::protect(&[&a, &b]).unwrap();

        let mut fec = decoder();
        fec.add_packet(&b);
        fec.add_packet(&media(2, b"ghi"));
        fec.insert_parity(0, parity);

        assert!(fec.recover().is_none());
    }

    #[test]
    fn test_duplicate_media() {
        let mut fec = decoder();
        let packet = media(7, b"abc");
        assert!(fec.add_packet(&packet));
        assert!(!fec.add_packet(&packet));
        assert_eq!(fec.stats().duplicates, 1);
    }

    #[test]
    fn test_fully_populated_never_recovers() {
        let packets = group(0..10);
        let refs: Vec<&Packet> = packets.iter().collect();
        let parity = FecParity::protect(&refs).unwrap();

        let mut fec = decoder();
        for packet in &packets {
            fec.add_packet(packet);
        }
        fec.insert_parity(0, parity);
        assert!(fec.recover().is_none());
        assert!(fec.recover().is_none());
    }

    #[test]
    fn test_pruning_window() {
        let mut fec = decoder();
        fec.insert_parity(0, FecParity::protect(&[&media(0, b"x")]).unwrap());
        for seq in 0..100 {
            fec.add_packet(&media(seq, b"x"));
        }

        assert_eq!(fec.media_len(), 64);
        assert_eq!(fec.media_bounds(), Some((36, 99)));
        assert_eq!(fec.parity_len(), 0);
    }

    #[test]
    fn test_parity_cap() {
        let config = RecoveryConfig {
            max_parity_entries: 2,
            ..RecoveryConfig::default()
        };
        let mut fec = FecDecoder::new(&config);
        for seq in 0..5 {
            fec.insert_parity(seq, FecParity::protect(&[&media(seq, b"x")]).unwrap());
        }
        assert_eq!(fec.parity_len(), 2);
    }

    #[test]
    fn test_oversized_parity_dropped() {
        let config = RecoveryConfig {
            mtu: 8,
            ..RecoveryConfig::default()
        };
        let mut fec = FecDecoder::new(&config);
        let parity = FecParity::protect(&[&media(0, &[0u8; 16])]).unwrap();

        fec.add_packet(&parity_packet(1, &parity));
        assert_eq!(fec.parity_len(), 0);
        assert_eq!(fec.stats().parity_dropped, 1);
    }

    #[test]
    fn test_recovered_length_above_mtu_dropped() {
        let config = RecoveryConfig {
            mtu: 64,
            ..RecoveryConfig::default()
        };
        let mut fec = FecDecoder::new(&config);
        let packets = group(0..4);
        let mut parity = FecParity::protect(&[&packets[1], &packets[2]]).unwrap();
        // Parity data fits, the rebuilt length field does not
        parity.recovery.length ^= 0x0100;

        fec.add_packet(&packets[0]);
        fec.add_packet(&packets[1]);
        fec.add_packet(&packets[3]);
        fec.insert_parity(1, parity);

        assert!(fec.recover().is_none());
        assert_eq!(fec.media_len(), 3);
        assert_eq!(fec.parity_len(), 1);
        assert_eq!(fec.stats().recovered, 0);
    }

    #[test]
    fn test_protect_payload_too_large() {
        let big = media(0, &vec![0u8; usize::from(u16::MAX) + 1]);
        assert_eq!(
            FecParity::protect(&[&big]),
            Err(FecError::PayloadTooLarge { size: 65536 })
        );
        assert!(RecoveryFields::of(&media(1, &[0u8; 8])).is_ok());
    }

    #[test]
    fn test_stale_media_returned_not_retained() {
        let mut fec = decoder();
        for seq in 0..100 {
            if seq != 20 {
                fec.add_packet(&media(seq, b"x"));
            }
        }
        let bounds = fec.media_bounds();

        let late = media(20, b"late");
        assert!(!fec.add_packet(&late));
        let admitted = fec.admit(&late).unwrap();
        assert_eq!(admitted.ext_seq(), 20);
        assert_eq!(admitted.payload, late.payload);

        assert!(fec.media(20).is_none());
        assert_eq!(fec.media_bounds(), bounds);
        assert_eq!(fec.stats().stale, 2);

        // Retained media is still deduplicated
        assert!(fec.admit(&media(50, b"x")).is_none());
        assert_eq!(fec.stats().duplicates, 1);
    }

    #[test]
    fn test_redundant_primary_media_and_secondary_parity() {
        let types = PayloadTypes::default();
        let packets = group(0..3);
        let parity = FecParity::protect(&[&packets[0], &packets[1]]).unwrap();

        let red = RedundantPayload {
            redundant: vec![
                RedBlock::new(BlockKind::FecParity, types.ulpfec, 0, parity.to_bytes().unwrap()),
                RedBlock::new(BlockKind::Media, 96, 3000, Bytes::from_static(b"stale")),
            ],
            primary: RedBlock::new(BlockKind::Media, 96, 0, packets[2].payload.clone()),
        };
        let wrapper = packets[2]
            .clone()
            .with_kind(PacketKind::Redundant(red));

        let mut fec = decoder();
        fec.add_packet(&packets[0]);
        assert!(fec.add_packet(&wrapper));
        assert_eq!(fec.parity_len(), 1);
        assert_eq!(fec.media(2).unwrap().payload, packets[2].payload);
        assert!(fec.media(2).unwrap().is_media());

        let recovered = fec.recover().unwrap();
        assert_eq!(recovered.ext_seq(), 1);
        assert_eq!(recovered.payload, packets[1].payload);
    }

    #[test]
    fn test_redundant_primary_parity() {
        let types = PayloadTypes::default();
        let packets = group(0..2);
        let parity = FecParity::protect(&[&packets[0], &packets[1]]).unwrap();

        let red = RedundantPayload {
            redundant: vec![],
            primary: RedBlock::new(BlockKind::FecParity, types.ulpfec, 0, parity.to_bytes().unwrap()),
        };
        let wrapper = Packet::new(0x1234, 2, types.red, 0, Bytes::new())
            .with_kind(PacketKind::Redundant(red));

        let mut fec = decoder();
        assert!(!fec.add_packet(&wrapper));
        assert_eq!(fec.parity_len(), 1);
        assert_eq!(fec.media_len(), 0);
    }

    #[test]
    fn test_nested_redundant() {
        let types = PayloadTypes::default();
        let packets = group(0..2);
        let parity = FecParity::protect(&[&packets[0], &packets[1]]).unwrap();

        let inner = RedundantPayload {
            redundant: vec![RedBlock::new(BlockKind::FecParity, types.ulpfec, 0, parity.to_bytes().unwrap())],
            primary: RedBlock::new(BlockKind::Media, 96, 0, packets[1].payload.clone()),
        };
        let outer = RedundantPayload {
            redundant: vec![],
            primary: RedBlock::new(BlockKind::Redundant, types.red, 0, inner.to_bytes().unwrap()),
        };
        let wrapper = packets[1].clone().with_kind(PacketKind::Redundant(outer));

        let mut fec = decoder();
        assert!(fec.add_packet(&wrapper));
        assert_eq!(fec.parity_len(), 1);
        assert_eq!(fec.media(1).unwrap().payload, packets[1].payload);
    }

    #[test]
    fn test_parity_base_across_wrap() {
        let packets: Vec<Packet> = (65534..65538).map(|seq| media(seq, &[7; 8])).collect();
        let refs: Vec<&Packet> = packets.iter().collect();
        let parity = FecParity::protect(&refs).unwrap();
        assert_eq!(parity.base_seq, 65534);

        let mut fec = decoder();
        for packet in packets.iter().filter(|p| p.ext_seq() != 65536) {
            fec.add_packet(packet);
        }
        // Carried by a packet in the next cycle
        fec.add_packet(&parity_packet(65538, &parity));

        let recovered = fec.recover().unwrap();
        assert_eq!(recovered.ext_seq(), 65536);
        assert_eq!(recovered.seq, 0);
        assert_eq!(recovered.cycles, 1);
    }

    #[test]
    fn test_recovery_fields_xor() {
        let a = media(0, b"abcd").with_marker(true);
        let b = media(1, b"ef");
        let mut fields = RecoveryFields::of(&a).unwrap();
        fields.xor(&RecoveryFields::of(&b).unwrap());
        fields.xor(&RecoveryFields::of(&b).unwrap());
        assert_eq!(fields, RecoveryFields::of(&a).unwrap());
    }
}
