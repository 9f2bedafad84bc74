//! Loss tracking and Generic NACK generation
//!
//! Keeps a sliding window over the most recent extended sequence numbers,
//! counts packets that never arrived, and packs the missing ones into
//! RFC 4585 Generic NACK fields.

use crate::packet::Packet;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::trace;

/// Size of a Generic NACK field on the wire (PID + BLP)
pub const NACK_FIELD_SIZE: usize = 4;

/// Number of additional sequence numbers covered by a NACK bitmask
pub const NACK_MASK_BITS: u16 = 16;

/// Generic NACK field
///
/// `first_lost` is lost; bit `k` of `mask` set means `first_lost + k + 1`
/// is lost as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackField {
    /// First lost sequence number (PID)
    pub first_lost: u16,
    /// Bitmask of following lost packets (BLP)
    pub mask: u16,
}

impl NackField {
    /// Create a new NACK field
    pub fn new(first_lost: u16, mask: u16) -> Self {
        NackField { first_lost, mask }
    }

    /// Sequence numbers reported lost by this field, ascending
    pub fn lost_sequences(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.first_lost).chain(
            (0..NACK_MASK_BITS)
                .filter(move |bit| self.mask & (1 << bit) != 0)
                .map(move |bit| self.first_lost.wrapping_add(bit + 1)),
        )
    }

    /// Number of sequence numbers reported lost
    pub fn lost_count(&self) -> usize {
        1 + self.mask.count_ones() as usize
    }

    /// Serialize to bytes (network byte order)
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        buf.put_u16(self.first_lost);
        buf.put_u16(self.mask);
    }

    /// Parse a single field
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NACK_FIELD_SIZE {
            return None;
        }

        let mut buf = bytes;
        Some(NackField {
            first_lost: buf.get_u16(),
            mask: buf.get_u16(),
        })
    }

    /// Serialize a list of fields as Generic NACK FCI
    pub fn encode_all(fields: &[NackField]) -> Bytes {
        let mut buf = BytesMut::with_capacity(fields.len() * NACK_FIELD_SIZE);
        for field in fields {
            field.to_bytes(&mut buf);
        }
        buf.freeze()
    }

    /// Parse Generic NACK FCI; trailing partial fields are ignored
    pub fn decode_all(bytes: &[u8]) -> Vec<NackField> {
        bytes
            .chunks_exact(NACK_FIELD_SIZE)
            .filter_map(NackField::from_bytes)
            .collect()
    }
}

/// Sliding-window loss tracker
///
/// The window covers `[first, first + len)`; each slot holds the arrival time
/// of the packet at that position, or `None` if it has not arrived. The last
/// slot of the window always holds an arrived packet.
pub struct LossTracker {
    /// Maximum number of tracked positions
    size: usize,
    /// Extended sequence number of the first slot
    first: Option<u64>,
    /// Arrival times, one slot per position
    arrivals: VecDeque<Option<u64>>,
    /// Packets currently considered lost
    total: u64,
}

impl LossTracker {
    /// Create a tracker over the `size` most recent positions
    ///
    /// # Panics
    /// Panics if `size` is zero
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "LossTracker window must hold at least one packet");

        LossTracker {
            size,
            first: None,
            arrivals: VecDeque::with_capacity(size),
            total: 0,
        }
    }

    /// Record an arrived packet, see [`LossTracker::add`]
    pub fn add_packet(&mut self, packet: &Packet) -> u16 {
        self.add(packet.ext_seq(), packet.arrival_ms)
    }

    /// Record the arrival of extended sequence `seq` at `arrival_ms`
    ///
    /// Returns the number of packets newly detected as lost by this arrival.
    /// Packets older than the window are ignored.
    pub fn add(&mut self, seq: u64, arrival_ms: u64) -> u16 {
        let first = *self.first.get_or_insert(seq);
        if seq < first {
            trace!(seq, first, "packet older than loss window");
            return 0;
        }

        let size = self.size as u64;
        let mut pos = seq - first;
        let mut lost: u64 = 0;

        if pos >= size {
            // Slide forward so that `seq` becomes the last slot
            let evict = pos + 1 - size;
            let tracked = self.arrivals.len() as u64;
            let drained = evict.min(tracked);
            self.arrivals.drain(..drained as usize);
            // Positions past the old window end were never counted
            lost += evict - drained;
            self.first = Some(first + evict);
            pos = size - 1;
        }

        let pos = pos as usize;
        if pos >= self.arrivals.len() {
            // Everything between the old end and this packet is missing
            let gap = pos - self.arrivals.len();
            self.arrivals.extend(std::iter::repeat(None).take(gap));
            self.arrivals.push_back(Some(arrival_ms));
            lost += gap as u64;
        } else if self.arrivals[pos].is_none() {
            // Late arrival fills a hole
            self.arrivals[pos] = Some(arrival_ms);
            self.total = self.total.saturating_sub(1);
        }

        self.total += lost;
        if lost > 0 {
            trace!(seq, lost, total = self.total, "loss detected");
        }
        u16::try_from(lost).unwrap_or(u16::MAX)
    }

    /// Build Generic NACK fields for every missing position in the window
    pub fn get_nacks(&self) -> Vec<NackField> {
        let mut nacks = Vec::new();
        let first = match self.first {
            Some(first) => first,
            None => return nacks,
        };

        let mut current: Option<NackField> = None;
        let mut bits = 0u16;

        for (i, arrival) in self.arrivals.iter().enumerate() {
            match current.as_mut() {
                Some(field) => {
                    if arrival.is_none() {
                        field.mask |= 1 << bits;
                    }
                    bits += 1;
                    if bits == NACK_MASK_BITS {
                        nacks.push(*field);
                        current = None;
                        bits = 0;
                    }
                }
                None if arrival.is_none() => {
                    current = Some(NackField::new((first + i as u64) as u16, 0));
                }
                None => {}
            }
        }

        if let Some(field) = current {
            nacks.push(field);
        }
        nacks
    }

    /// Packets currently considered lost
    pub fn total_lost(&self) -> u64 {
        self.total
    }

    /// Extended sequence number of the first tracked position
    pub fn first_seq(&self) -> Option<u64> {
        self.first
    }

    /// Number of tracked positions
    pub fn len(&self) -> usize {
        self.arrivals.len()
    }

    /// Check if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
    }

    /// Window capacity
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if a tracked position has arrived
    pub fn is_received(&self, seq: u64) -> bool {
        match self.first {
            Some(first) if seq >= first => self
                .arrivals
                .get((seq - first) as usize)
                .map_or(false, Option::is_some),
            _ => false,
        }
    }

    /// Clear the window and the lost count
    pub fn reset(&mut self) {
        self.first = None;
        self.arrivals.clear();
        self.total = 0;
    }
}
