//! Per-stream ingestion
//!
//! [`IncomingStream`] runs every arriving packet through sequence extension,
//! loss tracking and FEC admission, then drains every packet FEC can rebuild
//! before returning. [`StreamRegistry`] hands out one locked stream per SSRC.

use crate::config::RecoveryConfig;
use crate::fec::{FecDecoder, FecStats};
use crate::loss::{LossTracker, NackField};
use crate::packet::Packet;
use crate::sequence::SeqExtender;
use crate::store::SequenceStore;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Per-stream counters
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Packets pushed, parity and wrappers included
    pub packets_received: u64,
    /// Bytes pushed
    pub bytes_received: u64,
    /// Media packets delivered downstream
    pub packets_delivered: u64,
    /// Media packets rebuilt from parity
    pub packets_recovered: u64,
    /// Packets currently counted as lost
    pub lost: u64,
    /// Media packets suppressed because they were already delivered
    pub duplicates: u64,
    /// Packets whose payload could not be classified
    pub malformed: u64,
}

/// Receive side of one RTP stream
pub struct IncomingStream {
    ssrc: u32,
    config: RecoveryConfig,
    extender: SeqExtender<u16>,
    losses: LossTracker,
    fec: FecDecoder,
    /// Recently delivered sequence numbers
    delivered: SequenceStore<()>,
    stats: StreamStats,
}

impl IncomingStream {
    /// Create a stream for `ssrc`
    ///
    /// # Panics
    /// Panics if `config.nack_window` or `config.delivery_history` is zero
    pub fn new(ssrc: u32, config: RecoveryConfig) -> Self {
        IncomingStream {
            ssrc,
            extender: SeqExtender::new(),
            losses: LossTracker::new(config.nack_window),
            fec: FecDecoder::new(&config),
            delivered: SequenceStore::new(config.delivery_history),
            stats: StreamStats::default(),
            config,
        }
    }

    /// Stream SSRC
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Ingest one packet
    ///
    /// Returns the media packets to hand downstream: the packet itself (or
    /// the primary block of a redundant wrapper) followed by anything FEC
    /// rebuilt as a consequence. Order follows recovery, not sequence.
    pub fn push(&mut self, mut packet: Packet) -> Vec<Packet> {
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.payload.len() as u64;

        let extended = self.extender.extend(packet.seq);
        packet.set_ext_seq(extended);

        let lost = self.losses.add_packet(&packet);
        if lost > 0 {
            debug!(ssrc = self.ssrc, seq = extended, lost, "gap in sequence");
        }

        let packet = match packet.classify(&self.config.payload_types) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(ssrc = self.ssrc, seq = extended, "dropping packet: {}", e);
                self.stats.malformed += 1;
                self.stats.lost = self.losses.total_lost();
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        if let Some(media) = self.fec.admit(&packet) {
            self.deliver(media, &mut out);
        }

        while let Some(recovered) = self.fec.recover() {
            self.losses.add_packet(&recovered);
            self.stats.packets_recovered += 1;
            self.deliver(recovered, &mut out);
        }

        self.stats.lost = self.losses.total_lost();
        out
    }

    fn deliver(&mut self, packet: Packet, out: &mut Vec<Packet>) {
        if self.delivered.is_present(packet.seq) {
            trace!(ssrc = self.ssrc, seq = packet.ext_seq(), "already delivered");
            self.stats.duplicates += 1;
            return;
        }

        if !self.delivered.set(packet.seq, ()) {
            trace!(ssrc = self.ssrc, seq = packet.ext_seq(), "older than delivery history");
        }
        self.stats.packets_delivered += 1;
        out.push(packet);
    }

    /// NACK fields for everything currently missing
    pub fn nacks(&self) -> Vec<NackField> {
        self.losses.get_nacks()
    }

    /// Packets currently counted as lost
    pub fn total_lost(&self) -> u64 {
        self.losses.total_lost()
    }

    /// Highest extended sequence number seen
    pub fn highest_seq(&self) -> Option<u64> {
        self.extender.last_extended()
    }

    /// Stream counters
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// FEC decoder counters
    pub fn fec_stats(&self) -> &FecStats {
        self.fec.stats()
    }

    /// Loss tracker
    pub fn losses(&self) -> &LossTracker {
        &self.losses
    }

    /// FEC decoder
    pub fn fec(&self) -> &FecDecoder {
        &self.fec
    }

    /// Forget all sequence, loss and FEC state
    pub fn reset(&mut self) {
        self.extender.reset();
        self.losses.reset();
        self.fec.reset();
        self.delivered.clear();
        self.stats.lost = 0;
    }
}

/// Streams indexed by SSRC
///
/// Each stream sits behind its own mutex, so pushing a packet and draining
/// its recoveries happens under one lock without blocking other streams.
pub struct StreamRegistry {
    config: RecoveryConfig,
    streams: RwLock<HashMap<u32, Arc<Mutex<IncomingStream>>>>,
}

impl StreamRegistry {
    /// Create an empty registry; new streams use `config`
    pub fn new(config: RecoveryConfig) -> Self {
        StreamRegistry {
            config,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Get the stream for `ssrc`, creating it on first use
    pub fn stream(&self, ssrc: u32) -> Arc<Mutex<IncomingStream>> {
        if let Some(stream) = self.streams.read().get(&ssrc) {
            return stream.clone();
        }

        self.streams
            .write()
            .entry(ssrc)
            .or_insert_with(|| {
                debug!(ssrc, "new incoming stream");
                Arc::new(Mutex::new(IncomingStream::new(ssrc, self.config.clone())))
            })
            .clone()
    }

    /// Route a packet to its stream by SSRC
    pub fn push(&self, packet: Packet) -> Vec<Packet> {
        let stream = self.stream(packet.ssrc);
        let mut stream = stream.lock();
        stream.push(packet)
    }

    /// Get an existing stream
    pub fn get(&self, ssrc: u32) -> Option<Arc<Mutex<IncomingStream>>> {
        self.streams.read().get(&ssrc).cloned()
    }

    /// Remove a stream
    pub fn remove(&self, ssrc: u32) -> Option<Arc<Mutex<IncomingStream>>> {
        self.streams.write().remove(&ssrc)
    }

    /// Known SSRCs
    pub fn ssrcs(&self) -> Vec<u32> {
        self.streams.read().keys().copied().collect()
    }

    /// Number of streams
    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    /// Check if no stream exists
    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}
