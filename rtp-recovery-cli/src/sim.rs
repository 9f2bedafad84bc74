//! Synthetic protected stream
//!
//! Builds a media stream with one ULP FEC parity per group, drops packets
//! according to the configured pattern and feeds the survivors through an
//! [`IncomingStream`].

use crate::config::SimConfig;
use bytes::Bytes;
use rtp_recovery::fec::{FecError, FecParity};
use rtp_recovery::red::{BlockKind, RedBlock, RedError, RedundantPayload};
use rtp_recovery::{FecStats, IncomingStream, NackField, Packet, StreamStats};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info};

/// Media payload type used for generated packets
pub const MEDIA_PAYLOAD_TYPE: u8 = 96;

/// RTP clock ticks between generated packets (20 ms at 48 kHz)
const TIMESTAMP_STEP: u32 = 960;

/// Stream generation errors
#[derive(Error, Debug)]
pub enum SimError {
    #[error("FEC encoding failed: {0}")]
    Fec(#[from] FecError),

    #[error("RED encoding failed: {0}")]
    Red(#[from] RedError),
}

/// A generated packet and the media it carries
#[derive(Debug, Clone)]
pub struct Emitted {
    pub packet: Packet,
    /// Original media packet, `None` for parity-only packets
    pub media: Option<Packet>,
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Default)]
pub struct SimReport {
    /// Media packets generated
    pub media_sent: u64,
    /// Packets carrying only parity
    pub parity_sent: u64,
    /// Emitted packets dropped
    pub dropped: u64,
    /// Media packets delivered
    pub delivered: u64,
    /// Media packets rebuilt from parity
    pub recovered: u64,
    /// Rebuilt packets whose payload differs from the original
    pub mismatched: u64,
    /// Loss count reported by the tracker at the end
    pub lost: u64,
    /// Outstanding NACK fields at the end
    pub nacks: Vec<NackField>,
    /// Media sequence numbers never delivered
    pub missing: Vec<u16>,
    pub stream: StreamStats,
    pub fec: FecStats,
}

impl SimReport {
    /// Fraction of dropped media that FEC rebuilt
    pub fn recovery_ratio(&self) -> f64 {
        let lost_media = self.recovered + self.missing.len() as u64;
        if lost_media == 0 {
            1.0
        } else {
            self.recovered as f64 / lost_media as f64
        }
    }
}

fn media_packet(config: &SimConfig, index: u32, ext: u64, group_end: bool) -> Packet {
    // Repeating pattern so a wrong reconstruction is visible
    let payload: Vec<u8> = (0..config.payload_size)
        .map(|i| (index as usize).wrapping_mul(31).wrapping_add(i) as u8)
        .collect();

    Packet::new(
        config.ssrc,
        0,
        MEDIA_PAYLOAD_TYPE,
        index.wrapping_mul(TIMESTAMP_STEP),
        Bytes::from(payload),
    )
    .with_marker(group_end)
    .with_ext_seq(ext)
}

/// Generate the emitted packet sequence
pub fn generate(config: &SimConfig) -> Result<Vec<Emitted>, SimError> {
    let types = config.recovery.payload_types;
    let mut emitted = Vec::new();
    let mut group: Vec<Packet> = Vec::with_capacity(config.group);
    let mut pending_parity: Option<Bytes> = None;
    let mut ext = u64::from(config.start_seq);

    for index in 0..config.packets {
        let group_end = group.len() + 1 == config.group || index + 1 == config.packets;
        let media = media_packet(config, index, ext, group_end);
        ext += 1;

        let packet = if config.red {
            // Parity of the previous group rides along as a secondary block
            let redundant = pending_parity
                .take()
                .map(|parity| RedBlock::new(BlockKind::FecParity, types.ulpfec, 0, parity))
                .into_iter()
                .collect();
            let red = RedundantPayload {
                redundant,
                primary: RedBlock::new(BlockKind::Media, MEDIA_PAYLOAD_TYPE, 0, media.payload.clone()),
            };
            let mut wrapper = media.clone();
            wrapper.payload_type = types.red;
            wrapper.payload = red.to_bytes()?;
            wrapper
        } else {
            media.clone()
        };
        emitted.push(Emitted {
            packet,
            media: Some(media.clone()),
        });
        group.push(media);

        if !group_end {
            continue;
        }

        let refs: Vec<&Packet> = group.iter().collect();
        let parity = FecParity::protect(&refs)?.to_bytes()?;
        group.clear();

        let payload = if !config.red {
            parity
        } else if index + 1 < config.packets {
            pending_parity = Some(parity);
            continue;
        } else {
            // Nothing left to ride on: wrap it as a primary block
            let red = RedundantPayload {
                redundant: Vec::new(),
                primary: RedBlock::new(BlockKind::FecParity, types.ulpfec, 0, parity),
            };
            red.to_bytes()?
        };

        let payload_type = if config.red { types.red } else { types.ulpfec };
        emitted.push(Emitted {
            packet: Packet::new(config.ssrc, 0, payload_type, 0, payload).with_ext_seq(ext),
            media: None,
        });
        ext += 1;
    }

    for (i, e) in emitted.iter_mut().enumerate() {
        e.packet.arrival_ms = i as u64 * config.interval_ms;
    }
    Ok(emitted)
}

/// Check if the emitted packet at `index` with wire sequence `seq` is dropped
pub fn is_dropped(config: &SimConfig, index: usize, seq: u16) -> bool {
    if config.drop.contains(&seq) {
        return true;
    }
    match config.drop_every {
        Some(every) if every > 0 => (index as u64 + 1) % u64::from(every) == 0,
        _ => false,
    }
}

/// Run the simulation
pub fn run(config: &SimConfig) -> Result<SimReport, SimError> {
    let emitted = generate(config)?;
    let mut stream = IncomingStream::new(config.ssrc, config.recovery.clone());
    let mut report = SimReport::default();

    let originals: HashMap<u16, Bytes> = emitted
        .iter()
        .filter_map(|e| e.media.as_ref())
        .map(|media| (media.seq, media.payload.clone()))
        .collect();
    let mut delivered: BTreeSet<u16> = BTreeSet::new();

    for (index, e) in emitted.into_iter().enumerate() {
        match e.media {
            Some(_) => report.media_sent += 1,
            None => report.parity_sent += 1,
        }

        if is_dropped(config, index, e.packet.seq) {
            debug!(seq = e.packet.seq, "dropped");
            report.dropped += 1;
            continue;
        }

        for packet in stream.push(e.packet) {
            if packet.recovered {
                report.recovered += 1;
                if originals.get(&packet.seq) != Some(&packet.payload) {
                    report.mismatched += 1;
                }
            }
            delivered.insert(packet.seq);
        }
    }

    report.delivered = delivered.len() as u64;
    report.missing = originals
        .keys()
        .copied()
        .filter(|seq| !delivered.contains(seq))
        .collect();
    report.missing.sort_unstable();
    report.lost = stream.total_lost();
    report.nacks = stream.nacks();
    report.stream = stream.stats().clone();
    report.fec = stream.fec_stats().clone();

    info!(
        delivered = report.delivered,
        recovered = report.recovered,
        missing = report.missing.len(),
        "simulation complete"
    );
    Ok(report)
}
