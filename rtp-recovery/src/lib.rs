//! RTP Loss Resilience Core
//!
//! This crate implements the receive-side reliability layer of an RTP
//! pipeline: extended sequence numbers, bounded sequence-keyed storage, loss
//! tracking with Generic NACK generation, and single-parity ULP FEC recovery
//! (including RFC 2198 redundant wrappers).

pub mod config;
pub mod fec;
pub mod loss;
pub mod packet;
pub mod red;
pub mod sequence;
pub mod store;
pub mod stream;

pub use config::{PayloadTypes, RecoveryConfig};
pub use fec::{FecDecoder, FecError, FecParity, FecStats, RecoveryFields};
pub use loss::{LossTracker, NackField};
pub use packet::{Packet, PacketKind};
pub use red::{BlockKind, RedBlock, RedError, RedundantPayload};
pub use sequence::{SeqExtender, WrappingSeq};
pub use store::SequenceStore;
pub use stream::{IncomingStream, StreamRegistry, StreamStats};
