//! RTP Recovery CLI Library
//!
//! Shared functionality for the loss simulator.

pub mod config;
pub mod sim;
pub mod stats;

pub use config::{ConfigError, SimConfig};
pub use sim::{run, SimError, SimReport};
pub use stats::{display_report, format_bytes, format_nacks, format_seqs};
