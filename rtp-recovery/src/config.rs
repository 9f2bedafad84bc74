//! Recovery layer configuration

use crate::red::BlockKind;
use serde::{Deserialize, Serialize};

/// Default number of recent packets tracked for loss detection
pub const DEFAULT_NACK_WINDOW: usize = 128;

/// Maximum parity / reconstructed payload length
pub const DEFAULT_MTU: usize = 1500;

/// Payload types negotiated for redundancy and parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadTypes {
    /// RFC 2198 redundant payload type
    #[serde(default = "default_red")]
    pub red: u8,
    /// ULP FEC payload type
    #[serde(default = "default_ulpfec")]
    pub ulpfec: u8,
}

fn default_red() -> u8 {
    116
}

fn default_ulpfec() -> u8 {
    117
}

impl Default for PayloadTypes {
    fn default() -> Self {
        PayloadTypes {
            red: default_red(),
            ulpfec: default_ulpfec(),
        }
    }
}

impl PayloadTypes {
    /// Classify a payload type
    pub fn classify(&self, payload_type: u8) -> BlockKind {
        let payload_type = payload_type & 0x7F;
        if payload_type == self.ulpfec {
            BlockKind::FecParity
        } else if payload_type == self.red {
            BlockKind::Redundant
        } else {
            BlockKind::Media
        }
    }
}

/// Configuration for a single incoming stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Number of recent packets tracked for loss detection and NACKs
    #[serde(default = "default_nack_window")]
    pub nack_window: usize,
    /// Maximum parity and reconstructed payload length
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Number of delivered sequence numbers remembered for duplicate suppression
    #[serde(default = "default_delivery_history")]
    pub delivery_history: usize,
    /// Upper bound on retained parity entries
    #[serde(default = "default_max_parity_entries")]
    pub max_parity_entries: usize,
    /// Payload types
    #[serde(default)]
    pub payload_types: PayloadTypes,
}

fn default_nack_window() -> usize {
    DEFAULT_NACK_WINDOW
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

fn default_delivery_history() -> usize {
    512
}

fn default_max_parity_entries() -> usize {
    256
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            nack_window: default_nack_window(),
            mtu: default_mtu(),
            delivery_history: default_delivery_history(),
            max_parity_entries: default_max_parity_entries(),
            payload_types: PayloadTypes::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.nack_window, 128);
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.payload_types.red, 116);
        assert_eq!(config.payload_types.ulpfec, 117);
    }

    #[test]
    fn test_partial_toml() {
        let config: RecoveryConfig = toml::from_str(
            r#"
            nack_window = 256

            [payload_types]
            ulpfec = 127
            "#,
        )
        .unwrap();

        assert_eq!(config.nack_window, 256);
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.payload_types.red, 116);
        assert_eq!(config.payload_types.ulpfec, 127);
    }

    #[test]
    fn test_classify() {
        let types = PayloadTypes::default();
        assert_eq!(types.classify(96), BlockKind::Media);
        assert_eq!(types.classify(116), BlockKind::Redundant);
        assert_eq!(types.classify(117), BlockKind::FecParity);
        // Marker bit is not part of the payload type
        assert_eq!(types.classify(0x80 | 117), BlockKind::FecParity);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = RecoveryConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: RecoveryConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
