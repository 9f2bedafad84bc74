//! Configuration file support for the loss simulator

use rtp_recovery::fec::{FEC_HEADER_SIZE, LEVEL_HEADER_SIZE, SHORT_MASK_BITS};
use rtp_recovery::red::MAX_BLOCK_LENGTH;
use rtp_recovery::RecoveryConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Stream SSRC
    #[serde(default = "default_ssrc")]
    pub ssrc: u32,
    /// Number of media packets to generate
    #[serde(default = "default_packets")]
    pub packets: u32,
    /// Media packets protected by each parity packet
    #[serde(default = "default_group")]
    pub group: usize,
    /// First wire sequence number
    #[serde(default)]
    pub start_seq: u16,
    /// Media payload size in bytes
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    /// Spacing between emitted packets in milliseconds
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
    /// Wire sequence numbers to drop
    #[serde(default)]
    pub drop: Vec<u16>,
    /// Drop every Nth emitted packet
    #[serde(default)]
    pub drop_every: Option<u32>,
    /// Carry parity inside RFC 2198 wrappers instead of standalone packets
    #[serde(default)]
    pub red: bool,
    /// Receive-side recovery settings
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_ssrc() -> u32 {
    0x5EED_0001
}

fn default_packets() -> u32 {
    100
}

fn default_group() -> usize {
    4
}

fn default_payload_size() -> usize {
    960
}

fn default_interval() -> u64 {
    20
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            ssrc: default_ssrc(),
            packets: default_packets(),
            group: default_group(),
            start_seq: 0,
            payload_size: default_payload_size(),
            interval_ms: default_interval(),
            drop: Vec::new(),
            drop_every: None,
            red: false,
            recovery: RecoveryConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: SimConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check the parameters can be simulated
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packets == 0 {
            return Err(ConfigError::Invalid("packets must be at least 1".to_string()));
        }
        if self.group == 0 || self.group as u64 > SHORT_MASK_BITS {
            return Err(ConfigError::Invalid(format!(
                "group must be between 1 and {}",
                SHORT_MASK_BITS
            )));
        }
        if self.drop_every == Some(0) {
            return Err(ConfigError::Invalid("drop_every must be at least 1".to_string()));
        }
        if self.recovery.nack_window == 0 || self.recovery.delivery_history == 0 {
            return Err(ConfigError::Invalid(
                "nack_window and delivery_history must be at least 1".to_string(),
            ));
        }
        if self.payload_size > self.recovery.mtu {
            return Err(ConfigError::Invalid(format!(
                "payload_size {} exceeds mtu {}",
                self.payload_size, self.recovery.mtu
            )));
        }

        let parity_size = FEC_HEADER_SIZE + LEVEL_HEADER_SIZE + self.payload_size;
        if self.red && parity_size > MAX_BLOCK_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "parity of {} bytes does not fit a RED block (max {})",
                parity_size, MAX_BLOCK_LENGTH
            )));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let config: SimConfig = toml::from_str(
            r#"
            packets = 500
            drop = [3, 9]
            red = true

            [recovery]
            nack_window = 64
            "#,
        )
        .unwrap();

        assert_eq!(config.packets, 500);
        assert_eq!(config.drop, vec![3, 9]);
        assert!(config.red);
        assert_eq!(config.group, 4);
        assert_eq!(config.recovery.nack_window, 64);
        assert_eq!(config.recovery.mtu, 1500);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = SimConfig {
            drop_every: Some(7),
            ..SimConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: SimConfig = toml::from_str(&text).unwrap();

        assert_eq!(parsed.drop_every, Some(7));
        assert_eq!(parsed.recovery, config.recovery);
    }

    #[test]
    fn test_invalid() {
        let group = SimConfig {
            group: 17,
            ..SimConfig::default()
        };
        assert!(matches!(group.validate(), Err(ConfigError::Invalid(_))));

        let red = SimConfig {
            red: true,
            payload_size: 1200,
            ..SimConfig::default()
        };
        assert!(matches!(red.validate(), Err(ConfigError::Invalid(_))));

        let every = SimConfig {
            drop_every: Some(0),
            ..SimConfig::default()
        };
        assert!(every.validate().is_err());
    }
}
