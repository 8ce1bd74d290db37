//! Session configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::Packetizer;
use crate::protocol::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mtu_request {0} is below the BLE minimum of 23")]
    MtuTooSmall(u16),
    #[error("packet_size {packet_size} is smaller than fallback_packet_size {fallback}")]
    PacketSizeBelowFallback { packet_size: usize, fallback: usize },
    #[error("packet_size {0} exceeds the largest ATT payload (514)")]
    PacketSizeTooLarge(usize),
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

const MIN_MTU_REQUEST: u16 = MIN_MTU;
const MAX_ATT_PAYLOAD: usize = MAX_PACKET_SIZE;

/// Configuration for an OTA session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// MTU requested right after connecting.
    pub mtu_request: u16,
    /// Packet size once the MTU exchange succeeded (capped by MTU - 3).
    pub packet_size: usize,
    /// Packet size when the MTU exchange failed.
    pub fallback_packet_size: usize,
    /// Sector size; fixed by the bootloader.
    pub sector_size: usize,
    /// Check the CRC trailer of received command frames.
    pub verify_command_checksum: bool,
    /// Abort when enabling notifications on a channel fails.
    pub strict_notifications: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            mtu_request: MTU_REQUEST,
            packet_size: EXPECT_PACKET_SIZE,
            fallback_packet_size: DEFAULT_PACKET_SIZE,
            sector_size: SECTOR_SIZE,
            verify_command_checksum: false,
            strict_notifications: false,
        }
    }
}

impl OtaConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OtaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu_request < MIN_MTU_REQUEST {
            return Err(ConfigError::MtuTooSmall(self.mtu_request));
        }
        if self.packet_size > MAX_ATT_PAYLOAD {
            return Err(ConfigError::PacketSizeTooLarge(self.packet_size));
        }
        if self.packet_size < self.fallback_packet_size {
            return Err(ConfigError::PacketSizeBelowFallback {
                packet_size: self.packet_size,
                fallback: self.fallback_packet_size,
            });
        }
        if self.sector_size == 0 || self.sector_size > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid {
                field: "sector_size",
                message: format!("must be between 1 and 65535, got {}", self.sector_size),
            });
        }
        // The smaller packet size gives the most blocks per sector.
        Packetizer::new(self.fallback_packet_size, self.sector_size).map_err(|e| {
            ConfigError::Invalid {
                field: "fallback_packet_size",
                message: e.to_string(),
            }
        })?;
        Ok(())
    }

    /// Packet size for a finished MTU exchange; `None` means it failed.
    pub fn packet_size_for_mtu(&self, mtu: Option<u16>) -> usize {
        match mtu {
            Some(mtu) => usize::from(mtu)
                .saturating_sub(ATT_HEADER_SIZE)
                .min(self.packet_size)
                .max(self.fallback_packet_size),
            None => self.fallback_packet_size,
        }
    }
}
