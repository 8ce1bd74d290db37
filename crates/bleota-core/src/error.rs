//! Session-level error type.
//!
//! Every fatal condition of an OTA session maps to one variant with a
//! stable numeric code, reported to observers and returned from the run.

use thiserror::Error;

use crate::config::ConfigError;
use crate::payload::PacketizeError;
use crate::protocol::CodecError;
use crate::transport::{Channel, GattStatus, TransportError};

/// Fatal OTA session error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    /// Malformed sector ACK or command frame.
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] CodecError),

    /// Sector ACK index differs from the running counter.
    #[error("Unexpected sector ACK index {actual}, expected {expected}")]
    UnexpectedSectorIndex { expected: u32, actual: u16 },

    #[error("Device reported CRC error for sector {index}")]
    SectorChecksum { index: u16 },

    #[error("Device reported sector index error for sector {index}, device expects {device_expected}")]
    SectorIndex { index: u16, device_expected: u16 },

    #[error("Device reported payload length error for sector {index}")]
    PayloadLength { index: u16 },

    #[error("Unrecognized ACK status 0x{status:04X}")]
    UnknownAckStatus { status: u16 },

    #[error("Service discovery failed with status {status}")]
    DiscoveryFailed { status: GattStatus },

    #[error("Required channel {0} missing on device")]
    MissingChannel(Channel),

    #[error("Device refused start")]
    StartRefused,

    #[error("Device refused end")]
    EndRefused,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Connection failed with status {status}")]
    ConnectionFailed { status: GattStatus },

    #[error("Write to {channel} failed with status {status}")]
    WriteFailed { channel: Channel, status: GattStatus },

    #[error("Enabling notifications on {channel} failed with status {status}")]
    NotificationFailed { channel: Channel, status: GattStatus },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Packetizer error: {0}")]
    Packetize(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl OtaError {
    /// Numeric code reported to the caller.
    pub fn code(&self) -> i32 {
        match self {
            OtaError::Decode(_) => -1,
            OtaError::UnexpectedSectorIndex { .. } => 1,
            OtaError::SectorChecksum { .. } => 2,
            OtaError::SectorIndex { .. } => 3,
            OtaError::PayloadLength { .. } => 4,
            OtaError::UnknownAckStatus { .. } => 5,
            OtaError::DiscoveryFailed { .. } => 10,
            OtaError::MissingChannel(_) => 11,
            OtaError::StartRefused => 20,
            OtaError::EndRefused => 21,
            OtaError::Disconnected => 30,
            OtaError::ConnectionFailed { .. } => 31,
            OtaError::WriteFailed { .. } => 32,
            OtaError::NotificationFailed { .. } => 33,
            OtaError::Transport(_) => 34,
            OtaError::Packetize(_) | OtaError::Config(_) => 40,
        }
    }
}

impl From<TransportError> for OtaError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Disconnected | TransportError::NotConnected => OtaError::Disconnected,
            other => OtaError::Transport(other.to_string()),
        }
    }
}

impl From<PacketizeError> for OtaError {
    fn from(e: PacketizeError) -> Self {
        OtaError::Packetize(e.to_string())
    }
}
