//! Payload handling module.
//!
//! Provides the firmware image container and the sector/block packetizer.

pub mod firmware;
pub mod packetizer;

pub use firmware::{FirmwareError, FirmwareImage, Sector};
pub use packetizer::{
    FirmwarePacket, OutgoingItem, PacketQueue, PacketizeError, Packetizer, packetize,
};
