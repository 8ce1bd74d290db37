//! Protocol module - OTA wire format definitions.

pub mod command;
pub mod constants;
pub mod crc;
pub mod sector_ack;

pub use command::{CodecError, CommandAck, CommandAckStatus, CommandPacket};
pub use constants::*;
pub use crc::{crc16, crc16_range};
pub use sector_ack::{SectorAck, SectorAckStatus};
