//! Firmware packetizer.
//!
//! Splits an image into sectors and each sector into transport-sized
//! blocks. Every block becomes one write on the firmware receive channel:
//!
//! ```text
//! [0..2] sector index (u16 LE)
//! [2]    block sequence, 0xFF for the last block of the sector
//! [3..]  block payload
//! [..+2] CRC16 of the whole sector (u16 LE, last block only)
//! ```
//!
//! A [`OutgoingItem::SectorAckMarker`] follows the last block of every
//! sector; the sender must wait for the device's sector ACK there.

use std::collections::VecDeque;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;

use crate::protocol::command::CodecError;
use crate::protocol::constants::*;
use crate::protocol::crc::crc16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketizeError {
    #[error("Packet size {packet_size} leaves no room for payload after the 3-byte header")]
    PacketTooSmall { packet_size: usize },
    #[error("Sector size must be between 1 and {max} bytes, got {actual}")]
    InvalidSectorSize { actual: usize, max: usize },
    #[error("A {sector_size}-byte sector needs {blocks} blocks of {max_payload} bytes, at most 256 fit the sequence field")]
    TooManyBlocks {
        sector_size: usize,
        max_payload: usize,
        blocks: usize,
    },
    #[error("Image needs {sectors} sectors, at most 65536 are addressable")]
    TooManySectors { sectors: usize },
}

/// One framed block, ready to be written to the firmware receive channel.
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwarePacket {
    bytes: Vec<u8>,
}

impl FirmwarePacket {
    fn build(sector_index: u16, sequence: u8, block: &[u8], sector_crc: Option<u16>) -> Self {
        let len = PACKET_HEADER_SIZE + block.len() + sector_crc.map_or(0, |_| SECTOR_CRC_SIZE);
        let mut bytes = Vec::with_capacity(len);
        bytes.write_u16::<LittleEndian>(sector_index).unwrap();
        bytes.push(sequence);
        bytes.extend_from_slice(block);
        if let Some(crc) = sector_crc {
            bytes.write_u16::<LittleEndian>(crc).unwrap();
        }
        Self { bytes }
    }

    /// Parse a packet as received by the device side.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let min = if data.len() > 2 && data[2] == LAST_BLOCK_SEQUENCE {
            PACKET_HEADER_SIZE + SECTOR_CRC_SIZE
        } else {
            PACKET_HEADER_SIZE
        };
        if data.len() < min {
            return Err(CodecError::FrameTooShort {
                expected: min,
                actual: data.len(),
            });
        }
        Ok(Self {
            bytes: data.to_vec(),
        })
    }

    pub fn sector_index(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[0..2])
    }

    pub fn sequence(&self) -> u8 {
        self.bytes[2]
    }

    pub fn is_last_block(&self) -> bool {
        self.sequence() == LAST_BLOCK_SEQUENCE
    }

    /// Block payload without header and CRC trailer.
    pub fn payload(&self) -> &[u8] {
        let end = if self.is_last_block() {
            self.bytes.len() - SECTOR_CRC_SIZE
        } else {
            self.bytes.len()
        };
        &self.bytes[PACKET_HEADER_SIZE..end]
    }

    /// CRC16 of the whole sector, carried by the last block only.
    pub fn sector_crc(&self) -> Option<u16> {
        self.is_last_block()
            .then(|| LittleEndian::read_u16(&self.bytes[self.bytes.len() - SECTOR_CRC_SIZE..]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for FirmwarePacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwarePacket")
            .field("sector", &self.sector_index())
            .field("sequence", &format_args!("0x{:02X}", self.sequence()))
            .field("payload_len", &self.payload().len())
            .field("crc", &self.sector_crc())
            .finish()
    }
}

/// Entry of the outgoing queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingItem {
    Packet(FirmwarePacket),
    /// Barrier: wait for the ACK of `sector_index` before going on.
    SectorAckMarker { sector_index: u16 },
}

/// Ordered packets and barriers for one transfer.
#[derive(Debug, Default, Clone)]
pub struct PacketQueue {
    items: VecDeque<OutgoingItem>,
    packet_count: usize,
    sector_count: usize,
    payload_bytes: usize,
}

impl PacketQueue {
    pub fn pop_front(&mut self) -> Option<OutgoingItem> {
        self.items.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutgoingItem> {
        self.items.iter()
    }

    /// Firmware packets only, in send order.
    pub fn packets(&self) -> impl Iterator<Item = &FirmwarePacket> {
        self.items.iter().filter_map(|item| match item {
            OutgoingItem::Packet(packet) => Some(packet),
            OutgoingItem::SectorAckMarker { .. } => None,
        })
    }

    /// Items left, markers included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Packets at build time.
    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    /// Sectors at build time.
    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    /// Firmware bytes carried by the queue at build time.
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }
}

/// Sector/block splitter for a fixed packet and sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packetizer {
    sector_size: usize,
    max_payload: usize,
}

impl Packetizer {
    pub fn new(packet_size: usize, sector_size: usize) -> Result<Self, PacketizeError> {
        if packet_size <= PACKET_HEADER_SIZE {
            return Err(PacketizeError::PacketTooSmall { packet_size });
        }
        if sector_size == 0 || sector_size > u16::MAX as usize {
            return Err(PacketizeError::InvalidSectorSize {
                actual: sector_size,
                max: u16::MAX as usize,
            });
        }
        let max_payload = packet_size - PACKET_HEADER_SIZE;
        let blocks = sector_size.div_ceil(max_payload);
        if blocks > MAX_BLOCKS_PER_SECTOR {
            return Err(PacketizeError::TooManyBlocks {
                sector_size,
                max_payload,
                blocks,
            });
        }
        Ok(Self {
            sector_size,
            max_payload,
        })
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn packetize(&self, image: &[u8]) -> Result<PacketQueue, PacketizeError> {
        let sectors = image.len().div_ceil(self.sector_size);
        if sectors > MAX_SECTORS {
            return Err(PacketizeError::TooManySectors { sectors });
        }

        let mut queue = PacketQueue::default();
        for (index, sector) in image.chunks(self.sector_size).enumerate() {
            // bounded by MAX_SECTORS above
            let sector_index = index as u16;
            let crc = crc16(sector);
            let blocks = sector.chunks(self.max_payload);
            let last = blocks.len() - 1;

            for (ordinal, block) in blocks.enumerate() {
                let packet = if ordinal == last {
                    FirmwarePacket::build(sector_index, LAST_BLOCK_SEQUENCE, block, Some(crc))
                } else {
                    FirmwarePacket::build(sector_index, ordinal as u8, block, None)
                };
                queue.items.push_back(OutgoingItem::Packet(packet));
                queue.packet_count += 1;
            }

            queue
                .items
                .push_back(OutgoingItem::SectorAckMarker { sector_index });
            queue.sector_count += 1;
            queue.payload_bytes += sector.len();
        }

        tracing::debug!(
            sectors = queue.sector_count,
            packets = queue.packet_count,
            max_payload = self.max_payload,
            "Packet queue built"
        );
        Ok(queue)
    }
}

/// Packetize `image` into [`SECTOR_SIZE`] sectors with blocks of at most
/// `max_payload` bytes.
pub fn packetize(image: &[u8], max_payload: usize) -> Result<PacketQueue, PacketizeError> {
    Packetizer::new(max_payload + PACKET_HEADER_SIZE, SECTOR_SIZE)?.packetize(image)
}
