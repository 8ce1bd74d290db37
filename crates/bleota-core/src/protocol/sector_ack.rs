//! Sector acknowledgement frames (device -> host, firmware receive channel).
//!
//! ```text
//! [0..2] acked sector index (u16 LE)
//! [2..4] status (u16 LE)
//! [4..6] sector index the device expects (u16 LE, only for status 2)
//! ```

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::command::CodecError;
use super::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorAckStatus {
    Success,
    CrcError,
    /// Device wanted a different sector.
    SectorIndexError { expected: u16 },
    PayloadLengthError,
    Unknown(u16),
}

impl SectorAckStatus {
    pub fn raw(&self) -> u16 {
        match self {
            Self::Success => SECTOR_ACK_SUCCESS,
            Self::CrcError => SECTOR_ACK_CRC_ERROR,
            Self::SectorIndexError { .. } => SECTOR_ACK_INDEX_ERROR,
            Self::PayloadLengthError => SECTOR_ACK_PAYLOAD_LENGTH_ERROR,
            Self::Unknown(raw) => *raw,
        }
    }
}

impl fmt::Display for SectorAckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::CrcError => write!(f, "crc error"),
            Self::SectorIndexError { expected } => {
                write!(f, "sector index error (device expects {expected})")
            }
            Self::PayloadLengthError => write!(f, "payload length error"),
            Self::Unknown(raw) => write!(f, "unknown(0x{raw:04X})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorAck {
    pub index: u16,
    pub status: SectorAckStatus,
}

impl SectorAck {
    pub const MIN_SIZE: usize = 4;
    pub const INDEX_ERROR_SIZE: usize = 6;

    pub fn new(index: u16, status: SectorAckStatus) -> Self {
        Self { index, status }
    }

    /// Acknowledged sector index alone; needs only the first two bytes.
    pub fn index_of(data: &[u8]) -> Result<u16, CodecError> {
        read_u16(&mut Cursor::new(data), data.len())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::MIN_SIZE {
            return Err(CodecError::FrameTooShort {
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let index = read_u16(&mut cursor, data.len())?;
        let raw_status = read_u16(&mut cursor, data.len())?;
        let status = match raw_status {
            SECTOR_ACK_SUCCESS => SectorAckStatus::Success,
            SECTOR_ACK_CRC_ERROR => SectorAckStatus::CrcError,
            SECTOR_ACK_INDEX_ERROR => {
                if data.len() < Self::INDEX_ERROR_SIZE {
                    return Err(CodecError::FrameTooShort {
                        expected: Self::INDEX_ERROR_SIZE,
                        actual: data.len(),
                    });
                }
                SectorAckStatus::SectorIndexError {
                    expected: read_u16(&mut cursor, data.len())?,
                }
            }
            SECTOR_ACK_PAYLOAD_LENGTH_ERROR => SectorAckStatus::PayloadLengthError,
            other => SectorAckStatus::Unknown(other),
        };
        Ok(Self { index, status })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::INDEX_ERROR_SIZE);
        buf.write_u16::<LittleEndian>(self.index).unwrap();
        buf.write_u16::<LittleEndian>(self.status.raw()).unwrap();
        if let SectorAckStatus::SectorIndexError { expected } = self.status {
            buf.write_u16::<LittleEndian>(expected).unwrap();
        }
        buf
    }
}

fn read_u16(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<u16, CodecError> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| CodecError::FrameTooShort {
            expected: cursor.position() as usize + 2,
            actual: len,
        })
}
