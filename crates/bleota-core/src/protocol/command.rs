//! Command channel codec.
//!
//! Every frame on the command channel is exactly 20 bytes:
//!
//! ```text
//! [0..2]   command id (u16 LE)
//! [2..18]  payload, zero padded
//! [18..20] CRC16 over bytes 0..18 (u16 LE)
//! ```

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::*;
use super::crc::crc16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },
    #[error("Payload too long: max {max} bytes, got {actual}")]
    PayloadTooLong { max: usize, actual: usize },
    #[error("Checksum mismatch: frame carries 0x{actual:04X}, computed 0x{expected:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("Not an ACK frame: command id 0x{0:04X}")]
    NotAnAck(u16),
}

/// Decoded command channel frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    pub id: u16,
    pub payload: [u8; COMMAND_PAYLOAD_SIZE],
}

impl CommandPacket {
    /// Build a command from an id and up to 16 payload bytes.
    pub fn new(id: u16, payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() > COMMAND_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLong {
                max: COMMAND_PAYLOAD_SIZE,
                actual: payload.len(),
            });
        }
        let mut buf = [0u8; COMMAND_PAYLOAD_SIZE];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self { id, payload: buf })
    }

    /// START command announcing the total image length.
    pub fn start(image_len: u32) -> Self {
        let mut payload = [0u8; COMMAND_PAYLOAD_SIZE];
        LittleEndian::write_u32(&mut payload[..4], image_len);
        Self {
            id: COMMAND_ID_START,
            payload,
        }
    }

    /// END command (empty payload).
    pub fn end() -> Self {
        Self {
            id: COMMAND_ID_END,
            payload: [0; COMMAND_PAYLOAD_SIZE],
        }
    }

    /// ACK frame, as sent by the device.
    pub fn ack(command_id: u16, status: u16) -> Self {
        let mut payload = [0u8; COMMAND_PAYLOAD_SIZE];
        LittleEndian::write_u16(&mut payload[0..2], command_id);
        LittleEndian::write_u16(&mut payload[2..4], status);
        Self {
            id: COMMAND_ID_ACK,
            payload,
        }
    }

    /// Encode into a 20-byte frame with CRC trailer.
    pub fn encode(&self) -> [u8; COMMAND_PACKET_SIZE] {
        let mut frame = [0u8; COMMAND_PACKET_SIZE];
        LittleEndian::write_u16(&mut frame[0..2], self.id);
        frame[2..COMMAND_CRC_OFFSET].copy_from_slice(&self.payload);
        let crc = crc16(&frame[..COMMAND_CRC_OFFSET]);
        LittleEndian::write_u16(&mut frame[COMMAND_CRC_OFFSET..], crc);
        frame
    }

    /// Decode a received frame.
    ///
    /// The trailer is only checked when `verify_checksum` is set; callers
    /// drop frames that fail with [`CodecError::ChecksumMismatch`].
    pub fn decode(frame: &[u8], verify_checksum: bool) -> Result<Self, CodecError> {
        if frame.len() < COMMAND_PACKET_SIZE {
            return Err(CodecError::FrameTooShort {
                expected: COMMAND_PACKET_SIZE,
                actual: frame.len(),
            });
        }

        if verify_checksum {
            let actual = LittleEndian::read_u16(&frame[COMMAND_CRC_OFFSET..]);
            let expected = crc16(&frame[..COMMAND_CRC_OFFSET]);
            if actual != expected {
                return Err(CodecError::ChecksumMismatch { expected, actual });
            }
        }

        let mut payload = [0u8; COMMAND_PAYLOAD_SIZE];
        payload.copy_from_slice(&frame[2..COMMAND_CRC_OFFSET]);
        Ok(Self {
            id: LittleEndian::read_u16(&frame[0..2]),
            payload,
        })
    }

    pub fn is_ack(&self) -> bool {
        self.id == COMMAND_ID_ACK
    }

    /// Interpret the payload as an ACK.
    pub fn as_ack(&self) -> Result<CommandAck, CodecError> {
        if !self.is_ack() {
            return Err(CodecError::NotAnAck(self.id));
        }
        Ok(CommandAck {
            command_id: LittleEndian::read_u16(&self.payload[0..2]),
            status: CommandAckStatus::from_raw(LittleEndian::read_u16(&self.payload[2..4])),
        })
    }
}

/// Device answer to a START or END command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub command_id: u16,
    pub status: CommandAckStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAckStatus {
    Accept,
    Refuse,
    Unknown(u16),
}

impl CommandAckStatus {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            COMMAND_ACK_ACCEPT => Self::Accept,
            COMMAND_ACK_REFUSE => Self::Refuse,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(&self) -> u16 {
        match self {
            Self::Accept => COMMAND_ACK_ACCEPT,
            Self::Refuse => COMMAND_ACK_REFUSE,
            Self::Unknown(raw) => *raw,
        }
    }
}

impl fmt::Display for CommandAckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Refuse => write!(f, "refuse"),
            Self::Unknown(raw) => write!(f, "unknown(0x{raw:04X})"),
        }
    }
}

/// Human-readable name of a command id.
pub fn command_name(id: u16) -> &'static str {
    match id {
        COMMAND_ID_START => "START",
        COMMAND_ID_END => "END",
        COMMAND_ID_ACK => "ACK",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_frame_layout() {
        let frame = CommandPacket::start(8000).encode();
        assert_eq!(frame.len(), COMMAND_PACKET_SIZE);
        assert_eq!(&frame[0..2], &[0x01, 0x00]);
        assert_eq!(&frame[2..6], &[0x40, 0x1F, 0x00, 0x00]);
        assert!(frame[6..18].iter().all(|&b| b == 0));
        assert_eq!(&frame[18..20], &[0x41, 0x6D]);
    }

    #[test]
    fn test_end_frame_layout() {
        let frame = CommandPacket::end().encode();
        assert_eq!(&frame[0..2], &[0x02, 0x00]);
        assert_eq!(&frame[18..20], &[0x43, 0xF0]);
    }

    #[test]
    fn test_roundtrip_ids_and_payload_lengths() {
        for id in [COMMAND_ID_START, COMMAND_ID_END, COMMAND_ID_ACK] {
            for len in 0..=COMMAND_PAYLOAD_SIZE {
                let payload: Vec<u8> = (1..=len as u8).collect();
                let frame = CommandPacket::new(id, &payload).unwrap().encode();
                let decoded = CommandPacket::decode(&frame, true).unwrap();
                assert_eq!(decoded.id, id);
                assert_eq!(&decoded.payload[..len], &payload[..]);
                assert!(decoded.payload[len..].iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn test_payload_too_long() {
        let err = CommandPacket::new(COMMAND_ID_START, &[0; 17]).unwrap_err();
        assert_eq!(err, CodecError::PayloadTooLong { max: 16, actual: 17 });
    }

    #[test]
    fn test_short_frame_rejected() {
        let err = CommandPacket::decode(&[0x03, 0x00, 0x01], false).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooShort { actual: 3, .. }));
    }

    #[test]
    fn test_checksum_only_checked_on_request() {
        let mut frame = CommandPacket::ack(COMMAND_ID_START, COMMAND_ACK_ACCEPT).encode();
        frame[19] ^= 0xFF;
        assert!(CommandPacket::decode(&frame, false).is_ok());
        assert!(matches!(
            CommandPacket::decode(&frame, true),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_ack_payload() {
        let frame = CommandPacket::ack(COMMAND_ID_END, COMMAND_ACK_REFUSE).encode();
        let ack = CommandPacket::decode(&frame, true).unwrap().as_ack().unwrap();
        assert_eq!(ack.command_id, COMMAND_ID_END);
        assert_eq!(ack.status, CommandAckStatus::Refuse);

        let odd = CommandPacket::ack(COMMAND_ID_START, 7).as_ack().unwrap();
        assert_eq!(odd.status, CommandAckStatus::Unknown(7));
        assert!(CommandPacket::end().as_ack().is_err());
    }
}
