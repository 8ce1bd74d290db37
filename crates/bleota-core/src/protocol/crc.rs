//! CRC16 used by the OTA bootloader.
//!
//! CRC-16/XMODEM: polynomial 0x1021, initial value 0, MSB first,
//! no reflection and no final XOR. Covers both firmware sectors and
//! the first 18 bytes of every command packet.

const POLY: u16 = 0x1021;

/// Compute the CRC16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| update(crc, byte))
}

/// Compute the CRC16 of `data[offset..offset + len]`.
///
/// # Panics
///
/// Panics if the range is out of bounds.
pub fn crc16_range(data: &[u8], offset: usize, len: usize) -> u16 {
    crc16(&data[offset..offset + len])
}

fn update(mut crc: u16, byte: u8) -> u16 {
    crc ^= u16::from(byte) << 8;
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ POLY
        } else {
            crc << 1
        };
    }
    crc
}
