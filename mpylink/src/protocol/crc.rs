//! CRC16 used by the frame codec.
//!
//! Nibble-wise table variant of the reflected 0xA001 polynomial with an
//! initial value of 0xFFFF. Each byte is folded in two steps, low nibble
//! first.

/// Nibble lookup table.
const CRC16_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
    0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

/// Initial CRC register value.
pub const CRC16_INIT: u16 = 0xFFFF;

/// Compute the frame CRC16 over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter()
        .fold(CRC16_INIT, |crc, &byte| crc16_update(crc, byte))
}

/// Fold a single byte into a running CRC.
#[inline]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let crc = CRC16_TABLE[usize::from((u16::from(byte) ^ crc) & 0x0F)] ^ (crc >> 4);
    CRC16_TABLE[usize::from((u16::from(byte >> 4) ^ crc) & 0x0F)] ^ (crc >> 4)
}
