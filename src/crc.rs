//! Checksums used by the pump radio protocol.
//!
//! Every frame carries a CRC8 trailer. History pages additionally end with a
//! big-endian CRC16 over the whole reassembled page.

const CRC8_POLY: u8 = 0x9B;
const CRC16_POLY: u16 = 0x1021;
const CRC16_SEED: u16 = 0xFFFF;

const CRC8_TABLE: [u8; 256] = crc8_table();

const fn crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC8 (poly 0x9B, seed 0x00, MSB first) appended to every frame.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &b| CRC8_TABLE[(crc ^ b) as usize])
}

/// CRC16 (poly 0x1021, seed 0xFFFF, MSB first, no final xor) over a
/// history page.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC16_SEED, |mut crc, &b| {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
        }
        crc
    })
}
