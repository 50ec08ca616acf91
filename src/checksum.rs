//! CRC-16/X-25 (ISO 3309) для блока состояния и тела handshake.

const POLY_REFLECTED: u16 = 0x8408;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Контрольная сумма диапазона байт.
pub fn checksum(bytes: &[u8]) -> u16 {
    let crc = bytes.iter().fold(0xFFFFu16, |crc, &b| {
        (crc >> 8) ^ TABLE[((crc ^ b as u16) & 0xFF) as usize]
    });
    !crc
}
