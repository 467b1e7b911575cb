//! SD SPI-mode command protocol: command numbers, response formats,
//! control tokens and CSD register decoding.

/// Command packet length: command byte + 4 argument bytes + CRC byte
pub const PACKET_SIZE: usize = 6;

/// Transmission bit OR'd into every command byte
pub fn cmd_byte(cmd: u8) -> u8 {
    0x40 | (cmd & 0x3F)
}

// Commands used by the driver
pub const CMD0_GO_IDLE_STATE: u8 = 0;
pub const CMD8_SEND_IF_COND: u8 = 8;
pub const CMD9_SEND_CSD: u8 = 9;
pub const CMD12_STOP_TRANSMISSION: u8 = 12;
pub const CMD16_SET_BLOCKLEN: u8 = 16;
pub const CMD17_READ_SINGLE_BLOCK: u8 = 17;
pub const CMD18_READ_MULTIPLE_BLOCK: u8 = 18;
pub const CMD24_WRITE_BLOCK: u8 = 24;
pub const CMD25_WRITE_MULTIPLE_BLOCK: u8 = 25;
pub const CMD32_ERASE_WR_BLK_START_ADDR: u8 = 32;
pub const CMD33_ERASE_WR_BLK_END_ADDR: u8 = 33;
pub const CMD38_ERASE: u8 = 38;
pub const CMD55_APP_CMD: u8 = 55;
pub const CMD58_READ_OCR: u8 = 58;
pub const CMD59_CRC_ON_OFF: u8 = 59;
pub const ACMD23_SET_WR_BLK_ERASE_COUNT: u8 = 23;
pub const ACMD41_SD_SEND_OP_COND: u8 = 41;

// R1 response bits
pub const R1_NO_RESPONSE: u8 = 0xFF;
pub const R1_RESPONSE_RECV: u8 = 0x80;
pub const R1_IDLE_STATE: u8 = 1 << 0;
pub const R1_ERASE_RESET: u8 = 1 << 1;
pub const R1_ILLEGAL_COMMAND: u8 = 1 << 2;
pub const R1_COM_CRC_ERROR: u8 = 1 << 3;
pub const R1_ERASE_SEQUENCE_ERROR: u8 = 1 << 4;
pub const R1_ADDRESS_ERROR: u8 = 1 << 5;
pub const R1_PARAMETER_ERROR: u8 = 1 << 6;

// OCR register bits (R3 response)
pub const OCR_HCS_CCS: u32 = 0x1 << 30;
pub const OCR_3_3V: u32 = 0x1 << 20;

/// Check pattern echoed by CMD8 (R7 response)
pub const CMD8_PATTERN: u32 = 0xAA;
/// Supply-voltage field of the CMD8 argument: 2.7-3.6 V
pub const CMD8_VHS_3V3: u32 = 0x1 << 8;

// Control tokens
pub const SPI_DATA_RESPONSE_MASK: u8 = 0x1F;
pub const SPI_DATA_ACCEPTED: u8 = 0x05;
pub const SPI_START_BLOCK: u8 = 0xFE;
pub const SPI_START_BLK_MUL_WRITE: u8 = 0xFC;
pub const SPI_STOP_TRAN: u8 = 0xFD;

/// Data block size; CMD16 pins non-HC cards to the same value
pub const BLOCK_SIZE: usize = 512;

/// Card variant detected during initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    /// Nothing detected yet, or handshake failed
    Unknown,
    /// SD version 1.x, byte addressed
    V1,
    /// SD version 2.x standard capacity, byte addressed
    V2,
    /// SD version 2.x high capacity, block addressed
    V2Hc,
}

impl CardType {
    /// Whether commands take 512-byte block addresses instead of bytes
    pub fn block_addressed(&self) -> bool {
        matches!(self, CardType::V2Hc)
    }
}

/// Extract bits `[msb:lsb]` of a 128-bit big-endian register (CSD layout)
pub fn ext_bits(data: &[u8; 16], msb: u32, lsb: u32) -> u32 {
    let mut bits = 0u32;
    for i in 0..=(msb - lsb) {
        let position = lsb + i;
        let byte = 15 - (position >> 3) as usize;
        let bit = position & 0x7;
        let value = (data[byte] >> bit) as u32 & 1;
        bits |= value << i;
    }
    bits
}

/// Capacity and erase geometry decoded from the CSD register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsdInfo {
    /// Number of 512-byte sectors
    pub sectors: u64,
    /// Erase unit in bytes
    pub erase_size: usize,
}

/// Decode a CSD register into sector count and erase geometry.
///
/// Returns `None` for CSD structure versions the driver does not support.
pub fn decode_csd(csd: &[u8; 16]) -> Option<CsdInfo> {
    match ext_bits(csd, 127, 126) {
        0 => {
            // CSD v1: capacity from C_SIZE / C_SIZE_MULT / READ_BL_LEN
            let c_size = ext_bits(csd, 73, 62);
            let c_size_mult = ext_bits(csd, 49, 47);
            let read_bl_len = ext_bits(csd, 83, 80);
            let block_len = 1u64 << read_bl_len;
            let mult = 1u64 << (c_size_mult + 2);
            let blocknr = (c_size as u64 + 1) * mult;
            let capacity = blocknr * block_len;

            let erase_size = if ext_bits(csd, 46, 46) == 1 {
                BLOCK_SIZE
            } else {
                BLOCK_SIZE * (ext_bits(csd, 45, 39) as usize + 1)
            };

            Some(CsdInfo {
                sectors: capacity / BLOCK_SIZE as u64,
                erase_size,
            })
        }
        1 => {
            // CSD v2: capacity = (C_SIZE + 1) * 512 KiB
            let hc_c_size = ext_bits(csd, 69, 48);
            Some(CsdInfo {
                sectors: (hc_c_size as u64 + 1) << 10,
                erase_size: BLOCK_SIZE,
            })
        }
        _ => None,
    }
}

/// Build a CSD v2 register for a card of `sectors` 512-byte sectors.
/// Used by the in-memory card emulator.
pub fn encode_csd_v2(sectors: u64) -> [u8; 16] {
    let mut csd = [0u8; 16];
    let c_size = (sectors >> 10) as u32 - 1;

    let set = |csd: &mut [u8; 16], msb: u32, lsb: u32, value: u32| {
        for i in 0..=(msb - lsb) {
            let position = lsb + i;
            let byte = 15 - (position >> 3) as usize;
            let bit = position & 0x7;
            if (value >> i) & 1 == 1 {
                csd[byte] |= 1 << bit;
            }
        }
    };

    set(&mut csd, 127, 126, 1); // CSD structure v2
    set(&mut csd, 69, 48, c_size);
    csd
}
