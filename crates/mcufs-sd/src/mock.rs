//! In-memory SD card emulator
//!
//! Implements [`SpiBus`] and speaks the SPI-mode command protocol against
//! a RAM image: R1/R3/R7 responses, CSD, data tokens and CRCs. Useful for
//! driver tests and host development without real hardware.

use std::collections::VecDeque;

use crate::bus::SpiBus;
use crate::crc::{crc7, crc16};
use crate::protocol::*;

/// Configuration of the emulated card
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Capacity in bytes; must be a multiple of 512 KiB so the CSD v2
    /// C_SIZE field is exact
    pub capacity: usize,
    /// Emulate a high-capacity (block addressed) card
    pub high_capacity: bool,
    /// ACMD41 polls answered with the idle bit before init completes
    pub acmd41_idle_polls: u32,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            capacity: 4 * 1024 * 1024,
            high_capacity: true,
            acmd41_idle_polls: 2,
        }
    }
}

enum IoState {
    /// Assembling 6-byte command packets
    Command,
    /// CMD24/CMD25 accepted, waiting for a data token
    WriteWait { multi: bool },
    /// Collecting payload + CRC after a data token
    WriteData { multi: bool, buf: Vec<u8> },
}

/// Emulated SD card on the far side of the SPI bus
pub struct MockCard {
    config: MockConfig,
    storage: Vec<u8>,
    selected: bool,
    clock_hz: u32,
    crc_enabled: bool,
    idle: bool,
    acmd41_polls_left: u32,
    app_cmd: bool,
    cmd_buf: Vec<u8>,
    tx: VecDeque<u8>,
    state: IoState,
    write_addr: usize,
    multi_read_addr: Option<usize>,
    erase_range: (Option<usize>, Option<usize>),
}

impl MockCard {
    /// Create a card full of 0x00 bytes
    pub fn new(config: MockConfig) -> Self {
        assert!(config.capacity % (512 * 1024) == 0);
        let storage = vec![0u8; config.capacity];
        Self {
            config,
            storage,
            selected: false,
            clock_hz: 0,
            crc_enabled: false,
            idle: true,
            acmd41_polls_left: 0,
            app_cmd: false,
            cmd_buf: Vec::with_capacity(PACKET_SIZE),
            tx: VecDeque::new(),
            state: IoState::Command,
            write_addr: 0,
            multi_read_addr: None,
            erase_range: (None, None),
        }
    }

    /// Card with the default configuration
    pub fn new_default() -> Self {
        Self::new(MockConfig::default())
    }

    /// Raw card contents
    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    /// Mutable card contents, for pre-seeding images
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    fn r1(&self) -> u8 {
        if self.idle {
            R1_IDLE_STATE
        } else {
            0x00
        }
    }

    fn byte_addr(&self, arg: u32) -> usize {
        if self.config.high_capacity {
            arg as usize * BLOCK_SIZE
        } else {
            arg as usize
        }
    }

    fn queue_block(&mut self, addr: usize) {
        self.tx.push_back(SPI_START_BLOCK);
        let block = &self.storage[addr..addr + BLOCK_SIZE];
        let crc = crc16(block);
        self.tx.extend(block.iter().copied());
        self.tx.push_back((crc >> 8) as u8);
        self.tx.push_back(crc as u8);
    }

    fn execute(&mut self) {
        let cmd = self.cmd_buf[0] & 0x3F;
        let arg = u32::from_be_bytes([
            self.cmd_buf[1],
            self.cmd_buf[2],
            self.cmd_buf[3],
            self.cmd_buf[4],
        ]);

        if self.crc_enabled {
            let expected = (crc7(&self.cmd_buf[..5]) << 1) | 0x01;
            if self.cmd_buf[5] != expected {
                self.tx.push_back(self.r1() | R1_COM_CRC_ERROR);
                self.app_cmd = false;
                return;
            }
        }

        let acmd = self.app_cmd;
        self.app_cmd = false;

        match (cmd, acmd) {
            (CMD0_GO_IDLE_STATE, _) => {
                self.idle = true;
                self.acmd41_polls_left = self.config.acmd41_idle_polls;
                self.tx.push_back(R1_IDLE_STATE);
            }
            (CMD8_SEND_IF_COND, _) => {
                // R7: echo the voltage range and check pattern
                self.tx.push_back(self.r1());
                self.tx.extend(arg.to_be_bytes());
            }
            (CMD58_READ_OCR, _) => {
                self.tx.push_back(self.r1());
                let mut ocr = OCR_3_3V;
                if self.config.high_capacity && !self.idle {
                    ocr |= OCR_HCS_CCS;
                }
                self.tx.extend(ocr.to_be_bytes());
            }
            (CMD59_CRC_ON_OFF, _) => {
                self.crc_enabled = arg & 1 == 1;
                self.tx.push_back(self.r1());
            }
            (CMD55_APP_CMD, _) => {
                self.app_cmd = true;
                self.tx.push_back(self.r1());
            }
            (ACMD41_SD_SEND_OP_COND, true) => {
                if self.acmd41_polls_left > 0 {
                    self.acmd41_polls_left -= 1;
                    self.tx.push_back(R1_IDLE_STATE);
                } else {
                    self.idle = false;
                    self.tx.push_back(0x00);
                }
            }
            (CMD9_SEND_CSD, _) => {
                self.tx.push_back(self.r1());
                let csd = encode_csd_v2((self.config.capacity / BLOCK_SIZE) as u64);
                let crc = crc16(&csd);
                self.tx.push_back(SPI_START_BLOCK);
                self.tx.extend(csd);
                self.tx.push_back((crc >> 8) as u8);
                self.tx.push_back(crc as u8);
            }
            (CMD16_SET_BLOCKLEN, _) => {
                let response = if arg as usize == BLOCK_SIZE {
                    0x00
                } else {
                    R1_PARAMETER_ERROR
                };
                self.tx.push_back(response);
            }
            (CMD17_READ_SINGLE_BLOCK, _) => {
                let addr = self.byte_addr(arg);
                if addr + BLOCK_SIZE > self.storage.len() {
                    self.tx.push_back(R1_ADDRESS_ERROR);
                } else {
                    self.tx.push_back(0x00);
                    self.queue_block(addr);
                }
            }
            (CMD18_READ_MULTIPLE_BLOCK, _) => {
                let addr = self.byte_addr(arg);
                if addr + BLOCK_SIZE > self.storage.len() {
                    self.tx.push_back(R1_ADDRESS_ERROR);
                } else {
                    self.tx.push_back(0x00);
                    self.queue_block(addr);
                    self.multi_read_addr = Some(addr + BLOCK_SIZE);
                }
            }
            (CMD12_STOP_TRANSMISSION, _) => {
                self.multi_read_addr = None;
                self.tx.clear();
                // Stuff byte, then R1
                self.tx.push_back(0xFF);
                self.tx.push_back(0x00);
            }
            (CMD24_WRITE_BLOCK, _) | (CMD25_WRITE_MULTIPLE_BLOCK, _) => {
                let addr = self.byte_addr(arg);
                if addr + BLOCK_SIZE > self.storage.len() {
                    self.tx.push_back(R1_ADDRESS_ERROR);
                } else {
                    self.tx.push_back(0x00);
                    self.write_addr = addr;
                    self.state = IoState::WriteWait {
                        multi: cmd == CMD25_WRITE_MULTIPLE_BLOCK,
                    };
                }
            }
            (ACMD23_SET_WR_BLK_ERASE_COUNT, true) => {
                self.tx.push_back(0x00);
            }
            (CMD32_ERASE_WR_BLK_START_ADDR, _) => {
                self.erase_range.0 = Some(self.byte_addr(arg));
                self.tx.push_back(0x00);
            }
            (CMD33_ERASE_WR_BLK_END_ADDR, _) => {
                self.erase_range.1 = Some(self.byte_addr(arg));
                self.tx.push_back(0x00);
            }
            (CMD38_ERASE, _) => {
                if let (Some(start), Some(last)) = self.erase_range {
                    let end = (last + BLOCK_SIZE).min(self.storage.len());
                    self.storage[start..end].fill(0x00);
                    self.tx.push_back(0x00);
                } else {
                    self.tx.push_back(R1_ERASE_SEQUENCE_ERROR);
                }
                self.erase_range = (None, None);
            }
            _ => {
                self.tx.push_back(self.r1() | R1_ILLEGAL_COMMAND);
            }
        }
    }

    fn consume(&mut self, byte: u8) {
        match &mut self.state {
            IoState::Command => {
                if self.cmd_buf.is_empty() && byte & 0xC0 != 0x40 {
                    // Fill traffic between commands
                    if byte == 0xFF {
                        if let Some(addr) = self.multi_read_addr {
                            if self.tx.is_empty() {
                                if addr + BLOCK_SIZE <= self.storage.len() {
                                    self.queue_block(addr);
                                    self.multi_read_addr = Some(addr + BLOCK_SIZE);
                                } else {
                                    self.multi_read_addr = None;
                                }
                            }
                        }
                    }
                    return;
                }
                self.cmd_buf.push(byte);
                if self.cmd_buf.len() == PACKET_SIZE {
                    self.execute();
                    self.cmd_buf.clear();
                }
            }
            IoState::WriteWait { multi } => {
                let multi = *multi;
                match byte {
                    SPI_START_BLOCK | SPI_START_BLK_MUL_WRITE => {
                        self.state = IoState::WriteData {
                            multi,
                            buf: Vec::with_capacity(BLOCK_SIZE + 2),
                        };
                    }
                    SPI_STOP_TRAN => {
                        self.state = IoState::Command;
                    }
                    _ => {}
                }
            }
            IoState::WriteData { multi, buf } => {
                buf.push(byte);
                if buf.len() == BLOCK_SIZE + 2 {
                    let multi = *multi;
                    let data: Vec<u8> = buf[..BLOCK_SIZE].to_vec();
                    let sent_crc = ((buf[BLOCK_SIZE] as u16) << 8) | buf[BLOCK_SIZE + 1] as u16;

                    let token = if self.crc_enabled && crc16(&data) != sent_crc {
                        0x0B // CRC rejected
                    } else {
                        let addr = self.write_addr;
                        self.storage[addr..addr + BLOCK_SIZE].copy_from_slice(&data);
                        self.write_addr += BLOCK_SIZE;
                        SPI_DATA_ACCEPTED
                    };
                    self.tx.push_back(token);
                    self.state = if multi {
                        IoState::WriteWait { multi: true }
                    } else {
                        IoState::Command
                    };
                }
            }
        }
    }
}

impl SpiBus for MockCard {
    fn set_clock(&mut self, hz: u32) -> u32 {
        self.clock_hz = hz;
        hz
    }

    fn select(&mut self) {
        self.selected = true;
    }

    fn deselect(&mut self) {
        self.selected = false;
        self.cmd_buf.clear();
        self.state = IoState::Command;
    }

    fn transfer(&mut self, byte: u8) -> u8 {
        if !self.selected {
            return 0xFF;
        }
        // Pop first: the response to a byte begins no earlier than the
        // following transfer, like a real card's NCR delay
        let out = self.tx.pop_front().unwrap_or(0xFF);
        self.consume(byte);
        out
    }

    fn delay_ms(&mut self, _ms: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SdConfig, SdDevice};
    use mcufs_core::blockdevice::BlockDevice;
    use mcufs_core::Error;

    fn device(config: SdConfig) -> SdDevice<MockCard> {
        SdDevice::new(MockCard::new_default(), config)
    }

    #[test]
    fn test_init_detects_high_capacity_card() {
        let sd = device(SdConfig::default());
        sd.init().unwrap();
        assert!(sd.is_initialized());
        assert_eq!(sd.card_type(), CardType::V2Hc);
        assert_eq!(sd.size(), 4 * 1024 * 1024);

        // Idempotent
        sd.init().unwrap();
        sd.deinit().unwrap();
        assert!(!sd.is_initialized());
    }

    #[test]
    fn test_single_block_round_trip() {
        let sd = device(SdConfig::default());
        sd.init().unwrap();

        let mut data = [0u8; 512];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }
        sd.program(&data, 1024).unwrap();

        let mut out = [0u8; 512];
        sd.read(&mut out, 1024).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_multi_block_round_trip() {
        let sd = device(SdConfig::default());
        sd.init().unwrap();

        let mut data = vec![0u8; 4 * 512];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        sd.program(&data, 8192).unwrap();

        let mut out = vec![0u8; 4 * 512];
        sd.read(&mut out, 8192).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_crc_protected_round_trip() {
        let sd = device(SdConfig {
            enable_crc: true,
            ..SdConfig::default()
        });
        sd.init().unwrap();

        let data = [0x5Au8; 512];
        sd.program(&data, 0).unwrap();
        let mut out = [0u8; 512];
        sd.read(&mut out, 0).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_unaligned_access_rejected() {
        let sd = device(SdConfig::default());
        sd.init().unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(sd.read(&mut buf, 100).unwrap_err(), Error::SdParameter);
        assert_eq!(
            sd.program(&buf[..256], 0).unwrap_err(),
            Error::SdParameter
        );
        assert_eq!(
            sd.read(&mut buf, 4 * 1024 * 1024).unwrap_err(),
            Error::SdParameter
        );
    }

    #[test]
    fn test_uninitialized_access_rejected() {
        let sd = device(SdConfig::default());
        let mut buf = [0u8; 512];
        assert_eq!(sd.read(&mut buf, 0).unwrap_err(), Error::SdParameter);
    }

    #[test]
    fn test_transfer_clock_above_cap_fails_init() {
        let sd = device(SdConfig {
            hz: 50_000_000,
            enable_crc: false,
        });
        assert_eq!(sd.init().unwrap_err(), Error::InvalidInput);
    }

    #[test]
    fn test_trim_zeroes_range() {
        let sd = device(SdConfig::default());
        sd.init().unwrap();

        let data = [0xAAu8; 512];
        sd.program(&data, 0).unwrap();
        sd.program(&data, 512).unwrap();
        sd.trim(0, 1024).unwrap();

        let mut out = [0u8; 512];
        sd.read(&mut out, 0).unwrap();
        assert!(out.iter().all(|&b| b == 0x00));
        sd.read(&mut out, 512).unwrap();
        assert!(out.iter().all(|&b| b == 0x00));
    }

    #[test]
    fn test_erase_is_a_noop() {
        let sd = device(SdConfig::default());
        sd.init().unwrap();

        let data = [0x77u8; 512];
        sd.program(&data, 0).unwrap();
        sd.erase(0, 512).unwrap();

        let mut out = [0u8; 512];
        sd.read(&mut out, 0).unwrap();
        assert_eq!(out, data);
    }
}
