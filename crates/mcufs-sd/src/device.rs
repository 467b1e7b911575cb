//! SD/MMC SPI-mode block device driver

use log::{debug, trace};
use parking_lot::Mutex;

use mcufs_core::blockdevice::{BlockDevice, Geometry};
use mcufs_core::error::{Error, Result};

use crate::bus::{SpiBus, SPI_FILL};
use crate::crc::{crc16, crc7};
use crate::error::SdError;
use crate::protocol::*;

/// SPI clock used during the power-on handshake
pub const INIT_CLOCK_HZ: u32 = 10_000_000;

/// Highest transfer clock supported without the switch function
pub const TRANSFER_CLOCK_MAX_HZ: u32 = 25_000_000;

/// Time budget for command responses and busy waits
const COMMAND_TIMEOUT_MS: u32 = 5000;

/// CMD0 attempts before giving up on the idle state
const CMD0_IDLE_STATE_RETRIES: u32 = 5;

/// Command retries when the card does not answer at all
const CMD_RETRIES: u32 = 3;

/// Wait budget for a data start token
const TOKEN_TIMEOUT_MS: u32 = 300;

/// Byte transfers spent per millisecond of busy-wait budget
const POLLS_PER_MS: u32 = 100;

const DEVICE_NAME: &str = "sd";

/// SD driver configuration
#[derive(Debug, Clone, Copy)]
pub struct SdConfig {
    /// Transfer clock after initialization, capped at
    /// [`TRANSFER_CLOCK_MAX_HZ`]; asking for more fails `init`
    pub hz: u32,
    /// Protect command packets with CRC7 and data blocks with CRC16
    pub enable_crc: bool,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            hz: 24_000_000,
            enable_crc: false,
        }
    }
}

struct SdState<B: SpiBus> {
    bus: B,
    card_type: CardType,
    sectors: u64,
    // Erase unit from the CSD; governs trim alignment only
    csd_erase_size: usize,
    initialized: bool,
}

/// SD/MMC card behind an SPI bus.
///
/// `init` runs the SPI-mode power-on handshake (CMD0, CMD8, optional
/// CMD59, CMD58, ACMD41 until ready, CMD16) at [`INIT_CLOCK_HZ`] and then
/// switches to the configured transfer clock. Data moves in 512-byte
/// blocks; high-capacity cards are block addressed and the driver divides
/// byte addresses accordingly.
pub struct SdDevice<B: SpiBus> {
    config: SdConfig,
    state: Mutex<SdState<B>>,
}

impl<B: SpiBus> SdDevice<B> {
    /// Create a device over `bus`; the card is not touched until `init`
    pub fn new(bus: B, config: SdConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SdState {
                bus,
                card_type: CardType::Unknown,
                sectors: 0,
                csd_erase_size: BLOCK_SIZE,
                initialized: false,
            }),
        }
    }

    /// Detected card type; `Unknown` before a successful `init`
    pub fn card_type(&self) -> CardType {
        self.state.lock().card_type
    }
}

impl<B: SpiBus> SdState<B> {
    fn preclock_then_select(&mut self) {
        self.bus.transfer(SPI_FILL);
        self.bus.select();
    }

    fn postclock_then_deselect(&mut self) {
        self.bus.transfer(SPI_FILL);
        self.bus.deselect();
    }

    /// Poll MISO until the card releases the bus (0xFF)
    fn wait_ready(&mut self, timeout_ms: u32) -> bool {
        for _ in 0..timeout_ms * POLLS_PER_MS {
            if self.bus.transfer(SPI_FILL) == 0xFF {
                return true;
            }
        }
        false
    }

    /// Poll MISO for a specific token
    fn wait_token(&mut self, token: u8) -> bool {
        for _ in 0..TOKEN_TIMEOUT_MS * POLLS_PER_MS {
            if self.bus.transfer(SPI_FILL) == token {
                return true;
            }
        }
        debug!("sd: timeout waiting for token {:#04x}", token);
        false
    }

    /// Send one command packet and pull the R1 response
    fn cmd_spi(&mut self, cmd: u8, arg: u32, enable_crc: bool) -> u8 {
        let mut packet = [0u8; PACKET_SIZE];
        packet[0] = cmd_byte(cmd);
        packet[1] = (arg >> 24) as u8;
        packet[2] = (arg >> 16) as u8;
        packet[3] = (arg >> 8) as u8;
        packet[4] = arg as u8;
        packet[5] = if enable_crc {
            (crc7(&packet[..5]) << 1) | 0x01
        } else {
            // Fixed CRCs for the two commands sent before CRC is settled;
            // end bit high everywhere else
            match cmd {
                CMD0_GO_IDLE_STATE => 0x95,
                CMD8_SEND_IF_COND => 0x87,
                _ => 0xFF,
            }
        };
        self.bus.write(&packet);

        // The byte following CMD12 is a stuff byte; discard it before
        // looking for the response
        if cmd == CMD12_STOP_TRANSMISSION {
            self.bus.transfer(SPI_FILL);
        }

        // The response arrives within 0..8 bytes (NCR)
        let mut response = R1_NO_RESPONSE;
        for _ in 0..0x10 {
            response = self.bus.transfer(SPI_FILL);
            if response & R1_RESPONSE_RECV == 0 {
                break;
            }
        }
        response
    }

    /// Full command transaction: select, optional CMD55 prefix, retries,
    /// R1 decoding and extended R3/R7 payload where the command has one.
    ///
    /// On success the card is left selected for data commands (CMD9/17/
    /// 18/24/25) and deselected otherwise.
    fn command(&mut self, cmd: u8, arg: u32, is_acmd: bool, enable_crc: bool) -> crate::error::Result<u32> {
        self.preclock_then_select();
        if cmd != CMD12_STOP_TRANSMISSION && !self.wait_ready(COMMAND_TIMEOUT_MS) {
            debug!("sd: card not ready before CMD{}", cmd);
        }

        let mut response = R1_NO_RESPONSE;
        for _ in 0..CMD_RETRIES {
            if is_acmd {
                self.cmd_spi(CMD55_APP_CMD, 0, enable_crc);
                if !self.wait_ready(COMMAND_TIMEOUT_MS) {
                    debug!("sd: card not ready after CMD55");
                }
            }
            response = self.cmd_spi(cmd, arg, enable_crc);
            if response == R1_NO_RESPONSE {
                debug!("sd: no response to CMD{}", cmd);
                continue;
            }
            break;
        }

        if response == R1_NO_RESPONSE {
            self.postclock_then_deselect();
            return Err(SdError::NoDevice);
        }
        if response & R1_COM_CRC_ERROR != 0 {
            self.postclock_then_deselect();
            debug!("sd: CRC error on CMD{} response {:#04x}", cmd, response);
            return Err(SdError::Crc);
        }
        if response & R1_ILLEGAL_COMMAND != 0 {
            if cmd == CMD8_SEND_IF_COND {
                // Legacy protocol, MMC, or broken card
                self.card_type = CardType::Unknown;
            }
            self.postclock_then_deselect();
            return Err(SdError::Unsupported);
        }

        trace!("sd: CMD{} arg {:#x} response {:#04x}", cmd, arg, response);

        let mut status = Ok(());
        if response & (R1_ERASE_RESET | R1_ERASE_SEQUENCE_ERROR) != 0 {
            status = Err(SdError::Erase);
        } else if response & (R1_ADDRESS_ERROR | R1_PARAMETER_ERROR) != 0 {
            status = Err(SdError::Parameter);
        }

        let mut resp = response as u32;
        match cmd {
            CMD8_SEND_IF_COND | CMD58_READ_OCR => {
                if cmd == CMD8_SEND_IF_COND {
                    self.card_type = CardType::V2;
                }
                // R3/R7 carry 4 more bytes
                resp = (self.bus.transfer(SPI_FILL) as u32) << 24;
                resp |= (self.bus.transfer(SPI_FILL) as u32) << 16;
                resp |= (self.bus.transfer(SPI_FILL) as u32) << 8;
                resp |= self.bus.transfer(SPI_FILL) as u32;
            }
            CMD12_STOP_TRANSMISSION | CMD38_ERASE => {
                // R1b: wait out the busy signal
                self.wait_ready(COMMAND_TIMEOUT_MS);
            }
            _ => {}
        }

        // Keep the card selected while a data transfer is pending
        let data_pending = matches!(
            cmd,
            CMD9_SEND_CSD
                | CMD17_READ_SINGLE_BLOCK
                | CMD18_READ_MULTIPLE_BLOCK
                | CMD24_WRITE_BLOCK
                | CMD25_WRITE_MULTIPLE_BLOCK
        );
        if data_pending && status.is_ok() {
            return Ok(resp);
        }
        self.postclock_then_deselect();
        status.map(|_| resp)
    }

    /// CMD8 with the 3.3 V range and check pattern; distinguishes v2 cards
    fn check_interface_condition(&mut self, enable_crc: bool) -> crate::error::Result<()> {
        let arg = CMD8_VHS_3V3 | CMD8_PATTERN;
        let response = self.command(CMD8_SEND_IF_COND, arg, false, enable_crc)?;
        if self.card_type == CardType::V2 && (response & 0xFFF) != arg {
            debug!("sd: CMD8 pattern mismatch {:#x}", response);
            self.card_type = CardType::Unknown;
            return Err(SdError::Unusable);
        }
        Ok(())
    }

    fn go_idle_state(&mut self, enable_crc: bool) -> bool {
        for _ in 0..CMD0_IDLE_STATE_RETRIES {
            if let Ok(response) = self.command(CMD0_GO_IDLE_STATE, 0, false, enable_crc) {
                if response as u8 == R1_IDLE_STATE {
                    return true;
                }
            }
            self.bus.delay_ms(1);
        }
        false
    }

    /// Receive one data block: start token, payload, CRC16
    fn read_data_block(&mut self, buf: &mut [u8], enable_crc: bool) -> crate::error::Result<()> {
        if !self.wait_token(SPI_START_BLOCK) {
            return Err(SdError::NoResponse);
        }
        self.bus.read(buf);
        let mut crc = (self.bus.transfer(SPI_FILL) as u16) << 8;
        crc |= self.bus.transfer(SPI_FILL) as u16;

        if enable_crc && crc16(buf) != crc {
            debug!("sd: data CRC mismatch, received {:#06x}", crc);
            return Err(SdError::Crc);
        }
        Ok(())
    }

    /// Send one data block and return the masked data-response token
    fn write_data_block(&mut self, buf: &[u8], token: u8, enable_crc: bool) -> u8 {
        self.bus.transfer(token);
        self.bus.write(buf);

        let crc = if enable_crc { crc16(buf) } else { 0xFFFF };
        self.bus.transfer((crc >> 8) as u8);
        self.bus.transfer(crc as u8);

        let response = self.bus.transfer(SPI_FILL);
        if !self.wait_ready(COMMAND_TIMEOUT_MS) {
            debug!("sd: card busy after block write");
        }
        response & SPI_DATA_RESPONSE_MASK
    }

    /// Power-on handshake at the initialization clock
    fn init_card(&mut self, config: &SdConfig) -> crate::error::Result<()> {
        self.bus.set_clock(INIT_CLOCK_HZ);

        // At least 74 dummy clocks with CS deasserted
        self.bus.deselect();
        for _ in 0..10 {
            self.bus.transfer(SPI_FILL);
        }

        if !self.go_idle_state(config.enable_crc) {
            debug!("sd: no card, or card refused SPI idle state");
            return Err(SdError::NoDevice);
        }

        match self.check_interface_condition(config.enable_crc) {
            Ok(()) => {}
            // Illegal command means v1 or MMC; anything else is fatal
            Err(SdError::Unsupported) => {}
            Err(err) => return Err(err),
        }

        if config.enable_crc {
            self.command(CMD59_CRC_ON_OFF, 1, false, config.enable_crc)?;
        }

        let ocr = self.command(CMD58_READ_OCR, 0, false, config.enable_crc)?;
        if ocr & OCR_3_3V == 0 {
            self.card_type = CardType::Unknown;
            return Err(SdError::Unusable);
        }

        // HCS announces high-capacity support to v2 cards
        let arg = if self.card_type == CardType::V2 {
            OCR_HCS_CCS
        } else {
            0
        };

        // The card clears the R1 idle bit once its own initialization is
        // complete; poll ACMD41 until then
        let mut response = R1_IDLE_STATE as u32;
        for _ in 0..COMMAND_TIMEOUT_MS {
            response = self.command(ACMD41_SD_SEND_OP_COND, arg, true, config.enable_crc)?;
            if response & R1_IDLE_STATE as u32 == 0 {
                break;
            }
            self.bus.delay_ms(1);
        }
        if response != 0 {
            debug!("sd: timeout waiting for card");
            self.card_type = CardType::Unknown;
            return Err(SdError::Unusable);
        }

        if self.card_type == CardType::V2 {
            let ocr = self.command(CMD58_READ_OCR, 0, false, config.enable_crc)?;
            if ocr & OCR_HCS_CCS != 0 {
                self.card_type = CardType::V2Hc;
                debug!("sd: high capacity card");
            }
        } else {
            self.card_type = CardType::V1;
            debug!("sd: version 1.x card");
        }
        Ok(())
    }

    /// CMD9 and CSD decode
    fn read_csd(&mut self, enable_crc: bool) -> crate::error::Result<CsdInfo> {
        self.command(CMD9_SEND_CSD, 0, false, enable_crc)?;
        let mut csd = [0u8; 16];
        let result = self.read_data_block(&mut csd, enable_crc);
        self.postclock_then_deselect();
        result?;
        decode_csd(&csd).ok_or(SdError::Unsupported)
    }
}

impl<B: SpiBus> BlockDevice for SdDevice<B> {
    fn name(&self) -> &'static str {
        DEVICE_NAME
    }

    fn geometry(&self) -> Geometry {
        Geometry::uniform(BLOCK_SIZE)
    }

    fn init(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.initialized {
            return Ok(());
        }

        state.init_card(&self.config).map_err(Error::from)?;

        let info = state.read_csd(self.config.enable_crc).map_err(Error::from)?;
        if info.sectors == 0 {
            return Err(Error::NoDevice);
        }
        state.sectors = info.sectors;
        state.csd_erase_size = info.erase_size;

        // Explicit 512-byte blocks; required for standard capacity cards
        // and harmless for high capacity ones
        state
            .command(CMD16_SET_BLOCKLEN, BLOCK_SIZE as u32, false, self.config.enable_crc)
            .map_err(Error::from)?;

        // Transfer clock; beyond the cap the card needs the switch
        // function, which this driver does not speak
        if self.config.hz > TRANSFER_CLOCK_MAX_HZ {
            state.bus.set_clock(TRANSFER_CLOCK_MAX_HZ);
            return Err(Error::InvalidInput);
        }
        state.bus.set_clock(self.config.hz);

        debug!(
            "sd: initialized, {} sectors, card type {:?}",
            state.sectors, state.card_type
        );
        state.initialized = true;
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        self.state.lock().initialized = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !self.geometry().is_read_aligned(addr, buf.len())
            || addr + buf.len() as u64 > state.sectors * BLOCK_SIZE as u64
        {
            return Err(Error::SdParameter);
        }
        if !state.initialized {
            return Err(Error::SdNoInit);
        }

        let block_count = buf.len() / BLOCK_SIZE;
        let addr = if state.card_type.block_addressed() {
            addr / BLOCK_SIZE as u64
        } else {
            addr
        };

        let cmd = if block_count > 1 {
            CMD18_READ_MULTIPLE_BLOCK
        } else {
            CMD17_READ_SINGLE_BLOCK
        };
        state
            .command(cmd, addr as u32, false, self.config.enable_crc)
            .map_err(Error::from)?;

        let mut result = Ok(());
        for block in buf.chunks_mut(BLOCK_SIZE) {
            if let Err(err) = state.read_data_block(block, self.config.enable_crc) {
                result = Err(Error::from(err));
                break;
            }
        }
        state.postclock_then_deselect();

        if block_count > 1 {
            state
                .command(CMD12_STOP_TRANSMISSION, 0, false, self.config.enable_crc)
                .map_err(Error::from)?;
        }
        result
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !self.geometry().is_program_aligned(addr, buf.len())
            || addr + buf.len() as u64 > state.sectors * BLOCK_SIZE as u64
        {
            return Err(Error::SdParameter);
        }
        if !state.initialized {
            return Err(Error::SdNoInit);
        }

        let block_count = buf.len() / BLOCK_SIZE;
        let addr = if state.card_type.block_addressed() {
            addr / BLOCK_SIZE as u64
        } else {
            addr
        };

        let mut result = Ok(());
        if block_count == 1 {
            state
                .command(CMD24_WRITE_BLOCK, addr as u32, false, self.config.enable_crc)
                .map_err(Error::from)?;
            let response = state.write_data_block(buf, SPI_START_BLOCK, self.config.enable_crc);
            if response != SPI_DATA_ACCEPTED {
                debug!("sd: single block write rejected: {:#04x}", response);
                result = Err(Error::SdWrite);
            }
        } else {
            // Pre-erase hint; advisory, failures are ignored
            let _ = state.command(
                ACMD23_SET_WR_BLK_ERASE_COUNT,
                block_count as u32,
                true,
                self.config.enable_crc,
            );

            state
                .command(CMD25_WRITE_MULTIPLE_BLOCK, addr as u32, false, self.config.enable_crc)
                .map_err(Error::from)?;
            for block in buf.chunks(BLOCK_SIZE) {
                let response =
                    state.write_data_block(block, SPI_START_BLK_MUL_WRITE, self.config.enable_crc);
                if response != SPI_DATA_ACCEPTED {
                    debug!("sd: multiple block write rejected: {:#04x}", response);
                    result = Err(Error::SdWrite);
                    break;
                }
            }
            // Stop-tran token ends the write train
            state.bus.transfer(SPI_STOP_TRAN);
            state.wait_ready(COMMAND_TIMEOUT_MS);
        }

        state.postclock_then_deselect();
        result
    }

    fn erase(&self, _addr: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    fn trim(&self, addr: u64, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        let erase_size = state.csd_erase_size as u64;
        if addr % erase_size != 0
            || len % erase_size != 0
            || addr + len > state.sectors * BLOCK_SIZE as u64
        {
            return Err(Error::SdParameter);
        }
        if !state.initialized {
            return Err(Error::SdNoInit);
        }

        // The end address names the last block of the range
        let mut start = addr;
        let mut last = addr + len - BLOCK_SIZE as u64;
        if state.card_type.block_addressed() {
            start /= BLOCK_SIZE as u64;
            last /= BLOCK_SIZE as u64;
        }

        state
            .command(CMD32_ERASE_WR_BLK_START_ADDR, start as u32, false, self.config.enable_crc)
            .map_err(Error::from)?;
        state
            .command(CMD33_ERASE_WR_BLK_END_ADDR, last as u32, false, self.config.enable_crc)
            .map_err(Error::from)?;
        state
            .command(CMD38_ERASE, 0, false, self.config.enable_crc)
            .map_err(Error::from)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        let state = self.state.lock();
        state.sectors * BLOCK_SIZE as u64
    }
}
