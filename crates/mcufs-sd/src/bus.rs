//! SPI bus seam for the SD driver
//!
//! The board layer provides the SPI peripheral, pin muxing and chip
//! select behind this trait; the driver only sees byte transfers. All
//! methods are blocking.

/// Byte clocked out while listening on MISO
pub const SPI_FILL: u8 = 0xFF;

/// Blocking SPI master with software chip select.
pub trait SpiBus: Send {
    /// Reconfigure the SPI clock; returns the rate actually applied
    fn set_clock(&mut self, hz: u32) -> u32;

    /// Assert chip select
    fn select(&mut self);

    /// Deassert chip select
    fn deselect(&mut self);

    /// Full-duplex transfer of one byte
    fn transfer(&mut self, byte: u8) -> u8;

    /// Shift out `data`, discarding the response
    fn write(&mut self, data: &[u8]) {
        for &byte in data {
            self.transfer(byte);
        }
    }

    /// Clock out fill bytes, capturing the response into `buf`
    fn read(&mut self, buf: &mut [u8]) {
        for byte in buf {
            *byte = self.transfer(SPI_FILL);
        }
    }

    /// Busy-wait for `ms` milliseconds
    fn delay_ms(&mut self, ms: u32);
}
