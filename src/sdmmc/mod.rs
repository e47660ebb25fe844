//! embedded-sdmmc-diskio - SDMMC Protocol
//!
//! Implements the SD/MMC protocol on some generic SPI interface, and exposes
//! the card as a single numbered drive (always drive 0) with the classic
//! `initialize` / `status` / `read` / `write` / `ioctl` disk interface.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod bus;
mod init;
mod ioctl;

pub use ioctl::IoctlCommand;

use bus::CardBus;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

use crate::clock::Clock;
use crate::sdmmc_proto::*;
use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

/// The most sectors a single `read` or `write` may move.
pub const MAX_BLOCKS_PER_TRANSFER: usize = 128;

bitflags::bitflags! {
    /// Drive status bits, as reported by `status` and `initialize`.
    pub struct DriveStatus: u8 {
        /// The drive has not been initialized, or initialization failed
        const NOT_INITIALIZED = 0x01;
        /// No card in the socket
        const NO_MEDIUM = 0x02;
        /// The card is write protected
        const WRITE_PROTECTED = 0x04;
    }
}

bitflags::bitflags! {
    /// The family of the card in the socket and how it is addressed.
    ///
    /// An empty set means no card has been negotiated.
    pub struct CardType: u8 {
        /// MMC version 3
        const MMC3 = 0x01;
        /// MMC version 4+
        const MMC4 = 0x02;
        /// SD version 1
        const SD1 = 0x04;
        /// SD version 2+
        const SD2 = 0x08;
        /// The card uses block addressing (SDHC / SDXC)
        const BLOCK = 0x10;
        /// Any MMC
        const MMC = Self::MMC3.bits | Self::MMC4.bits;
        /// Any SD card
        const SD = Self::SD1.bits | Self::SD2.bits;
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for DriveStatus {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "DriveStatus({=u8:#x})", self.bits())
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for CardType {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "CardType({=u8:#x})", self.bits())
    }
}

/// The possible errors `SdMmcSpi` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The drive is not initialized
    NotReady,
    /// There is no card in the socket
    NoMedium,
    /// The card is write protected, or writing is disabled
    WriteProtected,
    /// Bad drive number, sector count or buffer
    ParamError,
    /// The card did not finish initializing in time, or is not a card we
    /// understand
    InitFailed,
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set a GPIO pin
    GpioError,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// We didn't get a start token when reading data from the card
    TimeoutReadBuffer,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// The card rejected this command with this R1 response
    RejectedCommand(u8, u8),
    /// We got something other than a start token when reading from the card
    ReadError,
    /// The card did not accept a data packet
    WriteError,
    /// The card can't erase single blocks, or is not an SD card
    EraseNotSupported,
}

/// Result codes of the disk interface.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DiskResult {
    /// Successful
    Ok = 0,
    /// Read/write error
    Error = 1,
    /// Write protected
    WriteProtected = 2,
    /// Not ready
    NotReady = 3,
    /// Invalid parameter
    ParamError = 4,
}

impl From<Error> for DiskResult {
    fn from(e: Error) -> DiskResult {
        match e {
            Error::NotReady | Error::NoMedium => DiskResult::NotReady,
            Error::WriteProtected => DiskResult::WriteProtected,
            Error::ParamError => DiskResult::ParamError,
            _ => DiskResult::Error,
        }
    }
}

impl DiskResult {
    /// Collapse the result of any drive operation into a result code.
    pub fn from_result<T>(result: &Result<T, Error>) -> DiskResult {
        match result {
            Ok(_) => DiskResult::Ok,
            Err(e) => DiskResult::from(*e),
        }
    }
}

/// Options for the driver.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Options {
    /// Allow writes and erases. A read-only driver rejects them with
    /// `Error::WriteProtected`.
    pub write_enabled: bool,
    /// How long the card gets to leave the idle state.
    pub init_timeout_ms: u32,
    /// How long we wait for the card to stop being busy.
    pub ready_timeout_ms: u32,
    /// How long we wait for the start of a data packet.
    pub data_token_timeout_ms: u32,
    /// How long an erase may take.
    pub erase_timeout_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            write_enabled: true,
            init_timeout_ms: 1000,
            ready_timeout_ms: 500,
            data_token_timeout_ms: 200,
            erase_timeout_ms: 30_000,
        }
    }
}

/// An SD/MMC card on an SPI bus, driven as drive 0.
///
/// Built from an SPI peripheral, a Chip Select pin, a delay provider and a
/// millisecond clock. We need Chip Select to be separate so we can clock out
/// some bytes without Chip Select asserted (which puts the card into SPI
/// mode).
///
/// The driver keeps the session state for the one drive: its status bits and
/// the negotiated card type. Calls must not overlap; wrap the driver in
/// whatever lock the caller already uses if it is shared.
pub struct SdMmcSpi<SPI, CS, DELAY, CLOCK>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u8>,
    CLOCK: Clock,
{
    bus: CardBus<SPI, CS, DELAY, CLOCK>,
    status: DriveStatus,
    card_type: CardType,
    options: Options,
}

impl<SPI, CS, DELAY, CLOCK> SdMmcSpi<SPI, CS, DELAY, CLOCK>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u8>,
    CLOCK: Clock,
{
    /// Create a new SD/MMC controller using a raw SPI interface.
    pub fn new(spi: SPI, cs: CS, delay: DELAY, clock: CLOCK) -> Self {
        Self::new_with_options(spi, cs, delay, clock, Options::default())
    }

    /// Create a new SD/MMC controller with the given options.
    pub fn new_with_options(
        spi: SPI,
        cs: CS,
        delay: DELAY,
        clock: CLOCK,
        options: Options,
    ) -> Self {
        SdMmcSpi {
            bus: CardBus::new(
                spi,
                cs,
                delay,
                clock,
                options.ready_timeout_ms,
                options.data_token_timeout_ms,
            ),
            status: DriveStatus::NOT_INITIALIZED,
            card_type: CardType::empty(),
            options,
        }
    }

    /// Give back the peripherals.
    pub fn free(self) -> (SPI, CS, DELAY, CLOCK) {
        self.bus.free()
    }

    /// The options this driver was built with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Get the drive status.
    pub fn status(&self, lun: u8) -> DriveStatus {
        if lun != 0 {
            return DriveStatus::NOT_INITIALIZED;
        }
        self.status
    }

    /// The negotiated card type, empty until initialization succeeds.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Report a card insertion or removal from a card-detect switch.
    ///
    /// Removing the card also marks the drive uninitialized.
    pub fn set_media_present(&mut self, present: bool) {
        if present {
            self.status.remove(DriveStatus::NO_MEDIUM);
        } else {
            self.status
                .insert(DriveStatus::NO_MEDIUM | DriveStatus::NOT_INITIALIZED);
            self.card_type = CardType::empty();
        }
    }

    /// Report the position of the card's write-protect switch.
    pub fn set_write_protected(&mut self, protected: bool) {
        self.status.set(DriveStatus::WRITE_PROTECTED, protected);
    }

    /// Read `count` sectors starting at `sector` into `buf`.
    ///
    /// `buf` must hold at least `count * 512` bytes and `count` must be in
    /// `1..=128`.
    pub fn read(&mut self, lun: u8, buf: &mut [u8], sector: u32, count: usize) -> Result<(), Error> {
        let len = Self::transfer_len(count, buf.len())?;
        self.check_ready(lun)?;
        self.read_sectors(sector, buf[..len].chunks_exact_mut(Block::LEN))
    }

    /// Write `count` sectors from `buf` starting at `sector`.
    ///
    /// `buf` must hold at least `count * 512` bytes and `count` must be in
    /// `1..=128`.
    pub fn write(&mut self, lun: u8, buf: &[u8], sector: u32, count: usize) -> Result<(), Error> {
        let len = Self::transfer_len(count, buf.len())?;
        self.check_ready(lun)?;
        self.check_writable()?;
        self.write_sectors(sector, buf[..len].chunks_exact(Block::LEN))
    }

    fn transfer_len(count: usize, buf_len: usize) -> Result<usize, Error> {
        if count == 0 || count > MAX_BLOCKS_PER_TRANSFER {
            return Err(Error::ParamError);
        }
        let len = count * Block::LEN;
        if buf_len < len {
            return Err(Error::ParamError);
        }
        Ok(len)
    }

    fn check_ready(&self, lun: u8) -> Result<(), Error> {
        if lun != 0 {
            return Err(Error::ParamError);
        }
        if self.status.contains(DriveStatus::NOT_INITIALIZED) {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), Error> {
        if !self.options.write_enabled || self.status.contains(DriveStatus::WRITE_PROTECTED) {
            return Err(Error::WriteProtected);
        }
        Ok(())
    }

    /// Convert a sector number to the address unit the card expects.
    fn sector_address(&self, sector: u32) -> Result<u32, Error> {
        if self.card_type.contains(CardType::BLOCK) {
            Ok(sector)
        } else {
            sector
                .checked_mul(Block::LEN_U32)
                .ok_or(Error::ParamError)
        }
    }

    /// Run some commands, then release the card.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut CardBus<SPI, CS, DELAY, CLOCK>) -> Result<R, Error>,
    {
        let result = f(&mut self.bus);
        let deselected = self.bus.deselect();
        let value = result?;
        deselected?;
        Ok(value)
    }

    fn read_sectors<'b, I>(&mut self, sector: u32, blocks: I) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b mut [u8]>,
    {
        let address = self.sector_address(sector)?;
        let count = blocks.len();
        trace!("read {} block(s) from {}", count, sector);
        self.with_chip_select(|bus| {
            if count == 1 {
                // Start a single-block read
                check_response(CMD17, bus.card_command(Command::new(CMD17, address))?)?;
                for block in blocks {
                    bus.read_data(block)?;
                }
                Ok(())
            } else {
                // Start a multi-block read
                check_response(CMD18, bus.card_command(Command::new(CMD18, address))?)?;
                let mut result = Ok(());
                for block in blocks {
                    if let Err(e) = bus.read_data(block) {
                        warn!("multi-block read aborted: {:?}", e);
                        result = Err(e);
                        break;
                    }
                }
                // Stop the read. Its response does not change the outcome.
                let _ = bus.card_command(Command::new(CMD12, 0))?;
                result
            }
        })
    }

    fn write_sectors<'b, I>(&mut self, sector: u32, blocks: I) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b [u8]>,
    {
        let address = self.sector_address(sector)?;
        let count = blocks.len();
        let card_type = self.card_type;
        trace!("write {} block(s) to {}", count, sector);
        self.with_chip_select(|bus| {
            if count == 1 {
                // Start a single-block write
                check_response(CMD24, bus.card_command(Command::new(CMD24, address))?)?;
                for block in blocks {
                    bus.write_data(DATA_START_BLOCK, block)?;
                }
                Ok(())
            } else {
                if card_type.intersects(CardType::SD) {
                    // Pre-erase hint. Whether it is accepted or not we still
                    // proceed with the write.
                    let _ = bus.card_command(Command::app(ACMD23, count as u32))?;
                }
                // Start a multi-block write
                check_response(CMD25, bus.card_command(Command::new(CMD25, address))?)?;
                let mut result = Ok(());
                for block in blocks {
                    if let Err(e) = bus.write_data(WRITE_MULTIPLE_TOKEN, block) {
                        warn!("multi-block write aborted: {:?}", e);
                        result = Err(e);
                        break;
                    }
                }
                // Stop the write
                let stopped = bus.stop_write();
                result.and(stopped)
            }
        })
    }
}

/// Turn an R1 response into an error unless the card is ready.
fn check_response(command: u8, r1: u8) -> Result<(), Error> {
    if r1 == R1_READY_STATE {
        Ok(())
    } else if (r1 & R1_FAILED) != 0 {
        Err(Error::TimeoutCommand(command))
    } else {
        Err(Error::RejectedCommand(command, r1))
    }
}

impl<SPI, CS, DELAY, CLOCK> BlockDevice for SdMmcSpi<SPI, CS, DELAY, CLOCK>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u8>,
    CLOCK: Clock,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        trace!("block device read for {}", reason);
        self.check_ready(0)?;
        let mut idx = start_block_idx;
        for chunk in blocks.chunks_mut(MAX_BLOCKS_PER_TRANSFER) {
            let len = chunk.len() as u32;
            self.read_sectors(idx.0, chunk.iter_mut().map(|b| &mut b.contents[..]))?;
            idx = idx + BlockCount(len);
        }
        Ok(())
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.check_ready(0)?;
        self.check_writable()?;
        let mut idx = start_block_idx;
        for chunk in blocks.chunks(MAX_BLOCKS_PER_TRANSFER) {
            let len = chunk.len() as u32;
            self.write_sectors(idx.0, chunk.iter().map(|b| &b.contents[..]))?;
            idx = idx + BlockCount(len);
        }
        Ok(())
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        self.sector_count()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
