//! Control and introspection: capacity, erase granularity, trim and the raw
//! card registers.

use core::convert::TryFrom;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

use crate::clock::Clock;
use crate::sdmmc_proto::*;
use crate::{BlockCount, BlockIdx};

use super::bus::CardBus;
use super::{check_response, CardType, DriveStatus, Error, SdMmcSpi};

#[cfg(feature = "log")]
use log::{debug, trace};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace};

/// The control codes understood by `SdMmcSpi::ioctl`.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum IoctlCommand {
    /// Wait for any pending write to finish. No buffer.
    Sync = 0,
    /// Number of 512-byte sectors on the card, as a little-endian `u32`.
    GetSectorCount = 1,
    /// Erase block size in sectors, as a little-endian `u32`.
    GetBlockSize = 3,
    /// Erase the sectors between two little-endian `u32`s (inclusive).
    Trim = 4,
    /// The card type bits, one byte.
    ///
    /// These are ChaN's standard `CT_*` values (`CardType`), so SD v1 reads
    /// as `0x04` and SD v2 as `0x08`. Ports of drivers whose headers use
    /// `0x02`/`0x04` for those will see a different byte.
    GetType = 50,
    /// The 16-byte CSD register.
    GetCsd = 51,
    /// The 16-byte CID register.
    GetCid = 52,
    /// The 4-byte OCR register.
    GetOcr = 53,
    /// The 64-byte SD Status register.
    GetSdStatus = 54,
}

impl IoctlCommand {
    /// How many bytes of buffer this command reads or fills.
    pub fn buffer_len(self) -> usize {
        match self {
            IoctlCommand::Sync => 0,
            IoctlCommand::GetSectorCount | IoctlCommand::GetBlockSize => 4,
            IoctlCommand::Trim => 8,
            IoctlCommand::GetType => 1,
            IoctlCommand::GetCsd | IoctlCommand::GetCid => 16,
            IoctlCommand::GetOcr => 4,
            IoctlCommand::GetSdStatus => 64,
        }
    }

    /// Does this command need a buffer at all?
    pub fn needs_buffer(self) -> bool {
        self.buffer_len() != 0
    }
}

impl TryFrom<u8> for IoctlCommand {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => IoctlCommand::Sync,
            1 => IoctlCommand::GetSectorCount,
            3 => IoctlCommand::GetBlockSize,
            4 => IoctlCommand::Trim,
            50 => IoctlCommand::GetType,
            51 => IoctlCommand::GetCsd,
            52 => IoctlCommand::GetCid,
            53 => IoctlCommand::GetOcr,
            54 => IoctlCommand::GetSdStatus,
            _ => return Err(Error::ParamError),
        })
    }
}

impl<SPI, CS, DELAY, CLOCK> CardBus<SPI, CS, DELAY, CLOCK>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u8>,
    CLOCK: Clock,
{
    /// Read the 16-byte Card Specific Data register.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        check_response(CMD9, self.card_command(Command::new(CMD9, 0))?)?;
        let mut data = [0u8; 16];
        self.read_data(&mut data)?;
        Ok(Csd::from_bytes(data))
    }

    /// Read the 16-byte Card Identification register.
    pub fn read_cid(&mut self) -> Result<Cid, Error> {
        check_response(CMD10, self.card_command(Command::new(CMD10, 0))?)?;
        let mut cid = Cid::default();
        self.read_data(&mut cid.data)?;
        Ok(cid)
    }

    /// Read the Operation Conditions Register (the tail of an R3 response).
    pub fn read_ocr(&mut self) -> Result<Ocr, Error> {
        check_response(CMD58, self.card_command(Command::new(CMD58, 0))?)?;
        Ok(Ocr::from_bytes(self.receive_bytes::<4>()?))
    }

    /// Read the 64-byte SD Status register.
    pub fn read_sd_status(&mut self) -> Result<SdStatus, Error> {
        check_response(ACMD13, self.card_command(Command::app(ACMD13, 0))?)?;
        // Second byte of the R2 response
        self.receive()?;
        let mut status = SdStatus::default();
        self.read_data(&mut status.data)?;
        Ok(status)
    }
}

impl<SPI, CS, DELAY, CLOCK> SdMmcSpi<SPI, CS, DELAY, CLOCK>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u8>,
    CLOCK: Clock,
{
    /// Wait until the card has finished any internal write.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.check_ready(0)?;
        self.with_chip_select(|bus| {
            if bus.select()? {
                Ok(())
            } else {
                Err(Error::TimeoutWaitNotBusy)
            }
        })
    }

    /// Return the usable size of this SD card in 512-byte blocks.
    pub fn sector_count(&mut self) -> Result<BlockCount, Error> {
        let csd = self.read_csd()?;
        let count = csd.card_capacity_blocks();
        debug!("card has {} blocks", count);
        Ok(BlockCount(count))
    }

    /// The erase unit of the card, in 512-byte sectors.
    ///
    /// SD v2 cards report their allocation unit; older cards report the
    /// erase sector (SD v1) or erase group (MMC) from the CSD.
    pub fn erase_block_size(&mut self) -> Result<u32, Error> {
        self.check_ready(0)?;
        let card_type = self.card_type;
        self.with_chip_select(|bus| {
            if card_type.contains(CardType::SD2) {
                Ok(bus.read_sd_status()?.allocation_unit_sectors())
            } else {
                // Both families keep their erase fields in the V1 layout
                let v1 = CsdV1 {
                    data: *bus.read_csd()?.data(),
                };
                if card_type.contains(CardType::SD1) {
                    Ok(v1.sd_erase_block_sectors())
                } else {
                    Ok(v1.mmc_erase_group_sectors())
                }
            }
        })
    }

    /// Erase the sectors `start..=end`.
    ///
    /// Only SD cards that can erase single blocks support this.
    pub fn trim(&mut self, start: BlockIdx, end: BlockIdx) -> Result<(), Error> {
        self.check_ready(0)?;
        self.check_writable()?;
        if end < start {
            return Err(Error::ParamError);
        }
        if !self.card_type.intersects(CardType::SD) {
            return Err(Error::EraseNotSupported);
        }
        let first = self.sector_address(start.0)?;
        let last = self.sector_address(end.0)?;
        let erase_timeout_ms = self.options.erase_timeout_ms;
        trace!("erase {}..={}", start.0, end.0);
        self.with_chip_select(|bus| {
            if !bus.read_csd()?.erase_single_block_enabled() {
                return Err(Error::EraseNotSupported);
            }
            check_response(CMD32, bus.card_command(Command::new(CMD32, first))?)?;
            check_response(CMD33, bus.card_command(Command::new(CMD33, last))?)?;
            check_response(CMD38, bus.card_command(Command::new(CMD38, 0))?)?;
            if bus.wait_ready(erase_timeout_ms)? {
                Ok(())
            } else {
                Err(Error::TimeoutWaitNotBusy)
            }
        })
    }

    /// Read the card's CSD register.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        self.check_ready(0)?;
        self.with_chip_select(|bus| bus.read_csd())
    }

    /// Read the card's CID register.
    pub fn read_cid(&mut self) -> Result<Cid, Error> {
        self.check_ready(0)?;
        self.with_chip_select(|bus| bus.read_cid())
    }

    /// Read the card's OCR register.
    pub fn read_ocr(&mut self) -> Result<Ocr, Error> {
        self.check_ready(0)?;
        self.with_chip_select(|bus| bus.read_ocr())
    }

    /// Read the SD Status register. SD cards only.
    pub fn read_sd_status(&mut self) -> Result<SdStatus, Error> {
        self.check_ready(0)?;
        if !self.card_type.intersects(CardType::SD) {
            return Err(Error::ParamError);
        }
        self.with_chip_select(|bus| bus.read_sd_status())
    }

    /// The classic control entry point.
    ///
    /// `code` is one of the `IoctlCommand` values. Replies are written to the
    /// front of `buf`, which must be at least `IoctlCommand::buffer_len`
    /// bytes; numbers are little-endian. `Trim` reads its start and end
    /// sectors from `buf` instead.
    pub fn ioctl(&mut self, lun: u8, code: u8, buf: Option<&mut [u8]>) -> Result<(), Error> {
        self.check_ready(lun)?;
        let command = IoctlCommand::try_from(code)?;
        let len = command.buffer_len();
        let mut empty = [0u8; 0];
        let buf = match buf {
            Some(buf) if buf.len() >= len => &mut buf[..len],
            None if !command.needs_buffer() => &mut empty[..],
            _ => return Err(Error::ParamError),
        };
        trace!("ioctl {:?}", command);

        match command {
            IoctlCommand::Sync => self.sync(),
            IoctlCommand::GetSectorCount => {
                let count = self.sector_count()?;
                buf.copy_from_slice(&count.0.to_le_bytes());
                Ok(())
            }
            IoctlCommand::GetBlockSize => {
                let size = self.erase_block_size()?;
                buf.copy_from_slice(&size.to_le_bytes());
                Ok(())
            }
            IoctlCommand::Trim => {
                let start = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let end = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
                self.trim(BlockIdx(start), BlockIdx(end))
            }
            IoctlCommand::GetType => {
                buf[0] = self.card_type.bits();
                Ok(())
            }
            IoctlCommand::GetCsd => {
                let csd = self.read_csd()?;
                buf.copy_from_slice(csd.data());
                Ok(())
            }
            IoctlCommand::GetCid => {
                let cid = self.read_cid()?;
                buf.copy_from_slice(&cid.data);
                Ok(())
            }
            IoctlCommand::GetOcr => {
                let ocr = self.read_ocr()?;
                buf.copy_from_slice(&ocr.0.to_be_bytes());
                Ok(())
            }
            IoctlCommand::GetSdStatus => {
                let status = self.read_sd_status()?;
                buf.copy_from_slice(&status.data);
                Ok(())
            }
        }
    }

    /// Is the drive marked write protected?
    pub fn is_write_protected(&self) -> bool {
        self.status.contains(DriveStatus::WRITE_PROTECTED)
    }
}
