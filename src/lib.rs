//! # embedded-sdmmc-diskio
//!
//! > An SD/MMC disk driver written in Embedded Rust
//!
//! This crate drives an SD or MMC card in SPI mode and presents it as a single
//! numbered drive with the classic disk interface: `initialize`, `status`,
//! `read`, `write` and `ioctl`. It is written in pure-Rust, is `#![no_std]` and
//! does not use `alloc` or `collections` to keep the memory footprint low. In
//! the first instance it is designed for readability and simplicity over
//! performance.
//!
//! ## Using the crate
//!
//! You will need an SPI peripheral, a GPIO pin for Chip Select, a delay
//! provider and something that implements `Clock` (a free-running millisecond
//! counter). The driver also implements `BlockDevice`, so a filesystem layer
//! can sit on top of it.
//!
//! ```rust,ignore
//! let mut disk = embedded_sdmmc_diskio::SdMmcSpi::new(spi, cs, delay, clock);
//! write!(uart, "Init SD card...").unwrap();
//! let status = disk.initialize(0);
//! if status.contains(embedded_sdmmc_diskio::DriveStatus::NOT_INITIALIZED) {
//!     writeln!(uart, "failed: {:?}", status).unwrap();
//! } else {
//!     let mut sector = [0u8; 512];
//!     disk.read(0, &mut sector, 0, 1).unwrap();
//!     writeln!(uart, "OK! {} blocks", disk.sector_count().unwrap().0).unwrap();
//! }
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//!
//! * `chrono` (default): build a `Timestamp` from a `chrono` date and time, or from a Unix
//! seconds counter.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************


#[macro_use]
mod structure;

pub mod block_device;
pub mod clock;
pub mod sdmmc;
pub mod sdmmc_proto;
pub mod timestamp;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx};
pub use crate::clock::{Clock, Deadline};
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::{CardType, DiskResult, DriveStatus, IoctlCommand, Options, SdMmcSpi};
pub use crate::timestamp::{fat_timestamp, TimeSource, Timestamp};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
