//! Card initialization: works out which family of card is in the socket and
//! how it wants to be addressed.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

use crate::clock::Clock;
use crate::sdmmc_proto::*;
use crate::Block;

use super::{CardType, DriveStatus, Error, SdMmcSpi};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Where we are in talking a card out of reset.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    /// Power-up clocks, then `GO_IDLE_STATE`
    Reset,
    /// The card is idle; ask for its interface conditions
    IdleSent,
    /// `SEND_IF_COND` was accepted, so this is at least an SD v2 card
    SdV2Probe,
    /// `SEND_IF_COND` was rejected: an SD v1 card or an MMC
    LegacyProbe,
    /// Repeat `command` until the card leaves the idle state
    Negotiating { family: CardType, command: Command },
    /// Find out whether an SD v2 card is block addressed
    ReadOcr,
    /// Byte-addressed cards need a 512 byte block length
    SetBlockLen(CardType),
    Ready(CardType),
    Failed,
}

impl<SPI, CS, DELAY, CLOCK> SdMmcSpi<SPI, CS, DELAY, CLOCK>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u8>,
    CLOCK: Clock,
{
    /// Initialize the drive and return its status.
    ///
    /// There is no automatic retry: if the status still has
    /// `NOT_INITIALIZED` set, call this again.
    pub fn initialize(&mut self, lun: u8) -> DriveStatus {
        if lun != 0 {
            return DriveStatus::NOT_INITIALIZED;
        }
        // Failures are logged and reflected in the status bits
        let _ = self.acquire();
        self.status
    }

    /// Initializes the card into a known state and returns its type.
    ///
    /// On failure the card type is cleared and the drive is left marked
    /// uninitialized.
    pub fn acquire(&mut self) -> Result<CardType, Error> {
        if self.status.contains(DriveStatus::NO_MEDIUM) {
            warn!("no card in the socket");
            return Err(Error::NoMedium);
        }
        debug!("acquiring card with opts: {:?}", self.options);

        let result = self.negotiate();
        let deselected = self.bus.deselect();
        let result = result.and_then(|card_type| deselected.map(|_| card_type));

        match result {
            Ok(card_type) => {
                debug!("Card type: {:x}", card_type.bits());
                self.card_type = card_type;
                self.status.remove(DriveStatus::NOT_INITIALIZED);
            }
            Err(e) => {
                warn!("card initialization failed: {:?}", e);
                self.card_type = CardType::empty();
                self.status.insert(DriveStatus::NOT_INITIALIZED);
            }
        }
        result
    }

    fn negotiate(&mut self) -> Result<CardType, Error> {
        let init_timeout_ms = self.options.init_timeout_ms;
        let bus = &mut self.bus;
        let mut deadline = bus.start_deadline(init_timeout_ms);
        let mut phase = Phase::Reset;
        loop {
            trace!("init phase: {:?}", phase);
            phase = match phase {
                Phase::Reset => {
                    bus.power_up_clocks()?;
                    if bus.card_command(Command::new(CMD0, 0))? == R1_IDLE_STATE {
                        Phase::IdleSent
                    } else {
                        Phase::Failed
                    }
                }
                Phase::IdleSent => {
                    deadline = bus.start_deadline(init_timeout_ms);
                    if bus.card_command(Command::new(CMD8, IF_COND_ARG))? == R1_IDLE_STATE {
                        Phase::SdV2Probe
                    } else {
                        Phase::LegacyProbe
                    }
                }
                Phase::SdV2Probe => {
                    let r7 = bus.receive_bytes::<4>()?;
                    // Voltage accepted and check pattern echoed?
                    if r7[2] == 0x01 && r7[3] == 0xAA {
                        Phase::Negotiating {
                            family: CardType::SD2,
                            command: Command::app(ACMD41, ACMD41_HCS),
                        }
                    } else {
                        warn!("bad SEND_IF_COND echo: {:x} {:x}", r7[2], r7[3]);
                        Phase::Failed
                    }
                }
                Phase::LegacyProbe => {
                    if bus.card_command(Command::app(ACMD41, 0))? <= R1_IDLE_STATE {
                        Phase::Negotiating {
                            family: CardType::SD1,
                            command: Command::app(ACMD41, 0),
                        }
                    } else {
                        Phase::Negotiating {
                            family: CardType::MMC3,
                            command: Command::new(CMD1, 0),
                        }
                    }
                }
                Phase::Negotiating { family, command } => {
                    while !bus.expired(&deadline)
                        && bus.card_command(command)? != R1_READY_STATE
                    {}
                    if family == CardType::SD2 {
                        Phase::ReadOcr
                    } else {
                        Phase::SetBlockLen(family)
                    }
                }
                Phase::ReadOcr => {
                    if !bus.expired(&deadline)
                        && bus.card_command(Command::new(CMD58, 0))? == R1_READY_STATE
                    {
                        let ocr = Ocr::from_bytes(bus.receive_bytes::<4>()?);
                        if ocr.card_capacity_status() {
                            Phase::Ready(CardType::SD2 | CardType::BLOCK)
                        } else {
                            Phase::Ready(CardType::SD2)
                        }
                    } else {
                        Phase::Failed
                    }
                }
                Phase::SetBlockLen(family) => {
                    if !bus.expired(&deadline)
                        && bus.card_command(Command::new(CMD16, Block::LEN_U32))?
                            == R1_READY_STATE
                    {
                        Phase::Ready(family)
                    } else {
                        Phase::Failed
                    }
                }
                Phase::Ready(card_type) => return Ok(card_type),
                Phase::Failed => return Err(Error::InitFailed),
            };
        }
    }
}
