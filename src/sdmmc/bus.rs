use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

use crate::clock::{Clock, Deadline};
use crate::sdmmc_proto::*;

use super::Error;

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

/// Time the chip select line needs to settle after every change.
const CS_SETTLE_MS: u8 = 1;

/// How many bytes we clock in looking for an R1 response.
const RESPONSE_POLLS: usize = 10;

/// The wire side of the driver.
///
/// Owns the SPI peripheral and the Chip Select pin, and is responsible for
/// framing commands and data packets. Nothing in here retries a failed
/// command; that is up to the caller.
pub(crate) struct CardBus<SPI, CS, DELAY, CLOCK>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u8>,
    CLOCK: Clock,
{
    spi: SPI,
    cs: CS,
    delay: DELAY,
    clock: CLOCK,
    ready_timeout_ms: u32,
    data_token_timeout_ms: u32,
}

impl<SPI, CS, DELAY, CLOCK> CardBus<SPI, CS, DELAY, CLOCK>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u8>,
    CLOCK: Clock,
{
    pub fn new(
        spi: SPI,
        cs: CS,
        delay: DELAY,
        clock: CLOCK,
        ready_timeout_ms: u32,
        data_token_timeout_ms: u32,
    ) -> Self {
        CardBus {
            spi,
            cs,
            delay,
            clock,
            ready_timeout_ms,
            data_token_timeout_ms,
        }
    }

    pub fn free(self) -> (SPI, CS, DELAY, CLOCK) {
        (self.spi, self.cs, self.delay, self.clock)
    }

    pub fn start_deadline(&self, timeout_ms: u32) -> Deadline {
        Deadline::start(&self.clock, timeout_ms)
    }

    pub fn expired(&self, deadline: &Deadline) -> bool {
        deadline.expired(&self.clock)
    }

    fn cs_high(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        self.delay.delay_ms(CS_SETTLE_MS);
        Ok(())
    }

    fn cs_low(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::GpioError)?;
        self.delay.delay_ms(CS_SETTLE_MS);
        Ok(())
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(FILL_BYTE)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Receive a fixed number of bytes, e.g. the tail of an R3 or R7
    /// response.
    pub fn receive_bytes<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut bytes = [FILL_BYTE; N];
        self.receive_block(&mut bytes)?;
        Ok(bytes)
    }

    /// Fill `buffer` from the card, holding MOSI high.
    fn receive_block(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for b in buffer.iter_mut() {
            *b = FILL_BYTE;
        }
        self.spi
            .transfer(buffer)
            .map(|_| ())
            .map_err(|_e| Error::Transport)
    }

    fn transmit_block(&mut self, buffer: &[u8]) -> Result<(), Error> {
        self.spi.write(buffer).map_err(|_e| Error::Transport)
    }

    /// Clock out the bytes a card needs after power-up, with Chip Select
    /// deasserted. We need at least 74 clock cycles.
    pub fn power_up_clocks(&mut self) -> Result<(), Error> {
        self.cs_high()?;
        for _ in 0..10 {
            self.receive()?;
        }
        Ok(())
    }

    /// Spin until the card returns 0xFF or the timeout passes.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_ready(&mut self, timeout_ms: u32) -> Result<bool, Error> {
        let deadline = self.start_deadline(timeout_ms);
        loop {
            if self.receive()? == 0xFF {
                return Ok(true);
            }
            if self.expired(&deadline) {
                return Ok(false);
            }
        }
    }

    /// Release the card. The dummy byte makes the card float its DO line so
    /// other devices can use the bus.
    pub fn deselect(&mut self) -> Result<(), Error> {
        self.cs_high()?;
        self.receive()?;
        Ok(())
    }

    /// Assert Chip Select and wait for the card to be ready.
    ///
    /// Returns `Ok(false)`, with the card released again, if it stays busy.
    pub fn select(&mut self) -> Result<bool, Error> {
        self.cs_low()?;
        // Dummy clock to force DO enabled
        self.receive()?;
        if self.wait_ready(self.ready_timeout_ms)? {
            return Ok(true);
        }
        trace!("card still busy after {} ms", self.ready_timeout_ms);
        self.deselect()?;
        Ok(false)
    }

    /// Perform a command and return the R1 response.
    ///
    /// An application command is preceded by `CMD55`; if that one fails
    /// outright its response is returned instead. Any extra response bytes
    /// (R3, R7) are left for the caller to clock in.
    pub fn card_command(&mut self, command: Command) -> Result<u8, Error> {
        if command.app {
            let r1 = self.send_command(Command::new(CMD55, 0))?;
            if r1 > R1_IDLE_STATE {
                return Ok(r1);
            }
        }
        self.send_command(command)
    }

    fn send_command(&mut self, command: Command) -> Result<u8, Error> {
        // A multi-block read is still streaming, so leave the card selected
        if command.index != CMD12 {
            self.deselect()?;
            if !self.select()? {
                return Ok(R1_NO_RESPONSE);
            }
        }

        for b in command.frame().iter() {
            self.send(*b)?;
        }

        // skip stuff byte for stop read
        if command.index == CMD12 {
            let _result = self.receive()?;
        }

        let mut r1 = R1_NO_RESPONSE;
        for _ in 0..RESPONSE_POLLS {
            r1 = self.receive()?;
            if (r1 & R1_FAILED) == 0 {
                break;
            }
        }
        trace!("CMD{} ({:x}) -> {:x}", command.index, command.arg, r1);
        Ok(r1)
    }

    /// Read a data packet into `buffer`. Always fills the given buffer, so
    /// make sure it's the right size.
    ///
    /// The two CRC bytes that follow the payload are clocked out and
    /// discarded.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let deadline = self.start_deadline(self.data_token_timeout_ms);
        let token = loop {
            let t = self.receive()?;
            if t != 0xFF || self.expired(&deadline) {
                break t;
            }
        };
        match token {
            DATA_START_BLOCK => {}
            0xFF => return Err(Error::TimeoutReadBuffer),
            _ => return Err(Error::ReadError),
        }

        self.receive_block(buffer)?;
        self.receive()?;
        self.receive()?;
        Ok(())
    }

    /// Send a data packet with the given start token, and check that the
    /// card accepted it.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        if !self.wait_ready(self.ready_timeout_ms)? {
            return Err(Error::TimeoutWaitNotBusy);
        }
        self.send(token)?;
        self.transmit_block(buffer)?;
        // Dummy CRC
        self.send(0xFF)?;
        self.send(0xFF)?;
        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            trace!("data response {:x}", status);
            return Err(Error::WriteError);
        }
        Ok(())
    }

    /// End a multi-block write.
    pub fn stop_write(&mut self) -> Result<(), Error> {
        if !self.wait_ready(self.ready_timeout_ms)? {
            return Err(Error::TimeoutWaitNotBusy);
        }
        self.send(STOP_TRAN_TOKEN)
    }
}
