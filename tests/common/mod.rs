//! A simulated SD/MMC card in SPI mode.
//!
//! The card answers the bytes clocked into it one at a time, the same way a
//! real card does, so the driver under test sees framing, response delays,
//! data tokens and busy signalling.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use embedded_sdmmc_diskio::sdmmc_proto::Csd;
use embedded_sdmmc_diskio::{Clock, Options, SdMmcSpi};
use hex_literal::hex;

pub const SDHC_CSD: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");
pub const SDSC_CSD: [u8; 16] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
pub const SDV1_CSD: [u8; 16] = hex!("00 7F 00 32 5B 5A 83 AF 7F FF CF 80 16 80 00 6F");
pub const MMC_CSD: [u8; 16] = hex!("90 7F 00 32 5B 5A 83 AF 7F FF CF 80 16 80 00 6F");
pub const CID: [u8; 16] = hex!("03 53 44 53 55 30 32 47 80 12 34 56 78 01 37 FF");

/// Which kind of card is in the socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardKind {
    /// SD v2, block addressed
    Sdhc,
    /// SD v2, byte addressed
    SdV2Byte,
    /// SD v1
    SdV1,
    /// MMC v3
    Mmc,
    /// Nothing drives MISO
    Absent,
    /// Answers like an SD v2 card but never leaves the idle state
    NeverReady,
}

impl CardKind {
    fn is_v2(self) -> bool {
        matches!(self, CardKind::Sdhc | CardKind::SdV2Byte | CardKind::NeverReady)
    }

    fn block_addressed(self) -> bool {
        self == CardKind::Sdhc
    }

    fn csd(self) -> [u8; 16] {
        match self {
            CardKind::Sdhc | CardKind::NeverReady => SDHC_CSD,
            CardKind::SdV2Byte => SDSC_CSD,
            CardKind::SdV1 | CardKind::Absent => SDV1_CSD,
            CardKind::Mmc => MMC_CSD,
        }
    }

    fn ocr(self) -> [u8; 4] {
        if self.block_addressed() {
            [0xC0, 0xFF, 0x80, 0x00]
        } else {
            [0x80, 0xFF, 0x80, 0x00]
        }
    }
}

/// A command frame the card received.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Received {
    pub index: u8,
    pub arg: u32,
    /// Came straight after an accepted `APP_CMD`
    pub app: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Idle,
    ReadMulti { next: u32 },
    /// A multi-block read that ran into a withheld block
    Stalled,
    WriteSingle { sector: u32 },
    WriteMulti { sector: u32 },
}

/// All the card's state.
pub struct Card {
    pub kind: CardKind,
    selected: bool,
    in_idle: bool,
    app_next: bool,
    /// How many more times `ACMD41` / `CMD1` report idle
    pub init_polls: u32,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    rx: Option<Vec<u8>>,
    mode: Mode,
    busy: u32,
    pub stuck_busy: bool,
    pub sectors: HashMap<u32, [u8; 512]>,
    pub commands: Vec<Received>,
    pub stop_tokens: u32,
    pub pre_erase: Option<u32>,
    erase_start: u32,
    erase_end: u32,
    /// The start token of this sector is never sent
    pub withhold_token_at: Option<u32>,
    /// The data response for a write to this sector is an error
    pub reject_write_at: Option<u32>,
    pub spi_fails: bool,
    /// `SET_BLOCKLEN` is refused
    pub reject_blocklen: bool,
    /// `SEND_IF_COND` echoes this check pattern instead of the one sent
    pub bad_echo: Option<u8>,
    /// The CSD has `ERASE_BLK_EN` clear
    pub erase_disabled: bool,
    /// Chip Select went high while a command response was still queued
    pub cs_edges: u32,
}

/// The contents of a sector nobody has written.
pub fn pattern(sector: u32) -> [u8; 512] {
    let mut block = [0u8; 512];
    for (i, b) in block.iter_mut().enumerate() {
        *b = (sector as u8) ^ (i as u8).wrapping_mul(7);
    }
    block
}

fn packet(payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFF, 0xFE];
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&[0x12, 0x34]);
    bytes
}

impl Card {
    pub fn new(kind: CardKind) -> Card {
        Card {
            kind,
            selected: false,
            in_idle: true,
            app_next: false,
            init_polls: 3,
            frame: Vec::new(),
            out: VecDeque::new(),
            rx: None,
            mode: Mode::Idle,
            busy: 0,
            stuck_busy: false,
            sectors: HashMap::new(),
            commands: Vec::new(),
            stop_tokens: 0,
            pre_erase: None,
            erase_start: 0,
            erase_end: 0,
            withhold_token_at: None,
            reject_write_at: None,
            spi_fails: false,
            reject_blocklen: false,
            bad_echo: None,
            erase_disabled: false,
            cs_edges: 0,
        }
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn csd(&self) -> [u8; 16] {
        let mut csd = self.kind.csd();
        if self.erase_disabled {
            csd[10] &= !0x40;
        }
        csd
    }

    pub fn capacity(&self) -> u32 {
        Csd::from_bytes(self.csd()).card_capacity_blocks()
    }

    pub fn sector(&self, sector: u32) -> [u8; 512] {
        self.sectors
            .get(&sector)
            .cloned()
            .unwrap_or_else(|| pattern(sector))
    }

    /// Commands received, leaving out the `APP_CMD` prefixes.
    pub fn command_indices(&self) -> Vec<u8> {
        self.commands
            .iter()
            .filter(|c| c.index != 55)
            .map(|c| c.index)
            .collect()
    }

    pub fn last_command(&self, index: u8) -> Option<Received> {
        self.commands.iter().rev().find(|c| c.index == index).cloned()
    }

    fn set_cs(&mut self, low: bool) {
        if self.selected && !low {
            self.cs_edges += 1;
            self.out.clear();
            self.frame.clear();
        }
        self.selected = low;
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected || self.kind == CardKind::Absent {
            return 0xFF;
        }
        let miso = self.next_out();
        self.accept(mosi);
        miso
    }

    fn next_out(&mut self) -> u8 {
        if self.stuck_busy {
            return 0x00;
        }
        if let Some(b) = self.out.pop_front() {
            return b;
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        if let Mode::ReadMulti { next } = self.mode {
            if Some(next) == self.withhold_token_at || next >= self.capacity() {
                self.mode = Mode::Stalled;
            } else {
                let data = self.sector(next);
                self.out.extend(packet(&data));
                self.mode = Mode::ReadMulti { next: next + 1 };
                return self.out.pop_front().unwrap_or(0xFF);
            }
        }
        0xFF
    }

    fn accept(&mut self, mosi: u8) {
        if let Some(rx) = self.rx.as_mut() {
            rx.push(mosi);
            if rx.len() == 512 + 2 {
                self.finish_packet();
            }
            return;
        }
        if !self.frame.is_empty() {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let frame = std::mem::take(&mut self.frame);
                self.command(&frame);
            }
            return;
        }
        if mosi & 0xC0 == 0x40 {
            self.frame.push(mosi);
            return;
        }
        match (self.mode, mosi) {
            (Mode::WriteSingle { .. }, 0xFE) | (Mode::WriteMulti { .. }, 0xFC) => {
                self.rx = Some(Vec::new());
            }
            (Mode::WriteMulti { .. }, 0xFD) => {
                self.stop_tokens += 1;
                self.mode = Mode::Idle;
                self.busy = 4;
            }
            _ => {}
        }
    }

    fn finish_packet(&mut self) {
        let rx = self.rx.take().unwrap_or_default();
        let sector = match self.mode {
            Mode::WriteSingle { sector } | Mode::WriteMulti { sector } => sector,
            _ => return,
        };
        if Some(sector) == self.reject_write_at || sector >= self.capacity() {
            // Write error
            self.out.push_back(0x0D);
        } else {
            let mut block = [0u8; 512];
            block.copy_from_slice(&rx[..512]);
            self.sectors.insert(sector, block);
            // Upper bits of the data response are undefined
            self.out.push_back(0xE5);
            self.busy = 3;
        }
        self.mode = match self.mode {
            Mode::WriteMulti { sector } => Mode::WriteMulti { sector: sector + 1 },
            _ => Mode::Idle,
        };
    }

    fn to_sector(&self, arg: u32) -> u32 {
        if self.kind.block_addressed() {
            arg
        } else {
            arg / 512
        }
    }

    fn command(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = std::mem::replace(&mut self.app_next, false);
        self.commands.push(Received { index, arg, app });
        self.out.clear();

        // Only CMD0 and CMD8 are CRC checked, and only in the idle state
        let crc_ok = match index {
            0 => frame[5] == 0x95,
            8 => frame[5] == 0x87,
            _ => true,
        };
        if self.in_idle && !crc_ok {
            self.respond(0x09, &[]);
            return;
        }

        match (index, app) {
            (0, _) => {
                self.in_idle = true;
                self.mode = Mode::Idle;
                self.rx = None;
                self.respond(0x01, &[]);
            }
            (8, _) => {
                if self.kind.is_v2() {
                    let pattern = self.bad_echo.unwrap_or(arg as u8);
                    let echo = [0x00, 0x00, ((arg >> 8) & 0x0F) as u8, pattern];
                    self.respond(self.r1(), &echo);
                } else {
                    self.respond(self.r1() | 0x04, &[]);
                }
            }
            (55, _) => {
                if self.kind == CardKind::Mmc {
                    self.respond(self.r1() | 0x04, &[]);
                } else {
                    self.app_next = true;
                    self.respond(self.r1(), &[]);
                }
            }
            (41, true) | (1, false) => {
                let supported = (index == 41) != (self.kind == CardKind::Mmc);
                if !supported {
                    self.respond(self.r1() | 0x04, &[]);
                } else if self.kind == CardKind::NeverReady || self.init_polls > 0 {
                    self.init_polls = self.init_polls.saturating_sub(1);
                    self.respond(0x01, &[]);
                } else {
                    self.in_idle = false;
                    self.respond(0x00, &[]);
                }
            }
            (58, _) => {
                let ocr = self.kind.ocr();
                self.respond(self.r1(), &ocr);
            }
            _ if self.in_idle => self.respond(0x01 | 0x04, &[]),
            (16, _) => {
                let ok = arg == 512 && !self.reject_blocklen;
                self.respond(if ok { 0x00 } else { 0x40 }, &[])
            }
            (9, _) => {
                let data = packet(&self.csd());
                self.respond(0x00, &data);
            }
            (10, _) => self.respond(0x00, &packet(&CID)),
            (13, true) => {
                let mut status = [0u8; 64];
                // AU_SIZE = 9 (4 MiB)
                status[10] = 0x90;
                let mut extra = vec![0x00];
                extra.extend(packet(&status));
                self.respond(0x00, &extra);
            }
            (17, _) => {
                let sector = self.to_sector(arg);
                if sector >= self.capacity() {
                    self.respond(0x20, &[]);
                } else if Some(sector) == self.withhold_token_at {
                    self.respond(0x00, &[]);
                } else {
                    let data = packet(&self.sector(sector));
                    self.respond(0x00, &data);
                }
            }
            (18, _) => {
                let next = self.to_sector(arg);
                self.mode = Mode::ReadMulti { next };
                self.respond(0x00, &[]);
            }
            (12, _) => {
                self.mode = Mode::Idle;
                // Stuff byte, then R1
                self.out.extend(&[0xFF, 0x00]);
            }
            (24, _) => {
                let sector = self.to_sector(arg);
                self.mode = Mode::WriteSingle { sector };
                self.respond(0x00, &[]);
            }
            (25, _) => {
                let sector = self.to_sector(arg);
                self.mode = Mode::WriteMulti { sector };
                self.respond(0x00, &[]);
            }
            (23, true) => {
                self.pre_erase = Some(arg);
                self.respond(0x00, &[]);
            }
            (32, _) => {
                self.erase_start = self.to_sector(arg);
                self.respond(0x00, &[]);
            }
            (33, _) => {
                self.erase_end = self.to_sector(arg);
                self.respond(0x00, &[]);
            }
            (38, _) => {
                for sector in self.erase_start..=self.erase_end {
                    self.sectors.insert(sector, [0xFF; 512]);
                }
                self.respond(0x00, &[]);
                self.busy = 20;
            }
            _ => self.respond(0x04, &[]),
        }
    }

    fn r1(&self) -> u8 {
        if self.in_idle {
            0x01
        } else {
            0x00
        }
    }

    /// Queue an R1 after one byte of command response delay, then anything
    /// else the command returns.
    fn respond(&mut self, r1: u8, extra: &[u8]) {
        self.out.push_back(0xFF);
        self.out.push_back(r1);
        self.out.extend(extra);
    }
}

pub type SharedCard = Rc<RefCell<Card>>;

pub struct FakeSpi(pub SharedCard);

impl Transfer<u8> for FakeSpi {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        let mut card = self.0.borrow_mut();
        if card.spi_fails {
            return Err(());
        }
        for w in words.iter_mut() {
            *w = card.exchange(*w);
        }
        Ok(words)
    }
}

impl Write<u8> for FakeSpi {
    type Error = ();

    fn write(&mut self, words: &[u8]) -> Result<(), ()> {
        let mut card = self.0.borrow_mut();
        if card.spi_fails {
            return Err(());
        }
        for w in words {
            card.exchange(*w);
        }
        Ok(())
    }
}

pub struct FakeCs(pub SharedCard);

impl OutputPin for FakeCs {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        self.0.borrow_mut().set_cs(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        self.0.borrow_mut().set_cs(false);
        Ok(())
    }
}

/// Milliseconds, shared by the delay and the clock.
pub type SharedTime = Rc<Cell<u32>>;

pub struct FakeDelay(pub SharedTime);

impl DelayMs<u8> for FakeDelay {
    fn delay_ms(&mut self, ms: u8) {
        self.0.set(self.0.get().wrapping_add(u32::from(ms)));
    }
}

/// Moves on a millisecond every time it is read, so no polling loop can
/// spin forever.
pub struct FakeClock(pub SharedTime);

impl Clock for FakeClock {
    fn now_ms(&self) -> u32 {
        let now = self.0.get();
        self.0.set(now.wrapping_add(1));
        now
    }
}

pub type Disk = SdMmcSpi<FakeSpi, FakeCs, FakeDelay, FakeClock>;

pub fn disk(kind: CardKind) -> (Disk, SharedCard) {
    disk_with_options(kind, Options::default())
}

pub fn disk_with_options(kind: CardKind, options: Options) -> (Disk, SharedCard) {
    let _ = env_logger::builder().is_test(true).try_init();
    let card = Rc::new(RefCell::new(Card::new(kind)));
    let time = Rc::new(Cell::new(0));
    let disk = SdMmcSpi::new_with_options(
        FakeSpi(card.clone()),
        FakeCs(card.clone()),
        FakeDelay(time.clone()),
        FakeClock(time),
        options,
    );
    (disk, card)
}

/// A disk that has been through `initialize`, with the command log cleared.
pub fn ready_disk(kind: CardKind) -> (Disk, SharedCard) {
    let (mut disk, card) = disk(kind);
    let status = disk.initialize(0);
    assert!(status.is_empty(), "init failed: {:?}", status);
    card.borrow_mut().commands.clear();
    (disk, card)
}
