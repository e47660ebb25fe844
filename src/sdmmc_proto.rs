//! embedded-sdmmc-diskio - Constants from the SD Specifications
//!
//! Command indices, response bits, data tokens and views over the card
//! registers we read back over SPI.

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - initiate the initialization process of an MMC
pub const CMD1: u8 = 0x01;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the Card Identification (CID register)
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SET_BLOCKLEN - set the block length for standard capacity cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// ERASE_WR_BLK_START - sets the address of the first block to be erased
pub const CMD32: u8 = 0x20;
/// ERASE_WR_BLK_END - sets the address of the last block to be erased
pub const CMD33: u8 = 0x21;
/// ERASE - erase the previously selected blocks
pub const CMD38: u8 = 0x26;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SD_STATUS - read the 64-byte SD Status register (application command)
pub const ACMD13: u8 = 0x0D;
/// SET_WR_BLK_ERASE_COUNT - number of blocks to pre-erase before writing
/// (application command)
pub const ACMD23: u8 = 0x17;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process (application command)
pub const ACMD41: u8 = 0x29;

/// Argument for CMD8: 2.7-3.6V supply, check pattern 0xAA.
pub const IF_COND_ARG: u32 = 0x0000_01AA;
/// Host Capacity Support bit in the ACMD41 argument.
pub const ACMD41_HCS: u32 = 1 << 30;

/// Valid CRC byte for CMD0(0)
pub const CRC_CMD0: u8 = 0x95;
/// Valid CRC byte for CMD8(0x1AA)
pub const CRC_CMD8: u8 = 0x87;
/// Dummy CRC plus stop bit. CRC is not checked once the card leaves idle.
pub const CRC_DUMMY: u8 = 0x01;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// Bit 7 of an R1 response is set when the card did not answer
pub const R1_FAILED: u8 = 0x80;

/// What a silent card clocks out, and what we report when it never got ready
pub const R1_NO_RESPONSE: u8 = 0xFF;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// The byte we clock out when we only want to read.
pub const FILL_BYTE: u8 = 0xFF;

/// Size of a data block, in bytes.
pub const BLOCK_LEN: usize = 512;

//==============================================================================

/// A command to the card: a 6-bit index, a 32-bit argument and whether it
/// has to be prefixed with `APP_CMD`.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Command {
    /// The command index (0..=63)
    pub index: u8,
    /// The 32-bit argument
    pub arg: u32,
    /// Send `CMD55` first
    pub app: bool,
}

impl Command {
    /// A standard command.
    pub const fn new(index: u8, arg: u32) -> Command {
        Command {
            index: index & 0x3F,
            arg,
            app: false,
        }
    }

    /// An application-specific command, sent after `CMD55`.
    pub const fn app(index: u8, arg: u32) -> Command {
        Command {
            index: index & 0x3F,
            arg,
            app: true,
        }
    }

    /// The six bytes put on the wire for this command.
    ///
    /// Only `CMD0` and `CMD8` need a valid CRC, because the card only checks
    /// it while in the idle state.
    pub fn frame(&self) -> [u8; 6] {
        let crc = match self.index {
            CMD0 => CRC_CMD0,
            CMD8 => CRC_CMD8,
            _ => CRC_DUMMY,
        };
        let arg = self.arg.to_be_bytes();
        [0x40 | self.index, arg[0], arg[1], arg[2], arg[3], crc]
    }
}

//==============================================================================

/// Card Specific Data, version 1 (SDSC and MMC cards)
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2 (SDHC and SDXC cards)
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl Csd {
    /// Pick the layout from the CSD_STRUCTURE bits. Anything other than
    /// version 2 (including MMC's own structure versions) uses the version 1
    /// layout.
    pub fn from_bytes(data: [u8; 16]) -> Csd {
        if data[0] >> 6 == 1 {
            Csd::V2(CsdV2 { data })
        } else {
            Csd::V1(CsdV1 { data })
        }
    }

    /// The raw register contents.
    pub fn data(&self) -> &[u8; 16] {
        match self {
            Csd::V1(csd) => &csd.data,
            Csd::V2(csd) => &csd.data,
        }
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(read_partial_blocks, bool, 6, 7);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    // MMC reuses bits 46..37 as ERASE_GRP_SIZE and ERASE_GRP_MULT.
    define_field!(erase_group_size, u8, 10, 2, 5);
    define_field!(erase_group_multiplier, u8, [(10, 0, 2), (11, 5, 3)]);
    define_field!(write_protect_group_size, u8, 11, 0, 7);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(copy_flag_set, bool, 14, 6);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (self.device_size() + 1) << multiplier.saturating_sub(9)
    }

    /// Erase unit of an SD v1 card, in 512-byte blocks.
    pub fn sd_erase_block_sectors(&self) -> u32 {
        (u32::from(self.erase_sector_size()) + 1) << self.max_write_data_length().saturating_sub(9)
    }

    /// Erase unit of an MMC, in 512-byte blocks.
    pub fn mmc_erase_group_sectors(&self) -> u32 {
        (u32::from(self.erase_group_size()) + 1) * (u32::from(self.erase_group_multiplier()) + 1)
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(copy_flag_set, bool, 14, 6);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) << 10
    }
}

/// Card Identification register
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Cid {
    /// The 16-bytes of data in this Card Identification block
    pub data: [u8; 16],
}

impl Cid {
    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(manufacturer_id, u8, 0, 0, 8);
    define_field!(oem_id, u16, be, 1);
    define_field!(product_revision, u8, 8, 0, 8);
    define_field!(serial_number, u32, be, 9);
    define_field!(manufacturing_date, u16, [(13, 0, 4), (14, 0, 8)]);

    /// The five ASCII characters of the product name.
    pub fn product_name(&self) -> &[u8] {
        &self.data[3..8]
    }

    /// Year of manufacture (SD cards count from 2000).
    pub fn manufacturing_year(&self) -> u16 {
        2000 + (self.manufacturing_date() >> 4)
    }

    /// Month of manufacture, 1..=12.
    pub fn manufacturing_month(&self) -> u8 {
        (self.manufacturing_date() & 0x0F) as u8
    }
}

/// Operation Conditions Register
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Ocr(pub u32);

impl Ocr {
    /// Build from the four bytes following an R3 response.
    pub fn from_bytes(bytes: [u8; 4]) -> Ocr {
        Ocr(u32::from_be_bytes(bytes))
    }

    /// The card has finished its power-up routine.
    pub fn is_powered_up(&self) -> bool {
        self.0 & (1 << 31) != 0
    }

    /// Card Capacity Status: the card uses block addressing.
    pub fn card_capacity_status(&self) -> bool {
        self.0 & (1 << 30) != 0
    }
}

/// The 64-byte SD Status register
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SdStatus {
    /// The 64-bytes of data in this SD Status block
    pub data: [u8; 64],
}

impl Default for SdStatus {
    fn default() -> Self {
        SdStatus { data: [0; 64] }
    }
}

impl core::fmt::Debug for SdStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdStatus")
            .field("au_size", &self.au_size())
            .finish()
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for SdStatus {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "SdStatus {{ au_size: {} }}", self.au_size())
    }
}

impl SdStatus {
    fn data(&self) -> &[u8; 64] {
        &self.data
    }

    define_field!(au_size, u8, 10, 4, 4);

    /// Allocation unit size in 512-byte blocks.
    pub fn allocation_unit_sectors(&self) -> u32 {
        16u32 << self.au_size()
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
