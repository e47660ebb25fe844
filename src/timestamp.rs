//! embedded-sdmmc-diskio - Timestamps
//!
//! Packs calendar time into the 32-bit date/time word that FAT directory
//! entries use.

#[cfg(feature = "chrono")]
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
#[cfg(feature = "chrono")]
use core::convert::TryFrom;

/// Things that can tell the filesystem layer what time it is.
pub trait TimeSource {
    /// Returns the current time
    fn get_timestamp(&self) -> Timestamp;
}

/// A calendar date and time of day, with no time zone.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Full year, e.g. 2024
    pub year: u16,
    /// 1..=12
    pub month: u8,
    /// 1..=31
    pub day: u8,
    /// 0..=23
    pub hours: u8,
    /// 0..=59
    pub minutes: u8,
    /// 0..=59
    pub seconds: u8,
}

impl Timestamp {
    /// The earliest year a FAT timestamp can hold.
    pub const FAT_EPOCH_YEAR: u16 = 1980;
    /// The latest year a FAT timestamp can hold.
    pub const FAT_MAX_YEAR: u16 = Self::FAT_EPOCH_YEAR + 127;

    /// Build a timestamp from FAT date and time halves.
    pub fn from_fat(date: u16, time: u16) -> Timestamp {
        Timestamp {
            year: Self::FAT_EPOCH_YEAR + (date >> 9),
            month: ((date >> 5) & 0x0F) as u8,
            day: (date & 0x1F) as u8,
            hours: (time >> 11) as u8,
            minutes: ((time >> 5) & 0x3F) as u8,
            seconds: ((time & 0x1F) * 2) as u8,
        }
    }

    /// Take the calendar fields of a `chrono` date and time.
    ///
    /// Returns `None` for years before 1 AD or past `u16::MAX`.
    #[cfg(feature = "chrono")]
    pub fn from_datetime(dt: &NaiveDateTime) -> Option<Timestamp> {
        Some(Timestamp {
            year: u16::try_from(dt.year()).ok().filter(|y| *y > 0)?,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hours: dt.hour() as u8,
            minutes: dt.minute() as u8,
            seconds: dt.second() as u8,
        })
    }

    /// Break a count of seconds since 1970-01-01T00:00:00 UTC into a
    /// calendar date and time.
    ///
    /// Returns `None` if the date is out of range for a `Timestamp`.
    #[cfg(feature = "chrono")]
    pub fn from_unix_seconds(secs: u64) -> Option<Timestamp> {
        let secs = i64::try_from(secs).ok()?;
        let dt = DateTime::<Utc>::from_timestamp(secs, 0)?;
        Self::from_datetime(&dt.naive_utc())
    }

    /// The upper 16 bits of the FAT word: year, month and day.
    pub fn fat_date(&self) -> u16 {
        let year = self
            .year
            .max(Self::FAT_EPOCH_YEAR)
            .min(Self::FAT_MAX_YEAR)
            - Self::FAT_EPOCH_YEAR;
        (year << 9) | (u16::from(self.month & 0x0F) << 5) | u16::from(self.day & 0x1F)
    }

    /// The lower 16 bits of the FAT word: hours, minutes and seconds / 2.
    pub fn fat_time(&self) -> u16 {
        (u16::from(self.hours & 0x1F) << 11)
            | (u16::from(self.minutes & 0x3F) << 5)
            | u16::from((self.seconds / 2) & 0x1F)
    }

    /// Pack into the 32-bit FAT word.
    ///
    /// ```text
    /// bit 31:25  year - 1980
    /// bit 24:21  month
    /// bit 20:16  day
    /// bit 15:11  hour
    /// bit 10:5   minute
    /// bit 4:0    second / 2
    /// ```
    pub fn to_fat(&self) -> u32 {
        (u32::from(self.fat_date()) << 16) | u32::from(self.fat_time())
    }
}

/// The current time from `source`, packed for a FAT directory entry.
pub fn fat_timestamp<T>(source: &T) -> u32
where
    T: TimeSource,
{
    source.get_timestamp().to_fat()
}
