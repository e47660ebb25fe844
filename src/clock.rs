//! embedded-sdmmc-diskio - Timeout source
//!
//! Every polling loop in the driver is bounded by a millisecond deadline
//! taken from a [`Clock`].

/// A free-running millisecond counter.
///
/// The counter is allowed to wrap; deadlines are compared with wrapping
/// arithmetic.
pub trait Clock {
    /// Milliseconds since some arbitrary, fixed point in the past.
    fn now_ms(&self) -> u32;
}

impl<T> Clock for &T
where
    T: Clock,
{
    fn now_ms(&self) -> u32 {
        (*self).now_ms()
    }
}

/// A point in time after which a polling loop must give up.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Deadline {
    start: u32,
    timeout_ms: u32,
}

impl Deadline {
    /// Start a deadline `timeout_ms` from now.
    pub fn start<C>(clock: &C, timeout_ms: u32) -> Deadline
    where
        C: Clock,
    {
        Deadline {
            start: clock.now_ms(),
            timeout_ms,
        }
    }

    /// Has the deadline passed?
    pub fn expired<C>(&self, clock: &C) -> bool
    where
        C: Clock,
    {
        clock.now_ms().wrapping_sub(self.start) >= self.timeout_ms
    }
}
