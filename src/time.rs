//! Time-related types based on the transceiver's 40-bit system time
//!
//! All radio-side timestamps in this crate are carried in [`Instant`] and
//! [`Duration`], which wrap at 2^40 like the underlying hardware counter.
//! Deltas must always be computed through [`Instant::duration_since`] (or
//! explicit wrapping subtraction on truncated 32-bit wire timestamps); raw
//! 64-bit subtraction silently produces garbage across a counter wrap.

use core::ops::Add;

use serde::{Deserialize, Serialize};

/// The maximum value of 40-bit system time stamps.
pub const TIME_MAX: u64 = 0xff_ffff_ffff;

/// Duration of one radio clock tick, in seconds.
///
/// The nominal counter rate is 499.2 MHz × 128, i.e. roughly 15.65 ps per
/// tick. This is the constant used to convert a time of flight into meters.
pub const TIME_UNIT_S: f64 = 1.0 / 499.2e6 / 128.0;

/// One UWB microsecond expressed in radio clock ticks.
///
/// Delay and hold-off configuration values are given in UWB microseconds;
/// shifting left by 16 turns them into counter ticks.
pub const TICKS_PER_UWB_US: u64 = 1 << 16;

/// Represents an instant in radio system time
///
/// Internally uses the same 40-bit timestamps that the transceiver uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Instant(u64);

impl Instant {
    /// Creates a new instance of `Instant`
    ///
    /// The given value must fit in a 40-bit timestamp, so:
    /// 0 <= `value` <= 2^40 - 1
    ///
    /// Returns `Some(...)`, if `value` is within the valid range, `None` if
    /// it isn't.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use uwb_nrng::time::{Instant, TIME_MAX};
    ///
    /// let valid_instant   = Instant::new(TIME_MAX);
    /// let invalid_instant = Instant::new(TIME_MAX + 1);
    ///
    /// assert!(valid_instant.is_some());
    /// assert!(invalid_instant.is_none());
    /// ```
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Instant(value))
        } else {
            None
        }
    }

    /// Creates an `Instant` from an arbitrary tick count, truncated to 40 bits
    ///
    /// Used where a computed timestamp may have overflowed the counter width,
    /// for example when adding a slot offset near the end of an epoch.
    pub fn truncated(value: u64) -> Self {
        Instant(value & TIME_MAX)
    }

    /// Returns the raw 40-bit timestamp
    ///
    /// The returned value is guaranteed to be in the following range:
    /// 0 <= `value` <= 2^40 - 1
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the low 32 bits of the timestamp, as carried on the wire
    ///
    /// Ranging frames transport timestamps truncated to 32 bits; the receiver
    /// reconstructs deltas with wrapping 32-bit subtraction.
    pub fn lo32(&self) -> u32 {
        self.0 as u32
    }

    /// Returns the amount of time passed between the two `Instant`s
    ///
    /// Assumes that `&self` represents a later time than the argument
    /// `earlier`. Please make sure that this is the case, as this method has
    /// no way of knowing (40-bit timestamps can overflow, so comparing the
    /// numerical value of the timestamp doesn't tell anything about order).
    ///
    /// # Example
    ///
    /// ``` rust
    /// use uwb_nrng::time::{Instant, TIME_MAX};
    ///
    /// let instant_1 = Instant::new(TIME_MAX - 50).unwrap();
    /// let instant_2 = Instant::new(TIME_MAX).unwrap();
    /// let instant_3 = Instant::new(49).unwrap();
    ///
    /// // Works as expected, if the later timestamp is larger than the
    /// // earlier one.
    /// let duration = instant_2.duration_since(instant_1);
    /// assert_eq!(duration.value(), 50);
    ///
    /// // Still works as expected, if the later timestamp is the numerically
    /// // smaller value.
    /// let duration = instant_3.duration_since(instant_2);
    /// assert_eq!(duration.value(), 50);
    /// ```
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        if self.value() >= earlier.value() {
            Duration(self.value() - earlier.value())
        } else {
            Duration(TIME_MAX - earlier.value() + self.value() + 1)
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        // Both `Instant` and `Duration` are guaranteed to contain 40-bit
        // numbers, so this addition will never overflow.
        let value = (self.value() + rhs.value()) % (TIME_MAX + 1);

        Instant(value)
    }
}

/// A duration between two instants in radio system time
///
/// Internally uses the same 40-bit timestamps that the transceiver uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Duration(u64);

impl Duration {
    /// Creates a new instance of `Duration`
    ///
    /// The given value must fit in a 40-bit timestamp, so:
    /// 0 <= `value` <= 2^40 - 1
    ///
    /// Returns `Some(...)`, if `value` is within the valid range, `None` if
    /// it isn't.
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Duration(value))
        } else {
            None
        }
    }

    /// Creates a `Duration` from a number of UWB microseconds
    ///
    /// The result is truncated to 40 bits; delays longer than one full
    /// counter epoch (~17 s) cannot be represented on the radio anyway.
    pub fn from_uwb_us(us: u64) -> Self {
        Duration((us << 16) & TIME_MAX)
    }

    /// Returns the raw 40-bit duration value
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_rejects_values_wider_than_40_bits() {
        assert!(Instant::new(TIME_MAX).is_some());
        assert!(Instant::new(TIME_MAX + 1).is_none());
        assert!(Duration::new(TIME_MAX).is_some());
        assert!(Duration::new(TIME_MAX + 1).is_none());
    }

    #[test]
    fn duration_since_handles_wraparound() {
        let before = Instant::new(TIME_MAX - 10).unwrap();
        let after = Instant::new(20).unwrap();

        // (2^40 - 1 - before) + after + 1
        assert_eq!(after.duration_since(before).value(), 31);

        // The plain case still works.
        let a = Instant::new(1_000).unwrap();
        let b = Instant::new(4_000).unwrap();
        assert_eq!(b.duration_since(a).value(), 3_000);
    }

    #[test]
    fn add_wraps_at_40_bits() {
        let near_end = Instant::new(TIME_MAX - 5).unwrap();
        let wrapped = near_end + Duration::new(10).unwrap();
        assert_eq!(wrapped.value(), 4);
    }

    #[test]
    fn truncated_masks_to_40_bits() {
        let t = Instant::truncated(TIME_MAX + 7);
        assert_eq!(t.value(), 6);
    }

    #[test]
    fn uwb_microseconds_shift_into_ticks() {
        assert_eq!(Duration::from_uwb_us(1).value(), 0x1_0000);
        assert_eq!(Duration::from_uwb_us(512).value(), 512 << 16);
    }

    #[test]
    fn lo32_truncates_high_byte() {
        let t = Instant::new(0xAB_1234_5678).unwrap();
        assert_eq!(t.lo32(), 0x1234_5678);
    }
}
