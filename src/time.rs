//! `NSec`: the datalogger's native timestamp, seconds and nanoseconds
//! since 1990-01-01T00:00:00 UTC.

use std::ops::AddAssign;

/// Seconds elapsed between the Unix epoch and the PakBus epoch
/// (1990-01-01T00:00:00 UTC).
pub const SECS_BEFORE_1990: i64 = 631_152_000;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// A timestamp as `(sec, nsec)`, counted from the PakBus epoch
/// (1990-01-01T00:00:00 UTC). Ordered lexicographically on `(sec, nsec)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NSec {
    pub sec: u32,
    pub nsec: u32,
}

impl NSec {
    pub const ZERO: NSec = NSec { sec: 0, nsec: 0 };

    pub fn new(sec: u32, nsec: u32) -> Self {
        let mut v = NSec { sec, nsec };
        v.normalize();
        v
    }

    fn normalize(&mut self) {
        if self.nsec >= NANOS_PER_SEC {
            self.sec = self.sec.wrapping_add(self.nsec / NANOS_PER_SEC);
            self.nsec %= NANOS_PER_SEC;
        }
    }

    /// Converts to a Unix timestamp in whole seconds (for `chrono`
    /// calendar formatting), per the `SECS_BEFORE_1990` offset the original
    /// uses to recover a `gmtime`-compatible `time_t`.
    pub fn unix_secs(&self) -> i64 {
        self.sec as i64 + SECS_BEFORE_1990
    }

    /// Milliseconds component of `nsec`, at 3-decimal precision. This
    /// fixes the original's `(10^(6-nano_precision))` typo (`^` there is
    /// XOR, not exponentiation) with the intended divisor directly.
    pub fn millis(&self) -> u32 {
        self.nsec / 1_000_000
    }
}

impl AddAssign for NSec {
    fn add_assign(&mut self, rhs: NSec) {
        self.sec = self.sec.wrapping_add(rhs.sec);
        self.nsec += rhs.nsec;
        self.normalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_on_add() {
        let mut a = NSec::new(0, 9 * 10u32.pow(8));
        a += NSec::new(0, 2 * 10u32.pow(8));
        assert_eq!(a, NSec::new(1, 1 * 10u32.pow(8)));
    }

    #[test]
    fn ordering() {
        assert!(NSec::new(5, 0) < NSec::new(5, 1));
        assert!(NSec::new(5, 1) < NSec::new(6, 0));
        assert_eq!(
            NSec::new(6, 0).cmp(&NSec::new(5, 999_999_999)),
            std::cmp::Ordering::Greater
        );
    }

    #[test]
    fn millis_precision() {
        assert_eq!(NSec::new(0, 123_456_789).millis(), 123);
    }
}
