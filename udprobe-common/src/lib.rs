use std::time::{Duration, SystemTime};

pub mod rate;
pub use rate::{RateLimiter, Reservation};

/// Returns the current UNIX timestamp in nanoseconds.
///
/// Saturates to 0 if the system clock is set before the epoch, which downstream treats the same
/// as "not set".
#[inline]
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Returns the elapsed time between two nanosecond timestamps, or zero if `end` is before
/// `start`.
#[inline]
pub const fn nanos_between(start: u64, end: u64) -> Duration {
    Duration::from_nanos(end.saturating_sub(start))
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
    pub const MiB: u32 = 1024 * KiB;
    pub const GiB: u32 = 1024 * MiB;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_nanos_increases() {
        let mut prev = unix_nanos();
        for _ in 0..10 {
            std::thread::sleep(Duration::from_micros(10));
            let next = unix_nanos();
            assert!(next > prev, "clock went backwards: {next} <= {prev}");
            prev = next;
        }
    }

    #[test]
    fn nanos_between_saturates() {
        assert_eq!(nanos_between(10, 25), Duration::from_nanos(15));
        assert_eq!(nanos_between(25, 10), Duration::ZERO);
    }
}
