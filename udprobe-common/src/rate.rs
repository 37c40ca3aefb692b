use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A token bucket rate limiter.
///
/// The bucket holds at most `burst` tokens and refills at `rate` tokens per second. Unlike a
/// plain "try acquire" limiter, every call to [`RateLimiter::reserve`] succeeds and takes a
/// token, returning how long the caller has to wait before acting on it. The bucket may go
/// into debt, so back-to-back reservations are spaced out by `1 / rate` each.
///
/// A non-positive or non-finite rate disables limiting: every reservation is immediate.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens added per second.
    rate: f64,
    /// Capacity of the bucket.
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Available tokens. Negative when reservations have been handed out in advance.
    tokens: f64,
    /// The last time the bucket was refilled.
    last: Instant,
}

/// The outcome of a [`RateLimiter::reserve`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    delay: Duration,
}

impl Reservation {
    /// How long the caller has to wait before acting on this reservation.
    #[inline]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns `true` if the reservation was granted without delay, i.e. no throttling happened.
    #[inline]
    pub const fn is_immediate(&self) -> bool {
        self.delay.is_zero()
    }
}

impl RateLimiter {
    /// Creates a new limiter with the given refill rate (tokens per second) and bucket capacity.
    /// The bucket starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { rate, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    /// Creates a limiter that admits `pps` packets per second, with a burst capacity of one
    /// second's worth of packets.
    pub fn per_second(pps: f64) -> Self {
        let burst = if pps.is_finite() && pps >= 1.0 { pps as u32 } else { 1 };
        Self::new(pps, burst)
    }

    /// Returns the configured rate in tokens per second.
    #[inline]
    pub const fn rate(&self) -> f64 {
        self.rate
    }

    #[inline]
    fn is_unlimited(&self) -> bool {
        !(self.rate.is_finite() && self.rate > 0.0)
    }

    /// Takes a token and returns how long the caller must wait before using it.
    pub fn reserve(&self) -> Reservation {
        self.reserve_at(Instant::now())
    }

    pub(crate) fn reserve_at(&self, now: Instant) -> Reservation {
        if self.is_unlimited() {
            return Reservation { delay: Duration::ZERO };
        }

        let mut bucket = self.bucket.lock();

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        if now > bucket.last {
            bucket.last = now;
        }

        bucket.tokens -= 1.0;

        let delay = if bucket.tokens < 0.0 {
            Duration::from_secs_f64(-bucket.tokens / self.rate)
        } else {
            Duration::ZERO
        };

        Reservation { delay }
    }

    /// Reserves a token and sleeps for the imposed delay, if any. Returns the reservation so the
    /// caller can tell whether it was throttled.
    pub async fn wait(&self) -> Reservation {
        let reservation = self.reserve();
        if !reservation.is_immediate() {
            tokio::time::sleep(reservation.delay()).await;
        }

        reservation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Duration, b: Duration) -> bool {
        let diff = if a > b { a - b } else { b - a };
        diff < Duration::from_millis(1)
    }

    #[test]
    fn burst_is_admitted_immediately() {
        let limiter = RateLimiter::per_second(5.0);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.reserve_at(now).is_immediate());
        }

        let sixth = limiter.reserve_at(now);
        assert!(approx(sixth.delay(), Duration::from_millis(200)), "got {:?}", sixth.delay());
    }

    #[test]
    fn back_to_back_reservations_accumulate_delay() {
        let limiter = RateLimiter::per_second(1.0);
        let now = Instant::now();

        assert!(limiter.reserve_at(now).is_immediate());
        assert!(approx(limiter.reserve_at(now).delay(), Duration::from_secs(1)));
        assert!(approx(limiter.reserve_at(now).delay(), Duration::from_secs(2)));
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = RateLimiter::per_second(1.0);
        let now = Instant::now();

        assert!(limiter.reserve_at(now).is_immediate());
        assert!(!limiter.reserve_at(now).is_immediate());

        // Pays back the debt and refills one token, capped at the burst size.
        let later = now + Duration::from_secs(10);
        assert!(limiter.reserve_at(later).is_immediate());
        assert!(!limiter.reserve_at(later).is_immediate());
    }

    #[test]
    fn non_positive_rate_is_unlimited() {
        let limiter = RateLimiter::per_second(0.0);
        let now = Instant::now();

        for _ in 0..100 {
            assert!(limiter.reserve_at(now).is_immediate());
        }
    }

    #[tokio::test]
    async fn wait_sleeps_for_the_delay() {
        let limiter = RateLimiter::new(20.0, 1);

        let start = Instant::now();
        assert!(limiter.wait().await.is_immediate());
        let throttled = limiter.wait().await;

        assert!(!throttled.is_immediate());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
