//! Transmit pacing and idle backoff for the drain actor.

use rand::Rng;
use std::time::Duration;

/// Consecutive sends before an extra cooldown
pub const BURST_LENGTH: u32 = 9;

/// Sleep after a transmission that took `tx` to complete.
///
/// Longer transmissions earn a larger multiplier so slow profiles keep a
/// lower duty cycle.
pub fn after_transmit(tx: Duration) -> Duration {
    let ms = tx.as_millis() as u64;
    let pause = if ms > 900 {
        ms * 7 / 2
    } else if ms > 600 {
        ms * 3
    } else if ms > 300 {
        ms * 2
    } else {
        (ms + 2) / 2
    };
    Duration::from_millis(pause)
}

/// Extra cooldown after [`BURST_LENGTH`] back-to-back sends
pub fn burst_cooldown<R: Rng>(rng: &mut R) -> Duration {
    Duration::from_millis(15 + rng.gen_range(0..20))
}

/// Sleep when the outgoing queue stayed empty, longer on slow profiles
pub fn idle_backoff<R: Rng>(profile: u8, rng: &mut R) -> Duration {
    let mut ms = rng.gen_range(10..50);
    if profile < 4 {
        ms += rng.gen_range(10..20);
        if profile < 2 {
            ms += rng.gen_range(20..49);
        }
    }
    Duration::from_millis(ms)
}

/// Next retry scan delay: base plus uniform jitter in `0..jitter`
pub fn retry_scan_delay<R: Rng>(base: Duration, jitter: Duration, rng: &mut R) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rng.gen_range(0..jitter_ms))
}
