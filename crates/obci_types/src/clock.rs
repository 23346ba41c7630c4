use std::time::Instant;

use once_cell::sync::Lazy;

static CLOCK_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds elapsed on the process-local monotonic clock.
///
/// Every sample timestamp in the bridge is expressed on this clock, so frames from
/// both boards can be compared directly.
pub fn local_clock() -> f64 {
    CLOCK_ORIGIN.elapsed().as_secs_f64()
}
