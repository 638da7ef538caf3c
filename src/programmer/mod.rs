//! Top-level orchestration: guard-install, erase, program, guard-remove,
//! driven over either direct register I/O or the kernel character-device
//! endpoint. Both paths share this module's `PAGE_DELAY`/`busy_wait` and the
//! overall guard → erase → program → unguard shape; what differs is how
//! each writes a page.

pub mod direct;
pub mod driver;

use std::time::{Duration, Instant};

/// Inter-page delay: empirical, preserved verbatim from the original.
/// Busy-waited rather than slept, since OS sleep granularity can't reliably
/// resolve microseconds.
pub const PAGE_DELAY: Duration = Duration::from_micros(20);

pub(crate) fn busy_wait(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {}
}
