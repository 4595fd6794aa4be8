//! Clocks.
//!
//! Two time sources with different jobs:
//! - [`monotonic_nanos`] is the protocol clock. Message timestamps are
//!   `CLOCK_MONOTONIC` nanoseconds so a client on the same host can be
//!   compared against the server's receipt time.
//! - [`CycleClock`] is the TSC-backed clock used to time dispatch on the
//!   hot path.

/// Nanoseconds since an arbitrary, host-wide monotonic epoch.
#[inline]
pub fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec. CLOCK_MONOTONIC is always
    // supported, so the call cannot fail.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// RDTSC-based clock for lowest overhead timing.
#[derive(Clone)]
pub struct CycleClock {
    clock: quanta::Clock,
}

impl CycleClock {
    pub fn new() -> Self {
        Self {
            clock: quanta::Clock::new(),
        }
    }

    /// Raw counter reading.
    #[inline(always)]
    pub fn now(&self) -> u64 {
        self.clock.raw()
    }

    /// Convert two raw readings to elapsed nanoseconds.
    #[inline(always)]
    pub fn delta_as_nanos(&self, start: u64, end: u64) -> u64 {
        self.clock.delta_as_nanos(start, end)
    }
}

impl Default for CycleClock {
    fn default() -> Self {
        Self::new()
    }
}
