//! Server statistics, latency histograms and clocks.
//!
//! Counters are plain atomics so every worker can update them without a
//! lock; readers take a [`StatsSnapshot`].

pub mod clock;
pub mod histogram;
pub mod stats;

pub use clock::{monotonic_nanos, CycleClock};
pub use histogram::{LatencyHistogram, LatencySummary};
pub use stats::{ServerStats, StatsSnapshot};
