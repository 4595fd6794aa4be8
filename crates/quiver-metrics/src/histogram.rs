//! Processing-latency percentiles for the periodic stats log.
//!
//! The running mean lives in [`ServerStats`](crate::ServerStats); this is the
//! distribution behind it, reset after every report.

use std::fmt;

use hdrhistogram::Histogram;

/// Auto-resizing nanosecond histogram, 3 significant figures.
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new(3).expect("3 significant figures is always valid"),
        }
    }

    /// Samples past the auto-resize limit are dropped.
    #[inline(always)]
    pub fn record(&mut self, nanos: u64) {
        let _ = self.histogram.record(nanos);
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn reset(&mut self) {
        self.histogram.reset();
    }

    /// Percentiles of everything recorded since the last reset. All zero
    /// when nothing was recorded.
    pub fn summary(&self) -> LatencySummary {
        let h = &self.histogram;
        LatencySummary {
            count: h.len(),
            p50: h.value_at_quantile(0.50),
            p99: h.value_at_quantile(0.99),
            p999: h.value_at_quantile(0.999),
            max: h.max(),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time percentiles, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: u64,
    pub p50: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
}

/// Raw nanoseconds, so log lines stay comparable across reports.
impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} p50={}ns p99={}ns p99.9={}ns max={}ns",
            self.count, self.p50, self.p99, self.p999, self.max
        )
    }
}
