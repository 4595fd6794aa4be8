//! Lock-free server counters.
//!
//! Every field is an independent atomic. There is no cross-field
//! atomicity: a reader may see a latency sum and a sample count that were
//! bumped by different messages, so a mean read during dispatch is only
//! approximate. Once writers quiesce the mean is exact.
//!
//! Latency is accumulated as an arithmetic mean (sum / count), in
//! nanoseconds, the same unit as the protocol timestamp.

use std::sync::atomic::{AtomicU64, Ordering};

#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct ServerStats {
    total_messages: AtomicU64,
    dropped_messages: AtomicU64,
    short_reads: AtomicU64,
    send_failures: AtomicU64,

    active_connections: AtomicU64,
    peak_connections: AtomicU64,
    total_connections: AtomicU64,

    latency_sum_ns: AtomicU64,
    latency_samples: AtomicU64,
    wire_latency_sum_ns: AtomicU64,
    wire_latency_samples: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatched message and its processing time.
    #[inline]
    pub fn record_message(&self, latency_ns: u64) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Receipt time minus sender timestamp.
    #[inline]
    pub fn record_wire_latency(&self, latency_ns: u64) {
        self.wire_latency_sum_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.wire_latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// A full record that was not dispatched (unknown tag, bad header, no handler).
    #[inline]
    pub fn record_drop(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// A read shorter than one record, discarded.
    #[inline]
    pub fn record_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump the active count and raise the peak if this is a new maximum.
    pub fn on_connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let active = self.active_connections.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_connections.fetch_max(active, Ordering::AcqRel);
    }

    /// Drop the active count. The peak never decreases.
    pub fn on_connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn peak_connections(&self) -> u64 {
        self.peak_connections.load(Ordering::Acquire)
    }

    /// Mean processing latency in nanoseconds (0.0 before the first message).
    pub fn average_latency_ns(&self) -> f64 {
        mean(
            self.latency_sum_ns.load(Ordering::Relaxed),
            self.latency_samples.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_messages: self.total_messages.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Acquire),
            peak_connections: self.peak_connections.load(Ordering::Acquire),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            avg_latency_ns: self.average_latency_ns(),
            avg_wire_latency_ns: mean(
                self.wire_latency_sum_ns.load(Ordering::Relaxed),
                self.wire_latency_samples.load(Ordering::Relaxed),
            ),
        }
    }
}

#[inline]
fn mean(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

/// Read-only copy of [`ServerStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsSnapshot {
    pub total_messages: u64,
    pub dropped_messages: u64,
    pub short_reads: u64,
    pub send_failures: u64,
    pub active_connections: u64,
    pub peak_connections: u64,
    pub total_connections: u64,
    /// Mean dispatch time, nanoseconds.
    pub avg_latency_ns: f64,
    /// Mean sender-to-receipt time, nanoseconds.
    pub avg_wire_latency_ns: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_average_is_arithmetic_mean() {
        let stats = ServerStats::new();
        assert_eq!(stats.average_latency_ns(), 0.0);

        for d in [100, 250, 400, 50] {
            stats.record_message(d);
        }

        assert_eq!(stats.total_messages(), 4);
        assert_eq!(stats.average_latency_ns(), 200.0);
    }

    #[test]
    fn test_peak_tracks_maximum_and_never_decreases() {
        let stats = ServerStats::new();

        stats.on_connection_opened();
        stats.on_connection_opened();
        assert_eq!(stats.active_connections(), 2);
        assert_eq!(stats.peak_connections(), 2);

        stats.on_connection_closed();
        assert_eq!(stats.active_connections(), 1);
        assert_eq!(stats.peak_connections(), 2);

        stats.on_connection_opened();
        assert_eq!(stats.peak_connections(), 2);
        stats.on_connection_opened();
        assert_eq!(stats.peak_connections(), 3);

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 4);
    }

    #[test]
    fn test_close_without_open_does_not_underflow() {
        let stats = ServerStats::new();
        stats.on_connection_closed();
        assert_eq!(stats.active_connections(), 0);
    }

    #[test]
    fn test_concurrent_counter_is_monotonic_and_exact() {
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 50_000;

        let stats = Arc::new(ServerStats::new());

        let observer = {
            let stats = Arc::clone(&stats);
            thread::spawn(move || {
                let mut last = 0;
                while last < THREADS * PER_THREAD {
                    let now = stats.total_messages();
                    assert!(now >= last, "counter went backwards: {} -> {}", last, now);
                    last = now;
                }
            })
        };

        let writers: Vec<_> = (0..THREADS)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        stats.record_message(10);
                    }
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        observer.join().unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.total_messages, THREADS * PER_THREAD);
        assert_eq!(snap.avg_latency_ns, 10.0);
    }

    #[test]
    fn test_snapshot_during_updates_is_approximate_then_exact() {
        let stats = Arc::new(ServerStats::new());
        let writer = {
            let stats = Arc::clone(&stats);
            thread::spawn(move || {
                for _ in 0..100_000 {
                    stats.record_message(7);
                }
            })
        };

        // Sum and count are read separately, so the mean may be off while
        // the writer runs. It must still be finite and non-negative.
        for _ in 0..1_000 {
            let avg = stats.snapshot().avg_latency_ns;
            assert!(avg.is_finite() && avg >= 0.0, "avg {}", avg);
        }

        writer.join().unwrap();
        assert_eq!(stats.average_latency_ns(), 7.0);
    }

    #[test]
    fn test_drop_counters() {
        let stats = ServerStats::new();
        stats.record_drop();
        stats.record_short_read();
        stats.record_short_read();
        stats.record_send_failure();
        stats.record_wire_latency(1_000);
        stats.record_wire_latency(3_000);

        let snap = stats.snapshot();
        assert_eq!(snap.dropped_messages, 1);
        assert_eq!(snap.short_reads, 2);
        assert_eq!(snap.send_failures, 1);
        assert_eq!(snap.total_messages, 0);
        assert_eq!(snap.avg_wire_latency_ns, 2_000.0);
    }
}
