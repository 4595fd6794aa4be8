//! Worker event loop.
//!
//! Every worker blocks on the same poller. The listener is level-triggered
//! and accepted until `WouldBlock`; connections are edge-triggered and
//! drained until `WouldBlock` under the connection's I/O lock, so a second
//! worker woken for the same socket waits and then finds nothing left to do.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::Zeroable;
use quiver_metrics::{LatencyHistogram, ServerStats};
use quiver_proto::{Message, MESSAGE_SIZE};
use quiver_ring::{Consumer, Producer};
use tracing::{debug, error, info, trace, warn};

use crate::dispatch::DispatchOutcome;
use crate::poller::{Event, Events, LISTENER_TOKEN};
use crate::registry::{Connection, ConnectionId};
use crate::server::Shared;

/// Per-worker latency ring size.
pub(crate) const LATENCY_RING_SIZE: usize = 4096;

pub(crate) type LatencyProducer = Producer<u64, LATENCY_RING_SIZE>;
pub(crate) type LatencyConsumer = Consumer<u64, LATENCY_RING_SIZE>;

/// How a drain pass ended.
enum Drain {
    /// Drained to `WouldBlock`; keep watching.
    Pending,
    /// Peer closed its end.
    PeerClosed,
    ReadFailed(io::Error),
    /// An ack write failed or came up short.
    WriteFailed(io::ErrorKind),
}

pub(crate) struct Worker {
    id: usize,
    shared: Arc<Shared>,
    latency_tx: LatencyProducer,
    reporter: Option<Reporter>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<Shared>,
        latency_tx: LatencyProducer,
        reporter: Option<Reporter>,
    ) -> Self {
        Self {
            id,
            shared,
            latency_tx,
            reporter,
        }
    }

    pub(crate) fn run(mut self) {
        if self.shared.config.pin_workers {
            pin_to_core(self.id);
        }

        let mut events = Events::with_capacity(self.shared.config.max_events);
        let timeout = self.shared.config.poll_timeout;
        info!(worker = self.id, "worker started");

        while self.shared.running.load(Ordering::Acquire) {
            if let Err(e) = self.shared.poller.wait(&mut events, timeout) {
                error!(worker = self.id, error = %e, "readiness wait failed, worker exiting");
                break;
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_all();
                } else {
                    self.service(event);
                }
            }

            self.housekeeping();
        }

        if let Some(reporter) = self.reporter.as_mut() {
            reporter.collect();
            reporter.report(&self.shared.stats);
        }
        info!(worker = self.id, "worker stopped");
    }

    fn accept_all(&self) {
        let guard = self.shared.listener.read();
        let Some(listener) = guard.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => self.shared.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn service(&mut self, event: Event) {
        let id = ConnectionId::from_token(event.token());
        let Some(conn) = self.shared.registry.get(id) else {
            // Already torn down, or a stale event for a reused slot.
            trace!(worker = self.id, ?id, "event for unknown connection");
            return;
        };

        let _io = conn.lock_io();
        if !conn.is_active() {
            return;
        }

        // Nothing left to read and the peer is gone.
        if event.is_hangup() && !event.is_readable() {
            self.shared.close_connection(&conn, "peer hung up");
            return;
        }

        match self.drain(&conn) {
            Drain::Pending if event.is_error() => {
                self.shared.close_connection(&conn, "socket error");
            }
            Drain::Pending => {}
            Drain::PeerClosed => {
                self.shared.close_connection(&conn, "peer closed");
            }
            Drain::ReadFailed(e) => {
                debug!(client_id = conn.client_id(), error = %e, "read failed");
                self.shared.close_connection(&conn, "read error");
            }
            Drain::WriteFailed(kind) => {
                debug!(client_id = conn.client_id(), error = ?kind, "ack write failed");
                self.shared.close_connection(&conn, "write error");
            }
        }
    }

    /// Read records until the socket has nothing left.
    ///
    /// One `read` of [`MESSAGE_SIZE`] bytes is taken as one record. A
    /// shorter read is counted and discarded; the connection stays open and
    /// no reassembly is attempted.
    fn drain(&mut self, conn: &Connection) -> Drain {
        let shared = &*self.shared;

        let mut leased = shared.pools.next_recv_slot();
        let mut fallback = Message::zeroed();
        let buf: &mut Message = match leased.as_deref_mut() {
            Some(slot) => slot,
            None => {
                warn!(worker = self.id, "receive pool exhausted, reading into stack buffer");
                &mut fallback
            }
        };

        loop {
            match conn.read(buf.as_bytes_mut()) {
                Ok(0) => return Drain::PeerClosed,
                Ok(n) if n < MESSAGE_SIZE => {
                    debug!(client_id = conn.client_id(), bytes = n, "short read, discarding");
                    shared.stats.record_short_read();
                }
                Ok(_) => {
                    // A full ring only costs the histogram a sample.
                    match shared
                        .dispatcher
                        .dispatch(buf, conn, &shared.pools, &shared.stats)
                    {
                        DispatchOutcome::Handled { latency_ns, .. } => {
                            let _ = self.latency_tx.try_push(latency_ns);
                        }
                        DispatchOutcome::WriteFailed { latency_ns, kind } => {
                            let _ = self.latency_tx.try_push(latency_ns);
                            return Drain::WriteFailed(kind);
                        }
                        DispatchOutcome::Dropped(_) => {}
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Drain::Pending,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Drain::ReadFailed(e),
            }
        }
    }

    fn housekeeping(&mut self) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.collect();
            if reporter.is_due() {
                reporter.report(&self.shared.stats);
            }
        }
    }
}

/// Drains every worker's latency ring and logs periodic snapshots.
pub(crate) struct Reporter {
    rings: Vec<LatencyConsumer>,
    histogram: LatencyHistogram,
    interval: Option<Duration>,
    last_report: Instant,
    scratch: Vec<u64>,
}

impl Reporter {
    pub(crate) fn new(rings: Vec<LatencyConsumer>, interval: Option<Duration>) -> Self {
        Self {
            rings,
            histogram: LatencyHistogram::new(),
            interval,
            last_report: Instant::now(),
            scratch: vec![0; 256],
        }
    }

    fn collect(&mut self) {
        for ring in &mut self.rings {
            loop {
                let n = ring.pop_batch(&mut self.scratch);
                for &ns in &self.scratch[..n] {
                    self.histogram.record(ns);
                }
                if n < self.scratch.len() {
                    break;
                }
            }
        }
    }

    fn is_due(&self) -> bool {
        self.interval
            .is_some_and(|interval| self.last_report.elapsed() >= interval)
    }

    fn report(&mut self, stats: &ServerStats) {
        if self.interval.is_none() {
            return;
        }

        let snap = stats.snapshot();
        info!(
            messages = snap.total_messages,
            active = snap.active_connections,
            peak = snap.peak_connections,
            total_connections = snap.total_connections,
            dropped = snap.dropped_messages,
            short_reads = snap.short_reads,
            send_failures = snap.send_failures,
            avg_latency_ns = snap.avg_latency_ns,
            avg_wire_latency_ns = snap.avg_wire_latency_ns,
            latency = %self.histogram.summary(),
            "stats"
        );

        self.histogram.reset();
        self.last_report = Instant::now();
    }
}

/// Pin the current thread to core `worker % cores`.
fn pin_to_core(worker: usize) {
    let Some(cores) = core_affinity::get_core_ids().filter(|c| !c.is_empty()) else {
        warn!(worker, "core ids unavailable, not pinning");
        return;
    };

    let core = cores[worker % cores.len()];
    if core_affinity::set_for_current(core) {
        debug!(worker, core = core.id, "pinned");
    } else {
        warn!(worker, core = core.id, "failed to pin");
    }
}
