//! Server lifecycle.
//!
//! [`Server`] is an owned value: bind it, start it, stop it (or drop it).
//! Several servers can run in one process.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;
use quiver_metrics::{monotonic_nanos, ServerStats, StatsSnapshot};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, HandlerTable};
use crate::error::{RegistryError, ServerError};
use crate::poller::{Poller, LISTENER_TOKEN};
use crate::pool::MessagePools;
use crate::registry::{Connection, ConnectionRegistry};
use crate::socket;
use crate::worker::{LatencyConsumer, Reporter, Worker};

/// State shared by every worker.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) running: AtomicBool,
    pub(crate) poller: Poller,
    pub(crate) listener: RwLock<Option<TcpListener>>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) pools: MessagePools,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) stats: ServerStats,
}

impl Shared {
    /// Configure, register and start watching a freshly accepted stream.
    pub(crate) fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = socket::configure_stream(&stream, self.config.socket_buffer_size) {
            warn!(%peer, error = %e, "failed to configure accepted socket");
            return;
        }

        let conn = match self.registry.register(
            stream,
            peer,
            self.config.authenticate_on_accept,
            monotonic_nanos(),
        ) {
            Ok(conn) => conn,
            Err(RegistryError::Full { capacity }) => {
                warn!(%peer, capacity, "connection limit reached, refusing");
                return;
            }
        };

        // Active before it is watched, so no edge arrives for an inactive
        // connection.
        conn.activate();
        self.dispatcher.connection_opened(&conn);
        self.stats.on_connection_opened();

        if let Err(e) = self.poller.add(conn.fd(), conn.id().to_token(), true) {
            error!(%peer, error = %e, "failed to watch connection");
            self.registry.unregister(conn.id());
            conn.begin_close();
            conn.mark_closed();
            self.dispatcher.connection_closed(&conn);
            self.stats.on_connection_closed();
            return;
        }

        info!(client_id = conn.client_id(), %peer, fd = conn.fd(), "client connected");
    }

    /// Tear a connection down. Only the first caller does anything.
    ///
    /// The socket leaves the poller before the registry lets go of it, so no
    /// readiness event can name a released descriptor.
    pub(crate) fn close_connection(&self, conn: &Connection, reason: &'static str) -> bool {
        if !conn.begin_close() {
            return false;
        }

        if let Err(e) = self.poller.delete(conn.fd()) {
            debug!(client_id = conn.client_id(), error = %e, "poller delete failed");
        }
        self.registry.unregister(conn.id());
        conn.shutdown();
        conn.mark_closed();
        self.dispatcher.connection_closed(conn);
        self.stats.on_connection_closed();

        info!(
            client_id = conn.client_id(),
            peer = %conn.peer_addr(),
            reason,
            "client disconnected"
        );
        true
    }

    fn close_listener(&self) {
        if let Some(listener) = self.listener.write().take() {
            if let Err(e) = self.poller.delete(listener.as_raw_fd()) {
                debug!(error = %e, "listener delete failed");
            }
        }
    }
}

/// A bound, optionally running, message server.
pub struct Server {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    workers: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl Server {
    /// Bind with the default handlers.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_handlers(config, HandlerTable::with_default_handlers())
    }

    /// Validate `config`, create the poller and listening socket, and watch
    /// the listener. No threads are started.
    pub fn with_handlers(config: ServerConfig, handlers: HandlerTable) -> Result<Self, ServerError> {
        config.validate()?;

        let poller = Poller::new().map_err(ServerError::Poller)?;

        let addr = config.socket_addr();
        let listener = socket::bind_listener(addr, config.backlog, config.socket_buffer_size)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        poller
            .add(listener.as_raw_fd(), LISTENER_TOKEN, false)
            .map_err(ServerError::RegisterListener)?;

        info!(
            %local_addr,
            workers = config.worker_threads,
            pool = config.buffer_pool_size,
            "server bound"
        );

        let shared = Arc::new(Shared {
            registry: ConnectionRegistry::new(config.max_connections),
            pools: MessagePools::new(config.buffer_pool_size),
            dispatcher: Dispatcher::new(handlers),
            running: AtomicBool::new(false),
            listener: RwLock::new(Some(listener)),
            stats: ServerStats::new(),
            poller,
            config,
        });

        Ok(Self {
            shared,
            local_addr,
            workers: Vec::new(),
            stopped: false,
        })
    }

    /// Spawn the worker threads.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.stopped {
            return Err(ServerError::Shutdown);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }

        let count = self.shared.config.worker_threads;
        let mut producers = Vec::with_capacity(count);
        let mut consumers: Vec<LatencyConsumer> = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = quiver_ring::channel();
            producers.push(tx);
            consumers.push(rx);
        }

        let mut reporter = Some(Reporter::new(consumers, self.shared.config.stats_interval));

        for (id, latency_tx) in producers.into_iter().enumerate() {
            let worker = Worker::new(id, Arc::clone(&self.shared), latency_tx, reporter.take());
            let spawned = thread::Builder::new()
                .name(format!("quiver-worker-{}", id))
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(ServerError::Spawn(e));
                }
            }
        }

        info!(addr = %self.local_addr, workers = count, "server started");
        Ok(())
    }

    /// Stop accepting, join the workers and close every connection.
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shared.running.store(false, Ordering::Release);
        self.shared.close_listener();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }

        for conn in self.shared.registry.drain() {
            if conn.begin_close() {
                if let Err(e) = self.shared.poller.delete(conn.fd()) {
                    debug!(client_id = conn.client_id(), error = %e, "poller delete failed");
                }
                conn.shutdown();
                conn.mark_closed();
                self.shared.dispatcher.connection_closed(&conn);
                self.shared.stats.on_connection_closed();
            }
        }

        let snap = self.shared.stats.snapshot();
        info!(
            messages = snap.total_messages,
            peak = snap.peak_connections,
            avg_latency_ns = snap.avg_latency_ns,
            "server stopped"
        );
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
