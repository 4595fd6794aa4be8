use std::io;
use std::net::SocketAddr;

/// Failures that keep the server from starting or running.
///
/// Per-connection I/O errors never surface here; workers log them and tear
/// the connection down.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create listening socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create readiness descriptor: {0}")]
    Poller(#[source] io::Error),

    #[error("failed to register listener with readiness descriptor: {0}")]
    RegisterListener(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server has been shut down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection registry is full ({capacity} connections)")]
    Full { capacity: usize },
}
