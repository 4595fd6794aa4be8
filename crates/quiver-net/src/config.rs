//! Server configuration.
//!
//! A plain value set. The process shell (CLI, environment) builds one and
//! hands it to [`Server::bind`](crate::Server::bind); the core never parses
//! arguments itself.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::ServerError;

/// Socket buffer size applied to SO_SNDBUF and SO_RCVBUF.
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: IpAddr,

    /// Port 0 asks the OS for an ephemeral port.
    pub port: u16,

    pub worker_threads: usize,

    /// Upper bound on each readiness wait; housekeeping runs at least this often.
    pub poll_timeout: Duration,

    /// Events fetched per readiness wait.
    pub max_events: usize,

    pub backlog: i32,

    pub socket_buffer_size: usize,

    /// Slots in each of the send and receive pools.
    pub buffer_pool_size: usize,

    pub max_connections: usize,

    /// Period of the stats snapshot logged by the reporting worker. `None` disables it.
    pub stats_interval: Option<Duration>,

    /// Value of the authenticated flag on newly accepted connections.
    pub authenticate_on_accept: bool,

    /// Pin worker `i` to core `i % cores`.
    pub pin_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8888,
            worker_threads: 4,
            poll_timeout: Duration::from_millis(1),
            max_events: 1024,
            backlog: 1024,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            buffer_pool_size: 1024,
            max_connections: 65_536,
            stats_interval: Some(Duration::from_secs(1)),
            authenticate_on_accept: true,
            pin_workers: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.worker_threads == 0 {
            return Err(invalid("worker_threads must be at least 1"));
        }
        // Each worker leases at most one receive and one send slot at a time.
        if self.buffer_pool_size < self.worker_threads {
            return Err(invalid(format!(
                "buffer_pool_size ({}) must be at least worker_threads ({})",
                self.buffer_pool_size, self.worker_threads
            )));
        }
        if self.max_events == 0 || self.max_events > i32::MAX as usize {
            return Err(invalid("max_events must be between 1 and i32::MAX"));
        }
        if self.max_connections == 0 || self.max_connections >= u32::MAX as usize {
            return Err(invalid("max_connections must be between 1 and u32::MAX - 1"));
        }
        if self.backlog <= 0 {
            return Err(invalid("backlog must be positive"));
        }
        if self.stats_interval == Some(Duration::ZERO) {
            return Err(invalid("stats_interval must be non-zero (use None to disable)"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ServerError {
    ServerError::InvalidConfig(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.socket_addr(), "127.0.0.1:8888".parse().unwrap());
        assert_eq!(config.socket_buffer_size, 1 << 20);
    }

    #[test]
    fn test_pool_must_cover_workers() {
        let config = ServerConfig {
            worker_threads: 8,
            buffer_pool_size: 4,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ServerConfig {
            worker_threads: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
