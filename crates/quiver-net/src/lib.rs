//! Readiness-driven TCP message server.
//!
//! Worker threads share one epoll instance, accept and drain connections,
//! and dispatch fixed-size records to per-type handlers. Linux only.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod poller;
pub mod pool;
pub mod registry;
pub mod server;
pub mod socket;
mod worker;

pub use config::ServerConfig;
pub use dispatch::{
    ConnectionHook, DispatchOutcome, Dispatcher, DropReason, Handler, HandlerTable, Reply,
};
pub use error::{RegistryError, ServerError};
pub use pool::{BufferPool, MessagePools, PooledMessage};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, ConnectionState};
pub use server::Server;

pub use quiver_metrics::StatsSnapshot;
