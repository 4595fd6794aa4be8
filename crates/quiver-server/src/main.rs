//! Quiver server binary.
//!
//! Parses arguments, sets up logging, runs the server until SIGINT or
//! SIGTERM, then logs the final counters.

use std::io;
use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use quiver_net::{Server, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "quiver-server", version, about = "Low-latency fixed-format message server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    #[arg(short, long, default_value_t = 8888)]
    port: u16,

    /// Worker threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Slots in each of the send and receive pools
    #[arg(long, default_value_t = 1024)]
    pool_size: usize,

    #[arg(long, default_value_t = 65_536)]
    max_connections: usize,

    /// Stats log period in milliseconds; 0 disables
    #[arg(long, default_value_t = 1000)]
    stats_interval_ms: u64,

    /// Pin each worker to its own core
    #[arg(long)]
    pin_workers: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_address: self.ip,
            port: self.port,
            worker_threads: self.threads,
            buffer_pool_size: self.pool_size,
            max_connections: self.max_connections,
            stats_interval: (self.stats_interval_ms > 0)
                .then(|| Duration::from_millis(self.stats_interval_ms)),
            pin_workers: self.pin_workers,
            ..ServerConfig::default()
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .compact()
        .init();
}

/// Block SIGINT and SIGTERM on this thread. Workers spawned afterwards
/// inherit the mask, so only [`wait_for_signal`] ever sees them.
fn block_shutdown_signals() -> io::Result<libc::sigset_t> {
    // SAFETY: `set` is a plain C struct initialized by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);

        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(set)
    }
}

fn wait_for_signal(set: &libc::sigset_t) -> io::Result<i32> {
    let mut signal = 0;
    // SAFETY: `set` was initialized by block_shutdown_signals.
    let rc = unsafe { libc::sigwait(set, &mut signal) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(signal)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    let signals = match block_shutdown_signals() {
        Ok(set) => set,
        Err(e) => {
            error!(error = %e, "failed to block shutdown signals");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::bind(args.into_config()) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to bind server");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.start() {
        error!(error = %e, "failed to start server");
        return ExitCode::FAILURE;
    }
    info!(addr = %server.local_addr(), "listening, press Ctrl+C to stop");

    match wait_for_signal(&signals) {
        Ok(signal) => info!(signal, "shutdown signal received"),
        Err(e) => error!(error = %e, "signal wait failed, shutting down"),
    }

    server.stop();

    let snap = server.stats();
    info!(
        messages = snap.total_messages,
        dropped = snap.dropped_messages,
        short_reads = snap.short_reads,
        send_failures = snap.send_failures,
        peak_connections = snap.peak_connections,
        total_connections = snap.total_connections,
        avg_latency_us = snap.avg_latency_ns / 1_000.0,
        avg_wire_latency_us = snap.avg_wire_latency_ns / 1_000.0,
        "final statistics"
    );

    ExitCode::SUCCESS
}
