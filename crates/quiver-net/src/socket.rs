//! Socket option setup for the listener and accepted streams.
//!
//! Nagle off, keepalive on, 1 MiB kernel buffers, address reuse on the
//! listener, and non-blocking mode before anything touches the poller.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

fn apply_latency_options(socket: &SockRef<'_>, buffer_size: usize) -> io::Result<()> {
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    socket.set_send_buffer_size(buffer_size)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_nonblocking(true)?;
    Ok(())
}

/// Create, configure, bind and listen.
pub fn bind_listener(addr: SocketAddr, backlog: i32, buffer_size: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    apply_latency_options(&SockRef::from(&socket), buffer_size)?;

    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Configure a freshly accepted stream. Accepted sockets do not inherit
/// O_NONBLOCK on Linux, so this must run before registration.
pub fn configure_stream(stream: &TcpStream, buffer_size: usize) -> io::Result<()> {
    apply_latency_options(&SockRef::from(stream), buffer_size)
}
