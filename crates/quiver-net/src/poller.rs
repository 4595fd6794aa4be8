//! Shared readiness descriptor (Linux epoll).
//!
//! Unlike a per-thread poll object, one [`Poller`] is waited on by every
//! worker at once: `epoll_wait` and `epoll_ctl` are thread-safe, so all
//! methods take `&self`. The kernel may wake more than one waiter for the
//! same readiness change; callers must treat an event with no work behind
//! it as a no-op.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Token reserved for the listening socket. Connection tokens are packed
/// [`ConnectionId`](crate::ConnectionId)s and never reach this value.
pub const LISTENER_TOKEN: u64 = u64::MAX;

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Owned epoll instance. Closed on drop.
#[derive(Debug)]
pub struct Poller {
    fd: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let raw = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: epoll_create1 returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Watch `fd` for readability (and peer hangup) under `token`.
    pub fn add(&self, fd: RawFd, token: u64, edge_triggered: bool) -> io::Result<()> {
        let mut flags = libc::EPOLLIN | libc::EPOLLRDHUP;
        if edge_triggered {
            flags |= libc::EPOLLET;
        }

        let mut event = libc::epoll_event {
            events: flags as u32,
            u64: token,
        };
        syscall!(epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event))?;
        Ok(())
    }

    /// Stop watching `fd`. Must be called before `fd` is closed.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.fd.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        ))?;
        Ok(())
    }

    /// Block until at least one event is ready or `timeout` elapses.
    ///
    /// A signal interrupting the wait is reported as zero events.
    pub fn wait(&self, events: &mut Events, timeout: Duration) -> io::Result<usize> {
        events.clear();

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let capacity = events.buf.capacity().min(i32::MAX as usize) as i32;

        let res = syscall!(epoll_wait(
            self.fd.as_raw_fd(),
            events.buf.as_mut_ptr(),
            capacity,
            timeout_ms,
        ));

        match res {
            Ok(n) => {
                // SAFETY: the kernel initialized the first `n` entries, and
                // `n` never exceeds the capacity we passed in.
                unsafe { events.buf.set_len(n as usize) };
                Ok(n as usize)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Reusable event buffer, one per worker.
pub struct Events {
    buf: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf.iter().map(|raw| Event {
            // Copy out of the (possibly packed) kernel struct.
            token: raw.u64,
            flags: raw.events,
        })
    }
}

/// One readiness notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    token: u64,
    flags: u32,
}

impl Event {
    #[inline(always)]
    pub fn token(&self) -> u64 {
        self.token
    }

    #[inline(always)]
    pub fn is_readable(&self) -> bool {
        self.flags & libc::EPOLLIN as u32 != 0
    }

    /// Peer closed its write half, or the socket hung up entirely.
    #[inline(always)]
    pub fn is_hangup(&self) -> bool {
        self.flags & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0
    }

    #[inline(always)]
    pub fn is_error(&self) -> bool {
        self.flags & libc::EPOLLERR as u32 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_readable_event_carries_token() {
        let poller = Poller::new().unwrap();
        let (mut client, server) = pair();
        poller.add(server.as_raw_fd(), 42, true).unwrap();

        client.write_all(b"ping").unwrap();

        let mut events = Events::with_capacity(8);
        let n = poller.wait(&mut events, Duration::from_secs(1)).unwrap();
        assert_eq!(n, 1);

        let event = events.iter().next().unwrap();
        assert_eq!(event.token(), 42);
        assert!(event.is_readable());
        assert!(!event.is_error());
    }

    #[test]
    fn test_deleted_fd_delivers_no_events() {
        let poller = Poller::new().unwrap();
        let (mut client, server) = pair();
        poller.add(server.as_raw_fd(), 7, true).unwrap();
        poller.delete(server.as_raw_fd()).unwrap();

        client.write_all(b"ping").unwrap();

        let mut events = Events::with_capacity(8);
        let n = poller.wait(&mut events, Duration::from_millis(50)).unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_peer_close_reports_hangup() {
        let poller = Poller::new().unwrap();
        let (client, server) = pair();
        poller.add(server.as_raw_fd(), 1, true).unwrap();

        drop(client);

        let mut events = Events::with_capacity(8);
        assert_eq!(poller.wait(&mut events, Duration::from_secs(1)).unwrap(), 1);
        assert!(events.iter().next().unwrap().is_hangup());
    }

    #[test]
    fn test_timeout_with_no_sources() {
        let poller = Poller::new().unwrap();
        let mut events = Events::with_capacity(4);
        assert_eq!(poller.wait(&mut events, Duration::from_millis(1)).unwrap(), 0);
    }
}
