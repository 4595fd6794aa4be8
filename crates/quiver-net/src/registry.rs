//! Live connections.
//!
//! Connections live in an arena. A [`ConnectionId`] is an arena index plus
//! the slot's generation at registration time; the generation is bumped on
//! every release, so an id held past teardown (for instance a readiness
//! event that was already queued) resolves to nothing instead of to the
//! next connection that reuses the slot.
//!
//! The registry itself is behind one coarse mutex. It is touched on accept,
//! on teardown, and once per readiness event to resolve the token.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use quiver_proto::{Message, MESSAGE_SIZE};
use tracing::warn;

use crate::error::RegistryError;

/// Generation-checked handle to a registered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a readiness token. Indices stay below `u32::MAX`, so the
    /// result never collides with [`LISTENER_TOKEN`](crate::poller::LISTENER_TOKEN).
    #[inline(always)]
    pub fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline(always)]
    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

/// Connection lifecycle. Only `Active` connections are serviced.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Accepted,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One accepted client.
pub struct Connection {
    id: ConnectionId,
    client_id: u64,
    stream: TcpStream,
    peer_addr: SocketAddr,
    fd: RawFd,
    last_heartbeat_ns: AtomicU64,
    authenticated: AtomicBool,
    state: AtomicU8,
    /// Serializes draining. Held for a whole read pass by one worker.
    io: Mutex<()>,
}

impl Connection {
    #[inline(always)]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline(always)]
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Protocol-clock time of the last heartbeat (or of the accept).
    pub fn last_heartbeat_ns(&self) -> u64 {
        self.last_heartbeat_ns.load(Ordering::Relaxed)
    }

    pub fn touch_heartbeat(&self, now_ns: u64) {
        self.last_heartbeat_ns.store(now_ns, Ordering::Relaxed);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Relaxed);
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// ACCEPTED -> ACTIVE.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Accepted as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to CLOSING. Returns true for exactly one caller; everyone else
    /// sees the connection already on its way out.
    pub fn begin_close(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match ConnectionState::from_u8(s) {
                    ConnectionState::Accepted | ConnectionState::Active => {
                        Some(ConnectionState::Closing as u8)
                    }
                    _ => None,
                }
            })
            .is_ok()
    }

    pub fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    pub fn lock_io(&self) -> MutexGuard<'_, ()> {
        self.io.lock()
    }

    /// One non-blocking read into `buf`.
    #[inline]
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Write one record with a single `write`. A short write is an error;
    /// nothing is retried or buffered.
    #[inline]
    pub fn send(&self, msg: &Message) -> io::Result<()> {
        let written = (&self.stream).write(msg.as_bytes())?;
        if written != MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("partial write: {} of {} bytes", written, MESSAGE_SIZE),
            ));
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("peer_addr", &self.peer_addr)
            .field("fd", &self.fd)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    conn: Option<Arc<Connection>>,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_fd: HashMap<RawFd, ConnectionId>,
    live: usize,
    next_client_id: u64,
}

impl Inner {
    fn release(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        self.free.push(id.index);
        self.live -= 1;
        if self.by_fd.get(&conn.fd) == Some(&id) {
            self.by_fd.remove(&conn.fd);
        }
        Some(conn)
    }
}

/// Arena of live connections, bounded by `capacity`.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                by_fd: HashMap::new(),
                live: 0,
                next_client_id: 1,
            }),
            capacity,
        }
    }

    /// Take ownership of `stream` and assign it an id and client id.
    ///
    /// The connection starts in ACCEPTED; the caller activates it once it
    /// is watched by the poller.
    pub fn register(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        authenticated: bool,
        now_ns: u64,
    ) -> Result<Arc<Connection>, RegistryError> {
        let fd = stream.as_raw_fd();
        let mut inner = self.inner.lock();

        // A live stream owns its fd, so an existing mapping is stale.
        if let Some(stale) = inner.by_fd.get(&fd).copied() {
            warn!(fd, ?stale, "evicting stale connection mapping");
            inner.release(stale);
        }

        if inner.live >= self.capacity {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::default());
                (inner.slots.len() - 1) as u32
            }
        };
        let generation = inner.slots[index as usize].generation;
        let id = ConnectionId { index, generation };

        let client_id = inner.next_client_id;
        inner.next_client_id += 1;

        let conn = Arc::new(Connection {
            id,
            client_id,
            stream,
            peer_addr,
            fd,
            last_heartbeat_ns: AtomicU64::new(now_ns),
            authenticated: AtomicBool::new(authenticated),
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            io: Mutex::new(()),
        });

        inner.slots[index as usize].conn = Some(Arc::clone(&conn));
        inner.by_fd.insert(fd, id);
        inner.live += 1;

        Ok(conn)
    }

    /// Remove the connection if `id` is still current.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().release(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.conn.clone()
    }

    pub fn lookup(&self, fd: RawFd) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        let id = *inner.by_fd.get(&fd)?;
        inner.slots[id.index as usize].conn.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove and return every live connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let ids: Vec<ConnectionId> = inner.by_fd.values().copied().collect();
        ids.into_iter().filter_map(|id| inner.release(id)).collect()
    }
}
