//! Pre-allocated message slots.
//!
//! All slots are allocated at startup. A lease starts at a round-robin
//! index (one atomic increment) and probes forward to the first free slot,
//! so the common case is a single compare-exchange and no allocation.
//!
//! Slots are leased rather than handed out blindly: a slot that is still in
//! use is skipped instead of being overwritten when the index wraps. If
//! every slot is in flight, [`BufferPool::lease`] returns `None`.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytemuck::Zeroable;
use quiver_proto::Message;

struct Slot {
    leased: AtomicBool,
    message: UnsafeCell<Message>,
}

/// Fixed set of reusable [`Message`] buffers.
pub struct BufferPool {
    slots: Box<[Slot]>,
    next: AtomicUsize,
}

// SAFETY: a slot's message is only reachable through a `PooledMessage`,
// and at most one exists per slot thanks to the `leased` flag.
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// # Panics
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "buffer pool needs at least one slot");

        let slots: Vec<Slot> = (0..size)
            .map(|_| Slot {
                leased: AtomicBool::new(false),
                message: UnsafeCell::new(Message::zeroed()),
            })
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            next: AtomicUsize::new(0),
        }
    }

    /// Lease the next free slot in round-robin order.
    #[inline]
    pub fn lease(&self) -> Option<PooledMessage<'_>> {
        let len = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;

        for probe in 0..len {
            let index = (start + probe) % len;
            let slot = &self.slots[index];
            if slot
                .leased
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(PooledMessage { slot, index });
            }
        }

        None
    }

    /// Total slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots currently leased. Racy; for diagnostics.
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.leased.load(Ordering::Relaxed))
            .count()
    }
}

/// Exclusive access to one pool slot. Returned to the pool on drop.
///
/// The slot keeps whatever the previous holder wrote; callers overwrite it.
pub struct PooledMessage<'a> {
    slot: &'a Slot,
    index: usize,
}

impl PooledMessage<'_> {
    /// Position of this slot in its pool.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for PooledMessage<'_> {
    type Target = Message;

    #[inline(always)]
    fn deref(&self) -> &Message {
        // SAFETY: the lease gives this guard exclusive access to the slot.
        unsafe { &*self.slot.message.get() }
    }
}

impl DerefMut for PooledMessage<'_> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Message {
        // SAFETY: as above.
        unsafe { &mut *self.slot.message.get() }
    }
}

impl Drop for PooledMessage<'_> {
    fn drop(&mut self) {
        self.slot.leased.store(false, Ordering::Release);
    }
}

/// The server's two pools: inbound records and outbound acknowledgments.
pub struct MessagePools {
    pub send: BufferPool,
    pub recv: BufferPool,
}

impl MessagePools {
    pub fn new(size: usize) -> Self {
        Self {
            send: BufferPool::new(size),
            recv: BufferPool::new(size),
        }
    }

    #[inline]
    pub fn next_send_slot(&self) -> Option<PooledMessage<'_>> {
        self.send.lease()
    }

    #[inline]
    pub fn next_recv_slot(&self) -> Option<PooledMessage<'_>> {
        self.recv.lease()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_proto::MessageType;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_round_robin_order() {
        let pool = BufferPool::new(4);
        let indices: Vec<usize> = (0..6).map(|_| pool.lease().unwrap().index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_leased_slot_is_skipped_on_wrap() {
        let pool = BufferPool::new(2);
        let held = pool.lease().unwrap();
        assert_eq!(held.index(), 0);

        // Index 1, then wraps to 0 which is held, so probes on to 1.
        assert_eq!(pool.lease().unwrap().index(), 1);
        assert_eq!(pool.lease().unwrap().index(), 1);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let pool = BufferPool::new(2);
        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        assert!(pool.lease().is_none());

        drop(a);
        let c = pool.lease().unwrap();
        assert_ne!(c.index(), b.index());
    }

    #[test]
    fn test_slot_contents_survive_until_release() {
        let pool = BufferPool::new(2);
        let mut slot = pool.lease().unwrap();
        *slot = Message::new(99, MessageType::Heartbeat, 1);

        let other = pool.lease().unwrap();
        assert_ne!(other.index(), slot.index());
        assert_eq!(slot.header.message_id, 99);
    }

    #[test]
    fn test_concurrent_leases_are_exclusive() {
        let pool = Arc::new(BufferPool::new(8));

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..10_000u64 {
                        let mut slot = pool.lease().expect("pool sized above thread count");
                        let id = t * 1_000_000 + i + 1;
                        slot.header.message_id = id;
                        std::hint::spin_loop();
                        assert_eq!(slot.header.message_id, id);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_send_and_recv_pools_are_independent() {
        let pools = MessagePools::new(1);
        let _recv = pools.next_recv_slot().unwrap();
        assert!(pools.next_send_slot().is_some());
        assert!(pools.next_recv_slot().is_none());
    }
}
