//! Wait-free SPSC ring buffer.
//!
//! A fixed-capacity circular queue for exactly one producer thread and
//! exactly one consumer thread. One slot is always left empty so that
//! "full" and "empty" can be told apart from the two cursors alone, which
//! makes the usable capacity `N - 1`.
//!
//! The single-producer/single-consumer contract is enforced by the type
//! system: [`channel`] hands out one [`Producer`] and one [`Consumer`], and
//! neither handle is `Clone`. Several producers need external serialization
//! or a different queue.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Default number of slots (must be a power of 2).
pub const DEFAULT_RING_SIZE: usize = 4096;

/// Cursor padded to its own cache line pair so the producer's and the
/// consumer's cursors never share a line.
#[repr(C, align(128))]
struct PaddedCursor {
    value: AtomicUsize,
}

impl PaddedCursor {
    const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
        }
    }
}

/// Shared ring storage. Only reachable through [`Producer`] and [`Consumer`].
pub struct SpscRing<T: Copy, const N: usize = DEFAULT_RING_SIZE> {
    /// Next slot to read (owned by consumer).
    head: PaddedCursor,

    /// Next slot to write (owned by producer).
    tail: PaddedCursor,

    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is written only by the producer before the tail is
// published with Release, and read only by the consumer after the tail is
// observed with Acquire. The head handshake is symmetric.
unsafe impl<T: Copy + Send, const N: usize> Send for SpscRing<T, N> {}
unsafe impl<T: Copy + Send, const N: usize> Sync for SpscRing<T, N> {}

impl<T: Copy, const N: usize> SpscRing<T, N> {
    const MASK: usize = N - 1;

    const VALID_SIZE: () = assert!(
        N >= 2 && N.is_power_of_two(),
        "ring size must be a power of 2 and at least 2"
    );

    fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SIZE;

        let slots: Vec<UnsafeCell<MaybeUninit<T>>> = (0..N)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            head: PaddedCursor::new(),
            tail: PaddedCursor::new(),
            slots: slots.into_boxed_slice(),
        }
    }

    /// Usable capacity (`N - 1`).
    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Number of items currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.value.load(Ordering::Acquire);
        let tail = self.tail.value.load(Ordering::Acquire);
        tail.wrapping_sub(head) & Self::MASK
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.value.load(Ordering::Acquire) == self.tail.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        let next_tail = (self.tail.value.load(Ordering::Acquire) + 1) & Self::MASK;
        next_tail == self.head.value.load(Ordering::Acquire)
    }
}

/// Allocate a ring of `N` slots and split it into its two endpoints.
///
/// This is the only allocation the ring ever performs.
pub fn channel<T: Copy, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let ring = Arc::new(SpscRing::<T, N>::new());
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

/// Write endpoint of an [`SpscRing`].
pub struct Producer<T: Copy, const N: usize = DEFAULT_RING_SIZE> {
    ring: Arc<SpscRing<T, N>>,
}

impl<T: Copy, const N: usize> Producer<T, N> {
    /// Attempt to enqueue a value.
    ///
    /// Returns `false` without blocking if the ring is full.
    #[inline(always)]
    pub fn try_push(&mut self, value: T) -> bool {
        let ring = &*self.ring;
        let tail = ring.tail.value.load(Ordering::Relaxed);
        let next_tail = (tail + 1) & SpscRing::<T, N>::MASK;

        if next_tail == ring.head.value.load(Ordering::Acquire) {
            return false;
        }

        // SAFETY: `tail` is always masked below N, and the consumer never
        // reads this slot until the Release store below publishes it.
        unsafe {
            (*ring.slots[tail].get()).write(value);
        }

        ring.tail.value.store(next_tail, Ordering::Release);
        true
    }

    /// Enqueue a value, spinning until space is available.
    #[inline]
    pub fn push(&mut self, value: T) {
        while !self.try_push(value) {
            core::hint::spin_loop();
        }
    }

    /// Free slots left before the ring reports full.
    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.ring.capacity() - self.ring.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Read endpoint of an [`SpscRing`].
pub struct Consumer<T: Copy, const N: usize = DEFAULT_RING_SIZE> {
    ring: Arc<SpscRing<T, N>>,
}

impl<T: Copy, const N: usize> Consumer<T, N> {
    /// Attempt to dequeue a value.
    ///
    /// Returns `None` without blocking if the ring is empty.
    #[inline(always)]
    pub fn try_pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.value.load(Ordering::Relaxed);

        if head == ring.tail.value.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: the Acquire load above synchronizes with the producer's
        // Release store, so the slot at `head` is fully written.
        let value = unsafe { (*ring.slots[head].get()).assume_init_read() };

        ring.head
            .value
            .store((head + 1) & SpscRing::<T, N>::MASK, Ordering::Release);

        Some(value)
    }

    /// Dequeue a value, spinning until one is available (BUSY WAIT).
    #[inline]
    pub fn pop(&mut self) -> T {
        loop {
            if let Some(value) = self.try_pop() {
                return value;
            }
            core::hint::spin_loop();
        }
    }

    /// Dequeue up to `out.len()` values.
    ///
    /// Returns number of items written into `out`.
    #[inline]
    pub fn pop_batch(&mut self, out: &mut [T]) -> usize {
        let mut count = 0;
        for slot in out.iter_mut() {
            match self.try_pop() {
                Some(value) => {
                    *slot = value;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Items available to consume.
    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_item() {
        let (mut producer, mut consumer) = channel::<u64, 16>();

        assert!(producer.try_push(42));
        assert_eq!(consumer.try_pop(), Some(42));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn test_capacity_is_n_minus_one() {
        let (producer, consumer) = channel::<u64, 16>();
        assert_eq!(producer.capacity(), 15);
        assert_eq!(consumer.capacity(), 15);
    }

    #[test]
    fn test_fill_drain() {
        let (mut producer, mut consumer) = channel::<u64, 16>();

        for i in 0..15 {
            assert!(producer.try_push(i), "Failed at {}", i);
        }

        assert!(producer.is_full());
        assert!(!producer.try_push(100));
        // A rejected push leaves the contents intact.
        assert_eq!(consumer.len(), 15);

        assert_eq!(consumer.try_pop(), Some(0));
        assert!(!producer.is_full());

        for i in 1..15 {
            assert_eq!(consumer.try_pop(), Some(i));
        }

        assert!(consumer.is_empty());
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn test_wrap_around() {
        let (mut producer, mut consumer) = channel::<u64, 4>();

        for round in 0..10 {
            let base = round * 3;

            for i in 0..3 {
                assert!(producer.try_push(base + i));
            }
            assert!(!producer.try_push(999));

            for i in 0..3 {
                assert_eq!(consumer.try_pop(), Some(base + i));
            }
        }
    }

    #[test]
    fn test_remaining_capacity() {
        let (mut producer, _consumer) = channel::<u64, 8>();

        assert_eq!(producer.remaining_capacity(), 7);

        producer.try_push(1);
        assert_eq!(producer.remaining_capacity(), 6);

        producer.try_push(2);
        producer.try_push(3);
        assert_eq!(producer.remaining_capacity(), 4);
    }

    #[test]
    fn test_pop_batch() {
        let (mut producer, mut consumer) = channel::<u64, 8>();

        for i in 0..5 {
            producer.push(i);
        }

        let mut out = [0u64; 3];
        assert_eq!(consumer.pop_batch(&mut out), 3);
        assert_eq!(out, [0, 1, 2]);

        let mut out = [0u64; 8];
        assert_eq!(consumer.pop_batch(&mut out), 2);
        assert_eq!(&out[..2], &[3, 4]);
        assert_eq!(consumer.len(), 0);
    }
}
