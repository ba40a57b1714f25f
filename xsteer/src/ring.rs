//! Lock-free SPSC descriptor ring.
//!
//! Fixed-capacity single-producer/single-consumer ring used for both sides
//! of a queue slot: the RX ring carrying frame descriptors into a socket,
//! and the fill ring carrying free frame addresses back out. Descriptors
//! move; payload bytes never do — that is the zero-copy hand-off.
//!
//! Head and tail are free-running counters published with release/acquire;
//! each side keeps a private cache of the other's counter so the common case
//! touches no foreign cache line. There are no locks and no syscalls.
//!
//! # Safety
//!
//! `push` and `pop` are `unsafe`: the caller must uphold the SPSC invariant,
//! exactly one producer and one consumer, with no concurrent access to
//! either role. The queue-slot claim words in [`map`](crate::map) are what
//! make that invariant hold across processes.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::shmem::ShmSafe;

/// Producer half: published head plus producer-private state.
#[repr(C)]
#[repr(align(64))]
pub struct ProducerPos {
    /// Count of published writes. Owned by the producer, read by the consumer.
    head: AtomicUsize,
    /// Producer-private slot cursor, always `head % N`.
    cursor: UnsafeCell<usize>,
    /// Producer-private cache of the consumer's tail.
    tail_cache: UnsafeCell<usize>,
}

impl ProducerPos {
    const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            cursor: UnsafeCell::new(0),
            tail_cache: UnsafeCell::new(0),
        }
    }
}

/// Consumer half: published tail plus consumer-private state.
#[repr(C)]
#[repr(align(64))]
pub struct ConsumerPos {
    /// Count of published reads. Owned by the consumer, read by the producer.
    tail: AtomicUsize,
    /// Consumer-private slot cursor, always `tail % N`.
    cursor: UnsafeCell<usize>,
    /// Consumer-private cache of the producer's head.
    head_cache: UnsafeCell<usize>,
}

impl ConsumerPos {
    const fn new() -> Self {
        Self {
            tail: AtomicUsize::new(0),
            cursor: UnsafeCell::new(0),
            head_cache: UnsafeCell::new(0),
        }
    }
}

/// Bounded SPSC ring of `N` slots.
///
/// The all-zero state is the valid empty ring, so a freshly zero-filled
/// shared mapping needs no further initialization.
#[repr(C)]
pub struct Ring<T, const N: usize> {
    producer: ProducerPos,
    consumer: ConsumerPos,
    slots: [UnsafeCell<MaybeUninit<T>>; N],
}

impl<T, const N: usize> Ring<T, N> {
    const CAPACITY_NONZERO: () = assert!(N > 0, "ring capacity must be nonzero");

    #[must_use]
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_NONZERO;
        Self {
            producer: ProducerPos::new(),
            consumer: ConsumerPos::new(),
            // SAFETY: an array of MaybeUninit requires no initialization
            slots: unsafe { MaybeUninit::uninit().assume_init() },
        }
    }

    /// Number of slots.
    #[must_use]
    pub const fn capacity() -> usize {
        N
    }

    /// Advances a cursor to the next slot, wrapping to 0 at capacity.
    ///
    /// Equivalent to `(cursor + 1) % N` without the division.
    #[inline]
    const fn next_index(cursor: usize) -> usize {
        let next = cursor + 1;
        if next == N { 0 } else { next }
    }

    /// Attempts to push an item, returning it back when the ring is full.
    ///
    /// Never blocks, never allocates.
    ///
    /// # Safety
    ///
    /// The caller is the ring's only producer for the duration of the call.
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        // Producer-owned index, no ordering needed
        let head = self.producer.head.load(Ordering::Relaxed);

        // SAFETY: the producer role is exclusive, so its private fields see
        // no concurrent access.
        let mut tail_cache = unsafe { *self.producer.tail_cache.get() };

        // Full according to the cached tail? Refresh once and re-check.
        if head.wrapping_sub(tail_cache) >= N {
            tail_cache = self.consumer.tail.load(Ordering::Acquire);
            // SAFETY: producer-private field, as above.
            unsafe {
                *self.producer.tail_cache.get() = tail_cache;
            }

            if head.wrapping_sub(tail_cache) >= N {
                return Err(item);
            }
        }

        // SAFETY: producer-private field; the cursor stays in [0, N) because
        // it starts at 0 and only moves through next_index.
        let slot = unsafe { *self.producer.cursor.get() };

        // SAFETY: the full-check guarantees the consumer is not reading this
        // slot, the cursor invariant keeps the index in bounds, and the head
        // publication below orders this write before any consumer read.
        unsafe {
            (*self.slots[slot].get()).write(item);
        }

        // SAFETY: producer-private field.
        unsafe {
            *self.producer.cursor.get() = Self::next_index(slot);
        }

        // Publish to the consumer
        self.producer
            .head
            .store(head.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Attempts to pop an item.
    ///
    /// Never blocks, never allocates.
    ///
    /// # Safety
    ///
    /// The caller is the ring's only consumer for the duration of the call.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        // Consumer-owned index, no ordering needed
        let tail = self.consumer.tail.load(Ordering::Relaxed);

        // SAFETY: the consumer role is exclusive, so its private fields see
        // no concurrent access.
        let mut head_cache = unsafe { *self.consumer.head_cache.get() };

        // Empty according to the cached head? Refresh once and re-check.
        if head_cache == tail {
            head_cache = self.producer.head.load(Ordering::Acquire);
            // SAFETY: consumer-private field, as above.
            unsafe {
                *self.consumer.head_cache.get() = head_cache;
            }

            if head_cache == tail {
                return None;
            }
        }

        // SAFETY: consumer-private field; cursor invariant as in push.
        let slot = unsafe { *self.consumer.cursor.get() };

        // SAFETY: head != tail proves the producer published this slot and
        // will not overwrite it before the tail store below; the acquire
        // load of head ordered the producer's write before this read.
        let item = unsafe { (*self.slots[slot].get()).assume_init_read() };

        // Publish to the producer
        self.consumer
            .tail
            .store(tail.wrapping_add(1), Ordering::Release);

        // SAFETY: consumer-private field.
        unsafe {
            *self.consumer.cursor.get() = Self::next_index(slot);
        }

        Some(item)
    }
}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: moving a ring between threads moves plain data; the private
// UnsafeCell fields carry no thread affinity.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

// SAFETY: shared access is mediated by the SPSC protocol — every slot is
// either being written by the sole producer or read by the sole consumer,
// never both, with release/acquire on head/tail as the barrier.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

// SAFETY: repr(C), no pointers, all cross-process coordination goes through
// the atomic head/tail; the private cells are only touched by their role's
// single owner. The all-zero state is the valid empty ring.
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for Ring<T, N> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_fifo() {
        let ring = Ring::<u64, 4>::new();
        // SAFETY: single thread, roles trivially exclusive
        unsafe {
            assert!(ring.push(1).is_ok());
            assert!(ring.push(2).is_ok());
            assert_eq!(ring.pop(), Some(1));
            assert_eq!(ring.pop(), Some(2));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn full_ring_rejects_push() {
        let ring = Ring::<u64, 2>::new();
        // SAFETY: single thread
        unsafe {
            assert!(ring.push(10).is_ok());
            assert!(ring.push(20).is_ok());
            assert_eq!(ring.push(30), Err(30));

            assert_eq!(ring.pop(), Some(10));
            assert!(ring.push(30).is_ok());
        }
    }

    #[test]
    fn wraps_around_many_times() {
        let ring = Ring::<u64, 3>::new();
        // SAFETY: single thread
        unsafe {
            for i in 0..100u64 {
                assert!(ring.push(i).is_ok());
                assert_eq!(ring.pop(), Some(i));
            }
        }
    }

    #[test]
    fn threaded_handoff() {
        use std::sync::Arc;

        let ring = Arc::new(Ring::<u64, 8>::new());
        let producer_ring = ring.clone();

        let producer = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                // SAFETY: this thread is the only producer
                while unsafe { producer_ring.push(i) }.is_err() {
                    std::hint::spin_loop();
                }
            }
        });

        for expected in 0..10_000u64 {
            // SAFETY: this thread is the only consumer
            let got = loop {
                if let Some(v) = unsafe { ring.pop() } {
                    break v;
                }
                std::hint::spin_loop();
            };
            assert_eq!(got, expected);
        }

        producer.join().unwrap();
    }
}
