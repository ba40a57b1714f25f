//! Shared state layout of the dispatch map.
//!
//! One flat array of per-queue slots, `#[repr(C)]`, living in a pinned
//! shared mapping. Per slot: the socket-handle word (the authoritative
//! bound/unbound state), two role claim words, the RX descriptor ring, the
//! fill ring, and the frame arena the descriptors address.
//!
//! The all-zero state is a valid empty map — no queue bound, no role
//! claimed, rings empty — which lets creation start from the kernel's zero
//! fill; only the fill rings need seeding afterwards.
//!
//! Trust boundary: every process mapping this state is in the same trust
//! domain (they cooperate on raw frame memory by design), so descriptor
//! fields read back from rings are checked with debug assertions, not
//! runtime validation.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::ring::Ring;
use crate::shmem::ShmSafe;
use crate::types::{QueueId, RxDesc, SockHandle};

const CLAIM_FREE: u32 = 0;
const CLAIM_HELD: u32 = 1;

/// One frame buffer with interior mutability.
///
/// Exclusive ownership of a frame is tracked by possession of its address:
/// an address is always in exactly one place (fill ring, receive-side stash,
/// RX ring, or a live frame/view object), so the cell is never written and
/// read concurrently.
#[repr(transparent)]
pub struct FrameCell<const FRAME_SIZE: usize>(UnsafeCell<[u8; FRAME_SIZE]>);

// SAFETY: access is serialized by frame-address ownership (see above); the
// cell itself is plain bytes.
unsafe impl<const FRAME_SIZE: usize> Send for FrameCell<FRAME_SIZE> {}
unsafe impl<const FRAME_SIZE: usize> Sync for FrameCell<FRAME_SIZE> {}

// SAFETY: repr(transparent) over a byte array; no pointers; zero is a valid
// (blank) frame.
unsafe impl<const FRAME_SIZE: usize> ShmSafe for FrameCell<FRAME_SIZE> {}

/// Frame buffer arena of one queue slot.
///
/// Frames are addressed by byte offset; valid addresses are exactly the
/// multiples of `FRAME_SIZE` below `FRAMES * FRAME_SIZE`, minted once when
/// the fill ring is seeded.
#[repr(C)]
pub struct Arena<const FRAMES: usize, const FRAME_SIZE: usize> {
    frames: [FrameCell<FRAME_SIZE>; FRAMES],
}

impl<const FRAMES: usize, const FRAME_SIZE: usize> Arena<FRAMES, FRAME_SIZE> {
    fn frame_index(addr: u64) -> usize {
        debug_assert_eq!(addr as usize % FRAME_SIZE, 0, "misaligned frame address");
        let index = addr as usize / FRAME_SIZE;
        debug_assert!(index < FRAMES, "frame address outside arena");
        index
    }

    /// Read-only view of a frame's payload.
    ///
    /// # Safety
    ///
    /// The caller owns `addr` (holds its descriptor) and no writer exists
    /// for the duration of the borrow.
    pub(crate) unsafe fn bytes(&self, addr: u64, len: u32) -> &[u8] {
        let index = Self::frame_index(addr);
        let len = (len as usize).min(FRAME_SIZE);
        // SAFETY: ownership of addr serializes access per the FrameCell
        // contract; index is in bounds per the minting invariant.
        unsafe { &(&(*self.frames[index].0.get()))[..len] }
    }

    /// Writable view of a whole frame buffer.
    ///
    /// # Safety
    ///
    /// The caller owns `addr` exclusively for the duration of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, addr: u64) -> &mut [u8; FRAME_SIZE] {
        let index = Self::frame_index(addr);
        // SAFETY: as in bytes(); exclusivity comes from address ownership.
        unsafe { &mut *self.frames[index].0.get() }
    }
}

// SAFETY: repr(C) array of ShmSafe cells.
unsafe impl<const FRAMES: usize, const FRAME_SIZE: usize> ShmSafe for Arena<FRAMES, FRAME_SIZE> {}

/// Per-queue slot: handle word, role claims, rings, arena.
#[repr(C)]
pub struct QueueSlot<const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize> {
    /// Bound socket handle's raw value; 0 = unbound. Written only by the
    /// control plane, read lock-free by the redirect path.
    sock: AtomicU64,
    /// Receive-side role claim (RX producer + fill consumer).
    receiver_claim: AtomicU32,
    /// Drain-side role claim (RX consumer + fill producer).
    drainer_claim: AtomicU32,
    /// Ingress ring: descriptors of redirected frames, receive side → socket.
    rx: Ring<RxDesc, DEPTH>,
    /// Free-frame ring: recycled addresses, socket → receive side.
    fill: Ring<u64, FRAMES>,
    /// The frame buffers both rings' descriptors address.
    arena: Arena<FRAMES, FRAME_SIZE>,
}

// SAFETY: repr(C); every field is ShmSafe; cross-process coordination goes
// through the atomics and the ring protocol. Zero = unbound and unclaimed.
unsafe impl<const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize> ShmSafe
    for QueueSlot<DEPTH, FRAMES, FRAME_SIZE>
{
}

impl<const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    QueueSlot<DEPTH, FRAMES, FRAME_SIZE>
{
    /// The currently bound socket handle, if any.
    ///
    /// Single atomic load: a concurrent bind/unbind yields either the old or
    /// the new value, never a torn one.
    #[inline]
    pub(crate) fn sock(&self) -> Option<SockHandle> {
        SockHandle::from_raw(self.sock.load(Ordering::Acquire))
    }

    pub(crate) fn set_sock(&self, handle: SockHandle) {
        self.sock.store(handle.raw(), Ordering::Release);
    }

    /// Clears the binding, returning whether one existed.
    pub(crate) fn clear_sock(&self) -> bool {
        self.sock.swap(0, Ordering::AcqRel) != 0
    }

    fn claim(word: &AtomicU32) -> bool {
        word.compare_exchange(CLAIM_FREE, CLAIM_HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(word: &AtomicU32) {
        word.store(CLAIM_FREE, Ordering::Release);
    }

    /// Claims the receive-side role (RX producer + fill consumer).
    pub(crate) fn claim_receiver(&self) -> bool {
        Self::claim(&self.receiver_claim)
    }

    pub(crate) fn release_receiver(&self) {
        Self::release(&self.receiver_claim);
    }

    /// Claims the drain-side role (RX consumer + fill producer).
    pub(crate) fn claim_drainer(&self) -> bool {
        Self::claim(&self.drainer_claim)
    }

    pub(crate) fn release_drainer(&self) {
        Self::release(&self.drainer_claim);
    }

    pub(crate) fn rx_ring(&self) -> &Ring<RxDesc, DEPTH> {
        &self.rx
    }

    pub(crate) fn fill_ring(&self) -> &Ring<u64, FRAMES> {
        &self.fill
    }

    pub(crate) fn arena(&self) -> &Arena<FRAMES, FRAME_SIZE> {
        &self.arena
    }

    /// Seeds the fill ring with every frame address.
    ///
    /// # Safety
    ///
    /// Call once, before the map's name is published to any other process.
    unsafe fn seed_fill(&self) {
        for index in 0..FRAMES {
            // Fill capacity equals FRAMES, the pushes cannot fail.
            // SAFETY: no other process has attached yet, so this is the
            // ring's only producer.
            let _ = unsafe { self.fill.push((index * FRAME_SIZE) as u64) };
        }
    }
}

/// The dispatch map's shared state: a flat, fixed-size array of `N` queue
/// slots, indexed by queue number.
#[repr(C)]
pub struct MapState<
    const N: usize,
    const DEPTH: usize,
    const FRAMES: usize,
    const FRAME_SIZE: usize,
> {
    slots: [QueueSlot<DEPTH, FRAMES, FRAME_SIZE>; N],
}

// SAFETY: repr(C) array of ShmSafe slots.
unsafe impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    ShmSafe for MapState<N, DEPTH, FRAMES, FRAME_SIZE>
{
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    MapState<N, DEPTH, FRAMES, FRAME_SIZE>
{
    /// Constant-time, lock-free, allocation-free lookup.
    ///
    /// Out-of-range indices answer `None` — an unmanaged queue, not an
    /// error.
    #[inline]
    #[must_use]
    pub fn lookup(&self, queue: QueueId) -> Option<SockHandle> {
        self.slots.get(queue.index())?.sock()
    }

    /// Number of queue slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> Option<&QueueSlot<DEPTH, FRAMES, FRAME_SIZE>> {
        self.slots.get(index)
    }

    /// Seeds every slot's fill ring.
    ///
    /// # Safety
    ///
    /// Call once, before the map's name is published to any other process.
    pub(crate) unsafe fn seed_fill_rings(&self) {
        for slot in &self.slots {
            // SAFETY: forwarded contract.
            unsafe { slot.seed_fill() };
        }
    }
}
