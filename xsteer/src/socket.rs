//! Consumer-side socket endpoint.
//!
//! [`RxSocket`] is the user-space end of a queue's zero-copy path: it claims
//! the slot's drain role (RX consumer + fill producer), exposes redirected
//! frames as borrowed byte views straight out of the arena, and recycles
//! each frame into the fill ring when its view is dropped.
//!
//! Opening a socket is what mints the [`SockHandle`] identity; binding that
//! handle into the map is a separate, control-plane action — a socket whose
//! handle was never bound simply never receives anything, and an unbound-
//! but-open socket keeps draining whatever was redirected before the unbind.

use std::ops::Deref;

use crate::map::state::QueueSlot;
use crate::map::{DispatchMap, MapError};
use crate::shmem::Opener;
use crate::trace::debug;
use crate::types::{QueueId, RxDesc, SockHandle};

/// User-space drain endpoint for one queue's RX ring.
pub struct RxSocket<
    const N: usize,
    const DEPTH: usize,
    const FRAMES: usize,
    const FRAME_SIZE: usize,
> {
    map: DispatchMap<Opener, N, DEPTH, FRAMES, FRAME_SIZE>,
    queue: QueueId,
    handle: SockHandle,
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    RxSocket<N, DEPTH, FRAMES, FRAME_SIZE>
{
    /// Claims the drain role for `queue` and mints the socket's handle.
    ///
    /// Descriptors left in the RX ring by a previous consumer are recycled
    /// into the fill ring before the socket becomes usable, so a rebound
    /// queue never delivers a predecessor's frames.
    ///
    /// # Errors
    ///
    /// [`MapError::InvalidIndex`] when `queue` is outside the map,
    /// [`MapError::QueueBusy`] when another drain endpoint is live on this
    /// queue.
    pub fn open(
        map: DispatchMap<Opener, N, DEPTH, FRAMES, FRAME_SIZE>,
        queue: QueueId,
    ) -> Result<Self, MapError> {
        let slot = map.state().slot(queue.index()).ok_or(MapError::InvalidIndex {
            queue: queue.raw(),
            capacity: N,
        })?;
        if !slot.claim_drainer() {
            return Err(MapError::QueueBusy {
                queue: queue.raw(),
                role: "drainer",
            });
        }

        let mut stale = 0usize;
        // SAFETY: the drainer claim makes this the slot's only RX consumer
        // and only fill producer.
        while let Some(desc) = unsafe { slot.rx_ring().pop() } {
            // Fill capacity bounds the number of circulating addresses, the
            // push cannot fail.
            let _ = unsafe { slot.fill_ring().push(desc.addr) };
            stale += 1;
        }
        if stale > 0 {
            debug!(queue = %queue, stale, "recycled stale descriptors");
        }

        let handle = SockHandle::generate();
        debug!(queue = %queue, sock = handle.raw(), "socket opened");
        Ok(Self { map, queue, handle })
    }

    /// The identity to bind into the dispatch map for this socket.
    #[must_use]
    pub fn handle(&self) -> SockHandle {
        self.handle
    }

    /// The queue this socket drains.
    #[must_use]
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// The underlying map handle.
    #[must_use]
    pub fn map(&self) -> &DispatchMap<Opener, N, DEPTH, FRAMES, FRAME_SIZE> {
        &self.map
    }

    fn slot(&self) -> &QueueSlot<DEPTH, FRAMES, FRAME_SIZE> {
        self.map
            .state()
            .slot(self.queue.index())
            .expect("queue index validated at open")
    }

    /// Pops the next redirected frame, if any.
    ///
    /// The returned view borrows the frame bytes zero-copy out of the
    /// arena; dropping it recycles the frame into the fill ring.
    pub fn recv(&mut self) -> Option<RxView<'_, DEPTH, FRAMES, FRAME_SIZE>> {
        let slot = self.slot();
        // SAFETY: the drainer claim makes this the slot's only RX consumer.
        let desc = unsafe { slot.rx_ring().pop() }?;
        Some(RxView { slot, desc })
    }
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize> Drop
    for RxSocket<N, DEPTH, FRAMES, FRAME_SIZE>
{
    fn drop(&mut self) {
        self.slot().release_drainer();
        debug!(queue = %self.queue, sock = self.handle.raw(), "socket closed");
    }
}

/// Zero-copy view of one redirected frame's payload.
///
/// Derefs to the payload bytes; dropping the view returns the frame to the
/// fill ring.
pub struct RxView<'s, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize> {
    slot: &'s QueueSlot<DEPTH, FRAMES, FRAME_SIZE>,
    desc: RxDesc,
}

impl<const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    RxView<'_, DEPTH, FRAMES, FRAME_SIZE>
{
    /// The frame's descriptor.
    #[must_use]
    pub fn desc(&self) -> RxDesc {
        self.desc
    }

    /// The queue the frame arrived on.
    #[must_use]
    pub fn rx_queue(&self) -> QueueId {
        QueueId::new(self.desc.rx_queue)
    }
}

impl<const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize> Deref
    for RxView<'_, DEPTH, FRAMES, FRAME_SIZE>
{
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: this view owns the descriptor, so no writer exists for
        // the frame until the view drops.
        unsafe { self.slot.arena().bytes(self.desc.addr, self.desc.len) }
    }
}

impl<const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize> Drop
    for RxView<'_, DEPTH, FRAMES, FRAME_SIZE>
{
    fn drop(&mut self) {
        // SAFETY: the view's borrow of the parent socket serializes fill
        // pushes, and the drainer claim excludes any other producer. The
        // push cannot fail: at most FRAMES addresses circulate.
        let _ = unsafe { self.slot.fill_ring().push(self.desc.addr) };
    }
}
