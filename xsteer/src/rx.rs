//! Receive-side queue handle.
//!
//! [`RxQueue`] is the capability the hosting receive context holds for one
//! hardware queue: it claims the slot's receive role (RX producer + fill
//! consumer) so that no second context can drive the same queue, hands out
//! free frame buffers to write arriving payloads into, and runs the redirect
//! decision for each finished frame.
//!
//! The split mirrors the hosting environment: cold work (attach, claims)
//! happens once, per-frame work (`grab`/`deliver`) touches only rings, the
//! slot word, and a local stash — no locks, no syscalls, no allocation.

use crate::map::state::QueueSlot;
use crate::map::{DispatchMap, MapError};
use crate::redirect::{self, SteerOutcome, TransferError, Verdict};
use crate::shmem::Opener;
use crate::trace::debug;
use crate::types::{QueueId, RxDesc};

/// Result of delivering one frame, with ownership made explicit.
///
/// `Pass` carries the frame back to the caller: the redirect declined it and
/// normal receive processing continues, after which the host returns the
/// buffer with [`RxQueue::release`]. `Failed` does not: an undeliverable
/// frame is recycled immediately and never reaches normal processing.
#[derive(Debug)]
pub enum Disposition {
    /// Frame ownership moved into the bound socket's RX ring.
    Redirected,
    /// Bound socket's ring could not take the frame; the frame was recycled.
    Failed(TransferError),
    /// No socket bound; the caller keeps the frame for normal processing.
    Pass(RxFrame),
}

impl Disposition {
    /// The bare outcome code, without frame ownership.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Redirected => Verdict::Redirected,
            Self::Failed(error) => Verdict::Failed(*error),
            Self::Pass(_) => Verdict::Pass,
        }
    }
}

/// An owned, written frame, ready to be delivered.
///
/// Minted by [`FrameBuf::commit`]; holding one means owning the underlying
/// arena buffer exclusively.
#[derive(Debug)]
pub struct RxFrame {
    pub(crate) desc: RxDesc,
}

impl RxFrame {
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

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.desc.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.desc.len == 0
    }
}

/// Receive-side handle for one hardware queue.
pub struct RxQueue<
    const N: usize,
    const DEPTH: usize,
    const FRAMES: usize,
    const FRAME_SIZE: usize,
> {
    map: DispatchMap<Opener, N, DEPTH, FRAMES, FRAME_SIZE>,
    queue: QueueId,
    /// Locally recycled frame addresses: failed deliveries, released passes,
    /// abandoned buffers. Preferred over the fill ring on grab — the frame
    /// is already warm in this core's cache.
    stash: Vec<u64>,
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    RxQueue<N, DEPTH, FRAMES, FRAME_SIZE>
{
    /// Claims the receive role for `queue` on the given map.
    ///
    /// The map handle is owned for the lifetime of the attachment; the claim
    /// is released on drop.
    ///
    /// # Errors
    ///
    /// [`MapError::InvalidIndex`] when `queue` is outside the map,
    /// [`MapError::QueueBusy`] when another receive context already drives
    /// this queue.
    pub fn attach(
        map: DispatchMap<Opener, N, DEPTH, FRAMES, FRAME_SIZE>,
        queue: QueueId,
    ) -> Result<Self, MapError> {
        let slot = map.state().slot(queue.index()).ok_or(MapError::InvalidIndex {
            queue: queue.raw(),
            capacity: N,
        })?;
        if !slot.claim_receiver() {
            return Err(MapError::QueueBusy {
                queue: queue.raw(),
                role: "receiver",
            });
        }
        debug!(queue = %queue, "receive side attached");
        Ok(Self {
            map,
            queue,
            stash: Vec::with_capacity(FRAMES),
        })
    }

    /// The queue this handle drives.
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
            .expect("queue index validated at attach")
    }

    /// Takes a free frame buffer, or `None` when every frame is in flight.
    pub fn grab(&mut self) -> Option<FrameBuf<'_, N, DEPTH, FRAMES, FRAME_SIZE>> {
        let addr = match self.stash.pop() {
            Some(addr) => addr,
            // SAFETY: the receiver claim makes this the fill ring's only
            // consumer.
            None => unsafe { self.slot().fill_ring().pop() }?,
        };
        Some(FrameBuf {
            rxq: self,
            addr,
            committed: false,
        })
    }

    /// Runs the redirect decision for one frame.
    ///
    /// # Panics
    ///
    /// Panics if `frame` was minted by a handle for a different queue;
    /// frames do not move between queues.
    pub fn deliver(&mut self, frame: RxFrame) -> Disposition {
        assert_eq!(
            frame.desc.rx_queue,
            self.queue.raw(),
            "frame delivered through a different queue's handle"
        );
        // SAFETY: the receiver claim held by self makes this the slot's only
        // RX producer, and the assert above pins the frame to the claimed
        // queue.
        match unsafe { redirect::steer(self.map.state(), frame.desc) } {
            SteerOutcome::Redirected => Disposition::Redirected,
            SteerOutcome::Failed { desc, error } => {
                self.stash.push(desc.addr);
                Disposition::Failed(error)
            }
            SteerOutcome::Pass(desc) => Disposition::Pass(RxFrame { desc }),
        }
    }

    /// Returns a passed frame's buffer to circulation once normal receive
    /// processing is done with it.
    ///
    /// # Panics
    ///
    /// Panics if `frame` belongs to a different queue.
    pub fn release(&mut self, frame: RxFrame) {
        assert_eq!(
            frame.desc.rx_queue,
            self.queue.raw(),
            "frame released through a different queue's handle"
        );
        self.stash.push(frame.desc.addr);
    }
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize> Drop
    for RxQueue<N, DEPTH, FRAMES, FRAME_SIZE>
{
    fn drop(&mut self) {
        // Locally stashed frames return to circulation only when the map is
        // recreated, matching a driver pool teardown.
        self.slot().release_receiver();
        debug!(queue = %self.queue, "receive side detached");
    }
}

/// A free frame buffer checked out from an [`RxQueue`].
///
/// Write the arriving payload through [`bytes_mut`](Self::bytes_mut) (or
/// [`write`](Self::write)), then [`commit`](Self::commit) the final length.
/// Dropping without committing recycles the buffer.
pub struct FrameBuf<
    'q,
    const N: usize,
    const DEPTH: usize,
    const FRAMES: usize,
    const FRAME_SIZE: usize,
> {
    rxq: &'q mut RxQueue<N, DEPTH, FRAMES, FRAME_SIZE>,
    addr: u64,
    committed: bool,
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    FrameBuf<'_, N, DEPTH, FRAMES, FRAME_SIZE>
{
    /// The whole writable frame buffer.
    pub fn bytes_mut(&mut self) -> &mut [u8; FRAME_SIZE] {
        // SAFETY: this FrameBuf owns addr exclusively until commit or drop.
        unsafe { self.rxq.slot().arena().bytes_mut(self.addr) }
    }

    /// Copies `payload` into the buffer and commits.
    ///
    /// Payloads longer than the frame are truncated to `FRAME_SIZE`.
    #[must_use]
    pub fn write(mut self, payload: &[u8]) -> RxFrame {
        let len = payload.len().min(FRAME_SIZE);
        self.bytes_mut()[..len].copy_from_slice(&payload[..len]);
        self.commit(len as u32)
    }

    /// Seals the frame at `len` payload bytes.
    ///
    /// Lengths beyond the frame size are clamped.
    #[must_use]
    pub fn commit(mut self, len: u32) -> RxFrame {
        self.committed = true;
        let desc = RxDesc {
            addr: self.addr,
            len: len.min(FRAME_SIZE as u32),
            rx_queue: self.rxq.queue.raw(),
        };
        RxFrame { desc }
    }
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize> Drop
    for FrameBuf<'_, N, DEPTH, FRAMES, FRAME_SIZE>
{
    fn drop(&mut self) {
        if !self.committed {
            self.rxq.stash.push(self.addr);
        }
    }
}
