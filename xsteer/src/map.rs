//! The dispatch map: a pinned, fixed-capacity `queue index → socket handle`
//! table plus the per-queue storage behind each binding.
//!
//! The map is the single shared mutable resource of the system. The control
//! plane creates it once under a well-known name and mutates bindings with
//! [`bind`](DispatchMap::bind)/[`unbind`](DispatchMap::unbind); the redirect
//! path only ever reads it, one atomic load per frame. Because the storage
//! is a named shared memory object, the table and its contents survive any
//! reload of the hot-path code: a re-attached receive hook or a restarted
//! control plane opens the same name and observes the same bindings.
//!
//! Writer discipline: bindings are single-word atomic replaces, so readers
//! are always safe, but the control plane is expected to serialize its own
//! writers per slot (one control plane at a time). The map does not arbitrate
//! between competing control planes.

pub mod state;

use thiserror::Error;

use crate::shmem::{Creator, Opener, Shm, ShmError, ShmMode, ShmPath};
use crate::trace::info;
use crate::types::{QueueId, SockHandle};

pub use state::MapState;

/// Queue slots in the reference configuration.
pub const MAX_QUEUES: usize = 64;

/// RX descriptor ring depth in the reference configuration.
pub const RING_DEPTH: usize = 1024;

/// Frames per queue slot in the reference configuration.
pub const FRAME_COUNT: usize = 1024;

/// Frame buffer size in the reference configuration.
pub const DEFAULT_FRAME_SIZE: usize = 2048;

/// Errors from map mutation and attachment.
///
/// Nothing here can occur on the per-frame path: invalid indices are
/// rejected at bind/unbind time, claim conflicts at attach/open time.
#[derive(Debug, Error)]
pub enum MapError {
    /// Queue index outside `[0, N)`.
    #[error("queue index {queue} out of range (map capacity {capacity})")]
    InvalidIndex { queue: u32, capacity: usize },
    /// Unbind of a queue that has no bound socket.
    #[error("queue {queue} has no bound socket")]
    NotBound { queue: u32 },
    /// The queue's role is already claimed by another endpoint.
    #[error("queue {queue} {role} role already claimed")]
    QueueBusy { queue: u32, role: &'static str },
    /// Shared memory operation failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
}

/// Handle to the pinned dispatch map.
///
/// The `Mode` typestate mirrors [`Shm`]: the [`Creator`] owns the name and
/// unlinks it on drop, [`Opener`] handles attach to an existing map and
/// leave the name pinned. Both sides see identical contents.
pub struct DispatchMap<
    Mode: ShmMode,
    const N: usize = MAX_QUEUES,
    const DEPTH: usize = RING_DEPTH,
    const FRAMES: usize = FRAME_COUNT,
    const FRAME_SIZE: usize = DEFAULT_FRAME_SIZE,
> {
    shm: Shm<MapState<N, DEPTH, FRAMES, FRAME_SIZE>, Mode>,
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    DispatchMap<Creator, N, DEPTH, FRAMES, FRAME_SIZE>
{
    /// Creates the map under `path` with every queue unbound.
    ///
    /// # Errors
    ///
    /// Fails if the name already exists or shared memory setup fails.
    pub fn create(path: ShmPath) -> Result<Self, MapError> {
        // SAFETY: the all-zero MapState is the valid empty map; the fill
        // rings are seeded below, before the handle (and thus the name's
        // contents) is handed to anyone.
        let shm = unsafe { Shm::<MapState<N, DEPTH, FRAMES, FRAME_SIZE>, Creator>::create_zeroed(path) }?;

        // SAFETY: the name was created with O_EXCL just now; no other
        // process has attached.
        unsafe { shm.seed_fill_rings() };

        info!(path = %shm.path(), capacity = N, "dispatch map created");
        Ok(Self { shm })
    }
}

impl<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    DispatchMap<Opener, N, DEPTH, FRAMES, FRAME_SIZE>
{
    /// Attaches to an existing map.
    ///
    /// A reopened map exposes exactly the bindings made through any other
    /// handle — this is the pinning contract.
    ///
    /// # Errors
    ///
    /// Fails if the name does not exist or its size does not match this
    /// map geometry.
    pub fn open(path: ShmPath) -> Result<Self, MapError> {
        let shm = Shm::<MapState<N, DEPTH, FRAMES, FRAME_SIZE>, Opener>::open(path)?;
        info!(path = %shm.path(), capacity = N, "dispatch map opened");
        Ok(Self { shm })
    }
}

impl<Mode: ShmMode, const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>
    DispatchMap<Mode, N, DEPTH, FRAMES, FRAME_SIZE>
{
    /// Looks up the socket bound to `queue`.
    ///
    /// Constant-time, lock-free, allocation-free; safe to call concurrently
    /// with itself and with `bind`/`unbind`. Absence is a valid state, not
    /// an error.
    #[inline]
    #[must_use]
    pub fn lookup(&self, queue: QueueId) -> Option<SockHandle> {
        self.shm.lookup(queue)
    }

    /// Binds `handle` to `queue`, replacing any existing binding.
    ///
    /// Control-plane only. A single atomic replace per slot: concurrent
    /// lookups observe either the old or the new handle.
    ///
    /// # Errors
    ///
    /// [`MapError::InvalidIndex`] when `queue >= N`; the map is unchanged.
    pub fn bind(&self, queue: QueueId, handle: SockHandle) -> Result<(), MapError> {
        let slot = self
            .shm
            .slot(queue.index())
            .ok_or(MapError::InvalidIndex {
                queue: queue.raw(),
                capacity: N,
            })?;
        slot.set_sock(handle);
        info!(queue = %queue, sock = handle.raw(), "queue bound");
        Ok(())
    }

    /// Removes the binding for `queue`.
    ///
    /// # Errors
    ///
    /// [`MapError::InvalidIndex`] when `queue >= N`;
    /// [`MapError::NotBound`] when the slot was already empty.
    pub fn unbind(&self, queue: QueueId) -> Result<(), MapError> {
        let slot = self
            .shm
            .slot(queue.index())
            .ok_or(MapError::InvalidIndex {
                queue: queue.raw(),
                capacity: N,
            })?;
        if !slot.clear_sock() {
            return Err(MapError::NotBound { queue: queue.raw() });
        }
        info!(queue = %queue, "queue unbound");
        Ok(())
    }

    /// Number of queue slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// The name this map is pinned under.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        self.shm.path()
    }

    pub(crate) fn state(&self) -> &MapState<N, DEPTH, FRAMES, FRAME_SIZE> {
        &self.shm
    }
}
