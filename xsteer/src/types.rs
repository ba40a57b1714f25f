//! Queue, socket, and frame descriptor types.

use std::fmt;
use std::num::NonZeroU64;

/// Hardware receive-queue index.
///
/// Valid indices are `0..MAX_QUEUES` for the map they are used against;
/// range checking happens at the map boundary, not here, so that an index
/// read from frame metadata can be represented before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct QueueId(u32);

impl QueueId {
    /// Wraps a raw queue index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The raw index value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The index as a usize, for slot addressing.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for QueueId {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of a zero-copy ingress socket.
///
/// The raw value is what the dispatch map stores per queue slot and what the
/// trace channel prints on redirect events. Zero is reserved to encode
/// "unbound" in the slot word, hence the `NonZeroU64` representation: a
/// handle's presence and its value are a single atomic load, so concurrent
/// readers can never observe a torn entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SockHandle(NonZeroU64);

impl SockHandle {
    /// Generates a handle unique to this process instance.
    ///
    /// Combines the process ID with a random nonce so that a restarted
    /// consumer never aliases its predecessor's handle, even under PID
    /// reuse.
    #[must_use]
    pub fn generate() -> Self {
        let pid = u64::from(std::process::id());
        loop {
            let nonce = u64::from(rand::random::<u32>());
            if let Some(raw) = NonZeroU64::new((pid << 32) | nonce) {
                return Self(raw);
            }
        }
    }

    /// Reconstructs a handle from its raw value, if nonzero.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// The raw value stored in the slot word.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for SockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.0.get();
        write!(f, "{}:{:08x}", raw >> 32, raw & 0xffff_ffff)
    }
}

/// Descriptor of one received frame.
///
/// `addr` is the byte offset of the frame's buffer inside its queue slot's
/// arena; `len` is the payload length; `rx_queue` is the hardware-assigned
/// receive queue the frame arrived on. The descriptor is the unit that moves
/// through rings — whoever holds it owns the underlying buffer exclusively.
#[derive(crate::ShmSafe, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RxDesc {
    /// Byte offset of the frame buffer in the arena.
    pub addr: u64,
    /// Payload length in bytes.
    pub len: u32,
    /// Receive queue the frame arrived on.
    pub rx_queue: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_roundtrips_raw_value() {
        let handle = SockHandle::generate();
        assert_eq!(SockHandle::from_raw(handle.raw()), Some(handle));
        assert_eq!(SockHandle::from_raw(0), None);
    }

    #[test]
    fn generated_handles_differ() {
        let a = SockHandle::generate();
        let b = SockHandle::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn handle_display_splits_pid_and_nonce() {
        let handle = SockHandle::from_raw(0x0000_1234_0000_00ff).unwrap();
        assert_eq!(handle.to_string(), "4660:000000ff");
    }

    #[test]
    fn queue_id_conversions() {
        let q = QueueId::new(7);
        assert_eq!(q.raw(), 7);
        assert_eq!(q.index(), 7);
        assert_eq!(QueueId::from(7u32), q);
    }
}
