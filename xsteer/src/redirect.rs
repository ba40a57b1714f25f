//! The per-frame redirect decision.
//!
//! Runs once per received frame, inside the hosting receive context:
//! extract the frame's hardware queue index, consult the dispatch map, and
//! either move the descriptor into the bound socket's RX ring or report that
//! the frame was not handled. Constant-time, allocation-free, and
//! non-blocking — the routine is a pure function of the map contents and the
//! descriptor at the instant of the lookup, with no retries and no fallback:
//! a full ring is the invocation's result, and sizing/draining that ring is
//! the consumer's problem, not this path's.

use thiserror::Error;

use crate::map::MapState;
use crate::trace::trace;
use crate::types::RxDesc;

/// Why a zero-copy hand-off to a bound socket failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The socket's RX ring had no free slot.
    #[error("ingress ring full")]
    RingFull,
}

impl TransferError {
    /// Stable numeric code surfaced on the trace channel.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::RingFull => -105, // -ENOBUFS
        }
    }
}

/// Outcome of one redirect decision, as seen by the hosting receive context.
///
/// `Redirected` and `Failed` both mean "handled — stop processing this
/// frame"; only `Pass` tells the host to continue its normal receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Frame ownership moved into the bound socket's RX ring.
    Redirected,
    /// A socket was bound but the hand-off failed; the error is the result
    /// of the whole invocation. The frame is not retried and not delivered
    /// to normal processing.
    Failed(TransferError),
    /// No socket bound to the frame's queue; the host proceeds with normal
    /// receive processing.
    Pass,
}

/// Internal outcome carrying descriptor ownership back to the caller where
/// the frame was not consumed.
pub(crate) enum SteerOutcome {
    Redirected,
    Failed { desc: RxDesc, error: TransferError },
    Pass(RxDesc),
}

/// Decides one frame.
///
/// Reads `desc.rx_queue`, looks up the slot, and on a hit pushes the
/// descriptor onto that slot's RX ring — exactly the bound slot's ring,
/// never another. An index outside the map (impossible from conforming
/// hardware metadata) is treated as an unmanaged queue.
///
/// # Safety
///
/// The caller holds the receive-side role for `desc.rx_queue`'s slot: no
/// other push to that slot's RX ring may be in flight. The hosting receive
/// context provides this — hardware delivers a given queue's frames to one
/// context, one at a time.
#[inline]
pub(crate) unsafe fn steer<
    const N: usize,
    const DEPTH: usize,
    const FRAMES: usize,
    const FRAME_SIZE: usize,
>(
    state: &MapState<N, DEPTH, FRAMES, FRAME_SIZE>,
    desc: RxDesc,
) -> SteerOutcome {
    let queue = desc.rx_queue;

    let Some(slot) = state.slot(queue as usize) else {
        trace!(queue, "pass: queue outside map capacity");
        return SteerOutcome::Pass(desc);
    };

    match slot.sock() {
        Some(sock) => {
            // SAFETY: forwarded — the caller holds this slot's receive role.
            match unsafe { slot.rx_ring().push(desc) } {
                Ok(()) => {
                    trace!(queue, ret = 0, sock = sock.raw(), "redirect");
                    SteerOutcome::Redirected
                }
                Err(desc) => {
                    let error = TransferError::RingFull;
                    trace!(queue, ret = error.code(), sock = sock.raw(), "redirect failed");
                    SteerOutcome::Failed { desc, error }
                }
            }
        }
        None => {
            trace!(queue, "pass: no socket");
            SteerOutcome::Pass(desc)
        }
    }
}
