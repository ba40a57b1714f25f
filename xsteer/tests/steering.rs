//! End-to-end steering tests.
//!
//! These drive the full path: control plane creates and pins the map, a
//! consumer opens a socket and gets its handle bound, the receive side
//! attaches per queue and delivers frames, outcomes and payloads are
//! observed on the drain side.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=xsteer=trace cargo test --features tracing -- --nocapture
//! ```

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use rustix::{io, shm};

use xsteer::map::{DispatchMap, MapError};
use xsteer::redirect::{TransferError, Verdict};
use xsteer::rx::{Disposition, RxQueue};
use xsteer::shmem::{Creator, Opener, ShmError, ShmPath};
use xsteer::socket::RxSocket;
use xsteer::types::QueueId;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        xsteer::init_tracing();
    });
}

/// Creates a fresh pinned map, or `None` when the environment forbids
/// shared memory (sandboxed runners).
fn create_map<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>(
    name: &str,
) -> Option<DispatchMap<Creator, N, DEPTH, FRAMES, FRAME_SIZE>> {
    init_test_tracing();
    let path = ShmPath::new(name).unwrap();
    let _ = shm::unlink(path.as_str());
    match DispatchMap::create(path) {
        Ok(map) => Some(map),
        Err(MapError::Shm(ShmError::Posix { source, .. })) if source == io::Errno::ACCESS => {
            eprintln!("Skipping: shared memory not permitted here");
            None
        }
        Err(err) => panic!("map creation failed: {err}"),
    }
}

fn open_map<const N: usize, const DEPTH: usize, const FRAMES: usize, const FRAME_SIZE: usize>(
    path: &ShmPath,
) -> DispatchMap<Opener, N, DEPTH, FRAMES, FRAME_SIZE> {
    DispatchMap::open(path.clone()).expect("open map")
}

#[test]
fn scenario_bind_redirect_unbind() {
    // The reference configuration: 64 queues (small rings keep it light).
    const N: usize = 64;
    let Some(map) = create_map::<N, 8, 8, 64>("/xsteer-it-scenario") else {
        return;
    };
    let path = map.path().clone();

    let mut socket =
        RxSocket::open(open_map::<N, 8, 8, 64>(&path), QueueId::new(3)).expect("open socket");
    map.bind(QueueId::new(3), socket.handle()).expect("bind");
    assert_eq!(map.lookup(QueueId::new(3)), Some(socket.handle()));

    // Frame arrives on queue 3 → handled, delivered to the bound socket.
    let mut rxq3 =
        RxQueue::attach(open_map::<N, 8, 8, 64>(&path), QueueId::new(3)).expect("attach q3");
    let frame = rxq3.grab().expect("free frame").write(b"frame-on-queue-3");
    match rxq3.deliver(frame) {
        Disposition::Redirected => {}
        other => panic!("expected Redirected, got {:?}", other.verdict()),
    }

    let view = socket.recv().expect("redirected frame");
    assert_eq!(&view[..], b"frame-on-queue-3");
    assert_eq!(view.rx_queue(), QueueId::new(3));
    drop(view);

    // Frame arrives on queue 5 (unbound) → not handled.
    let mut rxq5 =
        RxQueue::attach(open_map::<N, 8, 8, 64>(&path), QueueId::new(5)).expect("attach q5");
    let frame = rxq5.grab().expect("free frame").write(b"frame-on-queue-5");
    match rxq5.deliver(frame) {
        Disposition::Pass(frame) => rxq5.release(frame),
        other => panic!("expected Pass, got {:?}", other.verdict()),
    }

    // Unbind queue 3 → subsequent frames are not handled.
    map.unbind(QueueId::new(3)).expect("unbind");
    let frame = rxq3.grab().expect("free frame").write(b"after-unbind");
    match rxq3.deliver(frame) {
        Disposition::Pass(frame) => rxq3.release(frame),
        other => panic!("expected Pass, got {:?}", other.verdict()),
    }
    assert!(socket.recv().is_none());
}

#[test]
fn unbound_queue_always_passes() {
    let Some(map) = create_map::<4, 4, 4, 64>("/xsteer-it-pass") else {
        return;
    };
    let mut rxq = RxQueue::attach(open_map::<4, 4, 4, 64>(map.path()), QueueId::new(1))
        .expect("attach");

    for payload in [&b"a"[..], &b"anything-else"[..], &[0u8; 64][..]] {
        let frame = rxq.grab().expect("free frame").write(payload);
        match rxq.deliver(frame) {
            Disposition::Pass(frame) => rxq.release(frame),
            other => panic!("expected Pass, got {:?}", other.verdict()),
        }
    }
}

#[test]
fn full_ring_surfaces_transfer_failure() {
    // RX ring of depth 2, so the third undrained frame cannot be handed off.
    let Some(map) = create_map::<1, 2, 8, 64>("/xsteer-it-ringfull") else {
        return;
    };
    let path = map.path().clone();
    let queue = QueueId::new(0);

    let mut socket = RxSocket::open(open_map::<1, 2, 8, 64>(&path), queue).expect("open socket");
    map.bind(queue, socket.handle()).expect("bind");

    let mut rxq = RxQueue::attach(open_map::<1, 2, 8, 64>(&path), queue).expect("attach");

    for i in 0..2u8 {
        let frame = rxq.grab().expect("free frame").write(&[i]);
        assert!(matches!(rxq.deliver(frame), Disposition::Redirected));
    }

    // Pre-filled to capacity: the hand-off fails, the frame is neither
    // retried nor delivered to normal processing.
    let frame = rxq.grab().expect("free frame").write(b"overflow");
    match rxq.deliver(frame) {
        Disposition::Failed(error) => {
            assert_eq!(error, TransferError::RingFull);
            assert_eq!(
                Disposition::Failed(error).verdict(),
                Verdict::Failed(TransferError::RingFull)
            );
        }
        other => panic!("expected Failed, got {:?}", other.verdict()),
    }

    // Exactly the two delivered frames are drainable.
    assert_eq!(&socket.recv().expect("first")[..], &[0]);
    assert_eq!(&socket.recv().expect("second")[..], &[1]);
    assert!(socket.recv().is_none());

    // The failed frame was recycled locally: delivery works again.
    let frame = rxq.grab().expect("recycled frame").write(b"retry-after-drain");
    assert!(matches!(rxq.deliver(frame), Disposition::Redirected));
    assert_eq!(&socket.recv().expect("third")[..], b"retry-after-drain");
}

#[test]
fn transfer_targets_exactly_the_bound_socket() {
    let Some(map) = create_map::<2, 4, 4, 64>("/xsteer-it-target") else {
        return;
    };
    let path = map.path().clone();

    let mut sock0 = RxSocket::open(open_map::<2, 4, 4, 64>(&path), QueueId::new(0))
        .expect("open socket 0");
    let mut sock1 = RxSocket::open(open_map::<2, 4, 4, 64>(&path), QueueId::new(1))
        .expect("open socket 1");
    map.bind(QueueId::new(0), sock0.handle()).expect("bind 0");
    map.bind(QueueId::new(1), sock1.handle()).expect("bind 1");

    let mut rxq0 =
        RxQueue::attach(open_map::<2, 4, 4, 64>(&path), QueueId::new(0)).expect("attach q0");
    let frame = rxq0.grab().expect("free frame").write(b"to-socket-0");
    assert!(matches!(rxq0.deliver(frame), Disposition::Redirected));

    assert_eq!(&sock0.recv().expect("frame")[..], b"to-socket-0");
    assert!(sock1.recv().is_none());
}

#[test]
fn disjoint_queues_do_not_interfere() {
    let Some(map) = create_map::<4, 4, 4, 64>("/xsteer-it-disjoint") else {
        return;
    };
    let path = map.path().clone();

    let socket = RxSocket::open(open_map::<4, 4, 4, 64>(&path), QueueId::new(2))
        .expect("open socket");
    let pinned = socket.handle();
    map.bind(QueueId::new(2), pinned).expect("bind");

    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        // Writer hammers queue 1 with bind/unbind through its own handle.
        let churn_map = open_map::<4, 4, 4, 64>(&path);
        let churn_socket =
            RxSocket::open(open_map::<4, 4, 4, 64>(&path), QueueId::new(1)).expect("open churn");
        let stop_ref = &stop;
        s.spawn(move || {
            while !stop_ref.load(Ordering::Relaxed) {
                churn_map
                    .bind(QueueId::new(1), churn_socket.handle())
                    .expect("bind churn");
                churn_map.unbind(QueueId::new(1)).expect("unbind churn");
            }
        });

        // Reader observes queue 2 unchanged throughout.
        let reader_map = open_map::<4, 4, 4, 64>(&path);
        for _ in 0..100_000 {
            assert_eq!(reader_map.lookup(QueueId::new(2)), Some(pinned));
        }
        stop.store(true, Ordering::Relaxed);
    });
}

#[test]
fn claim_exclusivity_per_role() {
    let Some(map) = create_map::<2, 4, 4, 64>("/xsteer-it-claims") else {
        return;
    };
    let path = map.path().clone();
    let queue = QueueId::new(0);

    let rxq = RxQueue::attach(open_map::<2, 4, 4, 64>(&path), queue).expect("first receiver");
    match RxQueue::attach(open_map::<2, 4, 4, 64>(&path), queue) {
        Err(MapError::QueueBusy { queue: 0, .. }) => {}
        Err(other) => panic!("expected QueueBusy, got {other}"),
        Ok(_) => panic!("expected QueueBusy, got a second receiver"),
    }

    let socket = RxSocket::open(open_map::<2, 4, 4, 64>(&path), queue).expect("first drainer");
    match RxSocket::open(open_map::<2, 4, 4, 64>(&path), queue) {
        Err(MapError::QueueBusy { queue: 0, .. }) => {}
        Err(other) => panic!("expected QueueBusy, got {other}"),
        Ok(_) => panic!("expected QueueBusy, got a second drainer"),
    }

    // The two roles never exclude each other.
    drop(rxq);
    drop(socket);
    let _rxq = RxQueue::attach(open_map::<2, 4, 4, 64>(&path), queue).expect("reattach");
    let _socket = RxSocket::open(open_map::<2, 4, 4, 64>(&path), queue).expect("reopen");
}

#[test]
fn frames_recycle_through_fill_ring() {
    // 4 frames in the arena, 20 deliveries: only recycling makes this work.
    let Some(map) = create_map::<1, 4, 4, 64>("/xsteer-it-recycle") else {
        return;
    };
    let path = map.path().clone();
    let queue = QueueId::new(0);

    let mut socket = RxSocket::open(open_map::<1, 4, 4, 64>(&path), queue).expect("open socket");
    map.bind(queue, socket.handle()).expect("bind");
    let mut rxq = RxQueue::attach(open_map::<1, 4, 4, 64>(&path), queue).expect("attach");

    for i in 0..20u32 {
        let payload = i.to_le_bytes();
        let frame = rxq.grab().expect("free frame").write(&payload);
        assert!(matches!(rxq.deliver(frame), Disposition::Redirected));

        let view = socket.recv().expect("frame");
        assert_eq!(&view[..], &payload);
        // Dropping the view recycles the frame into the fill ring.
    }
}

#[test]
fn stale_descriptors_recycled_on_socket_reopen() {
    let Some(map) = create_map::<1, 4, 4, 64>("/xsteer-it-stale") else {
        return;
    };
    let path = map.path().clone();
    let queue = QueueId::new(0);

    let first = RxSocket::open(open_map::<1, 4, 4, 64>(&path), queue).expect("first socket");
    map.bind(queue, first.handle()).expect("bind");
    let mut rxq = RxQueue::attach(open_map::<1, 4, 4, 64>(&path), queue).expect("attach");

    // Two frames redirected but never drained by the first consumer.
    for i in 0..2u8 {
        let frame = rxq.grab().expect("free frame").write(&[i]);
        assert!(matches!(rxq.deliver(frame), Disposition::Redirected));
    }
    drop(first);

    // The successor must not see its predecessor's frames...
    let mut second = RxSocket::open(open_map::<1, 4, 4, 64>(&path), queue).expect("second socket");
    assert!(second.recv().is_none());

    // ...and the full frame budget is back in circulation.
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(rxq.grab().expect("frame budget intact").commit(0));
    }
    assert!(rxq.grab().is_none());
    for frame in held {
        rxq.release(frame);
    }
}

#[test]
fn bindings_survive_hook_and_socket_restarts() {
    let Some(map) = create_map::<4, 4, 4, 64>("/xsteer-it-pinned") else {
        return;
    };
    let path = map.path().clone();
    let queue = QueueId::new(3);

    let socket = RxSocket::open(open_map::<4, 4, 4, 64>(&path), queue).expect("open socket");
    map.bind(queue, socket.handle()).expect("bind");
    let bound = socket.handle();

    // Receive hook detaches and re-attaches: the binding is still there.
    {
        let rxq = RxQueue::attach(open_map::<4, 4, 4, 64>(&path), queue).expect("attach");
        drop(rxq);
    }
    let rxq = RxQueue::attach(open_map::<4, 4, 4, 64>(&path), queue).expect("re-attach");
    assert_eq!(rxq.map().lookup(queue), Some(bound));

    // A control plane reopening the name sees the same contents.
    let reopened = open_map::<4, 4, 4, 64>(&path);
    assert_eq!(reopened.lookup(queue), Some(bound));
}
