//! Queue→socket steering throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin steer_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin the receive side to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin the drain side to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;

use minstant::Instant;

use xsteer::map::DispatchMap;
use xsteer::rx::{Disposition, RxQueue};
use xsteer::shmem::{Creator, Opener, ShmPath};
use xsteer::socket::RxSocket;
use xsteer::types::QueueId;

/// Single-queue map with deep rings and small frames.
const QUEUES: usize = 1;
const DEPTH: usize = 2048;
const FRAMES: usize = 2048;
const FRAME_SIZE: usize = 256;

type BenchMap<Mode> = DispatchMap<Mode, QUEUES, DEPTH, FRAMES, FRAME_SIZE>;
type BenchRxQueue = RxQueue<QUEUES, DEPTH, FRAMES, FRAME_SIZE>;
type BenchSocket = RxSocket<QUEUES, DEPTH, FRAMES, FRAME_SIZE>;

const ITERATIONS: usize = 1 << 22;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn unique_path(tag: &str) -> ShmPath {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let path = format!(
        "/steer-bench-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    ShmPath::new(path).expect("generated path is valid")
}

fn bench_steering(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let path = unique_path("throughput");
    let map = match BenchMap::<Creator>::create(path.clone()) {
        Ok(map) => map,
        Err(err) => {
            eprintln!("steer_bench: cannot create shared memory ({err}), skipping");
            return;
        }
    };

    let queue = QueueId::new(0);
    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();
    let (handle_tx, handle_rx) = mpsc::channel();
    let consumer_path = path.clone();

    // Drain thread
    let consumer_thread = std::thread::spawn(move || {
        let map = BenchMap::<Opener>::open(consumer_path).expect("open map");
        let mut socket = BenchSocket::open(map, queue).expect("open socket");
        handle_tx.send(socket.handle()).expect("send handle");
        pin_to_cpu(consumer_cpu);

        // Signal ready
        ready_clone.store(true, Ordering::Release);

        for expected in 0..ITERATIONS as u64 {
            loop {
                if let Some(view) = socket.recv() {
                    let got = u64::from_le_bytes(view[..8].try_into().unwrap());
                    if got != expected {
                        panic!("Data corruption: expected {expected}, got {got}");
                    }
                    break;
                }
                hint::spin_loop();
            }
        }
    });

    let handle = handle_rx.recv().expect("receive handle");
    map.bind(queue, handle).expect("bind queue");

    let rx_map = BenchMap::<Opener>::open(path).expect("open map");
    let mut rxq = BenchRxQueue::attach(rx_map, queue).expect("attach receive side");

    // Wait for the drain side
    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    pin_to_cpu(producer_cpu);

    let start = Instant::now();

    for i in 0..ITERATIONS as u64 {
        loop {
            let Some(mut buf) = rxq.grab() else {
                hint::spin_loop();
                continue;
            };
            buf.bytes_mut()[..8].copy_from_slice(&i.to_le_bytes());
            let frame = buf.commit(8);
            match rxq.deliver(frame) {
                Disposition::Redirected => break,
                Disposition::Failed(_) => hint::spin_loop(),
                Disposition::Pass(frame) => {
                    rxq.release(frame);
                    panic!("queue came unbound mid-bench");
                }
            }
        }
    }

    consumer_thread.join().expect("drain thread");
    let elapsed = start.elapsed();

    let rate = ITERATIONS as f64 / elapsed.as_secs_f64();
    println!(
        "steering throughput: {} frames in {:?} ({:.2} M frames/s)",
        ITERATIONS,
        elapsed,
        rate / 1e6
    );
}

fn main() {
    xsteer::init_tracing();

    let (producer_cpu, consumer_cpu) = get_cpu_affinity();
    println!("producer CPU: {producer_cpu:?}, consumer CPU: {consumer_cpu:?}");

    bench_steering(producer_cpu, consumer_cpu);
}
