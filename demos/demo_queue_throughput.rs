extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_lockfree_kit;

use rs_lockfree_kit::lockfree_queue::LockFreeQueue;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const LOOP_CNT: i64 = 2_000_000;
const FLUSH_EVERY: i64 = 1024;

struct GlobalControl {
    queue: LockFreeQueue<i64>,
    producer_cnt: AtomicUsize,
    produced: AtomicI64,
    consumed: AtomicI64,
    tol_val: AtomicI64,
}

fn set_cpu_affinity(idx: usize) {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[idx % cpus.len()]);
            info!("set_cpu_affinity {} {}", idx, idx % cpus.len());
        }
    }
}

fn consumer_thread(idx: usize, control: &GlobalControl) {
    set_cpu_affinity(idx);
    let mut drained = false;
    let mut tol = 0;
    let mut tol_val = 0;
    loop {
        if let Some(v) = control.queue.dequeue() {
            tol_val += v;
            tol += 1;
            if tol % FLUSH_EVERY == 0 {
                control.consumed.fetch_add(tol, Ordering::Relaxed);
                control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
                tol = 0;
                tol_val = 0;
            }
            drained = false;
        } else if control.producer_cnt.load(Ordering::Acquire) == 0 {
            // one more empty pass after the last producer left
            if drained {
                break;
            }
            drained = true;
        }
    }
    control.consumed.fetch_add(tol, Ordering::Relaxed);
    control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
}

fn producer_thread(idx: usize, control: &GlobalControl) {
    set_cpu_affinity(idx);
    let mut tol = 0;
    for i in 0..LOOP_CNT {
        control.queue.enqueue(i);
        tol += 1;
        if i % FLUSH_EVERY == 0 {
            control.produced.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    control.produced.fetch_add(tol, Ordering::Relaxed);
    control.producer_cnt.fetch_sub(1, Ordering::AcqRel);
}

fn debug_thread(control: &GlobalControl) {
    while control.producer_cnt.load(Ordering::Acquire) != 0 {
        info!(
            "debug_thread produced {} consumed {} pending {}",
            control.produced.load(Ordering::Relaxed),
            control.consumed.load(Ordering::Relaxed),
            control.queue.domain().pending_count()
        );
        thread::sleep(Duration::from_millis(1000));
    }
}

fn main() {
    env_logger::init();

    let cpu_count = core_affinity::get_core_ids()
        .map_or(4, |c| c.len())
        .clamp(2, 32);
    let producer_count = (cpu_count + 1) / 2;
    let consumer_count = cpu_count - producer_count;
    info!(
        "producer_count {} consumer_count {}",
        producer_count, consumer_count
    );

    let control = Arc::new(GlobalControl {
        queue: LockFreeQueue::new(),
        producer_cnt: AtomicUsize::new(producer_count),
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
        tol_val: AtomicI64::new(0),
    });

    let start = Instant::now();
    let watch_thread = {
        let control = control.clone();
        thread::spawn(move || debug_thread(&control))
    };
    let mut producer_threads = vec![];
    for i in 0..producer_count {
        let control = control.clone();
        producer_threads.push(thread::spawn(move || producer_thread(i, &control)));
    }
    let mut consumer_threads = vec![];
    for i in 0..consumer_count {
        let control = control.clone();
        consumer_threads.push(thread::spawn(move || {
            consumer_thread(producer_count + i, &control)
        }));
    }

    for t in producer_threads {
        t.join().unwrap();
    }
    info!("producer_threads joined");
    for t in consumer_threads {
        t.join().unwrap();
    }
    info!("consumer_threads joined");
    watch_thread.join().unwrap();

    let produced = control.produced.load(Ordering::Relaxed);
    let consumed = control.consumed.load(Ordering::Relaxed);
    info!("produced {} consumed {}", produced, consumed);
    assert_eq!(produced, consumed);
    assert_eq!(
        control.tol_val.load(Ordering::Relaxed),
        producer_count as i64 * (LOOP_CNT - 1) * LOOP_CNT / 2
    );
    let domain = control.queue.domain();
    info!(
        "reclaimed {} pending {}",
        domain.reclaimed_count(),
        domain.pending_count()
    );
    println!("time cost {} ms", start.elapsed().as_millis());
}
