extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_lockfree_kit;

use rs_lockfree_kit::hazard_domain::{HazardConfig, HazardDomain};
use rs_lockfree_kit::lockfree_queue::LockFreeQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const PRODUCER_COUNT: usize = 4;
const CONSUMER_COUNT: usize = 4;
const LOOP_CNT: usize = 100_000;
const TOTAL: usize = PRODUCER_COUNT * LOOP_CNT;

struct GlobalControl {
    queue: LockFreeQueue<usize>,
    consumed: AtomicUsize,
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn set_cpu_affinity(idx: usize) {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[idx % cpus.len()]);
        }
    }
}

fn encode(producer: usize, seq: usize) -> usize {
    producer * LOOP_CNT + seq
}

fn producer_thread(producer: usize, control: &GlobalControl) {
    set_cpu_affinity(producer);
    for seq in 0..LOOP_CNT {
        control.queue.enqueue(encode(producer, seq));
    }
}

fn consumer_thread(idx: usize, control: &GlobalControl) -> Vec<usize> {
    set_cpu_affinity(PRODUCER_COUNT + idx);
    let mut got = Vec::with_capacity(TOTAL / CONSUMER_COUNT);
    let mut last_seen = [None::<usize>; PRODUCER_COUNT];
    while control.consumed.load(Ordering::Acquire) < TOTAL {
        match control.queue.dequeue() {
            Some(v) => {
                let (producer, seq) = (v / LOOP_CNT, v % LOOP_CNT);
                // values of one producer leave in the order they entered
                if let Some(prev) = last_seen[producer] {
                    assert!(seq > prev, "producer {} seq {} after {}", producer, seq, prev);
                }
                last_seen[producer] = Some(seq);
                got.push(v);
                control.consumed.fetch_add(1, Ordering::AcqRel);
            }
            None => thread::yield_now(),
        }
    }
    got
}

#[test]
fn test_multi_threads() {
    init_logger();
    let control = Arc::new(GlobalControl {
        queue: LockFreeQueue::new(),
        consumed: AtomicUsize::new(0),
    });

    let mut producers = vec![];
    for p in 0..PRODUCER_COUNT {
        let control = control.clone();
        producers.push(thread::spawn(move || producer_thread(p, &control)));
    }
    let mut consumers = vec![];
    for c in 0..CONSUMER_COUNT {
        let control = control.clone();
        consumers.push(thread::spawn(move || consumer_thread(c, &control)));
    }

    for t in producers {
        t.join().unwrap();
    }
    info!("producer threads joined");

    let mut all = Vec::with_capacity(TOTAL);
    for t in consumers {
        all.extend(t.join().unwrap());
    }
    info!("consumer threads joined");

    assert_eq!(all.len(), TOTAL);
    let expected_sum: usize = (0..TOTAL).sum();
    assert_eq!(all.iter().sum::<usize>(), expected_sum);
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), TOTAL);
    assert!(control.queue.dequeue().is_none());

    let domain = control.queue.domain();
    domain.reclaim_all();
    assert_eq!(domain.pending_count(), 0);
    assert_eq!(domain.reclaimed_count(), TOTAL);
}

#[test]
fn test_shared_domain_across_queues() {
    init_logger();
    let domain = Arc::new(HazardDomain::new(HazardConfig::default().max_threads(8)).unwrap());
    let a = Arc::new(LockFreeQueue::with_domain(domain.clone()).unwrap());
    let b = Arc::new(LockFreeQueue::with_domain(domain.clone()).unwrap());

    let mut threads = vec![];
    for i in 0..2u64 {
        let (from, to) = if i == 0 { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
        threads.push(thread::spawn(move || {
            from.domain().attach_current_thread().unwrap();
            for v in 0..10_000u64 {
                from.enqueue(v);
                if let Some(x) = to.dequeue() {
                    assert!(x < 10_000);
                }
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    let mut left = 0;
    while a.dequeue().is_some() {
        left += 1;
    }
    while b.dequeue().is_some() {
        left += 1;
    }
    assert!(left <= 20_000);
    assert!(domain.registered_count() <= 3);
    domain.reclaim_all();
    assert_eq!(domain.pending_count(), 0);
}
