extern crate core_affinity;
extern crate env_logger;
extern crate rand;
extern crate rs_lockfree_kit;

use rand::Rng;
use rs_lockfree_kit::mpmc_ring::MpmcRing;
use rs_lockfree_kit::spsc_ring::SpscRing;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const PRODUCER_COUNT: usize = 4;
const CONSUMER_COUNT: usize = 4;
const LOOP_CNT: usize = 100_000;

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

#[test]
fn test_spsc_threads() {
    init_logger();
    let (mut tx, mut rx) = SpscRing::new(16).unwrap().split();
    let producer = thread::spawn(move || {
        set_cpu_affinity(0);
        let mut rng = rand::thread_rng();
        for i in 0..LOOP_CNT as u64 {
            let mut v = i;
            while let Err(back) = tx.push(v) {
                v = back;
                thread::yield_now();
            }
            if rng.gen_range(0..64) == 0 {
                thread::yield_now();
            }
        }
    });
    set_cpu_affinity(1);
    let mut expected = 0u64;
    while expected < LOOP_CNT as u64 {
        match rx.pop() {
            Some(v) => {
                assert_eq!(v, expected);
                expected += 1;
            }
            None => thread::yield_now(),
        }
    }
    producer.join().unwrap();
    assert!(rx.is_empty());
}

#[test]
fn test_mpmc_threads() {
    init_logger();
    let ring = Arc::new(MpmcRing::new(64).unwrap());
    let consumed = Arc::new(AtomicUsize::new(0));
    let total = PRODUCER_COUNT * LOOP_CNT;

    let mut producers = vec![];
    for p in 0..PRODUCER_COUNT {
        let ring = ring.clone();
        producers.push(thread::spawn(move || {
            set_cpu_affinity(p);
            for seq in 0..LOOP_CNT {
                let mut v = (p, seq);
                while let Err(back) = ring.push(v) {
                    v = back;
                    thread::yield_now();
                }
            }
        }));
    }

    let mut consumers = vec![];
    for c in 0..CONSUMER_COUNT {
        let ring = ring.clone();
        let consumed = consumed.clone();
        consumers.push(thread::spawn(move || {
            set_cpu_affinity(PRODUCER_COUNT + c);
            let mut seen = vec![0usize; PRODUCER_COUNT];
            let mut last = vec![None::<usize>; PRODUCER_COUNT];
            while consumed.load(Ordering::Acquire) < total {
                match ring.pop() {
                    Some((p, seq)) => {
                        if let Some(prev) = last[p] {
                            assert!(seq > prev, "producer {} seq {} after {}", p, seq, prev);
                        }
                        last[p] = Some(seq);
                        seen[p] += 1;
                        consumed.fetch_add(1, Ordering::AcqRel);
                    }
                    None => thread::yield_now(),
                }
            }
            seen
        }));
    }

    for t in producers {
        t.join().unwrap();
    }
    let mut per_producer = vec![0usize; PRODUCER_COUNT];
    for t in consumers {
        for (p, n) in t.join().unwrap().into_iter().enumerate() {
            per_producer[p] += n;
        }
    }
    assert!(per_producer.iter().all(|n| *n == LOOP_CNT));
    assert!(ring.is_empty());
    assert_eq!(ring.pop(), None);
}

#[test]
fn test_mpmc_len_in_bounds_under_contention() {
    init_logger();
    let ring = Arc::new(MpmcRing::new(8).unwrap());
    let mut threads = vec![];
    for _ in 0..4 {
        let ring = ring.clone();
        threads.push(thread::spawn(move || {
            for i in 0..20_000u32 {
                let _ = ring.push(i);
                ring.pop();
                assert!(ring.len() <= ring.capacity());
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    while ring.pop().is_some() {}
    assert_eq!(ring.len(), 0);
}
