extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_lockfree_kit;

use rs_lockfree_kit::hazard_domain::{HazardConfig, HazardDomain};
use rs_lockfree_kit::lockfree_stack::LockFreeStack;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const THREAD_COUNT: usize = 4;
const LOOP_CNT: usize = 50_000;

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
fn test_push_pop_threads() {
    init_logger();
    let domain = Arc::new(
        HazardDomain::new(HazardConfig::default().max_threads(THREAD_COUNT + 1)).unwrap(),
    );
    let stack = Arc::new(LockFreeStack::with_domain(domain.clone()));

    // every thread pushes its own range and pops whatever it finds on top
    let mut threads = vec![];
    for idx in 0..THREAD_COUNT {
        let stack = stack.clone();
        threads.push(thread::spawn(move || {
            set_cpu_affinity(idx);
            stack.domain().attach_current_thread().unwrap();
            let mut got = Vec::with_capacity(LOOP_CNT);
            for i in 0..LOOP_CNT {
                stack.push(idx * LOOP_CNT + i);
                if i % 2 == 1 {
                    got.extend(stack.pop());
                }
            }
            got
        }));
    }

    let mut all = vec![];
    for t in threads {
        all.extend(t.join().unwrap());
    }
    info!("popped {} values while pushing", all.len());
    while let Some(v) = stack.pop() {
        all.push(v);
    }

    let total = THREAD_COUNT * LOOP_CNT;
    assert_eq!(all.len(), total);
    all.sort_unstable();
    for (expected, v) in all.iter().enumerate() {
        assert_eq!(*v, expected);
    }
    assert!(stack.is_empty());

    domain.reclaim_all();
    assert_eq!(domain.pending_count(), 0);
    assert_eq!(domain.reclaimed_count(), total);
}

#[test]
fn test_values_dropped_once() {
    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    init_logger();
    let drops = Arc::new(AtomicUsize::new(0));
    let stack = Arc::new(LockFreeStack::new());
    let mut threads = vec![];
    for _ in 0..THREAD_COUNT {
        let stack = stack.clone();
        let drops = drops.clone();
        threads.push(thread::spawn(move || {
            for _ in 0..1_000 {
                stack.push(Counted(drops.clone()));
            }
            for _ in 0..500 {
                drop(stack.pop());
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    assert!(drops.load(Ordering::Relaxed) <= THREAD_COUNT * 500);
    drop(stack);
    assert_eq!(drops.load(Ordering::Relaxed), THREAD_COUNT * 1_000);
}
