extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_lockfree_kit;

use rs_lockfree_kit::hazard_domain::{HazardConfig, HazardDomain};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct TestObj {
    cnt: Arc<AtomicI64>,
    data: Option<i32>,
}

impl Drop for TestObj {
    fn drop(&mut self) {
        self.data.take().unwrap();
        self.cnt.fetch_sub(1, Ordering::Relaxed);
    }
}

impl TestObj {
    fn new(cnt: &Arc<AtomicI64>) -> TestObj {
        cnt.fetch_add(1, Ordering::Relaxed);
        TestObj {
            cnt: cnt.clone(),
            data: Some(0),
        }
    }
}

struct GlobalConf {
    stop: AtomicBool,
    cnt: Arc<AtomicI64>,
    read_loops: usize,
    write_loops: usize,
    v: AtomicPtr<TestObj>,
    h: HazardDomain,
}

fn set_cpu_affinity(idx: usize) {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[idx % cpus.len()]);
        }
    }
}

fn read_thread_func(idx: usize, conf: &GlobalConf) {
    set_cpu_affinity(idx);
    let handle = conf.h.register_thread().unwrap();
    for _ in 0..conf.read_loops {
        let v = handle.protect_load(0, &conf.v);
        assert_eq!(unsafe { (*v).data }, Some(0));
        handle.clear(0);
    }
}

fn write_thread_func(idx: usize, conf: &GlobalConf) {
    set_cpu_affinity(idx);
    let handle = conf.h.register_thread().unwrap();
    for _ in 0..conf.write_loops {
        let v = Box::into_raw(Box::new(TestObj::new(&conf.cnt)));
        let old = conf.v.swap(v, Ordering::AcqRel);
        unsafe { handle.retire_box(old) };
    }
}

fn watch_thread_func(conf: &GlobalConf) {
    while !conf.stop.load(Ordering::Acquire) {
        info!(
            "live objects {}, pending {}, reclaimed {}",
            conf.cnt.load(Ordering::Relaxed),
            conf.h.pending_count(),
            conf.h.reclaimed_count()
        );
        thread::sleep(Duration::from_millis(500));
    }
}

fn main() {
    env_logger::init();

    let cpu_count = core_affinity::get_core_ids()
        .map_or(4, |c| c.len())
        .clamp(2, 32);
    let read_count = (cpu_count + 1) / 2;
    let write_count = (cpu_count + 1) / 2;
    info!("read_count {} write_count {}", read_count, write_count);

    let cnt = Arc::new(AtomicI64::new(0));
    let first = Box::into_raw(Box::new(TestObj::new(&cnt)));
    let conf = Arc::new(GlobalConf {
        stop: AtomicBool::new(false),
        cnt: cnt.clone(),
        read_loops: 10_000_000,
        write_loops: 2_000_000,
        v: AtomicPtr::new(first),
        h: HazardDomain::new(
            HazardConfig::default()
                .max_threads(read_count + write_count + 1)
                .hazards_per_thread(1),
        )
        .unwrap(),
    });

    let start = Instant::now();
    let watch = {
        let conf = conf.clone();
        thread::spawn(move || watch_thread_func(&conf))
    };
    let mut threads = vec![];
    for i in 0..read_count {
        let conf = conf.clone();
        threads.push(thread::spawn(move || read_thread_func(i, &conf)));
    }
    for i in 0..write_count {
        let conf = conf.clone();
        threads.push(thread::spawn(move || write_thread_func(read_count + i, &conf)));
    }
    for t in threads {
        t.join().unwrap();
    }
    conf.stop.store(true, Ordering::Release);
    watch.join().unwrap();

    conf.h.reclaim_all();
    info!(
        "done, live objects {}, reclaimed {}",
        cnt.load(Ordering::Relaxed),
        conf.h.reclaimed_count()
    );
    assert_eq!(cnt.load(Ordering::Relaxed), 1);
    unsafe { drop(Box::from_raw(conf.v.load(Ordering::Acquire))) };
    println!("time cost {} ms", start.elapsed().as_millis());
}
