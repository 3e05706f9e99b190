//! Definition and implementations of `HazardDomain`
//!
use crate::error::{Error, Result};
use crate::hazard_pointer::{drop_box, ThreadStore};
use crate::util::WrappedAlign64Type;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{self, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thread_local::ThreadLocal;

pub use crate::hazard_pointer::Deleter;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        pub const MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREAD_COUNT: usize = 256;
    } else {
        /// Maximum thread count
        pub const MAX_THREAD_COUNT: usize = 64;
    }
}

/// Maximum number of hazard pointers a single thread may publish at once.
pub const MAX_HAZARDS_PER_THREAD: usize = 4;

/// Construction parameters of a `HazardDomain`.
///
/// `max_threads` is the size of the fixed record table, `hazards_per_thread` the number of
/// pointers each record can publish, and `retire_threshold` the length a thread's retirement list
/// may reach before that thread scans. `None` derives the threshold from the table size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HazardConfig {
    pub max_threads: usize,
    pub hazards_per_thread: usize,
    pub retire_threshold: Option<usize>,
}

impl Default for HazardConfig {
    fn default() -> Self {
        HazardConfig {
            max_threads: MAX_THREAD_COUNT,
            hazards_per_thread: 2,
            retire_threshold: None,
        }
    }
}

impl HazardConfig {
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn hazards_per_thread(mut self, hazards_per_thread: usize) -> Self {
        self.hazards_per_thread = hazards_per_thread;
        self
    }

    pub fn retire_threshold(mut self, retire_threshold: usize) -> Self {
        self.retire_threshold = Some(retire_threshold);
        self
    }

    /// Twice the number of hazards the whole table can publish, unless set explicitly. A scan
    /// then frees at least half of the list it walks.
    pub fn effective_retire_threshold(&self) -> usize {
        self.retire_threshold
            .unwrap_or(2 * self.max_threads * self.hazards_per_thread)
    }

    fn validate(&self) -> Result<()> {
        if self.max_threads == 0 || self.max_threads > MAX_THREAD_COUNT {
            return Err(Error::InvalidParam("max_threads must be in 1..=MAX_THREAD_COUNT"));
        }
        if self.hazards_per_thread == 0 || self.hazards_per_thread > MAX_HAZARDS_PER_THREAD {
            return Err(Error::InvalidParam(
                "hazards_per_thread must be in 1..=MAX_HAZARDS_PER_THREAD",
            ));
        }
        if self.retire_threshold == Some(0) {
            return Err(Error::InvalidParam("retire_threshold must be positive"));
        }
        Ok(())
    }
}

/// The record table of a domain. Shared with the exit hooks of the threads that cached one of its
/// records, which release that record when their thread ends.
struct RecordTable {
    records: Box<[WrappedAlign64Type<ThreadStore>]>,
    registered_count: WrappedAlign64Type<AtomicUsize>,
}

impl RecordTable {
    fn claim(&self) -> Result<usize> {
        for (tid, record) in self.records.iter().enumerate() {
            if record.try_claim() {
                let registered = self.registered_count.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("claim hazard record, tid={}, registered={}", tid, registered);
                return Ok(tid);
            }
        }
        warn!("thread number overflow, max_threads={}", self.records.len());
        Err(Error::ThreadNumOverflow {
            max: self.records.len(),
        })
    }

    fn release(&self, tid: usize) {
        self.records[tid].release();
        let registered = self.registered_count.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!("release hazard record, tid={}, registered={}", tid, registered);
    }
}

static GLOBAL_THREAD_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Per-thread hook releasing the records the thread cached, in any domain still alive, when the
/// thread exits.
struct ThreadExit {
    serial: u64,
    attached: RefCell<Vec<(Weak<RecordTable>, usize)>>,
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        for (table, tid) in self.attached.get_mut().drain(..) {
            if let Some(table) = table.upgrade() {
                table.release(tid);
            }
        }
    }
}

thread_local! {
    static THREAD_EXIT: ThreadExit = ThreadExit {
        serial: GLOBAL_THREAD_SERIAL.fetch_add(1, Ordering::Relaxed),
        attached: RefCell::new(Vec::new()),
    };
}

/// Record cached for a thread. `thread_local` hands the slot of an exited thread to the next
/// thread given the same id, `serial` tells the two apart.
#[derive(Clone, Copy)]
struct CachedRecord {
    tid: usize,
    serial: u64,
}

/// A `Hazard Pointers` domain: a fixed table of per-thread hazard records plus per-thread
/// retirement lists.
///
/// A thread publishes a pointer with `SlotHandle::protect_load` before dereferencing it and
/// clears it afterwards. A node unlinked from a structure is handed to `SlotHandle::retire`,
/// and freed by a later scan that finds it in no record. Counters that many threads update are
/// aligned to 64 bytes because of
/// [`False sharing`](https://en.wikipedia.org/wiki/False_sharing).
///
/// Containers hold the domain in an `Arc`, several containers can share one.
pub struct HazardDomain {
    config: HazardConfig,
    retire_threshold: usize,
    table: Arc<RecordTable>,
    local: ThreadLocal<Cell<CachedRecord>>,
    pending_count: WrappedAlign64Type<AtomicUsize>,
    reclaimed_count: WrappedAlign64Type<AtomicUsize>,
}

impl Default for HazardDomain {
    fn default() -> Self {
        HazardDomain::build(HazardConfig::default())
    }
}

impl fmt::Debug for HazardDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HazardDomain")
            .field("config", &self.config)
            .field("registered", &self.registered_count())
            .field("pending", &self.pending_count())
            .field("reclaimed", &self.reclaimed_count())
            .finish()
    }
}

impl HazardDomain {
    /// Create a domain after validating `config`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_lockfree_kit::hazard_domain::{HazardConfig, HazardDomain};
    ///
    /// let h = HazardDomain::new(HazardConfig::default().max_threads(8)).unwrap();
    /// assert_eq!(h.config().max_threads, 8);
    /// assert!(HazardDomain::new(HazardConfig::default().hazards_per_thread(0)).is_err());
    /// ```
    ///
    pub fn new(config: HazardConfig) -> Result<HazardDomain> {
        if let Err(e) = config.validate() {
            warn!("invalid hazard domain config {:?}: {}", config, e);
            return Err(e);
        }
        Ok(HazardDomain::build(config))
    }

    fn build(config: HazardConfig) -> HazardDomain {
        let records = (0..config.max_threads)
            .map(|_| WrappedAlign64Type(ThreadStore::new(config.hazards_per_thread)))
            .collect();
        HazardDomain {
            config,
            retire_threshold: config.effective_retire_threshold(),
            table: Arc::new(RecordTable {
                records,
                registered_count: Default::default(),
            }),
            local: ThreadLocal::new(),
            pending_count: Default::default(),
            reclaimed_count: Default::default(),
        }
    }

    pub fn config(&self) -> &HazardConfig {
        &self.config
    }

    pub fn hazards_per_thread(&self) -> usize {
        self.config.hazards_per_thread
    }

    /// Claim a record for the calling thread. Dropping the handle clears its hazards and releases
    /// the record; retired pointers still waiting stay behind and are reclaimed by later scans.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_lockfree_kit::error::Error;
    /// use rs_lockfree_kit::hazard_domain::{HazardConfig, HazardDomain};
    ///
    /// let h = HazardDomain::new(HazardConfig::default().max_threads(1)).unwrap();
    /// let handle = h.register_thread().unwrap();
    /// assert_eq!(h.register_thread().unwrap_err(), Error::ThreadNumOverflow { max: 1 });
    /// drop(handle);
    /// assert!(h.register_thread().is_ok());
    /// ```
    ///
    pub fn register_thread(&self) -> Result<SlotHandle<'_>> {
        let tid = self.table.claim()?;
        Ok(SlotHandle::new(self, tid, true))
    }

    /// Handle to the calling thread's cached record, claimed on first use and released when the
    /// thread exits.
    ///
    /// This is the record the containers of this domain use internally, so hazards published
    /// through it are overwritten by the next container operation on this thread. Hold hazards
    /// across container calls with `register_thread` instead.
    pub fn current_thread(&self) -> Result<SlotHandle<'_>> {
        let serial = match THREAD_EXIT.try_with(|exit| exit.serial) {
            Ok(serial) => serial,
            // thread locals are being torn down, the record lives as long as the handle
            Err(_) => return self.register_thread(),
        };
        let cached = self.local.get();
        if let Some(c) = cached.map(Cell::get) {
            if c.serial == serial {
                return Ok(SlotHandle::new(self, c.tid, false));
            }
        }
        let tid = self.table.claim()?;
        let table = Arc::downgrade(&self.table);
        let hooked = THREAD_EXIT.try_with(|exit| {
            let mut attached = exit.attached.borrow_mut();
            attached.retain(|(t, _)| t.strong_count() > 0);
            attached.push((table, tid));
        });
        if hooked.is_err() {
            return Ok(SlotHandle::new(self, tid, true));
        }
        let record = CachedRecord { tid, serial };
        match cached {
            Some(c) => c.set(record),
            None => {
                self.local.get_or(|| Cell::new(record));
            }
        }
        Ok(SlotHandle::new(self, tid, false))
    }

    /// Claim the calling thread's cached record now, so that exhaustion of the record table is
    /// reported here rather than as a panic inside a container operation.
    pub fn attach_current_thread(&self) -> Result<()> {
        self.current_thread().map(|_| ())
    }

    fn release_record(&self, tid: usize) {
        self.table.release(tid);
    }

    #[inline]
    fn record(&self, tid: usize) -> &ThreadStore {
        &self.table.records[tid]
    }

    /// Point-in-time union of every published hazard. The fence pairs with the one in
    /// `ThreadStore::protect`: a pointer whose retirement precedes this fence is either seen here
    /// or fails the protecting thread's validation. Retirement lists are therefore taken before
    /// the snapshot that filters them.
    fn hazard_snapshot(&self) -> HashSet<*mut u8> {
        atomic::fence(Ordering::SeqCst);
        let mut protected = HashSet::with_capacity(self.table.records.len());
        for record in self.table.records.iter() {
            record.collect_hazards(&mut protected);
        }
        protected
    }

    fn retire(&self, tid: usize, ptr: *mut u8, deleter: Deleter) {
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        let waiting = self.record(tid).add_retired(ptr, deleter);
        if waiting > self.retire_threshold {
            self.scan(tid);
        }
    }

    fn scan(&self, tid: usize) -> usize {
        let record = self.record(tid);
        let list = record.take_retired();
        let protected = self.hazard_snapshot();
        let (freed, kept) = unsafe { record.reclaim(list, &protected) };
        self.account_freed(freed);
        trace!(
            "scan tid={}, hazards={}, freed={}, kept={}",
            tid,
            protected.len(),
            freed,
            kept
        );
        freed
    }

    fn account_freed(&self, freed: usize) {
        if freed > 0 {
            self.pending_count.fetch_sub(freed, Ordering::Relaxed);
            self.reclaimed_count.fetch_add(freed, Ordering::Relaxed);
        }
    }

    /// Scan the retirement list of every record, including records whose thread is gone, and
    /// free whatever is unprotected. Returns the number of freed pointers. Meant for quiescent
    /// points such as shutdown, but safe to call concurrently with other operations.
    pub fn reclaim_all(&self) -> usize {
        let lists: Vec<_> = self
            .table
            .records
            .iter()
            .map(|record| record.take_retired())
            .collect();
        let protected = self.hazard_snapshot();
        let mut freed = 0;
        for (record, list) in self.table.records.iter().zip(lists) {
            freed += unsafe { record.reclaim(list, &protected) }.0;
        }
        self.account_freed(freed);
        debug!(
            "reclaim_all freed={}, pending={}",
            freed,
            self.pending_count()
        );
        freed
    }

    /// Number of retired pointers not yet freed.
    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Relaxed)
    }

    /// Number of retired pointers freed so far.
    pub fn reclaimed_count(&self) -> usize {
        self.reclaimed_count.load(Ordering::Relaxed)
    }

    /// Number of records currently claimed.
    pub fn registered_count(&self) -> usize {
        self.table.registered_count.load(Ordering::Relaxed)
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        // no handle outlives the borrow of the domain, so nothing pending is protected
        let mut freed = 0;
        for record in self.table.records.iter() {
            freed += unsafe { record.destroy() };
        }
        self.account_freed(freed);
        debug!(
            "drop hazard domain, freed={}, reclaimed={}",
            freed,
            self.reclaimed_count()
        );
    }
}

/// A thread's view of its hazard record.
///
/// Not `Send`: the record belongs to the thread that obtained the handle.
pub struct SlotHandle<'d> {
    domain: &'d HazardDomain,
    tid: usize,
    owned: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<'d> SlotHandle<'d> {
    fn new(domain: &'d HazardDomain, tid: usize, owned: bool) -> Self {
        SlotHandle {
            domain,
            tid,
            owned,
            _not_send: PhantomData,
        }
    }

    /// Index of the record in the domain's table.
    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn domain(&self) -> &'d HazardDomain {
        self.domain
    }

    /// Publish `ptr` in hazard `index`. On its own this does not make a dereference safe: the
    /// source has to be reloaded afterwards to check `ptr` was still reachable, which is what
    /// `protect_load` does.
    ///
    /// # Panics
    ///
    /// Panics if `index >= hazards_per_thread`.
    #[inline]
    pub fn protect<T>(&self, index: usize, ptr: *mut T) {
        self.domain.record(self.tid).protect(index, ptr as *mut u8);
    }

    /// Load `src` and publish the loaded pointer in hazard `index`, repeating until a reload of
    /// `src` returns the published value. The returned pointer stays safe to dereference until
    /// hazard `index` is cleared or overwritten.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_lockfree_kit::hazard_domain::HazardDomain;
    /// use std::sync::atomic::AtomicPtr;
    ///
    /// let h = HazardDomain::default();
    /// let handle = h.register_thread().unwrap();
    /// let shared = AtomicPtr::new(Box::into_raw(Box::new(7)));
    /// let p = handle.protect_load(0, &shared);
    /// assert_eq!(unsafe { *p }, 7);
    /// handle.clear(0);
    /// unsafe { handle.retire_box(p) };
    /// assert_eq!(handle.scan(), 1);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `index >= hazards_per_thread`.
    pub fn protect_load<T>(&self, index: usize, src: &AtomicPtr<T>) -> *mut T {
        let record = self.domain.record(self.tid);
        let mut ptr = src.load(Ordering::Acquire);
        loop {
            record.protect(index, ptr as *mut u8);
            let reloaded = src.load(Ordering::Acquire);
            if reloaded == ptr {
                return ptr;
            }
            ptr = reloaded;
        }
    }

    /// Publish null in hazard `index`.
    #[inline]
    pub fn clear(&self, index: usize) {
        self.domain.record(self.tid).clear(index);
    }

    /// The pointer currently published in hazard `index`.
    pub fn protected(&self, index: usize) -> *mut u8 {
        self.domain.record(self.tid).hazard(index)
    }

    /// Hand `ptr` to the domain, `deleter(ptr)` runs once no hazard refers to it. Triggers a scan
    /// of this record's list when it grows past the retire threshold.
    ///
    /// # Safety
    ///
    /// `ptr` must be unreachable for threads that have not already protected it, must not be
    /// retired twice, and `deleter` must be valid to call on it from any thread.
    pub unsafe fn retire(&self, ptr: *mut u8, deleter: Deleter) {
        self.domain.retire(self.tid, ptr, deleter);
    }

    /// `retire` for a pointer obtained from `Box::into_raw`.
    ///
    /// # Safety
    ///
    /// Same as `retire`, and `ptr` must come from `Box::<T>::into_raw`.
    pub unsafe fn retire_box<T>(&self, ptr: *mut T) {
        self.domain.retire(self.tid, ptr as *mut u8, drop_box::<T>);
    }

    /// Free every pointer in this record's retirement list that no thread has published.
    /// Returns the number freed.
    pub fn scan(&self) -> usize {
        self.domain.scan(self.tid)
    }

    /// Number of pointers waiting in this record's retirement list.
    pub fn retired_count(&self) -> usize {
        self.domain.record(self.tid).retired_count()
    }
}

impl<'d> fmt::Debug for SlotHandle<'d> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("tid", &self.tid)
            .field("owned", &self.owned)
            .finish()
    }
}

impl<'d> Drop for SlotHandle<'d> {
    fn drop(&mut self) {
        if self.owned {
            self.domain.release_record(self.tid);
        }
    }
}
