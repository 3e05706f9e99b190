use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{self, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crate::util::WrappedAlign64Type;

/// Frees the object behind a retired pointer.
pub type Deleter = unsafe fn(*mut u8);

/// Deleter for objects allocated with `Box<T>`.
pub unsafe fn drop_box<T>(ptr: *mut u8) {
    drop(unsafe { Box::from_raw(ptr as *mut T) });
}

/// A pointer unlinked from a shared structure, waiting until no hazard refers to it.
pub(crate) struct Retired {
    ptr: *mut u8,
    deleter: Deleter,
    next: *mut Retired,
}

impl Retired {
    pub(crate) fn new(ptr: *mut u8, deleter: Deleter) -> *mut Retired {
        Box::into_raw(Box::new(Retired {
            ptr,
            deleter,
            next: ptr::null_mut(),
        }))
    }

    /// Run the deleter and free the list entry itself.
    unsafe fn reclaim(node: *mut Retired) {
        let node = unsafe { Box::from_raw(node) };
        unsafe { (node.deleter)(node.ptr) };
    }
}

/// Hazard record of one thread: the published pointers plus the thread's retirement list.
///
/// Hazard cells are written by the owner only and read by every scanner. The retirement list is
/// a CAS linked list, pushed by its owner and taken with `swap` by whichever thread reclaims it.
pub(crate) struct ThreadStore {
    active: AtomicBool,
    hazards: Box<[AtomicPtr<u8>]>,
    retired_list: WrappedAlign64Type<AtomicPtr<Retired>>,
    retired_count: AtomicUsize,
}

impl ThreadStore {
    pub(crate) fn new(hazards_per_thread: usize) -> ThreadStore {
        ThreadStore {
            active: AtomicBool::new(false),
            hazards: (0..hazards_per_thread)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            retired_list: WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
            retired_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn try_claim(&self) -> bool {
        !self.active.load(Ordering::Relaxed)
            && self
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Clear every hazard and hand the record back. Retired nodes stay in the list and are
    /// reclaimed by the next owner or by a domain wide sweep.
    pub(crate) fn release(&self) {
        for hazard in self.hazards.iter() {
            hazard.store(ptr::null_mut(), Ordering::Release);
        }
        self.active.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Publish `ptr`. The fence orders the store before the caller's validating reload, and
    /// pairs with the fence a scanner issues before reading hazards.
    #[inline]
    pub(crate) fn protect(&self, index: usize, ptr: *mut u8) {
        self.hazards[index].store(ptr, Ordering::Release);
        atomic::fence(Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn clear(&self, index: usize) {
        self.hazards[index].store(ptr::null_mut(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn hazard(&self, index: usize) -> *mut u8 {
        self.hazards[index].load(Ordering::Acquire)
    }

    pub(crate) fn collect_hazards(&self, protected: &mut HashSet<*mut u8>) {
        for hazard in self.hazards.iter() {
            let p = hazard.load(Ordering::Acquire);
            if !p.is_null() {
                protected.insert(p);
            }
        }
    }

    pub(crate) fn retired_count(&self) -> usize {
        self.retired_count.load(Ordering::Relaxed)
    }

    /// Push one retired pointer, return the list length after the push.
    pub(crate) fn add_retired(&self, ptr: *mut u8, deleter: Deleter) -> usize {
        let node = Retired::new(ptr, deleter);
        // counted before it is linked, a concurrent reclaim may free it right away
        let count = self.retired_count.fetch_add(1, Ordering::Relaxed) + 1;
        unsafe { self.inner_add_nodes(node, node, 1) };
        count
    }

    /// Link the chain `head..=tail` in front of the list.
    unsafe fn inner_add_nodes(&self, head: *mut Retired, tail: *mut Retired, count: usize) {
        if count == 0 {
            return;
        }
        let mut old = self.retired_list.load(Ordering::Acquire);
        loop {
            unsafe { (*tail).next = old };
            match self.retired_list.compare_exchange_weak(
                old,
                head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => old = cur,
            }
        }
    }

    /// Detach the whole retirement list. The caller owns the returned chain and hands it to
    /// `reclaim`.
    pub(crate) fn take_retired(&self) -> *mut Retired {
        self.retired_list.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Free every entry of `list` whose pointer is not in `protected`, and put the survivors back
    /// on this record. Returns `(freed, kept)`.
    ///
    /// # Safety
    ///
    /// `list` must come from `take_retired` on this record, and `protected` must be a snapshot of
    /// every hazard taken after that call.
    pub(crate) unsafe fn reclaim(
        &self,
        list: *mut Retired,
        protected: &HashSet<*mut u8>,
    ) -> (usize, usize) {
        let mut curr = list;
        let mut kept_head = ptr::null_mut::<Retired>();
        let mut kept_tail = ptr::null_mut::<Retired>();
        let mut freed = 0;
        let mut kept = 0;
        while !curr.is_null() {
            let next = unsafe { (*curr).next };
            if protected.contains(&unsafe { (*curr).ptr }) {
                unsafe { (*curr).next = kept_head };
                if kept_head.is_null() {
                    kept_tail = curr;
                }
                kept_head = curr;
                kept += 1;
            } else {
                unsafe { Retired::reclaim(curr) };
                freed += 1;
            }
            curr = next;
        }
        self.retired_count.fetch_sub(freed, Ordering::Relaxed);
        if kept > 0 {
            unsafe { self.inner_add_nodes(kept_head, kept_tail, kept) };
        }
        (freed, kept)
    }

    /// Free every retired pointer regardless of hazards.
    ///
    /// # Safety
    ///
    /// No thread may still dereference any pointer in the list.
    pub(crate) unsafe fn destroy(&self) -> usize {
        let list = self.take_retired();
        unsafe { self.reclaim(list, &HashSet::new()) }.0
    }
}

impl Drop for ThreadStore {
    fn drop(&mut self) {
        unsafe { self.destroy() };
    }
}

#[cfg(test)]
mod test {
    use super::{drop_box, ThreadStore};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn boxed(cnt: &Arc<AtomicUsize>) -> *mut u8 {
        Box::into_raw(Box::new(Counted(cnt.clone()))) as *mut u8
    }

    #[test]
    fn test_claim_release() {
        let ts = ThreadStore::new(2);
        assert!(ts.try_claim());
        assert!(!ts.try_claim());
        let mut x = 1;
        ts.protect(1, &mut x as *mut i32 as *mut u8);
        assert!(!ts.hazard(1).is_null());
        ts.release();
        assert!(!ts.is_active());
        assert!(ts.hazard(1).is_null());
        assert!(ts.try_claim());
    }

    #[test]
    fn test_reclaim_keeps_protected() {
        let cnt = Arc::new(AtomicUsize::new(0));
        let ts = ThreadStore::new(1);
        let a = boxed(&cnt);
        let b = boxed(&cnt);
        let c = boxed(&cnt);
        assert_eq!(ts.add_retired(a, drop_box::<Counted>), 1);
        assert_eq!(ts.add_retired(b, drop_box::<Counted>), 2);
        assert_eq!(ts.add_retired(c, drop_box::<Counted>), 3);

        let mut protected = HashSet::new();
        protected.insert(b);
        let (freed, kept) = unsafe { ts.reclaim(ts.take_retired(), &protected) };
        assert_eq!((freed, kept), (2, 1));
        assert_eq!(cnt.load(Ordering::Relaxed), 2);
        assert_eq!(ts.retired_count(), 1);

        let (freed, kept) = unsafe { ts.reclaim(ts.take_retired(), &HashSet::new()) };
        assert_eq!((freed, kept), (1, 0));
        assert_eq!(cnt.load(Ordering::Relaxed), 3);
        assert_eq!(ts.retired_count(), 0);
    }

    #[test]
    fn test_entries_retired_after_take_stay_listed() {
        let cnt = Arc::new(AtomicUsize::new(0));
        let ts = ThreadStore::new(1);
        ts.add_retired(boxed(&cnt), drop_box::<Counted>);
        let taken = ts.take_retired();
        let late = boxed(&cnt);
        ts.add_retired(late, drop_box::<Counted>);
        assert_eq!(unsafe { ts.reclaim(taken, &HashSet::new()) }, (1, 0));
        assert_eq!(cnt.load(Ordering::Relaxed), 1);
        assert_eq!(ts.retired_count(), 1);
        assert_eq!(unsafe { ts.destroy() }, 1);
        assert_eq!(cnt.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_drop_frees_pending() {
        let cnt = Arc::new(AtomicUsize::new(0));
        {
            let ts = ThreadStore::new(1);
            for _ in 0..10 {
                ts.add_retired(boxed(&cnt), drop_box::<Counted>);
            }
            assert_eq!(cnt.load(Ordering::Relaxed), 0);
        }
        assert_eq!(cnt.load(Ordering::Relaxed), 10);
    }
}
