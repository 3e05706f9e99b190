//! Treiber stack whose popped nodes are reclaimed through a `HazardDomain`.

use crate::error::Result;
use crate::hazard_domain::HazardDomain;
use crate::util::{Backoff, WrappedAlign64Type};
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

const HAZARD_TOP: usize = 0;

type LIFONodePtr<T> = *mut LIFONode<T>;

/// `next` is written only before the node is published, so it needs no atomic access. The value
/// is moved out by the thread whose CAS unlinks the node, freeing the node never drops it.
struct LIFONode<T> {
    value: ManuallyDrop<T>,
    next: LIFONodePtr<T>,
}

impl<T> LIFONode<T> {
    fn new(value: T) -> Self {
        LIFONode {
            value: ManuallyDrop::new(value),
            next: ptr::null_mut(),
        }
    }
}

/// Lock-free LIFO stack.
///
/// `push` only needs a CAS on the top pointer. `pop` publishes the top node as a hazard before
/// reading its `next`, so a concurrently popped node is never freed under a reader and can not be
/// recycled into an ABA on the top pointer.
///
/// # Examples
///
/// ```
/// use rs_lockfree_kit::lockfree_stack::LockFreeStack;
///
/// let stack = LockFreeStack::new();
/// stack.push(1);
/// stack.push(2);
/// assert_eq!(stack.pop(), Some(2));
/// assert_eq!(stack.pop(), Some(1));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct LockFreeStack<T> {
    top: WrappedAlign64Type<AtomicPtr<LIFONode<T>>>,
    domain: Arc<HazardDomain>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("top", &self.top.load(Ordering::Relaxed))
            .field("domain", &self.domain)
            .finish()
    }
}

impl<T> LockFreeStack<T> {
    /// Stack with a private `HazardDomain` built from the default config.
    pub fn new() -> Self {
        Self::with_domain(Arc::new(HazardDomain::default()))
    }

    /// Stack reclaiming its nodes through `domain`, which may be shared with other containers.
    pub fn with_domain(domain: Arc<HazardDomain>) -> Self {
        LockFreeStack {
            top: WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
            domain,
            _marker: PhantomData,
        }
    }

    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(LIFONode::new(value)));
        let mut backoff = Backoff::new();
        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = old };
            match self
                .top
                .compare_exchange_weak(old, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(cur) => {
                    old = cur;
                    backoff.spin();
                }
            }
        }
    }

    /// Pop the most recently pushed value, `None` if the stack is empty.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no hazard record and the domain has none left. Call
    /// `HazardDomain::attach_current_thread` up front, or use `try_pop`, to handle that case.
    pub fn pop(&self) -> Option<T> {
        match self.try_pop() {
            Ok(v) => v,
            Err(e) => panic!("LockFreeStack::pop: {}", e),
        }
    }

    /// `pop` that reports hazard record exhaustion instead of panicking.
    pub fn try_pop(&self) -> Result<Option<T>> {
        let handle = self.domain.current_thread()?;
        let mut backoff = Backoff::new();
        loop {
            let top = handle.protect_load(HAZARD_TOP, &self.top);
            if top.is_null() {
                handle.clear(HAZARD_TOP);
                return Ok(None);
            }
            let next = unsafe { (*top).next };
            if self
                .top
                .compare_exchange(top, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                handle.clear(HAZARD_TOP);
                let value = unsafe { ManuallyDrop::into_inner(ptr::read(&(*top).value)) };
                unsafe { handle.retire_box(top) };
                return Ok(Some(value));
            }
            backoff.spin();
        }
    }

    fn destroy(&mut self) {
        let mut curr = *self.top.get_mut();
        *self.top.get_mut() = ptr::null_mut();
        while !curr.is_null() {
            let mut node = unsafe { Box::from_raw(curr) };
            unsafe { ManuallyDrop::drop(&mut node.value) };
            curr = node.next;
        }
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}
