//! Unbounded Michael & Scott queue whose dequeued sentinels are reclaimed through a
//! `HazardDomain`.

use crate::error::{Error, Result};
use crate::hazard_domain::{HazardDomain, SlotHandle};
use crate::util::{Backoff, WrappedAlign64Type};
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

const HAZARD_FIRST: usize = 0;
const HAZARD_NEXT: usize = 1;

type FIFONodePtr<T> = *mut FIFONode<T>;

/// The value is written once before the node is linked, and moved out by the dequeuer that makes
/// this node the new sentinel. A sentinel's value is always moved out or was never written.
struct FIFONode<T> {
    value: MaybeUninit<T>,
    next: AtomicPtr<FIFONode<T>>,
}

impl<T> FIFONode<T> {
    fn sentinel() -> FIFONodePtr<T> {
        Box::into_raw(Box::new(FIFONode {
            value: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn new(value: T) -> FIFONodePtr<T> {
        Box::into_raw(Box::new(FIFONode {
            value: MaybeUninit::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// A lock-free Michael-Scott queue.
///
/// This queue is an implementation of that described in [Simple, Fast, and Practical
/// Non-blocking and Blocking Concurrent Queue Algorithms](https://dl.acm.org/citation.cfm?id=248106).
/// `head` always points at a sentinel whose value has been consumed. `tail` points at the last
/// node or lags one link behind it, and every thread that sees the lag swings it forward first.
///
/// Every node is published as a hazard before it is dereferenced, and the sentinel a dequeue
/// unlinks is retired to the domain rather than freed.
///
/// # Examples
///
/// ```
/// use rs_lockfree_kit::lockfree_queue::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.enqueue("a");
/// queue.enqueue("b");
/// assert_eq!(queue.dequeue(), Some("a"));
/// assert_eq!(queue.dequeue(), Some("b"));
/// assert_eq!(queue.dequeue(), None);
/// ```
pub struct LockFreeQueue<T> {
    head: WrappedAlign64Type<AtomicPtr<FIFONode<T>>>,
    tail: WrappedAlign64Type<AtomicPtr<FIFONode<T>>>,
    domain: Arc<HazardDomain>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("domain", &self.domain)
            .finish()
    }
}

impl<T> LockFreeQueue<T> {
    /// Queue with a private `HazardDomain` built from the default config.
    pub fn new() -> Self {
        Self::build(Arc::new(HazardDomain::default()))
    }

    /// Queue reclaiming its nodes through `domain`. The domain must publish at least two hazards
    /// per thread.
    pub fn with_domain(domain: Arc<HazardDomain>) -> Result<Self> {
        if domain.hazards_per_thread() < 2 {
            warn!(
                "queue needs two hazards per thread, domain has {}",
                domain.hazards_per_thread()
            );
            return Err(Error::InvalidParam("queue needs hazards_per_thread >= 2"));
        }
        Ok(Self::build(domain))
    }

    fn build(domain: Arc<HazardDomain>) -> Self {
        let sentinel = FIFONode::sentinel();
        LockFreeQueue {
            head: WrappedAlign64Type(AtomicPtr::new(sentinel)),
            tail: WrappedAlign64Type(AtomicPtr::new(sentinel)),
            domain,
            _marker: PhantomData,
        }
    }

    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    fn local_handle(&self) -> SlotHandle<'_> {
        match self.domain.current_thread() {
            Ok(handle) => handle,
            Err(e) => panic!("LockFreeQueue: {}", e),
        }
    }

    /// Append `value` at the tail.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no hazard record and the domain has none left, see
    /// `HazardDomain::attach_current_thread`.
    pub fn enqueue(&self, value: T) {
        let handle = self.local_handle();
        let node = FIFONode::new(value);
        let mut backoff = Backoff::new();
        loop {
            let tail = handle.protect_load(HAZARD_FIRST, &self.tail);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                if unsafe {
                    (*tail)
                        .next
                        .compare_exchange(next, node, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                } {
                    // whoever sees the lag first finishes this swing if it fails
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    break;
                }
            } else {
                let _ =
                    self.tail
                        .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            }
            backoff.spin();
        }
        handle.clear(HAZARD_FIRST);
    }

    /// Remove the value at the head, `None` if the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no hazard record and the domain has none left. Use
    /// `try_dequeue` to get the error instead.
    pub fn dequeue(&self) -> Option<T> {
        match self.try_dequeue() {
            Ok(v) => v,
            Err(e) => panic!("LockFreeQueue::dequeue: {}", e),
        }
    }

    /// `dequeue` that reports hazard record exhaustion instead of panicking.
    pub fn try_dequeue(&self) -> Result<Option<T>> {
        let handle = self.domain.current_thread()?;
        let mut backoff = Backoff::new();
        loop {
            let head = handle.protect_load(HAZARD_FIRST, &self.head);
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            handle.protect(HAZARD_NEXT, next);
            // head unchanged means next is still its successor and not yet retired
            if self.head.load(Ordering::Acquire) != head {
                backoff.spin();
                continue;
            }
            if head == tail {
                if next.is_null() {
                    handle.clear(HAZARD_NEXT);
                    handle.clear(HAZARD_FIRST);
                    return Ok(None);
                }
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            } else if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // next is the new sentinel, hazard NEXT keeps it alive until its value is out
                let value = unsafe { ptr::read((*next).value.as_ptr()) };
                handle.clear(HAZARD_NEXT);
                handle.clear(HAZARD_FIRST);
                unsafe { handle.retire_box(head) };
                return Ok(Some(value));
            }
            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> bool {
        let handle = self.local_handle();
        let head = handle.protect_load(HAZARD_FIRST, &self.head);
        let empty = unsafe { (*head).next.load(Ordering::Acquire) }.is_null();
        handle.clear(HAZARD_FIRST);
        empty
    }

    fn destroy(&mut self) {
        let sentinel = *self.head.get_mut();
        let mut curr = unsafe { *(*sentinel).next.get_mut() };
        drop(unsafe { Box::from_raw(sentinel) });
        while !curr.is_null() {
            let mut node = unsafe { Box::from_raw(curr) };
            unsafe { ptr::drop_in_place(node.value.as_mut_ptr()) };
            curr = *node.next.get_mut();
        }
        *self.head.get_mut() = ptr::null_mut();
        *self.tail.get_mut() = ptr::null_mut();
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}
