//! Bounded single-producer/single-consumer ring buffer.

use crate::error::{Error, Result};
use crate::util::WrappedAlign64Type;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed ring of `slots` cells holding at most `slots - 1` values; one cell always stays empty so
/// that `head == tail` means empty and `tail + 1 == head` means full.
///
/// `tail` is written by the producer only and `head` by the consumer only, so neither side needs
/// a CAS: a value is written before the release store of `tail` that publishes it, and read
/// before the release store of `head` that hands its cell back. The two indices live on separate
/// cache lines.
///
/// The ring is used through the `Producer` and `Consumer` returned by `split`, which makes the
/// single producer and single consumer a compile time property.
///
/// # Examples
///
/// ```
/// use rs_lockfree_kit::spsc_ring::SpscRing;
///
/// let (mut tx, mut rx) = SpscRing::new(4).unwrap().split();
/// assert_eq!(tx.capacity(), 3);
/// for i in 0..3 {
///     tx.push(i).unwrap();
/// }
/// assert_eq!(tx.push(3), Err(3));
/// assert_eq!(rx.pop(), Some(0));
/// assert!(tx.push(3).is_ok());
/// ```
pub struct SpscRing<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: WrappedAlign64Type<AtomicUsize>,
    tail: WrappedAlign64Type<AtomicUsize>,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> fmt::Debug for SpscRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SpscRing")
            .field("slots", &self.slots())
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> SpscRing<T> {
    /// Ring of `slots` cells, `slots` must be at least 2.
    pub fn new(slots: usize) -> Result<Self> {
        if slots < 2 {
            return Err(Error::InvalidCapacity {
                capacity: slots,
                reason: "an SPSC ring needs at least 2 slots",
            });
        }
        let buffer = (0..slots)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Ok(SpscRing {
            buffer,
            head: Default::default(),
            tail: Default::default(),
        })
    }

    /// Hand out the two ends of the ring.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let ring = Arc::new(self);
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Relaxed);
        (
            Producer {
                ring: ring.clone(),
                tail,
                cached_head: head,
            },
            Consumer {
                ring,
                head,
                cached_tail: tail,
            },
        )
    }

    #[inline]
    fn slots(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    fn next_index(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots() {
            0
        } else {
            next
        }
    }

    /// Maximum number of values the ring holds at once.
    pub fn capacity(&self) -> usize {
        self.slots() - 1
    }

    /// Number of values in the ring. Exact only when neither end is moving.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.slots() - head) % self.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            unsafe { self.buffer[head].get_mut().assume_init_drop() };
            head = self.next_index(head);
        }
    }
}

/// Writing end of an `SpscRing`.
///
/// Keeps its own copy of `tail` and the last `head` it observed, and reloads the shared `head`
/// only when that cached value says the ring is full.
pub struct Producer<T> {
    ring: Arc<SpscRing<T>>,
    tail: usize,
    cached_head: usize,
}

impl<T> Producer<T> {
    /// Append `value`, or hand it back in `Err` if the ring is full.
    pub fn push(&mut self, value: T) -> std::result::Result<(), T> {
        let next = self.ring.next_index(self.tail);
        if next == self.cached_head {
            self.cached_head = self.ring.head.load(Ordering::Acquire);
            if next == self.cached_head {
                return Err(value);
            }
        }
        unsafe { (*self.ring.buffer[self.tail].get()).write(value) };
        self.ring.tail.store(next, Ordering::Release);
        self.tail = next;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Producer")
            .field("tail", &self.tail)
            .field("cached_head", &self.cached_head)
            .finish()
    }
}

/// Reading end of an `SpscRing`.
///
/// Keeps its own copy of `head` and the last `tail` it observed, and reloads the shared `tail`
/// only when that cached value says the ring is empty.
pub struct Consumer<T> {
    ring: Arc<SpscRing<T>>,
    head: usize,
    cached_tail: usize,
}

impl<T> Consumer<T> {
    /// Take the oldest value, `None` if the ring is empty.
    pub fn pop(&mut self) -> Option<T> {
        if self.head == self.cached_tail {
            self.cached_tail = self.ring.tail.load(Ordering::Acquire);
            if self.head == self.cached_tail {
                return None;
            }
        }
        let value = unsafe { (*self.ring.buffer[self.head].get()).assume_init_read() };
        let next = self.ring.next_index(self.head);
        self.ring.head.store(next, Ordering::Release);
        self.head = next;
        Some(value)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("head", &self.head)
            .field("cached_tail", &self.cached_tail)
            .finish()
    }
}
