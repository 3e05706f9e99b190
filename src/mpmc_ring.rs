//! Bounded multi-producer/multi-consumer ring buffer, after Dmitry Vyukov's design.

use crate::error::{Error, Result};
use crate::util::{Backoff, WrappedAlign64Type};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A ring cell. For the generation that reaches this cell at position `pos`, `sequence == pos`
/// means writable, `pos + 1` readable, and `pos + capacity` consumed and writable again by the
/// next generation.
struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC ring.
///
/// Producers and consumers each share one position counter and claim a position with a CAS on
/// it; the claimed cell is then written or read without further synchronisation and handed over
/// by a release store of its sequence. Cells are recycled, never freed, so no reclamation scheme
/// is needed, and the sequence stops a stale producer or consumer from touching a cell of a later
/// generation.
///
/// # Examples
///
/// ```
/// use rs_lockfree_kit::mpmc_ring::MpmcRing;
///
/// let ring = MpmcRing::new(2).unwrap();
/// assert!(ring.push(1).is_ok());
/// assert!(ring.push(2).is_ok());
/// assert_eq!(ring.push(3), Err(3));
/// assert_eq!(ring.pop(), Some(1));
/// assert_eq!(ring.len(), 1);
/// ```
pub struct MpmcRing<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: WrappedAlign64Type<AtomicUsize>,
    dequeue_pos: WrappedAlign64Type<AtomicUsize>,
}

unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> fmt::Debug for MpmcRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MpmcRing")
            .field("capacity", &self.capacity())
            .field("enqueue_pos", &self.enqueue_pos.load(Ordering::Relaxed))
            .field("dequeue_pos", &self.dequeue_pos.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> MpmcRing<T> {
    /// Ring holding up to `capacity` values. `capacity` must be a power of two and at least 2.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(Error::InvalidCapacity {
                capacity,
                reason: "an MPMC ring needs at least 2 cells",
            });
        }
        if !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity {
                capacity,
                reason: "must be a power of two",
            });
        }
        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Ok(MpmcRing {
            buffer,
            mask: capacity - 1,
            enqueue_pos: Default::default(),
            dequeue_pos: Default::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Append `value`, or hand it back in `Err` if the ring is full.
    pub fn push(&self, value: T) -> std::result::Result<(), T> {
        let mut backoff = Backoff::new();
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(pos) as isize;
            if dif == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*cell.value.get()).write(value) };
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(cur) => pos = cur,
                }
            } else if dif < 0 {
                // the previous generation of this cell has not been consumed
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
            backoff.spin();
        }
    }

    /// Take the oldest value, `None` if the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(pos.wrapping_add(1)) as isize;
            if dif == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(cur) => pos = cur,
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
            backoff.spin();
        }
    }

    /// Number of values in the ring. Exact only when no push or pop is in flight; always in
    /// `0..=capacity`.
    pub fn len(&self) -> usize {
        let dequeue_pos = self.dequeue_pos.load(Ordering::Acquire);
        let enqueue_pos = self.enqueue_pos.load(Ordering::Acquire);
        let len = enqueue_pos.wrapping_sub(dequeue_pos) as isize;
        (len.max(0) as usize).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        let mut pos = *self.dequeue_pos.get_mut();
        let end = *self.enqueue_pos.get_mut();
        while pos != end {
            let cell = &mut self.buffer[pos & self.mask];
            unsafe { cell.value.get_mut().assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}
