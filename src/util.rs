//! Low level helpers shared by the containers.

use std::hint;
use std::ops::{Deref, DerefMut};

/// Aligns `T` to 64 bytes, so that two of them never share a cache line.
///
/// Counters written by different threads (the head and tail of a ring, the head and tail of a
/// queue) are wrapped in it to avoid [`False sharing`](https://en.wikipedia.org/wiki/False_sharing).
///
/// # Examples
///
/// ```
/// use rs_lockfree_kit::util::WrappedAlign64Type;
/// use std::sync::atomic::AtomicUsize;
///
/// let pair = [WrappedAlign64Type(AtomicUsize::new(0)), WrappedAlign64Type(AtomicUsize::new(0))];
/// let a = &*pair[0] as *const _ as usize;
/// let b = &*pair[1] as *const _ as usize;
/// assert_eq!(a % 64, 0);
/// assert!(b - a >= 64);
/// ```
#[repr(align(64))]
#[derive(Debug)]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

const SPIN_LIMIT: u32 = 6;

/// Exponential spin for CAS retry loops.
///
/// Only affects throughput under contention, a failed CAS is always simply retried.
pub struct Backoff {
    step: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

impl Backoff {
    #[inline]
    pub fn new() -> Self {
        Backoff { step: 0 }
    }

    /// Spin `2^step` times, the step saturates at `SPIN_LIMIT`.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..1u32 << self.step {
            pause();
        }
        if self.step < SPIN_LIMIT {
            self.step += 1;
        }
    }
}

#[inline]
pub fn pause() {
    hint::spin_loop();
}

#[cfg(test)]
mod test {
    use super::{Backoff, WrappedAlign64Type};
    use std::mem;

    #[test]
    fn test_align() {
        assert_eq!(mem::align_of::<WrappedAlign64Type<u8>>(), 64);
        assert_eq!(mem::size_of::<WrappedAlign64Type<u64>>(), 64);
        let mut w = WrappedAlign64Type(3_i32);
        *w += 1;
        assert_eq!(*w, 4);
    }

    #[test]
    fn test_backoff_saturates() {
        let mut b = Backoff::new();
        for _ in 0..20 {
            b.spin();
        }
        assert_eq!(b.step, super::SPIN_LIMIT);
    }
}
