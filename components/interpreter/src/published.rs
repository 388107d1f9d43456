//! Epoch-protected copy-on-write values
//!
//! Readers pin the current epoch and borrow the published value without
//! taking a lock. Writers build a replacement and install it with a
//! compare-and-swap, retrying against whatever another writer installed in
//! the meantime. A replaced value is freed once every reader pinned before
//! the swap has unpinned.
//!
//! All accesses are sequentially consistent: the method cache relies on a
//! single order between publishing a value here and bumping a method epoch.

use std::fmt;
use std::sync::atomic::Ordering;

use crossbeam::epoch::{self, Atomic, Owned};

pub(crate) struct Published<T> {
    current: Atomic<T>,
}

impl<T> Published<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            current: Atomic::new(value),
        }
    }

    /// Borrow the current value for the duration of `f`.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = epoch::pin();
        let current = self.current.load(Ordering::SeqCst, &guard);
        // SAFETY: the pointer is never null, and a replaced value is only
        // destroyed after every guard pinned before the swap is dropped.
        f(unsafe { current.deref() })
    }

    /// Compare-and-swap loop.
    ///
    /// `f` sees the current value and returns the replacement (or `None` to
    /// leave it alone) together with a result. When another writer wins the
    /// race, `f` runs again on the value it installed.
    pub(crate) fn update<R>(&self, mut f: impl FnMut(&T) -> (Option<T>, R)) -> R {
        let guard = epoch::pin();
        let mut current = self.current.load(Ordering::SeqCst, &guard);
        loop {
            // SAFETY: as in `read`.
            let (next, result) = f(unsafe { current.deref() });
            let Some(next) = next else {
                return result;
            };
            match self.current.compare_exchange(
                current,
                Owned::new(next),
                Ordering::SeqCst,
                Ordering::SeqCst,
                &guard,
            ) {
                Ok(_) => {
                    // SAFETY: `current` is unlinked; only readers pinned
                    // before the exchange can still reach it.
                    unsafe { guard.defer_destroy(current) };
                    return result;
                }
                Err(lost) => current = lost.current,
            }
        }
    }

    /// Install `value` unconditionally.
    pub(crate) fn replace(&self, value: T) {
        let guard = epoch::pin();
        let old = self.current.swap(Owned::new(value), Ordering::SeqCst, &guard);
        // SAFETY: `old` is unlinked by the swap.
        unsafe { guard.defer_destroy(old) };
    }
}

impl<T> Drop for Published<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent readers, and the pointer
        // was allocated by `Atomic::new` or `Owned::new`.
        unsafe {
            let current = self.current.load(Ordering::Relaxed, epoch::unprotected());
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Published<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.read(|value| value.fmt(f))
    }
}
