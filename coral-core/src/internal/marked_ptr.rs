// Marked pointer operations using the LSB as a mark bit.
//
// Bit layout:
//   Bit 0: DELETE_MARK - the node owning this pointer is logically deleted
//
// The mark travels in the same word as the pointer so a single CAS observes
// or advances both at once. `MarkedPtr` is the decomposed value view;
// `AtomicMarkedPtr` is the shared cell the skip list links are made of.
//
// Node alignment is at least 8 (the node starts with two u64 fields), so the
// low bit is always free.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

const DELETE_MARK: usize = 0b1;

/// A pointer value carrying a mark flag in its least significant bit.
pub(crate) struct MarkedPtr<T> {
    ptr: *mut T,
}

impl<T> Copy for MarkedPtr<T> {}

impl<T> Clone for MarkedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for MarkedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for MarkedPtr<T> {}

impl<T> MarkedPtr<T> {
    /// Compose a marked word from a clean pointer and a mark flag.
    #[inline]
    pub(crate) fn new(ptr: *mut T, mark: bool) -> Self {
        debug_assert_eq!(ptr as usize & DELETE_MARK, 0);
        MarkedPtr {
            ptr: (ptr as usize | usize::from(mark)) as *mut T,
        }
    }

    /// Reinterpret a raw (possibly marked) word.
    #[inline]
    pub(crate) fn from_raw(ptr: *mut T) -> Self {
        MarkedPtr { ptr }
    }

    /// The clean pointer with the mark stripped (the one you dereference).
    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut T {
        (self.ptr as usize & !DELETE_MARK) as *mut T
    }

    /// The raw word with the mark intact (for CAS operations).
    #[inline]
    pub(crate) fn as_raw(&self) -> *mut T {
        self.ptr
    }

    #[inline]
    pub(crate) fn mark(&self) -> bool {
        (self.ptr as usize & DELETE_MARK) != 0
    }
}

/// An atomic cell holding a `MarkedPtr` word.
///
/// The pointer view and the mark view can be updated independently
/// (`store_ptr`, `store_mark`), each preserving the other half of the word
/// through a CAS loop, or together through `compare_exchange`.
pub(crate) struct AtomicMarkedPtr<T> {
    inner: AtomicPtr<T>,
}

impl<T> AtomicMarkedPtr<T> {
    #[inline]
    pub(crate) fn null() -> Self {
        AtomicMarkedPtr {
            inner: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Load the whole word (Acquire ordering).
    #[inline]
    pub(crate) fn load(&self) -> MarkedPtr<T> {
        MarkedPtr::from_raw(self.inner.load(Ordering::Acquire))
    }

    /// Load the clean pointer, mark stripped.
    #[inline]
    pub(crate) fn load_ptr(&self) -> *mut T {
        self.load().as_ptr()
    }

    /// Load the mark flag.
    #[inline]
    pub(crate) fn load_mark(&self) -> bool {
        self.load().mark()
    }

    /// Unconditional store of the whole word (Release ordering).
    ///
    /// Only legal while the cell is not shared (node initialization) or while
    /// the owning node's lock serializes all writers.
    #[inline]
    pub(crate) fn store(&self, value: MarkedPtr<T>) {
        self.inner.store(value.as_raw(), Ordering::Release);
    }

    /// Replace the pointer, preserving whatever mark is currently set.
    #[inline]
    pub(crate) fn store_ptr(&self, ptr: *mut T) {
        let mut current = self.inner.load(Ordering::Acquire);
        loop {
            let desired = MarkedPtr::new(ptr, MarkedPtr::from_raw(current).mark());
            match self.inner.compare_exchange_weak(
                current,
                desired.as_raw(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Set or clear the mark, preserving the pointer.
    #[inline]
    pub(crate) fn store_mark(&self, mark: bool) {
        let mut current = self.inner.load(Ordering::Acquire);
        loop {
            let desired = MarkedPtr::new(MarkedPtr::from_raw(current).as_ptr(), mark);
            match self.inner.compare_exchange_weak(
                current,
                desired.as_raw(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Single-word CAS observing pointer and mark together.
    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        expected: MarkedPtr<T>,
        desired: MarkedPtr<T>,
    ) -> Result<(), MarkedPtr<T>> {
        self.inner
            .compare_exchange(
                expected.as_raw(),
                desired.as_raw(),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(MarkedPtr::from_raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_roundtrip() {
        let mut value = 7usize;
        let cell = AtomicMarkedPtr::null();
        cell.store(MarkedPtr::new(&mut value, false));

        assert_eq!(cell.load_ptr(), &mut value as *mut usize);
        assert!(!cell.load_mark());

        cell.store_mark(true);
        assert!(cell.load_mark());
        assert_eq!(cell.load_ptr(), &mut value as *mut usize);

        let mut other = 9usize;
        cell.store_ptr(&mut other);
        assert!(cell.load_mark());
        assert_eq!(cell.load_ptr(), &mut other as *mut usize);
    }

    #[test]
    fn test_compare_exchange_observes_mark() {
        let mut value = 1usize;
        let cell = AtomicMarkedPtr::null();
        cell.store(MarkedPtr::new(&mut value, false));
        cell.store_mark(true);

        // Expecting the unmarked word must fail once the mark is set.
        let unmarked = MarkedPtr::new(&mut value as *mut usize, false);
        let null = MarkedPtr::new(std::ptr::null_mut(), false);
        assert!(cell.compare_exchange(unmarked, null).is_err());

        let marked = MarkedPtr::new(&mut value as *mut usize, true);
        assert!(cell.compare_exchange(marked, null).is_ok());
        assert!(cell.load_ptr().is_null());
    }
}
