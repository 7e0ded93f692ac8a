use std::fmt;

use super::iter::WindowIter;
use super::node::{Range, RetiredRange};
use super::RangeList;
use crate::reclaim::Reclaim;
use crate::internal::MarkedPtr;

/// A locked, contiguous slice of a [`RangeList`].
///
/// Produced by [`RangeList::search_lock`] for a query `[base, base + size)`.
/// The handle holds the locks of the predecessor, every node overlapping the
/// query, and the successor, plus a pinned read section; together those pin
/// the window's structure until the handle drops:
///
/// ```text
///            ┌───────────── window ─────────────┐
/// … ─► prev ─► first ─► … ─► last ─► succ ─► …
///      (lock)  (lock)        (lock)  (lock)
/// ```
///
/// While the handle is live the window contents are exactly the live nodes
/// overlapping the query, and no other writer can touch the slice. Dropping
/// the handle releases every lock, predecessor first.
pub struct LockedWindow<'a, R: Reclaim> {
    list: &'a RangeList<R>,
    base: u64,
    size: u64,
    prev: *mut Range,
    /// First node at or past the end of the query, null at end of list.
    /// Locked like the rest of the window.
    succ: *mut Range,
    read: R::Section,
}

impl<'a, R: Reclaim> LockedWindow<'a, R> {
    pub(crate) fn new(
        list: &'a RangeList<R>,
        base: u64,
        size: u64,
        prev: *mut Range,
        succ: *mut Range,
        read: R::Section,
    ) -> Self {
        LockedWindow {
            list,
            base,
            size,
            prev,
            succ,
            read,
        }
    }

    /// Start of the query interval this window was locked for.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the query interval this window was locked for.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the window currently holds no nodes.
    pub fn is_empty(&self) -> bool {
        unsafe { (*self.prev).next(0).load_ptr() == self.succ }
    }

    /// Iterate over the nodes inside the window, in key order.
    pub fn iter(&self) -> WindowIter<'_> {
        let first = unsafe { (*self.prev).next(0).load_ptr() };
        WindowIter::new(first, self.succ)
    }

    /// Atomically substitute the window contents with `new_chain`.
    ///
    /// The chain must be sorted, pairwise disjoint, and fully contained in
    /// `[base, base + size)`; violations are caller bugs and panic. An empty
    /// chain deletes the window contents; an empty chain on an empty window
    /// is a no-op.
    ///
    /// The substitution is visible to lock-free readers at a single CAS on
    /// the predecessor's level-0 pointer: before it they see the old nodes
    /// (by then marked deleted), after it the new chain. Old nodes are
    /// retired through the collection's reclaimer once their index levels are
    /// cleared.
    pub fn replace(&self, new_chain: Vec<Box<Range>>) {
        // Caller-bug checks before touching shared state.
        let mut min_key = self.base;
        for r in &new_chain {
            assert!(
                r.nlevel() <= self.list.nlevel,
                "replacement node was allocated for a different collection"
            );
            assert!(
                r.key() >= min_key && r.end() <= self.base + self.size,
                "replacement interval [{}, {}) escapes the window [{}, {}) or overlaps its predecessor",
                r.key(),
                r.end(),
                self.base,
                self.base + self.size
            );
            min_key = r.end();
        }

        unsafe {
            let first = (*self.prev).next(0).load_ptr();
            if new_chain.is_empty() && first == self.succ {
                return;
            }

            let new_nodes: Vec<*mut Range> =
                new_chain.into_iter().map(Box::into_raw).collect();

            // The new nodes are private until the publish CAS. Take their
            // locks now (uncontended) so the handle's release walk covers
            // them, and chain them at level 0 with the tail on succ.
            for &n in &new_nodes {
                (*n).lock_acquire();
            }
            for (i, &n) in new_nodes.iter().enumerate() {
                let next = new_nodes.get(i + 1).copied().unwrap_or(self.succ);
                (*n).next(0).store(MarkedPtr::new(next, false));
            }

            // Logically delete the old contents. All of them are locked by
            // this handle, so no other writer races the marks.
            let mut e = first;
            while e != self.succ {
                (*e).next(0).store_mark(true);
                e = (*e).next(0).load_ptr();
            }

            // Publish. The predecessor is locked and unmarked, so the CAS
            // cannot lose.
            let new_head = new_nodes.first().copied().unwrap_or(self.succ);
            if (*self.prev)
                .next(0)
                .compare_exchange(
                    MarkedPtr::new(first, false),
                    MarkedPtr::new(new_head, false),
                )
                .is_err()
            {
                panic!("INVARIANT VIOLATION: locked window predecessor moved during replace");
            }
            for &n in &new_nodes {
                (*n).set_curlevel(1);
            }

            // Retire the old nodes: clear index levels top-down, release
            // their locks, hand them to the reclaimer.
            let mut e = first;
            while e != self.succ {
                let next = (*e).next(0).load_ptr();
                self.list.unlink_upper_levels(e);
                (*e).set_curlevel(0);
                (*e).lock_release();
                self.list.reclaim().retire(&self.read, RetiredRange::new(e));
                e = next;
            }

            // Promote the new nodes into the index levels. Give up per node
            // on the first level that will not link.
            for &n in &new_nodes {
                for level in 1..(*n).nlevel() {
                    if !self.list.add_index(level, n, self.prev) {
                        break;
                    }
                }
            }
        }
    }

    /// Swap a single node of the window for a replacement with the same
    /// interval.
    ///
    /// The degenerate form of [`replace`](Self::replace) that leaves the
    /// rest of the window untouched. `old` must be a node of this window and
    /// `repl` must cover exactly the same interval; both are caller bugs
    /// otherwise and panic.
    pub fn replace_one(&self, old: &Range, repl: Box<Range>) {
        assert_eq!(old.key(), repl.key(), "replacement must keep the interval");
        assert_eq!(old.size(), repl.size(), "replacement must keep the interval");
        assert!(
            repl.nlevel() <= self.list.nlevel,
            "replacement node was allocated for a different collection"
        );

        let old_ptr = old as *const Range as *mut Range;

        unsafe {
            // Locate old's predecessor inside the window; every hop is
            // locked so the walk is stable.
            let mut pred = self.prev;
            loop {
                let n = (*pred).next(0).load_ptr();
                assert!(
                    !n.is_null() && n != self.succ,
                    "replacement target is not part of this window"
                );
                if n == old_ptr {
                    break;
                }
                pred = n;
            }

            let repl = Box::into_raw(repl);
            (*repl).lock_acquire();
            (*repl)
                .next(0)
                .store(MarkedPtr::new((*old_ptr).next(0).load_ptr(), false));

            (*old_ptr).next(0).store_mark(true);

            if (*pred)
                .next(0)
                .compare_exchange(
                    MarkedPtr::new(old_ptr, false),
                    MarkedPtr::new(repl, false),
                )
                .is_err()
            {
                panic!("INVARIANT VIOLATION: locked window predecessor moved during replace");
            }
            (*repl).set_curlevel(1);

            self.list.unlink_upper_levels(old_ptr);
            (*old_ptr).set_curlevel(0);
            (*old_ptr).lock_release();
            self.list.reclaim().retire(&self.read, RetiredRange::new(old_ptr));

            for level in 1..(*repl).nlevel() {
                if !self.list.add_index(level, repl, pred) {
                    break;
                }
            }
        }
    }
}

impl<'a, 'w, R: Reclaim> IntoIterator for &'a LockedWindow<'w, R> {
    type Item = &'a Range;
    type IntoIter = WindowIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<R: Reclaim> fmt::Debug for LockedWindow<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockedWindow[{}, {})", self.base, self.base + self.size)?;
        let mut entries = f.debug_list();
        for r in self.iter() {
            entries.entry(&(r.key(), r.size()));
        }
        entries.finish()
    }
}

impl<R: Reclaim> Drop for LockedWindow<'_, R> {
    fn drop(&mut self) {
        // Release predecessor-first, reading each successor before its
        // holder's lock goes; once a lock is released the pointer behind it
        // may change.
        unsafe {
            let mut e = self.prev;
            loop {
                if e.is_null() {
                    break;
                }
                let next = (*e).next(0).load_ptr();
                (*e).lock_release();
                if e == self.succ {
                    break;
                }
                e = next;
            }
        }
    }
}
