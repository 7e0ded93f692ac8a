//! Concurrent range collection.
//!
//! A multi-level skip list whose elements are half-open intervals
//! `[key, key + size)`. Lookups are lock-free; structural mutation goes
//! through [`RangeList::search_lock`], which hands back a [`LockedWindow`]
//! covering every node overlapping the query.
//!
//! ```text
//! Level 2:  HEAD ──────────────────────► [40,8) ───────────────► NULL
//!             │                             │
//! Level 1:  HEAD ──────► [10,5) ─────────► [40,8) ───────────► NULL
//!             │             │                │
//! Level 0:  HEAD ──────► [10,5) ─► [20,4) ► [40,8) ─► [90,1) ► NULL
//! ```
//!
//! # Deletion protocol
//!
//! Removal is two-phase. A writer holding the window locks first sets the
//! mark bit on the victim's level-0 next pointer (logical delete), then
//! splices the victim out of level 0 with a single CAS on the predecessor,
//! and finally clears the victim's index levels top-down. The mark bit lives
//! in the same word as the pointer, so lock-free readers that race the
//! splice either see the old word (victim still linked, still valid memory)
//! or the new one, never a half-state.
//!
//! ```text
//! Step 1 - mark:     prev ──────► old ──╳──► succ
//! Step 2 - publish:  prev ─► new ─► succ      old ──╳──► succ (unlinked)
//! Step 3 - indexes:  old removed from levels curlevel-1 .. 1, then retired
//! ```
//!
//! # Invariants
//!
//! 1. Every level is strictly sorted by key.
//! 2. The level `l+1` chain is a subsequence of the level `l` chain.
//! 3. Every live node is reachable from the head along level 0.
//! 4. A set mark is never cleared, and a marked node is never relinked.
//! 5. Live nodes at level 0 are pairwise disjoint intervals.
//!
//! Mutating threads may violate these only inside a window whose locks they
//! hold. [`RangeList::check_invariants`] asserts the whole set under
//! quiescence.

mod iter;
mod node;
mod window;

use std::fmt;
use std::ptr;

pub use iter::{RangeIter, WindowIter};
pub use node::{Range, RetiredRange};
pub use window::LockedWindow;

use crate::reclaim::Reclaim;
use crate::internal::MarkedPtr;

/// Hard cap on the number of skip list levels.
pub const MAX_NLEVEL: usize = 32;

/// CAS attempts before `add_index` gives up on a level. A node that loses
/// all of them stays reachable through the lower levels, which only costs
/// lookup time.
const ADD_INDEX_RETRIES: usize = 8;

/// A concurrent collection of disjoint integer ranges.
///
/// Readers ([`search`](RangeList::search), [`iter`](RangeList::iter)) take no
/// locks. Writers obtain a [`LockedWindow`] over the contiguous run of nodes
/// overlapping their query and splice replacement nodes into it atomically.
/// Reclamation of spliced-out nodes is delegated to the reclaimer type `R`.
pub struct RangeList<R: Reclaim> {
    nlevel: usize,
    /// Sentinel with `key = 0, size = 0`, linked on every level. Never
    /// marked, never removed.
    head: *mut Range,
    /// Owns retirement: unlinked nodes are handed here for deferred drop.
    reclaim: R,
}

// Safety: all shared state inside the list is atomics and locks; the raw
// head pointer is owned by the list for its whole lifetime.
unsafe impl<R: Reclaim> Send for RangeList<R> {}
unsafe impl<R: Reclaim> Sync for RangeList<R> {}

impl<R: Reclaim> RangeList<R> {
    /// Create an empty collection with `nlevel` skip levels.
    pub fn new(nlevel: usize) -> Self {
        assert!(
            (1..=MAX_NLEVEL).contains(&nlevel),
            "nlevel must be in 1..={}",
            MAX_NLEVEL
        );

        let head = Box::into_raw(Box::new(Range::new(0, 0, nlevel)));
        unsafe { (*head).set_curlevel(nlevel) };

        RangeList {
            nlevel,
            head,
            reclaim: R::default(),
        }
    }

    /// Allocate a node for later installation through
    /// [`LockedWindow::replace`].
    ///
    /// The node's level count is drawn geometrically (p = 1/2), clamped to
    /// this collection's `nlevel`. The collection itself never allocates
    /// during a mutation; allocation failures stay on the caller's side of
    /// the window.
    pub fn new_range(&self, key: u64, size: u64) -> Box<Range> {
        assert!(size > 0, "empty interval");
        Box::new(Range::new(key, size, Self::random_level(self.nlevel)))
    }

    pub(crate) fn reclaim(&self) -> &R {
        &self.reclaim
    }

    /// Draw a level count in `1..=nlevel` with geometric decay.
    ///
    /// One RNG call: each trailing one-bit is a won coin flip worth one
    /// extra level.
    #[inline]
    fn random_level(nlevel: usize) -> usize {
        let bits = fastrand::u32(..);
        (1 + (!bits).trailing_zeros() as usize).min(nlevel)
    }

    // =========================================================================
    // Lock-free read path
    // =========================================================================

    /// Find the first node overlapping `[key, key + size)`.
    ///
    /// Lock-free; linearizes at some point during the call. The returned
    /// node may already be logically deleted (its interval was current at
    /// some recent point); callers that only want live nodes filter with
    /// [`Range::deleted`].
    pub fn search(&self, key: u64, size: u64) -> Option<R::RangeRef<'_>> {
        debug_assert!(size > 0);
        let read = R::enter();

        unsafe {
            let n = self.find_pred(key);
            let n = (*n).next(0).load_ptr();
            if !n.is_null() && (*n).key() < key + size {
                Some(R::protect(&read, n))
            } else {
                None
            }
        }
    }

    /// Descend from the top level to the last node whose interval ends at or
    /// before `key`.
    ///
    /// Returns the head when no such node exists. The result may be marked
    /// or stale by the time the caller uses it; locking paths revalidate.
    ///
    /// # Safety
    /// The caller must hold a read section across the call and any use of
    /// the returned pointer.
    unsafe fn find_pred(&self, key: u64) -> *mut Range {
        unsafe {
            let mut e = self.head;
            for l in (0..self.nlevel).rev() {
                loop {
                    let n = (*e).next(l).load_ptr();
                    if n.is_null() || (*n).end() > key {
                        break;
                    }
                    e = n;
                }
            }
            e
        }
    }

    /// Forward iterator over every node on the level-0 chain, including
    /// logically deleted ones.
    ///
    /// Iteration is not linearizable with respect to concurrent windows: it
    /// may observe splices performed after it started. Consumers wanting
    /// only live nodes filter with [`Range::deleted`].
    pub fn iter(&self) -> RangeIter<'_, R> {
        let section = R::enter();
        let first = unsafe { (*self.head).next(0).load_ptr() };
        RangeIter::new(first, ptr::null_mut(), section)
    }

    // =========================================================================
    // Locked write path
    // =========================================================================

    /// Lock the window of nodes overlapping `[key, key + size)`.
    ///
    /// On return the window's predecessor, every overlapping node, and the
    /// successor are locked and validated; see [`LockedWindow`]. Never
    /// fails; internally restarts until the hand-over-hand walk wins.
    pub fn search_lock(&self, key: u64, size: u64) -> LockedWindow<'_, R> {
        assert!(size > 0, "empty query interval");
        let read = R::enter();
        let (prev, succ) = unsafe { self.find_and_lock(&read, key, size) };
        LockedWindow::new(self, key, size, prev, succ, read)
    }

    /// The hand-over-hand protocol behind [`search_lock`].
    ///
    /// Returns `(prev, succ)` where `prev` is the locked last node ending at
    /// or before `key` and `succ` the locked first node starting at or after
    /// `key + size` (null at end of list). Every node between them is locked
    /// and overlaps the query.
    ///
    /// # Safety
    /// `read` must be the section protecting this call; it must outlive the
    /// locks (the window keeps it).
    unsafe fn find_and_lock(
        &self,
        read: &R::Section,
        key: u64,
        size: u64,
    ) -> (*mut Range, *mut Range) {
        unsafe {
            loop {
                // Position a predecessor candidate without locks.
                let prev = self.find_pred(key);

                // Capture the level-0 word and lock against it. Comparing
                // the whole word after acquiring validates both the
                // successor and prev's own deletion mark.
                let expected = (*prev).next(0).load();
                if expected.mark() {
                    continue;
                }
                if !(*prev).lock_if(expected) {
                    continue;
                }

                // A node ending at or before `key` may have been spliced in
                // behind our back between positioning and the word capture.
                let n = expected.as_ptr();
                if !n.is_null() && (*n).end() <= key {
                    (*prev).lock_release();
                    continue;
                }

                // Walk forward, locking each node. The chain from a locked
                // unmarked node cannot change under us, so this part never
                // restarts.
                let mut e = prev;
                let succ = loop {
                    let n = (*e).next(0).load_ptr();
                    if n.is_null() {
                        break ptr::null_mut();
                    }
                    (*n).lock_acquire();
                    if (*n).deleted() {
                        // A marked node still on the chain has no owner;
                        // finish its unlink and re-read the successor.
                        self.unlink_marked(read, e, n);
                        continue;
                    }
                    if (*n).key() >= key + size {
                        break n;
                    }
                    debug_assert!((*n).overlaps(key, size));
                    e = n;
                };

                return (prev, succ);
            }
        }
    }

    // =========================================================================
    // Index maintenance
    // =========================================================================

    /// Splice `node` into level `level`, starting the predecessor search
    /// from `pred_guess` when that node reaches the level.
    ///
    /// Bounded retries: losing every CAS leaves the node on its lower levels
    /// only, degrading lookups for this key but nothing else. Returns
    /// whether the level was linked.
    ///
    /// # Safety
    /// `node` must be linked on every level below `level` and must not reach
    /// `level` yet. `pred_guess` must be the head or a node the caller holds
    /// locked.
    pub(crate) unsafe fn add_index(
        &self,
        level: usize,
        node: *mut Range,
        pred_guess: *mut Range,
    ) -> bool {
        unsafe {
            let key = (*node).key();

            for _ in 0..ADD_INDEX_RETRIES {
                if (*node).deleted() {
                    return false;
                }

                let mut pred = self.level_start(level, pred_guess);
                loop {
                    let word = (*pred).next(level).load();
                    let n = word.as_ptr();
                    if !n.is_null() && (*n).key() < key {
                        pred = n;
                        continue;
                    }
                    if n == node {
                        return true;
                    }
                    if word.mark() {
                        // pred's link at this level is being torn down;
                        // installing behind it would strand the node.
                        break;
                    }

                    (*node).next(level).store(MarkedPtr::new(n, false));
                    let desired = MarkedPtr::new(node, false);
                    if (*pred).next(level).compare_exchange(word, desired).is_ok() {
                        (*node).inc_curlevel();
                        return true;
                    }
                    break;
                }
            }

            false
        }
    }

    /// Unlink `node` from level `level`, in two phases.
    ///
    /// Phase 1 sets the mark on the node's own level-`level` word. A
    /// concurrent `add_index` always CASes against the exact word it read,
    /// so once the mark is up nothing can be installed behind the dying
    /// link, and anything installed before the mark is carried over by the
    /// phase 2 successor read. The mark here is a teardown fence for this
    /// one level; logical deletion remains a level-0 affair.
    ///
    /// Phase 2 splices the node out with a CAS on the predecessor, retrying
    /// with a refreshed predecessor on failure. The node already being
    /// absent from the level counts as success. The caller adjusts
    /// `curlevel` afterwards.
    ///
    /// # Safety
    /// The caller must hold `node`'s lock (only the retiring thread unlinks
    /// a node's levels), and `pred_guess` must be the head or a node the
    /// caller holds locked.
    pub(crate) unsafe fn del_index(&self, level: usize, pred_guess: *mut Range, node: *mut Range) {
        unsafe {
            debug_assert!(level >= 1, "level 0 is unlinked under the window locks");
            let key = (*node).key();

            (*node).next(level).store_mark(true);

            loop {
                let mut pred = self.level_start(level, pred_guess);
                loop {
                    let word = (*pred).next(level).load();
                    let n = word.as_ptr();
                    if n.is_null() {
                        return;
                    }
                    if n == node {
                        if word.mark() {
                            // pred is being unlinked from this level too; its
                            // owner's splice carries our node over. Re-walk
                            // until pred is gone.
                            break;
                        }
                        let succ = (*node).next(level).load_ptr();
                        if (*pred)
                            .next(level)
                            .compare_exchange(word, MarkedPtr::new(succ, false))
                            .is_ok()
                        {
                            return;
                        }
                        // Predecessor moved; refresh from the start.
                        break;
                    }
                    if (*n).key() >= key {
                        // Already off this level.
                        return;
                    }
                    pred = n;
                }
            }
        }
    }

    /// Pick a traversal start for `level`: the guess when it is firmly
    /// linked there, the head otherwise.
    #[inline]
    unsafe fn level_start(&self, level: usize, pred_guess: *mut Range) -> *mut Range {
        unsafe {
            if !pred_guess.is_null() && level < (*pred_guess).curlevel() {
                pred_guess
            } else {
                self.head
            }
        }
    }

    /// Clear a retiring node's index levels, top-down so every level stays a
    /// subsequence of the one below.
    ///
    /// # Safety
    /// The caller must hold `node`'s lock; level 0 is the caller's problem.
    pub(crate) unsafe fn unlink_upper_levels(&self, node: *mut Range) {
        unsafe {
            let top = (*node).curlevel();
            for level in (1..top).rev() {
                self.del_index(level, self.head, node);
                (*node).set_curlevel(level);
            }
        }
    }

    /// Finish unlinking a marked node found during the locked walk, then
    /// retire it.
    ///
    /// # Safety
    /// The caller must hold both locks and the `read` section, `pred` must
    /// be unmarked with `pred.next[0].ptr == node`, and `node` must be
    /// marked.
    unsafe fn unlink_marked(&self, read: &R::Section, pred: *mut Range, node: *mut Range) {
        unsafe {
            debug_assert!((*node).deleted());

            self.unlink_upper_levels(node);

            let succ = (*node).next(0).load_ptr();
            let expected = MarkedPtr::new(node, false);
            if (*pred)
                .next(0)
                .compare_exchange(expected, MarkedPtr::new(succ, false))
                .is_err()
            {
                panic!("INVARIANT VIOLATION: locked predecessor moved during unlink");
            }

            (*node).set_curlevel(0);
            (*node).lock_release();
            self.reclaim.retire(read, RetiredRange::new(node));
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Walk every level and assert the structural invariants.
    ///
    /// Only meaningful under quiescence (no concurrent windows open);
    /// intended for tests and debugging, panics on the first violation.
    pub fn check_invariants(&self) {
        use std::collections::HashMap;

        let _read = R::enter();

        unsafe {
            let mut chains: Vec<Vec<*mut Range>> = Vec::with_capacity(self.nlevel);
            for level in 0..self.nlevel {
                let mut chain = Vec::new();
                let mut last_key = None;
                let mut e = (*self.head).next(level).load_ptr();
                while !e.is_null() {
                    if let Some(k) = last_key {
                        assert!(
                            (*e).key() > k,
                            "level {} not strictly sorted at key {}",
                            level,
                            (*e).key()
                        );
                    }
                    last_key = Some((*e).key());
                    chain.push(e);
                    e = (*e).next(level).load_ptr();
                }
                chains.push(chain);
            }

            // Level 0 carries only live, pairwise disjoint nodes.
            let mut prev_end = 0u64;
            for &e in &chains[0] {
                assert!(!(*e).deleted(), "marked node left on level 0");
                assert!(
                    (*e).key() >= prev_end,
                    "overlapping nodes at level 0 near key {}",
                    (*e).key()
                );
                prev_end = (*e).end();
            }

            // Each level is a subsequence of the level below.
            for level in 1..self.nlevel {
                let mut lower = chains[level - 1].iter();
                for &e in &chains[level] {
                    assert!(
                        lower.any(|&x| x == e),
                        "level {} is not a subsequence of level {}",
                        level,
                        level - 1
                    );
                }
            }

            // curlevel matches the number of levels the node appears on.
            let mut appearances: HashMap<*mut Range, usize> = HashMap::new();
            for chain in &chains {
                for &e in chain {
                    *appearances.entry(e).or_insert(0) += 1;
                }
            }
            for (&e, &count) in &appearances {
                assert_eq!(
                    (*e).curlevel(),
                    count,
                    "curlevel mismatch for key {}",
                    (*e).key()
                );
            }
        }
    }
}

impl<'a, R: Reclaim> IntoIterator for &'a RangeList<R> {
    type Item = R::RangeRef<'a>;
    type IntoIter = RangeIter<'a, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<R: Reclaim> fmt::Debug for RangeList<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _read = R::enter();
        writeln!(f, "RangeList(nlevel={})", self.nlevel)?;
        unsafe {
            for level in (0..self.nlevel).rev() {
                write!(f, "  level {}:", level)?;
                let mut e = (*self.head).next(level).load_ptr();
                while !e.is_null() {
                    let marker = if (*e).deleted() { "~" } else { "" };
                    write!(f, " {}[{}, {})", marker, (*e).key(), (*e).end())?;
                    e = (*e).next(level).load_ptr();
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl<R: Reclaim> Drop for RangeList<R> {
    fn drop(&mut self) {
        // Exclusive access: free the linked chain directly. Nodes retired
        // earlier belong to the reclaimer, which drops after this body.
        unsafe {
            let mut e = (*self.head).next(0).load_ptr();
            while !e.is_null() {
                debug_assert!(!(*e).deleted(), "marked node still linked at drop");
                let next = (*e).next(0).load_ptr();
                Range::dealloc(e);
                e = next;
            }
            Range::dealloc(self.head);
        }
    }
}
