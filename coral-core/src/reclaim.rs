//! Memory reclamation behind the range list.
//!
//! Readers follow next pointers without taking locks, so a node spliced out
//! by a writer must stay readable until every reader that could have seen
//! it is gone. [`Reclaim`] is the seam the list expresses that through, and
//! it is shaped by how the list actually calls it:
//!
//! - every operation opens a read-side [`Section`] up front and keeps it
//!   for the whole operation (a locked window keeps one for its lifetime);
//! - the thread that unlinks a node from level 0 wraps it in a
//!   [`RetiredRange`] and hands it to [`retire`] together with that live
//!   section, so implementations never need to re-enter protection on
//!   their own;
//! - [`protect`] upgrades a node pointer found during a section into a
//!   reference the caller may keep after the section ends.
//!
//! [`DeferredReclaim`] below keeps every retired node until the collection
//! drops, which makes destruction timing deterministic for tests. The
//! `coral-crossbeam` crate binds the same seam to crossbeam-epoch for
//! production.
//!
//! [`Section`]: Reclaim::Section
//! [`retire`]: Reclaim::retire
//! [`protect`]: Reclaim::protect

use std::ops::Deref;
use std::sync::Mutex;

use crate::range_list::{Range, RetiredRange};

/// A deferred-reclamation scheme for range nodes.
///
/// # Safety
///
/// An implementation must not drop a [`RetiredRange`] while any section
/// that was live when `retire` accepted it still is; the list dereferences
/// nodes found during a section without further checks. Any scheme with
/// that property fits (epochs, hazard pointers, quiescent-state schemes).
pub unsafe trait Reclaim: Sized + Default + Send + Sync {
    /// Token for one read-side critical section.
    type Section;

    /// A node reference that remains valid after its section ends.
    type RangeRef<'a>: Deref<Target = Range>;

    /// Open a read-side section. Traversal between here and the drop of the
    /// token is protected.
    fn enter() -> Self::Section;

    /// Accept a node the calling thread just unlinked from every level,
    /// scheduling its drop for when no live section can still reach it.
    ///
    /// The section argument witnesses that retirement happens inside a
    /// protected region; implementations may defer directly on it.
    fn retire(&self, section: &Self::Section, node: RetiredRange);

    /// Upgrade a pointer into a reference the caller may keep past the
    /// section it was found under.
    ///
    /// # Safety
    /// `node` must have been read from the collection while `section` was
    /// live.
    unsafe fn protect<'a>(section: &Self::Section, node: *const Range) -> Self::RangeRef<'a>;
}

/// Reclamation that stashes every retired node until it drops.
///
/// Meant for tests: the stash is owned by the collection, so nothing is
/// freed before the collection goes away, references stay valid across any
/// interleaving, and a broken unlink surfaces as the retire-twice panic in
/// [`RetiredRange`] instead of a use-after-free.
#[derive(Default)]
pub struct DeferredReclaim {
    stash: Mutex<Vec<RetiredRange>>,
}

unsafe impl Reclaim for DeferredReclaim {
    /// Stateless: the stash protects everything until the collection drops.
    type Section = ();

    /// Plain references suffice, nothing is reclaimed under them.
    type RangeRef<'a> = &'a Range;

    fn enter() -> Self::Section {}

    fn retire(&self, _section: &Self::Section, node: RetiredRange) {
        self.stash.lock().unwrap().push(node);
    }

    unsafe fn protect<'a>(_section: &Self::Section, node: *const Range) -> &'a Range {
        // Safety: nothing leaves the stash before the collection drops, and
        // the caller ties 'a to the collection borrow.
        unsafe { &*node }
    }
}
