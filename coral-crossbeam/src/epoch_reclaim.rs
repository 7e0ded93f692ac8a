//! Epoch-based reclamation using crossbeam-epoch.
//!
//! The list's calling contract keeps this binding small. Every operation
//! already holds a pinned section for its whole duration and passes it to
//! `retire`, so retirement defers directly on the caller's pin instead of
//! taking one of its own. Only `protect` pins again: the reference it hands
//! out has to stay valid after the operation's own section unpins.

use std::ops::Deref;

use coral_core::range_list::{Range, RetiredRange};
use coral_core::reclaim::Reclaim;
use crossbeam_epoch::{self as epoch, Guard as CrossbeamGuard};

/// Reclamation through the global crossbeam-epoch collector.
///
/// Zero-sized: the collector keeps all state. A node retired during some
/// pin is dropped only after every thread has moved past that pin's epoch,
/// which is exactly the window the list's lock-free readers rely on.
#[derive(Clone, Copy, Default)]
pub struct EpochReclaim;

/// A range reference carrying its own pin.
///
/// Returned by searches and iteration on a `RangeList<EpochReclaim>`. The
/// embedded pin keeps the node readable for as long as the reference is
/// held, even once the node has been spliced out and retired; its interval
/// and deletion flag stay observable throughout.
pub struct EpochRef<'a> {
    _pin: CrossbeamGuard,
    node: &'a Range,
}

impl Deref for EpochRef<'_> {
    type Target = Range;

    fn deref(&self) -> &Range {
        self.node
    }
}

impl std::fmt::Debug for EpochRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EpochRef({:?})", self.node)
    }
}

unsafe impl Reclaim for EpochReclaim {
    type Section = CrossbeamGuard;

    type RangeRef<'a> = EpochRef<'a>;

    fn enter() -> Self::Section {
        epoch::pin()
    }

    fn retire(&self, section: &Self::Section, node: RetiredRange) {
        // Safety: `node` owns the range and dropping it frees the memory.
        // The collector runs the closure only after every pin live right
        // now, the caller's section included, has been released, which is
        // the Reclaim contract. The handle is Send, so whichever thread
        // ends up collecting may run the drop.
        unsafe {
            section.defer_unchecked(move || drop(node));
        }
    }

    unsafe fn protect<'a>(_section: &Self::Section, node: *const Range) -> EpochRef<'a> {
        // A fresh pin, nested under the caller's still-live section, rides
        // along with the reference so it can outlive the operation.
        EpochRef {
            _pin: epoch::pin(),
            node: unsafe { &*node },
        }
    }
}
