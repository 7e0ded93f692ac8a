//! Concurrent range collections.
//!
//! The centerpiece is [`RangeList`], a lock-free multi-level skip list of
//! disjoint half-open intervals with locked-window splicing. Collections are
//! generic over a [`Reclaim`] memory-reclamation strategy; this crate ships
//! [`DeferredReclaim`] for deterministic tests, the `coral-crossbeam` crate
//! provides the production epoch-based reclaimer.
//!
//! ```ignore
//! use coral_core::{DeferredReclaim, RangeList};
//!
//! let list: RangeList<DeferredReclaim> = RangeList::new(8);
//!
//! let window = list.search_lock(10, 5);
//! window.replace(vec![list.new_range(10, 5)]);
//! drop(window);
//!
//! assert!(list.search(12, 1).is_some());
//! ```

pub(crate) mod internal;
pub mod range_list;
pub mod reclaim;

// Re-exports for convenience
pub use range_list::{LockedWindow, Range, RangeIter, RangeList, RetiredRange, WindowIter, MAX_NLEVEL};
pub use reclaim::{DeferredReclaim, Reclaim};
