//! Crossbeam-based memory reclamation for coral collections.
//!
//! This crate provides `EpochReclaim`, an implementation of the `Reclaim`
//! seam using crossbeam-epoch. A `RangeList<EpochReclaim>` reclaims
//! spliced-out nodes as soon as every reader that could have seen them has
//! moved on, instead of holding them until the collection drops.
//!
//! # Usage
//!
//! ```ignore
//! use coral_core::RangeList;
//! use coral_crossbeam::EpochReclaim;
//!
//! let list: RangeList<EpochReclaim> = RangeList::new(8);
//! list.search_lock(10, 5).replace(vec![list.new_range(10, 5)]);
//! ```

pub mod epoch_reclaim;

// Export the Reclaim implementation
pub use epoch_reclaim::{EpochRef, EpochReclaim};
