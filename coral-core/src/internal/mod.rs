//! Internal building blocks: marked pointer words and the per-node spin lock.

mod marked_ptr;
mod spin_lock;

pub(crate) use marked_ptr::{AtomicMarkedPtr, MarkedPtr};
pub(crate) use spin_lock::SpinLock;
