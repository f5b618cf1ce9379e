//! Kernel collections.
//!
//! Everything the scheduler or an interrupt path touches must never call
//! the allocator, so the deque and the priority queue keep their storage
//! inline at a fixed capacity. The hashtable is the one collection allowed
//! to allocate (it backs the pid and tid registries, which only grow from
//! syscall context).

pub mod deque;
pub mod hashtable;
pub mod prio;

pub use deque::FixedDeque;
pub use hashtable::ChainTable;
pub use prio::PrioQueue;
