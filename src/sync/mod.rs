//! Kernel synchronization primitives.
//!
//! [`spinlock`] is the busy-waiting lock shared between exactly two
//! parties (a CPU's own context and the manager, or thread context and
//! interrupt context). [`mutex`] is the blocking lock layered over the
//! scheduler. Spinlocks never nest inside a mutex's critical section the
//! other way around: a mutex acquire may take a spinlock, never the
//! reverse.

pub mod mutex;
pub mod spinlock;

pub use mutex::{LockOutcome, Mutex, MUTEX_AVAILABLE, MUTEX_DESTROYED};
pub use spinlock::{Party, SpinGuard, Spinlock};
