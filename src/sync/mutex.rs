//! Blocking mutex layered over the scheduler.
//!
//! The holder field records who owns the lock (a tid), `-1` for
//! available, `-2` for destroyed. A contended `lock` enqueues the caller
//! and reports [`LockOutcome::MustBlock`]; the caller then sets its own
//! thread state to BLOCKED and descends into the context switcher, which
//! is what makes the enqueue-and-block pair atomic with respect to the
//! waking side. `unlock` hands the lock to the head waiter directly: a
//! waiting thread never observes the mutex available, so there is no
//! thundering herd and no barging past the queue.

use crate::collections::FixedDeque;
use crate::config::WAITQ_CAP;
use crate::sync::spinlock::{Party, Spinlock};
use crate::task::Tid;

pub const MUTEX_AVAILABLE: i32 = -1;
pub const MUTEX_DESTROYED: i32 = -2;

/// What the caller must do after asking for the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock is held by the caller; proceed.
    Acquired,
    /// The caller was queued; it must block via the context switcher and
    /// will own the lock when it is made runnable again.
    MustBlock,
}

#[derive(Debug)]
struct MutexInner {
    holder: i32,
    waiters: FixedDeque<Tid, WAITQ_CAP>,
}

pub struct Mutex {
    inner: Spinlock<MutexInner>,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            inner: Spinlock::new(MutexInner {
                holder: MUTEX_AVAILABLE,
                waiters: FixedDeque::new(),
            }),
        }
    }

    /// Try to take the lock for thread `me`.
    ///
    /// A thread that was handed the lock by an unlocker (holder already
    /// equals `me`) gets `Acquired` without touching the queue; that is
    /// the resume path after a `MustBlock`.
    pub fn lock(&self, me: Tid) -> LockOutcome {
        let mut inner = self.inner.lock(Party::A);
        debug_assert!(inner.holder != MUTEX_DESTROYED, "lock on destroyed mutex");
        if inner.holder == MUTEX_AVAILABLE {
            inner.holder = me.0;
            LockOutcome::Acquired
        } else if inner.holder == me.0 {
            LockOutcome::Acquired
        } else {
            inner.waiters.push_back(me);
            LockOutcome::MustBlock
        }
    }

    /// Release the lock held by `me`. If a waiter exists the lock is
    /// handed to it and its tid is returned so the caller can issue the
    /// make-runnable; otherwise the mutex becomes available.
    pub fn unlock(&self, me: Tid) -> Option<Tid> {
        let mut inner = self.inner.lock(Party::A);
        debug_assert_eq!(inner.holder, me.0, "unlock by non-holder");
        match inner.waiters.pop_front() {
            Some(next) => {
                inner.holder = next.0;
                Some(next)
            }
            None => {
                inner.holder = MUTEX_AVAILABLE;
                None
            }
        }
    }

    /// Mark the mutex unusable. Only legal when nobody holds or waits.
    pub fn destroy(&self) -> bool {
        let mut inner = self.inner.lock(Party::A);
        if inner.holder == MUTEX_AVAILABLE && inner.waiters.is_empty() {
            inner.holder = MUTEX_DESTROYED;
            true
        } else {
            false
        }
    }

    pub fn holder(&self) -> i32 {
        self.inner.lock(Party::A).holder
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex").field("holder", &self.holder()).finish()
    }
}
