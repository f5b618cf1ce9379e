//! Two-party spinlock with direct hand-off.
//!
//! The lock word is an exchanged `available` flag; on top of it each of
//! the two parties has a `waiting` slot. Unlock first looks at the other
//! party's slot: if it is set, ownership is handed over directly (the
//! `available` word never becomes 1), which bounds waiting to at most one
//! foreign critical section between successive acquisitions by the same
//! party. Non-recursive.
//!
//! Interrupt discipline: any lock taken in both interrupt and thread
//! context must be held with interrupts disabled on the local CPU. The
//! model applies that at the interrupt-context entry points (the timer
//! trap clears the modeled IF flag via `Machine::irq_save` around its
//! queue work and restores it afterward) instead of threading a
//! disable-interrupts flag through every acquisition: the deterministic
//! driver runs each trap to completion, so an interrupt can never land
//! inside a critical section held on the same CPU.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, Ordering};

/// Which side of the lock the caller is. Each lock instance is shared by
/// exactly two roles; the owner role is `A`, the remote (usually the
/// manager CPU) is `B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    A = 0,
    B = 1,
}

impl Party {
    fn other(self) -> usize {
        1 - self as usize
    }
}

pub struct Spinlock<T> {
    available: AtomicI32,
    waiting: [AtomicI32; 2],
    data: UnsafeCell<T>,
}

// SAFETY: the lock protocol grants exclusive access to `data` before a
// guard is handed out, so sharing across host threads is sound for any
// T that can move between them.
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Spinlock {
            available: AtomicI32::new(1),
            waiting: [AtomicI32::new(0), AtomicI32::new(0)],
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire as `party`, busy-waiting until granted.
    pub fn lock(&self, party: Party) -> SpinGuard<'_, T> {
        let me = party as usize;
        self.waiting[me].store(1, Ordering::SeqCst);
        loop {
            // A direct grant from the other party's unlock clears our
            // waiting slot; the lock is ours and `available` stays 0.
            if self.waiting[me].load(Ordering::SeqCst) == 0 {
                break;
            }
            if self.available.swap(0, Ordering::SeqCst) == 1 {
                self.waiting[me].store(0, Ordering::SeqCst);
                break;
            }
            core::hint::spin_loop();
        }
        SpinGuard { lock: self, party }
    }

    /// Exclusive access without locking; usable before the lock is shared.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self, party: Party) {
        // Hand off to the other party if it is spinning; otherwise open
        // the lock for whoever arrives next.
        if self.waiting[party.other()].swap(0, Ordering::SeqCst) == 1 {
            return;
        }
        self.available.store(1, Ordering::SeqCst);
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
    party: Party,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.party);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::thread;

    #[test]
    fn uncontended_lock_unlock() {
        let l = Spinlock::new(5u32);
        {
            let mut g = l.lock(Party::A);
            *g += 1;
        }
        assert_eq!(*l.lock(Party::B), 6);
    }

    #[test]
    fn mutual_exclusion_between_two_threads() {
        let lock = Arc::new(Spinlock::new(0u64));
        let mut handles = Vec::new();
        for party in [Party::A, Party::B] {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..50_000 {
                    let mut g = lock.lock(party);
                    // Non-atomic read-modify-write; any lost update means
                    // two holders were inside at once.
                    let v = *g;
                    *g = v + 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(Party::A), 100_000);
    }

    #[test]
    fn direct_grant_keeps_available_closed() {
        // After a hand-off the available word must still read 0: the
        // ownership moved, it was never released.
        let l: Spinlock<()> = Spinlock::new(());
        let g = l.lock(Party::A);
        l.waiting[1].store(1, Ordering::SeqCst); // B spins
        drop(g);
        assert_eq!(l.waiting[1].load(Ordering::SeqCst), 0, "B was granted");
        assert_eq!(l.available.load(Ordering::SeqCst), 0, "no open window");
        // B (conceptually holding it now) unlocks with nobody waiting.
        l.unlock(Party::B);
        assert_eq!(l.available.load(Ordering::SeqCst), 1);
    }
}
