//! Physical-frame allocator: a reservation counter in front of a
//! segment-tree free index.
//!
//! Callers `reserve` the frames a whole operation will need before any
//! structural change, so overcommit fails early and cleanly; `get_raw`
//! then hands out individual frames only at mapping time. A ZFOD page
//! holds a reservation but no raw frame until its first touch.

use crate::config::{PAGE_SIZE, USER_MEM_START};
use crate::errors::KernErr;
use crate::sync::Mutex;
use crate::task::Tid;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, Ordering};

/// Segment tree over frame indices [0, n): each inner node records
/// whether any leaf below it is free, so the least free index is found by
/// walking left-first from the root.
#[derive(Debug)]
struct SegTree {
    cap: usize,
    n: usize,
    free: Vec<bool>,
    used: usize,
}

impl SegTree {
    fn new(n: usize) -> SegTree {
        let cap = n.next_power_of_two().max(1);
        let mut free = vec![false; 2 * cap];
        for i in 0..n {
            free[cap + i] = true;
        }
        for i in (1..cap).rev() {
            free[i] = free[2 * i] || free[2 * i + 1];
        }
        SegTree { cap, n, free, used: 0 }
    }

    fn pull_up(&mut self, leaf: usize) {
        let mut i = leaf / 2;
        while i >= 1 {
            self.free[i] = self.free[2 * i] || self.free[2 * i + 1];
            i /= 2;
        }
    }

    /// Least free index, marked used.
    fn get_next(&mut self) -> Option<usize> {
        if !self.free[1] {
            return None;
        }
        let mut i = 1;
        while i < self.cap {
            i = if self.free[2 * i] { 2 * i } else { 2 * i + 1 };
        }
        self.free[i] = false;
        self.pull_up(i);
        self.used += 1;
        Some(i - self.cap)
    }

    fn put_back(&mut self, idx: usize) {
        debug_assert!(idx < self.n);
        let leaf = self.cap + idx;
        debug_assert!(!self.free[leaf], "double free of frame {}", idx);
        self.free[leaf] = true;
        self.pull_up(leaf);
        self.used -= 1;
    }
}

pub struct FramePool {
    lock: Mutex,
    tree: spin::Mutex<SegTree>,
    free_frames: AtomicI64,
    capacity: usize,
}

impl FramePool {
    pub fn new(n: usize) -> FramePool {
        FramePool {
            lock: Mutex::new(),
            tree: spin::Mutex::new(SegTree::new(n)),
            free_frames: AtomicI64::new(n as i64),
            capacity: n,
        }
    }

    /// Commit `k` frames to a caller before any are physically taken.
    pub fn reserve(&self, k: usize) -> Result<(), KernErr> {
        let prev = self.free_frames.fetch_sub(k as i64, Ordering::SeqCst);
        if prev - (k as i64) < 0 {
            self.free_frames.fetch_add(k as i64, Ordering::SeqCst);
            return Err(KernErr::NotEnoughMem);
        }
        Ok(())
    }

    pub fn unreserve(&self, k: usize) {
        self.free_frames.fetch_add(k as i64, Ordering::SeqCst);
    }

    /// Take one raw frame. The caller must already hold a reservation
    /// for it; running the tree dry here means a reservation leaked.
    pub fn get_raw(&self, me: Tid) -> Result<u32, KernErr> {
        self.lock.lock(me);
        let idx = self.tree.lock().get_next();
        self.lock.unlock(me);
        match idx {
            Some(i) => Ok(USER_MEM_START + (i * PAGE_SIZE) as u32),
            None => Err(KernErr::NotEnoughMem),
        }
    }

    /// Return a raw frame to the index. Does not touch the reservation
    /// counter; pair with `unreserve` when the logical use ends too.
    pub fn free_raw(&self, me: Tid, base: u32) {
        let idx = (base - USER_MEM_START) as usize / PAGE_SIZE;
        self.lock.lock(me);
        self.tree.lock().put_back(idx);
        self.lock.unlock(me);
    }

    /// Unreserved frames remaining.
    pub fn free_count(&self) -> i64 {
        self.free_frames.load(Ordering::SeqCst)
    }

    /// Frames physically handed out.
    pub fn in_use(&self) -> usize {
        self.tree.lock().used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: Tid = Tid(1);

    #[test]
    fn get_next_returns_least_free_index() {
        let pool = FramePool::new(8);
        pool.reserve(3).unwrap();
        let a = pool.get_raw(ME).unwrap();
        let b = pool.get_raw(ME).unwrap();
        let c = pool.get_raw(ME).unwrap();
        assert_eq!(a, USER_MEM_START);
        assert_eq!(b, USER_MEM_START + PAGE_SIZE as u32);
        assert_eq!(c, USER_MEM_START + 2 * PAGE_SIZE as u32);

        pool.free_raw(ME, b);
        // Least free index is reused first.
        assert_eq!(pool.get_raw(ME).unwrap(), b);
    }

    #[test]
    fn reserve_fails_before_any_structural_change() {
        let pool = FramePool::new(4);
        assert_eq!(pool.reserve(5), Err(KernErr::NotEnoughMem));
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.reserve(4).is_ok());
        assert_eq!(pool.reserve(1), Err(KernErr::NotEnoughMem));
        pool.unreserve(4);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn permutation_invariant_over_get_put_sequences() {
        let pool = FramePool::new(16);
        pool.reserve(16).unwrap();
        let mut held: Vec<u32> = (0..16).map(|_| pool.get_raw(ME).unwrap()).collect();
        assert!(pool.get_raw(ME).is_err());
        assert_eq!(pool.in_use(), 16);

        // Return every other frame, take them back, and make sure the
        // in-use multiset is exactly the frames we hold.
        for i in (0..16).step_by(2) {
            pool.free_raw(ME, held[i]);
        }
        assert_eq!(pool.in_use(), 8);
        for i in (0..16).step_by(2) {
            held[i] = pool.get_raw(ME).unwrap();
        }
        held.sort_unstable();
        held.dedup();
        assert_eq!(held.len(), 16);
        assert_eq!(pool.in_use(), 16);
    }

    #[test]
    fn tree_exhaustion_is_reported() {
        let pool = FramePool::new(1);
        pool.reserve(1).unwrap();
        assert!(pool.get_raw(ME).is_ok());
        assert_eq!(pool.get_raw(ME), Err(KernErr::NotEnoughMem));
    }
}
