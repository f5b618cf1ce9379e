//! Per-CPU scheduler state.
//!
//! One FIFO runnable queue per CPU behind a two-party spinlock (the
//! owning CPU is party A; the manager, which promotes yield targets and
//! enqueues fork children, is party B). Queue entries are tids with
//! inline storage, so scheduling never calls the allocator. An empty
//! queue schedules the per-CPU idle thread.

pub mod context;

use crate::collections::{FixedDeque, PrioQueue};
use crate::config::{RUNQ_CAP, SLEEPQ_CAP};
use crate::sync::{Party, Spinlock};
use crate::task::{Pid, Tid};

pub use context::{context_switch, SwitchOp, SwitchOutcome};

pub struct CpuSched {
    pub id: usize,
    runq: Spinlock<FixedDeque<Tid, RUNQ_CAP>>,
    /// The thread this CPU is executing.
    pub current: Tid,
    /// Runs when the queue is empty; never enqueued itself.
    pub idle: Tid,
    /// Sleeping threads keyed by wakeup tick.
    pub sleepq: PrioQueue<Tid, SLEEPQ_CAP>,
    /// Local timer ticks.
    pub ticks: u64,
    /// Which task's page directory is loaded (the CR3 image).
    pub loaded_pd: Pid,
}

impl CpuSched {
    pub fn new(id: usize, idle: Tid) -> CpuSched {
        CpuSched {
            id,
            runq: Spinlock::new(FixedDeque::new()),
            current: idle,
            idle,
            sleepq: PrioQueue::new(),
            ticks: 0,
            loaded_pd: Pid(0),
        }
    }

    /// Append a runnable thread. The caller is responsible for having
    /// set the thread's state to NORMAL first.
    pub fn enqueue_tail(&self, t: Tid, party: Party) {
        self.runq.lock(party).push_back(t);
    }

    /// Put a thread at the head, ahead of round-robin order (the
    /// manager's yield-to-TID promotion).
    pub fn enqueue_head(&self, t: Tid, party: Party) {
        self.runq.lock(party).push_front(t);
    }

    /// Next thread to run. `mode < 0` pops the head; otherwise the queue
    /// is searched for that tid, and `None` means it was not runnable
    /// here.
    pub fn get_next(&self, mode: i32, party: Party) -> Option<Tid> {
        let mut q = self.runq.lock(party);
        if mode < 0 {
            q.pop_front()
        } else {
            q.remove_where(|t| t.0 == mode)
        }
    }

    pub fn runq_contains(&self, t: Tid, party: Party) -> bool {
        self.runq.lock(party).contains(&t)
    }

    pub fn runq_len(&self, party: Party) -> usize {
        self.runq.lock(party).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_and_targeted_dequeue() {
        let cpu = CpuSched::new(1, Tid(100));
        cpu.enqueue_tail(Tid(1), Party::A);
        cpu.enqueue_tail(Tid(2), Party::A);
        cpu.enqueue_tail(Tid(3), Party::A);
        assert_eq!(cpu.get_next(-1, Party::A), Some(Tid(1)));
        assert_eq!(cpu.get_next(3, Party::A), Some(Tid(3)));
        assert_eq!(cpu.get_next(3, Party::A), None);
        assert_eq!(cpu.get_next(-1, Party::A), Some(Tid(2)));
        assert_eq!(cpu.get_next(-1, Party::A), None);
    }

    #[test]
    fn head_promotion_beats_fifo() {
        let cpu = CpuSched::new(1, Tid(100));
        cpu.enqueue_tail(Tid(1), Party::A);
        cpu.enqueue_head(Tid(9), Party::B);
        assert_eq!(cpu.get_next(-1, Party::A), Some(Tid(9)));
        assert_eq!(cpu.get_next(-1, Party::A), Some(Tid(1)));
    }
}
