//! The context switcher: one entry point, eight operations.
//!
//! The hardware kernel saved callee-saved registers, picked the next TCB,
//! pointed the TSS at its stack and CR3 at its page directory, and
//! restored. The model keeps the same selection machine over the same
//! operations and updates the per-CPU `current` and loaded-directory
//! fields; a fork or thread_fork child is pre-seeded (its pending
//! ChildStart record) so its first scheduling returns 0 from the syscall
//! with its own tid visible.
//!
//! SEND_MSG is the coupled primitive: enqueue on the manager's inbox and
//! block the caller in one atomic section, so no wakeup can slip between
//! the two.

use crate::bus::{Bus, Message};
use crate::collections::ChainTable;
use crate::scheduler::CpuSched;
use crate::sync::Party;
use crate::task::{Tcb, ThreadState, Tid, KERNEL_PID};

#[derive(Debug)]
pub enum SwitchOp {
    /// Round-robin to the next runnable thread.
    Switch,
    /// Run a freshly created fork child now.
    Fork(Tid),
    /// Run a freshly created thread_fork child now.
    ThreadFork(Tid),
    /// Caller has set itself BLOCKED; pick someone else.
    Block,
    /// Enqueue a thread on its home CPU without switching.
    MakeRunnable(Tid),
    /// Switch directly to a specific thread.
    Resume(Tid),
    /// Yield; a non-negative tid targets that thread on this CPU.
    YieldTo(i32),
    /// Enqueue on the manager inbox and block, atomically.
    SendMsg(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched,
    /// The operation did not change what this CPU runs.
    NoSwitch,
    /// Yield target was not runnable on this CPU.
    YieldMiss,
    /// A wake arrived between publishing BLOCKED and switching; the
    /// block was cancelled and the caller keeps running.
    BlockCancelled,
}

fn tcb_mut(threads: &mut ChainTable<Tcb>, t: Tid) -> &mut Tcb {
    threads.get_mut(t.0).expect("tid missing from thread registry")
}

/// Which side of a run queue's lock the caller holds.
fn party_for(this: usize, home: usize) -> Party {
    if this == home {
        Party::A
    } else {
        Party::B
    }
}

fn requeue_current(cpus: &mut [CpuSched], this: usize, threads: &mut ChainTable<Tcb>) {
    let cur = cpus[this].current;
    if cur == cpus[this].idle {
        return;
    }
    tcb_mut(threads, cur).state = ThreadState::Normal;
    cpus[this].enqueue_tail(cur, Party::A);
}

fn switch_to(cpus: &mut [CpuSched], this: usize, threads: &mut ChainTable<Tcb>, next: Tid) {
    let tcb = tcb_mut(threads, next);
    tcb.state = ThreadState::Normal;
    let pid = tcb.pid;
    cpus[this].current = next;
    // Idle threads run on whatever directory is loaded; everyone else
    // gets their task's directory if it differs.
    if pid != KERNEL_PID && cpus[this].loaded_pd != pid {
        cpus[this].loaded_pd = pid;
    }
}

fn pick_next(cpus: &mut [CpuSched], this: usize) -> Tid {
    cpus[this].get_next(-1, Party::A).unwrap_or(cpus[this].idle)
}

/// The single kernel entry for every switch-shaped operation.
pub fn context_switch(
    cpus: &mut [CpuSched],
    this: usize,
    threads: &mut ChainTable<Tcb>,
    bus: &Bus,
    op: SwitchOp,
) -> SwitchOutcome {
    match op {
        SwitchOp::Switch => {
            requeue_current(cpus, this, threads);
            let next = pick_next(cpus, this);
            switch_to(cpus, this, threads, next);
            SwitchOutcome::Switched
        }

        SwitchOp::Fork(child) | SwitchOp::ThreadFork(child) => {
            requeue_current(cpus, this, threads);
            switch_to(cpus, this, threads, child);
            SwitchOutcome::Switched
        }

        SwitchOp::Block => {
            let cur = cpus[this].current;
            let tcb = tcb_mut(threads, cur);
            if tcb.state != ThreadState::Blocked {
                // MADE_RUNNABLE or WAKEUP landed first; stay put.
                tcb.state = ThreadState::Normal;
                return SwitchOutcome::BlockCancelled;
            }
            let next = pick_next(cpus, this);
            switch_to(cpus, this, threads, next);
            SwitchOutcome::Switched
        }

        SwitchOp::MakeRunnable(t) => {
            let tcb = tcb_mut(threads, t);
            if tcb.state == ThreadState::Normal {
                return SwitchOutcome::NoSwitch;
            }
            tcb.state = ThreadState::Normal;
            let home = tcb.home_cpu;
            cpus[home].enqueue_tail(t, party_for(this, home));
            SwitchOutcome::NoSwitch
        }

        SwitchOp::Resume(t) => {
            requeue_current(cpus, this, threads);
            switch_to(cpus, this, threads, t);
            SwitchOutcome::Switched
        }

        SwitchOp::YieldTo(tid) => {
            if tid < 0 {
                requeue_current(cpus, this, threads);
                let next = pick_next(cpus, this);
                switch_to(cpus, this, threads, next);
                return SwitchOutcome::Switched;
            }
            match cpus[this].get_next(tid, Party::A) {
                None => SwitchOutcome::YieldMiss,
                Some(t) => {
                    requeue_current(cpus, this, threads);
                    switch_to(cpus, this, threads, t);
                    SwitchOutcome::Switched
                }
            }
        }

        SwitchOp::SendMsg(msg) => {
            // Enqueue and block under the same critical section: the
            // manager cannot reply to a thread that has not yet blocked.
            bus.worker_send(msg);
            let cur = cpus[this].current;
            tcb_mut(threads, cur).state = ThreadState::Blocked;
            let next = pick_next(cpus, this);
            switch_to(cpus, this, threads, next);
            SwitchOutcome::Switched
        }
    }
}
