//! Inter-core message bus.
//!
//! One inbox per worker (manager → worker) and a single manager inbox
//! that every worker pushes to. Each queue sits behind its own two-party
//! spinlock (the manager is always party A, the CPU on the other end
//! party B) and send/receive never block: receive is a non-blocking
//! dequeue, polled from scheduler entry points and the manager loop.
//! Queues are fixed-capacity; with at most one outstanding message per
//! thread they cannot overflow.
//!
//! Ordering: pushes from one worker reach the manager in FIFO order, and
//! replies to one worker arrive in the order the manager sent them.

use crate::collections::FixedDeque;
use crate::config::MSGQ_CAP;
use crate::sync::{Party, Spinlock};
use crate::task::{Pid, Tid};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A bus message: who asked, from which CPU, and the request or reply.
#[derive(Debug, Clone)]
pub struct Message {
    pub req_tid: Tid,
    pub req_cpu: usize,
    pub body: MsgBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgBody {
    // ── Worker → manager requests ──
    Fork,
    Wait { status_ptr: u32 },
    Vanish,
    YieldTo { target: Tid },
    Deschedule { reject_ptr: u32 },
    MakeRunnable { target: Tid },
    Print { buf: Vec<u8> },
    Readline { len: usize },
    Getchar,
    SetCursor { row: usize, col: usize },
    GetCursor,
    SetTermColor { color: u8 },
    SetInitPcb { pid: Pid },

    // ── Manager → worker replies ──
    Response { code: i32 },
    ForkResponse { child_pid: i32 },
    WaitResponse { pid: i32, status: i32 },
    LineResponse { line: Vec<u8> },
    CursorResponse { row: usize, col: usize },
    /// Tear down the vanished thread's stack and TCB after the worker
    /// has switched off it.
    VanishBack,
}

/// One spinlocked, fixed-capacity, never-blocking message queue.
pub struct Mailbox {
    q: Spinlock<FixedDeque<Message, MSGQ_CAP>>,
}

impl Mailbox {
    pub const fn new() -> Mailbox {
        Mailbox {
            q: Spinlock::new(FixedDeque::new()),
        }
    }

    pub fn send(&self, party: Party, msg: Message) {
        self.q.lock(party).push_back(msg);
    }

    pub fn recv(&self, party: Party) -> Option<Message> {
        self.q.lock(party).pop_front()
    }

    pub fn len(&self, party: Party) -> usize {
        self.q.lock(party).len()
    }
}

pub struct Bus {
    manager_q: Mailbox,
    worker_qs: Vec<Mailbox>,
    arrived: AtomicUsize,
}

impl Bus {
    pub fn new(n_cpus: usize) -> Bus {
        let mut worker_qs = Vec::with_capacity(n_cpus);
        for _ in 0..n_cpus {
            worker_qs.push(Mailbox::new());
        }
        Bus {
            manager_q: Mailbox::new(),
            worker_qs,
            arrived: AtomicUsize::new(0),
        }
    }

    /// Worker half of a global syscall: push onto the manager's inbox.
    pub fn worker_send(&self, msg: Message) {
        self.manager_q.send(Party::B, msg);
    }

    /// Manager dequeues the next request.
    pub fn manager_recv(&self) -> Option<Message> {
        self.manager_q.recv(Party::A)
    }

    /// Manager pushes a reply (or directive) to a worker's inbox.
    pub fn manager_send(&self, dest_cpu: usize, msg: Message) {
        self.worker_qs[dest_cpu].send(Party::A, msg);
    }

    /// Worker drains its own inbox.
    pub fn worker_recv(&self, cpu: usize) -> Option<Message> {
        self.worker_qs[cpu].recv(Party::B)
    }

    pub fn manager_pending(&self) -> usize {
        self.manager_q.len(Party::A)
    }

    // ── Boot barrier ──

    /// Each CPU checks in once during bring-up.
    pub fn synchronize_arrive(&self) -> usize {
        self.arrived.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn synchronized(&self, total: usize) -> bool {
        self.arrived.load(Ordering::SeqCst) >= total
    }

    /// Spin until everyone has arrived. The manager does this last during
    /// boot; tests also drive it from real threads.
    pub fn wait_synchronized(&self, total: usize) {
        while !self.synchronized(total) {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec;
    use std::thread;

    fn msg(tid: i32, cpu: usize, body: MsgBody) -> Message {
        Message {
            req_tid: Tid(tid),
            req_cpu: cpu,
            body,
        }
    }

    #[test]
    fn requests_arrive_fifo() {
        let bus = Bus::new(3);
        bus.worker_send(msg(1, 1, MsgBody::Fork));
        bus.worker_send(msg(2, 2, MsgBody::Vanish));
        bus.worker_send(msg(3, 1, MsgBody::Getchar));
        assert_eq!(bus.manager_recv().unwrap().req_tid, Tid(1));
        assert_eq!(bus.manager_recv().unwrap().req_tid, Tid(2));
        assert_eq!(bus.manager_recv().unwrap().req_tid, Tid(3));
        assert!(bus.manager_recv().is_none());
    }

    #[test]
    fn replies_go_to_the_right_worker() {
        let bus = Bus::new(3);
        bus.manager_send(1, msg(10, 1, MsgBody::Response { code: 0 }));
        bus.manager_send(2, msg(20, 2, MsgBody::Response { code: 7 }));
        assert!(bus.worker_recv(1).is_some());
        assert!(bus.worker_recv(1).is_none());
        let m = bus.worker_recv(2).unwrap();
        assert_eq!(m.body, MsgBody::Response { code: 7 });
    }

    #[test]
    fn concurrent_worker_pushes_are_not_lost() {
        let bus = Arc::new(Bus::new(2));
        let pusher = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for i in 0..100 {
                    bus.worker_send(msg(i, 1, MsgBody::SetTermColor { color: i as u8 }));
                }
            })
        };
        let mut got = vec![];
        while got.len() < 100 {
            if let Some(m) = bus.manager_recv() {
                got.push(m.req_tid.0);
            } else {
                core::hint::spin_loop();
            }
        }
        pusher.join().unwrap();
        // FIFO from a single worker.
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn synchronize_barrier_counts_everyone() {
        let bus = Arc::new(Bus::new(4));
        let mut handles = vec![];
        for _ in 0..3 {
            let bus = Arc::clone(&bus);
            handles.push(thread::spawn(move || {
                bus.synchronize_arrive();
            }));
        }
        bus.synchronize_arrive();
        bus.wait_synchronized(4);
        for h in handles {
            h.join().unwrap();
        }
        assert!(bus.synchronized(4));
    }
}
