//! Thread and task control blocks.
//!
//! Tasks name their parents by pid; the kernel resolves pids and tids
//! through the registry hashtables, never through stored pointers. Each
//! task preallocates its own exit-status record at creation so that
//! vanish can never fail for lack of memory, and each fork reserves the
//! slot the child's record will eventually occupy in the parent's zombie
//! list for the same reason.

use crate::bus::Message;
use crate::collections::FixedDeque;
use crate::config::{K_STACK_SIZE, WAITQ_CAP};
use crate::memory::paging::PageDir;
use crate::memory::FaultCode;
use crate::sync::Mutex;
use alloc::collections::VecDeque;
use alloc::string::String;
use core::fmt;

/// Exit status installed for a task killed by an unhandled fault.
pub const KILLED_STATUS: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kernel's own pid: owner of the idle threads, parent of init.
pub const KERNEL_PID: Pid = Pid(0);

/// Thread state machine.
///
/// `MadeRunnable` and `Wakeup` mark a thread that was targeted by a wake
/// between publishing `Blocked` and actually switching away; the block
/// then cancels instead of stranding the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Normal,
    Blocked,
    MadeRunnable,
    Wakeup,
}

/// A zombie child's exit record, preallocated at task creation and handed
/// to the parent at vanish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: Pid,
    pub status: i32,
}

/// Per-task wait bookkeeping, guarded by its own mutex.
pub struct WaitState {
    pub num_alive: usize,
    pub num_zombie: usize,
    /// Parked WAIT requests, replied to as children vanish.
    pub waiters: FixedDeque<Message, WAITQ_CAP>,
    pub mtx: Mutex,
}

impl WaitState {
    fn new() -> WaitState {
        WaitState {
            num_alive: 0,
            num_zombie: 0,
            waiters: FixedDeque::new(),
            mtx: Mutex::new(),
        }
    }
}

/// Task control block.
pub struct Pcb {
    pub pid: Pid,
    pub parent: Pid,
    pub name: String,
    pub pd: PageDir,
    /// This task's own exit record; taken exactly once, at final vanish.
    pub exit_record: Option<ExitStatus>,
    /// Exit records of vanished children not yet reaped.
    pub zombies: VecDeque<ExitStatus>,
    pub wait: WaitState,
    /// Live threads in this task.
    pub live_threads: usize,
    /// Where the loader put the text entry point.
    pub entry: u32,
}

impl Pcb {
    pub fn new(pid: Pid, parent: Pid, name: String, pd: PageDir, entry: u32) -> Pcb {
        Pcb {
            pid,
            parent,
            name,
            pd,
            exit_record: Some(ExitStatus { pid, status: 0 }),
            zombies: VecDeque::new(),
            wait: WaitState::new(),
            live_threads: 1,
            entry,
        }
    }

    /// Dead and waiting to be reaped: no threads, record already handed
    /// to the parent.
    pub fn is_zombie(&self) -> bool {
        self.live_threads == 0
    }
}

/// A registered software exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwexnReg {
    pub esp3: u32,
    pub eip: u32,
    pub arg: u32,
}

/// What the kernel would have pushed onto the handler stack; the model
/// records it for the driver instead of executing user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwexnDelivery {
    pub fault_va: u32,
    pub code: FaultCode,
    pub handler_eip: u32,
    pub arg: u32,
}

/// The second half of a suspended operation, run when the thread is next
/// scheduled on its origin CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Fresh fork/thread_fork child: return 0 from the syscall.
    ChildStart,
    /// Generic RESPONSE carrying the return code.
    Reply,
    /// FORK_RESPONSE carrying the child pid.
    ForkReply,
    /// WAIT_RESPONSE; write the status word before returning the pid.
    WaitReply { status_ptr: u32 },
    /// Line delivery; copy into the user buffer, return the byte count.
    ReadlineReply { buf: u32, len: usize },
    /// Single-character delivery.
    GetcharReply,
    /// Cursor query; write both coordinates.
    CursorReply { row_ptr: u32, col_ptr: u32 },
    /// Timed sleep expired.
    SleepDone,
}

/// Kernel-stack accounting. Stacks are `K_STACK_SIZE` bytes, aligned to
/// their size; the original found the TCB by masking any in-stack
/// address, which the registry lookup replaces here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    pub base: u32,
}

impl KernelStack {
    pub fn new(base: u32) -> KernelStack {
        debug_assert_eq!(base as usize % K_STACK_SIZE, 0, "misaligned kernel stack");
        KernelStack { base }
    }

    pub fn top(&self) -> u32 {
        self.base + K_STACK_SIZE as u32
    }
}

/// Thread control block.
pub struct Tcb {
    pub tid: Tid,
    pub pid: Pid,
    /// The CPU whose scheduler owns this thread.
    pub home_cpu: usize,
    pub state: ThreadState,
    /// Last syscall result, valid while `has_result` is set.
    pub result: i32,
    pub has_result: bool,
    /// Second half to run when next scheduled.
    pub pending: Option<Pending>,
    /// The reply parked for this thread; at most one outstanding.
    pub msg: Option<Message>,
    pub swexn: Option<SwexnReg>,
    /// Most recent delivery, observable by the driver.
    pub last_swexn: Option<SwexnDelivery>,
    pub kstack: KernelStack,
}

impl Tcb {
    pub fn new(tid: Tid, pid: Pid, home_cpu: usize, kstack: KernelStack) -> Tcb {
        Tcb {
            tid,
            pid,
            home_cpu,
            state: ThreadState::Normal,
            result: 0,
            has_result: false,
            pending: None,
            msg: None,
            swexn: None,
            last_swexn: None,
            kstack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::K_STACK_SIZE;

    #[test]
    fn exit_record_is_preallocated_and_single_use() {
        let mut pcb = Pcb::new(Pid(5), Pid(1), String::from("spawn"), PageDir::new(), 0);
        let rec = pcb.exit_record.take().unwrap();
        assert_eq!(rec.pid, Pid(5));
        assert!(pcb.exit_record.is_none());
    }

    #[test]
    fn kernel_stack_top_is_size_above_base() {
        let ks = KernelStack::new(0x0010_0000);
        assert_eq!(ks.top(), 0x0010_0000 + K_STACK_SIZE as u32);
    }

    #[test]
    fn new_tcb_is_runnable_with_no_result() {
        let t = Tcb::new(Tid(3), Pid(2), 1, KernelStack::new(0x0010_2000));
        assert_eq!(t.state, ThreadState::Normal);
        assert!(!t.has_result);
        assert!(t.msg.is_none() && t.pending.is_none());
    }
}
