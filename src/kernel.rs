//! The kernel value: every subsystem threaded together, plus the trap
//! surface the driver (tests, demos) injects work through.
//!
//! CPU 0 is the manager; it owns the console, the pid registry mutations,
//! and the deschedule queue, and it executes global syscalls serially as
//! messages drained by [`Kernel::manager_step`]. Workers run user
//! threads; their inboxes are drained at scheduler entry points
//! ([`Kernel::trap_timer`], [`Kernel::worker_poll`]).

use crate::bus::{Bus, Message, MsgBody};
use crate::collections::ChainTable;
use crate::config::{
    KernelConfig, K_STACK_SIZE, MANAGER_CPU, TASK_TABLE_BUCKETS, THREAD_TABLE_BUCKETS,
};
use crate::errors::{errno, KernErr};
use crate::klog;
use crate::loader::RamDisk;
use crate::machine::Machine;
use crate::memory::paging::page_base;
use crate::memory::{vm, FaultCode, FramePool, Pte};
use crate::scheduler::{context_switch, CpuSched, SwitchOp, SwitchOutcome};
use crate::sync::{Mutex, Party};
use crate::task::{
    KernelStack, Pcb, Pending, SwexnDelivery, Tcb, ThreadState, Tid, KERNEL_PID, KILLED_STATUS,
    Pid,
};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};
use log::LevelFilter;

/// Kernel stacks are carved from this kernel-region base.
const KSTACK_REGION_BASE: u32 = 0x0020_0000;

/// How a trapped syscall left the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Finished on the calling CPU; the value is the syscall result.
    Complete(i32),
    /// The thread blocked (global syscall, sleep, contended lock); its
    /// result arrives via [`Kernel::take_result`] once it has run again.
    Suspended,
}

pub struct Kernel {
    pub(crate) cfg: KernelConfig,
    pub machine: Machine,
    pub(crate) frames: FramePool,
    pub(crate) bus: Bus,
    pub(crate) cpus: Vec<CpuSched>,
    pub(crate) tasks: ChainTable<Pcb>,
    pub(crate) threads: ChainTable<Tcb>,
    next_pid: AtomicI32,
    next_tid: AtomicI32,
    pub(crate) init_pid: Option<Pid>,
    /// Manager-side queue of parked deschedule requests, and its mutex.
    pub(crate) desched_mtx: Mutex,
    pub(crate) desched_q: Vec<Message>,
    /// Manager-side FIFO of blocked console readers.
    pub(crate) console_waiters: Vec<Message>,
    pub(crate) ramdisk: RamDisk,
    /// Round-robin target for placing fork children.
    pub(crate) fork_next_cpu: usize,
    /// Lock-holder identity for work done in manager context.
    pub(crate) manager_tid: Tid,
    kstack_next: u32,
    kstack_free: Vec<u32>,
}

impl Kernel {
    /// Bring the machine up: frame pool, bus, per-CPU schedulers with
    /// their idle threads, and the boot barrier. Configuration errors
    /// are boot-time invariant violations and fatal.
    pub fn boot(cfg: KernelConfig) -> Kernel {
        assert!(cfg.validate(), "invalid kernel configuration");
        klog::init(LevelFilter::Info);

        let machine = Machine::new(cfg.n_cpus, cfg.user_frames);
        let frames = FramePool::new(cfg.user_frames);
        let bus = Bus::new(cfg.n_cpus);
        let ramdisk = RamDisk::new(cfg.ramdisk.clone());

        let mut kern = Kernel {
            machine,
            frames,
            bus,
            cpus: Vec::new(),
            tasks: ChainTable::new(TASK_TABLE_BUCKETS),
            threads: ChainTable::new(THREAD_TABLE_BUCKETS),
            next_pid: AtomicI32::new(1),
            next_tid: AtomicI32::new(1),
            init_pid: None,
            desched_mtx: Mutex::new(),
            desched_q: Vec::new(),
            console_waiters: Vec::new(),
            ramdisk,
            fork_next_cpu: 1,
            manager_tid: Tid(0),
            kstack_next: KSTACK_REGION_BASE,
            kstack_free: Vec::new(),
            cfg,
        };

        for id in 0..kern.cfg.n_cpus {
            let idle = kern.alloc_tid();
            let ks = kern.alloc_kstack();
            kern.threads.insert(idle.0, Tcb::new(idle, KERNEL_PID, id, ks));
            kern.cpus.push(CpuSched::new(id, idle));
            kern.bus.synchronize_arrive();
        }
        kern.bus.wait_synchronized(kern.cfg.n_cpus);
        kern.manager_tid = kern.cpus[MANAGER_CPU].idle;

        log::info!(
            target: "kernel",
            "up: {} cpus ({} workers), {} user frames",
            kern.cfg.n_cpus,
            kern.cfg.n_cpus - 1,
            kern.cfg.user_frames
        );
        kern
    }

    // ── Id and stack allocation ──

    pub(crate) fn alloc_pid(&self) -> Pid {
        Pid(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn alloc_tid(&self) -> Tid {
        Tid(self.next_tid.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn alloc_kstack(&mut self) -> KernelStack {
        if let Some(base) = self.kstack_free.pop() {
            return KernelStack::new(base);
        }
        let base = self.kstack_next;
        self.kstack_next += K_STACK_SIZE as u32;
        KernelStack::new(base)
    }

    pub(crate) fn free_kstack(&mut self, ks: KernelStack) {
        self.kstack_free.push(ks.base);
    }

    /// Register a new thread of `pid` homed on `cpu`.
    pub(crate) fn create_thread(&mut self, pid: Pid, cpu: usize) -> Tid {
        let tid = self.alloc_tid();
        let ks = self.alloc_kstack();
        self.threads.insert(tid.0, Tcb::new(tid, pid, cpu, ks));
        tid
    }

    /// Single entry to the context switcher for this CPU.
    pub(crate) fn cswitch(&mut self, cpu: usize, op: SwitchOp) -> SwitchOutcome {
        context_switch(&mut self.cpus, cpu, &mut self.threads, &self.bus, op)
    }

    // ── Boot-time task creation ──

    /// Load the first user task onto a worker CPU and register it as
    /// init through the bus, the way the hardware kernel does once the
    /// image is in memory.
    pub fn spawn_init(&mut self, name: &str, cpu: usize) -> Result<(Pid, Tid), i32> {
        assert!(cpu != MANAGER_CPU && cpu < self.cfg.n_cpus, "init runs on a worker");
        let me = self.manager_tid;
        let img = crate::loader::load_task(&self.ramdisk, &self.frames, &mut self.machine, me, name)?;
        let pid = self.alloc_pid();
        let pcb = Pcb::new(pid, KERNEL_PID, String::from(name), img.pd, img.entry);
        self.tasks.insert(pid.0, pcb);
        let tid = self.create_thread(pid, cpu);
        self.cpus[cpu].enqueue_tail(tid, Party::B);
        self.bus.worker_send(Message {
            req_tid: me,
            req_cpu: MANAGER_CPU,
            body: MsgBody::SetInitPcb { pid },
        });
        self.manager_run();
        log::info!(target: "kernel", "loaded '{}' as task {} (thread {})", name, pid, tid);
        Ok((pid, tid))
    }

    // ── Trap surface ──

    /// Local-APIC timer tick on `cpu`: advance the clock, wake expired
    /// sleepers, drain the inbox, and round-robin.
    pub fn trap_timer(&mut self, cpu: usize) {
        if self.machine.is_halted() {
            return;
        }
        self.cpus[cpu].ticks += 1;
        if cpu == MANAGER_CPU {
            // The global clock; the manager loop itself is cooperative.
            self.machine.tick();
            return;
        }
        // Queue work from interrupt context runs with the local IF flag
        // clear, the same discipline the spinlocked queues demand.
        let was = self.machine.irq_save(cpu);
        let now = self.cpus[cpu].ticks;
        loop {
            let expired = self.cpus[cpu].sleepq.pop_le(now);
            match expired {
                Some(t) => {
                    if let Some(tcb) = self.threads.get_mut(t.0) {
                        tcb.state = ThreadState::Wakeup;
                    }
                    self.cswitch(cpu, SwitchOp::MakeRunnable(t));
                }
                None => break,
            }
        }
        self.worker_poll(cpu);
        self.cswitch(cpu, SwitchOp::Switch);
        self.machine.irq_restore(cpu, was);
        self.finish_current(cpu);
    }

    /// Keyboard trap: one byte into the console's raw ring. The manager
    /// matches buffered lines to blocked readers in its loop.
    pub fn trap_keyboard(&mut self, b: u8) {
        self.machine.console.key_input(b);
    }

    /// Drain this worker's inbox: replies park on their thread and wake
    /// it; VANISH_BACK finishes tearing down a thread we have already
    /// switched away from.
    pub fn worker_poll(&mut self, cpu: usize) {
        loop {
            let msg = match self.bus.worker_recv(cpu) {
                Some(m) => m,
                None => break,
            };
            match msg.body {
                MsgBody::VanishBack => self.teardown_thread(msg.req_tid),
                _ => {
                    let tid = msg.req_tid;
                    if let Some(tcb) = self.threads.get_mut(tid.0) {
                        tcb.msg = Some(msg);
                    }
                    self.cswitch(cpu, SwitchOp::MakeRunnable(tid));
                }
            }
        }
    }

    /// Run the second half of whatever the now-current thread was
    /// suspended on: read the parked reply, do the user-memory copies in
    /// this task's address space, and post the syscall result.
    pub(crate) fn finish_current(&mut self, cpu: usize) {
        let cur = self.cpus[cpu].current;
        let (pending, msg, pid) = {
            let tcb = match self.threads.get_mut(cur.0) {
                Some(t) => t,
                None => return,
            };
            let pending = match tcb.pending.take() {
                Some(p) => p,
                None => return,
            };
            (pending, tcb.msg.take(), tcb.pid)
        };

        let result = match (pending, msg) {
            (Pending::ChildStart, _) => 0,
            (Pending::SleepDone, _) => 0,
            // Error replies and plain acknowledgements carry the code
            // for every request shape.
            (_, Some(Message { body: MsgBody::Response { code }, .. })) => code,
            (Pending::ForkReply, Some(m)) => match m.body {
                MsgBody::ForkResponse { child_pid } => child_pid,
                _ => errno::EINVAL,
            },
            (Pending::WaitReply { status_ptr }, Some(m)) => match m.body {
                MsgBody::WaitResponse { pid: child, status } => {
                    if status_ptr == 0 {
                        child // NULL status pointer discards the status
                    } else {
                        match self.copy_out_u32(pid, cur, status_ptr, status as u32) {
                            Ok(()) => child,
                            Err(e) => crate::errors::errno_of(e),
                        }
                    }
                }
                _ => errno::EINVAL,
            },
            (Pending::ReadlineReply { buf, len }, Some(m)) => match m.body {
                MsgBody::LineResponse { line } => {
                    let n = line.len().min(len);
                    match self.copy_out_bytes(pid, cur, buf, &line[..n]) {
                        Ok(()) => n as i32,
                        Err(e) => crate::errors::errno_of(e),
                    }
                }
                _ => errno::EINVAL,
            },
            (Pending::GetcharReply, Some(m)) => match m.body {
                MsgBody::LineResponse { line } => {
                    line.first().map(|&b| b as i32).unwrap_or(errno::EINVAL)
                }
                _ => errno::EINVAL,
            },
            (Pending::CursorReply { row_ptr, col_ptr }, Some(m)) => match m.body {
                MsgBody::CursorResponse { row, col } => {
                    let a = self.copy_out_u32(pid, cur, row_ptr, row as u32);
                    let b = self.copy_out_u32(pid, cur, col_ptr, col as u32);
                    match a.and(b) {
                        Ok(()) => 0,
                        Err(e) => crate::errors::errno_of(e),
                    }
                }
                _ => errno::EINVAL,
            },
            _ => errno::EINVAL,
        };

        if let Some(tcb) = self.threads.get_mut(cur.0) {
            tcb.result = result;
            tcb.has_result = true;
        }
    }

    /// Free the stack and TCB of a vanished thread, after its CPU has
    /// switched off it (VANISH_BACK delivery).
    pub(crate) fn teardown_thread(&mut self, tid: Tid) {
        if let Some(tcb) = self.threads.remove(tid.0) {
            log::debug!(target: "kernel", "reclaimed thread {} of task {}", tid, tcb.pid);
            self.free_kstack(tcb.kstack);
        }
    }

    // ── Kernel copies into a task's address space ──

    pub(crate) fn copy_out_u32(
        &mut self,
        pid: Pid,
        me: Tid,
        va: u32,
        val: u32,
    ) -> Result<(), KernErr> {
        let pcb = self.tasks.get_mut(pid.0).ok_or(KernErr::PageNotAlloc)?;
        vm::write_user_u32(&mut pcb.pd, &self.frames, &mut self.machine, me, va, val)
    }

    pub(crate) fn copy_out_bytes(
        &mut self,
        pid: Pid,
        me: Tid,
        va: u32,
        bytes: &[u8],
    ) -> Result<(), KernErr> {
        let pcb = self.tasks.get_mut(pid.0).ok_or(KernErr::PageNotAlloc)?;
        vm::copy_to_user(&mut pcb.pd, &self.frames, &mut self.machine, me, va, bytes)
    }

    // ── User-mode memory access (the driver's loads and stores) ──

    /// Fault in every page of `[va, va+len)` the way user accesses
    /// would: non-present pages raise a page fault, ZFOD materializes
    /// and retries, anything else goes to swexn delivery or kills the
    /// task and the access fails with EFAULT.
    fn user_touch(&mut self, cpu: usize, va: u32, len: usize, write: bool) -> Result<Pid, i32> {
        let cur = self.cpus[cpu].current;
        let pid = match self.threads.get(cur.0) {
            Some(t) => t.pid,
            None => return Err(errno::EFAULT),
        };
        if len == 0 {
            return Ok(pid);
        }
        let end = va as u64 + len as u64;
        let mut page = page_base(va);
        loop {
            loop {
                let pte = match self.tasks.get(pid.0) {
                    Some(pcb) => pcb.pd.pte(page).unwrap_or(Pte::zero()),
                    None => return Err(errno::EFAULT),
                };
                if pte.is_present() && (!write || pte.is_writable()) {
                    break;
                }
                let mut code = FaultCode::USER;
                if write {
                    code |= FaultCode::WRITE;
                }
                if pte.is_present() {
                    code |= FaultCode::PROTECTION;
                }
                let fix = {
                    let pcb = match self.tasks.get_mut(pid.0) {
                        Some(p) => p,
                        None => return Err(errno::EFAULT),
                    };
                    vm::handle_fault(&mut pcb.pd, &self.frames, &mut self.machine, cur, page, code)
                };
                match fix {
                    vm::FaultFix::Materialized => continue,
                    vm::FaultFix::Unhandled => {
                        self.deliver_fault(cpu, page, code);
                        return Err(errno::EFAULT);
                    }
                }
            }
            match page.checked_add(crate::config::PAGE_SIZE as u32) {
                Some(next) if (next as u64) < end => page = next,
                _ => break,
            }
        }
        Ok(pid)
    }

    /// A user store from the current thread on `cpu`.
    pub fn user_write(&mut self, cpu: usize, va: u32, bytes: &[u8]) -> Result<(), i32> {
        let pid = self.user_touch(cpu, va, bytes.len(), true)?;
        let cur = self.cpus[cpu].current;
        self.copy_out_bytes(pid, cur, va, bytes).map_err(|e| crate::errors::errno_of(e))
    }

    /// A user load from the current thread on `cpu`.
    pub fn user_read(&mut self, cpu: usize, va: u32, buf: &mut [u8]) -> Result<(), i32> {
        let pid = self.user_touch(cpu, va, buf.len(), false)?;
        let pcb = match self.tasks.get(pid.0) {
            Some(p) => p,
            None => return Err(errno::EFAULT),
        };
        vm::copy_from_user(&pcb.pd, &self.machine, va, buf).map_err(|e| crate::errors::errno_of(e))
    }

    pub fn user_write_u32(&mut self, cpu: usize, va: u32, val: u32) -> Result<(), i32> {
        self.user_write(cpu, va, &val.to_le_bytes())
    }

    pub fn user_read_u32(&mut self, cpu: usize, va: u32) -> Result<u32, i32> {
        let mut b = [0u8; 4];
        self.user_read(cpu, va, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Unrepairable fault: software exception to the registered handler,
    /// or death.
    fn deliver_fault(&mut self, cpu: usize, va: u32, code: FaultCode) {
        let cur = self.cpus[cpu].current;
        let handler = match self.threads.get_mut(cur.0) {
            Some(tcb) => match tcb.swexn.take() {
                Some(reg) => {
                    // Delivery deregisters; the handler may re-register.
                    tcb.last_swexn = Some(SwexnDelivery {
                        fault_va: va,
                        code,
                        handler_eip: reg.eip,
                        arg: reg.arg,
                    });
                    true
                }
                None => false,
            },
            None => return,
        };
        if handler {
            log::debug!(target: "kernel", "swexn delivery to thread {} for {:#x}", cur, va);
        } else {
            log::warn!(target: "kernel", "thread {} faulted at {:#x} with no handler; killing task", cur, va);
            self.kill_current(cpu);
        }
    }

    /// Kill the current thread's task: install the killed status and
    /// vanish on its behalf.
    fn kill_current(&mut self, cpu: usize) {
        let cur = self.cpus[cpu].current;
        let pid = match self.threads.get(cur.0) {
            Some(t) => t.pid,
            None => return,
        };
        if let Some(pcb) = self.tasks.get_mut(pid.0) {
            if let Some(rec) = pcb.exit_record.as_mut() {
                rec.status = KILLED_STATUS;
            }
        }
        self.cswitch(
            cpu,
            SwitchOp::SendMsg(Message {
                req_tid: cur,
                req_cpu: cpu,
                body: MsgBody::Vanish,
            }),
        );
        self.finish_current(cpu);
    }

    // ── Observers ──

    /// Per-CPU state for `id`. Callers only touch the region of the CPU
    /// they are driving.
    pub fn cpu(&self, id: usize) -> &CpuSched {
        &self.cpus[id]
    }

    pub fn current(&self, cpu: usize) -> Tid {
        self.cpus[cpu].current
    }

    pub fn idle_tid(&self, cpu: usize) -> Tid {
        self.cpus[cpu].idle
    }

    pub fn n_cpus(&self) -> usize {
        self.cfg.n_cpus
    }

    pub fn init_pid(&self) -> Option<Pid> {
        self.init_pid
    }

    /// The parked result of a thread's last suspended syscall, consumed.
    pub fn take_result(&mut self, tid: Tid) -> Option<i32> {
        let tcb = self.threads.get_mut(tid.0)?;
        if tcb.has_result {
            tcb.has_result = false;
            Some(tcb.result)
        } else {
            None
        }
    }

    pub fn result_ready(&self, tid: Tid) -> bool {
        self.threads.get(tid.0).map(|t| t.has_result).unwrap_or(false)
    }

    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        self.threads.get(tid.0).map(|t| t.state)
    }

    pub fn thread_alive(&self, tid: Tid) -> bool {
        self.threads.contains(tid.0)
    }

    pub fn task_alive(&self, pid: Pid) -> bool {
        self.tasks.get(pid.0).map(|p| !p.is_zombie()).unwrap_or(false)
    }

    pub fn take_swexn_delivery(&mut self, tid: Tid) -> Option<SwexnDelivery> {
        self.threads.get_mut(tid.0)?.last_swexn.take()
    }

    /// Any live thread of a task (there is exactly one right after fork).
    pub fn thread_of_task(&self, pid: Pid) -> Option<Tid> {
        self.threads
            .iter()
            .filter(|(_, t)| t.pid == pid)
            .map(|(k, _)| Tid(k))
            .min()
    }

    pub fn thread_home(&self, tid: Tid) -> Option<usize> {
        self.threads.get(tid.0).map(|t| t.home_cpu)
    }

    pub fn task_name(&self, pid: Pid) -> Option<String> {
        self.tasks.get(pid.0).map(|p| p.name.clone())
    }

    pub fn task_parent(&self, pid: Pid) -> Option<Pid> {
        self.tasks.get(pid.0).map(|p| p.parent)
    }

    pub fn frames_free(&self) -> i64 {
        self.frames.free_count()
    }

    pub fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    pub fn is_halted(&self) -> bool {
        self.machine.is_halted()
    }

    /// Quantified invariants, checked at quiescent points by tests.
    pub fn check_invariants(&self) {
        // Child accounting per PCB.
        for (pid_key, pcb) in self.tasks.iter() {
            let kids = self
                .tasks
                .iter()
                .filter(|(_, c)| c.parent.0 == pid_key)
                .count();
            assert_eq!(
                pcb.wait.num_alive + pcb.wait.num_zombie,
                kids,
                "task {} child accounting",
                pid_key
            );
        }

        // Every NORMAL, non-running, non-idle thread sits in exactly one
        // runnable queue; blocked threads sit in none.
        for (tid_key, tcb) in self.threads.iter() {
            let t = Tid(tid_key);
            let running = self.cpus.iter().any(|c| c.current == t);
            let idle = self.cpus.iter().any(|c| c.idle == t);
            let queued: usize = self
                .cpus
                .iter()
                .map(|c| if c.runq_contains(t, Party::A) { 1 } else { 0 })
                .sum();
            match tcb.state {
                ThreadState::Normal if !running && !idle => {
                    assert_eq!(queued, 1, "thread {} runnable queue membership", t)
                }
                ThreadState::Blocked => {
                    assert_eq!(queued, 0, "blocked thread {} must not be queued", t)
                }
                _ => {}
            }
        }

        // Frame accounting: physically held frames are exactly the
        // present user pages, and reservations cover present + ZFOD.
        let mut present = 0usize;
        let mut zfod = 0usize;
        for (_, pcb) in self.tasks.iter() {
            let (p, z) = vm::page_census(&pcb.pd);
            present += p;
            zfod += z;
        }
        assert_eq!(self.frames.in_use(), present, "raw frames vs present pages");
        assert_eq!(
            self.frames.capacity() as i64 - self.frames.free_count(),
            (present + zfod) as i64,
            "reservations vs allocated pages"
        );
    }
}
