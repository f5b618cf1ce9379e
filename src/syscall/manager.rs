//! Manager-side execution of global syscalls.
//!
//! The manager drains its inbox one message at a time and runs each
//! dispatch arm to completion. It is single-threaded, which is what
//! gives concurrent global syscalls their total order. Replies to a
//! worker are FIFO per worker.

use crate::bus::{Message, MsgBody};
use crate::config::MANAGER_CPU;
use crate::errors::errno;
use crate::kernel::Kernel;
use crate::memory::vm;
use crate::sync::Party;
use crate::task::{ExitStatus, Pcb, Pending, Pid, Tid, KERNEL_PID};
use alloc::vec::Vec;

impl Kernel {
    /// One turn of the manager loop: match console input to blocked
    /// readers, then dispatch one message. Returns whether any work was
    /// done.
    pub fn manager_step(&mut self) -> bool {
        if self.machine.is_halted() {
            return false;
        }
        let mut did = self.service_console_waiters();
        if let Some(msg) = self.bus.manager_recv() {
            self.manager_handle(msg);
            did = true;
        }
        did
    }

    /// Drain the manager loop until it goes idle.
    pub fn manager_run(&mut self) {
        while self.manager_step() {}
    }

    fn reply_to(&mut self, req_cpu: usize, req_tid: Tid, body: MsgBody) {
        self.bus.manager_send(
            req_cpu,
            Message {
                req_tid,
                req_cpu,
                body,
            },
        );
    }

    fn manager_handle(&mut self, msg: Message) {
        log::trace!(target: "manager", "thread {} cpu{}: {:?}", msg.req_tid, msg.req_cpu, msg.body);
        match msg.body.clone() {
            MsgBody::Fork => self.handle_fork(&msg),
            MsgBody::Wait { .. } => self.handle_wait(msg),
            MsgBody::Vanish => self.handle_vanish(&msg),
            MsgBody::YieldTo { target } => self.handle_yield_to(&msg, target),
            MsgBody::Deschedule { reject_ptr } => self.handle_deschedule(msg, reject_ptr),
            MsgBody::MakeRunnable { target } => self.handle_make_runnable(&msg, target),
            MsgBody::Print { buf } => {
                self.machine.console.write_bytes(&buf);
                self.reply_to(msg.req_cpu, msg.req_tid, MsgBody::Response { code: 0 });
            }
            MsgBody::Readline { .. } | MsgBody::Getchar => {
                // Reader FIFO; satisfied now if input is already here.
                self.console_waiters.push(msg);
                self.service_console_waiters();
            }
            MsgBody::SetCursor { row, col } => {
                let code = if self.machine.console.set_cursor(row, col) {
                    0
                } else {
                    errno::EINVAL
                };
                self.reply_to(msg.req_cpu, msg.req_tid, MsgBody::Response { code });
            }
            MsgBody::GetCursor => {
                let (row, col) = self.machine.console.cursor();
                self.reply_to(msg.req_cpu, msg.req_tid, MsgBody::CursorResponse { row, col });
            }
            MsgBody::SetTermColor { color } => {
                self.machine.console.set_color(color);
                self.reply_to(msg.req_cpu, msg.req_tid, MsgBody::Response { code: 0 });
            }
            MsgBody::SetInitPcb { pid } => {
                self.init_pid = Some(pid);
                log::info!(target: "manager", "init task registered as {}", pid);
            }
            // Replies never land in the manager's inbox.
            MsgBody::Response { .. }
            | MsgBody::ForkResponse { .. }
            | MsgBody::WaitResponse { .. }
            | MsgBody::LineResponse { .. }
            | MsgBody::CursorResponse { .. }
            | MsgBody::VanishBack => {
                debug_assert!(false, "reply message routed to manager");
            }
        }
    }

    /// Satisfy blocked console readers in arrival order. The head of the
    /// queue owns the next line; later readers wait behind it.
    fn service_console_waiters(&mut self) -> bool {
        let mut did = false;
        while let Some(head) = self.console_waiters.first() {
            let (req_cpu, req_tid) = (head.req_cpu, head.req_tid);
            let line = match head.body {
                MsgBody::Readline { .. } => {
                    if !self.machine.console.has_line() {
                        break;
                    }
                    match self.machine.console.take_line() {
                        Some(l) => l,
                        None => break,
                    }
                }
                MsgBody::Getchar => {
                    match self.machine.console.take_char() {
                        Some(b) => alloc::vec![b],
                        None => break,
                    }
                }
                _ => break,
            };
            self.console_waiters.remove(0);
            // Echo what readline consumed, as the line discipline does.
            self.machine.console.write_bytes(&line);
            self.reply_to(req_cpu, req_tid, MsgBody::LineResponse { line });
            did = true;
        }
        did
    }

    // ── fork ──

    fn handle_fork(&mut self, msg: &Message) {
        let parent_tid = msg.req_tid;
        let parent_pid = match self.threads.get(parent_tid.0) {
            Some(t) => t.pid,
            None => return,
        };
        let me = self.manager_tid;

        let (child_pd, parent_name, parent_entry) = {
            let parent = match self.tasks.get(parent_pid.0) {
                Some(p) => p,
                None => return,
            };
            let pd = vm::clone_pd(&parent.pd, &self.frames, &mut self.machine, me);
            (pd, parent.name.clone(), parent.entry)
        };
        let child_pd = match child_pd {
            Ok(pd) => pd,
            Err(_) => {
                self.reply_to(msg.req_cpu, parent_tid, MsgBody::Response { code: errno::ENOMEM });
                return;
            }
        };

        // The pid is drawn only after the copy can no longer fail, so a
        // failed fork leaks nothing.
        let child_pid = self.alloc_pid();
        let pcb = Pcb::new(child_pid, parent_pid, parent_name, child_pd, parent_entry);
        self.tasks.insert(child_pid.0, pcb);
        if let Some(parent) = self.tasks.get_mut(parent_pid.0) {
            parent.wait.num_alive += 1;
            // Reserve the zombie slot now so this child's vanish cannot
            // fail for memory.
            parent.zombies.reserve(1);
        }

        let dest = self.next_fork_cpu();
        let child_tid = self.create_thread(child_pid, dest);
        if let Some(tcb) = self.threads.get_mut(child_tid.0) {
            tcb.pending = Some(Pending::ChildStart);
        }

        // The parent learns the pid before the child becomes runnable.
        self.reply_to(msg.req_cpu, parent_tid, MsgBody::ForkResponse { child_pid: child_pid.0 });
        self.cpus[dest].enqueue_tail(child_tid, Party::B);
        log::debug!(
            target: "manager",
            "fork: task {} -> task {} (thread {} on cpu{})",
            parent_pid, child_pid, child_tid, dest
        );
    }

    fn next_fork_cpu(&mut self) -> usize {
        let n = self.cfg.n_cpus;
        let dest = self.fork_next_cpu;
        self.fork_next_cpu += 1;
        if self.fork_next_cpu >= n {
            self.fork_next_cpu = 1;
        }
        debug_assert!(dest != MANAGER_CPU);
        dest
    }

    // ── wait ──

    fn handle_wait(&mut self, msg: Message) {
        let req_tid = msg.req_tid;
        let req_cpu = msg.req_cpu;
        let pid = match self.threads.get(req_tid.0) {
            Some(t) => t.pid,
            None => return,
        };
        let me = self.manager_tid;

        enum Action {
            Reap(ExitStatus),
            Park,
            NoChildren,
        }
        let action = {
            let pcb = match self.tasks.get_mut(pid.0) {
                Some(p) => p,
                None => return,
            };
            pcb.wait.mtx.lock(me);
            let act = if let Some(rec) = pcb.zombies.pop_front() {
                pcb.wait.num_zombie -= 1;
                Action::Reap(rec)
            } else if pcb.wait.num_alive > 0 {
                pcb.wait.waiters.push_back(msg);
                Action::Park
            } else {
                Action::NoChildren
            };
            pcb.wait.mtx.unlock(me);
            act
        };

        match action {
            Action::Reap(rec) => {
                // The zombie's PCB dies with the reap.
                self.tasks.remove(rec.pid.0);
                self.reply_to(req_cpu, req_tid, MsgBody::WaitResponse {
                    pid: rec.pid.0,
                    status: rec.status,
                });
            }
            Action::Park => {
                // Thread stays blocked until some child vanishes.
                log::trace!(target: "manager", "thread {} parked in wait", req_tid);
            }
            Action::NoChildren => {
                self.reply_to(req_cpu, req_tid, MsgBody::Response { code: errno::ECHILD });
            }
        }
    }

    // ── vanish ──

    fn handle_vanish(&mut self, msg: &Message) {
        let tid = msg.req_tid;
        let pid = match self.threads.get(tid.0) {
            Some(t) => t.pid,
            None => return,
        };
        let me = self.manager_tid;

        let last = {
            let pcb = match self.tasks.get_mut(pid.0) {
                Some(p) => p,
                None => return,
            };
            pcb.live_threads -= 1;
            pcb.live_threads == 0
        };

        if !last {
            // Only the thread dies; its worker reclaims the stack and
            // TCB once it has switched away.
            self.reply_to(msg.req_cpu, tid, MsgBody::VanishBack);
            return;
        }

        // Last thread: the whole task dies. Free its address space,
        // hand surviving and zombie children to init, then notify the
        // parent. Stack release is queued to the worker first, so the
        // status can never be observed before the teardown is on its
        // way.
        let (record, parent_pid, moved_alive, moved_zombie, inherited) = {
            let pcb = match self.tasks.get_mut(pid.0) {
                Some(p) => p,
                None => return,
            };
            let record = pcb.exit_record.take().unwrap_or(ExitStatus { pid, status: 0 });
            vm::destroy_pd(&mut pcb.pd, &self.frames, me);
            let inherited: Vec<ExitStatus> = pcb.zombies.drain(..).collect();
            let moved_alive = pcb.wait.num_alive;
            let moved_zombie = pcb.wait.num_zombie;
            pcb.wait.num_alive = 0;
            pcb.wait.num_zombie = 0;
            (record, pcb.parent, moved_alive, moved_zombie, inherited)
        };

        // Reparent every surviving child (and unreaped zombie) to init.
        let init = self.init_pid.unwrap_or(KERNEL_PID);
        if init != pid {
            let kids: Vec<i32> = self
                .tasks
                .iter()
                .filter(|(_, c)| c.parent == pid)
                .map(|(k, _)| k)
                .collect();
            for k in &kids {
                if let Some(child) = self.tasks.get_mut(*k) {
                    child.parent = init;
                }
            }
            if let Some(init_pcb) = self.tasks.get_mut(init.0) {
                init_pcb.wait.num_alive += moved_alive;
                init_pcb.wait.num_zombie += moved_zombie;
                init_pcb.zombies.extend(inherited);
            }
        }

        // Stack/TCB release first (ordering: status after teardown).
        self.reply_to(msg.req_cpu, tid, MsgBody::VanishBack);

        // Hand the exit record to the parent, waking one waiter if any.
        let reaped_now = self.offer_to_parent(parent_pid, record, me);
        if reaped_now || !self.tasks.contains(parent_pid.0) {
            // Consumed immediately, or nobody will ever reap us.
            self.tasks.remove(pid.0);
        }
        log::debug!(target: "manager", "task {} vanished (parent {})", pid, parent_pid);
    }

    /// Give a dead child's record to its parent. Returns true when a
    /// parked waiter consumed it on the spot.
    fn offer_to_parent(&mut self, parent_pid: Pid, record: ExitStatus, me: Tid) -> bool {
        enum Give {
            Waiter(Message),
            Parked,
            NoParent,
        }
        let give = {
            match self.tasks.get_mut(parent_pid.0) {
                Some(parent) => {
                    parent.wait.mtx.lock(me);
                    parent.wait.num_alive -= 1;
                    let g = if let Some(wmsg) = parent.wait.waiters.pop_front() {
                        Give::Waiter(wmsg)
                    } else {
                        parent.wait.num_zombie += 1;
                        parent.zombies.push_back(record);
                        Give::Parked
                    };
                    parent.wait.mtx.unlock(me);
                    g
                }
                None => Give::NoParent,
            }
        };
        match give {
            Give::Waiter(wmsg) => {
                self.reply_to(wmsg.req_cpu, wmsg.req_tid, MsgBody::WaitResponse {
                    pid: record.pid.0,
                    status: record.status,
                });
                true
            }
            Give::Parked => false,
            Give::NoParent => true,
        }
    }

    // ── yield across CPUs ──

    fn handle_yield_to(&mut self, msg: &Message, target: Tid) {
        let code = self.promote_thread(target);
        self.reply_to(msg.req_cpu, msg.req_tid, MsgBody::Response { code });
    }

    /// Move a runnable thread to the head of its home CPU's queue so it
    /// runs before the yielding caller resumes. ETHREAD when the target
    /// is unknown, blocked, or descheduled.
    fn promote_thread(&mut self, target: Tid) -> i32 {
        let home = match self.threads.get(target.0) {
            Some(t) if t.state == crate::task::ThreadState::Normal => t.home_cpu,
            _ => return errno::ETHREAD,
        };
        if self.cpus[home].current == target {
            return 0; // already running
        }
        match self.cpus[home].get_next(target.0, Party::B) {
            Some(t) => {
                self.cpus[home].enqueue_head(t, Party::B);
                0
            }
            None => errno::ETHREAD,
        }
    }

    // ── deschedule / make_runnable ──

    fn handle_deschedule(&mut self, msg: Message, reject_ptr: u32) {
        let me = self.manager_tid;
        let req_cpu = msg.req_cpu;
        let req_tid = msg.req_tid;
        let pid = match self.threads.get(req_tid.0) {
            Some(t) => t.pid,
            None => return,
        };

        // The reject word is read under the deschedule mutex; a
        // make_runnable racing this request serializes behind us here,
        // so the wakeup cannot be lost.
        self.desched_mtx.lock(me);
        let reject = {
            let pcb = self.tasks.get(pid.0);
            match pcb {
                Some(p) => vm::read_user_u32(&p.pd, &self.machine, reject_ptr),
                None => Err(crate::errors::KernErr::PageNotAlloc),
            }
        };
        let verdict = match reject {
            Err(_) => Some(errno::EFAULT),
            Ok(v) if v != 0 => Some(0),
            Ok(_) => None,
        };
        match verdict {
            Some(code) => {
                self.desched_mtx.unlock(me);
                self.reply_to(req_cpu, req_tid, MsgBody::Response { code });
            }
            None => {
                self.desched_q.push(msg);
                self.desched_mtx.unlock(me);
                log::trace!(target: "manager", "thread {} descheduled", req_tid);
            }
        }
    }

    fn handle_make_runnable(&mut self, msg: &Message, target: Tid) {
        let me = self.manager_tid;
        self.desched_mtx.lock(me);
        let pos = self.desched_q.iter().position(|m| m.req_tid == target);
        let parked = pos.map(|i| self.desched_q.remove(i));
        self.desched_mtx.unlock(me);

        match parked {
            Some(p) => {
                // Wake the descheduled thread and acknowledge the caller.
                self.reply_to(p.req_cpu, p.req_tid, MsgBody::Response { code: 0 });
                self.reply_to(msg.req_cpu, msg.req_tid, MsgBody::Response { code: 0 });
            }
            None => {
                self.reply_to(msg.req_cpu, msg.req_tid, MsgBody::Response { code: errno::ETHREAD });
            }
        }
    }
}
