//! Worker-side syscall handlers: the local calls, and the marshalling
//! half of every global call.

use crate::bus::{Message, MsgBody};
use crate::config::{ARG_LEN_MAX, ARG_MAX, CONSOLE_LINE_MAX, NAME_MAX, USER_STACK_TOP};
use crate::errors::{errno, errno_of, KernErr};
use crate::kernel::{Disposition, Kernel};
use crate::memory::paging::is_kernel_va;
use crate::memory::vm;
use crate::scheduler::{SwitchOp, SwitchOutcome};
use crate::task::{Pending, SwexnReg, ThreadState, Tid};
use alloc::string::String;
use alloc::vec::Vec;

/// Most bytes one print() will take.
const PRINT_MAX: usize = 4096;
/// Size of the user register set swexn adopts.
const UREG_BYTES: usize = 80;

impl Kernel {
    /// Marshal a global syscall: park the second half on the thread,
    /// then enqueue-and-block through the context switcher.
    fn send_global(&mut self, cpu: usize, body: MsgBody, pending: Option<Pending>) -> Disposition {
        let cur = self.current(cpu);
        if let Some(tcb) = self.threads.get_mut(cur.0) {
            tcb.pending = pending;
        }
        self.cswitch(
            cpu,
            SwitchOp::SendMsg(Message {
                req_tid: cur,
                req_cpu: cpu,
                body,
            }),
        );
        self.finish_current(cpu);
        Disposition::Suspended
    }

    /// Read a NUL-terminated user string out of the current task.
    fn user_cstr(&self, cpu: usize, va: u32, max: usize) -> Result<Vec<u8>, KernErr> {
        let cur = self.current(cpu);
        let pid = self.threads.get(cur.0).map(|t| t.pid).ok_or(KernErr::PageNotAlloc)?;
        let pcb = self.tasks.get(pid.0).ok_or(KernErr::PageNotAlloc)?;
        vm::read_user_cstr(&pcb.pd, &self.machine, va, max)
    }

    fn current_pid(&self, cpu: usize) -> crate::task::Pid {
        let cur = self.current(cpu);
        self.threads.get(cur.0).map(|t| t.pid).unwrap_or(crate::task::KERNEL_PID)
    }

    // ── Task and thread calls ──

    pub(crate) fn sys_fork(&mut self, cpu: usize) -> Disposition {
        self.send_global(cpu, MsgBody::Fork, Some(Pending::ForkReply))
    }

    pub(crate) fn sys_thread_fork(&mut self, cpu: usize) -> Disposition {
        let pid = self.current_pid(cpu);
        let child = self.create_thread(pid, cpu);
        if let Some(pcb) = self.tasks.get_mut(pid.0) {
            pcb.live_threads += 1;
        }
        if let Some(tcb) = self.threads.get_mut(child.0) {
            tcb.pending = Some(Pending::ChildStart);
        }
        log::debug!(target: "syscall", "thread_fork: task {} gained thread {}", pid, child);
        // The child runs now; the parent is requeued with the child's
        // tid as its return value.
        self.cswitch(cpu, SwitchOp::ThreadFork(child));
        self.finish_current(cpu);
        Disposition::Complete(child.0)
    }

    pub(crate) fn sys_exec(&mut self, cpu: usize, name: u32, argv: u32) -> Disposition {
        let cur = self.current(cpu);
        let pid = self.current_pid(cpu);
        {
            let pcb = match self.tasks.get(pid.0) {
                Some(p) => p,
                None => return Disposition::Complete(errno::EFAULT),
            };
            if pcb.live_threads > 1 {
                return Disposition::Complete(errno::EMORETHR);
            }
        }

        let name_bytes = match self.user_cstr(cpu, name, NAME_MAX + 1) {
            Ok(b) => b,
            Err(KernErr::NotNullTerm) => return Disposition::Complete(errno::ENAMETOOLONG),
            Err(e) => return Disposition::Complete(errno_of(e)),
        };
        let name_str = match String::from_utf8(name_bytes) {
            Ok(s) => s,
            Err(_) => return Disposition::Complete(errno::ENOENT),
        };

        // Walk the argument vector before touching the address space.
        let mut args: Vec<Vec<u8>> = Vec::new();
        if argv != 0 {
            let pd_read = |k: &Kernel, va: u32| -> Result<u32, KernErr> {
                let pcb = k.tasks.get(pid.0).ok_or(KernErr::PageNotAlloc)?;
                vm::read_user_u32(&pcb.pd, &k.machine, va)
            };
            for i in 0..=ARG_MAX {
                let slot = match argv.checked_add((i * 4) as u32) {
                    Some(s) => s,
                    None => return Disposition::Complete(errno::EFAULT),
                };
                let ptr = match pd_read(self, slot) {
                    Ok(p) => p,
                    Err(e) => return Disposition::Complete(errno_of(e)),
                };
                if ptr == 0 {
                    break;
                }
                if i == ARG_MAX {
                    return Disposition::Complete(errno::E2BIG);
                }
                match self.user_cstr(cpu, ptr, ARG_LEN_MAX + 1) {
                    Ok(a) => args.push(a),
                    Err(KernErr::NotNullTerm) => return Disposition::Complete(errno::E2BIG),
                    Err(e) => return Disposition::Complete(errno_of(e)),
                }
            }
        }

        let img = match crate::loader::load_task(
            &self.ramdisk,
            &self.frames,
            &mut self.machine,
            cur,
            &name_str,
        ) {
            Ok(img) => img,
            Err(code) => return Disposition::Complete(code),
        };

        // Point of no return: swap in the new address space and release
        // the old one.
        let entry = img.entry;
        {
            let pcb = match self.tasks.get_mut(pid.0) {
                Some(p) => p,
                None => return Disposition::Complete(errno::EFAULT),
            };
            let mut old = core::mem::replace(&mut pcb.pd, img.pd);
            pcb.entry = entry;
            pcb.name = name_str.clone();
            vm::destroy_pd(&mut old, &self.frames, cur);
        }
        if let Some(tcb) = self.threads.get_mut(cur.0) {
            tcb.swexn = None;
        }

        // Pack argv at the top of the fresh stack, NUL separated.
        if !args.is_empty() {
            let total: usize = args.iter().map(|a| a.len() + 1).sum();
            let mut packed = Vec::with_capacity(total);
            for a in &args {
                packed.extend_from_slice(a);
                packed.push(0);
            }
            let base = USER_STACK_TOP - total as u32;
            if let Err(e) = self.copy_out_bytes(pid, cur, base, &packed) {
                return Disposition::Complete(errno_of(e));
            }
        }
        log::info!(target: "syscall", "task {} exec '{}'", pid, name_str);
        Disposition::Complete(0)
    }

    pub(crate) fn sys_set_status(&mut self, cpu: usize, status: i32) -> Disposition {
        let pid = self.current_pid(cpu);
        if let Some(pcb) = self.tasks.get_mut(pid.0) {
            if let Some(rec) = pcb.exit_record.as_mut() {
                rec.status = status;
            }
        }
        Disposition::Complete(0)
    }

    pub(crate) fn sys_vanish(&mut self, cpu: usize) -> Disposition {
        // No second half: this thread never returns to user mode. The
        // worker frees its stack and TCB on VANISH_BACK, after the
        // switch away below.
        self.send_global(cpu, MsgBody::Vanish, None)
    }

    pub(crate) fn sys_wait(&mut self, cpu: usize, status_ptr: u32) -> Disposition {
        if status_ptr != 0 {
            if let Err(e) = self.check_word(cpu, status_ptr, true) {
                return Disposition::Complete(errno_of(e));
            }
        }
        self.send_global(
            cpu,
            MsgBody::Wait { status_ptr },
            Some(Pending::WaitReply { status_ptr }),
        )
    }

    // ── Scheduling calls ──

    pub(crate) fn sys_yield(&mut self, cpu: usize, tid: i32) -> Disposition {
        let cur = self.current(cpu);
        if tid == cur.0 {
            return Disposition::Complete(0);
        }
        if tid >= 0 && !self.thread_alive(Tid(tid)) {
            return Disposition::Complete(errno::ETHREAD);
        }
        match self.cswitch(cpu, SwitchOp::YieldTo(tid)) {
            SwitchOutcome::YieldMiss => {
                // Not runnable on this CPU; the manager arbitrates.
                self.send_global(cpu, MsgBody::YieldTo { target: Tid(tid) }, Some(Pending::Reply))
            }
            _ => {
                self.finish_current(cpu);
                Disposition::Complete(0)
            }
        }
    }

    pub(crate) fn sys_deschedule(&mut self, cpu: usize, reject_ptr: u32) -> Disposition {
        if let Err(e) = self.check_word(cpu, reject_ptr, false) {
            return Disposition::Complete(errno_of(e));
        }
        self.send_global(
            cpu,
            MsgBody::Deschedule { reject_ptr },
            Some(Pending::Reply),
        )
    }

    pub(crate) fn sys_make_runnable(&mut self, cpu: usize, tid: i32) -> Disposition {
        self.send_global(
            cpu,
            MsgBody::MakeRunnable { target: Tid(tid) },
            Some(Pending::Reply),
        )
    }

    pub(crate) fn sys_sleep(&mut self, cpu: usize, ticks: i32) -> Disposition {
        if ticks < 0 {
            return Disposition::Complete(errno::EINVAL);
        }
        if ticks == 0 {
            return Disposition::Complete(0);
        }
        let cur = self.current(cpu);
        let wake = self.cpus[cpu].ticks + ticks as u64;
        self.cpus[cpu].sleepq.insert(wake, cur);
        if let Some(tcb) = self.threads.get_mut(cur.0) {
            tcb.state = ThreadState::Blocked;
            tcb.pending = Some(Pending::SleepDone);
        }
        self.cswitch(cpu, SwitchOp::Block);
        self.finish_current(cpu);
        Disposition::Suspended
    }

    // ── Memory calls ──

    pub(crate) fn sys_new_pages(&mut self, cpu: usize, base: u32, len: u32) -> Disposition {
        let cur = self.current(cpu);
        let pid = self.current_pid(cpu);
        let res = {
            let pcb = match self.tasks.get_mut(pid.0) {
                Some(p) => p,
                None => return Disposition::Complete(errno::EFAULT),
            };
            vm::new_pages(
                &mut pcb.pd,
                &self.frames,
                &mut self.machine,
                cur,
                base,
                len as usize,
            )
        };
        match res {
            Ok(()) => Disposition::Complete(0),
            Err(e) => Disposition::Complete(errno_of(e)),
        }
    }

    pub(crate) fn sys_remove_pages(&mut self, cpu: usize, base: u32) -> Disposition {
        let cur = self.current(cpu);
        let pid = self.current_pid(cpu);
        let res = {
            let pcb = match self.tasks.get_mut(pid.0) {
                Some(p) => p,
                None => return Disposition::Complete(errno::EFAULT),
            };
            vm::remove_pages(&mut pcb.pd, &self.frames, cur, base)
        };
        match res {
            Ok(()) => Disposition::Complete(0),
            Err(e) => Disposition::Complete(errno_of(e)),
        }
    }

    pub(crate) fn sys_swexn(
        &mut self,
        cpu: usize,
        esp3: u32,
        eip: u32,
        arg: u32,
        newureg: u32,
    ) -> Disposition {
        let cur = self.current(cpu);
        if newureg != 0 {
            let pid = self.current_pid(cpu);
            let ok = match self.tasks.get(pid.0) {
                Some(pcb) => {
                    vm::check_user_mem(&pcb.pd, &self.machine, newureg, UREG_BYTES, false, false)
                        .is_ok()
                }
                None => false,
            };
            if !ok {
                return Disposition::Complete(errno::EINVAL);
            }
        }
        if esp3 == 0 || eip == 0 {
            if let Some(tcb) = self.threads.get_mut(cur.0) {
                tcb.swexn = None;
            }
            return Disposition::Complete(0);
        }
        if is_kernel_va(esp3) || is_kernel_va(eip) {
            return Disposition::Complete(errno::EINVAL);
        }
        if let Some(tcb) = self.threads.get_mut(cur.0) {
            tcb.swexn = Some(SwexnReg { esp3, eip, arg });
        }
        Disposition::Complete(0)
    }

    // ── RAM disk and halt ──

    pub(crate) fn sys_readfile(
        &mut self,
        cpu: usize,
        name: u32,
        buf: u32,
        count: u32,
        offset: u32,
    ) -> Disposition {
        let cur = self.current(cpu);
        let pid = self.current_pid(cpu);
        let name_bytes = match self.user_cstr(cpu, name, NAME_MAX + 1) {
            Ok(b) => b,
            Err(KernErr::NotNullTerm) => return Disposition::Complete(errno::ENAMETOOLONG),
            Err(e) => return Disposition::Complete(errno_of(e)),
        };
        let name_str = match core::str::from_utf8(&name_bytes) {
            Ok(s) => s,
            Err(_) => return Disposition::Complete(-1),
        };
        let count = count as usize;
        {
            let pcb = match self.tasks.get(pid.0) {
                Some(p) => p,
                None => return Disposition::Complete(errno::EFAULT),
            };
            if let Err(e) = vm::check_user_mem(&pcb.pd, &self.machine, buf, count, false, true) {
                return Disposition::Complete(errno_of(e));
            }
        }
        let mut data = alloc::vec![0u8; count];
        let n = match self.ramdisk.read(name_str, offset as usize, &mut data) {
            Some(n) => n,
            None => return Disposition::Complete(-1),
        };
        if n > 0 {
            if let Err(e) = self.copy_out_bytes(pid, cur, buf, &data[..n]) {
                return Disposition::Complete(errno_of(e));
            }
        }
        Disposition::Complete(n as i32)
    }

    pub(crate) fn sys_halt(&mut self, cpu: usize) -> Disposition {
        log::info!(target: "syscall", "halt from cpu{}", cpu);
        self.machine.halt();
        Disposition::Complete(0)
    }

    // ── Console calls (worker half) ──

    pub(crate) fn sys_print(&mut self, cpu: usize, buf: u32, len: u32) -> Disposition {
        let len = len as usize;
        if len > PRINT_MAX {
            return Disposition::Complete(errno::EINVAL);
        }
        if len == 0 {
            return Disposition::Complete(0);
        }
        let pid = self.current_pid(cpu);
        let mut bytes = alloc::vec![0u8; len];
        {
            let pcb = match self.tasks.get(pid.0) {
                Some(p) => p,
                None => return Disposition::Complete(errno::EFAULT),
            };
            if let Err(e) = vm::check_user_mem(&pcb.pd, &self.machine, buf, len, false, false) {
                return Disposition::Complete(errno_of(e));
            }
            if let Err(e) = vm::copy_from_user(&pcb.pd, &self.machine, buf, &mut bytes) {
                return Disposition::Complete(errno_of(e));
            }
        }
        self.send_global(cpu, MsgBody::Print { buf: bytes }, Some(Pending::Reply))
    }

    pub(crate) fn sys_readline(&mut self, cpu: usize, buf: u32, len: u32) -> Disposition {
        let len = len as usize;
        if len > CONSOLE_LINE_MAX {
            return Disposition::Complete(errno::EINVAL);
        }
        let pid = self.current_pid(cpu);
        {
            let pcb = match self.tasks.get(pid.0) {
                Some(p) => p,
                None => return Disposition::Complete(errno::EFAULT),
            };
            if let Err(e) = vm::check_user_mem(&pcb.pd, &self.machine, buf, len, false, true) {
                return Disposition::Complete(errno_of(e));
            }
        }
        self.send_global(
            cpu,
            MsgBody::Readline { len },
            Some(Pending::ReadlineReply { buf, len }),
        )
    }

    pub(crate) fn sys_getchar(&mut self, cpu: usize) -> Disposition {
        self.send_global(cpu, MsgBody::Getchar, Some(Pending::GetcharReply))
    }

    pub(crate) fn sys_get_cursor_pos(&mut self, cpu: usize, row_ptr: u32, col_ptr: u32) -> Disposition {
        for ptr in [row_ptr, col_ptr] {
            if let Err(e) = self.check_word(cpu, ptr, true) {
                return Disposition::Complete(errno_of(e));
            }
        }
        self.send_global(
            cpu,
            MsgBody::GetCursor,
            Some(Pending::CursorReply { row_ptr, col_ptr }),
        )
    }

    pub(crate) fn sys_set_cursor_pos(&mut self, cpu: usize, row: u32, col: u32) -> Disposition {
        self.send_global(
            cpu,
            MsgBody::SetCursor {
                row: row as usize,
                col: col as usize,
            },
            Some(Pending::Reply),
        )
    }

    pub(crate) fn sys_set_term_color(&mut self, cpu: usize, color: u32) -> Disposition {
        if color > 0xFF {
            return Disposition::Complete(errno::EINVAL);
        }
        self.send_global(
            cpu,
            MsgBody::SetTermColor { color: color as u8 },
            Some(Pending::Reply),
        )
    }

    /// Validate one naturally-aligned user word.
    fn check_word(&self, cpu: usize, va: u32, need_writable: bool) -> Result<(), KernErr> {
        if va % 4 != 0 {
            return Err(KernErr::BaseNotAligned);
        }
        let pid = self.current_pid(cpu);
        let pcb = self.tasks.get(pid.0).ok_or(KernErr::PageNotAlloc)?;
        vm::check_user_mem(&pcb.pd, &self.machine, va, 4, false, need_writable)?;
        Ok(())
    }
}
