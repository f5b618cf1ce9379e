//! The syscall surface.
//!
//! A worker classifies each trapped call as local (runs to completion on
//! the calling CPU) or global (marshalled into a message, executed
//! serially on the manager). Local calls: gettid, get_ticks, thread_fork,
//! exec, set_status, sleep, yield within this CPU, new_pages,
//! remove_pages, swexn, readfile, halt. Global calls: fork, wait, vanish,
//! deschedule, make_runnable, cross-CPU yield, and all console I/O.

pub mod local;
pub mod manager;

use crate::kernel::{Disposition, Kernel};
use crate::task::Tid;

/// One trapped system call, arguments as the raw register words user
/// code would have passed. Pointer arguments are user virtual addresses
/// and are validated before any dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Gettid,
    GetTicks,
    Fork,
    ThreadFork,
    Exec { name: u32, argv: u32 },
    SetStatus { status: i32 },
    Vanish,
    Wait { status_ptr: u32 },
    Yield { tid: i32 },
    Deschedule { reject_ptr: u32 },
    MakeRunnable { tid: i32 },
    Sleep { ticks: i32 },
    NewPages { base: u32, len: u32 },
    RemovePages { base: u32 },
    Swexn { esp3: u32, eip: u32, arg: u32, newureg: u32 },
    Print { buf: u32, len: u32 },
    Readline { buf: u32, len: u32 },
    GetCursorPos { row_ptr: u32, col_ptr: u32 },
    SetCursorPos { row: u32, col: u32 },
    SetTermColor { color: u32 },
    Getchar,
    Readfile { name: u32, buf: u32, count: u32, offset: u32 },
    Halt,
}

impl Kernel {
    /// Trap-gate entry on a worker CPU, running as that CPU's current
    /// thread.
    pub fn trap_syscall(&mut self, cpu: usize, call: Syscall) -> Disposition {
        assert!(cpu != crate::config::MANAGER_CPU, "syscalls trap on workers");
        let cur: Tid = self.current(cpu);
        assert!(cur != self.idle_tid(cpu), "idle thread cannot make syscalls");
        if let Some(tcb) = self.threads.get_mut(cur.0) {
            tcb.has_result = false;
        }
        log::trace!(target: "syscall", "cpu{} thread {}: {:?}", cpu, cur, call);

        match call {
            Syscall::Gettid => Disposition::Complete(cur.0),
            Syscall::GetTicks => Disposition::Complete(self.machine.ticks() as i32),
            Syscall::ThreadFork => self.sys_thread_fork(cpu),
            Syscall::Exec { name, argv } => self.sys_exec(cpu, name, argv),
            Syscall::SetStatus { status } => self.sys_set_status(cpu, status),
            Syscall::Sleep { ticks } => self.sys_sleep(cpu, ticks),
            Syscall::Yield { tid } => self.sys_yield(cpu, tid),
            Syscall::NewPages { base, len } => self.sys_new_pages(cpu, base, len),
            Syscall::RemovePages { base } => self.sys_remove_pages(cpu, base),
            Syscall::Swexn { esp3, eip, arg, newureg } => {
                self.sys_swexn(cpu, esp3, eip, arg, newureg)
            }
            Syscall::Readfile { name, buf, count, offset } => {
                self.sys_readfile(cpu, name, buf, count, offset)
            }
            Syscall::Halt => self.sys_halt(cpu),

            Syscall::Fork => self.sys_fork(cpu),
            Syscall::Wait { status_ptr } => self.sys_wait(cpu, status_ptr),
            Syscall::Vanish => self.sys_vanish(cpu),
            Syscall::Deschedule { reject_ptr } => self.sys_deschedule(cpu, reject_ptr),
            Syscall::MakeRunnable { tid } => self.sys_make_runnable(cpu, tid),
            Syscall::Print { buf, len } => self.sys_print(cpu, buf, len),
            Syscall::Readline { buf, len } => self.sys_readline(cpu, buf, len),
            Syscall::GetCursorPos { row_ptr, col_ptr } => {
                self.sys_get_cursor_pos(cpu, row_ptr, col_ptr)
            }
            Syscall::SetCursorPos { row, col } => self.sys_set_cursor_pos(cpu, row, col),
            Syscall::SetTermColor { color } => self.sys_set_term_color(cpu, color),
            Syscall::Getchar => self.sys_getchar(cpu),
        }
    }
}
