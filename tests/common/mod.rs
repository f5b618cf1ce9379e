//! Test harness: boot a kernel, drive CPUs, and run syscalls on behalf
//! of user threads.

#![allow(dead_code)]

use courier_os::loader::make_image;
use courier_os::{Disposition, Kernel, KernelConfig, Pid, Syscall, Tid};

/// A word-aligned scratch address inside every task's stack region.
pub const SCRATCH: u32 = 0xFFFF_D000;

/// Boot with `n_cpus` (one manager + workers) and an init task running
/// on CPU 1.
pub fn boot(n_cpus: usize, frames: usize) -> (Kernel, Pid, Tid) {
    let cfg = KernelConfig::new(n_cpus, frames)
        .with_file("init", make_image(b"init text"))
        .with_file("shell", make_image(b"shell text"))
        .with_file("notes.txt", b"just data, not runnable".to_vec());
    let mut k = Kernel::boot(cfg);
    let (pid, tid) = k.spawn_init("init", 1).expect("init loads");
    k.trap_timer(1);
    assert_eq!(k.current(1), tid, "init must be running after the first tick");
    (k, pid, tid)
}

/// One full round: manager loop plus a tick on every worker.
pub fn pump(k: &mut Kernel) {
    k.manager_run();
    for cpu in 1..k.n_cpus() {
        k.trap_timer(cpu);
    }
    k.manager_run();
}

/// Rotate `cpu` until `tid` is its current thread.
pub fn run_on(k: &mut Kernel, cpu: usize, tid: Tid) {
    for _ in 0..1000 {
        if k.current(cpu) == tid {
            return;
        }
        k.manager_run();
        k.trap_timer(cpu);
    }
    panic!("thread {} never became current on cpu{}", tid, cpu);
}

/// Issue a syscall as `tid`. `None` means the thread suspended; its
/// result must be collected with [`finish`] (or never, for vanish).
pub fn start(k: &mut Kernel, cpu: usize, tid: Tid, call: Syscall) -> Option<i32> {
    run_on(k, cpu, tid);
    match k.trap_syscall(cpu, call) {
        Disposition::Complete(v) => Some(v),
        Disposition::Suspended => None,
    }
}

/// Pump until a suspended thread's syscall result lands.
pub fn finish(k: &mut Kernel, cpu: usize, tid: Tid) -> i32 {
    for _ in 0..1000 {
        if let Some(v) = k.take_result(tid) {
            return v;
        }
        k.manager_run();
        k.trap_timer(cpu);
    }
    panic!("thread {} never completed its syscall", tid);
}

/// Run a syscall to completion.
pub fn call(k: &mut Kernel, cpu: usize, tid: Tid, sc: Syscall) -> i32 {
    match start(k, cpu, tid, sc) {
        Some(v) => v,
        None => finish(k, cpu, tid),
    }
}

/// Fork from `(cpu, tid)`; returns the child's pid, tid, and home CPU.
pub fn fork_child(k: &mut Kernel, cpu: usize, tid: Tid) -> (Pid, Tid, usize) {
    let pid = call(k, cpu, tid, Syscall::Fork);
    assert!(pid > 0, "fork failed: {}", pid);
    let child_pid = Pid(pid);
    let child_tid = k.thread_of_task(child_pid).expect("child thread exists");
    let home = k.thread_home(child_tid).expect("child has a home cpu");
    (child_pid, child_tid, home)
}

/// Child exits with `status`: set_status then vanish, then let the
/// teardown drain.
pub fn exit_with(k: &mut Kernel, cpu: usize, tid: Tid, status: i32) {
    assert_eq!(call(k, cpu, tid, Syscall::SetStatus { status }), 0);
    assert!(start(k, cpu, tid, Syscall::Vanish).is_none());
    pump(k);
}
