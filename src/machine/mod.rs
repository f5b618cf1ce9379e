//! The modeled hardware: physical RAM for the user frame pool, per-CPU
//! interrupt-enable flags, the global tick counter, and the text console.
//!
//! Frame contents are real bytes so fork's deep copy, ZFOD zeroing, and
//! user loads/stores behave exactly as they would against silicon.

pub mod console;

use crate::config::{PAGE_SIZE, USER_MEM_START};
use alloc::vec;
use alloc::vec::Vec;
use console::Console;

pub struct Machine {
    ram: Vec<u8>,
    n_frames: usize,
    irq_enabled: Vec<bool>,
    ticks: u64,
    halted: bool,
    pub console: Console,
}

impl Machine {
    pub fn new(n_cpus: usize, user_frames: usize) -> Machine {
        Machine {
            ram: vec![0u8; user_frames * PAGE_SIZE],
            n_frames: user_frames,
            irq_enabled: vec![true; n_cpus],
            ticks: 0,
            halted: false,
            console: Console::new(),
        }
    }

    fn frame_offset(&self, base: u32) -> usize {
        debug_assert_eq!(base as usize % PAGE_SIZE, 0, "unaligned frame base");
        let off = (base - USER_MEM_START) as usize;
        debug_assert!(off / PAGE_SIZE < self.n_frames, "frame base out of pool");
        off
    }

    /// The page of physical memory at `base`.
    pub fn frame(&self, base: u32) -> &[u8] {
        let off = self.frame_offset(base);
        &self.ram[off..off + PAGE_SIZE]
    }

    pub fn frame_mut(&mut self, base: u32) -> &mut [u8] {
        let off = self.frame_offset(base);
        &mut self.ram[off..off + PAGE_SIZE]
    }

    pub fn zero_frame(&mut self, base: u32) {
        self.frame_mut(base).fill(0);
    }

    /// Copy one whole frame. Used by fork's deep clone.
    pub fn copy_frame(&mut self, dst: u32, src: u32) {
        let s = self.frame_offset(src);
        let d = self.frame_offset(dst);
        self.ram.copy_within(s..s + PAGE_SIZE, d);
    }

    // ── Interrupt flag discipline ──
    //
    // Spinlocked sections that interrupt handlers can also enter run with
    // the local IF flag cleared; callers save and restore around the
    // critical section.

    pub fn irq_save(&mut self, cpu: usize) -> bool {
        let was = self.irq_enabled[cpu];
        self.irq_enabled[cpu] = false;
        was
    }

    pub fn irq_restore(&mut self, cpu: usize, was: bool) {
        self.irq_enabled[cpu] = was;
    }

    pub fn interrupts_enabled(&self, cpu: usize) -> bool {
        self.irq_enabled[cpu]
    }

    // ── Timer and halt ──

    /// Advance the global tick (driven by the manager CPU's timer).
    pub fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}
