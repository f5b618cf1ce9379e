//! Kernel-wide constants and boot configuration.

use alloc::string::String;
use alloc::vec::Vec;

/// Size of one page / physical frame.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// First byte of user-visible physical memory. Everything below is the
/// kernel's identity-mapped region, shared by every page directory.
pub const USER_MEM_START: u32 = 0x0100_0000; // 16 MiB

/// Entries per page directory and per page table.
pub const NUM_PD_ENTRIES: usize = 1024;
pub const NUM_PT_ENTRIES: usize = 1024;

/// Page-directory entries covering the shared kernel region
/// (16 MiB / 4 MiB per table).
pub const NUM_PT_KERNEL: usize = 4;

/// Kernel stacks are 2^K_STACK_BITS bytes, aligned to their size.
pub const K_STACK_BITS: usize = 13;
pub const K_STACK_SIZE: usize = 1 << K_STACK_BITS;

/// One page-table lock covers this many consecutive PD entries.
pub const NUM_PT_PER_LOCK: usize = 64;
/// Number of page-table locks partitioning the user half of a PD.
pub const NUM_PT_LOCKS_PER_PD: usize =
    (NUM_PD_ENTRIES - NUM_PT_KERNEL + NUM_PT_PER_LOCK - 1) / NUM_PT_PER_LOCK;

/// Hard cap on CPUs the bus and per-CPU tables are sized for.
pub const MAX_CPUS: usize = 32;

/// The manager CPU. Workers are 1..n_cpus.
pub const MANAGER_CPU: usize = 0;

/// Capacity of every fixed-size kernel queue. Bounded by the number of
/// threads the system will admit; queues never allocate past boot.
pub const RUNQ_CAP: usize = 256;
pub const MSGQ_CAP: usize = 256;
pub const SLEEPQ_CAP: usize = 256;
pub const WAITQ_CAP: usize = 64;

/// Bucket counts for the pid and tid hashtables.
pub const TASK_TABLE_BUCKETS: usize = 64;
pub const THREAD_TABLE_BUCKETS: usize = 128;

/// Base of the user text image the loader maps, and the user stack.
pub const USER_TEXT_BASE: u32 = USER_MEM_START;
pub const USER_STACK_TOP: u32 = 0xFFFF_E000;
pub const USER_STACK_PAGES: usize = 16;

/// exec() argument limits.
pub const NAME_MAX: usize = 256;
pub const ARG_MAX: usize = 16;
pub const ARG_LEN_MAX: usize = 256;

/// Longest line the console will hand to readline().
pub const CONSOLE_LINE_MAX: usize = 512;

/// Everything `Kernel::boot` needs to bring the machine up.
#[derive(Clone)]
pub struct KernelConfig {
    /// Total CPUs including the manager. Must be at least 2.
    pub n_cpus: usize,
    /// Number of physical frames in the user pool.
    pub user_frames: usize,
    /// Files visible through readfile()/exec(), loaded into the RAM disk.
    pub ramdisk: Vec<(String, Vec<u8>)>,
}

impl KernelConfig {
    pub fn new(n_cpus: usize, user_frames: usize) -> Self {
        KernelConfig {
            n_cpus,
            user_frames,
            ramdisk: Vec::new(),
        }
    }

    /// Add a file to the boot RAM disk.
    pub fn with_file(mut self, name: &str, data: Vec<u8>) -> Self {
        self.ramdisk.push((String::from(name), data));
        self
    }

    /// Sanity-check the configuration before boot.
    pub fn validate(&self) -> bool {
        self.n_cpus >= 2 && self.n_cpus <= MAX_CPUS && self.user_frames > 0
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig::new(4, 1024)
    }
}
