//! 32-bit two-level paging structures.
//!
//! Entries carry the exact x86 bit layout: frame base in bits 31..12,
//! flags in the low twelve. The three "available" bits mark the start and
//! end of a new_pages region and ZFOD pages. The first `NUM_PT_KERNEL`
//! directory entries are the kernel's identity-mapped share, one logical
//! page table referenced by every directory, so a directory switch never
//! loses kernel mappings; the model represents that share implicitly and
//! refuses user entries below `USER_MEM_START`.

use crate::config::{
    NUM_PD_ENTRIES, NUM_PT_ENTRIES, NUM_PT_KERNEL, NUM_PT_LOCKS_PER_PD, NUM_PT_PER_LOCK,
    PAGE_SHIFT, PAGE_SIZE, USER_MEM_START,
};
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::vec::Vec;
use bit_field::BitField;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT      = 1 << 0;
        const WRITABLE     = 1 << 1;
        const USER         = 1 << 2;
        const GLOBAL       = 1 << 8;
        /// First page of a new_pages region.
        const REGION_START = 1 << 9;
        /// Last page of a new_pages region.
        const REGION_END   = 1 << 10;
        /// Allocated but not yet backed; zero-filled on first touch.
        const ZFOD         = 1 << 11;
    }
}

bitflags! {
    /// Page-fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Set when the fault was a protection violation on a present
        /// page; clear when the page was not present.
        const PROTECTION = 1 << 0;
        const WRITE      = 1 << 1;
        const USER       = 1 << 2;
    }
}

/// One page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u32);

impl Pte {
    pub const fn zero() -> Pte {
        Pte(0)
    }

    pub fn new(frame_base: u32, flags: PteFlags) -> Pte {
        debug_assert_eq!(frame_base as usize % PAGE_SIZE, 0);
        Pte(frame_base | flags.bits())
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn frame_base(self) -> u32 {
        self.0.get_bits(12..32) << PAGE_SHIFT
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xFFF)
    }

    pub fn is_unmapped(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_zfod(self) -> bool {
        self.flags().contains(PteFlags::ZFOD)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    /// Present or ZFOD: the page belongs to some allocation.
    pub fn is_allocated(self) -> bool {
        self.is_present() || self.is_zfod()
    }
}

pub struct PageTable {
    entries: [Pte; NUM_PT_ENTRIES],
}

impl PageTable {
    fn new_boxed() -> Box<PageTable> {
        Box::new(PageTable {
            entries: [Pte::zero(); NUM_PT_ENTRIES],
        })
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_unmapped())
    }
}

/// Directory index of a virtual address.
pub fn pd_index(va: u32) -> usize {
    (va >> 22) as usize
}

/// Table index of a virtual address.
pub fn pt_index(va: u32) -> usize {
    ((va >> 12) & 0x3FF) as usize
}

/// Which of the per-directory page-table locks covers this directory
/// entry.
pub fn lock_index(pdi: usize) -> usize {
    debug_assert!(pdi >= NUM_PT_KERNEL);
    (pdi - NUM_PT_KERNEL) / NUM_PT_PER_LOCK
}

pub fn is_kernel_va(va: u32) -> bool {
    va < USER_MEM_START
}

pub fn page_base(va: u32) -> u32 {
    va & !(PAGE_SIZE as u32 - 1)
}

pub fn is_page_aligned(va: u32) -> bool {
    va as usize % PAGE_SIZE == 0
}

/// A task's page directory: the user half of the 1024 entries, plus the
/// lock array partitioning it so parallel mapping by threads of one task
/// does not serialize globally.
pub struct PageDir {
    tables: Vec<Option<Box<PageTable>>>,
    pt_locks: Vec<Mutex>,
}

impl PageDir {
    pub fn new() -> PageDir {
        let mut tables = Vec::with_capacity(NUM_PD_ENTRIES);
        for _ in 0..NUM_PD_ENTRIES {
            tables.push(None);
        }
        let mut pt_locks = Vec::with_capacity(NUM_PT_LOCKS_PER_PD);
        for _ in 0..NUM_PT_LOCKS_PER_PD {
            pt_locks.push(Mutex::new());
        }
        PageDir { tables, pt_locks }
    }

    /// The lock covering `va`'s page-table range.
    pub fn pt_lock(&self, va: u32) -> &Mutex {
        &self.pt_locks[lock_index(pd_index(va))]
    }

    /// Entry for `va`, if its page table exists. Kernel addresses have no
    /// user entry.
    pub fn pte(&self, va: u32) -> Option<Pte> {
        if is_kernel_va(va) {
            return None;
        }
        let pt = self.tables[pd_index(va)].as_ref()?;
        Some(pt.entries[pt_index(va)])
    }

    /// Mutable entry for `va`; inserts the page table if absent.
    pub fn pte_mut(&mut self, va: u32) -> &mut Pte {
        debug_assert!(!is_kernel_va(va));
        let slot = &mut self.tables[pd_index(va)];
        if slot.is_none() {
            *slot = Some(PageTable::new_boxed());
        }
        &mut slot.as_mut().expect("just inserted").entries[pt_index(va)]
    }

    /// Clear the entry for `va`, dropping its page table once empty.
    pub fn clear_pte(&mut self, va: u32) {
        debug_assert!(!is_kernel_va(va));
        let pdi = pd_index(va);
        if let Some(pt) = self.tables[pdi].as_mut() {
            pt.entries[pt_index(va)] = Pte::zero();
            if pt.is_empty() {
                self.tables[pdi] = None;
            }
        }
    }

    /// Every allocated (present or ZFOD) user page, ascending by address.
    pub fn user_pages(&self) -> Vec<(u32, Pte)> {
        let mut pages = Vec::new();
        for (pdi, slot) in self.tables.iter().enumerate() {
            let pt = match slot {
                Some(pt) => pt,
                None => continue,
            };
            for (pti, &pte) in pt.entries.iter().enumerate() {
                if pte.is_allocated() {
                    let va = ((pdi as u32) << 22) | ((pti as u32) << 12);
                    pages.push((va, pte));
                }
            }
        }
        pages
    }
}

impl Default for PageDir {
    fn default() -> Self {
        PageDir::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_roundtrips_base_and_flags() {
        let base = USER_MEM_START + 5 * PAGE_SIZE as u32;
        let pte = Pte::new(base, PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE);
        assert_eq!(pte.frame_base(), base);
        assert!(pte.is_present() && pte.is_writable());
        assert!(!pte.is_zfod());
    }

    #[test]
    fn zfod_pte_is_allocated_but_not_present() {
        let pte = Pte::new(0, PteFlags::USER | PteFlags::WRITABLE | PteFlags::ZFOD);
        assert!(!pte.is_present());
        assert!(pte.is_allocated());
    }

    #[test]
    fn indices_split_the_address() {
        let va = 0x0040_3000u32; // pd 1, pt 3
        assert_eq!(pd_index(va), 1);
        assert_eq!(pt_index(va), 3);
        assert_eq!(pd_index(USER_MEM_START), NUM_PT_KERNEL);
    }

    #[test]
    fn directory_inserts_and_drops_tables() {
        let mut pd = PageDir::new();
        let va = USER_MEM_START + 0x1000;
        assert_eq!(pd.pte(va), None);
        *pd.pte_mut(va) = Pte::new(USER_MEM_START, PteFlags::PRESENT | PteFlags::USER);
        assert!(pd.pte(va).unwrap().is_present());
        assert_eq!(pd.user_pages().len(), 1);
        pd.clear_pte(va);
        // Table became empty and was dropped; lookup goes back to None.
        assert_eq!(pd.pte(va), None);
    }

    #[test]
    fn kernel_addresses_have_no_user_entry() {
        let pd = PageDir::new();
        assert_eq!(pd.pte(0x1000), None);
        assert!(is_kernel_va(USER_MEM_START - 1));
        assert!(!is_kernel_va(USER_MEM_START));
    }
}
