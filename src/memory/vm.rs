//! Virtual-memory manager.
//!
//! Regions are committed against the frame pool before any page table is
//! touched, so overcommit fails with nothing to undo. ZFOD pages keep
//! their reservation but consume no raw frame until first touch; the
//! fault path materializes them under the covering page-table lock, the
//! whole read-check-materialize sequence inside the critical section so
//! two threads faulting on the same page cannot double-allocate.

use crate::errors::KernErr;
use crate::machine::Machine;
use crate::memory::frames::FramePool;
use crate::memory::paging::{
    self, is_kernel_va, is_page_aligned, PageDir, Pte, PteFlags, FaultCode,
};
use crate::config::PAGE_SIZE;
use crate::task::Tid;
use alloc::vec::Vec;

/// Outcome of the page-fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultFix {
    /// A ZFOD page was backed with a zeroed frame; retry the access.
    Materialized,
    /// Not a fault the VM can repair; deliver swexn or kill the task.
    Unhandled,
}

fn user_flags(writable: bool) -> PteFlags {
    let mut f = PteFlags::USER;
    if writable {
        f |= PteFlags::WRITABLE;
    }
    f
}

/// Map `size` bytes at `va`. Frames for the whole region are reserved up
/// front; ZFOD pages retain the reservation without consuming a frame.
/// Fails with `Overlap` (rolling back everything mapped by this call) if
/// any page is already allocated. When `is_new_pages` is set the first
/// and last entries are bracketed so `remove_pages` can find the region.
pub fn new_region(
    pd: &mut PageDir,
    frames: &FramePool,
    machine: &mut Machine,
    me: Tid,
    va: u32,
    size: usize,
    writable: bool,
    is_new_pages: bool,
    is_zfod: bool,
) -> Result<(), KernErr> {
    debug_assert!(is_page_aligned(va));
    if size == 0 {
        return Err(KernErr::Len);
    }
    let n_pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    let end = va as u64 + (n_pages * PAGE_SIZE) as u64;
    if is_kernel_va(va) || end > (1u64 << 32) {
        return Err(KernErr::KernelSpace);
    }

    frames.reserve(n_pages)?;

    let mut mapped: Vec<(u32, Option<u32>)> = Vec::with_capacity(n_pages);
    let mut fail: Option<KernErr> = None;

    for i in 0..n_pages {
        let page = va + (i * PAGE_SIZE) as u32;
        pd.pt_lock(page).lock(me);
        let existing = pd.pte(page).unwrap_or(Pte::zero());
        if existing.is_allocated() {
            pd.pt_lock(page).unlock(me);
            fail = Some(KernErr::Overlap);
            break;
        }
        let mut flags = user_flags(writable);
        if is_new_pages && i == 0 {
            flags |= PteFlags::REGION_START;
        }
        if is_new_pages && i == n_pages - 1 {
            flags |= PteFlags::REGION_END;
        }
        if is_zfod {
            *pd.pte_mut(page) = Pte::new(0, flags | PteFlags::ZFOD);
            mapped.push((page, None));
        } else {
            let base = match frames.get_raw(me) {
                Ok(b) => b,
                Err(e) => {
                    pd.pt_lock(page).unlock(me);
                    fail = Some(e);
                    break;
                }
            };
            machine.zero_frame(base);
            *pd.pte_mut(page) = Pte::new(base, flags | PteFlags::PRESENT);
            mapped.push((page, Some(base)));
        }
        pd.pt_lock(page).unlock(me);
    }

    if let Some(e) = fail {
        // Unwind this call's pages and give the whole commitment back.
        for (page, frame) in mapped {
            pd.clear_pte(page);
            if let Some(base) = frame {
                frames.free_raw(me, base);
            }
        }
        frames.unreserve(n_pages);
        return Err(e);
    }
    Ok(())
}

/// The new_pages syscall body: validate, then map a ZFOD region
/// bracketed by START/END.
pub fn new_pages(
    pd: &mut PageDir,
    frames: &FramePool,
    machine: &mut Machine,
    me: Tid,
    base: u32,
    len: usize,
) -> Result<(), KernErr> {
    if !is_page_aligned(base) {
        return Err(KernErr::BaseNotAligned);
    }
    if len == 0 || len % PAGE_SIZE != 0 {
        return Err(KernErr::Len);
    }
    if is_kernel_va(base) || base as u64 + len as u64 > (1u64 << 32) {
        return Err(KernErr::KernelSpace);
    }
    new_region(pd, frames, machine, me, base, len, true, true, true)
}

/// The remove_pages syscall body: unmap the region starting at `base`,
/// which must carry the START bracket, through its END bracket. Frames
/// never materialized give back only their reservation.
pub fn remove_pages(
    pd: &mut PageDir,
    frames: &FramePool,
    me: Tid,
    base: u32,
) -> Result<(), KernErr> {
    if !is_page_aligned(base) {
        return Err(KernErr::BaseNotAligned);
    }
    if is_kernel_va(base) {
        return Err(KernErr::KernelSpace);
    }
    let first = pd.pte(base).unwrap_or(Pte::zero());
    if !first.is_allocated() || !first.flags().contains(PteFlags::REGION_START) {
        return Err(KernErr::BaseNotPrev);
    }

    let mut va = base;
    loop {
        let pte = pd.pte(va).unwrap_or(Pte::zero());
        debug_assert!(pte.is_allocated(), "hole inside a new_pages region");
        if !pte.is_allocated() {
            break;
        }
        pd.pt_lock(va).lock(me);
        if pte.is_present() {
            frames.free_raw(me, pte.frame_base());
        }
        frames.unreserve(1);
        let at_end = pte.flags().contains(PteFlags::REGION_END);
        pd.clear_pte(va); // TLB shootdown is a no-op in the model
        pd.pt_lock(va).unlock(me);
        if at_end {
            break;
        }
        va = match va.checked_add(PAGE_SIZE as u32) {
            Some(v) => v,
            None => break,
        };
    }
    Ok(())
}

/// Make the page containing `va` present, materializing ZFOD. Fails for
/// kernel addresses, unallocated pages, and writes through read-only
/// mappings.
pub fn ensure_present(
    pd: &mut PageDir,
    frames: &FramePool,
    machine: &mut Machine,
    me: Tid,
    va: u32,
    write: bool,
) -> Result<Pte, KernErr> {
    if is_kernel_va(va) {
        return Err(KernErr::KernelSpace);
    }
    let page = paging::page_base(va);
    pd.pt_lock(page).lock(me);
    let pte = pd.pte(page).unwrap_or(Pte::zero());
    let out = if !pte.is_allocated() {
        Err(KernErr::PageNotAlloc)
    } else if write && !pte.is_writable() {
        Err(KernErr::ReadOnly)
    } else if pte.is_present() {
        Ok(pte)
    } else {
        // ZFOD: back it with a zeroed frame, keeping the region brackets.
        match frames.get_raw(me) {
            Ok(base) => {
                machine.zero_frame(base);
                let flags = (pte.flags() - PteFlags::ZFOD) | PteFlags::PRESENT;
                let fresh = Pte::new(base, flags);
                *pd.pte_mut(page) = fresh;
                Ok(fresh)
            }
            Err(e) => Err(e),
        }
    };
    pd.pt_lock(page).unlock(me);
    out
}

/// Page-fault entry. Only a non-present fault on a ZFOD page is
/// repairable; everything else goes to swexn delivery or the task kill
/// path.
pub fn handle_fault(
    pd: &mut PageDir,
    frames: &FramePool,
    machine: &mut Machine,
    me: Tid,
    va: u32,
    code: FaultCode,
) -> FaultFix {
    if is_kernel_va(va) || code.contains(FaultCode::PROTECTION) {
        return FaultFix::Unhandled;
    }
    let write = code.contains(FaultCode::WRITE);
    match ensure_present(pd, frames, machine, me, va, write) {
        Ok(_) => FaultFix::Materialized,
        Err(_) => FaultFix::Unhandled,
    }
}

/// Validate a user range the way every pointer-taking syscall must.
///
/// With `need_null_term` the walk stops at the first NUL within
/// `max_bytes` and returns the string length; otherwise all `max_bytes`
/// must be allocated. ZFOD pages count as allocated and read as zero
/// without being materialized.
pub fn check_user_mem(
    pd: &PageDir,
    machine: &Machine,
    va: u32,
    max_bytes: usize,
    need_null_term: bool,
    need_writable: bool,
) -> Result<usize, KernErr> {
    if max_bytes == 0 {
        return Ok(0);
    }
    if need_null_term {
        for i in 0..max_bytes {
            let addr = match va.checked_add(i as u32) {
                Some(a) => a,
                None => return Err(KernErr::KernelSpace),
            };
            let b = user_byte(pd, machine, addr, need_writable)?;
            if b == 0 {
                return Ok(i);
            }
        }
        Err(KernErr::NotNullTerm)
    } else {
        let end = va as u64 + max_bytes as u64;
        if is_kernel_va(va) || end > (1u64 << 32) {
            return Err(KernErr::KernelSpace);
        }
        let mut page = paging::page_base(va);
        loop {
            check_page(pd, page, need_writable)?;
            match page.checked_add(PAGE_SIZE as u32) {
                Some(next) if (next as u64) < end => page = next,
                _ => break,
            }
        }
        Ok(max_bytes)
    }
}

fn check_page(pd: &PageDir, page: u32, need_writable: bool) -> Result<Pte, KernErr> {
    if is_kernel_va(page) {
        return Err(KernErr::KernelSpace);
    }
    let pte = pd.pte(page).unwrap_or(Pte::zero());
    if !pte.is_allocated() {
        return Err(KernErr::PageNotAlloc);
    }
    if need_writable && !pte.is_writable() {
        return Err(KernErr::ReadOnly);
    }
    Ok(pte)
}

fn user_byte(pd: &PageDir, machine: &Machine, va: u32, need_writable: bool) -> Result<u8, KernErr> {
    let pte = check_page(pd, paging::page_base(va), need_writable)?;
    if pte.is_present() {
        Ok(machine.frame(pte.frame_base())[va as usize % PAGE_SIZE])
    } else {
        Ok(0) // ZFOD reads as zero
    }
}

/// Kernel copy-in. ZFOD pages read as zeros without being materialized.
pub fn copy_from_user(
    pd: &PageDir,
    machine: &Machine,
    va: u32,
    buf: &mut [u8],
) -> Result<(), KernErr> {
    for (i, slot) in buf.iter_mut().enumerate() {
        let addr = va.checked_add(i as u32).ok_or(KernErr::KernelSpace)?;
        *slot = user_byte(pd, machine, addr, false)?;
    }
    Ok(())
}

/// Kernel copy-out. Materializes ZFOD pages it writes through.
pub fn copy_to_user(
    pd: &mut PageDir,
    frames: &FramePool,
    machine: &mut Machine,
    me: Tid,
    va: u32,
    bytes: &[u8],
) -> Result<(), KernErr> {
    let mut off = 0usize;
    while off < bytes.len() {
        let addr = va.checked_add(off as u32).ok_or(KernErr::KernelSpace)?;
        let pte = ensure_present(pd, frames, machine, me, addr, true)?;
        let page_off = addr as usize % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_off).min(bytes.len() - off);
        machine.frame_mut(pte.frame_base())[page_off..page_off + chunk]
            .copy_from_slice(&bytes[off..off + chunk]);
        off += chunk;
    }
    Ok(())
}

/// Read a naturally-aligned user word.
pub fn read_user_u32(pd: &PageDir, machine: &Machine, va: u32) -> Result<u32, KernErr> {
    if va % 4 != 0 {
        return Err(KernErr::BaseNotAligned);
    }
    let mut b = [0u8; 4];
    copy_from_user(pd, machine, va, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Write a naturally-aligned user word.
pub fn write_user_u32(
    pd: &mut PageDir,
    frames: &FramePool,
    machine: &mut Machine,
    me: Tid,
    va: u32,
    val: u32,
) -> Result<(), KernErr> {
    if va % 4 != 0 {
        return Err(KernErr::BaseNotAligned);
    }
    copy_to_user(pd, frames, machine, me, va, &val.to_le_bytes())
}

/// Read a NUL-terminated user string of at most `max` bytes.
pub fn read_user_cstr(
    pd: &PageDir,
    machine: &Machine,
    va: u32,
    max: usize,
) -> Result<Vec<u8>, KernErr> {
    let len = check_user_mem(pd, machine, va, max, true, false)?;
    let mut buf = alloc::vec![0u8; len];
    copy_from_user(pd, machine, va, &mut buf)?;
    Ok(buf)
}

/// Deep-copy a user address space for fork. Every present page gets a
/// fresh frame with the bytes copied; ZFOD entries stay ZFOD. On failure
/// the half-built directory is torn down and nothing is consumed.
pub fn clone_pd(
    src: &PageDir,
    frames: &FramePool,
    machine: &mut Machine,
    me: Tid,
) -> Result<PageDir, KernErr> {
    let pages = src.user_pages();
    let n = pages.len();
    frames.reserve(n)?;

    let mut child = PageDir::new();
    let mut copied: Vec<u32> = Vec::new();
    for (va, pte) in pages {
        if pte.is_present() {
            let base = match frames.get_raw(me) {
                Ok(b) => b,
                Err(e) => {
                    for b in copied {
                        frames.free_raw(me, b);
                    }
                    frames.unreserve(n);
                    return Err(e);
                }
            };
            machine.copy_frame(base, pte.frame_base());
            *child.pte_mut(va) = Pte::new(base, pte.flags());
            copied.push(base);
        } else {
            *child.pte_mut(va) = pte;
        }
    }
    Ok(child)
}

/// Release every user page of a dying address space.
pub fn destroy_pd(pd: &mut PageDir, frames: &FramePool, me: Tid) {
    for (va, pte) in pd.user_pages() {
        if pte.is_present() {
            frames.free_raw(me, pte.frame_base());
        }
        frames.unreserve(1);
        pd.clear_pte(va);
    }
}

/// Allocated user pages, split (present, zfod). Drives the frame
/// accounting invariants in tests.
pub fn page_census(pd: &PageDir) -> (usize, usize) {
    let mut present = 0;
    let mut zfod = 0;
    for (_, pte) in pd.user_pages() {
        if pte.is_present() {
            present += 1;
        } else {
            zfod += 1;
        }
    }
    (present, zfod)
}
