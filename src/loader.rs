//! RAM disk and the task-image loader.
//!
//! The boot image is a flat table of named files; `readfile` serves
//! byte ranges out of it. Executables are flat images: a four-byte magic
//! followed by raw text that the loader copies to the fixed user text
//! base, plus a ZFOD stack region under the stack top. This is the
//! black-box loading interface the rest of the kernel consumes; swapping
//! in a real ELF walk would not change any caller.

use crate::config::{
    PAGE_SIZE, USER_STACK_PAGES, USER_STACK_TOP, USER_TEXT_BASE,
};
use crate::errors::{errno, KernErr};
use crate::machine::Machine;
use crate::memory::frames::FramePool;
use crate::memory::{vm, PageDir};
use crate::task::Tid;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

/// Flat-image magic.
pub const IMAGE_MAGIC: [u8; 4] = *b"\x7FCOS";

pub struct RamDisk {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl RamDisk {
    pub fn new(files: Vec<(String, Vec<u8>)>) -> RamDisk {
        let mut map = BTreeMap::new();
        for (name, data) in files {
            map.insert(name, data);
        }
        RamDisk { files: Mutex::new(map) }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    /// Read up to `buf.len()` bytes at `offset`. `None` when the file
    /// does not exist; reads past the end return 0 bytes.
    pub fn read(&self, name: &str, offset: usize, buf: &mut [u8]) -> Option<usize> {
        let files = self.files.lock();
        let data = files.get(name)?;
        if offset >= data.len() {
            return Some(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Some(n)
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).cloned()
    }
}

/// A freshly built address space, ready to install in a PCB.
pub struct LoadedImage {
    pub pd: PageDir,
    pub entry: u32,
}

/// Wrap raw text bytes in the flat-image header. Test and boot-image
/// convenience.
pub fn make_image(text: &[u8]) -> Vec<u8> {
    let mut img = Vec::with_capacity(4 + text.len());
    img.extend_from_slice(&IMAGE_MAGIC);
    img.extend_from_slice(text);
    img
}

/// Build a new address space from a named image: text mapped and copied
/// at the text base, stack ZFOD under the stack top. Errors are already
/// syscall codes (ENOENT, ENOEXEC, ENOMEM); nothing is consumed on
/// failure.
pub fn load_task(
    ramdisk: &RamDisk,
    frames: &FramePool,
    machine: &mut Machine,
    me: Tid,
    name: &str,
) -> Result<LoadedImage, i32> {
    let image = match ramdisk.file(name) {
        Some(f) => f,
        None => return Err(errno::ENOENT),
    };
    if image.len() < IMAGE_MAGIC.len() || image[..4] != IMAGE_MAGIC {
        return Err(errno::ENOEXEC);
    }
    let text = &image[IMAGE_MAGIC.len()..];
    // Even an empty text segment gets one page so the entry is mapped.
    let text_bytes = text.len().max(1);

    let mut pd = PageDir::new();
    let map = |e: KernErr| -> i32 {
        match e {
            KernErr::NotEnoughMem | KernErr::MallocLib => errno::ENOMEM,
            _ => errno::ENOEXEC,
        }
    };
    if let Err(e) = vm::new_region(
        &mut pd, frames, machine, me, USER_TEXT_BASE, text_bytes, true, false, false,
    ) {
        return Err(map(e));
    }
    let stack_base = USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u32;
    if let Err(e) = vm::new_region(
        &mut pd,
        frames,
        machine,
        me,
        stack_base,
        USER_STACK_PAGES * PAGE_SIZE,
        true,
        false,
        true,
    ) {
        vm::destroy_pd(&mut pd, frames, me);
        return Err(map(e));
    }
    if !text.is_empty() {
        if let Err(e) = vm::copy_to_user(&mut pd, frames, machine, me, USER_TEXT_BASE, text) {
            vm::destroy_pd(&mut pd, frames, me);
            return Err(map(e));
        }
    }
    Ok(LoadedImage { pd, entry: USER_TEXT_BASE })
}
