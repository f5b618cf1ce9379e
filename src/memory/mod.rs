//! Memory management: the physical-frame pool, the paging structures,
//! and the virtual-memory manager built on both.

pub mod frames;
pub mod paging;
pub mod vm;

pub use frames::FramePool;
pub use paging::{FaultCode, PageDir, Pte, PteFlags};
