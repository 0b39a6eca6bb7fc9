//! Guest memory.
//!
//! Guest physical storage is modelled as reference-counted [`BackingMemory`]
//! blocks mapped into an [`AddressSpace`] with per-region permissions. Every
//! process owns one address space, shared by all cores that run its threads.

pub mod address_space;

pub use address_space::{AddressSpace, BackingMemory, VmaPermission};

/// Guest page size.
pub const PAGE_SIZE: u64 = 0x1000;

/// Base of the per-process thread-local storage area.
pub const TLS_AREA_VADDR: u64 = 0x4000_0000;

/// Size of the thread-local storage area.
pub const TLS_AREA_SIZE: u64 = 0x10_0000;

/// Size of one thread's TLS slot.
pub const TLS_ENTRY_SIZE: u64 = 0x200;

/// Number of TLS slots carved out of one page.
pub const TLS_SLOTS_PER_PAGE: usize = (PAGE_SIZE / TLS_ENTRY_SIZE) as usize;

/// Round `value` down to a page boundary.
#[inline]
pub const fn page_align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// Whether `value` sits on a page boundary.
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}
