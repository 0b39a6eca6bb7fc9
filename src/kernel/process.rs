//! Guest processes: address space, TLS area and handle table.

use super::wait::EventId;
use crate::config::NUM_CPU_CORES;
use crate::errors::{KernelError, KernelResult};
use crate::mem::{
    AddressSpace, VmaPermission, PAGE_SIZE, TLS_AREA_SIZE, TLS_AREA_VADDR, TLS_ENTRY_SIZE,
    TLS_SLOTS_PER_PAGE,
};
use crate::thread::ThreadId;
use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Pseudo-handle naming the calling thread.
pub const CURRENT_THREAD_HANDLE: u32 = 0xFFFF_8000;
/// Pseudo-handle naming the calling process.
pub const CURRENT_PROCESS_HANDLE: u32 = 0xFFFF_8001;

/// Handles a single process may hold at once.
pub const MAX_HANDLES: usize = 1024;

const ALL_CORES_MASK: u64 = (1 << NUM_CPU_CORES) - 1;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object a guest handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelObject {
    Thread(ThreadId),
    Event(EventId),
}

/// Per-process map from guest handles to kernel objects.
#[derive(Debug, Clone)]
pub struct HandleTable {
    entries: BTreeMap<u32, KernelObject>,
    next: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next: 1,
        }
    }

    /// Allocate a handle for `object`.
    pub fn create(&mut self, object: KernelObject) -> KernelResult<u32> {
        if self.entries.len() >= MAX_HANDLES {
            return Err(KernelError::OutOfResource);
        }
        while self.next == 0
            || self.next >= CURRENT_THREAD_HANDLE
            || self.entries.contains_key(&self.next)
        {
            self.next = self.next.wrapping_add(1);
        }
        let handle = self.next;
        self.next = self.next.wrapping_add(1);
        self.entries.insert(handle, object);
        Ok(handle)
    }

    pub fn get(&self, handle: u32) -> Option<KernelObject> {
        self.entries.get(&handle).copied()
    }

    pub fn close(&mut self, handle: u32) -> KernelResult<KernelObject> {
        self.entries
            .remove(&handle)
            .ok_or(KernelError::InvalidHandle(handle))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A guest process.
#[derive(Debug)]
pub struct Process {
    pub id: ProcessId,
    pub name: String,
    /// Core used for threads created with the ideal processor id.
    pub ideal_core: i32,
    /// Cores the process's threads may run on.
    pub core_mask: u64,
    space: Arc<AddressSpace>,
    /// One bitmap per mapped TLS page, bit `n` set while slot `n` is taken.
    tls_pages: Vec<u8>,
    handles: HandleTable,
}

impl Process {
    pub fn new(id: ProcessId, name: impl Into<String>, space: Arc<AddressSpace>) -> Self {
        Self {
            id,
            name: name.into(),
            ideal_core: 0,
            core_mask: ALL_CORES_MASK,
            space,
            tls_pages: Vec::new(),
            handles: HandleTable::new(),
        }
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut HandleTable {
        &mut self.handles
    }

    pub fn allows_core(&self, core: usize) -> bool {
        core < NUM_CPU_CORES && self.core_mask & (1 << core) != 0
    }

    /// Reserve a TLS slot, mapping a fresh page when every page is full.
    pub fn allocate_tls_slot(&mut self) -> KernelResult<u64> {
        const FULL: u8 = ((1u16 << TLS_SLOTS_PER_PAGE) - 1) as u8;

        let page = match self.tls_pages.iter().position(|bits| *bits != FULL) {
            Some(page) => page,
            None => {
                let page = self.tls_pages.len();
                let addr = TLS_AREA_VADDR + page as u64 * PAGE_SIZE;
                if addr + PAGE_SIZE > TLS_AREA_VADDR + TLS_AREA_SIZE {
                    tracing::error!(process = %self.id, "TLS area exhausted");
                    return Err(KernelError::OutOfResource);
                }
                self.space
                    .map_anonymous(addr, PAGE_SIZE, VmaPermission::READ_WRITE)?;
                self.tls_pages.push(0);
                page
            }
        };
        let bits = &mut self.tls_pages[page];
        let slot = bits.trailing_ones() as usize;
        *bits |= 1 << slot;
        Ok(TLS_AREA_VADDR + page as u64 * PAGE_SIZE + slot as u64 * TLS_ENTRY_SIZE)
    }

    /// Return the slot at `address` to the pool.
    pub fn free_tls_slot(&mut self, address: u64) {
        let Some(offset) = address.checked_sub(TLS_AREA_VADDR) else {
            return;
        };
        let page = (offset / PAGE_SIZE) as usize;
        let slot = (offset % PAGE_SIZE) / TLS_ENTRY_SIZE;
        if let Some(bits) = self.tls_pages.get_mut(page) {
            *bits &= !(1 << slot);
        }
    }

    /// Number of TLS slots currently reserved.
    pub fn tls_slots_in_use(&self) -> u32 {
        self.tls_pages.iter().map(|bits| bits.count_ones()).sum()
    }
}
