//! Memory port used by the execution backends.

use super::exclusive::ExclusiveMonitor;
use super::isa::AccessSize;
use crate::errors::MemoryResult;
use crate::mem::AddressSpace;
use std::sync::Arc;

/// One core's view of guest memory.
///
/// Ordinary stores are routed through the exclusive monitor so they break
/// other cores' reservations, and exclusive stores commit through it.
#[derive(Clone)]
pub struct GuestBus {
    core: usize,
    space: Arc<AddressSpace>,
    monitor: Arc<ExclusiveMonitor>,
}

impl GuestBus {
    pub fn new(core: usize, space: Arc<AddressSpace>, monitor: Arc<ExclusiveMonitor>) -> Self {
        Self {
            core,
            space,
            monitor,
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn set_space(&mut self, space: Arc<AddressSpace>) {
        self.space = space;
    }

    pub fn monitor(&self) -> &Arc<ExclusiveMonitor> {
        &self.monitor
    }

    pub fn fetch(&self, pc: u64) -> MemoryResult<u32> {
        self.space.fetch(pc)
    }

    /// Zero-extended load.
    pub fn load(&self, addr: u64, size: AccessSize) -> MemoryResult<u64> {
        self.space.read_sized(addr, size.bytes())
    }

    pub fn store(&self, addr: u64, size: AccessSize, value: u64) -> MemoryResult<()> {
        let len = size.bytes();
        self.monitor
            .store_notify(self.core, addr, len, || self.space.write_sized(addr, len, value))
    }

    /// Load and open a reservation on the accessed granule.
    pub fn load_exclusive(&self, addr: u64, size: AccessSize) -> MemoryResult<u64> {
        self.monitor.set_exclusive(self.core, addr);
        let value = self.load(addr, size);
        if value.is_err() {
            self.monitor.clear_exclusive(self.core);
        }
        value
    }

    /// Commit a store if the reservation survived; `Ok(false)` otherwise.
    pub fn store_exclusive(&self, addr: u64, size: AccessSize, value: u64) -> MemoryResult<bool> {
        let (core, space) = (self.core, &*self.space);
        match size {
            AccessSize::Byte => self.monitor.exclusive_write8(core, addr, value as u8, space),
            AccessSize::Half => self.monitor.exclusive_write16(core, addr, value as u16, space),
            AccessSize::Word => self.monitor.exclusive_write32(core, addr, value as u32, space),
            AccessSize::Double => self.monitor.exclusive_write64(core, addr, value, space),
        }
    }

    pub fn clear_exclusive(&self) {
        self.monitor.clear_exclusive(self.core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::VmaPermission;

    fn two_cores() -> (GuestBus, GuestBus) {
        let space = Arc::new(AddressSpace::new());
        space
            .map_anonymous(0x1000, 0x1000, VmaPermission::READ_WRITE)
            .unwrap();
        let monitor = Arc::new(ExclusiveMonitor::new());
        (
            GuestBus::new(0, Arc::clone(&space), Arc::clone(&monitor)),
            GuestBus::new(1, space, monitor),
        )
    }

    #[test]
    fn unaligned_store_into_reserved_granule_fails_store_exclusive() {
        let (a, b) = two_cores();
        let seen = a.load_exclusive(0x1010, AccessSize::Double).unwrap();
        b.store(0x100C, AccessSize::Double, u64::MAX).unwrap();
        assert!(!a.store_exclusive(0x1010, AccessSize::Double, seen + 1).unwrap());
        assert_eq!(a.load(0x1010, AccessSize::Word).unwrap(), 0xFFFF_FFFF);
    }

    #[test]
    fn own_store_keeps_reservation() {
        let (a, _) = two_cores();
        let seen = a.load_exclusive(0x1020, AccessSize::Word).unwrap();
        a.store(0x1024, AccessSize::Word, 3).unwrap();
        assert!(a.store_exclusive(0x1020, AccessSize::Word, seen + 1).unwrap());
        assert_eq!(a.load(0x1020, AccessSize::Word).unwrap(), 1);
    }
}
