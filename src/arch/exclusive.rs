//! Cross-core exclusive monitor backing LDXR/STXR.
//!
//! Each core holds at most one reservation, tracked at granule resolution.
//! A reservation is lost when another core reserves or stores to the same
//! granule. Commits run with the reservation table locked, so the check and
//! the memory update are atomic with respect to every other core.

use crate::config::NUM_CPU_CORES;
use crate::errors::MemoryResult;
use crate::mem::AddressSpace;
use spin::Mutex;

/// Reservation granule size in bytes.
pub const RESERVATION_GRANULE: u64 = 16;

const GRANULE_MASK: u64 = !(RESERVATION_GRANULE - 1);

#[inline]
fn granule(addr: u64) -> u64 {
    addr & GRANULE_MASK
}

/// Shared exclusive-access monitor for all cores.
#[derive(Debug, Default)]
pub struct ExclusiveMonitor {
    reservations: Mutex<[Option<u64>; NUM_CPU_CORES]>,
}

impl ExclusiveMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the granule containing `addr` for `core`.
    ///
    /// Replaces the core's previous reservation and breaks any other core's
    /// reservation on the same granule.
    pub fn set_exclusive(&self, core: usize, addr: u64) {
        let target = granule(addr);
        let mut reservations = self.reservations.lock();
        for (index, slot) in reservations.iter_mut().enumerate() {
            if index != core && *slot == Some(target) {
                *slot = None;
            }
        }
        reservations[core] = Some(target);
    }

    /// Drop `core`'s reservation.
    pub fn clear_exclusive(&self, core: usize) {
        self.reservations.lock()[core] = None;
    }

    /// Whether `core` holds a live reservation covering `addr`.
    pub fn is_exclusive(&self, core: usize, addr: u64) -> bool {
        self.reservations.lock()[core] == Some(granule(addr))
    }

    /// Perform `write` if `core` still holds the reservation for `addr`.
    ///
    /// Returns `Ok(true)` when the write happened, which also clears every
    /// reservation on the granule. Returns `Ok(false)` when the reservation
    /// was lost. The caller's reservation is consumed either way.
    fn commit(
        &self,
        core: usize,
        addr: u64,
        write: impl FnOnce() -> MemoryResult<()>,
    ) -> MemoryResult<bool> {
        let target = granule(addr);
        let mut reservations = self.reservations.lock();
        if reservations[core] != Some(target) {
            reservations[core] = None;
            return Ok(false);
        }
        reservations[core] = None;
        write()?;
        for slot in reservations.iter_mut() {
            if *slot == Some(target) {
                *slot = None;
            }
        }
        Ok(true)
    }

    pub fn exclusive_write8(
        &self,
        core: usize,
        addr: u64,
        value: u8,
        memory: &AddressSpace,
    ) -> MemoryResult<bool> {
        self.commit(core, addr, || memory.write_u8(addr, value))
    }

    pub fn exclusive_write16(
        &self,
        core: usize,
        addr: u64,
        value: u16,
        memory: &AddressSpace,
    ) -> MemoryResult<bool> {
        self.commit(core, addr, || memory.write_u16(addr, value))
    }

    pub fn exclusive_write32(
        &self,
        core: usize,
        addr: u64,
        value: u32,
        memory: &AddressSpace,
    ) -> MemoryResult<bool> {
        self.commit(core, addr, || memory.write_u32(addr, value))
    }

    pub fn exclusive_write64(
        &self,
        core: usize,
        addr: u64,
        value: u64,
        memory: &AddressSpace,
    ) -> MemoryResult<bool> {
        self.commit(core, addr, || memory.write_u64(addr, value))
    }

    pub fn exclusive_write128(
        &self,
        core: usize,
        addr: u64,
        value: u128,
        memory: &AddressSpace,
    ) -> MemoryResult<bool> {
        self.commit(core, addr, || memory.write_u128(addr, value))
    }

    /// Run an ordinary store of `len` bytes from `core` to `addr`.
    ///
    /// Other cores' reservations on every granule the store touches are
    /// broken, and the store cannot interleave with an in-flight commit.
    pub fn store_notify<R>(
        &self,
        core: usize,
        addr: u64,
        len: usize,
        store: impl FnOnce() -> R,
    ) -> R {
        let first = granule(addr);
        let last = granule(addr.wrapping_add(len.max(1) as u64 - 1));
        let touched = |g: u64| {
            if first <= last {
                (first..=last).contains(&g)
            } else {
                g >= first || g <= last
            }
        };
        let mut reservations = self.reservations.lock();
        for (index, slot) in reservations.iter_mut().enumerate() {
            if index != core && slot.map_or(false, touched) {
                *slot = None;
            }
        }
        store()
    }
}
