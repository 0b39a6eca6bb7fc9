//! Region-mapped guest address space.
//!
//! An [`AddressSpace`] is a sorted map of non-overlapping regions, each a
//! window onto a [`BackingMemory`] block with its own permissions. Accesses
//! must fall entirely inside one region.

use super::{is_page_aligned, PAGE_SIZE};
use crate::errors::{MemoryFault, MemoryResult};
use bitflags::bitflags;
use spin::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

bitflags! {
    /// Access permissions of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmaPermission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Host storage behind guest memory.
///
/// The same block may be mapped into several address spaces, or several
/// times into one.
pub struct BackingMemory {
    bytes: RwLock<Box<[u8]>>,
}

impl BackingMemory {
    /// Allocate `size` zeroed bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    /// Wrap existing contents.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes.into_boxed_slice()),
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    /// Whether the block is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out `buf.len()` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the block. Callers go through an
    /// [`AddressSpace`], which validates ranges against the region first.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let bytes = self.bytes.read();
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
    }

    /// Copy `data` in starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the block.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.write();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl core::fmt::Debug for BackingMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackingMemory").field("len", &self.len()).finish()
    }
}

#[derive(Debug, Clone)]
struct Region {
    size: u64,
    backing: Arc<BackingMemory>,
    offset: usize,
    perms: VmaPermission,
}

/// A guest virtual address space.
#[derive(Debug, Default)]
pub struct AddressSpace {
    regions: RwLock<BTreeMap<u64, Region>>,
}

impl AddressSpace {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` bytes of `backing`, starting at `offset`, at `addr`.
    ///
    /// Both `addr` and `size` must be page aligned, the range must not
    /// overlap an existing region and must fit inside the backing block.
    pub fn map(
        &self,
        addr: u64,
        size: u64,
        backing: Arc<BackingMemory>,
        offset: usize,
        perms: VmaPermission,
    ) -> MemoryResult<()> {
        let invalid = MemoryFault::InvalidMapping { addr, size };
        if size == 0 || !is_page_aligned(addr) || !is_page_aligned(size) {
            return Err(invalid);
        }
        let end = addr.checked_add(size).ok_or(invalid)?;
        let fits = usize::try_from(size)
            .ok()
            .and_then(|len| offset.checked_add(len))
            .is_some_and(|last| last <= backing.len());
        if !fits {
            return Err(invalid);
        }

        let mut regions = self.regions.write();
        if let Some((&base, region)) = regions.range(..end).next_back() {
            if base + region.size > addr {
                return Err(invalid);
            }
        }
        regions.insert(
            addr,
            Region {
                size,
                backing,
                offset,
                perms,
            },
        );
        Ok(())
    }

    /// Allocate fresh zeroed backing memory and map it at `addr`.
    pub fn map_anonymous(
        &self,
        addr: u64,
        size: u64,
        perms: VmaPermission,
    ) -> MemoryResult<Arc<BackingMemory>> {
        let len = usize::try_from(size).map_err(|_| MemoryFault::InvalidMapping { addr, size })?;
        let backing = Arc::new(BackingMemory::new(len));
        self.map(addr, size, Arc::clone(&backing), 0, perms)?;
        Ok(backing)
    }

    /// Remove every region inside `[addr, addr + size)`.
    ///
    /// A region straddling either end of the range is an error and leaves
    /// the map untouched.
    pub fn unmap(&self, addr: u64, size: u64) -> MemoryResult<()> {
        let invalid = MemoryFault::InvalidMapping { addr, size };
        let end = addr.checked_add(size).ok_or(invalid)?;
        let mut regions = self.regions.write();

        if let Some((&base, region)) = regions.range(..addr).next_back() {
            if base + region.size > addr {
                return Err(invalid);
            }
        }
        let doomed: Vec<u64> = regions.range(addr..end).map(|(&base, _)| base).collect();
        for &base in &doomed {
            if base + regions[&base].size > end {
                return Err(invalid);
            }
        }
        for base in doomed {
            regions.remove(&base);
        }
        Ok(())
    }

    /// Change the permissions of the region starting at `addr`.
    pub fn protect(&self, addr: u64, perms: VmaPermission) -> MemoryResult<()> {
        let mut regions = self.regions.write();
        let region = regions
            .get_mut(&addr)
            .ok_or(MemoryFault::InvalidMapping { addr, size: PAGE_SIZE })?;
        region.perms = perms;
        Ok(())
    }

    /// Whether `addr` is covered by any region.
    pub fn is_mapped(&self, addr: u64) -> bool {
        self.permissions(addr).is_some()
    }

    /// Permissions of the region covering `addr`.
    pub fn permissions(&self, addr: u64) -> Option<VmaPermission> {
        let regions = self.regions.read();
        let (&base, region) = regions.range(..=addr).next_back()?;
        (addr - base < region.size).then_some(region.perms)
    }

    /// Run `f` against the backing block and offset covering the access.
    fn with_region<R>(
        &self,
        addr: u64,
        len: usize,
        required: VmaPermission,
        f: impl FnOnce(&BackingMemory, usize) -> R,
    ) -> MemoryResult<R> {
        let regions = self.regions.read();
        let unmapped = MemoryFault::Unmapped { addr, size: len };
        let (&base, region) = regions.range(..=addr).next_back().ok_or(unmapped)?;
        let within = addr
            .checked_add(len as u64)
            .is_some_and(|end| end <= base + region.size);
        if !within {
            return Err(unmapped);
        }
        if !region.perms.contains(required) {
            return Err(MemoryFault::Permission { addr, size: len });
        }
        let offset = region.offset + (addr - base) as usize;
        Ok(f(&region.backing, offset))
    }

    /// Read `buf.len()` bytes at `addr`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> MemoryResult<()> {
        self.with_region(addr, buf.len(), VmaPermission::READ, |mem, offset| {
            mem.read(offset, buf)
        })
    }

    /// Write `data` at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> MemoryResult<()> {
        self.with_region(addr, data.len(), VmaPermission::WRITE, |mem, offset| {
            mem.write(offset, data)
        })
    }

    /// Fetch one instruction word; requires execute permission.
    pub fn fetch(&self, addr: u64) -> MemoryResult<u32> {
        let mut word = [0u8; 4];
        self.with_region(addr, 4, VmaPermission::EXECUTE, |mem, offset| {
            mem.read(offset, &mut word)
        })?;
        Ok(u32::from_le_bytes(word))
    }

    /// Read a little-endian value of `len` bytes (1, 2, 4 or 8).
    pub fn read_sized(&self, addr: u64, len: usize) -> MemoryResult<u64> {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes[..len])?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write the low `len` bytes (1, 2, 4 or 8) of `value`, little-endian.
    pub fn write_sized(&self, addr: u64, len: usize, value: u64) -> MemoryResult<()> {
        self.write(addr, &value.to_le_bytes()[..len])
    }

    pub fn read_u8(&self, addr: u64) -> MemoryResult<u8> {
        self.read_sized(addr, 1).map(|v| v as u8)
    }

    pub fn read_u16(&self, addr: u64) -> MemoryResult<u16> {
        self.read_sized(addr, 2).map(|v| v as u16)
    }

    pub fn read_u32(&self, addr: u64) -> MemoryResult<u32> {
        self.read_sized(addr, 4).map(|v| v as u32)
    }

    pub fn read_u64(&self, addr: u64) -> MemoryResult<u64> {
        self.read_sized(addr, 8)
    }

    pub fn read_u128(&self, addr: u64) -> MemoryResult<u128> {
        let mut bytes = [0u8; 16];
        self.read(addr, &mut bytes)?;
        Ok(u128::from_le_bytes(bytes))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> MemoryResult<()> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> MemoryResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> MemoryResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> MemoryResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u128(&self, addr: u64, value: u128) -> MemoryResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Copy a block of instruction words to `addr`, ignoring permissions.
    ///
    /// Used by loaders to place code into read-execute regions.
    pub fn load_code(&self, addr: u64, words: &[u32]) -> MemoryResult<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.with_region(addr, bytes.len(), VmaPermission::empty(), |mem, offset| {
            mem.write(offset, &bytes)
        })
    }
}
