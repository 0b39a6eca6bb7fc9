//! Virtual CPU abstraction.
//!
//! [`ArmCore`] is the interface the scheduler loop drives. Two backends
//! implement it: the block [`Translator`] for throughput and the
//! [`Interpreter`] for precision. Both decode through [`isa`] and reach
//! memory through a [`GuestBus`], so a thread's state can move between them
//! at any instruction boundary by way of [`ThreadContext`].

pub mod bus;
pub mod context;
pub mod exclusive;
pub mod interpreter;
pub mod isa;
pub mod translator;

pub use bus::GuestBus;
pub use context::ThreadContext;
pub use exclusive::ExclusiveMonitor;
pub use interpreter::Interpreter;
pub use translator::Translator;

use crate::config::Backend;
use crate::errors::{CpuFault, MemoryResult};
use crate::mem::{AddressSpace, BackingMemory, VmaPermission};
use bitflags::bitflags;
use portable_atomic::{AtomicU32, Ordering};
use std::sync::Arc;

bitflags! {
    /// Why a backend stopped executing.
    ///
    /// An empty set from [`ArmCore::run`] means the tick budget ran out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HaltReason: u32 {
        /// `step()` completed its instruction
        const STEP = 1 << 0;
        /// Guest executed `SVC`; see [`ArmCore::svc_number`]
        const SVC = 1 << 1;
        /// Guest executed `BRK`
        const BREAKPOINT = 1 << 2;
        /// Guest touched unmapped or protected memory
        const MEMORY_ABORT = 1 << 3;
        /// Scheduler asked the core to stop and reselect
        const RESCHEDULE = 1 << 4;
    }
}

impl HaltReason {
    /// Reasons after which the core can never resume the current context.
    pub fn is_fault(self) -> bool {
        self.intersects(HaltReason::BREAKPOINT | HaltReason::MEMORY_ABORT)
    }
}

/// Shared handle through which any host thread can halt a core.
///
/// Requests are latched and observed by the backend at its next
/// instruction boundary.
#[derive(Debug, Clone, Default)]
pub struct HaltHandle {
    pending: Arc<AtomicU32>,
}

impl HaltHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `reason`.
    pub fn request(&self, reason: HaltReason) {
        self.pending.fetch_or(reason.bits(), Ordering::AcqRel);
    }

    /// Consume every latched reason.
    pub fn take(&self) -> HaltReason {
        HaltReason::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Drop `reason` without consuming others.
    pub fn clear(&self, reason: HaltReason) {
        self.pending.fetch_and(!reason.bits(), Ordering::AcqRel);
    }

    /// Latched reasons, left in place.
    pub fn peek(&self) -> HaltReason {
        HaltReason::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }
}

/// A guest CPU core.
///
/// Register index 31 names SP in [`reg`](ArmCore::reg) and
/// [`set_reg`](ArmCore::set_reg).
pub trait ArmCore: Send {
    /// Which backend this is.
    fn backend(&self) -> Backend;

    /// Map host backing memory into the core's current address space.
    fn map_backing_memory(
        &mut self,
        addr: u64,
        size: u64,
        backing: Arc<BackingMemory>,
        perms: VmaPermission,
    ) -> MemoryResult<()>;

    /// Remove mappings from the current address space.
    fn unmap_memory(&mut self, addr: u64, size: u64) -> MemoryResult<()>;

    /// The address space the core currently executes in.
    fn address_space(&self) -> &Arc<AddressSpace>;

    /// Switch to another address space, dropping cached translations.
    fn page_table_changed(&mut self, space: Arc<AddressSpace>);

    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
    fn reg(&self, index: usize) -> u64;
    fn set_reg(&mut self, index: usize, value: u64);
    fn vector_reg(&self, index: usize) -> u128;
    fn set_vector_reg(&mut self, index: usize, value: u128);
    /// PSTATE with NZCV in bits 31..28.
    fn pstate(&self) -> u32;
    fn set_pstate(&mut self, pstate: u32);
    fn tls_address(&self) -> u64;
    fn set_tls_address(&mut self, address: u64);
    fn tpidr_el0(&self) -> u64;
    fn set_tpidr_el0(&mut self, value: u64);

    /// Instruction budget left for [`run`](ArmCore::run).
    fn ticks_remaining(&self) -> u64;
    fn set_ticks_remaining(&mut self, ticks: u64);

    /// Execute until halted or the budget is spent.
    fn run(&mut self) -> HaltReason;

    /// Execute exactly one instruction. The result always contains `STEP`.
    fn step(&mut self) -> HaltReason;

    fn save_context(&self, ctx: &mut ThreadContext);
    fn load_context(&mut self, ctx: &ThreadContext);

    /// Ask the core to halt with `RESCHEDULE` at its next boundary.
    fn prepare_reschedule(&self) {
        self.halt_handle().request(HaltReason::RESCHEDULE);
    }

    /// Handle shared with the scheduler for asynchronous halts.
    fn halt_handle(&self) -> &HaltHandle;

    fn clear_instruction_cache(&mut self);
    fn invalidate_cache_range(&mut self, addr: u64, size: u64);
    fn clear_exclusive_state(&mut self);

    /// Immediate of the last `SVC` that halted the core.
    fn svc_number(&self) -> u32;

    /// Fault recorded by the last `BREAKPOINT` or `MEMORY_ABORT` halt.
    fn take_fault(&mut self) -> Option<CpuFault>;
}

/// Build a core with the requested backend.
pub fn new_core(
    backend: Backend,
    core: usize,
    space: Arc<AddressSpace>,
    monitor: Arc<ExclusiveMonitor>,
    config: &crate::config::CoreConfig,
) -> Box<dyn ArmCore> {
    match backend {
        Backend::Translator => Box::new(Translator::new(core, space, monitor, config)),
        Backend::Interpreter => Box::new(Interpreter::new(core, space, monitor)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_handle_latches_until_taken() {
        let handle = HaltHandle::new();
        let remote = handle.clone();
        remote.request(HaltReason::RESCHEDULE);
        remote.request(HaltReason::SVC);
        assert_eq!(handle.peek(), HaltReason::RESCHEDULE | HaltReason::SVC);
        handle.clear(HaltReason::SVC);
        assert_eq!(handle.take(), HaltReason::RESCHEDULE);
        assert!(handle.take().is_empty());
    }

    #[test]
    fn fault_reasons() {
        assert!(HaltReason::MEMORY_ABORT.is_fault());
        assert!((HaltReason::STEP | HaltReason::BREAKPOINT).is_fault());
        assert!(!(HaltReason::SVC | HaltReason::RESCHEDULE).is_fault());
    }
}
