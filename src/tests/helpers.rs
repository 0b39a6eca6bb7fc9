//! Guest fixtures shared by the scenario tests.

use crate::arch::ExclusiveMonitor;
use crate::config::CoreConfig;
use crate::cpu::CpuCoreManager;
use crate::kernel::{Kernel, KernelObject, ProcessId, ThreadSvcHandler};
use crate::mem::{AddressSpace, VmaPermission, PAGE_SIZE};
use crate::thread::{ThreadId, ThreadParams};
use crate::time::CoreTiming;
use std::sync::Arc;

/// Guest code is loaded here.
pub const CODE: u64 = 0x10_0000;
/// Guest data lives here; the first page is zeroed.
pub const DATA: u64 = 0x20_0000;

/// A kernel with one process and its code and data mapped.
pub struct Guest {
    pub kernel: Arc<Kernel>,
    pub process: ProcessId,
    pub space: Arc<AddressSpace>,
}

impl Guest {
    pub fn new() -> Self {
        let kernel = Arc::new(Kernel::new(Arc::new(CoreTiming::new())));
        let space = Arc::new(AddressSpace::new());
        space
            .map_anonymous(CODE, 4 * PAGE_SIZE, VmaPermission::ALL)
            .unwrap();
        space
            .map_anonymous(DATA, 4 * PAGE_SIZE, VmaPermission::READ_WRITE)
            .unwrap();
        let process = kernel.lock().create_process("guest", Arc::clone(&space));
        Self {
            kernel,
            process,
            space,
        }
    }

    /// Write `program` at `addr`, returning the address after it.
    pub fn load(&self, addr: u64, program: &[u32]) -> u64 {
        for (i, word) in program.iter().enumerate() {
            self.space.write_u32(addr + 4 * i as u64, *word).unwrap();
        }
        addr + 4 * program.len() as u64
    }

    /// Create and start a thread at `entry` with `x0 = arg`.
    pub fn spawn(&self, entry: u64, priority: u32, core: i32, arg: u64) -> ThreadId {
        let params = ThreadParams::new(self.process, entry)
            .with_priority(priority)
            .with_processor_id(core)
            .with_arg(arg);
        let mut state = self.kernel.lock();
        let id = state.create_thread(params).unwrap();
        state.start_thread(id).unwrap();
        id
    }

    /// Handle in the guest process for `object`.
    pub fn handle(&self, object: KernelObject) -> u32 {
        self.kernel
            .lock()
            .create_handle(self.process, object)
            .unwrap()
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        self.space.read_u64(addr).unwrap()
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        self.space.read_u32(addr).unwrap()
    }

    /// Core manager wired to this guest's kernel with the thread SVCs.
    pub fn cores(&self, config: CoreConfig) -> CpuCoreManager {
        let svc = Arc::new(ThreadSvcHandler::new(Arc::clone(&self.kernel)));
        CpuCoreManager::new(
            config,
            Arc::clone(&self.kernel),
            Arc::new(ExclusiveMonitor::new()),
            svc,
        )
        .unwrap()
    }
}
