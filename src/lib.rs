#![forbid(unsafe_code)]

//! Multi-core AArch64 guest execution and scheduling core.
//!
//! Four emulated cores run guest threads of one or more guest processes.
//! Each core executes through a block translator that falls back to a
//! precise interpreter for instructions it cannot lower, and all cores share
//! a global exclusive monitor for LDXR/STXR. A kernel-side scheduler keeps
//! one priority-ordered ready queue per core and moves threads between
//! cores according to their affinity.
//!
//! # Quick Start
//!
//! ```ignore
//! use guest_smp::{
//!     AddressSpace, CoreConfig, CoreTiming, CpuCoreManager, ExclusiveMonitor, Kernel,
//!     ThreadParams, ThreadSvcHandler,
//! };
//! use std::sync::Arc;
//!
//! let kernel = Arc::new(Kernel::new(Arc::new(CoreTiming::new())));
//! let process = kernel.lock().create_process("guest", Arc::new(space));
//! let main = kernel.lock().create_thread(ThreadParams::new(process, entry))?;
//! kernel.lock().start_thread(main)?;
//!
//! let svc = Arc::new(ThreadSvcHandler::new(Arc::clone(&kernel)));
//! let mut cores = CpuCoreManager::new(
//!     CoreConfig::default().with_multi_core(true),
//!     Arc::clone(&kernel),
//!     Arc::new(ExclusiveMonitor::new()),
//!     svc,
//! )?;
//! cores.start()?;
//! while cores.run_loop() && kernel.lock().has_live_threads() {}
//! cores.shutdown();
//! ```
//!
//! # Architecture
//!
//! - [`arch`]: the [`ArmCore`] interface, both backends and the exclusive monitor
//! - [`kernel`]: thread lifecycle, waits, priority inheritance and SVC dispatch
//! - [`sched`]: per-core multi-level ready queues
//! - [`cpu`]: the per-core run loop, lock-step barrier and host threads
//! - [`time`]: guest clock and timed events

// Core modules
pub mod arch;
pub mod config;
pub mod cpu;
pub mod errors;
pub mod kernel;
pub mod mem;
pub mod sched;
pub mod thread;
pub mod time;

#[cfg(test)]
mod tests;

// ============================================================================
// Public API
// ============================================================================

// Virtual CPU
pub use arch::{ArmCore, ExclusiveMonitor, HaltHandle, HaltReason, ThreadContext};

// Configuration
pub use config::{Backend, CoreConfig, NUM_CPU_CORES};

// Cores
pub use cpu::{current_core_index, Cpu, CpuBarrier, CpuCoreManager};

// Kernel
pub use kernel::{Kernel, KernelState, ProcessId, SvcHandler, ThreadSvcHandler};

// Memory
pub use mem::{AddressSpace, BackingMemory, VmaPermission};

// Threads
pub use thread::{ThreadActivity, ThreadId, ThreadParams, ThreadStatus};

// Time
pub use time::{CoreTiming, TimeSource};

// Errors
pub use errors::{ConfigError, CpuFault, KernelError, KernelResult, MemoryFault};
