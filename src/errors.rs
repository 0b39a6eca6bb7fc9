//! Error types for the execution and scheduling core.
//!
//! Guest-triggerable conditions surface as typed errors that map onto guest
//! result codes. Host programming errors (illegal thread transitions, broken
//! waiter bookkeeping, unknown opcodes) are assertions and never appear here.

use crate::arch::ThreadContext;
use thiserror::Error;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Result type for guest memory accesses.
pub type MemoryResult<T> = Result<T, MemoryFault>;

/// Error module number used by the guest kernel for its result codes.
const KERNEL_MODULE: u32 = 1;

/// Guest-visible kernel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Priority outside `0..=63`
    #[error("invalid thread priority: {0}")]
    InvalidPriority(u32),
    /// Processor id outside the core range or the process core mask
    #[error("invalid core id: {0}")]
    InvalidCoreId(i32),
    /// Address not mapped in the owning address space
    #[error("invalid address: {0:#x}")]
    InvalidAddress(u64),
    /// Handle does not name a live object of the expected kind
    #[error("invalid handle: {0:#x}")]
    InvalidHandle(u32),
    /// Operation not allowed in the object's current state
    #[error("invalid state")]
    InvalidState,
    /// Parameters are individually valid but not together
    #[error("invalid combination of parameters")]
    InvalidCombination,
    /// TLS area, handle table or thread arena exhausted
    #[error("out of resource")]
    OutOfResource,
    /// Wait ended by its timeout
    #[error("timed out")]
    TimedOut,
    /// Wait was cancelled
    #[error("cancelled")]
    Cancelled,
    /// Supervisor call without an implementation
    #[error("not implemented")]
    NotImplemented,
    /// Value outside the accepted range
    #[error("out of range")]
    OutOfRange,
}

impl KernelError {
    /// Guest description number for this error.
    pub const fn description(self) -> u32 {
        match self {
            KernelError::InvalidAddress(_) => 102,
            KernelError::OutOfResource => 103,
            KernelError::InvalidPriority(_) => 112,
            KernelError::InvalidCoreId(_) => 113,
            KernelError::InvalidHandle(_) => 114,
            KernelError::InvalidCombination => 116,
            KernelError::TimedOut => 117,
            KernelError::Cancelled => 118,
            KernelError::OutOfRange => 119,
            KernelError::InvalidState => 125,
            KernelError::NotImplemented => 33,
        }
    }

    /// Raw guest result code, `module | description << 9`.
    pub const fn result_code(self) -> u32 {
        KERNEL_MODULE | (self.description() << 9)
    }
}

/// Raw result code for success.
pub const RESULT_SUCCESS: u32 = 0;

/// Fault raised by a guest memory access or mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryFault {
    /// No region covers the access
    #[error("unmapped memory access at {addr:#x} ({size} bytes)")]
    Unmapped { addr: u64, size: usize },
    /// A region covers the access but lacks the permission
    #[error("permission fault at {addr:#x} ({size} bytes)")]
    Permission { addr: u64, size: usize },
    /// Mapping request overlaps an existing region or is malformed
    #[error("invalid mapping at {addr:#x}, size {size:#x}")]
    InvalidMapping { addr: u64, size: u64 },
}

impl MemoryFault {
    /// Faulting guest address.
    pub fn address(&self) -> u64 {
        match *self {
            MemoryFault::Unmapped { addr, .. }
            | MemoryFault::Permission { addr, .. }
            | MemoryFault::InvalidMapping { addr, .. } => addr,
        }
    }
}

impl From<MemoryFault> for KernelError {
    fn from(fault: MemoryFault) -> Self {
        KernelError::InvalidAddress(fault.address())
    }
}

/// Unrecoverable guest fault captured when a core hard-halts.
///
/// The context is the register file at the faulting instruction, which did
/// not retire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuFault {
    /// Data or instruction access to unmapped or protected memory
    #[error("memory abort at pc={:#x}: {fault}", .context.pc)]
    MemoryAbort {
        fault: MemoryFault,
        context: Box<ThreadContext>,
    },
    /// Guest executed `BRK`
    #[error("breakpoint #{imm:#x} at pc={:#x}", .context.pc)]
    Breakpoint { imm: u16, context: Box<ThreadContext> },
}

impl CpuFault {
    /// Register file captured at the fault.
    pub fn context(&self) -> &ThreadContext {
        match self {
            CpuFault::MemoryAbort { context, .. } | CpuFault::Breakpoint { context, .. } => context,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML text could not be parsed into a configuration
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A field holds a value outside its accepted range
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
