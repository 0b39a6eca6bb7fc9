//! Guest register file.

/// Number of general-purpose registers, excluding SP.
pub const NUM_GPRS: usize = 31;

/// Number of SIMD&FP registers.
pub const NUM_VECTOR_REGS: usize = 32;

/// Register index that names the stack pointer in [`ThreadContext::reg`].
pub const SP_INDEX: usize = 31;

/// Condition flag bits inside `pstate`.
pub const NZCV_MASK: u32 = 0xF000_0000;
pub const FLAG_N: u32 = 1 << 31;
pub const FLAG_Z: u32 = 1 << 30;
pub const FLAG_C: u32 = 1 << 29;
pub const FLAG_V: u32 = 1 << 28;

/// Complete architectural state of one guest thread.
///
/// Copied wholesale on every context switch and on every hop between
/// execution backends, so it must carry everything either backend can
/// observe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadContext {
    pub x: [u64; NUM_GPRS],
    pub sp: u64,
    pub pc: u64,
    /// NZCV in bits 31..28
    pub pstate: u32,
    pub vector: [u128; NUM_VECTOR_REGS],
    pub fpcr: u32,
    pub fpsr: u32,
    /// Guest-writable thread pointer
    pub tpidr_el0: u64,
    /// Read-only TLS pointer (`TPIDRRO_EL0`)
    pub tls_address: u64,
}

impl ThreadContext {
    /// Context for a thread about to run its entry point.
    pub fn for_entry(entry: u64, stack_top: u64, arg: u64, tls_address: u64) -> Self {
        let mut context = Self {
            pc: entry,
            sp: stack_top,
            tls_address,
            ..Self::default()
        };
        context.x[0] = arg;
        context
    }

    /// Register `index`, with 31 naming SP.
    pub fn reg(&self, index: usize) -> u64 {
        if index == SP_INDEX {
            self.sp
        } else {
            self.x[index]
        }
    }

    /// Write register `index`, with 31 naming SP.
    pub fn set_reg(&mut self, index: usize, value: u64) {
        if index == SP_INDEX {
            self.sp = value;
        } else {
            self.x[index] = value;
        }
    }

    /// The NZCV nibble, right-aligned.
    pub fn nzcv(&self) -> u32 {
        self.pstate >> 28
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_context_seeds_argument_and_pointers() {
        let ctx = ThreadContext::for_entry(0x1000, 0x8000, 42, 0x4000_0200);
        assert_eq!(ctx.pc, 0x1000);
        assert_eq!(ctx.sp, 0x8000);
        assert_eq!(ctx.x[0], 42);
        assert_eq!(ctx.tls_address, 0x4000_0200);
        assert_eq!(ctx.pstate, 0);
    }

    #[test]
    fn register_31_is_the_stack_pointer() {
        let mut ctx = ThreadContext::default();
        ctx.set_reg(SP_INDEX, 0x7ff0);
        ctx.set_reg(30, 0xabc);
        assert_eq!(ctx.sp, 0x7ff0);
        assert_eq!(ctx.reg(SP_INDEX), 0x7ff0);
        assert_eq!(ctx.x[30], 0xabc);
    }
}
