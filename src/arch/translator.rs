//! Block-translating backend.
//!
//! Straight-line runs of guest code are compiled once into a vector of
//! closures and cached by entry PC. Condition flags are recorded lazily as
//! the operands of the last flag-setting instruction and only materialized
//! when something reads them.
//!
//! Vector-data and system-register instructions are not translated. A block
//! ends in front of them and the translator hands the thread over to its
//! embedded [`Interpreter`] for a few instructions, moving the complete
//! [`ThreadContext`] across in both directions.

use super::bus::GuestBus;
use super::context::{ThreadContext, NUM_GPRS, NUM_VECTOR_REGS, NZCV_MASK, SP_INDEX};
use super::exclusive::ExclusiveMonitor;
use super::interpreter::Interpreter;
use super::isa::{self, BranchRegKind, Instruction, LogicalOp};
use super::{ArmCore, HaltHandle, HaltReason};
use crate::config::{Backend, CoreConfig};
use crate::errors::{CpuFault, MemoryFault, MemoryResult};
use crate::mem::{AddressSpace, BackingMemory, VmaPermission};
use std::collections::HashMap;
use std::sync::Arc;

/// Flags as left by the last flag-setting instruction.
#[derive(Debug, Clone, Copy)]
enum LazyFlags {
    Known(u32),
    AddSub { a: u64, b: u64, sub: bool, sf: bool },
    Logical { result: u64, sf: bool },
}

impl LazyFlags {
    fn nzcv(self) -> u32 {
        match self {
            LazyFlags::Known(nzcv) => nzcv,
            LazyFlags::AddSub { a, b, sub, sf } => isa::add_sub(a, b, sub, sf).1,
            LazyFlags::Logical { result, sf } => isa::logical_flags(result, sf),
        }
    }
}

/// Register file as seen by compiled code.
struct JitState {
    x: [u64; NUM_GPRS],
    sp: u64,
    pc: u64,
    flags: LazyFlags,
    /// PSTATE bits outside NZCV
    pstate_rest: u32,
    vector: [u128; NUM_VECTOR_REGS],
    fpcr: u32,
    fpsr: u32,
    tpidr_el0: u64,
    tls_address: u64,
}

impl JitState {
    fn new() -> Self {
        Self {
            x: [0; NUM_GPRS],
            sp: 0,
            pc: 0,
            flags: LazyFlags::Known(0),
            pstate_rest: 0,
            vector: [0; NUM_VECTOR_REGS],
            fpcr: 0,
            fpsr: 0,
            tpidr_el0: 0,
            tls_address: 0,
        }
    }

    #[inline]
    fn x(&self, r: u8) -> u64 {
        if r == 31 {
            0
        } else {
            self.x[r as usize]
        }
    }

    #[inline]
    fn x_or_sp(&self, r: u8) -> u64 {
        if r == 31 {
            self.sp
        } else {
            self.x[r as usize]
        }
    }

    #[inline]
    fn set_x(&mut self, r: u8, value: u64) {
        if r != 31 {
            self.x[r as usize] = value;
        }
    }

    #[inline]
    fn set_x_or_sp(&mut self, r: u8, value: u64) {
        if r == 31 {
            self.sp = value;
        } else {
            self.x[r as usize] = value;
        }
    }

    /// Resolve the flags and keep the result.
    fn materialize(&mut self) -> u32 {
        let nzcv = self.flags.nzcv();
        self.flags = LazyFlags::Known(nzcv);
        nzcv
    }

    fn pstate(&self) -> u32 {
        self.pstate_rest | (self.flags.nzcv() << 28)
    }

    fn set_pstate(&mut self, pstate: u32) {
        self.pstate_rest = pstate & !NZCV_MASK;
        self.flags = LazyFlags::Known(pstate >> 28);
    }

    fn save(&self, ctx: &mut ThreadContext) {
        ctx.x = self.x;
        ctx.sp = self.sp;
        ctx.pc = self.pc;
        ctx.pstate = self.pstate();
        ctx.vector = self.vector;
        ctx.fpcr = self.fpcr;
        ctx.fpsr = self.fpsr;
        ctx.tpidr_el0 = self.tpidr_el0;
        ctx.tls_address = self.tls_address;
    }

    fn load(&mut self, ctx: &ThreadContext) {
        self.x = ctx.x;
        self.sp = ctx.sp;
        self.pc = ctx.pc;
        self.set_pstate(ctx.pstate);
        self.vector = ctx.vector;
        self.fpcr = ctx.fpcr;
        self.fpsr = ctx.fpsr;
        self.tpidr_el0 = ctx.tpidr_el0;
        self.tls_address = ctx.tls_address;
    }
}

/// How a compiled instruction left control flow.
enum Exit {
    Next,
    Jump(u64),
    Svc(u16),
    Breakpoint(u16),
    Fault(MemoryFault),
}

type Op = Box<dyn Fn(&mut JitState, &GuestBus) -> Exit + Send + Sync>;

struct CompiledInsn {
    pc: u64,
    op: Op,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockEnd {
    /// Size limit reached, or the next word could not be fetched
    FallThrough,
    /// Last instruction is a branch, SVC or BRK
    Terminator,
    /// The instruction at `end` must be interpreted
    Fallback,
}

struct Block {
    start: u64,
    end: u64,
    insns: Vec<CompiledInsn>,
    terminal: BlockEnd,
}

impl Block {
    fn overlaps(&self, addr: u64, size: u64) -> bool {
        let end = self.end.max(self.start + 4);
        self.start < addr.saturating_add(size) && addr < end
    }
}

fn lower<F>(f: F) -> Op
where
    F: Fn(&mut JitState, &GuestBus) -> Exit + Send + Sync + 'static,
{
    Box::new(f)
}

fn compile(insn: Instruction, pc: u64) -> Op {
    match insn {
        Instruction::Hint(_) => lower(|_, _| Exit::Next),
        Instruction::MoveWide {
            op,
            sf,
            rd,
            imm16,
            shift,
        } => lower(move |s, _| {
            let value = isa::move_wide(op, s.x(rd), imm16, shift, sf);
            s.set_x(rd, value);
            Exit::Next
        }),
        Instruction::AddSubImm {
            sf,
            sub,
            set_flags,
            rd,
            rn,
            imm,
        } => lower(move |s, _| {
            let a = s.x_or_sp(rn);
            let result = if sub { a.wrapping_sub(imm) } else { a.wrapping_add(imm) };
            let result = isa::truncate(result, sf);
            if set_flags {
                s.flags = LazyFlags::AddSub { a, b: imm, sub, sf };
                s.set_x(rd, result);
            } else {
                s.set_x_or_sp(rd, result);
            }
            Exit::Next
        }),
        Instruction::AddSubReg {
            sf,
            sub,
            set_flags,
            rd,
            rn,
            rm,
            shift,
            amount,
        } => lower(move |s, _| {
            let a = s.x(rn);
            let b = isa::shift_value(s.x(rm), shift, amount, sf);
            let result = if sub { a.wrapping_sub(b) } else { a.wrapping_add(b) };
            if set_flags {
                s.flags = LazyFlags::AddSub { a, b, sub, sf };
            }
            s.set_x(rd, isa::truncate(result, sf));
            Exit::Next
        }),
        Instruction::Logical {
            sf,
            op,
            invert,
            rd,
            rn,
            rm,
            shift,
            amount,
        } => lower(move |s, _| {
            let mut b = isa::shift_value(s.x(rm), shift, amount, sf);
            if invert {
                b = !b;
            }
            let result = isa::logical(op, s.x(rn), b, sf);
            if op == LogicalOp::Ands {
                s.flags = LazyFlags::Logical { result, sf };
            }
            s.set_x(rd, result);
            Exit::Next
        }),
        Instruction::Branch { link, offset } => {
            let target = pc.wrapping_add(offset as u64);
            lower(move |s, _| {
                if link {
                    s.set_x(30, pc.wrapping_add(4));
                }
                Exit::Jump(target)
            })
        }
        Instruction::BranchCond { cond, offset } => {
            let target = pc.wrapping_add(offset as u64);
            lower(move |s, _| {
                if isa::condition_holds(cond, s.materialize()) {
                    Exit::Jump(target)
                } else {
                    Exit::Next
                }
            })
        }
        Instruction::CompareBranch {
            sf,
            nonzero,
            rt,
            offset,
        } => {
            let target = pc.wrapping_add(offset as u64);
            lower(move |s, _| {
                if (isa::truncate(s.x(rt), sf) != 0) == nonzero {
                    Exit::Jump(target)
                } else {
                    Exit::Next
                }
            })
        }
        Instruction::BranchReg { kind, rn } => lower(move |s, _| {
            let target = s.x(rn);
            if kind == BranchRegKind::Blr {
                s.set_x(30, pc.wrapping_add(4));
            }
            Exit::Jump(target)
        }),
        Instruction::LoadStore {
            size,
            load,
            rt,
            rn,
            offset,
        } => {
            if load {
                lower(move |s, bus| {
                    match bus.load(s.x_or_sp(rn).wrapping_add(offset), size) {
                        Ok(value) => {
                            s.set_x(rt, value);
                            Exit::Next
                        }
                        Err(fault) => Exit::Fault(fault),
                    }
                })
            } else {
                lower(move |s, bus| {
                    match bus.store(s.x_or_sp(rn).wrapping_add(offset), size, s.x(rt)) {
                        Ok(()) => Exit::Next,
                        Err(fault) => Exit::Fault(fault),
                    }
                })
            }
        }
        Instruction::LoadExclusive { size, rt, rn } => lower(move |s, bus| {
            match bus.load_exclusive(s.x_or_sp(rn), size) {
                Ok(value) => {
                    s.set_x(rt, value);
                    Exit::Next
                }
                Err(fault) => Exit::Fault(fault),
            }
        }),
        Instruction::StoreExclusive { size, rs, rt, rn } => lower(move |s, bus| {
            match bus.store_exclusive(s.x_or_sp(rn), size, s.x(rt)) {
                Ok(stored) => {
                    s.set_x(rs, u64::from(!stored));
                    Exit::Next
                }
                Err(fault) => Exit::Fault(fault),
            }
        }),
        Instruction::Clrex => lower(|_, bus| {
            bus.clear_exclusive();
            Exit::Next
        }),
        Instruction::Svc { imm } => lower(move |_, _| Exit::Svc(imm)),
        Instruction::Brk { imm } => lower(move |_, _| Exit::Breakpoint(imm)),
        Instruction::Mrs { .. }
        | Instruction::Msr { .. }
        | Instruction::InsElement { .. }
        | Instruction::UmovElement { .. }
        | Instruction::VectorEor { .. }
        | Instruction::VectorAdd2D { .. } => {
            unreachable!("{insn:?} at pc={pc:#x} is left to the interpreter")
        }
    }
}

pub struct Translator {
    state: JitState,
    bus: GuestBus,
    blocks: HashMap<u64, Arc<Block>>,
    interpreter: Interpreter,
    fallback_instructions: usize,
    max_block_instructions: usize,
    force_fallback: bool,
    ticks_remaining: u64,
    halt: HaltHandle,
    svc_number: u32,
    fault: Option<CpuFault>,
}

impl Translator {
    pub fn new(
        core: usize,
        space: Arc<AddressSpace>,
        monitor: Arc<ExclusiveMonitor>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            state: JitState::new(),
            bus: GuestBus::new(core, Arc::clone(&space), Arc::clone(&monitor)),
            blocks: HashMap::new(),
            interpreter: Interpreter::new(core, space, monitor),
            fallback_instructions: config.fallback_instructions.max(1),
            max_block_instructions: config.max_block_instructions.max(1),
            force_fallback: false,
            ticks_remaining: 0,
            halt: HaltHandle::new(),
            svc_number: 0,
            fault: None,
        }
    }

    /// Route every instruction through the embedded interpreter.
    pub fn set_force_fallback(&mut self, enabled: bool) {
        if self.force_fallback != enabled {
            self.force_fallback = enabled;
            self.blocks.clear();
        }
    }

    /// Number of cached blocks.
    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn snapshot(&self) -> Box<ThreadContext> {
        let mut ctx = Box::<ThreadContext>::default();
        self.state.save(&mut ctx);
        ctx
    }

    fn abort(&mut self, fault: MemoryFault) -> HaltReason {
        tracing::debug!(core = self.bus.core(), pc = self.state.pc, %fault, "translator memory abort");
        self.fault = Some(CpuFault::MemoryAbort {
            fault,
            context: self.snapshot(),
        });
        HaltReason::MEMORY_ABORT
    }

    fn compile_block(&self, start: u64, limit: usize) -> MemoryResult<Block> {
        let mut insns = Vec::new();
        let mut addr = start;
        let terminal = loop {
            if insns.len() >= limit {
                break BlockEnd::FallThrough;
            }
            let word = match self.bus.fetch(addr) {
                Ok(word) => word,
                Err(fault) if insns.is_empty() => return Err(fault),
                Err(_) => break BlockEnd::FallThrough,
            };
            let Some(insn) = isa::decode(word) else {
                break BlockEnd::Fallback;
            };
            if self.force_fallback || insn.needs_interpreter() {
                break BlockEnd::Fallback;
            }
            insns.push(CompiledInsn {
                pc: addr,
                op: compile(insn, addr),
            });
            addr = addr.wrapping_add(4);
            if insn.ends_block() {
                break BlockEnd::Terminator;
            }
        };
        tracing::trace!(start, len = insns.len(), ?terminal, "compiled block");
        Ok(Block {
            start,
            end: addr,
            insns,
            terminal,
        })
    }

    fn block_at(&mut self, pc: u64) -> MemoryResult<Arc<Block>> {
        if let Some(block) = self.blocks.get(&pc) {
            return Ok(Arc::clone(block));
        }
        let block = Arc::new(self.compile_block(pc, self.max_block_instructions)?);
        self.blocks.insert(pc, Arc::clone(&block));
        Ok(block)
    }

    /// Run a block from its start. `None` means control left the block
    /// normally or the budget ran out.
    fn execute_block(&mut self, block: &Block) -> Option<HaltReason> {
        for insn in &block.insns {
            if self.ticks_remaining == 0 {
                self.state.pc = insn.pc;
                return None;
            }
            self.state.pc = insn.pc;
            match (insn.op)(&mut self.state, &self.bus) {
                Exit::Next => self.state.pc = insn.pc.wrapping_add(4),
                Exit::Jump(target) => self.state.pc = target,
                Exit::Svc(imm) => {
                    self.state.pc = insn.pc.wrapping_add(4);
                    self.ticks_remaining -= 1;
                    self.svc_number = u32::from(imm);
                    return Some(HaltReason::SVC);
                }
                Exit::Breakpoint(imm) => {
                    self.fault = Some(CpuFault::Breakpoint {
                        imm,
                        context: self.snapshot(),
                    });
                    return Some(HaltReason::BREAKPOINT);
                }
                Exit::Fault(fault) => return Some(self.abort(fault)),
            }
            self.ticks_remaining -= 1;
        }
        if block.terminal == BlockEnd::Fallback {
            self.state.pc = block.end;
            if self.ticks_remaining > 0 {
                return self.fallback(self.fallback_instructions);
            }
        }
        None
    }

    /// Hand the thread to the interpreter for up to `count` instructions
    /// and take it back.
    fn fallback(&mut self, count: usize) -> Option<HaltReason> {
        let mut ctx = ThreadContext::default();
        self.state.save(&mut ctx);
        self.interpreter.load_context(&ctx);

        let budget = (count as u64).min(self.ticks_remaining);
        self.interpreter.set_ticks_remaining(budget);
        let mut reason = HaltReason::empty();
        for _ in 0..budget {
            let halted = self.interpreter.step().difference(HaltReason::STEP);
            if !halted.is_empty() {
                reason = halted;
                break;
            }
        }
        let retired = budget - self.interpreter.ticks_remaining();
        self.ticks_remaining -= retired;

        self.interpreter.save_context(&mut ctx);
        self.state.load(&ctx);
        tracing::trace!(pc = ctx.pc, retired, "interpreter fallback");

        if reason.contains(HaltReason::SVC) {
            self.svc_number = self.interpreter.svc_number();
        }
        if reason.is_fault() {
            self.fault = self.interpreter.take_fault();
        }
        (!reason.is_empty()).then_some(reason)
    }
}

impl ArmCore for Translator {
    fn backend(&self) -> Backend {
        Backend::Translator
    }

    fn map_backing_memory(
        &mut self,
        addr: u64,
        size: u64,
        backing: Arc<BackingMemory>,
        perms: VmaPermission,
    ) -> MemoryResult<()> {
        self.bus.space().map(addr, size, backing, 0, perms)?;
        self.invalidate_cache_range(addr, size);
        Ok(())
    }

    fn unmap_memory(&mut self, addr: u64, size: u64) -> MemoryResult<()> {
        self.bus.space().unmap(addr, size)?;
        self.invalidate_cache_range(addr, size);
        Ok(())
    }

    fn address_space(&self) -> &Arc<AddressSpace> {
        self.bus.space()
    }

    fn page_table_changed(&mut self, space: Arc<AddressSpace>) {
        self.interpreter.page_table_changed(Arc::clone(&space));
        self.bus.set_space(space);
        self.blocks.clear();
    }

    fn pc(&self) -> u64 {
        self.state.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.state.pc = pc;
    }

    fn reg(&self, index: usize) -> u64 {
        if index == SP_INDEX {
            self.state.sp
        } else {
            self.state.x[index]
        }
    }

    fn set_reg(&mut self, index: usize, value: u64) {
        if index == SP_INDEX {
            self.state.sp = value;
        } else {
            self.state.x[index] = value;
        }
    }

    fn vector_reg(&self, index: usize) -> u128 {
        self.state.vector[index]
    }

    fn set_vector_reg(&mut self, index: usize, value: u128) {
        self.state.vector[index] = value;
    }

    fn pstate(&self) -> u32 {
        self.state.pstate()
    }

    fn set_pstate(&mut self, pstate: u32) {
        self.state.set_pstate(pstate);
    }

    fn tls_address(&self) -> u64 {
        self.state.tls_address
    }

    fn set_tls_address(&mut self, address: u64) {
        self.state.tls_address = address;
    }

    fn tpidr_el0(&self) -> u64 {
        self.state.tpidr_el0
    }

    fn set_tpidr_el0(&mut self, value: u64) {
        self.state.tpidr_el0 = value;
    }

    fn ticks_remaining(&self) -> u64 {
        self.ticks_remaining
    }

    fn set_ticks_remaining(&mut self, ticks: u64) {
        self.ticks_remaining = ticks;
    }

    fn run(&mut self) -> HaltReason {
        loop {
            let requested = self.halt.take();
            if !requested.is_empty() {
                return requested;
            }
            if self.ticks_remaining == 0 {
                return HaltReason::empty();
            }
            let block = match self.block_at(self.state.pc) {
                Ok(block) => block,
                Err(fault) => return self.abort(fault),
            };
            if let Some(reason) = self.execute_block(&block) {
                return reason;
            }
        }
    }

    fn step(&mut self) -> HaltReason {
        let budget = self.ticks_remaining;
        self.ticks_remaining = 1;
        let reason = match self.compile_block(self.state.pc, 1) {
            Ok(block) => self.execute_block(&block).unwrap_or(HaltReason::empty()),
            Err(fault) => self.abort(fault),
        };
        let retired = 1 - self.ticks_remaining;
        self.ticks_remaining = budget.saturating_sub(retired);
        reason | HaltReason::STEP
    }

    fn save_context(&self, ctx: &mut ThreadContext) {
        self.state.save(ctx);
    }

    fn load_context(&mut self, ctx: &ThreadContext) {
        self.state.load(ctx);
    }

    fn halt_handle(&self) -> &HaltHandle {
        &self.halt
    }

    fn clear_instruction_cache(&mut self) {
        self.blocks.clear();
    }

    fn invalidate_cache_range(&mut self, addr: u64, size: u64) {
        self.blocks.retain(|_, block| !block.overlaps(addr, size));
    }

    fn clear_exclusive_state(&mut self) {
        self.bus.clear_exclusive();
    }

    fn svc_number(&self) -> u32 {
        self.svc_number
    }

    fn take_fault(&mut self) -> Option<CpuFault> {
        self.fault.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::asm::*;

    const CODE: u64 = 0x10_0000;
    const DATA: u64 = 0x20_0000;

    fn space_with(program: &[u32]) -> Arc<AddressSpace> {
        let space = Arc::new(AddressSpace::new());
        space
            .map_anonymous(CODE, 0x1000, VmaPermission::READ_EXECUTE)
            .unwrap();
        space
            .map_anonymous(DATA, 0x1000, VmaPermission::READ_WRITE)
            .unwrap();
        space.load_code(CODE, program).unwrap();
        space
    }

    fn translator(space: Arc<AddressSpace>, config: &CoreConfig) -> Translator {
        let mut core = Translator::new(0, space, Arc::new(ExclusiveMonitor::new()), config);
        core.set_pc(CODE);
        core
    }

    #[test]
    fn blocks_are_cached_by_entry() {
        let program = [movz(0, 0, 0), add_imm(0, 0, 1), b(-4)];
        let mut core = translator(space_with(&program), &CoreConfig::default());
        core.set_ticks_remaining(101);
        assert_eq!(core.run(), HaltReason::empty());
        assert_eq!(core.reg(0), 50);
        assert_eq!(core.cached_blocks(), 2);
    }

    #[test]
    fn budget_stops_inside_a_block() {
        let program = [movz(0, 1, 0), movz(1, 2, 0), movz(2, 3, 0), svc(1)];
        let mut core = translator(space_with(&program), &CoreConfig::default());
        core.set_ticks_remaining(2);
        assert_eq!(core.run(), HaltReason::empty());
        assert_eq!(core.pc(), CODE + 8);
        assert_eq!(core.reg(1), 2);
        assert_eq!(core.reg(2), 0);
    }

    #[test]
    fn lazy_flags_materialize_on_save() {
        let program = [movz(0, 5, 0), subs_imm(1, 0, 5), nop()];
        let mut core = translator(space_with(&program), &CoreConfig::default());
        core.set_ticks_remaining(3);
        core.run();
        let mut ctx = ThreadContext::default();
        core.save_context(&mut ctx);
        assert_eq!(ctx.nzcv(), 0b0110);
        assert_eq!(core.pstate() >> 28, 0b0110);
    }

    #[test]
    fn system_register_access_falls_back() {
        let program = [movz(0, 7, 0), msr_tpidr(0), mrs_tpidr(1), add_imm(1, 1, 1), svc(2)];
        let mut core = translator(space_with(&program), &CoreConfig::default());
        core.set_ticks_remaining(100);
        assert_eq!(core.run(), HaltReason::SVC);
        assert_eq!(core.svc_number(), 2);
        assert_eq!(core.tpidr_el0(), 7);
        assert_eq!(core.reg(1), 8);
        assert_eq!(core.ticks_remaining(), 95);
    }

    #[test]
    fn fallback_width_is_bounded_by_budget() {
        let program = [ins_d(0, 0, 1), ins_d(1, 0, 1), ins_d(2, 0, 1), nop()];
        let config = CoreConfig::default().with_fallback_instructions(3);
        let mut core = translator(space_with(&program), &config);
        core.set_reg(1, 9);
        core.set_ticks_remaining(2);
        assert_eq!(core.run(), HaltReason::empty());
        assert_eq!(core.pc(), CODE + 8);
        assert_eq!(core.vector_reg(1), 9);
        assert_eq!(core.vector_reg(2), 0);
    }

    #[test]
    fn svc_raised_inside_fallback_propagates() {
        let program = [ins_d(0, 0, 1), svc(0x0B), nop()];
        let config = CoreConfig::default().with_fallback_instructions(4);
        let mut core = translator(space_with(&program), &config);
        core.set_ticks_remaining(10);
        assert_eq!(core.run(), HaltReason::SVC);
        assert_eq!(core.svc_number(), 0x0B);
        assert_eq!(core.pc(), CODE + 8);
        assert_eq!(core.ticks_remaining(), 8);
    }

    #[test]
    fn memory_abort_reports_faulting_pc() {
        let program = [movz(0, 0x30, 16), str_x(0, 0, 0)];
        let mut core = translator(space_with(&program), &CoreConfig::default());
        core.set_ticks_remaining(10);
        assert_eq!(core.run(), HaltReason::MEMORY_ABORT);
        let fault = core.take_fault().unwrap();
        assert_eq!(fault.context().pc, CODE + 4);
        assert_eq!(core.ticks_remaining(), 9);
    }

    #[test]
    fn invalidation_drops_overlapping_blocks() {
        let program = [nop(), svc(0)];
        let space = space_with(&program);
        let mut core = translator(Arc::clone(&space), &CoreConfig::default());
        core.set_ticks_remaining(10);
        core.run();
        assert_eq!(core.cached_blocks(), 1);
        core.invalidate_cache_range(CODE + 0x800, 4);
        assert_eq!(core.cached_blocks(), 1);
        core.invalidate_cache_range(CODE + 4, 4);
        assert_eq!(core.cached_blocks(), 0);
    }

    #[test]
    fn forced_fallback_matches_translation() {
        let program = [
            movz(0, 3, 0),
            movz(1, 10, 0),
            adds_reg(2, 0, 1),
            subs_imm(1, 1, 1),
            b_cond(GT, -8),
            eor_reg(3, 2, 0),
            brk(0),
        ];
        let space = space_with(&program);
        let config = CoreConfig::default();
        let mut fast = translator(Arc::clone(&space), &config);
        let mut slow = translator(space, &config);
        slow.set_force_fallback(true);
        for core in [&mut fast, &mut slow] {
            core.set_ticks_remaining(1000);
            assert_eq!(core.run(), HaltReason::BREAKPOINT);
        }
        let (mut a, mut b) = (ThreadContext::default(), ThreadContext::default());
        fast.save_context(&mut a);
        slow.save_context(&mut b);
        assert_eq!(a, b);
        assert_eq!(fast.ticks_remaining(), slow.ticks_remaining());
    }

    #[test]
    fn step_retires_one_instruction() {
        let program = [movz(0, 1, 0), mrs_tpidrro(1)];
        let mut core = translator(space_with(&program), &CoreConfig::default());
        core.set_tls_address(0x4000_0000);
        core.set_ticks_remaining(5);
        assert_eq!(core.step(), HaltReason::STEP);
        assert_eq!(core.step(), HaltReason::STEP);
        assert_eq!(core.reg(1), 0x4000_0000);
        assert_eq!(core.pc(), CODE + 8);
        assert_eq!(core.ticks_remaining(), 3);
    }
}
