//! Precise single-instruction backend.
//!
//! Keeps the full [`ThreadContext`] with eagerly computed flags and retires
//! one instruction at a time, so it can stop after any instruction. The
//! block translator borrows it for everything it cannot translate.

use super::bus::GuestBus;
use super::context::{ThreadContext, NZCV_MASK};
use super::exclusive::ExclusiveMonitor;
use super::isa::{self, BranchRegKind, Instruction, LogicalOp, SysReg};
use super::{ArmCore, HaltHandle, HaltReason};
use crate::config::Backend;
use crate::errors::{CpuFault, MemoryFault, MemoryResult};
use crate::mem::{AddressSpace, BackingMemory, VmaPermission};
use std::sync::Arc;

/// Control flow after one executed instruction.
enum Flow {
    Next,
    Jump(u64),
    Svc(u16),
    Breakpoint(u16),
}

pub struct Interpreter {
    ctx: ThreadContext,
    bus: GuestBus,
    ticks_remaining: u64,
    halt: HaltHandle,
    svc_number: u32,
    fault: Option<CpuFault>,
}

impl Interpreter {
    pub fn new(core: usize, space: Arc<AddressSpace>, monitor: Arc<ExclusiveMonitor>) -> Self {
        Self {
            ctx: ThreadContext::default(),
            bus: GuestBus::new(core, space, monitor),
            ticks_remaining: 0,
            halt: HaltHandle::new(),
            svc_number: 0,
            fault: None,
        }
    }

    /// Live register file.
    pub fn context(&self) -> &ThreadContext {
        &self.ctx
    }

    /// Register `r` with 31 reading as zero.
    #[inline]
    fn x(&self, r: u8) -> u64 {
        if r == 31 {
            0
        } else {
            self.ctx.x[r as usize]
        }
    }

    /// Register `r` with 31 reading SP.
    #[inline]
    fn x_or_sp(&self, r: u8) -> u64 {
        self.ctx.reg(r as usize)
    }

    #[inline]
    fn set_x(&mut self, r: u8, value: u64) {
        if r != 31 {
            self.ctx.x[r as usize] = value;
        }
    }

    #[inline]
    fn set_x_or_sp(&mut self, r: u8, value: u64) {
        self.ctx.set_reg(r as usize, value);
    }

    #[inline]
    fn set_nzcv(&mut self, nzcv: u32) {
        self.ctx.pstate = (self.ctx.pstate & !NZCV_MASK) | (nzcv << 28);
    }

    fn retire(&mut self) {
        self.ticks_remaining = self.ticks_remaining.saturating_sub(1);
    }

    fn abort(&mut self, fault: MemoryFault) -> HaltReason {
        tracing::debug!(core = self.bus.core(), pc = self.ctx.pc, %fault, "interpreter memory abort");
        self.fault = Some(CpuFault::MemoryAbort {
            fault,
            context: Box::new(self.ctx.clone()),
        });
        HaltReason::MEMORY_ABORT
    }

    /// Fetch, decode and execute the instruction at PC.
    ///
    /// # Panics
    ///
    /// Panics on an encoding outside the supported subset.
    fn execute_one(&mut self) -> HaltReason {
        let pc = self.ctx.pc;
        let word = match self.bus.fetch(pc) {
            Ok(word) => word,
            Err(fault) => return self.abort(fault),
        };
        let Some(insn) = isa::decode(word) else {
            panic!("undefined instruction {word:#010x} at pc={pc:#x}");
        };
        match self.execute(insn, pc) {
            Ok(Flow::Next) => {
                self.ctx.pc = pc.wrapping_add(4);
                self.retire();
                HaltReason::empty()
            }
            Ok(Flow::Jump(target)) => {
                self.ctx.pc = target;
                self.retire();
                HaltReason::empty()
            }
            Ok(Flow::Svc(imm)) => {
                self.ctx.pc = pc.wrapping_add(4);
                self.retire();
                self.svc_number = u32::from(imm);
                HaltReason::SVC
            }
            Ok(Flow::Breakpoint(imm)) => {
                self.fault = Some(CpuFault::Breakpoint {
                    imm,
                    context: Box::new(self.ctx.clone()),
                });
                HaltReason::BREAKPOINT
            }
            Err(fault) => self.abort(fault),
        }
    }

    fn execute(&mut self, insn: Instruction, pc: u64) -> MemoryResult<Flow> {
        match insn {
            Instruction::Hint(_) => {}
            Instruction::MoveWide {
                op,
                sf,
                rd,
                imm16,
                shift,
            } => {
                let value = isa::move_wide(op, self.x(rd), imm16, shift, sf);
                self.set_x(rd, value);
            }
            Instruction::AddSubImm {
                sf,
                sub,
                set_flags,
                rd,
                rn,
                imm,
            } => {
                let (result, nzcv) = isa::add_sub(self.x_or_sp(rn), imm, sub, sf);
                if set_flags {
                    self.set_nzcv(nzcv);
                    self.set_x(rd, result);
                } else {
                    self.set_x_or_sp(rd, result);
                }
            }
            Instruction::AddSubReg {
                sf,
                sub,
                set_flags,
                rd,
                rn,
                rm,
                shift,
                amount,
            } => {
                let operand = isa::shift_value(self.x(rm), shift, amount, sf);
                let (result, nzcv) = isa::add_sub(self.x(rn), operand, sub, sf);
                if set_flags {
                    self.set_nzcv(nzcv);
                }
                self.set_x(rd, result);
            }
            Instruction::Logical {
                sf,
                op,
                invert,
                rd,
                rn,
                rm,
                shift,
                amount,
            } => {
                let mut operand = isa::shift_value(self.x(rm), shift, amount, sf);
                if invert {
                    operand = !operand;
                }
                let result = isa::logical(op, self.x(rn), operand, sf);
                if op == LogicalOp::Ands {
                    self.set_nzcv(isa::logical_flags(result, sf));
                }
                self.set_x(rd, result);
            }
            Instruction::Branch { link, offset } => {
                if link {
                    self.set_x(30, pc.wrapping_add(4));
                }
                return Ok(Flow::Jump(pc.wrapping_add(offset as u64)));
            }
            Instruction::BranchCond { cond, offset } => {
                if isa::condition_holds(cond, self.ctx.nzcv()) {
                    return Ok(Flow::Jump(pc.wrapping_add(offset as u64)));
                }
            }
            Instruction::CompareBranch {
                sf,
                nonzero,
                rt,
                offset,
            } => {
                if (isa::truncate(self.x(rt), sf) != 0) == nonzero {
                    return Ok(Flow::Jump(pc.wrapping_add(offset as u64)));
                }
            }
            Instruction::BranchReg { kind, rn } => {
                let target = self.x(rn);
                if kind == BranchRegKind::Blr {
                    self.set_x(30, pc.wrapping_add(4));
                }
                return Ok(Flow::Jump(target));
            }
            Instruction::LoadStore {
                size,
                load,
                rt,
                rn,
                offset,
            } => {
                let addr = self.x_or_sp(rn).wrapping_add(offset);
                if load {
                    let value = self.bus.load(addr, size)?;
                    self.set_x(rt, value);
                } else {
                    self.bus.store(addr, size, self.x(rt))?;
                }
            }
            Instruction::LoadExclusive { size, rt, rn } => {
                let value = self.bus.load_exclusive(self.x_or_sp(rn), size)?;
                self.set_x(rt, value);
            }
            Instruction::StoreExclusive { size, rs, rt, rn } => {
                let stored = self.bus.store_exclusive(self.x_or_sp(rn), size, self.x(rt))?;
                self.set_x(rs, u64::from(!stored));
            }
            Instruction::Clrex => self.bus.clear_exclusive(),
            Instruction::Svc { imm } => return Ok(Flow::Svc(imm)),
            Instruction::Brk { imm } => return Ok(Flow::Breakpoint(imm)),
            Instruction::Mrs { reg, rt } => {
                let value = match reg {
                    SysReg::Nzcv => u64::from(self.ctx.pstate & NZCV_MASK),
                    SysReg::TpidrEl0 => self.ctx.tpidr_el0,
                    SysReg::TpidrroEl0 => self.ctx.tls_address,
                };
                self.set_x(rt, value);
            }
            Instruction::Msr { reg, rt } => {
                let value = self.x(rt);
                match reg {
                    SysReg::Nzcv => {
                        self.ctx.pstate =
                            (self.ctx.pstate & !NZCV_MASK) | (value as u32 & NZCV_MASK);
                    }
                    SysReg::TpidrEl0 => self.ctx.tpidr_el0 = value,
                    SysReg::TpidrroEl0 => unreachable!("TPIDRRO_EL0 is read-only at EL0"),
                }
            }
            Instruction::InsElement { rd, index, rn } => {
                let value = self.x(rn);
                let lane = &mut self.ctx.vector[rd as usize];
                *lane = isa::insert_lane(*lane, index, value);
            }
            Instruction::UmovElement { rd, rn, index } => {
                let value = isa::extract_lane(self.ctx.vector[rn as usize], index);
                self.set_x(rd, value);
            }
            Instruction::VectorEor { rd, rn, rm } => {
                self.ctx.vector[rd as usize] =
                    self.ctx.vector[rn as usize] ^ self.ctx.vector[rm as usize];
            }
            Instruction::VectorAdd2D { rd, rn, rm } => {
                self.ctx.vector[rd as usize] =
                    isa::vector_add_2d(self.ctx.vector[rn as usize], self.ctx.vector[rm as usize]);
            }
        }
        Ok(Flow::Next)
    }
}

impl ArmCore for Interpreter {
    fn backend(&self) -> Backend {
        Backend::Interpreter
    }

    fn map_backing_memory(
        &mut self,
        addr: u64,
        size: u64,
        backing: Arc<BackingMemory>,
        perms: VmaPermission,
    ) -> MemoryResult<()> {
        self.bus.space().map(addr, size, backing, 0, perms)
    }

    fn unmap_memory(&mut self, addr: u64, size: u64) -> MemoryResult<()> {
        self.bus.space().unmap(addr, size)
    }

    fn address_space(&self) -> &Arc<AddressSpace> {
        self.bus.space()
    }

    fn page_table_changed(&mut self, space: Arc<AddressSpace>) {
        self.bus.set_space(space);
    }

    fn pc(&self) -> u64 {
        self.ctx.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.ctx.pc = pc;
    }

    fn reg(&self, index: usize) -> u64 {
        self.ctx.reg(index)
    }

    fn set_reg(&mut self, index: usize, value: u64) {
        self.ctx.set_reg(index, value);
    }

    fn vector_reg(&self, index: usize) -> u128 {
        self.ctx.vector[index]
    }

    fn set_vector_reg(&mut self, index: usize, value: u128) {
        self.ctx.vector[index] = value;
    }

    fn pstate(&self) -> u32 {
        self.ctx.pstate
    }

    fn set_pstate(&mut self, pstate: u32) {
        self.ctx.pstate = pstate;
    }

    fn tls_address(&self) -> u64 {
        self.ctx.tls_address
    }

    fn set_tls_address(&mut self, address: u64) {
        self.ctx.tls_address = address;
    }

    fn tpidr_el0(&self) -> u64 {
        self.ctx.tpidr_el0
    }

    fn set_tpidr_el0(&mut self, value: u64) {
        self.ctx.tpidr_el0 = value;
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
            let reason = self.execute_one();
            if !reason.is_empty() {
                return reason;
            }
        }
    }

    fn step(&mut self) -> HaltReason {
        self.execute_one() | HaltReason::STEP
    }

    fn save_context(&self, ctx: &mut ThreadContext) {
        ctx.clone_from(&self.ctx);
    }

    fn load_context(&mut self, ctx: &ThreadContext) {
        self.ctx.clone_from(ctx);
    }

    fn halt_handle(&self) -> &HaltHandle {
        &self.halt
    }

    fn clear_instruction_cache(&mut self) {}

    fn invalidate_cache_range(&mut self, _addr: u64, _size: u64) {}

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
