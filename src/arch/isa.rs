//! Decoder for the supported AArch64 subset and the ALU primitives shared by
//! both execution backends.
//!
//! Register fields are kept raw (0..=31). Whether 31 names SP or the zero
//! register depends on the instruction and is resolved by the executor.

/// Hint instructions executed as no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Nop,
    Yield,
    Wfe,
    Wfi,
    Sev,
    Other(u8),
}

/// MOVN / MOVZ / MOVK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveWideOp {
    Not,
    Zero,
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftType {
    fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => ShiftType::Lsl,
            1 => ShiftType::Lsr,
            2 => ShiftType::Asr,
            _ => ShiftType::Ror,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Orr,
    Eor,
    Ands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRegKind {
    Br,
    Blr,
    Ret,
}

/// Width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
    Double,
}

impl AccessSize {
    fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => AccessSize::Byte,
            1 => AccessSize::Half,
            2 => AccessSize::Word,
            _ => AccessSize::Double,
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Half => 2,
            AccessSize::Word => 4,
            AccessSize::Double => 8,
        }
    }
}

/// System registers reachable through MRS/MSR from EL0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysReg {
    Nzcv,
    TpidrEl0,
    TpidrroEl0,
}

impl SysReg {
    /// Match the op0:op1:CRn:CRm:op2 field (bits 19..5, op0 high bit implied).
    fn from_encoding(field: u32) -> Option<Self> {
        match field {
            0x5A10 => Some(SysReg::Nzcv),
            0x5E82 => Some(SysReg::TpidrEl0),
            0x5E83 => Some(SysReg::TpidrroEl0),
            _ => None,
        }
    }
}

/// One decoded guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Hint(Hint),
    MoveWide {
        op: MoveWideOp,
        sf: bool,
        rd: u8,
        imm16: u16,
        shift: u8,
    },
    /// Rd and Rn name SP when 31, except that flag-setting forms write ZR
    AddSubImm {
        sf: bool,
        sub: bool,
        set_flags: bool,
        rd: u8,
        rn: u8,
        imm: u64,
    },
    AddSubReg {
        sf: bool,
        sub: bool,
        set_flags: bool,
        rd: u8,
        rn: u8,
        rm: u8,
        shift: ShiftType,
        amount: u8,
    },
    Logical {
        sf: bool,
        op: LogicalOp,
        invert: bool,
        rd: u8,
        rn: u8,
        rm: u8,
        shift: ShiftType,
        amount: u8,
    },
    Branch {
        link: bool,
        offset: i64,
    },
    BranchCond {
        cond: u8,
        offset: i64,
    },
    CompareBranch {
        sf: bool,
        nonzero: bool,
        rt: u8,
        offset: i64,
    },
    BranchReg {
        kind: BranchRegKind,
        rn: u8,
    },
    /// Unsigned-offset LDR/STR; Rn 31 is SP, Rt 31 is ZR
    LoadStore {
        size: AccessSize,
        load: bool,
        rt: u8,
        rn: u8,
        offset: u64,
    },
    LoadExclusive {
        size: AccessSize,
        rt: u8,
        rn: u8,
    },
    StoreExclusive {
        size: AccessSize,
        rs: u8,
        rt: u8,
        rn: u8,
    },
    Clrex,
    Svc {
        imm: u16,
    },
    Brk {
        imm: u16,
    },
    Mrs {
        reg: SysReg,
        rt: u8,
    },
    Msr {
        reg: SysReg,
        rt: u8,
    },
    /// INS Vd.D[index], Xn
    InsElement {
        rd: u8,
        index: u8,
        rn: u8,
    },
    /// UMOV Xd, Vn.D[index]
    UmovElement {
        rd: u8,
        rn: u8,
        index: u8,
    },
    /// EOR Vd.16B, Vn.16B, Vm.16B
    VectorEor {
        rd: u8,
        rn: u8,
        rm: u8,
    },
    /// ADD Vd.2D, Vn.2D, Vm.2D
    VectorAdd2D {
        rd: u8,
        rn: u8,
        rm: u8,
    },
}

impl Instruction {
    /// Whether the instruction ends a translated block.
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Instruction::Branch { .. }
                | Instruction::BranchCond { .. }
                | Instruction::CompareBranch { .. }
                | Instruction::BranchReg { .. }
                | Instruction::Svc { .. }
                | Instruction::Brk { .. }
        )
    }

    /// Whether the instruction touches vector data or system registers.
    ///
    /// The block translator leaves these to the interpreter.
    pub fn needs_interpreter(&self) -> bool {
        matches!(
            self,
            Instruction::Mrs { .. }
                | Instruction::Msr { .. }
                | Instruction::InsElement { .. }
                | Instruction::UmovElement { .. }
                | Instruction::VectorEor { .. }
                | Instruction::VectorAdd2D { .. }
        )
    }
}

#[inline]
fn bits(insn: u32, hi: u32, lo: u32) -> u32 {
    (insn >> lo) & ((1 << (hi - lo + 1)) - 1)
}

#[inline]
fn reg(insn: u32, lo: u32) -> u8 {
    bits(insn, lo + 4, lo) as u8
}

#[inline]
fn sign_extend(value: u32, width: u32) -> i64 {
    let shift = 64 - width;
    ((value as i64) << shift) >> shift
}

/// Decode one instruction word. `None` for anything outside the subset.
pub fn decode(insn: u32) -> Option<Instruction> {
    if insn & 0xFFFF_F01F == 0xD503_201F {
        let hint = match bits(insn, 11, 5) {
            0 => Hint::Nop,
            1 => Hint::Yield,
            2 => Hint::Wfe,
            3 => Hint::Wfi,
            4 => Hint::Sev,
            other => Hint::Other(other as u8),
        };
        return Some(Instruction::Hint(hint));
    }
    if insn & 0xFFFF_F0FF == 0xD503_305F {
        return Some(Instruction::Clrex);
    }
    if insn & 0xFFF0_0000 == 0xD530_0000 {
        let reg = SysReg::from_encoding(bits(insn, 19, 5))?;
        return Some(Instruction::Mrs { reg, rt: reg_rt(insn) });
    }
    if insn & 0xFFF0_0000 == 0xD510_0000 {
        let reg = SysReg::from_encoding(bits(insn, 19, 5))?;
        if reg == SysReg::TpidrroEl0 {
            return None;
        }
        return Some(Instruction::Msr { reg, rt: reg_rt(insn) });
    }
    if insn & 0xFFE0_001F == 0xD400_0001 {
        return Some(Instruction::Svc {
            imm: bits(insn, 20, 5) as u16,
        });
    }
    if insn & 0xFFE0_001F == 0xD420_0000 {
        return Some(Instruction::Brk {
            imm: bits(insn, 20, 5) as u16,
        });
    }
    if insn & 0xFFFF_FC1F == 0xD61F_0000 {
        return Some(Instruction::BranchReg {
            kind: BranchRegKind::Br,
            rn: reg(insn, 5),
        });
    }
    if insn & 0xFFFF_FC1F == 0xD63F_0000 {
        return Some(Instruction::BranchReg {
            kind: BranchRegKind::Blr,
            rn: reg(insn, 5),
        });
    }
    if insn & 0xFFFF_FC1F == 0xD65F_0000 {
        return Some(Instruction::BranchReg {
            kind: BranchRegKind::Ret,
            rn: reg(insn, 5),
        });
    }
    if insn & 0x7C00_0000 == 0x1400_0000 {
        return Some(Instruction::Branch {
            link: insn >> 31 == 1,
            offset: sign_extend(bits(insn, 25, 0), 26) << 2,
        });
    }
    if insn & 0xFF00_0010 == 0x5400_0000 {
        return Some(Instruction::BranchCond {
            cond: bits(insn, 3, 0) as u8,
            offset: sign_extend(bits(insn, 23, 5), 19) << 2,
        });
    }
    if insn & 0x7E00_0000 == 0x3400_0000 {
        return Some(Instruction::CompareBranch {
            sf: insn >> 31 == 1,
            nonzero: bits(insn, 24, 24) == 1,
            rt: reg_rt(insn),
            offset: sign_extend(bits(insn, 23, 5), 19) << 2,
        });
    }
    if insn & 0x1F80_0000 == 0x1280_0000 {
        let sf = insn >> 31 == 1;
        let op = match bits(insn, 30, 29) {
            0 => MoveWideOp::Not,
            2 => MoveWideOp::Zero,
            3 => MoveWideOp::Keep,
            _ => return None,
        };
        let hw = bits(insn, 22, 21);
        if !sf && hw >= 2 {
            return None;
        }
        return Some(Instruction::MoveWide {
            op,
            sf,
            rd: reg_rt(insn),
            imm16: bits(insn, 20, 5) as u16,
            shift: (hw * 16) as u8,
        });
    }
    if insn & 0x1F80_0000 == 0x1100_0000 {
        let imm12 = bits(insn, 21, 10) as u64;
        return Some(Instruction::AddSubImm {
            sf: insn >> 31 == 1,
            sub: bits(insn, 30, 30) == 1,
            set_flags: bits(insn, 29, 29) == 1,
            rd: reg_rt(insn),
            rn: reg(insn, 5),
            imm: if bits(insn, 22, 22) == 1 { imm12 << 12 } else { imm12 },
        });
    }
    if insn & 0x1F20_0000 == 0x0B00_0000 {
        let sf = insn >> 31 == 1;
        let shift = bits(insn, 23, 22);
        let amount = bits(insn, 15, 10);
        if shift == 3 || (!sf && amount >= 32) {
            return None;
        }
        return Some(Instruction::AddSubReg {
            sf,
            sub: bits(insn, 30, 30) == 1,
            set_flags: bits(insn, 29, 29) == 1,
            rd: reg_rt(insn),
            rn: reg(insn, 5),
            rm: reg(insn, 16),
            shift: ShiftType::from_bits(shift),
            amount: amount as u8,
        });
    }
    if insn & 0x1F00_0000 == 0x0A00_0000 {
        let sf = insn >> 31 == 1;
        let amount = bits(insn, 15, 10);
        if !sf && amount >= 32 {
            return None;
        }
        let op = match bits(insn, 30, 29) {
            0 => LogicalOp::And,
            1 => LogicalOp::Orr,
            2 => LogicalOp::Eor,
            _ => LogicalOp::Ands,
        };
        return Some(Instruction::Logical {
            sf,
            op,
            invert: bits(insn, 21, 21) == 1,
            rd: reg_rt(insn),
            rn: reg(insn, 5),
            rm: reg(insn, 16),
            shift: ShiftType::from_bits(bits(insn, 23, 22)),
            amount: amount as u8,
        });
    }
    if insn & 0x3F00_0000 == 0x3900_0000 {
        let size = AccessSize::from_bits(bits(insn, 31, 30));
        let load = match bits(insn, 23, 22) {
            0 => false,
            1 => true,
            _ => return None,
        };
        return Some(Instruction::LoadStore {
            size,
            load,
            rt: reg_rt(insn),
            rn: reg(insn, 5),
            offset: (bits(insn, 21, 10) as u64) << bits(insn, 31, 30),
        });
    }
    if insn & 0x3F00_0000 == 0x0800_0000 {
        // Only the plain and acquire/release exclusive pair-less forms.
        if bits(insn, 31, 30) < 2 || bits(insn, 23, 23) != 0 || bits(insn, 21, 21) != 0 {
            return None;
        }
        if bits(insn, 14, 10) != 0x1F {
            return None;
        }
        let size = AccessSize::from_bits(bits(insn, 31, 30));
        return Some(if bits(insn, 22, 22) == 1 {
            Instruction::LoadExclusive {
                size,
                rt: reg_rt(insn),
                rn: reg(insn, 5),
            }
        } else {
            Instruction::StoreExclusive {
                size,
                rs: reg(insn, 16),
                rt: reg_rt(insn),
                rn: reg(insn, 5),
            }
        });
    }
    if insn & 0xFFE0_FC00 == 0x4E00_1C00 && bits(insn, 19, 16) == 0b1000 {
        return Some(Instruction::InsElement {
            rd: reg_rt(insn),
            index: bits(insn, 20, 20) as u8,
            rn: reg(insn, 5),
        });
    }
    if insn & 0xFFE0_FC00 == 0x4E00_3C00 && bits(insn, 19, 16) == 0b1000 {
        return Some(Instruction::UmovElement {
            rd: reg_rt(insn),
            rn: reg(insn, 5),
            index: bits(insn, 20, 20) as u8,
        });
    }
    if insn & 0xFFE0_FC00 == 0x6E20_1C00 {
        return Some(Instruction::VectorEor {
            rd: reg_rt(insn),
            rn: reg(insn, 5),
            rm: reg(insn, 16),
        });
    }
    if insn & 0xFFE0_FC00 == 0x4EE0_8400 {
        return Some(Instruction::VectorAdd2D {
            rd: reg_rt(insn),
            rn: reg(insn, 5),
            rm: reg(insn, 16),
        });
    }
    None
}

#[inline]
fn reg_rt(insn: u32) -> u8 {
    reg(insn, 0)
}

/// Truncate to the operand width.
#[inline]
pub fn truncate(value: u64, sf: bool) -> u64 {
    if sf {
        value
    } else {
        value & 0xFFFF_FFFF
    }
}

/// Apply a register-operand shift at the operand width.
pub fn shift_value(value: u64, shift: ShiftType, amount: u8, sf: bool) -> u64 {
    let amount = u32::from(amount);
    if sf {
        match shift {
            ShiftType::Lsl => value << amount,
            ShiftType::Lsr => value >> amount,
            ShiftType::Asr => ((value as i64) >> amount) as u64,
            ShiftType::Ror => value.rotate_right(amount),
        }
    } else {
        let value = value as u32;
        u64::from(match shift {
            ShiftType::Lsl => value << amount,
            ShiftType::Lsr => value >> amount,
            ShiftType::Asr => ((value as i32) >> amount) as u32,
            ShiftType::Ror => value.rotate_right(amount),
        })
    }
}

/// `a + b + carry` at the operand width, returning the result and NZCV
/// packed in bits 3..0.
pub fn add_with_carry(a: u64, b: u64, carry: bool, sf: bool) -> (u64, u32) {
    let carry = u64::from(carry);
    if sf {
        let unsigned = a as u128 + b as u128 + carry as u128;
        let result = unsigned as u64;
        let signed = (a as i64 as i128) + (b as i64 as i128) + carry as i128;
        let n = result >> 63;
        let z = u64::from(result == 0);
        let c = u64::from(unsigned >> 64 != 0);
        let v = u64::from(signed != result as i64 as i128);
        (result, ((n << 3) | (z << 2) | (c << 1) | v) as u32)
    } else {
        let (a, b) = (a as u32, b as u32);
        let unsigned = a as u64 + b as u64 + carry;
        let result = unsigned as u32;
        let signed = (a as i32 as i64) + (b as i32 as i64) + carry as i64;
        let n = result >> 31;
        let z = u32::from(result == 0);
        let c = u32::from(unsigned >> 32 != 0);
        let v = u32::from(signed != result as i32 as i64);
        (u64::from(result), (n << 3) | (z << 2) | (c << 1) | v)
    }
}

/// Add or subtract at the operand width, returning the result and NZCV.
pub fn add_sub(a: u64, b: u64, sub: bool, sf: bool) -> (u64, u32) {
    if sub {
        add_with_carry(a, truncate(!b, sf), true, sf)
    } else {
        add_with_carry(a, b, false, sf)
    }
}

/// NZCV (bits 3..0) of a logical result; C and V are cleared.
pub fn logical_flags(result: u64, sf: bool) -> u32 {
    let sign_bit = if sf { 63 } else { 31 };
    let n = ((result >> sign_bit) & 1) as u32;
    let z = u32::from(truncate(result, sf) == 0);
    (n << 3) | (z << 2)
}

/// Evaluate a logical-shifted-register operation at the operand width.
pub fn logical(op: LogicalOp, a: u64, b: u64, sf: bool) -> u64 {
    let result = match op {
        LogicalOp::And | LogicalOp::Ands => a & b,
        LogicalOp::Orr => a | b,
        LogicalOp::Eor => a ^ b,
    };
    truncate(result, sf)
}

/// Value of a MOVN/MOVZ/MOVK given the old destination value.
pub fn move_wide(op: MoveWideOp, old: u64, imm16: u16, shift: u8, sf: bool) -> u64 {
    let imm = u64::from(imm16) << shift;
    let value = match op {
        MoveWideOp::Zero => imm,
        MoveWideOp::Not => !imm,
        MoveWideOp::Keep => (old & !(0xFFFF << shift)) | imm,
    };
    truncate(value, sf)
}

/// Whether condition `cond` holds for `nzcv` (bits 3..0).
pub fn condition_holds(cond: u8, nzcv: u32) -> bool {
    let n = nzcv & 8 != 0;
    let z = nzcv & 4 != 0;
    let c = nzcv & 2 != 0;
    let v = nzcv & 1 != 0;
    let result = match cond >> 1 {
        0 => z,
        1 => c,
        2 => n,
        3 => v,
        4 => c && !z,
        5 => n == v,
        6 => n == v && !z,
        _ => true,
    };
    if cond & 1 == 1 && cond != 0xF {
        !result
    } else {
        result
    }
}

/// Per-lane 64-bit addition of two vector registers.
pub fn vector_add_2d(a: u128, b: u128) -> u128 {
    let lo = (a as u64).wrapping_add(b as u64);
    let hi = ((a >> 64) as u64).wrapping_add((b >> 64) as u64);
    (u128::from(hi) << 64) | u128::from(lo)
}

/// Replace 64-bit lane `index` of `vector` with `value`.
pub fn insert_lane(vector: u128, index: u8, value: u64) -> u128 {
    let shift = u32::from(index) * 64;
    (vector & !(u128::from(u64::MAX) << shift)) | (u128::from(value) << shift)
}

/// Extract 64-bit lane `index` of `vector`.
pub fn extract_lane(vector: u128, index: u8) -> u64 {
    (vector >> (u32::from(index) * 64)) as u64
}
