//! Instruction decoding for RV32IMAC (plus Zicsr and the privileged forms).
//!
//! Decoding happens once, into the tagged [`Instruction`] sum; execution then
//! dispatches by `match`. 16-bit compressed parcels are expanded into the
//! same sum by [`Instruction::decode_compressed`].

use crate::hart::csr::CsrSpecifier;
use crate::registers::Specifier;
use thiserror::Error;

/// Data structure that can hold any supported instruction in its decoded
/// form.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Instruction {
    OpImm {
        op: RegImmOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    OpShiftImm {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    },
    Auipc {
        dest: Specifier,
        immediate: i32,
    },
    Lui {
        dest: Specifier,
        immediate: i32,
    },
    Op {
        op: RegRegOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    Jal {
        dest: Specifier,
        offset: i32,
    },
    Jalr {
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Branch {
        condition: BranchCondition,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
    },
    Load {
        width: LoadWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Store {
        width: StoreWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    /// LR.W: register a reservation on the word at `x[addr]` and load it.
    LoadReserved {
        dest: Specifier,
        addr: Specifier,
    },
    /// SC.W: store `x[src]` to `x[addr]` iff the reservation still holds.
    StoreConditional {
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    },
    /// The AMO*.W atomic read-modify-write family.
    Amo {
        op: AmoOp,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    },
    Fence {
        predecessor: FenceOrderCombination,
        successor: FenceOrderCombination,
    },
    FenceI,
    Ecall,
    Ebreak,
    Csr {
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src: Specifier,
    },
    Csri {
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    },
    Mret,
    Sret,
    Uret,
    Wfi,
    SfenceVma {
        vaddr: Specifier,
        asid: Specifier,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegImmOp {
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegShiftImmOp {
    Slli,
    Srli,
    Srai,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegRegOp {
    Add,
    Slt,
    Sltu,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sub,
    Sra,
    // M standard extension
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BranchCondition {
    Beq,
    Bne,
    Blt,
    Bltu,
    Bge,
    Bgeu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadWidth {
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreWidth {
    Sb,
    Sh,
    Sw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    Minu,
    Maxu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FenceOrderCombination {
    pub device_input: bool,
    pub device_output: bool,
    pub memory_reads: bool,
    pub memory_writes: bool,
}

impl Instruction {
    /// Decode a full 32-bit instruction.
    pub fn decode(raw_instruction: u32) -> Result<Self, DecodeError> {
        match opcode(raw_instruction).ok_or(DecodeError::UnsupportedOpcode)? {
            Opcode::OpImm => match i_funct(raw_instruction) {
                Some(op) => Ok(Self::OpImm {
                    op,
                    dest: rd(raw_instruction),
                    src: rs1(raw_instruction),
                    immediate: i_imm(raw_instruction),
                }),
                None => match i_shfunct(raw_instruction) {
                    Some(op) => Ok(Self::OpShiftImm {
                        op,
                        dest: rd(raw_instruction),
                        src: rs1(raw_instruction),
                        shift_amount_u5: shamt(raw_instruction),
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                },
            },
            Opcode::Auipc => Ok(Self::Auipc {
                dest: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
            }),
            Opcode::Lui => Ok(Self::Lui {
                dest: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
            }),
            Opcode::Op => match r_funct(raw_instruction) {
                Some(op) => Ok(Self::Op {
                    op,
                    dest: rd(raw_instruction),
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Jal => Ok(Self::Jal {
                dest: rd(raw_instruction),
                offset: j_imm(raw_instruction),
            }),
            Opcode::Jalr => match funct3(raw_instruction) {
                0b000 => Ok(Self::Jalr {
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Branch => match b_funct(raw_instruction) {
                Some(condition) => Ok(Self::Branch {
                    condition,
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                    offset: b_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Load => match i_width(raw_instruction) {
                Some(width) => Ok(Self::Load {
                    width,
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Store => match s_width(raw_instruction) {
                Some(width) => Ok(Self::Store {
                    width,
                    src: rs2(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: s_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Amo => decode_amo(raw_instruction),
            Opcode::MiscMem => match funct3(raw_instruction) {
                0b000 => {
                    // All unused fields (fm, rd, rs1) are reserved for future
                    // use and must be treated as a normal fence for forward
                    // compatibility, so they are simply ignored here. The
                    // same holds for the optional FENCE.TSO encoding.
                    let predecessor = FenceOrderCombination {
                        device_input: (raw_instruction >> 27) & 0b1 == 1,
                        device_output: (raw_instruction >> 26) & 0b1 == 1,
                        memory_reads: (raw_instruction >> 25) & 0b1 == 1,
                        memory_writes: (raw_instruction >> 24) & 0b1 == 1,
                    };
                    let successor = FenceOrderCombination {
                        device_input: (raw_instruction >> 23) & 0b1 == 1,
                        device_output: (raw_instruction >> 22) & 0b1 == 1,
                        memory_reads: (raw_instruction >> 21) & 0b1 == 1,
                        memory_writes: (raw_instruction >> 20) & 0b1 == 1,
                    };
                    Ok(Self::Fence {
                        predecessor,
                        successor,
                    })
                }
                0b001 => Ok(Self::FenceI),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::System => decode_system(raw_instruction),
        }
    }

    /// Decode a 16-bit compressed instruction, expanding it to its 32-bit
    /// equivalent.
    ///
    /// The all-zero halfword is defined to be illegal, and conveniently falls
    /// out of the C.ADDI4SPN zero-immediate check.
    pub fn decode_compressed(raw_instruction: u16) -> Result<Self, DecodeError> {
        match raw_instruction & 0b11 {
            0b00 => decode_c_quadrant0(raw_instruction),
            0b01 => decode_c_quadrant1(raw_instruction),
            0b10 => decode_c_quadrant2(raw_instruction),
            // Quadrant 3 is the uncompressed instruction space.
            _ => Err(DecodeError::IllegalInstruction),
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("instruction has unsupported opcode")]
    UnsupportedOpcode,
    #[error("illegal instruction")]
    IllegalInstruction,
}

fn decode_amo(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    if funct3(raw_instruction) != 0b010 {
        return Err(DecodeError::IllegalInstruction);
    }
    // The aq/rl ordering bits (26:25) are accepted and ignored: all emulated
    // atomics are sequentially consistent anyway.
    let funct5 = raw_instruction >> 27;
    let dest = rd(raw_instruction);
    let addr = rs1(raw_instruction);
    let src = rs2(raw_instruction);
    let op = match funct5 {
        0b00010 => {
            return match u8::from(src) {
                0 => Ok(Instruction::LoadReserved { dest, addr }),
                _ => Err(DecodeError::IllegalInstruction),
            }
        }
        0b00011 => return Ok(Instruction::StoreConditional { dest, addr, src }),
        0b00001 => AmoOp::Swap,
        0b00000 => AmoOp::Add,
        0b00100 => AmoOp::Xor,
        0b01100 => AmoOp::And,
        0b01000 => AmoOp::Or,
        0b10000 => AmoOp::Min,
        0b10100 => AmoOp::Max,
        0b11000 => AmoOp::Minu,
        0b11100 => AmoOp::Maxu,
        _ => return Err(DecodeError::IllegalInstruction),
    };
    Ok(Instruction::Amo {
        op,
        dest,
        addr,
        src,
    })
}

fn decode_system(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    let dest = rd(raw_instruction);
    let src = rs1(raw_instruction);
    let csr = csr_specifier(raw_instruction);
    match funct3(raw_instruction) {
        0b000 => {
            if u8::from(dest) != 0 {
                return Err(DecodeError::IllegalInstruction);
            }
            if funct7(raw_instruction) == 0b0001001 {
                // SFENCE.VMA rs1, rs2
                return Ok(Instruction::SfenceVma {
                    vaddr: src,
                    asid: rs2(raw_instruction),
                });
            }
            if u8::from(src) != 0 {
                return Err(DecodeError::IllegalInstruction);
            }
            match raw_instruction >> 20 {
                0b0000_0000_0000 => Ok(Instruction::Ecall),
                0b0000_0000_0001 => Ok(Instruction::Ebreak),
                0b0000_0000_0010 => Ok(Instruction::Uret),
                0b0001_0000_0010 => Ok(Instruction::Sret),
                0b0011_0000_0010 => Ok(Instruction::Mret),
                0b0001_0000_0101 => Ok(Instruction::Wfi),
                _ => Err(DecodeError::IllegalInstruction),
            }
        }
        0b001 => Ok(Instruction::Csr {
            op: CsrOp::ReadWrite,
            dest,
            csr,
            src,
        }),
        0b010 => Ok(Instruction::Csr {
            op: CsrOp::ReadSet,
            dest,
            csr,
            src,
        }),
        0b011 => Ok(Instruction::Csr {
            op: CsrOp::ReadClear,
            dest,
            csr,
            src,
        }),
        0b101 => Ok(Instruction::Csri {
            op: CsrOp::ReadWrite,
            dest,
            csr,
            immediate: u32::from(u8::from(src)),
        }),
        0b110 => Ok(Instruction::Csri {
            op: CsrOp::ReadSet,
            dest,
            csr,
            immediate: u32::from(u8::from(src)),
        }),
        0b111 => Ok(Instruction::Csri {
            op: CsrOp::ReadClear,
            dest,
            csr,
            immediate: u32::from(u8::from(src)),
        }),
        _ => Err(DecodeError::IllegalInstruction),
    }
}

//
// Compressed quadrants. Register fields:
// - full 5-bit rd/rs1 at bits 11:7, rs2 at bits 6:2;
// - popular 3-bit rd'/rs2' at bits 4:2 and rs1' at bits 9:7 (mapping to
//   x8..=x15).
//

fn decode_c_quadrant0(raw: u16) -> Result<Instruction, DecodeError> {
    match c_funct3(raw) {
        0b000 => {
            // C.ADDI4SPN -> addi rd', x2, nzuimm
            let nzuimm = (bits(raw, 12, 11) << 4)
                | (bits(raw, 10, 7) << 6)
                | (bits(raw, 6, 6) << 2)
                | (bits(raw, 5, 5) << 3);
            match nzuimm {
                0 => Err(DecodeError::IllegalInstruction),
                _ => Ok(Instruction::OpImm {
                    op: RegImmOp::Addi,
                    dest: c_rd_short(raw),
                    src: Specifier::X2,
                    immediate: nzuimm as i32,
                }),
            }
        }
        0b010 => {
            // C.LW -> lw rd', uimm(rs1')
            Ok(Instruction::Load {
                width: LoadWidth::Lw,
                dest: c_rd_short(raw),
                base: c_rs1_short(raw),
                offset: c_ls_uimm(raw) as i32,
            })
        }
        0b110 => {
            // C.SW -> sw rs2', uimm(rs1')
            Ok(Instruction::Store {
                width: StoreWidth::Sw,
                src: c_rs2_short(raw),
                base: c_rs1_short(raw),
                offset: c_ls_uimm(raw) as i32,
            })
        }
        // 001/011/101/111 are the FP loads/stores (no F/D extension here),
        // 100 is reserved.
        _ => Err(DecodeError::IllegalInstruction),
    }
}

fn decode_c_quadrant1(raw: u16) -> Result<Instruction, DecodeError> {
    match c_funct3(raw) {
        0b000 => {
            // C.NOP / C.ADDI -> addi rd, rd, imm
            let dest = c_rd(raw);
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest,
                src: dest,
                immediate: c_imm6(raw),
            })
        }
        0b001 => {
            // C.JAL -> jal x1, offset (RV32 only)
            Ok(Instruction::Jal {
                dest: Specifier::X1,
                offset: c_j_imm(raw),
            })
        }
        0b010 => {
            // C.LI -> addi rd, x0, imm
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: c_rd(raw),
                src: Specifier::X0,
                immediate: c_imm6(raw),
            })
        }
        0b011 => {
            let dest = c_rd(raw);
            if u8::from(dest) == 2 {
                // C.ADDI16SP -> addi x2, x2, nzimm
                let imm = (bits(raw, 12, 12) << 9)
                    | (bits(raw, 6, 6) << 4)
                    | (bits(raw, 5, 5) << 6)
                    | (bits(raw, 4, 3) << 7)
                    | (bits(raw, 2, 2) << 5);
                match imm {
                    0 => Err(DecodeError::IllegalInstruction),
                    _ => Ok(Instruction::OpImm {
                        op: RegImmOp::Addi,
                        dest: Specifier::X2,
                        src: Specifier::X2,
                        immediate: sign_extend(imm, 10),
                    }),
                }
            } else {
                // C.LUI -> lui rd, nzimm
                match c_imm6(raw) {
                    0 => Err(DecodeError::IllegalInstruction),
                    imm => Ok(Instruction::Lui {
                        dest,
                        immediate: imm << 12,
                    }),
                }
            }
        }
        0b100 => {
            let dest = c_rs1_short(raw);
            match bits(raw, 11, 10) {
                0b00 | 0b01 => {
                    // C.SRLI / C.SRAI -> srli/srai rd', rd', shamt
                    let op = match bits(raw, 11, 10) {
                        0b00 => RegShiftImmOp::Srli,
                        _ => RegShiftImmOp::Srai,
                    };
                    match c_shamt(raw) {
                        Some(shift_amount_u5) => Ok(Instruction::OpShiftImm {
                            op,
                            dest,
                            src: dest,
                            shift_amount_u5,
                        }),
                        None => Err(DecodeError::IllegalInstruction),
                    }
                }
                0b10 => {
                    // C.ANDI -> andi rd', rd', imm
                    Ok(Instruction::OpImm {
                        op: RegImmOp::Andi,
                        dest,
                        src: dest,
                        immediate: c_imm6(raw),
                    })
                }
                _ => {
                    // C.SUB / C.XOR / C.OR / C.AND (bit 12 set selects the
                    // RV64-only W variants, which are reserved on RV32).
                    if bits(raw, 12, 12) != 0 {
                        return Err(DecodeError::IllegalInstruction);
                    }
                    let op = match bits(raw, 6, 5) {
                        0b00 => RegRegOp::Sub,
                        0b01 => RegRegOp::Xor,
                        0b10 => RegRegOp::Or,
                        _ => RegRegOp::And,
                    };
                    Ok(Instruction::Op {
                        op,
                        dest,
                        src1: dest,
                        src2: c_rs2_short(raw),
                    })
                }
            }
        }
        0b101 => {
            // C.J -> jal x0, offset
            Ok(Instruction::Jal {
                dest: Specifier::X0,
                offset: c_j_imm(raw),
            })
        }
        0b110 | 0b111 => {
            // C.BEQZ / C.BNEZ -> beq/bne rs1', x0, offset
            let condition = match c_funct3(raw) {
                0b110 => BranchCondition::Beq,
                _ => BranchCondition::Bne,
            };
            Ok(Instruction::Branch {
                condition,
                src1: c_rs1_short(raw),
                src2: Specifier::X0,
                offset: c_b_imm(raw),
            })
        }
        _ => unreachable!(),
    }
}

fn decode_c_quadrant2(raw: u16) -> Result<Instruction, DecodeError> {
    match c_funct3(raw) {
        0b000 => {
            // C.SLLI -> slli rd, rd, shamt
            let dest = c_rd(raw);
            match c_shamt(raw) {
                Some(shift_amount_u5) => Ok(Instruction::OpShiftImm {
                    op: RegShiftImmOp::Slli,
                    dest,
                    src: dest,
                    shift_amount_u5,
                }),
                None => Err(DecodeError::IllegalInstruction),
            }
        }
        0b010 => {
            // C.LWSP -> lw rd, uimm(x2)
            let dest = c_rd(raw);
            if u8::from(dest) == 0 {
                return Err(DecodeError::IllegalInstruction);
            }
            let uimm =
                (bits(raw, 12, 12) << 5) | (bits(raw, 6, 4) << 2) | (bits(raw, 3, 2) << 6);
            Ok(Instruction::Load {
                width: LoadWidth::Lw,
                dest,
                base: Specifier::X2,
                offset: uimm as i32,
            })
        }
        0b100 => {
            let dest = c_rd(raw);
            let src = c_rs2(raw);
            match (bits(raw, 12, 12), u8::from(dest), u8::from(src)) {
                (0, 0, _) => Err(DecodeError::IllegalInstruction),
                (0, _, 0) => {
                    // C.JR -> jalr x0, rs1, 0
                    Ok(Instruction::Jalr {
                        dest: Specifier::X0,
                        base: dest,
                        offset: 0,
                    })
                }
                (0, _, _) => {
                    // C.MV -> add rd, x0, rs2
                    Ok(Instruction::Op {
                        op: RegRegOp::Add,
                        dest,
                        src1: Specifier::X0,
                        src2: src,
                    })
                }
                (_, 0, 0) => Ok(Instruction::Ebreak),
                (_, _, 0) => {
                    // C.JALR -> jalr x1, rs1, 0
                    Ok(Instruction::Jalr {
                        dest: Specifier::X1,
                        base: dest,
                        offset: 0,
                    })
                }
                (_, _, _) => {
                    // C.ADD -> add rd, rd, rs2
                    Ok(Instruction::Op {
                        op: RegRegOp::Add,
                        dest,
                        src1: dest,
                        src2: src,
                    })
                }
            }
        }
        0b110 => {
            // C.SWSP -> sw rs2, uimm(x2)
            let uimm = (bits(raw, 12, 9) << 2) | (bits(raw, 8, 7) << 6);
            Ok(Instruction::Store {
                width: StoreWidth::Sw,
                src: c_rs2(raw),
                base: Specifier::X2,
                offset: uimm as i32,
            })
        }
        // 001/011/101/111 are the FP stack loads/stores.
        _ => Err(DecodeError::IllegalInstruction),
    }
}

/// Returns the 7-bit *opcode* value of the instruction, or `None` if it isn't
/// supported.
fn opcode(raw_instruction: u32) -> Option<Opcode> {
    #[allow(clippy::unusual_byte_groupings)]
    match raw_instruction & 0x7F {
        0b00_000_11 => Some(Opcode::Load),
        // LoadFp = 0b00_001_11,
        // custom-0
        0b00_011_11 => Some(Opcode::MiscMem),
        0b00_100_11 => Some(Opcode::OpImm),
        0b00_101_11 => Some(Opcode::Auipc),
        // OP-IMM-32
        // 48b
        0b01_000_11 => Some(Opcode::Store),
        // StoreFp = 0b01_001_11,
        // custom-1
        0b01_011_11 => Some(Opcode::Amo),
        0b01_100_11 => Some(Opcode::Op),
        0b01_101_11 => Some(Opcode::Lui),
        // OP-32
        // 64b
        // OpFp = 0b10_100_11,
        // reserved
        // custom-2/rv128
        // 48b
        0b11_000_11 => Some(Opcode::Branch),
        0b11_001_11 => Some(Opcode::Jalr),
        // reserved
        0b11_011_11 => Some(Opcode::Jal),
        0b11_100_11 => Some(Opcode::System),
        // reserved
        // custom-3/rv128
        // >= 80b
        _ => None,
    }
}

/// Returns the 5-bit *rd* value for R-type, I-type, U-type, J-type
/// instructions.
fn rd(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 7) & 0x1F) as u8)
}

/// Returns the 5-bit *rs1* value for R-type, I-type, S-type, B-type
/// instructions.
fn rs1(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 15) & 0x1F) as u8)
}

/// Returns the 5-bit *rs2* value for R-type, S-type, B-type instructions.
fn rs2(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 20) & 0x1F) as u8)
}

/// Returns the 12-bit CSR specifier of Zicsr instructions.
fn csr_specifier(raw_instruction: u32) -> CsrSpecifier {
    (raw_instruction >> 20) as CsrSpecifier
}

fn i_funct(raw_instruction: u32) -> Option<RegImmOp> {
    match funct3(raw_instruction) {
        0b000 => Some(RegImmOp::Addi),
        0b010 => Some(RegImmOp::Slti),
        0b011 => Some(RegImmOp::Sltiu),
        0b100 => Some(RegImmOp::Xori),
        0b110 => Some(RegImmOp::Ori),
        0b111 => Some(RegImmOp::Andi),
        _ => None,
    }
}

fn i_shfunct(raw_instruction: u32) -> Option<RegShiftImmOp> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b001) => Some(RegShiftImmOp::Slli),
        (0b0000000, 0b101) => Some(RegShiftImmOp::Srli),
        (0b0100000, 0b101) => Some(RegShiftImmOp::Srai),
        _ => None,
    }
}

fn i_width(raw_instruction: u32) -> Option<LoadWidth> {
    match funct3(raw_instruction) {
        0b000 => Some(LoadWidth::Lb),
        0b001 => Some(LoadWidth::Lh),
        0b010 => Some(LoadWidth::Lw),
        0b100 => Some(LoadWidth::Lbu),
        0b101 => Some(LoadWidth::Lhu),
        _ => None,
    }
}

fn s_width(raw_instruction: u32) -> Option<StoreWidth> {
    match funct3(raw_instruction) {
        0b000 => Some(StoreWidth::Sb),
        0b001 => Some(StoreWidth::Sh),
        0b010 => Some(StoreWidth::Sw),
        _ => None,
    }
}

fn r_funct(raw_instruction: u32) -> Option<RegRegOp> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b000) => Some(RegRegOp::Add),
        (0b0000000, 0b001) => Some(RegRegOp::Sll),
        (0b0000000, 0b010) => Some(RegRegOp::Slt),
        (0b0000000, 0b011) => Some(RegRegOp::Sltu),
        (0b0000000, 0b100) => Some(RegRegOp::Xor),
        (0b0000000, 0b101) => Some(RegRegOp::Srl),
        (0b0000000, 0b110) => Some(RegRegOp::Or),
        (0b0000000, 0b111) => Some(RegRegOp::And),
        (0b0100000, 0b000) => Some(RegRegOp::Sub),
        (0b0100000, 0b101) => Some(RegRegOp::Sra),
        (0b0000001, 0b000) => Some(RegRegOp::Mul),
        (0b0000001, 0b001) => Some(RegRegOp::Mulh),
        (0b0000001, 0b010) => Some(RegRegOp::Mulhsu),
        (0b0000001, 0b011) => Some(RegRegOp::Mulhu),
        (0b0000001, 0b100) => Some(RegRegOp::Div),
        (0b0000001, 0b101) => Some(RegRegOp::Divu),
        (0b0000001, 0b110) => Some(RegRegOp::Rem),
        (0b0000001, 0b111) => Some(RegRegOp::Remu),
        _ => None,
    }
}

fn b_funct(raw_instruction: u32) -> Option<BranchCondition> {
    match funct3(raw_instruction) {
        0b000 => Some(BranchCondition::Beq),
        0b001 => Some(BranchCondition::Bne),
        0b100 => Some(BranchCondition::Blt),
        0b101 => Some(BranchCondition::Bge),
        0b110 => Some(BranchCondition::Bltu),
        0b111 => Some(BranchCondition::Bgeu),
        _ => None,
    }
}

/// Returns the 3-bit *funct3* value for R-type, I-type, S-type, B-type
/// instructions.
fn funct3(raw_instruction: u32) -> u8 {
    ((raw_instruction >> 12) & 0b111) as u8
}

/// Returns the 7-bit *funct7* value for R-type instructions.
fn funct7(raw_instruction: u32) -> u8 {
    (raw_instruction >> 25) as u8
}

/// Returns the 5-bit *shamt* value for I-type shift instructions.
fn shamt(raw_instruction: u32) -> u32 {
    (raw_instruction >> 20) & 0x1F
}

/// Returns the 12-bit I-immediate sign-extended to 32 bits.
fn i_imm(raw_instruction: u32) -> i32 {
    raw_instruction as i32 >> 20
}

/// Returns the 12-bit S-immediate sign-extended to 32 bits.
fn s_imm(raw_instruction: u32) -> i32 {
    let imm_11_5 = raw_instruction & 0x7F00_0000;
    let imm_4_0 = raw_instruction & 0x0000_0F80;
    (imm_11_5 | (imm_4_0 << 13)) as i32 >> 20
}

/// Returns the 13-bit B-immediate sign-extended to 32 bits.
fn b_imm(raw_instruction: u32) -> i32 {
    let imm_12 = raw_instruction & 0x8000_0000;
    let imm_10_5 = raw_instruction & 0x7E00_0000;
    let imm_4_1 = raw_instruction & 0x0000_0F00;
    let imm_11 = raw_instruction & 0x0000_0080;
    (imm_12 | (imm_11 << 23) | (imm_10_5 >> 1) | (imm_4_1 << 12)) as i32 >> 19
}

/// Returns the signed 32-bit U-immediate.
fn u_imm(raw_instruction: u32) -> i32 {
    (raw_instruction & 0xFFFF_F000) as i32
}

/// Returns the 21-bit J-immediate sign-extended to 32 bits.
fn j_imm(raw_instruction: u32) -> i32 {
    let imm_20 = raw_instruction & 0x8000_0000;
    let imm_10_1 = raw_instruction & 0x7FE0_0000;
    let imm_11 = raw_instruction & 0x0010_0000;
    let imm_19_12 = raw_instruction & 0x000F_F000;
    (imm_20 | (imm_19_12 << 11) | (imm_11 << 2) | (imm_10_1 >> 9)) as i32 >> 11
}

//
// Compressed field helpers.
//

/// Extracts bits `high..=low` of `raw`, shifted down to bit 0.
fn bits(raw: u16, high: u16, low: u16) -> u32 {
    ((raw >> low) as u32) & ((1u32 << (high - low + 1)) - 1)
}

fn sign_extend(value: u32, width: u32) -> i32 {
    let shift = 32 - width;
    (value << shift) as i32 >> shift
}

fn c_funct3(raw: u16) -> u8 {
    ((raw >> 13) & 0b111) as u8
}

/// Full 5-bit rd/rs1 field at bits 11:7.
fn c_rd(raw: u16) -> Specifier {
    Specifier::from_u5(bits(raw, 11, 7) as u8)
}

/// Full 5-bit rs2 field at bits 6:2.
fn c_rs2(raw: u16) -> Specifier {
    Specifier::from_u5(bits(raw, 6, 2) as u8)
}

/// 3-bit rd'/rs2' field at bits 4:2.
fn c_rd_short(raw: u16) -> Specifier {
    Specifier::from_c_u3(bits(raw, 4, 2) as u8)
}

/// 3-bit rs2' field, which shares the position of rd'.
fn c_rs2_short(raw: u16) -> Specifier {
    c_rd_short(raw)
}

/// 3-bit rs1' field at bits 9:7.
fn c_rs1_short(raw: u16) -> Specifier {
    Specifier::from_c_u3(bits(raw, 9, 7) as u8)
}

/// The 6-bit CI-format immediate, sign-extended.
fn c_imm6(raw: u16) -> i32 {
    sign_extend((bits(raw, 12, 12) << 5) | bits(raw, 6, 2), 6)
}

/// The 6-bit shift amount of C.SLLI/C.SRLI/C.SRAI. Shifts of 32 or more
/// (bit 5 set) are reserved on RV32.
fn c_shamt(raw: u16) -> Option<u32> {
    match bits(raw, 12, 12) {
        0 => Some(bits(raw, 6, 2)),
        _ => None,
    }
}

/// Scaled word offset of C.LW/C.SW.
fn c_ls_uimm(raw: u16) -> u32 {
    (bits(raw, 12, 10) << 3) | (bits(raw, 6, 6) << 2) | (bits(raw, 5, 5) << 6)
}

/// The CJ-format jump offset of C.J/C.JAL, sign-extended.
fn c_j_imm(raw: u16) -> i32 {
    let imm = (bits(raw, 12, 12) << 11)
        | (bits(raw, 11, 11) << 4)
        | (bits(raw, 10, 9) << 8)
        | (bits(raw, 8, 8) << 10)
        | (bits(raw, 7, 7) << 6)
        | (bits(raw, 6, 6) << 7)
        | (bits(raw, 5, 3) << 1)
        | (bits(raw, 2, 2) << 5);
    sign_extend(imm, 12)
}

/// The CB-format branch offset of C.BEQZ/C.BNEZ, sign-extended.
fn c_b_imm(raw: u16) -> i32 {
    let imm = (bits(raw, 12, 12) << 8)
        | (bits(raw, 11, 10) << 3)
        | (bits(raw, 6, 5) << 6)
        | (bits(raw, 4, 3) << 1)
        | (bits(raw, 2, 2) << 5);
    sign_extend(imm, 9)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Opcode {
    OpImm,
    Auipc,
    Lui,
    Op,
    Jal,
    Jalr,
    Branch,
    Load,
    Store,
    Amo,
    MiscMem,
    System,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i_imm() {
        assert_eq!(0, i_imm(0x0000_0000));
        assert_eq!(-1, i_imm(0xFFF0_0000));
        assert_eq!(2047, i_imm(2047 << 20));
        assert_eq!(-2048, i_imm(0x8000_0000));
        assert_eq!(-42, i_imm((-42_i32 << 20) as u32));
        // Check other bits are ignored
        assert_eq!(0, i_imm(0x000F_FFFF));
        assert_eq!(-1, i_imm(0xFFF1_2345));
        assert_eq!(1209, i_imm((1209 << 20) | 0x000C_D10A));
    }

    fn x(index: u8) -> Specifier {
        Specifier::from_u5(index)
    }

    #[test]
    fn test_decode_op_imm() {
        // addi x1, x0, 42
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: x(1),
                src: x(0),
                immediate: 42,
            }),
            Instruction::decode(0x02A0_0093)
        );
        // xori x5, x6, -1
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Xori,
                dest: x(5),
                src: x(6),
                immediate: -1,
            }),
            Instruction::decode(0xFFF3_4293)
        );
        // slti x3, x4, 7
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Slti,
                dest: x(3),
                src: x(4),
                immediate: 7,
            }),
            Instruction::decode(0x0072_2193)
        );
        // slli x10, x11, 3
        assert_eq!(
            Ok(Instruction::OpShiftImm {
                op: RegShiftImmOp::Slli,
                dest: x(10),
                src: x(11),
                shift_amount_u5: 3,
            }),
            Instruction::decode(0x0035_9513)
        );
        // srai x10, x11, 3
        assert_eq!(
            Ok(Instruction::OpShiftImm {
                op: RegShiftImmOp::Srai,
                dest: x(10),
                src: x(11),
                shift_amount_u5: 3,
            }),
            Instruction::decode(0x4035_D513)
        );
    }

    #[test]
    fn test_decode_op() {
        // add x3, x1, x2
        assert_eq!(
            Ok(Instruction::Op {
                op: RegRegOp::Add,
                dest: x(3),
                src1: x(1),
                src2: x(2),
            }),
            Instruction::decode(0x0020_81B3)
        );
        // sub x3, x1, x2
        assert_eq!(
            Ok(Instruction::Op {
                op: RegRegOp::Sub,
                dest: x(3),
                src1: x(1),
                src2: x(2),
            }),
            Instruction::decode(0x4020_81B3)
        );
        // mul x3, x1, x2
        assert_eq!(
            Ok(Instruction::Op {
                op: RegRegOp::Mul,
                dest: x(3),
                src1: x(1),
                src2: x(2),
            }),
            Instruction::decode(0x0220_81B3)
        );
        // divu x3, x1, x2
        assert_eq!(
            Ok(Instruction::Op {
                op: RegRegOp::Divu,
                dest: x(3),
                src1: x(1),
                src2: x(2),
            }),
            Instruction::decode(0x0220_D1B3)
        );
        // funct7 with an undefined bit set
        assert_eq!(
            Err(DecodeError::IllegalInstruction),
            Instruction::decode(0x1020_81B3)
        );
    }

    #[test]
    fn test_decode_loads_stores() {
        // lw x3, 8(x1)
        assert_eq!(
            Ok(Instruction::Load {
                width: LoadWidth::Lw,
                dest: x(3),
                base: x(1),
                offset: 8,
            }),
            Instruction::decode(0x0080_A183)
        );
        // lbu x3, -1(x1)
        assert_eq!(
            Ok(Instruction::Load {
                width: LoadWidth::Lbu,
                dest: x(3),
                base: x(1),
                offset: -1,
            }),
            Instruction::decode(0xFFF0_C183)
        );
        // sw x2, 0(x1)
        assert_eq!(
            Ok(Instruction::Store {
                width: StoreWidth::Sw,
                src: x(2),
                base: x(1),
                offset: 0,
            }),
            Instruction::decode(0x0020_A023)
        );
        // sh x2, -4(x1)
        assert_eq!(
            Ok(Instruction::Store {
                width: StoreWidth::Sh,
                src: x(2),
                base: x(1),
                offset: -4,
            }),
            Instruction::decode(0xFE20_9E23)
        );
    }

    #[test]
    fn test_decode_control_transfer() {
        // jal x1, 2048
        assert_eq!(
            Ok(Instruction::Jal {
                dest: x(1),
                offset: 2048,
            }),
            Instruction::decode(0x0010_00EF)
        );
        // jalr x0, 0(x1)
        assert_eq!(
            Ok(Instruction::Jalr {
                dest: x(0),
                base: x(1),
                offset: 0,
            }),
            Instruction::decode(0x0000_8067)
        );
        // beq x1, x2, -4
        assert_eq!(
            Ok(Instruction::Branch {
                condition: BranchCondition::Beq,
                src1: x(1),
                src2: x(2),
                offset: -4,
            }),
            Instruction::decode(0xFE20_8EE3)
        );
        // bltu x1, x2, 8
        assert_eq!(
            Ok(Instruction::Branch {
                condition: BranchCondition::Bltu,
                src1: x(1),
                src2: x(2),
                offset: 8,
            }),
            Instruction::decode(0x0020_E463)
        );
    }

    #[test]
    fn test_decode_upper_immediates() {
        // lui x5, 0x12345
        assert_eq!(
            Ok(Instruction::Lui {
                dest: x(5),
                immediate: 0x1234_5000,
            }),
            Instruction::decode(0x1234_52B7)
        );
        // auipc x5, 0x12345
        assert_eq!(
            Ok(Instruction::Auipc {
                dest: x(5),
                immediate: 0x1234_5000,
            }),
            Instruction::decode(0x1234_5297)
        );
    }

    #[test]
    fn test_decode_system() {
        assert_eq!(Ok(Instruction::Ecall), Instruction::decode(0x0000_0073));
        assert_eq!(Ok(Instruction::Ebreak), Instruction::decode(0x0010_0073));
        assert_eq!(Ok(Instruction::Mret), Instruction::decode(0x3020_0073));
        assert_eq!(Ok(Instruction::Sret), Instruction::decode(0x1020_0073));
        assert_eq!(Ok(Instruction::Uret), Instruction::decode(0x0020_0073));
        assert_eq!(Ok(Instruction::Wfi), Instruction::decode(0x1050_0073));
        // sfence.vma x1, x2
        assert_eq!(
            Ok(Instruction::SfenceVma {
                vaddr: x(1),
                asid: x(2),
            }),
            Instruction::decode(0x1220_8073)
        );
        // csrrw x5, mscratch, x6
        assert_eq!(
            Ok(Instruction::Csr {
                op: CsrOp::ReadWrite,
                dest: x(5),
                csr: 0x340,
                src: x(6),
            }),
            Instruction::decode(0x3403_12F3)
        );
        // csrrsi x5, mstatus, 8
        assert_eq!(
            Ok(Instruction::Csri {
                op: CsrOp::ReadSet,
                dest: x(5),
                csr: 0x300,
                immediate: 8,
            }),
            Instruction::decode(0x3004_62F3)
        );
    }

    #[test]
    fn test_decode_amo() {
        // lr.w x3, (x1)
        assert_eq!(
            Ok(Instruction::LoadReserved {
                dest: x(3),
                addr: x(1),
            }),
            Instruction::decode(0x1000_A1AF)
        );
        // sc.w x3, x2, (x1)
        assert_eq!(
            Ok(Instruction::StoreConditional {
                dest: x(3),
                addr: x(1),
                src: x(2),
            }),
            Instruction::decode(0x1820_A1AF)
        );
        // amoadd.w x3, x2, (x1)
        assert_eq!(
            Ok(Instruction::Amo {
                op: AmoOp::Add,
                dest: x(3),
                addr: x(1),
                src: x(2),
            }),
            Instruction::decode(0x0020_A1AF)
        );
        // amoswap.w.aq.rl x3, x2, (x1): ordering bits are accepted
        assert_eq!(
            Ok(Instruction::Amo {
                op: AmoOp::Swap,
                dest: x(3),
                addr: x(1),
                src: x(2),
            }),
            Instruction::decode(0x0E20_A1AF)
        );
        // amomaxu.w x3, x2, (x1)
        assert_eq!(
            Ok(Instruction::Amo {
                op: AmoOp::Maxu,
                dest: x(3),
                addr: x(1),
                src: x(2),
            }),
            Instruction::decode(0xE220_A1AF)
        );
        // lr.w with rs2 != 0 is not a valid encoding
        assert_eq!(
            Err(DecodeError::IllegalInstruction),
            Instruction::decode(0x1020_A1AF)
        );
    }

    #[test]
    fn test_decode_fence() {
        // fence rw, rw
        assert_eq!(
            Ok(Instruction::Fence {
                predecessor: FenceOrderCombination {
                    device_input: false,
                    device_output: false,
                    memory_reads: true,
                    memory_writes: true,
                },
                successor: FenceOrderCombination {
                    device_input: false,
                    device_output: false,
                    memory_reads: true,
                    memory_writes: true,
                },
            }),
            Instruction::decode(0x0330_000F)
        );
        // fence.i
        assert_eq!(Ok(Instruction::FenceI), Instruction::decode(0x0000_100F));
    }

    #[test]
    fn test_decode_compressed_quadrant0() {
        // All-zero is defined illegal.
        assert_eq!(
            Err(DecodeError::IllegalInstruction),
            Instruction::decode_compressed(0x0000)
        );
        // c.addi4spn x8, sp, 16
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: x(8),
                src: x(2),
                immediate: 16,
            }),
            Instruction::decode_compressed(0x0800)
        );
        // c.lw x9, 4(x10)
        assert_eq!(
            Ok(Instruction::Load {
                width: LoadWidth::Lw,
                dest: x(9),
                base: x(10),
                offset: 4,
            }),
            Instruction::decode_compressed(0x4144)
        );
        // c.sw x9, 4(x10)
        assert_eq!(
            Ok(Instruction::Store {
                width: StoreWidth::Sw,
                src: x(9),
                base: x(10),
                offset: 4,
            }),
            Instruction::decode_compressed(0xC144)
        );
        // c.fld is not supported without the D extension
        assert_eq!(
            Err(DecodeError::IllegalInstruction),
            Instruction::decode_compressed(0x2144)
        );
    }

    #[test]
    fn test_decode_compressed_quadrant1() {
        // c.nop
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: x(0),
                src: x(0),
                immediate: 0,
            }),
            Instruction::decode_compressed(0x0001)
        );
        // c.addi x10, -1
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: x(10),
                src: x(10),
                immediate: -1,
            }),
            Instruction::decode_compressed(0x157D)
        );
        // c.li x5, 7
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: x(5),
                src: x(0),
                immediate: 7,
            }),
            Instruction::decode_compressed(0x429D)
        );
        // c.lui x5, 1
        assert_eq!(
            Ok(Instruction::Lui {
                dest: x(5),
                immediate: 0x1000,
            }),
            Instruction::decode_compressed(0x6285)
        );
        // c.addi16sp 32
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: x(2),
                src: x(2),
                immediate: 32,
            }),
            Instruction::decode_compressed(0x6105)
        );
        // c.srli x8, 2
        assert_eq!(
            Ok(Instruction::OpShiftImm {
                op: RegShiftImmOp::Srli,
                dest: x(8),
                src: x(8),
                shift_amount_u5: 2,
            }),
            Instruction::decode_compressed(0x8009)
        );
        // c.andi x8, 5
        assert_eq!(
            Ok(Instruction::OpImm {
                op: RegImmOp::Andi,
                dest: x(8),
                src: x(8),
                immediate: 5,
            }),
            Instruction::decode_compressed(0x8815)
        );
        // c.sub x8, x9
        assert_eq!(
            Ok(Instruction::Op {
                op: RegRegOp::Sub,
                dest: x(8),
                src1: x(8),
                src2: x(9),
            }),
            Instruction::decode_compressed(0x8C05)
        );
        // c.xor x8, x9
        assert_eq!(
            Ok(Instruction::Op {
                op: RegRegOp::Xor,
                dest: x(8),
                src1: x(8),
                src2: x(9),
            }),
            Instruction::decode_compressed(0x8C25)
        );
        // c.j 16
        assert_eq!(
            Ok(Instruction::Jal {
                dest: x(0),
                offset: 16,
            }),
            Instruction::decode_compressed(0xA801)
        );
        // c.jal -2
        assert_eq!(
            Ok(Instruction::Jal {
                dest: x(1),
                offset: -2,
            }),
            Instruction::decode_compressed(0x3FFD)
        );
        // c.beqz x8, 8
        assert_eq!(
            Ok(Instruction::Branch {
                condition: BranchCondition::Beq,
                src1: x(8),
                src2: x(0),
                offset: 8,
            }),
            Instruction::decode_compressed(0xC401)
        );
        // c.bnez x8, -2
        assert_eq!(
            Ok(Instruction::Branch {
                condition: BranchCondition::Bne,
                src1: x(8),
                src2: x(0),
                offset: -2,
            }),
            Instruction::decode_compressed(0xFC7D)
        );
    }

    #[test]
    fn test_decode_compressed_quadrant2() {
        // c.slli x5, 1
        assert_eq!(
            Ok(Instruction::OpShiftImm {
                op: RegShiftImmOp::Slli,
                dest: x(5),
                src: x(5),
                shift_amount_u5: 1,
            }),
            Instruction::decode_compressed(0x0286)
        );
        // c.lwsp x5, 8(sp)
        assert_eq!(
            Ok(Instruction::Load {
                width: LoadWidth::Lw,
                dest: x(5),
                base: x(2),
                offset: 8,
            }),
            Instruction::decode_compressed(0x42A2)
        );
        // c.lwsp with rd == x0 is reserved
        assert_eq!(
            Err(DecodeError::IllegalInstruction),
            Instruction::decode_compressed(0x4022)
        );
        // c.swsp x5, 8(sp)
        assert_eq!(
            Ok(Instruction::Store {
                width: StoreWidth::Sw,
                src: x(5),
                base: x(2),
                offset: 8,
            }),
            Instruction::decode_compressed(0xC416)
        );
        // c.mv x5, x6
        assert_eq!(
            Ok(Instruction::Op {
                op: RegRegOp::Add,
                dest: x(5),
                src1: x(0),
                src2: x(6),
            }),
            Instruction::decode_compressed(0x829A)
        );
        // c.add x5, x5
        assert_eq!(
            Ok(Instruction::Op {
                op: RegRegOp::Add,
                dest: x(5),
                src1: x(5),
                src2: x(5),
            }),
            Instruction::decode_compressed(0x9296)
        );
        // c.jr x1
        assert_eq!(
            Ok(Instruction::Jalr {
                dest: x(0),
                base: x(1),
                offset: 0,
            }),
            Instruction::decode_compressed(0x8082)
        );
        // c.jalr x1
        assert_eq!(
            Ok(Instruction::Jalr {
                dest: x(1),
                base: x(1),
                offset: 0,
            }),
            Instruction::decode_compressed(0x9082)
        );
        // c.ebreak
        assert_eq!(
            Ok(Instruction::Ebreak),
            Instruction::decode_compressed(0x9002)
        );
    }
}
