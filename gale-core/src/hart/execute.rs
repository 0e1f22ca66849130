use super::{CsrSpecifier, Exception, ExecutionResult, Hart};
use crate::instruction::{
    AmoOp, BranchCondition, CsrOp, Instruction, LoadWidth, RegImmOp, RegRegOp, RegShiftImmOp,
    StoreWidth,
};
use crate::registers::Specifier;
use crate::PrivilegeLevel;

/// Executes a single decoded instruction against a hart.
///
/// `raw` holds the instruction's encoding (for xtval on illegal-instruction
/// traps) and `length` its size in bytes (2 for expanded compressed forms),
/// which is what the PC advances by.
#[derive(Debug)]
pub(super) struct Executor<'h> {
    pub hart: &'h mut Hart,
    pub raw: u32,
    pub length: u32,
}

impl Executor<'_> {
    pub fn execute(&mut self, instruction: Instruction) -> ExecutionResult {
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let op = match op {
                    RegImmOp::Addi => Self::addi,
                    RegImmOp::Slti => Self::slti,
                    RegImmOp::Sltiu => Self::sltiu,
                    RegImmOp::Xori => Self::xori,
                    RegImmOp::Ori => Self::ori,
                    RegImmOp::Andi => Self::andi,
                };
                op(self, dest, src, immediate)
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let op = match op {
                    RegShiftImmOp::Slli => Self::slli,
                    RegShiftImmOp::Srli => Self::srli,
                    RegShiftImmOp::Srai => Self::srai,
                };
                op(self, dest, src, shift_amount_u5)
            }
            Instruction::Auipc { dest, immediate } => self.auipc(dest, immediate),
            Instruction::Lui { dest, immediate } => self.lui(dest, immediate),
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let op = match op {
                    RegRegOp::Add => Self::add,
                    RegRegOp::Slt => Self::slt,
                    RegRegOp::Sltu => Self::sltu,
                    RegRegOp::And => Self::and,
                    RegRegOp::Or => Self::or,
                    RegRegOp::Xor => Self::xor,
                    RegRegOp::Sll => Self::sll,
                    RegRegOp::Srl => Self::srl,
                    RegRegOp::Sub => Self::sub,
                    RegRegOp::Sra => Self::sra,
                    RegRegOp::Mul => Self::mul,
                    RegRegOp::Mulh => Self::mulh,
                    RegRegOp::Mulhsu => Self::mulhsu,
                    RegRegOp::Mulhu => Self::mulhu,
                    RegRegOp::Div => Self::div,
                    RegRegOp::Divu => Self::divu,
                    RegRegOp::Rem => Self::rem,
                    RegRegOp::Remu => Self::remu,
                };
                op(self, dest, src1, src2)
            }
            Instruction::Jal { dest, offset } => self.jal(dest, offset),
            Instruction::Jalr { dest, base, offset } => self.jalr(dest, base, offset),
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let op = match condition {
                    BranchCondition::Beq => Self::beq,
                    BranchCondition::Bne => Self::bne,
                    BranchCondition::Blt => Self::blt,
                    BranchCondition::Bltu => Self::bltu,
                    BranchCondition::Bge => Self::bge,
                    BranchCondition::Bgeu => Self::bgeu,
                };
                op(self, src1, src2, offset)
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let op = match width {
                    LoadWidth::Lb => Self::lb,
                    LoadWidth::Lh => Self::lh,
                    LoadWidth::Lw => Self::lw,
                    LoadWidth::Lbu => Self::lbu,
                    LoadWidth::Lhu => Self::lhu,
                };
                op(self, dest, base, offset)
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                let op = match width {
                    StoreWidth::Sb => Self::sb,
                    StoreWidth::Sh => Self::sh,
                    StoreWidth::Sw => Self::sw,
                };
                op(self, src, base, offset)
            }
            Instruction::LoadReserved { dest, addr } => self.lr_w(dest, addr),
            Instruction::StoreConditional { dest, addr, src } => self.sc_w(dest, addr, src),
            Instruction::Amo {
                op,
                dest,
                addr,
                src,
            } => self.amo_w(op, dest, addr, src),
            Instruction::Fence { .. } => self.fence(),
            Instruction::FenceI => self.fence(),
            Instruction::Ecall => self.ecall(),
            Instruction::Ebreak => self.ebreak(),
            Instruction::Csr { op, dest, csr, src } => self.csr_reg_op(op, dest, csr, src),
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => self.csr_imm_op(op, dest, csr, immediate),
            Instruction::Mret => self.xret(PrivilegeLevel::Machine),
            Instruction::Sret => self.xret(PrivilegeLevel::Supervisor),
            Instruction::Uret => self.xret(PrivilegeLevel::User),
            Instruction::Wfi => unreachable!("WFI is handled by the run loop"),
            Instruction::SfenceVma { .. } => self.sfence_vma(),
        }
    }

    /// Executes an `addi` instruction.
    ///
    /// > ADDI adds the sign-extended 12-bit immediate to register rs1.
    /// > Arithmetic overflow is ignored and the result is simply the low
    /// > XLEN bits of the result.
    fn addi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s.wrapping_add_signed(imm))
    }

    /// Executes a `slti` instruction.
    ///
    /// > SLTI (set less than immediate) places the value 1 in register rd if
    /// > register rs1 is less than the sign-extended immediate when both are
    /// > treated as signed numbers, else 0 is written to rd.
    fn slti(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| ((s as i32) < imm) as u32)
    }

    /// Executes a `sltiu` instruction (unsigned compare against the
    /// sign-extended immediate).
    fn sltiu(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| (s < (imm as u32)) as u32)
    }

    fn xori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s ^ (imm as u32))
    }

    fn ori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s | (imm as u32))
    }

    fn andi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s & (imm as u32))
    }

    fn slli(&mut self, dest: Specifier, src: Specifier, shamt: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shamt, |s, shamt| s << shamt)
    }

    fn srli(&mut self, dest: Specifier, src: Specifier, shamt: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shamt, |s, shamt| s >> shamt)
    }

    fn srai(&mut self, dest: Specifier, src: Specifier, shamt: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shamt, |s, shamt| ((s as i32) >> shamt) as u32)
    }

    /// Executes a `lui` instruction.
    ///
    /// > LUI (load upper immediate) is used to build 32-bit constants and
    /// > uses the U-type format. LUI places the U-immediate value in the top
    /// > 20 bits of the destination register rd, filling in the lowest 12
    /// > bits with zeros.
    fn lui(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        let result = immediate as u32 & !0xFFF;
        self.hart.registers.set_x(dest, result);
        self.increment_pc();
        Ok(())
    }

    /// Executes an `auipc` instruction.
    ///
    /// > AUIPC (add upper immediate to pc) is used to build pc-relative
    /// > addresses and uses the U-type format. AUIPC forms a 32-bit offset
    /// > from the 20-bit U-immediate, filling in the lowest 12 bits with
    /// > zeros, adds this offset to the address of the AUIPC instruction,
    /// > then places the result in register rd.
    fn auipc(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        let registers = &mut self.hart.registers;
        let result = registers.pc().wrapping_add_signed(immediate & !0xFFF);
        registers.set_x(dest, result);
        self.increment_pc();
        Ok(())
    }

    fn add(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_add(s2))
    }

    fn sub(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_sub(s2))
    }

    fn slt(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) < (s2 as i32)) as u32
        })
    }

    fn sltu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| (s1 < s2) as u32)
    }

    fn and(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 & s2)
    }

    fn or(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 | s2)
    }

    fn xor(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 ^ s2)
    }

    /// Shifts take their amount from the lower 5 bits of rs2.
    fn sll(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 << (s2 & 0x1F))
    }

    fn srl(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 >> (s2 & 0x1F))
    }

    fn sra(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) >> (s2 & 0x1F)) as u32
        })
    }

    /// Executes a `mul` instruction.
    ///
    /// > MUL performs an XLEN-bit × XLEN-bit multiplication of rs1 by rs2
    /// > and places the lower XLEN bits in the destination register.
    fn mul(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_mul(s2))
    }

    fn mulh(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32 as i64).wrapping_mul(s2 as i32 as i64) >> 32) as u32
        })
    }

    fn mulhsu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32 as i64).wrapping_mul(s2 as i64) >> 32) as u32
        })
    }

    fn mulhu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as u64 * s2 as u64) >> 32) as u32
        })
    }

    /// Executes a `div` instruction.
    ///
    /// > The quotient of division by zero has all bits set. Signed division
    /// > overflow (the most negative integer divided by −1) wraps to the
    /// > dividend.
    fn div(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            let (s1, s2) = (s1 as i32, s2 as i32);
            match s2 {
                0 => u32::MAX,
                _ => s1.wrapping_div(s2) as u32,
            }
        })
    }

    fn divu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 {
            0 => u32::MAX,
            _ => s1 / s2,
        })
    }

    /// The remainder of division by zero equals the dividend; signed
    /// overflow yields zero.
    fn rem(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            let (s1, s2) = (s1 as i32, s2 as i32);
            match s2 {
                0 => s1 as u32,
                _ => s1.wrapping_rem(s2) as u32,
            }
        })
    }

    fn remu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 {
            0 => s1,
            _ => s1 % s2,
        })
    }

    /// Executes a `jal` instruction.
    ///
    /// > The jump and link (JAL) instruction [...] The offset is sign-
    /// > extended and added to the address of the jump instruction to form
    /// > the jump target address. [...] JAL stores the address of the
    /// > instruction following the jump in register rd.
    fn jal(&mut self, dest: Specifier, offset: i32) -> ExecutionResult {
        let length = self.length;
        self.jump_op(dest, length, |registers| {
            registers.pc().wrapping_add_signed(offset)
        })
    }

    /// Executes a `jalr` instruction.
    ///
    /// > The target address is obtained by adding the sign-extended 12-bit
    /// > I-immediate to the register rs1, then setting the least-significant
    /// > bit of the result to zero.
    fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        let length = self.length;
        self.jump_op(dest, length, |registers| {
            registers.x(base).wrapping_add_signed(offset) & !0b1
        })
    }

    fn beq(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 == s2)
    }

    fn bne(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 != s2)
    }

    fn blt(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i32) < (s2 as i32))
    }

    fn bltu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 < s2)
    }

    fn bge(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i32) >= (s2 as i32))
    }

    fn bgeu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 >= s2)
    }

    fn lb(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.read_byte(address).map(|value| value as i8 as u32)
        })
    }

    fn lh(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.read_halfword(address).map(|value| value as i16 as u32)
        })
    }

    fn lw(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, Hart::read_word)
    }

    fn lbu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.read_byte(address).map(u32::from)
        })
    }

    fn lhu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.read_halfword(address).map(u32::from)
        })
    }

    fn sb(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |hart, address, value| {
            hart.write_byte(address, value as u8)
        })
    }

    fn sh(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |hart, address, value| {
            hart.write_halfword(address, value as u16)
        })
    }

    fn sw(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, Hart::write_word)
    }

    fn lr_w(&mut self, dest: Specifier, addr: Specifier) -> ExecutionResult {
        let address = self.hart.registers.x(addr);
        let value = self.hart.load_reserved(address)?;
        self.hart.registers.set_x(dest, value);
        self.increment_pc();
        Ok(())
    }

    fn sc_w(&mut self, dest: Specifier, addr: Specifier, src: Specifier) -> ExecutionResult {
        let address = self.hart.registers.x(addr);
        let value = self.hart.registers.x(src);
        let result = self.hart.store_conditional(address, value)?;
        self.hart.registers.set_x(dest, result);
        self.increment_pc();
        Ok(())
    }

    /// Executes one of the AMO*.W instructions.
    ///
    /// > These AMO instructions atomically load a data value from the
    /// > address in rs1, place the value into register rd, apply a binary
    /// > operator to the loaded value and the original value in rs2, then
    /// > store the result back to the original address in rs1.
    fn amo_w(
        &mut self,
        op: AmoOp,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    ) -> ExecutionResult {
        let address = self.hart.registers.x(addr);
        let operand = self.hart.registers.x(src);
        let old = self.hart.amo_word(address, |value| match op {
            AmoOp::Swap => operand,
            AmoOp::Add => value.wrapping_add(operand),
            AmoOp::Xor => value ^ operand,
            AmoOp::And => value & operand,
            AmoOp::Or => value | operand,
            AmoOp::Min => (value as i32).min(operand as i32) as u32,
            AmoOp::Max => (value as i32).max(operand as i32) as u32,
            AmoOp::Minu => value.min(operand),
            AmoOp::Maxu => value.max(operand),
        })?;
        self.hart.registers.set_x(dest, old);
        self.increment_pc();
        Ok(())
    }

    /// FENCE and FENCE.I order nothing here: every access in this
    /// implementation is already sequentially consistent, and there is no
    /// instruction cache to synchronize.
    fn fence(&mut self) -> ExecutionResult {
        self.increment_pc();
        Ok(())
    }

    fn ecall(&mut self) -> ExecutionResult {
        Err(match self.hart.privilege_mode {
            PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
            PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
            PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
        })
    }

    fn ebreak(&mut self) -> ExecutionResult {
        Err(Exception::Breakpoint(self.hart.registers.pc()))
    }

    /// MRET/SRET/URET. Using a return instruction of a mode above the
    /// current one is an illegal instruction.
    fn xret(&mut self, mode: PrivilegeLevel) -> ExecutionResult {
        if self.hart.privilege_mode < mode {
            return Err(Exception::IllegalInstruction(self.raw));
        }
        self.hart.xret(mode);
        Ok(())
    }

    /// SFENCE.VMA flushes the TLB wholesale; the optional vaddr/asid
    /// arguments narrow nothing here. Other harts sharing the page tables
    /// are asked to flush as well.
    fn sfence_vma(&mut self) -> ExecutionResult {
        if self.hart.privilege_mode < PrivilegeLevel::Supervisor {
            return Err(Exception::IllegalInstruction(self.raw));
        }
        self.hart.flush_tlb();
        self.hart.broadcast_tlb_flush();
        self.increment_pc();
        Ok(())
    }

    fn csr_reg_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src: Specifier,
    ) -> ExecutionResult {
        let src_value = (op == CsrOp::ReadWrite || src != Specifier::X0)
            .then(|| self.hart.registers.x(src));
        self.csr_op(op, dest, csr, src_value)
    }

    fn csr_imm_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    ) -> ExecutionResult {
        self.csr_op(
            op,
            dest,
            csr,
            (op == CsrOp::ReadWrite || immediate != 0).then_some(immediate),
        )
    }

    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src_value: Option<u32>,
    ) -> ExecutionResult {
        let privilege_level = self.hart.privilege_mode;
        if op != CsrOp::ReadWrite || dest != Specifier::X0 {
            let old_value = self
                .hart
                .read_csr(csr, privilege_level)
                .map_err(|_| Exception::IllegalInstruction(self.raw))?;
            self.hart.registers.set_x(dest, old_value);
        };
        if let Some(src_value) = src_value {
            let (value, mask) = match op {
                CsrOp::ReadWrite => (src_value, 0xFFFF_FFFF),
                CsrOp::ReadSet => (0xFFFF_FFFF, src_value),
                CsrOp::ReadClear => (0x0000_0000, src_value),
            };
            self.hart
                .write_csr(csr, privilege_level, value, mask)
                .map_err(|_| Exception::IllegalInstruction(self.raw))?;
        }
        self.increment_pc();
        Ok(())
    }

    fn reg_imm_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, i32) -> u32,
    {
        let registers = &mut self.hart.registers;
        registers.set_x(dest, op(registers.x(src), immediate));
        self.increment_pc();
        Ok(())
    }

    fn reg_shamt_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        if shift_amount_u5 > 31 {
            panic!("out of range u5 used");
        }
        let registers = &mut self.hart.registers;
        registers.set_x(dest, op(registers.x(src), shift_amount_u5));
        self.increment_pc();
        Ok(())
    }

    fn reg_reg_op<F>(
        &mut self,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        let registers = &mut self.hart.registers;
        registers.set_x(dest, op(registers.x(src1), registers.x(src2)));
        self.increment_pc();
        Ok(())
    }

    fn jump_op<F>(&mut self, dest: Specifier, length: u32, compute_target: F) -> ExecutionResult
    where
        F: FnOnce(&crate::registers::Registers) -> u32,
    {
        let registers = &mut self.hart.registers;
        let new_pc = compute_target(registers);
        // IALIGN=16 with the C extension: only odd targets are misaligned.
        if new_pc & 1 != 0 {
            return Err(Exception::InstructionAddressMisaligned(new_pc));
        }
        let old_pc = std::mem::replace(registers.pc_mut(), new_pc);
        registers.set_x(dest, old_pc.wrapping_add(length));
        Ok(())
    }

    // Takes the branch if `predicate` returns `true`.
    fn cond_branch<P>(
        &mut self,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
        predicate: P,
    ) -> ExecutionResult
    where
        P: FnOnce(u32, u32) -> bool,
    {
        let registers = &mut self.hart.registers;
        if predicate(registers.x(src1), registers.x(src2)) {
            let new_pc = registers.pc().wrapping_add_signed(offset);
            if new_pc & 1 != 0 {
                return Err(Exception::InstructionAddressMisaligned(new_pc));
            }
            *registers.pc_mut() = new_pc;
        } else {
            self.increment_pc();
        }
        Ok(())
    }

    fn load_op<F>(&mut self, dest: Specifier, base: Specifier, offset: i32, op: F) -> ExecutionResult
    where
        F: FnOnce(&mut Hart, u32) -> Result<u32, Exception>,
    {
        let address = self.hart.registers.x(base).wrapping_add_signed(offset);
        let value = op(self.hart, address)?;
        self.hart.registers.set_x(dest, value);
        self.increment_pc();
        Ok(())
    }

    fn store_op<F>(&mut self, src: Specifier, base: Specifier, offset: i32, op: F) -> ExecutionResult
    where
        F: FnOnce(&mut Hart, u32, u32) -> Result<(), Exception>,
    {
        let value = self.hart.registers.x(src);
        let address = self.hart.registers.x(base).wrapping_add_signed(offset);
        op(self.hart, address, value)?;
        self.increment_pc();
        Ok(())
    }

    fn increment_pc(&mut self) {
        let pc = self.hart.registers.pc_mut();
        *pc = pc.wrapping_add(self.length);
    }
}
