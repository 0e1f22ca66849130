//! Trap and interrupt delivery: delegation, privilege stacking, xRET, and
//! the trap-vector jump.

use super::control::{Counteren, Tvec, VectorMode};
use super::{Exception, Hart, INTERRUPT_BIT};
use crate::{PrivilegeLevel, RawPrivilegeLevel};
use log::trace;

/// The trap-handling CSR state, kept as privilege-indexed 4-slot arrays so
/// the delegation scan can walk levels numerically. The reserved
/// (hypervisor) delegation slots are preset to all-ones, which makes the
/// scan skip level 2 entirely.
#[derive(Debug, Clone)]
pub(super) struct TrapRegs {
    tvec: [Tvec; 4],
    counteren: [Counteren; 4],
    scratch: [u32; 4],
    epc: [u32; 4],
    cause: [u32; 4],
    tval: [u32; 4],
    edeleg: [u32; 4],
    ideleg: [u32; 4],
}

/// Exceptions that medeleg can delegate: every standard cause code.
#[allow(clippy::identity_op)]
const DELEGATABLE_EXCEPTIONS: u32 = 0
    | (1 << 0) // instruction address misaligned
    | (1 << 1) // instruction access fault
    | (1 << 2) // illegal instruction
    | (1 << 3) // breakpoint
    | (1 << 4) // load address misaligned
    | (1 << 5) // load access fault
    | (1 << 6) // store/AMO address misaligned
    | (1 << 7) // store/AMO access fault
    | (1 << 8) // environment call from U-mode
    | (1 << 9) // environment call from S-mode
    | (1 << 11) // environment call from M-mode
    | (1 << 12) // instruction page fault
    | (1 << 13) // load page fault
    | (1 << 15); // store/AMO page fault

/// Interrupts that mideleg can delegate: the supervisor-level sources.
#[allow(clippy::identity_op)]
const DELEGATABLE_INTERRUPTS: u32 = 0
    | (1 << 1) // supervisor software interrupt
    | (1 << 5) // supervisor timer interrupt
    | (1 << 9); // supervisor external interrupt

impl TrapRegs {
    pub fn new() -> Self {
        let mut regs = Self {
            tvec: Default::default(),
            counteren: Default::default(),
            scratch: [0; 4],
            epc: [0; 4],
            cause: [0; 4],
            tval: [0; 4],
            edeleg: [0; 4],
            ideleg: [0; 4],
        };
        // Level 2 is never entered; delegating everything past it keeps the
        // delegation scan from stopping there.
        regs.edeleg[RawPrivilegeLevel::Reserved as usize] = 0xFFFF_FFFF;
        regs.ideleg[RawPrivilegeLevel::Reserved as usize] = 0xFFFF_FFFF;
        regs
    }

    pub fn tvec(&self, mode: PrivilegeLevel) -> &Tvec {
        &self.tvec[mode as usize]
    }

    pub fn tvec_mut(&mut self, mode: PrivilegeLevel) -> &mut Tvec {
        &mut self.tvec[mode as usize]
    }

    pub fn counteren(&self, mode: PrivilegeLevel) -> &Counteren {
        &self.counteren[mode as usize]
    }

    pub fn counteren_mut(&mut self, mode: PrivilegeLevel) -> &mut Counteren {
        &mut self.counteren[mode as usize]
    }

    pub fn scratch(&self, mode: PrivilegeLevel) -> u32 {
        self.scratch[mode as usize]
    }

    pub fn write_scratch(&mut self, mode: PrivilegeLevel, value: u32, mask: u32) {
        let slot = &mut self.scratch[mode as usize];
        *slot = *slot & !mask | value & mask;
    }

    pub fn epc(&self, mode: PrivilegeLevel) -> u32 {
        self.epc[mode as usize]
    }

    pub fn write_epc(&mut self, mode: PrivilegeLevel, value: u32, mask: u32) {
        let slot = &mut self.epc[mode as usize];
        *slot = (*slot & !mask | value & mask) & !0b1;
    }

    pub fn cause(&self, mode: PrivilegeLevel) -> u32 {
        self.cause[mode as usize]
    }

    pub fn write_cause(&mut self, mode: PrivilegeLevel, value: u32, mask: u32) {
        let slot = &mut self.cause[mode as usize];
        *slot = *slot & !mask | value & mask;
    }

    pub fn tval(&self, mode: PrivilegeLevel) -> u32 {
        self.tval[mode as usize]
    }

    pub fn write_tval(&mut self, mode: PrivilegeLevel, value: u32, mask: u32) {
        let slot = &mut self.tval[mode as usize];
        *slot = *slot & !mask | value & mask;
    }

    pub fn edeleg(&self, mode: PrivilegeLevel) -> u32 {
        self.edeleg[mode as usize]
    }

    /// The medeleg register is **WARL**.
    pub fn write_edeleg(&mut self, mode: PrivilegeLevel, value: u32, mask: u32) {
        let slot = &mut self.edeleg[mode as usize];
        *slot = *slot & !mask | value & mask & DELEGATABLE_EXCEPTIONS;
    }

    pub fn ideleg(&self, mode: PrivilegeLevel) -> u32 {
        self.ideleg[mode as usize]
    }

    /// The mideleg register is **WARL**.
    pub fn write_ideleg(&mut self, mode: PrivilegeLevel, value: u32, mask: u32) {
        let slot = &mut self.ideleg[mode as usize];
        *slot = *slot & !mask | value & mask & DELEGATABLE_INTERRUPTS;
    }

    /// Scan from Machine down to `current` and return the first level whose
    /// edeleg does not delegate `cause` further.
    pub fn exception_target(&self, cause: u32, current: PrivilegeLevel) -> PrivilegeLevel {
        self.scan(&self.edeleg, cause, current as u8)
    }

    /// Same scan over ideleg, with the interrupt's native privilege level as
    /// the floor.
    pub fn interrupt_target(&self, cause: u32) -> PrivilegeLevel {
        self.scan(&self.ideleg, cause, (cause & 0b11) as u8)
    }

    fn scan(&self, deleg: &[u32; 4], cause: u32, floor: u8) -> PrivilegeLevel {
        let mut level = RawPrivilegeLevel::Machine as u8;
        while level > floor {
            if deleg[level as usize] & (1 << cause) == 0 {
                break;
            }
            level -= 1;
        }
        // Level 2 delegates everything, so the scan can never stop there.
        RawPrivilegeLevel::from_u2(level).try_into().unwrap()
    }
}

impl Hart {
    /// Deliver a synchronous exception: `riscv_trap(cause, tval)`.
    ///
    /// Saves PC/cause/tval at the delegation target, stacks the interrupt
    /// state in xstatus, switches mode, and flags the main loop to jump to
    /// the trap vector.
    pub(super) fn trap(&mut self, exception: Exception) {
        let cause = exception.code();
        let tval = exception.tval();
        let target = self.trap_regs.exception_target(cause, self.privilege_mode);
        trace!(
            "hart {}: trap {} -> {}, cause {:#x}, tval {:#010x}",
            self.config.hart_id,
            self.privilege_mode,
            target,
            cause,
            tval
        );
        let pc = self.registers.pc();
        self.trap_regs.write_epc(target, pc, 0xFFFF_FFFF);
        self.trap_regs.write_cause(target, cause, 0xFFFF_FFFF);
        self.trap_regs.write_tval(target, tval, 0xFFFF_FFFF);
        self.stack_interrupt_state(target);
        self.enter_privilege(target);
        // Any trap breaks an LR reservation.
        self.reservation = None;
        self.ev_trap = true;
        self.shared.wake();
    }

    /// Deliver an interrupt with cause code `cause` (without the interrupt
    /// bit). Mirrors trap delivery with the top cause bit set.
    pub(super) fn perform_interrupt(&mut self, cause: u32) {
        let target = self.trap_regs.interrupt_target(cause);
        trace!(
            "hart {}: interrupt {} -> {}, cause {:#x}",
            self.config.hart_id,
            self.privilege_mode,
            target,
            cause
        );
        let pc = self.registers.pc();
        self.trap_regs.write_epc(target, pc, 0xFFFF_FFFF);
        self.trap_regs
            .write_cause(target, cause | INTERRUPT_BIT, 0xFFFF_FFFF);
        self.trap_regs.write_tval(target, 0, 0xFFFF_FFFF);
        self.stack_interrupt_state(target);
        self.enter_privilege(target);
        self.reservation = None;
        self.shared.wake();
    }

    /// Scan the pending interrupts from the highest cause bit downwards and
    /// deliver the first one that is enabled and allowed at the current
    /// privilege.
    ///
    /// With `wfi` set, delivery is additionally allowed while the mode's
    /// global interrupt-enable is clear, and PC is advanced past the WFI
    /// before delivering so the handler returns to the next instruction.
    pub(super) fn handle_ip(&mut self, wfi: bool) -> bool {
        if self.ip == 0 {
            return false;
        }
        // Loop over possible interrupt cause bits, prioritizing the higher
        // privilege source.
        for cause in (1..=11u32).rev() {
            let imask = 1 << cause;
            if self.ip & imask == 0 {
                continue;
            }
            let native = (cause & 0b11) as u8;
            let current = self.privilege_mode as u8;
            let allowed = native > current
                || (native == current && (self.status.xie(self.privilege_mode) || wfi));
            if self.ie & imask != 0 && allowed {
                if wfi {
                    // Resume past the WFI once the handler returns.
                    let pc = self.registers.pc_mut();
                    *pc = pc.wrapping_add(4);
                    self.ev_trap = true;
                }
                self.perform_interrupt(cause);
                return true;
            }
        }
        false
    }

    /// Jump to the trap vector of the current (post-delivery) privilege
    /// mode.
    pub(super) fn trap_jump(&mut self) {
        let tvec = self.trap_regs.tvec(self.privilege_mode);
        let mut pc = tvec.base();
        let cause = self.trap_regs.cause(self.privilege_mode);
        if tvec.mode() == VectorMode::Vectored && cause & INTERRUPT_BIT != 0 {
            pc = pc.wrapping_add((cause & !INTERRUPT_BIT) << 2);
        }
        *self.registers.pc_mut() = pc;
    }

    /// Return from the trap handler of `mode` (MRET/SRET/URET).
    ///
    /// Restores `xPIE` into `xIE`, drops to the privilege saved in `xPP`,
    /// re-arms `xPIE`, resets `xPP` to U, and jumps to `xepc`.
    pub(super) fn xret(&mut self, mode: PrivilegeLevel) {
        let target = match mode {
            PrivilegeLevel::Machine => {
                let pie = self.status.mpie();
                self.status.set_mie(pie);
                let previous = self.status.mpp();
                self.status.set_mpie(true);
                self.status.set_mpp(RawPrivilegeLevel::User);
                previous
            }
            PrivilegeLevel::Supervisor => {
                let pie = self.status.spie();
                self.status.set_sie(pie);
                let previous = self.status.spp();
                self.status.set_spie(true);
                self.status.set_spp(RawPrivilegeLevel::User);
                previous
            }
            PrivilegeLevel::User => PrivilegeLevel::User,
        };
        self.enter_privilege(target);
        *self.registers.pc_mut() = self.trap_regs.epc(mode);
    }

    /// Save the current privilege into `xPP`, the global enable into `xPIE`,
    /// and disable interrupts for the target mode.
    fn stack_interrupt_state(&mut self, target: PrivilegeLevel) {
        match target {
            PrivilegeLevel::Machine => {
                self.status.set_mpp(self.privilege_mode.into());
                let mie = self.status.mie();
                self.status.set_mpie(mie);
                self.status.set_mie(false);
            }
            PrivilegeLevel::Supervisor => {
                self.status.set_spp(self.privilege_mode.into());
                let sie = self.status.sie();
                self.status.set_spie(sie);
                self.status.set_sie(false);
            }
            PrivilegeLevel::User => {}
        }
    }

    /// Switch privilege mode. A mode change alters the effective address
    /// space, so the TLB is flushed along with it.
    fn enter_privilege(&mut self, target: PrivilegeLevel) {
        if target != self.privilege_mode {
            self.tlb.flush();
        }
        self.privilege_mode = target;
    }
}
