//! A single RV32IMAC hart: registers, CSRs, MMU/TLB, and the execution loop.

pub mod csr;
pub mod mmu;

mod control;
mod execute;
mod status;
mod trap;

use crate::instruction::Instruction;
use crate::machine::Machine;
use crate::memory::PhysMemory;
use crate::mmio::MmioMap;
use crate::registers::Registers;
use crate::timer::Timer;
use crate::{PrivilegeLevel, RawPrivilegeLevel};
use control::Satp;
use execute::Executor;
use log::trace;
use mmu::Tlb;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;
use trap::TrapRegs;

pub use csr::CsrSpecifier;

/// Bit set in a cause register when the cause is an interrupt rather than an
/// exception.
pub const INTERRUPT_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone)]
pub struct Config {
    /// > The mhartid CSR is an MXLEN-bit read-only register containing the
    /// > integer ID of the hardware thread running the code. This register
    /// > must be readable in any implementation. Hart IDs might not
    /// > necessarily be numbered contiguously in a multiprocessor system,
    /// > but at least one hart must have a hart ID of zero.
    pub hart_id: u32,
    /// Address to which the hart's PC register is reset. Conventionally the
    /// base of physical memory, where the boot image is loaded.
    pub reset_vector: u32,
}

/// State shared between a hart and the other threads that need to poke it
/// (the IRQ thread, CLINTs of other harts, external device models).
///
/// Everything else a hart owns is private to its execution thread; this
/// handle is the only cross-thread surface. The protocol is the one the
/// run loop expects: set bits in `ev_int_mask`, raise `ev_int`, then clear
/// `wait_event` with release ordering to wake the hart.
#[derive(Debug)]
pub struct HartShared {
    hart_id: u32,
    timer: Arc<Timer>,
    /// `1` while the hart is executing and willing to keep going; wakers
    /// store `0` (release) to interrupt it.
    wait_event: AtomicU32,
    /// Raised when `ev_int_mask` has new bits worth looking at.
    ev_int: AtomicBool,
    /// Pending interrupt causes, OR-accumulated by wakers and drained (swap
    /// to zero) only by the owning hart.
    ev_int_mask: AtomicU32,
    /// Machine software-interrupt latch, mirroring the CLINT msip register.
    msip: AtomicBool,
    /// Set when another hart's SFENCE.VMA asks this hart to drop its TLB.
    ev_tlb_flush: AtomicBool,
}

impl HartShared {
    pub(crate) fn new(hart_id: u32, timer: Arc<Timer>) -> Self {
        Self {
            hart_id,
            timer,
            wait_event: AtomicU32::new(0),
            ev_int: AtomicBool::new(false),
            ev_int_mask: AtomicU32::new(0),
            msip: AtomicBool::new(false),
            ev_tlb_flush: AtomicBool::new(false),
        }
    }

    pub fn hart_id(&self) -> u32 {
        self.hart_id
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Queue `interrupt` for delivery and wake the hart.
    ///
    /// Losing the race against a concurrent drain merely delays the
    /// interrupt by one scheduling quantum; the mask is OR-accumulated so no
    /// state can be corrupted.
    pub fn raise_irq(&self, interrupt: Interrupt) {
        self.ev_int_mask
            .fetch_or(1 << interrupt.code(), Ordering::SeqCst);
        self.ev_int.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Interrupt the hart's execution loop (release store to `wait_event`).
    pub fn wake(&self) {
        self.wait_event.store(0, Ordering::Release);
    }

    pub(crate) fn set_msip(&self, value: bool) {
        self.msip.store(value, Ordering::SeqCst);
        self.poke();
    }

    /// Ask the hart to re-evaluate its pending-interrupt state without
    /// queueing a new cause bit.
    pub(crate) fn poke(&self) {
        self.ev_int.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Ask the hart to flush its TLB at the next opportunity (cross-hart
    /// SFENCE.VMA coherence).
    pub fn request_tlb_flush(&self) {
        self.ev_tlb_flush.store(true, Ordering::SeqCst);
        self.poke();
    }

    fn take_tlb_flush(&self) -> bool {
        self.ev_tlb_flush.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn msip(&self) -> bool {
        self.msip.load(Ordering::SeqCst)
    }

    fn arm_wait_event(&self) {
        self.wait_event.store(1, Ordering::Release);
    }

    fn wait_event_armed(&self) -> bool {
        self.wait_event.load(Ordering::Acquire) != 0
    }
}

/// A single hardware thread.
///
/// A hart owns its architectural state exclusively; it is driven either one
/// instruction at a time through [`Hart::step`] or continuously through
/// [`Hart::run`] on a dedicated thread. Cross-thread interaction goes
/// through the hart's [`HartShared`] handle only.
#[derive(Debug)]
pub struct Hart {
    config: Config,
    mem: Arc<PhysMemory>,
    mmio: Arc<RwLock<MmioMap>>,
    shared: Arc<HartShared>,
    stop: Arc<AtomicBool>,
    /// The machine this hart is registered with, for fleet-wide operations
    /// (SFENCE.VMA broadcast). Weak so a machine can be torn down while
    /// hart values still exist.
    machine: Weak<Machine>,

    registers: Registers,
    privilege_mode: PrivilegeLevel,
    status: status::Status,
    trap_regs: TrapRegs,
    /// Interrupt-pending bits (the mip CSR).
    ip: u32,
    /// Interrupt-enable bits (the mie CSR).
    ie: u32,
    satp: Satp,
    tlb: Tlb,
    /// Physical address of the word reserved by LR.W, if any.
    reservation: Option<u32>,
    /// Set when a trap was delivered and the main loop must jump to the
    /// trap vector. Owner-private, unlike the flags in [`HartShared`].
    ev_trap: bool,
}

/// What a single fetch-execute round did.
enum StepFlow {
    Retired,
    Wfi,
}

impl Hart {
    /// The misa CSR value: MXL=32, extensions I, M, A, C, plus S and U modes.
    pub const MISA: u32 = 0x4014_1105;
    /// The mvendorid CSR is 0 to indicate this is a non-commercial
    /// implementation.
    pub const MVENDORID: u32 = 0;
    /// The marchid CSR is 0 to indicate it is not implemented.
    pub const MARCHID: u32 = 0;
    /// The mimpid CSR is 0 to indicate it is not implemented.
    pub const MIMPID: u32 = 0;

    pub(crate) fn new(
        config: Config,
        mem: Arc<PhysMemory>,
        mmio: Arc<RwLock<MmioMap>>,
        shared: Arc<HartShared>,
        stop: Arc<AtomicBool>,
        machine: Weak<Machine>,
    ) -> Self {
        let registers = Registers::new(config.reset_vector);
        Self {
            config,
            mem,
            mmio,
            shared,
            stop,
            machine,
            registers,
            privilege_mode: PrivilegeLevel::Machine,
            status: status::Status::new(),
            trap_regs: TrapRegs::new(),
            ip: 0,
            ie: 0,
            satp: Satp::default(),
            tlb: Tlb::new(),
            reservation: None,
            ev_trap: false,
        }
    }

    /// Provide a read-only view of this hart's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared(&self) -> &Arc<HartShared> {
        &self.shared
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    /// Returns the current privilege mode the hart is in.
    pub fn privilege_mode(&self) -> PrivilegeLevel {
        self.privilege_mode
    }

    /// Run until the machine is stopped.
    ///
    /// The loop arms the wake-event flag, executes instructions until a trap
    /// is raised, an external wake is observed, or a WFI parks the hart, and
    /// then dispatches whatever event ended the burst.
    pub fn run(&mut self) {
        while !self.stopped() {
            self.shared.arm_wait_event();
            self.run_till_event();
            self.handle_events();
        }
    }

    /// Execute a single instruction, including event dispatch.
    ///
    /// This is the single-stepped equivalent of one iteration of
    /// [`Hart::run`]'s inner loop, useful for tests and debuggers.
    pub fn step(&mut self) {
        self.shared.arm_wait_event();
        match self.step_instruction() {
            StepFlow::Retired => {}
            StepFlow::Wfi => self.wfi_wait(),
        }
        self.handle_events();
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn run_till_event(&mut self) {
        loop {
            if self.ev_trap || self.stopped() {
                return;
            }
            if !self.shared.wait_event_armed() {
                // An external wake was signaled.
                return;
            }
            match self.step_instruction() {
                StepFlow::Retired => {}
                StepFlow::Wfi => {
                    self.wfi_wait();
                    return;
                }
            }
        }
    }

    /// Fetch, decode, and execute one instruction, converting any exception
    /// into a delivered trap.
    fn step_instruction(&mut self) -> StepFlow {
        match self.fetch_instruction() {
            Ok((Instruction::Wfi, _, _)) => {
                // PC stays at the WFI; delivery out of the wait advances it.
                StepFlow::Wfi
            }
            Ok((instruction, raw, length)) => {
                if let Err(exception) = self.execute_instruction(instruction, raw, length) {
                    self.trap(exception);
                }
                StepFlow::Retired
            }
            Err(exception) => {
                self.trap(exception);
                StepFlow::Retired
            }
        }
    }

    /// Dispatch the event that ended an execution burst: a trap jump, or a
    /// freshly delivered external interrupt.
    fn handle_events(&mut self) {
        if self.ev_trap {
            self.ev_trap = false;
            self.trap_jump();
        } else if self.shared.ev_int.swap(false, Ordering::SeqCst) {
            self.drain_events();
            if self.handle_ip(false) {
                self.trap_jump();
            }
        }
    }

    /// Fold the externally accumulated interrupt mask into the pending bits,
    /// then reconcile the level-triggered sources: the timer bit is cleared
    /// when the timer is no longer pending, the software bit mirrors the
    /// CLINT msip latch.
    fn drain_events(&mut self) {
        if self.shared.take_tlb_flush() {
            self.tlb.flush();
        }
        let mask = self.shared.ev_int_mask.swap(0, Ordering::SeqCst);
        self.ip |= mask;
        let mtip = 1 << Interrupt::MachineTimerInterrupt.code();
        if self.ip & mtip != 0 && !self.shared.timer.pending() {
            self.ip &= !mtip;
        }
        let msip = 1 << Interrupt::MachineSoftwareInterrupt.code();
        match self.shared.msip() {
            true => self.ip |= msip,
            false => self.ip &= !msip,
        }
    }

    /// Park on the wake-event flag until an interrupt is delivered out of
    /// the wait (which advances PC past the WFI and sets the trap flag).
    fn wfi_wait(&mut self) {
        loop {
            self.shared.ev_int.swap(false, Ordering::SeqCst);
            self.drain_events();
            if self.handle_ip(true) {
                return;
            }
            if self.stopped() {
                return;
            }
            while self.shared.wait_event_armed() {
                if self.stopped() {
                    return;
                }
                std::thread::yield_now();
            }
            // Re-arm before rechecking so a wake between the checks is not
            // lost.
            self.shared.arm_wait_event();
        }
    }

    /// "Independent instruction fetch unit"
    ///
    /// > Instructions are stored in memory as a sequence of 16-bit
    /// > little-endian parcels, regardless of memory system endianness.
    /// > Parcels forming one instruction are stored at increasing halfword
    /// > addresses, with the lowest-addressed parcel holding the
    /// > lowest-numbered bits in the instruction specification.
    ///
    /// A parcel whose low two bits are not `0b11` is a compressed
    /// instruction; otherwise the next parcel is fetched to form the full
    /// 32-bit instruction. Returns the decoded instruction, its raw bits,
    /// and its length in bytes.
    fn fetch_instruction(&mut self) -> Result<(Instruction, u32, u32), Exception> {
        let pc = self.registers.pc();
        if pc & 1 != 0 {
            return Err(Exception::InstructionAddressMisaligned(pc));
        }
        let low = self.fetch_halfword(pc)?;
        if low & 0b11 != 0b11 {
            let instruction = Instruction::decode_compressed(low)
                .map_err(|_| Exception::IllegalInstruction(low as u32))?;
            Ok((instruction, low as u32, 2))
        } else {
            let high = self.fetch_halfword(pc.wrapping_add(2))?;
            let raw = (high as u32) << 16 | low as u32;
            let instruction =
                Instruction::decode(raw).map_err(|_| Exception::IllegalInstruction(raw))?;
            Ok((instruction, raw, 4))
        }
    }

    fn execute_instruction(
        &mut self,
        instruction: Instruction,
        raw: u32,
        length: u32,
    ) -> ExecutionResult {
        let mut executor = Executor {
            hart: self,
            raw,
            length,
        };
        executor.execute(instruction)
    }

    /// Read the value of a CSR by its specifier.
    ///
    /// `privilege_level` indicates at what privilege level the read is
    /// performed. If the CSR that is being read requires a higher privilege
    /// level (see [`csr::required_privilege_level`]), then a
    /// [`CsrAccessError::Privileged`] will be given.
    pub fn read_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<u32, CsrAccessError> {
        self.check_csr_access(specifier, privilege_level)?;
        let m = PrivilegeLevel::Machine;
        let s = PrivilegeLevel::Supervisor;
        match specifier {
            csr::MISA => Ok(Self::MISA),
            csr::MVENDORID => Ok(Self::MVENDORID),
            csr::MARCHID => Ok(Self::MARCHID),
            csr::MIMPID => Ok(Self::MIMPID),
            csr::MHARTID => Ok(self.config.hart_id),
            csr::MSTATUS => Ok(self.status.read_mstatus()),
            csr::SSTATUS => Ok(self.status.read_sstatus()),
            csr::MIE => Ok(self.ie),
            csr::SIE => Ok(self.ie & self.trap_regs.ideleg(m)),
            csr::MIP => Ok(self.ip),
            csr::SIP => Ok(self.ip & self.trap_regs.ideleg(m)),
            csr::MTVEC => Ok(self.trap_regs.tvec(m).read()),
            csr::STVEC => Ok(self.trap_regs.tvec(s).read()),
            csr::MEDELEG => Ok(self.trap_regs.edeleg(m)),
            csr::MIDELEG => Ok(self.trap_regs.ideleg(m)),
            csr::MCOUNTEREN => Ok(self.trap_regs.counteren(m).read()),
            csr::SCOUNTEREN => Ok(self.trap_regs.counteren(s).read()),
            csr::MSCRATCH => Ok(self.trap_regs.scratch(m)),
            csr::SSCRATCH => Ok(self.trap_regs.scratch(s)),
            csr::MEPC => Ok(self.trap_regs.epc(m)),
            csr::SEPC => Ok(self.trap_regs.epc(s)),
            csr::MCAUSE => Ok(self.trap_regs.cause(m)),
            csr::SCAUSE => Ok(self.trap_regs.cause(s)),
            csr::MTVAL => Ok(self.trap_regs.tval(m)),
            csr::STVAL => Ok(self.trap_regs.tval(s)),
            csr::SATP => Ok(self.satp.read()),
            csr::TIME => {
                self.check_counter_access(privilege_level, specifier)?;
                Ok(self.shared.timer.mtime() as u32)
            }
            csr::TIMEH => {
                self.check_counter_access(privilege_level, specifier)?;
                Ok((self.shared.timer.mtime() >> 32) as u32)
            }
            _ => Err(CsrAccessError::CsrUnsupported(specifier)),
        }
    }

    /// Write `value & mask` to a CSR. Bits outside `mask` keep their old
    /// value.
    ///
    /// Writes that can change address translation (satp, the status
    /// registers) flush the TLB wholesale.
    pub fn write_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
        value: u32,
        mask: u32,
    ) -> Result<(), CsrWriteError> {
        self.check_csr_access(specifier, privilege_level)
            .map_err(CsrWriteError::AccessError)?;
        if csr::is_read_only(specifier) {
            return Err(CsrWriteError::WriteToReadOnly);
        }
        let m = PrivilegeLevel::Machine;
        let s = PrivilegeLevel::Supervisor;
        match specifier {
            csr::MSTATUS => {
                self.status.write_mstatus(value, mask);
                self.tlb.flush();
            }
            csr::SSTATUS => {
                self.status.write_sstatus(value, mask);
                self.tlb.flush();
            }
            csr::MIE => self.ie = self.ie & !mask | value & mask & Self::VALID_INTERRUPTS,
            csr::SIE => {
                let mask = mask & self.trap_regs.ideleg(m);
                self.ie = self.ie & !mask | value & mask;
            }
            csr::MIP => {
                let mask = mask & Self::WRITABLE_MIP;
                self.ip = self.ip & !mask | value & mask;
            }
            csr::SIP => {
                let writable = 1 << Interrupt::SupervisorSoftwareInterrupt.code();
                let mask = mask & writable & self.trap_regs.ideleg(m);
                self.ip = self.ip & !mask | value & mask;
            }
            csr::MTVEC => self.trap_regs.tvec_mut(m).write(value, mask),
            csr::STVEC => self.trap_regs.tvec_mut(s).write(value, mask),
            csr::MEDELEG => self.trap_regs.write_edeleg(m, value, mask),
            csr::MIDELEG => self.trap_regs.write_ideleg(m, value, mask),
            csr::MCOUNTEREN => self.trap_regs.counteren_mut(m).write(value, mask),
            csr::SCOUNTEREN => self.trap_regs.counteren_mut(s).write(value, mask),
            csr::MSCRATCH => self.trap_regs.write_scratch(m, value, mask),
            csr::SSCRATCH => self.trap_regs.write_scratch(s, value, mask),
            csr::MEPC => self.trap_regs.write_epc(m, value, mask),
            csr::SEPC => self.trap_regs.write_epc(s, value, mask),
            csr::MCAUSE => self.trap_regs.write_cause(m, value, mask),
            csr::SCAUSE => self.trap_regs.write_cause(s, value, mask),
            csr::MTVAL => self.trap_regs.write_tval(m, value, mask),
            csr::STVAL => self.trap_regs.write_tval(s, value, mask),
            csr::SATP => {
                self.satp.write(value, mask);
                trace!(
                    "satp written, sv32={}, asid={}, flushing TLB",
                    self.satp.sv32(),
                    self.satp.asid()
                );
                self.tlb.flush();
            }
            _ => {
                return Err(CsrWriteError::AccessError(CsrAccessError::CsrUnsupported(
                    specifier,
                )))
            }
        }
        Ok(())
    }

    /// Pending/enable bits implemented in mip/mie.
    const VALID_INTERRUPTS: u32 = 0
        | 1 << 1 // SSIP
        | 1 << 3 // MSIP
        | 1 << 5 // STIP
        | 1 << 7 // MTIP
        | 1 << 9 // SEIP
        | 1 << 11; // MEIP

    /// mip bits guest code may write directly. MSIP and MTIP are reconciled
    /// from their external sources instead.
    const WRITABLE_MIP: u32 = 0
        | 1 << 1 // SSIP
        | 1 << 5 // STIP
        | 1 << 9 // SEIP
        | 1 << 11; // MEIP

    fn check_csr_access(
        &self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<(), CsrAccessError> {
        if !csr::is_valid(specifier) {
            return Err(CsrAccessError::CsrUnsupported(specifier));
        }
        let required_level = csr::required_privilege_level(specifier);
        if privilege_level < required_level {
            return Err(CsrAccessError::Privileged {
                specifier,
                required_level,
                actual_level: privilege_level,
            });
        }
        Ok(())
    }

    /// Counter CSRs are additionally gated by the mcounteren/scounteren
    /// chain when read from a lower privilege level.
    fn check_counter_access(
        &self,
        privilege_level: PrivilegeLevel,
        specifier: CsrSpecifier,
    ) -> Result<(), CsrAccessError> {
        let m = PrivilegeLevel::Machine;
        let s = PrivilegeLevel::Supervisor;
        if privilege_level < m && !self.trap_regs.counteren(m).tm() {
            return Err(CsrAccessError::CounterDisabled(specifier));
        }
        if privilege_level < s && !self.trap_regs.counteren(s).tm() {
            return Err(CsrAccessError::CounterDisabled(specifier));
        }
        Ok(())
    }
}

/// Errors that can occur when attempting to access a CSR.
#[derive(Error, Debug)]
pub enum CsrAccessError {
    #[error("unsupported CSR: {0:#05X}")]
    CsrUnsupported(CsrSpecifier),
    /// Attempt to access a CSR that requires a higher privilege level.
    #[error(
        "cannot access specifier {specifier:#05X} from privilege level {actual_level}, \
             since it requires privilege level {required_level}"
    )]
    Privileged {
        /// The CSR for which access was requested.
        specifier: CsrSpecifier,
        /// The minimum required privilege level to access that CSR.
        required_level: RawPrivilegeLevel,
        /// The actual privilege level from which the access was performed.
        actual_level: PrivilegeLevel,
    },
    /// Attempt to read a counter CSR that the counter-enable chain has made
    /// unavailable to the current privilege level.
    #[error("counter CSR {0:#05X} disabled by counteren")]
    CounterDisabled(CsrSpecifier),
}

/// Errors that can occur when attempting to write to a CSR.
#[derive(Error, Debug)]
pub enum CsrWriteError {
    /// A non-write specific access error. See [`CsrAccessError`].
    #[error("{0}")]
    AccessError(CsrAccessError),
    /// Attempt to write to a read-only register.
    #[error("writing to read-only CSR is invalid")]
    WriteToReadOnly,
}

/// Result of executing a single instruction. [`Ok`] if execution went
/// normal, [`Err`] if an exception occurred.
pub type ExecutionResult = Result<(), Exception>;

/// All synchronous exception causes, each carrying the value the trap
/// handler will find in the xtval register.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not aligned to a 2-byte boundary (IALIGN=16
    /// with the C extension).
    InstructionAddressMisaligned(u32),
    InstructionAccessFault(u32),
    /// Generic exception used to communicate one of many possible scenarios:
    ///
    /// - (*UNSPECIFIED*) Attempt to decode a reserved instruction.
    /// - Attempt to access a non-existent CSR.
    /// - Attempt to access a CSR without the appropriate privilege level.
    /// - Attempt to write to a read-only CSR.
    /// - Attempt to use an xRET or SFENCE.VMA above the current privilege.
    IllegalInstruction(u32),
    Breakpoint(u32),
    LoadAddressMisaligned(u32),
    LoadAccessFault(u32),
    StoreOrAmoAddressMisaligned(u32),
    StoreOrAmoAccessFault(u32),
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
    InstructionPageFault(u32),
    LoadPageFault(u32),
    StoreOrAmoPageFault(u32),
}

impl Exception {
    /// Returns the exception code (cause) for this exception.
    pub fn code(&self) -> u32 {
        match self {
            Self::InstructionAddressMisaligned(_) => 0,
            Self::InstructionAccessFault(_) => 1,
            Self::IllegalInstruction(_) => 2,
            Self::Breakpoint(_) => 3,
            Self::LoadAddressMisaligned(_) => 4,
            Self::LoadAccessFault(_) => 5,
            Self::StoreOrAmoAddressMisaligned(_) => 6,
            Self::StoreOrAmoAccessFault(_) => 7,
            Self::EnvironmentCallFromUMode => 8,
            Self::EnvironmentCallFromSMode => 9,
            Self::EnvironmentCallFromMMode => 11,
            Self::InstructionPageFault(_) => 12,
            Self::LoadPageFault(_) => 13,
            Self::StoreOrAmoPageFault(_) => 15,
        }
    }

    /// The value to expose through the xtval register: the faulting address
    /// for memory exceptions, the raw bits for illegal instructions, zero
    /// otherwise.
    pub fn tval(&self) -> u32 {
        match *self {
            Self::InstructionAddressMisaligned(value)
            | Self::InstructionAccessFault(value)
            | Self::IllegalInstruction(value)
            | Self::Breakpoint(value)
            | Self::LoadAddressMisaligned(value)
            | Self::LoadAccessFault(value)
            | Self::StoreOrAmoAddressMisaligned(value)
            | Self::StoreOrAmoAccessFault(value)
            | Self::InstructionPageFault(value)
            | Self::LoadPageFault(value)
            | Self::StoreOrAmoPageFault(value) => value,
            Self::EnvironmentCallFromUMode
            | Self::EnvironmentCallFromSMode
            | Self::EnvironmentCallFromMMode => 0,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorSoftwareInterrupt,
    MachineSoftwareInterrupt,
    SupervisorTimerInterrupt,
    MachineTimerInterrupt,
    SupervisorExternalInterrupt,
    MachineExternalInterrupt,
}

impl Interrupt {
    /// Returns the exception code (cause) for this interrupt.
    pub fn code(&self) -> u32 {
        match self {
            Self::SupervisorSoftwareInterrupt => 1,
            Self::MachineSoftwareInterrupt => 3,
            Self::SupervisorTimerInterrupt => 5,
            Self::MachineTimerInterrupt => 7,
            Self::SupervisorExternalInterrupt => 9,
            Self::MachineExternalInterrupt => 11,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registers::Specifier;

    /// A bare hart over 64 KiB of RAM at 0x8000_0000, with no devices and
    /// no machine attached.
    pub(crate) fn test_hart() -> Hart {
        let mem = Arc::new(PhysMemory::new(0x8000_0000, 0x10000).unwrap());
        let timer = Arc::new(Timer::default());
        let shared = Arc::new(HartShared::new(0, timer));
        Hart::new(
            Config {
                hart_id: 0,
                reset_vector: 0x8000_0000,
            },
            mem,
            Arc::new(RwLock::new(MmioMap::new())),
            shared,
            Arc::new(AtomicBool::new(false)),
            Weak::new(),
        )
    }

    fn load_words(hart: &Hart, words: &[u32]) {
        let mut image = Vec::new();
        for word in words {
            image.extend_from_slice(&word.to_le_bytes());
        }
        hart.mem.write(0x8000_0000, &image);
    }

    #[test]
    fn test_reset_state() {
        let hart = test_hart();
        assert_eq!(PrivilegeLevel::Machine, hart.privilege_mode());
        assert_eq!(0x8000_0000, hart.registers().pc());
        for specifier in Specifier::iter_all() {
            assert_eq!(0, hart.registers().x(specifier));
        }
    }

    #[test]
    fn test_csr_privilege_checks() {
        let mut hart = test_hart();
        assert!(hart
            .read_csr(csr::MSTATUS, PrivilegeLevel::Supervisor)
            .is_err());
        assert!(hart
            .read_csr(csr::SSTATUS, PrivilegeLevel::User)
            .is_err());
        assert!(hart.read_csr(csr::SSTATUS, PrivilegeLevel::Supervisor).is_ok());
        // mhartid is read-only.
        assert!(matches!(
            hart.write_csr(csr::MHARTID, PrivilegeLevel::Machine, 1, !0),
            Err(CsrWriteError::WriteToReadOnly)
        ));
        assert_eq!(Ok(0), hart.read_csr(csr::MHARTID, PrivilegeLevel::Machine).map_err(drop));
    }

    #[test]
    fn test_sie_sip_are_masked_views() {
        let mut hart = test_hart();
        let m = PrivilegeLevel::Machine;
        hart.write_csr(csr::MIE, m, !0, !0).unwrap();
        // Nothing is delegated yet, so the S view is empty.
        assert_eq!(Ok(0), hart.read_csr(csr::SIE, m).map_err(drop));
        hart.write_csr(csr::MIDELEG, m, !0, !0).unwrap();
        assert_eq!(
            Ok(1 << 1 | 1 << 5 | 1 << 9),
            hart.read_csr(csr::SIE, m).map_err(drop)
        );
    }

    #[test]
    fn test_misa_advertises_imac_su() {
        let mut hart = test_hart();
        let misa = hart.read_csr(csr::MISA, PrivilegeLevel::Machine).unwrap();
        assert_eq!(0x4000_0000, misa & 0xC000_0000); // MXL=32
        for extension in ['A', 'C', 'I', 'M', 'S', 'U'] {
            assert_ne!(0, misa & 1 << (extension as u8 - b'A'), "{extension}");
        }
        assert_eq!(0, misa & 1 << (b'F' - b'A') as u32);
    }

    #[test]
    fn test_time_csr_gated_by_counteren() {
        let mut hart = test_hart();
        let m = PrivilegeLevel::Machine;
        assert!(hart.read_csr(csr::TIME, PrivilegeLevel::User).is_ok());
        // Clearing mcounteren.TM hides time from lower privileges only.
        hart.write_csr(csr::MCOUNTEREN, m, 0, 1 << 1).unwrap();
        assert!(hart.read_csr(csr::TIME, PrivilegeLevel::User).is_err());
        assert!(hart.read_csr(csr::TIME, m).is_ok());
    }

    #[test]
    fn test_mret_drops_privilege() {
        let mut hart = test_hart();
        load_words(
            &hart,
            &[
                0x0000_0073, // ecall (from M)
            ],
        );
        // Route traps to a handler, then return to U-mode at 0x8000_0010.
        hart.write_csr(csr::MTVEC, PrivilegeLevel::Machine, 0x8000_0008, !0)
            .unwrap();
        hart.step();
        assert_eq!(
            Ok(11),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine).map_err(drop)
        );
        assert_eq!(0x8000_0008, hart.registers().pc());
        // Set MPP=U and mepc, then execute mret.
        hart.write_csr(csr::MEPC, PrivilegeLevel::Machine, 0x8000_0010, !0)
            .unwrap();
        hart.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 0, 0b11 << 11)
            .unwrap();
        hart.mem
            .write(0x8000_0008, &0x3020_0073u32.to_le_bytes()); // mret
        hart.step();
        assert_eq!(PrivilegeLevel::User, hart.privilege_mode());
        assert_eq!(0x8000_0010, hart.registers().pc());
    }

    #[test]
    fn test_mret_from_user_is_illegal() {
        let mut hart = test_hart();
        load_words(&hart, &[0x3020_0073]); // mret
        hart.privilege_mode = PrivilegeLevel::User;
        hart.step();
        assert_eq!(
            Ok(2),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine).map_err(drop)
        );
        assert_eq!(PrivilegeLevel::Machine, hart.privilege_mode());
    }

    #[test]
    fn test_compressed_illegal_instruction() {
        let hart = &mut test_hart();
        // The all-zero parcel is defined illegal; tval holds the raw bits.
        hart.mem.write(0x8000_0000, &[0x00, 0x00]);
        hart.step();
        assert_eq!(
            Ok(2),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine).map_err(drop)
        );
        assert_eq!(
            Ok(0),
            hart.read_csr(csr::MTVAL, PrivilegeLevel::Machine).map_err(drop)
        );
    }

    #[test]
    fn test_vectored_interrupt_dispatch() {
        let mut hart = test_hart();
        load_words(&hart, &[0x0000_0013]); // nop
        let m = PrivilegeLevel::Machine;
        hart.write_csr(csr::MTVEC, m, 0x8000_0100 | 1, !0).unwrap();
        hart.write_csr(csr::MIE, m, 1 << 11, !0).unwrap();
        hart.write_csr(csr::MSTATUS, m, 1 << 3, !0).unwrap();
        hart.shared().raise_irq(Interrupt::MachineExternalInterrupt);
        hart.step();
        // Vectored mode: base + 4 * cause.
        assert_eq!(0x8000_0100 + 4 * 11, hart.registers().pc());
    }
}
