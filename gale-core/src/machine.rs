//! The machine: shared physical memory, the MMIO plane, the hart registry,
//! and the timer/IRQ thread.

use crate::clint::{Clint, CLINT_BASE, CLINT_LEN};
use crate::hart::{Config, Hart, HartShared, Interrupt};
use crate::memory::PhysMemory;
use crate::mmio::{MmioDevice, MmioMap, MmioMapError};
use crate::timer::Timer;
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on registered harts.
pub const MAX_HARTS: usize = 256;

/// Interval at which the IRQ thread scans hart timers and pumps the tick
/// callback.
const IRQ_THREAD_PERIOD: Duration = Duration::from_millis(10);

/// Callback invoked by the IRQ thread once per period, for host-side
/// housekeeping such as pumping a framebuffer window.
pub type TickCallback = Box<dyn Fn() + Send + Sync>;

pub struct MachineConfig {
    /// Guest physical base of RAM; also the harts' reset vector.
    pub mem_base: u32,
    /// RAM size in bytes (page-aligned, nonzero).
    pub mem_size: u32,
    /// Base of the per-hart CLINT windows.
    pub clint_base: u32,
    /// Optional host-UI pump, driven from the IRQ thread.
    pub tick_callback: Option<TickCallback>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mem_base: 0x8000_0000,
            // 0x4000 pages = 64M
            mem_size: 0x0400_0000,
            clint_base: CLINT_BASE,
            tick_callback: None,
        }
    }
}

impl fmt::Debug for MachineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineConfig")
            .field("mem_base", &self.mem_base)
            .field("mem_size", &self.mem_size)
            .field("clint_base", &self.clint_base)
            .field("tick_callback", &self.tick_callback.is_some())
            .finish()
    }
}

/// One emulated machine: physical memory and the MMIO plane shared by all
/// harts, plus the registry the IRQ thread walks.
///
/// The machine is an explicit value rather than process-global state; it is
/// handed around as an `Arc` and every hart holds onto the pieces it needs.
/// The IRQ thread holds only a [`Weak`] reference, so dropping the last
/// `Arc<Machine>` lets the thread wind down on its next tick.
pub struct Machine {
    mem: Arc<PhysMemory>,
    mmio: Arc<RwLock<MmioMap>>,
    registry: Mutex<Registry>,
    /// Machine-wide power-off flag, checked by every hart's run loop.
    stop: Arc<AtomicBool>,
    tick_callback: Option<TickCallback>,
    clint_base: u32,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("mem", &self.mem)
            .field("clint_base", &self.clint_base)
            .finish_non_exhaustive()
    }
}

/// Slot array indexed by hart id, plus the IRQ-thread bookkeeping that
/// shares its lifetime: the thread starts with the first hart and is
/// stopped (flag plus join) when the last one deregisters.
struct Registry {
    slots: Vec<Option<Arc<HartShared>>>,
    count: usize,
    irq_thread: Option<JoinHandle<()>>,
    irq_stop: Arc<AtomicBool>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Arc<Self>, MachineError> {
        let mem = PhysMemory::new(config.mem_base, config.mem_size)
            .ok_or(MachineError::InvalidMemory)?;
        Ok(Arc::new(Self {
            mem: Arc::new(mem),
            mmio: Arc::new(RwLock::new(MmioMap::new())),
            registry: Mutex::new(Registry {
                slots: (0..MAX_HARTS).map(|_| None).collect(),
                count: 0,
                irq_thread: None,
                irq_stop: Arc::new(AtomicBool::new(false)),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            tick_callback: config.tick_callback,
            clint_base: config.clint_base,
        }))
    }

    pub fn mem(&self) -> &Arc<PhysMemory> {
        &self.mem
    }

    /// Copy a pre-built boot image into physical memory at `address`.
    ///
    /// Image parsing (raw bootrom, DTB, ELF segments) is the host's
    /// business; the machine only takes finished bytes.
    pub fn load_image(&self, address: u32, data: &[u8]) -> Result<(), MachineError> {
        match self.mem.write(address, data) {
            true => Ok(()),
            false => Err(MachineError::ImageOutOfRange),
        }
    }

    /// Register a device for the half-open physical range `[base, end)`.
    pub fn add_device(
        &self,
        base: u32,
        end: u32,
        device: Arc<dyn MmioDevice>,
    ) -> Result<(), MmioMapError> {
        self.mmio.write().unwrap().attach(base, end, device)
    }

    /// Remove the device registered at `base`, returning it.
    pub fn remove_device(&self, base: u32) -> Option<Arc<dyn MmioDevice>> {
        self.mmio.write().unwrap().detach(base)
    }

    /// Create and register a hart.
    ///
    /// The hart comes up in machine mode with its PC at the base of physical
    /// memory and its CLINT window installed. The IRQ thread is spawned
    /// along with the first hart.
    pub fn add_hart(self: &Arc<Self>, hart_id: u32) -> Result<Hart, MachineError> {
        if hart_id as usize >= MAX_HARTS {
            return Err(MachineError::HartIdOutOfRange(hart_id));
        }
        let shared = Arc::new(HartShared::new(hart_id, Arc::new(Timer::default())));

        let mut registry = self.registry.lock().unwrap();
        if registry.slots[hart_id as usize].is_some() {
            return Err(MachineError::HartIdInUse(hart_id));
        }
        let clint_base = self.clint_base + hart_id * CLINT_LEN;
        self.mmio.write().unwrap().attach(
            clint_base,
            clint_base + CLINT_LEN,
            Arc::new(Clint::new(Arc::clone(&shared))),
        )?;
        registry.slots[hart_id as usize] = Some(Arc::clone(&shared));
        registry.count += 1;
        if registry.count == 1 {
            let irq_stop = Arc::new(AtomicBool::new(false));
            registry.irq_stop = Arc::clone(&irq_stop);
            let weak = Arc::downgrade(self);
            registry.irq_thread = Some(
                std::thread::Builder::new()
                    .name("irq".into())
                    .spawn(move || irq_thread_main(weak, irq_stop))
                    .expect("failed to spawn IRQ thread"),
            );
            debug!("IRQ thread started with hart {hart_id}");
        }
        drop(registry);

        Ok(Hart::new(
            Config {
                hart_id,
                reset_vector: self.mem.begin(),
            },
            Arc::clone(&self.mem),
            Arc::clone(&self.mmio),
            shared,
            Arc::clone(&self.stop),
            Arc::downgrade(self),
        ))
    }

    /// Deregister and tear down a hart.
    ///
    /// The slot becomes reusable, the hart's CLINT window is removed, and
    /// the IRQ thread is stopped along with the last hart.
    pub fn remove_hart(self: &Arc<Self>, hart: Hart) {
        let hart_id = hart.config().hart_id;
        let irq_thread = {
            let mut registry = self.registry.lock().unwrap();
            registry.slots[hart_id as usize] = None;
            registry.count -= 1;
            match registry.count {
                0 => {
                    registry.irq_stop.store(true, Ordering::SeqCst);
                    registry.irq_thread.take()
                }
                _ => None,
            }
        };
        let clint_base = self.clint_base + hart_id * CLINT_LEN;
        self.mmio.write().unwrap().detach(clint_base);
        if let Some(handle) = irq_thread {
            let _ = handle.join();
            debug!("IRQ thread stopped with hart {hart_id}");
        }
        drop(hart);
    }

    /// Run a hart on a dedicated thread until the machine is shut down.
    pub fn run_hart(hart: Hart) -> std::io::Result<JoinHandle<Hart>> {
        std::thread::Builder::new()
            .name(format!("hart{}", hart.config().hart_id))
            .spawn(move || {
                let mut hart = hart;
                hart.run();
                hart
            })
    }

    /// Look up a registered hart's shared handle by id.
    pub fn hart_by_id(&self, hart_id: u32) -> Option<Arc<HartShared>> {
        if hart_id as usize >= MAX_HARTS {
            return None;
        }
        self.registry.lock().unwrap().slots[hart_id as usize].clone()
    }

    /// Ask every hart except `from` to flush its TLB (SFENCE.VMA
    /// broadcast).
    pub fn broadcast_tlb_flush(&self, from: u32) {
        let registry = self.registry.lock().unwrap();
        for shared in registry.slots.iter().flatten() {
            if shared.hart_id() != from {
                shared.request_tlb_flush();
            }
        }
    }

    /// Queue an interrupt for `hart_id` from an external source (device
    /// model, PLIC). Returns `false` if no such hart is registered.
    pub fn raise_irq(&self, hart_id: u32, interrupt: Interrupt) -> bool {
        match self.hart_by_id(hart_id) {
            Some(shared) => {
                shared.raise_irq(interrupt);
                true
            }
            None => false,
        }
    }

    /// Request every hart's run loop to exit, and stop the IRQ thread.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let irq_thread = {
            let mut registry = self.registry.lock().unwrap();
            registry.irq_stop.store(true, Ordering::SeqCst);
            for shared in registry.slots.iter().flatten() {
                shared.wake();
            }
            registry.irq_thread.take()
        };
        if let Some(handle) = irq_thread {
            let _ = handle.join();
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        // Belt and braces: the IRQ thread holds only a weak reference and
        // exits on its own, but make hart threads wind down too.
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut registry) = self.registry.lock() {
            registry.irq_stop.store(true, Ordering::SeqCst);
            registry.irq_thread.take();
        }
    }
}

/// Body of the global timer/IRQ thread.
///
/// Every period: post the machine timer interrupt to each hart whose timer
/// compare condition holds, wake it, then pump the host tick callback.
fn irq_thread_main(machine: Weak<Machine>, stop: Arc<AtomicBool>) {
    loop {
        std::thread::sleep(IRQ_THREAD_PERIOD);
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let Some(machine) = machine.upgrade() else {
            return;
        };
        if machine.stop.load(Ordering::SeqCst) {
            return;
        }
        {
            let registry = machine.registry.lock().unwrap();
            for shared in registry.slots.iter().flatten() {
                if shared.timer().pending() {
                    shared.raise_irq(Interrupt::MachineTimerInterrupt);
                }
            }
        }
        if let Some(tick) = &machine.tick_callback {
            tick();
        }
    }
}

#[derive(Error, Debug)]
pub enum MachineError {
    /// Physical memory could not be set up (zero, unaligned, or wrapping
    /// size, or the host allocation failed).
    #[error("invalid physical memory configuration")]
    InvalidMemory,
    #[error("hart id {0} exceeds the supported maximum")]
    HartIdOutOfRange(u32),
    #[error("hart id {0} is already registered")]
    HartIdInUse(u32),
    #[error("image does not fit in physical memory")]
    ImageOutOfRange,
    #[error(transparent)]
    Mmio(#[from] MmioMapError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clint;
    use crate::hart::{csr, INTERRUPT_BIT};
    use crate::PrivilegeLevel;

    fn small_machine() -> Arc<Machine> {
        Machine::new(MachineConfig {
            mem_size: 0x10000,
            ..Default::default()
        })
        .unwrap()
    }

    /// Write a program of 32-bit words at the reset vector.
    fn load_program(machine: &Machine, words: &[u32]) {
        let mut image = Vec::new();
        for word in words {
            image.extend_from_slice(&word.to_le_bytes());
        }
        machine.load_image(machine.mem().begin(), &image).unwrap();
    }

    #[test]
    fn test_registration_errors() {
        let machine = small_machine();
        let hart = machine.add_hart(0).unwrap();
        assert!(matches!(
            machine.add_hart(0),
            Err(MachineError::HartIdInUse(0))
        ));
        assert!(matches!(
            machine.add_hart(4096),
            Err(MachineError::HartIdOutOfRange(4096))
        ));
        machine.remove_hart(hart);
        // The slot is reusable after deregistration.
        let hart = machine.add_hart(0).unwrap();
        machine.remove_hart(hart);
    }

    #[test]
    fn test_load_image_bounds() {
        let machine = small_machine();
        assert!(machine.load_image(0x8000_0000, &[1, 2, 3]).is_ok());
        assert!(matches!(
            machine.load_image(0x8000_FFFF, &[1, 2]),
            Err(MachineError::ImageOutOfRange)
        ));
    }

    #[test]
    fn test_addi_then_ebreak() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(
            &machine,
            &[
                0x02A0_0093, // addi x1, x0, 42
                0x0010_0073, // ebreak
            ],
        );
        hart.step();
        hart.step();
        assert_eq!(42, hart.registers().x(crate::registers::Specifier::X1));
        assert_eq!(
            Ok(3),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine)
                .map_err(drop)
        );
        assert_eq!(
            Ok(0x8000_0004),
            hart.read_csr(csr::MEPC, PrivilegeLevel::Machine).map_err(drop)
        );
        machine.remove_hart(hart);
    }

    #[test]
    fn test_store_load_round_trip() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(
            &machine,
            &[
                0x8000_10B7, // lui x1, 0x80001
                0xCAFE_C137, // lui x2, 0xCAFEC
                0xABE1_0113, // addi x2, x2, -1346 (0xCAFEBABE)
                0x0020_A023, // sw x2, 0(x1)
                0x0000_A183, // lw x3, 0(x1)
            ],
        );
        for _ in 0..5 {
            hart.step();
        }
        let x3 = hart.registers().x(crate::registers::Specifier::new(3u8).unwrap());
        assert_eq!(0xCAFE_BABE, x3);
        assert_eq!(Some(0xCAFE_BABE), machine.mem().load_word(0x8000_1000));
        machine.remove_hart(hart);
    }

    #[test]
    fn test_compressed_add() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        // c.li x5, 7; c.add x5, x5 packed into one word.
        load_program(&machine, &[(0x9296 << 16) | 0x429D]);
        hart.step();
        hart.step();
        let x5 = hart.registers().x(crate::registers::Specifier::new(5u8).unwrap());
        assert_eq!(14, x5);
        // Two compressed instructions advance PC by 4 bytes total.
        assert_eq!(0x8000_0004, hart.registers().pc());
        machine.remove_hart(hart);
    }

    #[test]
    fn test_division_by_zero_yields_all_ones() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(
            &machine,
            &[
                0x0050_0113, // addi x2, x0, 5
                0x0201_40B3, // div x1, x2, x0
            ],
        );
        hart.step();
        hart.step();
        assert_eq!(
            0xFFFF_FFFF,
            hart.registers().x(crate::registers::Specifier::X1)
        );
        // No trap was taken.
        assert_eq!(
            Ok(0),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine)
                .map_err(drop)
        );
        machine.remove_hart(hart);
    }

    #[test]
    fn test_amo_breaks_reservation() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(
            &machine,
            &[
                0x8000_10B7, // lui x1, 0x80001
                0x1000_A1AF, // lr.w x3, (x1)
                0x0050_0113, // addi x2, x0, 5
                0x0020_A22F, // amoadd.w x4, x2, (x1)
                0x1820_A2AF, // sc.w x5, x2, (x1)
            ],
        );
        for _ in 0..5 {
            hart.step();
        }
        let x = |i: u8| hart.registers().x(crate::registers::Specifier::new(i).unwrap());
        assert_eq!(0, x(3)); // LR read the initial zero
        assert_eq!(0, x(4)); // AMO returned the old value
        assert_eq!(1, x(5)); // SC failed: the AMO broke the reservation
        assert_eq!(Some(5), machine.mem().load_word(0x8000_1000));
        machine.remove_hart(hart);
    }

    #[test]
    fn test_register_zero_stays_zero() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(
            &machine,
            &[
                0x0050_0013, // addi x0, x0, 5
                0x0000_0013, // nop
            ],
        );
        hart.step();
        assert_eq!(0, hart.registers().x(crate::registers::Specifier::X0));
        hart.step();
        assert_eq!(0, hart.registers().x(crate::registers::Specifier::X0));
        machine.remove_hart(hart);
    }

    #[test]
    fn test_illegal_instruction_sets_tval() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(&machine, &[0xFFFF_FFFF]);
        hart.step();
        assert_eq!(
            Ok(2),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine)
                .map_err(drop)
        );
        assert_eq!(
            Ok(0xFFFF_FFFF),
            hart.read_csr(csr::MTVAL, PrivilegeLevel::Machine)
                .map_err(drop)
        );
        machine.remove_hart(hart);
    }

    #[test]
    fn test_msip_ipi_delivery() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(&machine, &[0x0000_0013, 0x0000_0013]); // nops
        hart.write_csr(csr::MTVEC, PrivilegeLevel::Machine, 0x8000_0100, !0)
            .unwrap();
        hart.write_csr(csr::MIE, PrivilegeLevel::Machine, 1 << 3, !0)
            .unwrap();
        hart.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 3, !0)
            .unwrap();
        // Store to this hart's own CLINT msip register, as another hart
        // would for an IPI.
        hart.write_word(clint::CLINT_BASE, 1).unwrap();
        hart.step();
        assert_eq!(
            Ok(INTERRUPT_BIT | 3),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine)
                .map_err(drop)
        );
        assert_eq!(0x8000_0100, hart.registers().pc());
        machine.remove_hart(hart);
    }

    #[test]
    fn test_timer_interrupt_reaches_mtvec() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(&machine, &[0x1050_0073]); // wfi
        hart.write_csr(csr::MTVEC, PrivilegeLevel::Machine, 0x8000_0100, !0)
            .unwrap();
        hart.write_csr(csr::MIE, PrivilegeLevel::Machine, 1 << 7, !0)
            .unwrap();
        hart.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 3, !0)
            .unwrap();
        // mtimecmp in the past: the timer is immediately pending, and the
        // IRQ thread posts the interrupt within its next period.
        hart.shared().timer().set_mtimecmp(0);
        hart.step();
        assert_eq!(
            Ok(INTERRUPT_BIT | 7),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine)
                .map_err(drop)
        );
        // The WFI was interrupted: mepc points past it.
        assert_eq!(
            Ok(0x8000_0004),
            hart.read_csr(csr::MEPC, PrivilegeLevel::Machine).map_err(drop)
        );
        assert_eq!(0x8000_0100, hart.registers().pc());
        machine.shutdown();
        machine.remove_hart(hart);
    }

    #[test]
    fn test_threaded_hart_shutdown() {
        let machine = small_machine();
        let hart = machine.add_hart(0).unwrap();
        load_program(&machine, &[0x1050_0073]); // wfi
        let handle = Machine::run_hart(hart).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        machine.shutdown();
        let hart = handle.join().unwrap();
        machine.remove_hart(hart);
    }

    #[test]
    fn test_sfence_broadcasts_to_peers() {
        let machine = small_machine();
        let mut hart0 = machine.add_hart(0).unwrap();
        let hart1 = machine.add_hart(1).unwrap();
        load_program(&machine, &[0x1220_8073]); // sfence.vma x1, x2
        hart0.step();
        // The fence retired (no trap) and poked the peer hart.
        assert_eq!(0x8000_0004, hart0.registers().pc());
        assert_eq!(
            Ok(0),
            hart0
                .read_csr(csr::MCAUSE, PrivilegeLevel::Machine)
                .map_err(drop)
        );
        machine.remove_hart(hart0);
        machine.remove_hart(hart1);
    }

    #[test]
    fn test_external_irq_injection() {
        let machine = small_machine();
        let mut hart = machine.add_hart(0).unwrap();
        load_program(&machine, &[0x0000_0013]);
        hart.write_csr(csr::MTVEC, PrivilegeLevel::Machine, 0x8000_0100, !0)
            .unwrap();
        hart.write_csr(csr::MIE, PrivilegeLevel::Machine, 1 << 11, !0)
            .unwrap();
        hart.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 3, !0)
            .unwrap();
        assert!(machine.raise_irq(0, Interrupt::MachineExternalInterrupt));
        assert!(!machine.raise_irq(7, Interrupt::MachineExternalInterrupt));
        hart.step();
        assert_eq!(
            Ok(INTERRUPT_BIT | 11),
            hart.read_csr(csr::MCAUSE, PrivilegeLevel::Machine)
                .map_err(drop)
        );
        machine.remove_hart(hart);
    }
}
