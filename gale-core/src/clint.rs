//! Core Local Interruptor: per-hart software interrupt and timer compare.

use crate::hart::{HartShared, Interrupt};
use crate::mmio::{Access, MmioDevice};
use std::sync::Arc;

/// Default guest physical base of hart 0's CLINT window.
pub const CLINT_BASE: u32 = 0x0200_0000;
/// Size of one hart's CLINT window; hart `i`'s window starts at
/// `CLINT_BASE + i * CLINT_LEN`.
pub const CLINT_LEN: u32 = 0x0001_0000;

// Register offsets within a window, following the SiFive CLINT layout.
pub const MSIP_OFFSET: u32 = 0x0;
pub const MTIMECMP_OFFSET: u32 = 0x4000;
pub const MTIME_OFFSET: u32 = 0xBFF8;

/// The CLINT of a single hart.
///
/// `msip` latches the machine software interrupt (bit 0); writing it from
/// any hart posts or clears the IPI. `mtimecmp` programs the hart timer's
/// compare register, and `mtime` is a read-only view of the timer counter.
/// All registers accept 4-byte accesses; the 64-bit ones also accept 8-byte
/// accesses.
#[derive(Debug)]
pub struct Clint {
    shared: Arc<HartShared>,
}

impl Clint {
    pub fn new(shared: Arc<HartShared>) -> Self {
        Self { shared }
    }

    fn read_u32(&self, offset: u32) -> u32 {
        let timer = self.shared.timer();
        match offset {
            MSIP_OFFSET => self.shared.msip() as u32,
            MTIMECMP_OFFSET => timer.mtimecmp() as u32,
            o if o == MTIMECMP_OFFSET + 4 => (timer.mtimecmp() >> 32) as u32,
            MTIME_OFFSET => timer.mtime() as u32,
            o if o == MTIME_OFFSET + 4 => (timer.mtime() >> 32) as u32,
            _ => 0,
        }
    }

    fn write_u32(&self, offset: u32, value: u32) {
        match offset {
            MSIP_OFFSET => match value & 1 {
                0 => self.shared.set_msip(false),
                _ => {
                    self.shared.set_msip(true);
                    self.shared.raise_irq(Interrupt::MachineSoftwareInterrupt);
                }
            },
            MTIMECMP_OFFSET => {
                self.shared.timer().set_mtimecmp_lo(value);
                // Wake the hart so it re-evaluates the pending timer bit.
                self.shared.poke();
            }
            o if o == MTIMECMP_OFFSET + 4 => {
                self.shared.timer().set_mtimecmp_hi(value);
                self.shared.poke();
            }
            // mtime is read-only; other offsets are ignored.
            _ => {}
        }
    }
}

impl MmioDevice for Clint {
    fn access(&self, offset: u32, buf: &mut [u8], access: Access) -> bool {
        if offset & 0b11 != 0 {
            return false;
        }
        match (buf.len(), access) {
            (4, Access::Read) => {
                buf.copy_from_slice(&self.read_u32(offset).to_le_bytes());
                true
            }
            (8, Access::Read) => {
                let lo = self.read_u32(offset) as u64;
                let hi = self.read_u32(offset + 4) as u64;
                buf.copy_from_slice(&(hi << 32 | lo).to_le_bytes());
                true
            }
            (4, Access::Write) => {
                self.write_u32(offset, u32::from_le_bytes(buf.try_into().unwrap()));
                true
            }
            (8, Access::Write) => {
                let value = u64::from_le_bytes(buf.try_into().unwrap());
                match offset {
                    MTIMECMP_OFFSET => {
                        self.shared.timer().set_mtimecmp(value);
                        self.shared.poke();
                    }
                    _ => {}
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::Timer;

    fn test_clint() -> (Clint, Arc<HartShared>) {
        let shared = Arc::new(HartShared::new(0, Arc::new(Timer::default())));
        (Clint::new(Arc::clone(&shared)), shared)
    }

    #[test]
    fn test_msip_latch() {
        let (clint, shared) = test_clint();
        let mut buf = 1u32.to_le_bytes();
        assert!(clint.access(MSIP_OFFSET, &mut buf, Access::Write));
        assert!(shared.msip());
        let mut readback = [0u8; 4];
        assert!(clint.access(MSIP_OFFSET, &mut readback, Access::Read));
        assert_eq!(1, u32::from_le_bytes(readback));
        let mut buf = 0u32.to_le_bytes();
        assert!(clint.access(MSIP_OFFSET, &mut buf, Access::Write));
        assert!(!shared.msip());
    }

    #[test]
    fn test_mtimecmp_halves() {
        let (clint, shared) = test_clint();
        let mut lo = 0x9ABC_DEF0u32.to_le_bytes();
        let mut hi = 0x1234_5678u32.to_le_bytes();
        assert!(clint.access(MTIMECMP_OFFSET, &mut lo, Access::Write));
        assert!(clint.access(MTIMECMP_OFFSET + 4, &mut hi, Access::Write));
        assert_eq!(0x1234_5678_9ABC_DEF0, shared.timer().mtimecmp());
    }

    #[test]
    fn test_mtime_is_read_only() {
        let (clint, shared) = test_clint();
        let mut buf = 0xFFFF_FFFFu32.to_le_bytes();
        assert!(clint.access(MTIME_OFFSET, &mut buf, Access::Write));
        // The counter keeps its monotonic value.
        assert!(shared.timer().mtime() < 1_000_000_000);
    }

    #[test]
    fn test_misaligned_access_refused() {
        let (clint, _) = test_clint();
        assert!(!clint.access(MSIP_OFFSET + 1, &mut [0; 4], Access::Read));
        assert!(!clint.access(MSIP_OFFSET, &mut [0; 3], Access::Read));
    }
}
