//! The hart's view of memory: SV32 address translation, the TLB, and the
//! physical dispatch to RAM or MMIO.

use super::{Exception, Hart};
use crate::mmio::Access;
use crate::{Alignment, PrivilegeLevel};
use log::trace;
use std::sync::atomic::Ordering;

/// Number of TLB entries. Always nonzero, power of 2 (1, 2, 4..).
pub const TLB_SIZE: usize = 256;
const_assert!(TLB_SIZE.count_ones() == 1);

/// The kind of memory access being performed, deciding which PTE permission
/// bit applies and which fault is raised.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    fn mask(self) -> u8 {
        match self {
            Self::Read => 0b001,
            Self::Write => 0b010,
            Self::Execute => 0b100,
        }
    }

    fn page_fault(self, vaddr: u32) -> Exception {
        match self {
            Self::Read => Exception::LoadPageFault(vaddr),
            Self::Write => Exception::StoreOrAmoPageFault(vaddr),
            Self::Execute => Exception::InstructionPageFault(vaddr),
        }
    }

    fn access_fault(self, vaddr: u32) -> Exception {
        match self {
            Self::Read => Exception::LoadAccessFault(vaddr),
            Self::Write => Exception::StoreOrAmoAccessFault(vaddr),
            Self::Execute => Exception::InstructionAccessFault(vaddr),
        }
    }

    fn misaligned(self, vaddr: u32) -> Exception {
        match self {
            Self::Read => Exception::LoadAddressMisaligned(vaddr),
            Self::Write => Exception::StoreOrAmoAddressMisaligned(vaddr),
            Self::Execute => Exception::InstructionAddressMisaligned(vaddr),
        }
    }
}

/// Direct-mapped cache of virtual-to-physical page translations.
///
/// Entries are tagged with the virtual page number plus the set of access
/// kinds the walk permitted for the privilege state at insert time; only
/// RAM-backed pages are cached. Coherence is maintained by flushing
/// wholesale on `satp`/`mstatus` writes, `SFENCE.VMA`, and privilege-mode
/// changes.
#[derive(Debug, Clone)]
pub(super) struct Tlb {
    entries: Vec<TlbEntry>,
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    /// Virtual page number this entry translates.
    vpn: u32,
    /// Guest physical base address of the backing RAM page.
    page: u32,
    /// Allowed [`AccessKind`] bits. `0` marks an empty slot.
    perms: u8,
}

const INVALID: TlbEntry = TlbEntry {
    vpn: 0,
    page: 0,
    perms: 0,
};

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: vec![INVALID; TLB_SIZE],
        }
    }

    /// Invalidate every entry.
    pub fn flush(&mut self) {
        self.entries.fill(INVALID);
    }

    fn lookup(&self, vpn: u32, kind: AccessKind) -> Option<u32> {
        let entry = &self.entries[vpn as usize & (TLB_SIZE - 1)];
        (entry.vpn == vpn && entry.perms & kind.mask() != 0).then_some(entry.page)
    }

    fn insert(&mut self, vpn: u32, page: u32, perms: u8) {
        self.entries[vpn as usize & (TLB_SIZE - 1)] = TlbEntry { vpn, page, perms };
    }
}

// SV32 PTE bits.
mod pte {
    pub const V: u32 = 1 << 0;
    pub const R: u32 = 1 << 1;
    pub const W: u32 = 1 << 2;
    pub const X: u32 = 1 << 3;
    pub const U: u32 = 1 << 4;
    pub const A: u32 = 1 << 6;
    pub const D: u32 = 1 << 7;
}

impl Hart {
    /// The privilege level memory accesses are performed at.
    ///
    /// With `mstatus.MPRV` set, loads and stores (but not instruction
    /// fetches) are performed as if from the privilege level in
    /// `mstatus.MPP`.
    pub(super) fn effective_privilege(&self, kind: AccessKind) -> PrivilegeLevel {
        if kind != AccessKind::Execute && self.status.mprv() {
            self.status.mpp()
        } else {
            self.privilege_mode
        }
    }

    /// Translate a virtual address to a guest physical address, walking the
    /// page table on a TLB miss.
    fn translate(&mut self, vaddr: u32, kind: AccessKind) -> Result<u32, Exception> {
        let mode = self.effective_privilege(kind);
        if mode == PrivilegeLevel::Machine || !self.satp.sv32() {
            return Ok(vaddr);
        }
        let vpn = vaddr >> 12;
        if let Some(page) = self.tlb.lookup(vpn, kind) {
            return Ok(page | vaddr & 0xFFF);
        }
        let (phys, perms) = self.walk(vaddr, kind, mode)?;
        if let Some(page) = self.mem.page_base(phys) {
            self.tlb.insert(vpn, page, perms);
        }
        Ok(phys)
    }

    /// The two-level SV32 table walk.
    ///
    /// Returns the translated physical address and the set of access kinds
    /// the leaf PTE permits under the current privilege state (used to tag
    /// the TLB entry). Raises the page fault matching `kind` on any invalid,
    /// misaligned, or insufficiently permissive entry, including a page
    /// table that is itself unreachable.
    fn walk(
        &mut self,
        vaddr: u32,
        kind: AccessKind,
        mode: PrivilegeLevel,
    ) -> Result<(u32, u8), Exception> {
        let vpn1 = vaddr >> 22;
        let vpn0 = vaddr >> 12 & 0x3FF;

        let pte1_addr = self.satp.root().wrapping_add(vpn1 * 4);
        let pte1 = self.read_pte(pte1_addr).ok_or(kind.page_fault(vaddr))?;
        if pte1 & pte::V == 0 || (pte1 & pte::W != 0 && pte1 & pte::R == 0) {
            return Err(kind.page_fault(vaddr));
        }
        if pte1 & (pte::R | pte::X) != 0 {
            // Superpage leaf; ppn[0] must be zero (4 MiB alignment).
            if pte1 & 0x000F_FC00 != 0 {
                return Err(kind.page_fault(vaddr));
            }
            let perms = self.leaf_perms(pte1, mode);
            if perms & kind.mask() == 0 {
                return Err(kind.page_fault(vaddr));
            }
            self.set_accessed_dirty(pte1_addr, kind == AccessKind::Write);
            let phys = (pte1 >> 20 << 22) | vaddr & 0x003F_FFFF;
            return Ok((phys, perms));
        }

        let pte0_addr = (pte1 >> 10 << 12).wrapping_add(vpn0 * 4);
        let pte0 = self.read_pte(pte0_addr).ok_or(kind.page_fault(vaddr))?;
        if pte0 & pte::V == 0
            || (pte0 & pte::W != 0 && pte0 & pte::R == 0)
            // A pointer at the last level is invalid.
            || pte0 & (pte::R | pte::X) == 0
        {
            return Err(kind.page_fault(vaddr));
        }
        let perms = self.leaf_perms(pte0, mode);
        if perms & kind.mask() == 0 {
            return Err(kind.page_fault(vaddr));
        }
        self.set_accessed_dirty(pte0_addr, kind == AccessKind::Write);
        let phys = (pte0 >> 10 << 12) | vaddr & 0xFFF;
        Ok((phys, perms))
    }

    /// The set of access kinds a leaf PTE permits at `mode`, taking
    /// `mstatus.SUM` and `mstatus.MXR` into account.
    fn leaf_perms(&self, pte: u32, mode: PrivilegeLevel) -> u8 {
        let user_page = pte & pte::U != 0;
        let (data_ok, exec_ok) = match mode {
            PrivilegeLevel::User => (user_page, user_page),
            // S-mode touches U pages only with SUM, and never executes them.
            PrivilegeLevel::Supervisor => (!user_page || self.status.sum(), !user_page),
            PrivilegeLevel::Machine => unreachable!("M-mode accesses are not translated"),
        };
        let mut perms = 0;
        if data_ok && (pte & pte::R != 0 || self.status.mxr() && pte & pte::X != 0) {
            perms |= AccessKind::Read.mask();
        }
        if data_ok && pte & pte::W != 0 {
            perms |= AccessKind::Write.mask();
        }
        if exec_ok && pte & pte::X != 0 {
            perms |= AccessKind::Execute.mask();
        }
        perms
    }

    fn read_pte(&self, address: u32) -> Option<u32> {
        Some(self.mem.atomic_word(address)?.load(Ordering::SeqCst))
    }

    /// Set the A bit (and the D bit on stores) of the PTE at `address`.
    fn set_accessed_dirty(&self, address: u32, store: bool) {
        let bits = match store {
            true => pte::A | pte::D,
            false => pte::A,
        };
        if let Some(word) = self.mem.atomic_word(address) {
            word.fetch_or(bits, Ordering::SeqCst);
        }
    }

    /// Flush the whole TLB (SFENCE.VMA; ASID-specific invalidation is
    /// implemented as a full flush).
    pub(super) fn flush_tlb(&mut self) {
        trace!("hart {}: TLB flush", self.config.hart_id);
        self.tlb.flush();
    }

    /// Ask every other hart of the machine to flush its TLB too. The guest
    /// ISA does not require this for single-hart boots, but shared page
    /// tables in multi-hart configurations do.
    pub(super) fn broadcast_tlb_flush(&self) {
        if let Some(machine) = self.machine.upgrade() {
            machine.broadcast_tlb_flush(self.config.hart_id);
        }
    }

    /// Fetch one 16-bit instruction parcel at `vaddr` with execute
    /// permission. Executing from device memory is an access fault.
    pub(super) fn fetch_halfword(&mut self, vaddr: u32) -> Result<u16, Exception> {
        let phys = self.translate(vaddr, AccessKind::Execute)?;
        let mut buf = [0u8; 2];
        match self.mem.read(&mut buf, phys) {
            true => Ok(u16::from_le_bytes(buf)),
            false => Err(AccessKind::Execute.access_fault(vaddr)),
        }
    }

    pub fn read_byte(&mut self, vaddr: u32) -> Result<u8, Exception> {
        let mut buf = [0];
        self.read_mem(vaddr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_halfword(&mut self, vaddr: u32) -> Result<u16, Exception> {
        let mut buf = [0; 2];
        self.read_mem(vaddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_word(&mut self, vaddr: u32) -> Result<u32, Exception> {
        let mut buf = [0; 4];
        self.read_mem(vaddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_byte(&mut self, vaddr: u32, value: u8) -> Result<(), Exception> {
        self.write_mem(vaddr, &[value])
    }

    pub fn write_halfword(&mut self, vaddr: u32, value: u16) -> Result<(), Exception> {
        self.write_mem(vaddr, &value.to_le_bytes())
    }

    pub fn write_word(&mut self, vaddr: u32, value: u32) -> Result<(), Exception> {
        self.write_mem(vaddr, &value.to_le_bytes())
    }

    /// Load `buf.len()` bytes from virtual address `vaddr`.
    ///
    /// Misaligned accesses trap; the reference behavior is not to split
    /// them.
    fn read_mem(&mut self, vaddr: u32, buf: &mut [u8]) -> Result<(), Exception> {
        self.check_alignment(vaddr, buf.len(), AccessKind::Read)?;
        let phys = self.translate(vaddr, AccessKind::Read)?;
        if self.mem.read(buf, phys) {
            return Ok(());
        }
        let mmio = self.mmio.read().unwrap();
        mmio.access(phys, buf, Access::Read)
            .map_err(|_| AccessKind::Read.access_fault(vaddr))
    }

    /// Store `buf.len()` bytes to virtual address `vaddr`.
    ///
    /// A store to the word this hart holds an LR reservation on breaks the
    /// reservation.
    fn write_mem(&mut self, vaddr: u32, buf: &[u8]) -> Result<(), Exception> {
        self.check_alignment(vaddr, buf.len(), AccessKind::Write)?;
        let phys = self.translate(vaddr, AccessKind::Write)?;
        if self.reservation == Some(phys & !0b11) {
            self.reservation = None;
        }
        if self.mem.write(phys, buf) {
            return Ok(());
        }
        let mut scratch = [0u8; 8];
        let scratch = &mut scratch[..buf.len()];
        scratch.copy_from_slice(buf);
        let mmio = self.mmio.read().unwrap();
        mmio.access(phys, scratch, Access::Write)
            .map_err(|_| AccessKind::Write.access_fault(vaddr))
    }

    /// LR.W: load the word at `vaddr` and register a reservation on it.
    pub(super) fn load_reserved(&mut self, vaddr: u32) -> Result<u32, Exception> {
        if !Alignment::WORD.is_aligned(vaddr) {
            return Err(Exception::LoadAddressMisaligned(vaddr));
        }
        let phys = self.translate(vaddr, AccessKind::Read)?;
        let word = self
            .mem
            .atomic_word(phys)
            .ok_or(Exception::LoadAccessFault(vaddr))?;
        let value = word.load(Ordering::SeqCst);
        self.reservation = Some(phys);
        Ok(value)
    }

    /// SC.W: store `value` iff the reservation from a previous LR.W still
    /// holds. Returns `0` on success and `1` on failure; the reservation is
    /// consumed either way.
    pub(super) fn store_conditional(&mut self, vaddr: u32, value: u32) -> Result<u32, Exception> {
        if !Alignment::WORD.is_aligned(vaddr) {
            return Err(Exception::StoreOrAmoAddressMisaligned(vaddr));
        }
        let phys = self.translate(vaddr, AccessKind::Write)?;
        match self.reservation.take() {
            Some(reserved) if reserved == phys => {
                let word = self
                    .mem
                    .atomic_word(phys)
                    .ok_or(Exception::StoreOrAmoAccessFault(vaddr))?;
                word.store(value, Ordering::SeqCst);
                Ok(0)
            }
            _ => Ok(1),
        }
    }

    /// Atomically read-modify-write the word at `vaddr`, returning the old
    /// value. AMOs target RAM only; device registers are not atomics.
    pub(super) fn amo_word(
        &mut self,
        vaddr: u32,
        f: impl Fn(u32) -> u32,
    ) -> Result<u32, Exception> {
        if !Alignment::WORD.is_aligned(vaddr) {
            return Err(Exception::StoreOrAmoAddressMisaligned(vaddr));
        }
        let phys = self.translate(vaddr, AccessKind::Write)?;
        // An AMO is a store by this hart; it breaks its own reservation.
        if self.reservation == Some(phys) {
            self.reservation = None;
        }
        let word = self
            .mem
            .atomic_word(phys)
            .ok_or(Exception::StoreOrAmoAccessFault(vaddr))?;
        let mut old = word.load(Ordering::SeqCst);
        loop {
            match word.compare_exchange(old, f(old), Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(old),
                Err(actual) => old = actual,
            }
        }
    }

    fn check_alignment(&self, vaddr: u32, size: usize, kind: AccessKind) -> Result<(), Exception> {
        let aligned = Alignment::natural_for_size(size as u32)
            .map(|alignment| alignment.is_aligned(vaddr))
            .unwrap_or(false);
        match aligned {
            true => Ok(()),
            false => Err(kind.misaligned(vaddr)),
        }
    }
}
