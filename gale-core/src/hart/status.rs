use bitvec::{field::BitField, order::Lsb0, view::BitView};

use crate::{PrivilegeLevel, RawPrivilegeLevel};

// Mask of the mstatus bits that appear in the sstatus view:
// SIE, SPIE, SPP, SUM, MXR.
const SSTATUS_MASK: u32 = 0x000C_0122;

// Mask of the mstatus bits this implementation gives a meaning:
// SIE, MIE, SPIE, MPIE, SPP, MPP, MPRV, SUM, MXR.
const WRITABLE_MASK: u32 = 0x000E_19AA;

/// Provides the mstatus register and its restricted sstatus view.
///
/// > The mstatus register is an MXLEN-bit read/write register [...]. The
/// > mstatus register keeps track of and controls the hart's current
/// > operating state. A restricted view of mstatus appears as the sstatus
/// > register in the S-level ISA.
#[derive(Debug, Clone)]
pub struct Status {
    mstatus: u32,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            mstatus: 0x0000_0000,
        }
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MIE]
    }

    /// Sets the MIE (M-mode Interrupt Enable) bit to `value`.
    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    /// Returns `true` if the SIE (S-mode Interrupt Enable) bit is set.
    pub fn sie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SIE]
    }

    /// Sets the SIE (S-mode Interrupt Enable) bit to `value`.
    pub fn set_sie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SIE, value);
    }

    /// Returns `true` if the global interrupt-enable bit for `mode` is set.
    pub fn xie(&self, mode: PrivilegeLevel) -> bool {
        match mode {
            PrivilegeLevel::User => true,
            PrivilegeLevel::Supervisor => self.sie(),
            PrivilegeLevel::Machine => self.mie(),
        }
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is
    /// set.
    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPIE]
    }

    /// Sets the MPIE (M-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    /// Returns `true` if the SPIE (S-mode Previous Interrupt Enable) bit is
    /// set.
    pub fn spie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SPIE]
    }

    /// Sets the SPIE (S-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_spie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPIE, value);
    }

    /// Returns the privilege level encoded by the MPP (M-mode Previous
    /// Privilege level) field.
    ///
    /// The MPP field is **WARL**.
    pub fn mpp(&self) -> PrivilegeLevel {
        RawPrivilegeLevel::from_u2(
            self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le(),
        )
        .try_into()
        .unwrap()
    }

    /// Sets the privilege level encoded by the MPP (M-mode Previous
    /// Privilege level) field to `value`.
    ///
    /// The MPP field is **WARL**.
    pub fn set_mpp(&mut self, value: RawPrivilegeLevel) {
        let Ok(value) = PrivilegeLevel::try_from(value) else {
            // MPP is a WARL field, so ignore illegal values.
            return;
        };
        self.mstatus.view_bits_mut::<Lsb0>()[idx::MPP..(idx::MPP + 2)].store_le(value as u8);
    }

    /// Returns the privilege level encoded by the SPP (S-mode Previous
    /// Privilege level) field.
    pub fn spp(&self) -> PrivilegeLevel {
        match self.mstatus.view_bits::<Lsb0>()[idx::SPP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    /// Sets the privilege level encoded by the SPP (S-mode Previous
    /// Privilege level) field to `value`.
    ///
    /// The SPP field is **WARL**.
    pub fn set_spp(&mut self, value: RawPrivilegeLevel) {
        match PrivilegeLevel::try_from(value) {
            Ok(value) if value <= PrivilegeLevel::Supervisor => {
                let bit = value as u8 != 0;
                self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPP, bit);
            }
            _ => {} // SPP is a WARL field, so ignore illegal values.
        };
    }

    /// Returns `true` if the MPRV (Modify PRiVilege) bit is set.
    pub fn mprv(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPRV]
    }

    /// Returns `true` if the MXR (Make eXecutable Readable) bit is set.
    pub fn mxr(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MXR]
    }

    /// Returns `true` if the SUM (permit Supervisor User Memory access) bit
    /// is set.
    pub fn sum(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SUM]
    }

    pub fn read_mstatus(&self) -> u32 {
        self.mstatus
    }

    /// Writes the masked bits of `value` to mstatus, ignoring unimplemented
    /// fields and illegal WARL values.
    pub fn write_mstatus(&mut self, value: u32, mask: u32) {
        let mask = mask & WRITABLE_MASK;
        let new = self.mstatus & !mask | value & mask;
        // MPP is the only multi-bit WARL field; refuse the reserved level.
        let mpp = (new >> idx::MPP) & 0b11;
        self.mstatus = match mpp {
            2 => new & !(0b11 << idx::MPP) | self.mstatus & (0b11 << idx::MPP),
            _ => new,
        };
    }

    pub fn read_sstatus(&self) -> u32 {
        self.mstatus & SSTATUS_MASK
    }

    /// Writes the masked bits of `value` to the sstatus view of mstatus.
    pub fn write_sstatus(&mut self, value: u32, mask: u32) {
        self.write_mstatus(value, mask & SSTATUS_MASK);
    }
}

mod idx {
    //! Bit indices of the mstatus fields.
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
    pub const MPRV: usize = 17;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
}
