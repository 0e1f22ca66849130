//! General purpose registers of a single hart.

use core::fmt;
use std::fmt::Formatter;

/// The type of a single `x` register.
pub type X = u32;

/// The bit width of the `x` registers.
pub const XLEN: u32 = X::BITS;

/// The number of `x` registers available (indices start at `0` for `x0`)
pub const LEN: u8 = 32;

/// A hart's general purpose registers.
///
/// There are 32 `x` word-size (32 bit) registers, named `x0` up to `x31`.
/// The register `x0` (aka `zero`) is always zero. Writes to it are ignored.
/// There is also the `pc` register which holds the Program Counter (also 32
/// bits).
///
/// It is not possible to get a mutable reference to an `x` register, since
/// that would allow unchecked writes to register `x0`.
#[derive(Debug, Clone)]
pub struct Registers {
    x_registers: [X; LEN as usize],
    pc: u32,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Registers {
    /// Returns a fresh set of all-zero registers with `pc` set to
    /// `initial_pc`.
    pub fn new(initial_pc: u32) -> Self {
        Self {
            x_registers: [0; LEN as usize],
            pc: initial_pc,
        }
    }

    /// Returns the value of an `x` register.
    pub fn x(&self, specifier: Specifier) -> u32 {
        self.x_registers[usize::from(specifier)]
    }

    /// Sets the value of an `x` register.
    ///
    /// Writes to register `x0` are ignored.
    pub fn set_x(&mut self, specifier: Specifier, value: u32) {
        if specifier.0 != 0 {
            self.x_registers[specifier.0 as usize] = value;
        }
    }

    /// Returns the value of the `pc` register.
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Returns a mutable reference to the `pc` register value.
    pub fn pc_mut(&mut self) -> &mut u32 {
        &mut self.pc
    }

    /// Render all registers as a human-readable multi-line dump, four
    /// registers per line, using ABI names.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for specifier in Specifier::iter_all() {
            let _ = write!(
                out,
                "{:<5}: {:#010X}  ",
                specifier.abi_name(),
                self.x(specifier)
            );
            if (u8::from(specifier) + 1) % 4 == 0 {
                out.push('\n');
            }
        }
        let _ = write!(out, "{:<5}: {:#010X}\n", "pc", self.pc);
        out
    }
}

/// An `x` register specifier. Can take values in the range `0..LEN`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Specifier(u8);

impl Specifier {
    /// Register `x0`, a.k.a. register `zero`, always returns `0` on read, and
    /// ignores any writes.
    pub const X0: Self = Specifier(0);

    /// Register `x1`, the standard link register (`ra`).
    pub const X1: Self = Specifier(1);

    /// Register `x2`, the standard stack pointer (`sp`).
    pub const X2: Self = Specifier(2);

    /// Create a register specifier from its index, returning `None` if
    /// `index > 31`.
    pub fn new<U: TryInto<u8>>(index: U) -> Option<Self> {
        let index = index.try_into().ok()?;
        (index < 32).then_some(Self(index))
    }

    /// Convert a 5-bit value into a register specifier.
    /// Panics if the value doesn't fit in 5 bits (`0..=31`).
    pub fn from_u5(value_u5: u8) -> Self {
        const_assert_eq!(LEN, 32);
        if value_u5 > 31 {
            panic!("out of range u5 used");
        }
        Self(value_u5)
    }

    /// Convert a 3-bit value into one of the registers `x8..=x15` addressable
    /// by most compressed instructions.
    /// Panics if the value doesn't fit in 3 bits (`0..=7`).
    pub fn from_c_u3(value_u3: u8) -> Self {
        if value_u3 > 7 {
            panic!("out of range u3 used");
        }
        Self(8 + value_u3)
    }

    /// Return an iterator over all register specifiers, from x0 up to x31.
    pub fn iter_all() -> impl Iterator<Item = Self> {
        (0..32).map(Self)
    }

    /// The standard ABI name of the register.
    pub fn abi_name(self) -> &'static str {
        match self.0 {
            0 => "zero",
            1 => "ra",
            2 => "sp",
            3 => "gp",
            4 => "tp",
            5 => "t0",
            6 => "t1",
            7 => "t2",
            8 => "s0/fp",
            9 => "s1",
            10 => "a0",
            11 => "a1",
            12 => "a2",
            13 => "a3",
            14 => "a4",
            15 => "a5",
            16 => "a6",
            17 => "a7",
            18 => "s2",
            19 => "s3",
            20 => "s4",
            21 => "s5",
            22 => "s6",
            23 => "s7",
            24 => "s8",
            25 => "s9",
            26 => "s10",
            27 => "s11",
            28 => "t3",
            29 => "t4",
            30 => "t5",
            31 => "t6",
            _ => unreachable!(),
        }
    }
}

impl From<Specifier> for u8 {
    fn from(value: Specifier) -> Self {
        value.0
    }
}

impl From<Specifier> for u32 {
    fn from(value: Specifier) -> Self {
        value.0 as u32
    }
}

impl From<Specifier> for usize {
    fn from(value: Specifier) -> Self {
        value.0 as usize
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(32, XLEN);
        const_assert!(LEN > 1);
    }

    #[test]
    fn test_write_to_zero() {
        let mut registers = Registers::default();
        assert_eq!(0, registers.x(Specifier::X0));
        registers.set_x(Specifier::X0, 0xDEADBEEF);
        assert_eq!(0, registers.x(Specifier::X0));
    }

    #[test]
    fn test_write_to_pc() {
        let mut registers = Registers::default();
        assert_eq!(0, registers.pc());
        *registers.pc_mut() = 0xDEADBEEF;
        assert_eq!(0xDEADBEEF, registers.pc());
        assert_eq!(0, registers.x(Specifier::X0));
    }

    #[test]
    fn test_set_x() {
        let mut registers = Registers::default();
        registers.set_x(Specifier::X0, 1);
        for i in 1..LEN {
            registers.set_x(Specifier::from_u5(i), i as u32 + 1);
        }
        assert_eq!(0, registers.x(Specifier::X0));
        for i in 1..LEN {
            assert_eq!(i as u32 + 1, registers.x(Specifier::from_u5(i)));
        }
    }

    #[test]
    fn test_compressed_specifiers() {
        assert_eq!(Specifier::from_u5(8), Specifier::from_c_u3(0));
        assert_eq!(Specifier::from_u5(15), Specifier::from_c_u3(7));
    }

    #[test]
    fn test_abi_names() {
        assert_eq!("zero", Specifier::X0.abi_name());
        assert_eq!("ra", Specifier::X1.abi_name());
        assert_eq!("t6", Specifier::from_u5(31).abi_name());
    }
}
