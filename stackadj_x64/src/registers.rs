//! x64 register and memory operand definitions.

use std::fmt;

/// x64 general-purpose register, numbered by hardware encoding.
///
/// Bits 0-2 go in ModR/M or the opcode, bit 3 in a REX prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bits 0-2 for ModR/M encoding.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Bit 3, carried in a REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// RSP and R12 share the SIB escape encoding when used as a base.
    #[inline(always)]
    pub const fn needs_sib_as_base(self) -> bool {
        self.low_bits() == 4
    }

    /// RBP and R13 mean [disp32] in mod=00, so they always carry a displacement.
    #[inline(always)]
    pub const fn needs_displacement(self) -> bool {
        self.low_bits() == 5
    }

    pub const fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index scale in a SIB byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Scale {
    X1 = 0,
    X2 = 1,
    X4 = 2,
    X8 = 3,
}

impl Scale {
    pub const fn factor(self) -> u64 {
        1 << (self as u8)
    }
}

/// Segment override prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Fs,
    Gs,
}

impl Segment {
    pub const fn prefix(self) -> u8 {
        match self {
            Segment::Fs => 0x64,
            Segment::Gs => 0x65,
        }
    }
}

/// A memory operand: `seg:[base + index*scale + disp]`, or `[rip + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    pub segment: Option<Segment>,
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: Scale,
    pub disp: i32,
    pub rip_relative: bool,
}

impl MemOperand {
    #[inline]
    pub const fn base(reg: Gpr) -> Self {
        Self::base_disp(reg, 0)
    }

    #[inline]
    pub const fn base_disp(reg: Gpr, disp: i32) -> Self {
        MemOperand {
            segment: None,
            base: Some(reg),
            index: None,
            scale: Scale::X1,
            disp,
            rip_relative: false,
        }
    }

    #[inline]
    pub const fn base_index_disp(base: Gpr, index: Gpr, scale: Scale, disp: i32) -> Self {
        MemOperand {
            segment: None,
            base: Some(base),
            index: Some(index),
            scale,
            disp,
            rip_relative: false,
        }
    }

    /// `[disp32]` with no base or index.
    #[inline]
    pub const fn absolute(disp: i32) -> Self {
        MemOperand {
            segment: None,
            base: None,
            index: None,
            scale: Scale::X1,
            disp,
            rip_relative: false,
        }
    }

    /// `[rip + disp32]`, relative to the end of the instruction.
    #[inline]
    pub const fn rip_relative(disp: i32) -> Self {
        MemOperand {
            segment: None,
            base: None,
            index: None,
            scale: Scale::X1,
            disp,
            rip_relative: true,
        }
    }

    /// A gs-relative thread-local slot.
    #[inline]
    pub const fn gs(disp: i32) -> Self {
        let mut mem = Self::absolute(disp);
        mem.segment = Some(Segment::Gs);
        mem
    }

    #[inline]
    pub const fn disp_fits_i8(&self) -> bool {
        self.disp >= -128 && self.disp <= 127
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(seg) = self.segment {
            let name = match seg {
                Segment::Fs => "fs",
                Segment::Gs => "gs",
            };
            write!(f, "{}:", name)?;
        }
        f.write_str("[")?;
        if self.rip_relative {
            f.write_str("rip")?;
        }
        let mut first = !self.rip_relative;
        if let Some(base) = self.base {
            write!(f, "{}", base)?;
            first = false;
        }
        if let Some(index) = self.index {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{}*{}", index, self.scale.factor())?;
            first = false;
        }
        if first {
            write!(f, "{:#x}", self.disp)?;
        } else if self.disp != 0 {
            write!(f, "{:+#x}", self.disp)?;
        }
        f.write_str("]")
    }
}
