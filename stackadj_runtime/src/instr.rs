//! Decoded application instructions, as handed over by the framework.

use crate::context::ThreadContext;
use serde::{Deserialize, Serialize};
use stackadj_x64::{Gpr, MemOperand, Scale};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov,
    Lea,
    Leave,
    Xchg,
    Inc,
    Dec,
    Add,
    Sub,
    Ret,
    Enter,
    And,
    Or,
    Push,
    Pop,
    Pushf,
    Popf,
    Call,
    Sysenter,
    Int,
    Int3,
    Into,
    /// Anything else, by the framework's opcode number.
    Other(u16),
}

impl Opcode {
    /// Implicit stack pointer changes through a stack read or write.
    pub fn is_push_or_pop(self) -> bool {
        matches!(
            self,
            Opcode::Push
                | Opcode::Pop
                | Opcode::Pushf
                | Opcode::Popf
                | Opcode::Call
                | Opcode::Ret
                | Opcode::Enter
                | Opcode::Leave
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRef {
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: Scale,
    pub disp: i32,
}

impl MemRef {
    pub fn base_disp(base: Gpr, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: Scale::X1,
            disp,
        }
    }

    pub fn effective_address(&self, ctx: &ThreadContext) -> u64 {
        let base = self.base.map_or(0, |r| ctx.get(r));
        let index = self
            .index
            .map_or(0, |r| ctx.get(r).wrapping_mul(self.scale.factor()));
        base.wrapping_add(index).wrapping_add(self.disp as i64 as u64)
    }

    pub fn to_operand(&self) -> MemOperand {
        MemOperand {
            segment: None,
            base: self.base,
            index: self.index,
            scale: self.scale,
            disp: self.disp,
            rip_relative: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Gpr),
    Imm(i64),
    Mem(MemRef),
}

impl Operand {
    pub fn is_reg(&self, reg: Gpr) -> bool {
        *self == Operand::Reg(reg)
    }

    pub fn imm(&self) -> Option<i64> {
        match *self {
            Operand::Imm(i) => Some(i),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub pc: u64,
    pub opcode: Opcode,
    pub dsts: Vec<Operand>,
    pub srcs: Vec<Operand>,
    /// Whether the arithmetic flags are read before being written after this point.
    pub flags_live: bool,
}

impl Instr {
    pub fn new(pc: u64, opcode: Opcode, dsts: Vec<Operand>, srcs: Vec<Operand>) -> Self {
        Self {
            pc,
            opcode,
            dsts,
            srcs,
            flags_live: true,
        }
    }

    pub fn with_flags_live(mut self, live: bool) -> Self {
        self.flags_live = live;
        self
    }

    pub fn src(&self, i: usize) -> Option<&Operand> {
        self.srcs.get(i)
    }

    pub fn dst(&self, i: usize) -> Option<&Operand> {
        self.dsts.get(i)
    }
}

/// Where an instrumentation site reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgSource {
    Imm(i64),
    Reg(Gpr),
    Load(MemRef),
    /// The effective address itself, as `lea` computes it.
    Address(MemRef),
}

/// An application location for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppLoc {
    pub pc: u64,
}

impl AppLoc {
    pub fn new(pc: u64) -> Self {
        Self { pc }
    }
}

impl fmt::Display for AppLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc {:#x}", self.pc)
    }
}
