//! Deciding which stack pointer writes need tracking, and how.

use crate::instr::{ArgSource, Instr, Opcode, Operand};
use stackadj_types::kind::{AdjustmentKind, TrackingMode};
use stackadj_x64::Gpr;

pub fn classify(opcode: Opcode, srcs: &[Operand]) -> AdjustmentKind {
    let first = srcs.first();
    match opcode {
        Opcode::Mov => match first {
            Some(Operand::Reg(_)) | Some(Operand::Mem(_)) => AdjustmentKind::AbsoluteSet,
            _ => AdjustmentKind::NotApplicable,
        },
        Opcode::Leave | Opcode::Lea | Opcode::Xchg => AdjustmentKind::AbsoluteSet,
        Opcode::Inc | Opcode::Add => AdjustmentKind::RelativeIncrease,
        Opcode::Dec | Opcode::Sub | Opcode::Enter => AdjustmentKind::RelativeDecrease,
        Opcode::Ret if first.and_then(Operand::imm).is_some() => AdjustmentKind::PostPopImmediate,
        Opcode::And => AdjustmentKind::MaskAnd,
        _ => AdjustmentKind::NotApplicable,
    }
}

pub fn writes_sp(instr: &Instr) -> bool {
    instr.dsts.iter().any(|d| d.is_reg(Gpr::Rsp))
}

/// Whether an instruction already known to write the stack pointer needs an
/// adjustment site. Pushes and pops are handled as the stack writes and reads
/// they are.
pub fn needs_instrumentation(instr: &Instr, mode: TrackingMode) -> bool {
    let op = instr.opcode;
    let first_imm = instr.src(0).and_then(Operand::imm);

    if op.is_push_or_pop()
        && !(op == Opcode::Ret && first_imm.is_some())
        && op != Opcode::Enter
        && op != Opcode::Leave
    {
        return false;
    }

    // without shadowing only growth matters; leave is assumed to shrink
    if mode == TrackingMode::Lightweight {
        let shrinks = match op {
            Opcode::Inc | Opcode::Ret | Opcode::Leave => true,
            Opcode::Add => first_imm.map_or(false, |i| i >= 0),
            Opcode::Sub => first_imm.map_or(false, |i| i <= 0),
            _ => false,
        };
        if shrinks {
            return false;
        }
    }

    if matches!(op, Opcode::Sysenter | Opcode::Int | Opcode::Int3 | Opcode::Into) {
        return false;
    }

    if op == Opcode::Or
        && instr.src(0).map_or(false, |s| s.is_reg(Gpr::Rsp))
        && instr.dst(0).map_or(false, |d| d.is_reg(Gpr::Rsp))
    {
        return false;
    }

    true
}

/// The value an adjustment site loads, before any negation.
pub fn site_operand(instr: &Instr) -> Option<ArgSource> {
    match instr.opcode {
        Opcode::Inc | Opcode::Dec => Some(ArgSource::Imm(1)),
        Opcode::Leave => Some(ArgSource::Reg(Gpr::Rbp)),
        Opcode::Xchg => instr
            .srcs
            .iter()
            .find(|s| !s.is_reg(Gpr::Rsp))
            .map(|&s| operand_source(s)),
        Opcode::Lea => match instr.src(0) {
            Some(&Operand::Mem(m)) => Some(ArgSource::Address(m)),
            _ => None,
        },
        _ => instr.src(0).map(|&s| operand_source(s)),
    }
}

fn operand_source(op: Operand) -> ArgSource {
    match op {
        Operand::Reg(r) => ArgSource::Reg(r),
        Operand::Imm(i) => ArgSource::Imm(i),
        Operand::Mem(m) => ArgSource::Load(m),
    }
}
