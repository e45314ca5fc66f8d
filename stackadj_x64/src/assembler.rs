//! A small label-resolving assembler over the encoder.

use crate::encoder::{self, Condition, EncodedInst};
use crate::imm;
use crate::registers::{Gpr, MemOperand};
use crate::AsmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// A rel32 field waiting for its label.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    field: usize,
    end: usize,
    label: Label,
}

#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Appends an instruction, returning the offset it starts at.
    pub fn emit(&mut self, inst: EncodedInst) -> usize {
        let start = self.code.len();
        self.code.extend_from_slice(inst.as_slice());
        start
    }

    /// Appends an instruction, returning the absolute offset of its immediate.
    fn emit_imm(&mut self, inst: EncodedInst) -> Result<usize, AsmError> {
        let start = self.emit(inst);
        inst.imm_offset()
            .map(|off| start + off)
            .ok_or(AsmError::NoImmediate { at: start })
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> Result<(), AsmError> {
        let offset = self.code.len();
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or(AsmError::UnknownLabel(label.0))?;
        if slot.is_some() {
            return Err(AsmError::LabelRebound(label.0));
        }
        *slot = Some(offset);
        Ok(())
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    pub fn jmp(&mut self, label: Label) -> Result<(), AsmError> {
        let field = self.emit_imm(encoder::encode_jmp_rel32(0))?;
        self.fixups.push(Fixup { field, end: self.offset(), label });
        Ok(())
    }

    pub fn jcc(&mut self, cond: Condition, label: Label) -> Result<(), AsmError> {
        let field = self.emit_imm(encoder::encode_jcc_rel32(cond, 0))?;
        self.fixups.push(Fixup { field, end: self.offset(), label });
        Ok(())
    }

    /// `cmp reg, imm32`; returns where the immediate lives so it can be
    /// rewritten later.
    pub fn cmp_patchable(&mut self, reg: Gpr, imm: i32) -> Result<usize, AsmError> {
        self.emit_imm(encoder::encode_cmp_ri32(reg, imm))
    }

    /// `mov reg, imm64`; returns the offset of the 8-byte immediate.
    pub fn mov_imm64_hole(&mut self, reg: Gpr, imm: u64) -> Result<usize, AsmError> {
        self.emit_imm(encoder::encode_mov_ri64(reg, imm))
    }

    /// Indirect jump through an inline 8-byte target; returns the offset
    /// of that target.
    pub fn jmp_abs64(&mut self, target: u64) -> Result<usize, AsmError> {
        self.emit_imm(encoder::encode_jmp_abs64(target))
    }

    /// `mov qword [mem], imm32`; returns the offset of the immediate.
    pub fn store_imm32(&mut self, mem: &MemOperand, imm: i32) -> Result<usize, AsmError> {
        self.emit_imm(encoder::encode_mov_mi32(mem, imm))
    }

    /// Resolves all label references and hands back the code.
    pub fn finish(mut self) -> Result<Vec<u8>, AsmError> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self
                .label_offset(fixup.label)
                .ok_or(AsmError::UnboundLabel(fixup.label.0))?;
            let rel = target as i64 - fixup.end as i64;
            let rel = i32::try_from(rel).map_err(|_| AsmError::JumpOutOfRange {
                from: fixup.end,
                to: target,
            })?;
            imm::write_i32(&mut self.code, fixup.field, rel)?;
        }
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_inc;

    #[test]
    fn forward_and_backward_jumps() {
        let mut asm = Assembler::new();
        let top = asm.new_label();
        let out = asm.new_label();
        asm.bind(top).unwrap();
        asm.emit(encode_inc(Gpr::Rcx));
        asm.jcc(Condition::Equal, out).unwrap();
        asm.jmp(top).unwrap();
        asm.bind(out).unwrap();
        let code = asm.finish().unwrap();

        // inc (3) + jcc (6) + jmp (5)
        assert_eq!(code.len(), 14);
        assert_eq!(imm::read_i32(&code, 5).unwrap(), 5);
        assert_eq!(imm::read_i32(&code, 10).unwrap(), -14);
    }

    #[test]
    fn patch_offsets_point_at_immediates() {
        let mut asm = Assembler::new();
        asm.emit(encode_inc(Gpr::Rcx));
        let at = asm.cmp_patchable(Gpr::Rcx, 0x9000).unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(at, 6);
        assert_eq!(imm::read_i32(&code, at).unwrap(), 0x9000);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut asm = Assembler::new();
        let nowhere = asm.new_label();
        asm.jmp(nowhere).unwrap();
        assert!(matches!(asm.finish(), Err(AsmError::UnboundLabel(0))));
    }

    #[test]
    fn rebinding_is_an_error() {
        let mut asm = Assembler::new();
        let l = asm.new_label();
        asm.bind(l).unwrap();
        assert!(matches!(asm.bind(l), Err(AsmError::LabelRebound(0))));
    }
}
