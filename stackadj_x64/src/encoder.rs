//! x64 instruction encoding.
//!
//! Only the forms the stack-adjustment fragments use are provided. Every
//! instruction is encoded into a fixed [`EncodedInst`] buffer:
//!
//! ```text
//! [Segment] [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```

use crate::registers::{Gpr, MemOperand, Scale};

/// REX prefix, `0100WRXB`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    /// For `OP r/m, reg` with both operands registers.
    #[inline]
    pub const fn rr(w: bool, reg: Gpr, rm: Gpr) -> Self {
        Rex {
            w,
            r: reg.high_bit(),
            x: false,
            b: rm.high_bit(),
        }
    }

    /// For `OP /digit` with a register operand.
    #[inline]
    pub const fn digit(w: bool, rm: Gpr) -> Self {
        Rex {
            w,
            r: false,
            x: false,
            b: rm.high_bit(),
        }
    }

    #[inline]
    pub const fn mem(w: bool, reg: u8, mem: &MemOperand) -> Self {
        Rex {
            w,
            r: reg >= 8,
            x: match mem.index {
                Some(idx) => idx.high_bit(),
                None => false,
            },
            b: match mem.base {
                Some(base) => base.high_bit(),
                None => false,
            },
        }
    }

    #[inline]
    pub const fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b
    }

    #[inline]
    pub const fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3) | ((self.r as u8) << 2) | ((self.x as u8) << 1) | (self.b as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mod {
    Indirect = 0b00,
    IndirectDisp8 = 0b01,
    IndirectDisp32 = 0b10,
    Direct = 0b11,
}

#[inline]
pub const fn modrm(mod_: Mod, reg: u8, rm: u8) -> u8 {
    ((mod_ as u8) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

#[inline]
pub const fn sib(scale: Scale, index: u8, base: u8) -> u8 {
    ((scale as u8) << 6) | ((index & 0x7) << 3) | (base & 0x7)
}

pub const MAX_INST_LEN: usize = 15;

/// One encoded instruction.
///
/// `imm_offset` is the position of the trailing immediate, if the
/// instruction has one the caller may want to patch later.
#[derive(Debug, Clone, Copy)]
pub struct EncodedInst {
    bytes: [u8; MAX_INST_LEN],
    len: u8,
    imm_offset: Option<u8>,
}

impl EncodedInst {
    #[inline]
    pub const fn new() -> Self {
        EncodedInst {
            bytes: [0; MAX_INST_LEN],
            len: 0,
            imm_offset: None,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset within this instruction of its immediate (or rel32) field.
    #[inline]
    pub fn imm_offset(&self) -> Option<usize> {
        self.imm_offset.map(usize::from)
    }

    #[inline]
    fn push(&mut self, byte: u8) {
        debug_assert!((self.len as usize) < MAX_INST_LEN);
        self.bytes[self.len as usize] = byte;
        self.len += 1;
    }

    #[inline]
    fn mark_imm(&mut self) {
        self.imm_offset = Some(self.len);
    }

    #[inline]
    fn push_u32(&mut self, val: u32) {
        for b in val.to_le_bytes() {
            self.push(b);
        }
    }

    #[inline]
    fn push_u64(&mut self, val: u64) {
        for b in val.to_le_bytes() {
            self.push(b);
        }
    }

    #[inline]
    fn push_rex(&mut self, rex: Rex) {
        if rex.is_needed() {
            self.push(rex.encode());
        }
    }
}

impl Default for EncodedInst {
    fn default() -> Self {
        Self::new()
    }
}

/// `OP r/m64, r64` with a register destination.
#[inline]
pub fn encode_rr(opcode: u8, dst: Gpr, src: Gpr, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push_rex(Rex::rr(w, src, dst));
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, src.low_bits(), dst.low_bits()));
    enc
}

/// `OP r/m64, imm8` in the `/digit` form.
#[inline]
pub fn encode_ri8(opcode: u8, digit: u8, dst: Gpr, imm: i8, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push_rex(Rex::digit(w, dst));
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
    enc.mark_imm();
    enc.push(imm as u8);
    enc
}

/// `OP r/m64, imm32` in the `/digit` form.
#[inline]
pub fn encode_ri32(opcode: u8, digit: u8, dst: Gpr, imm: i32, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push_rex(Rex::digit(w, dst));
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
    enc.mark_imm();
    enc.push_u32(imm as u32);
    enc
}

/// `OP /digit` with no immediate (neg, inc, dec, jmp r/m).
#[inline]
pub fn encode_r_digit(opcode: u8, digit: u8, dst: Gpr, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push_rex(Rex::digit(w, dst));
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
    enc
}

/// `OP reg, [mem]` or `OP [mem], reg`. `reg` may be a register number or a
/// `/digit` opcode extension.
#[inline]
pub fn encode_mem(opcode: u8, reg: u8, mem: &MemOperand, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    if let Some(seg) = mem.segment {
        enc.push(seg.prefix());
    }
    enc.push_rex(Rex::mem(w, reg, mem));
    enc.push(opcode);
    encode_modrm_sib_disp(&mut enc, reg, mem);
    enc
}

#[inline]
pub fn encode_rm(opcode: u8, reg: Gpr, mem: &MemOperand, w: bool) -> EncodedInst {
    encode_mem(opcode, reg.encoding(), mem, w)
}

fn encode_modrm_sib_disp(enc: &mut EncodedInst, reg: u8, mem: &MemOperand) {
    match (mem.base, mem.index) {
        (None, None) if mem.rip_relative => {
            enc.push(modrm(Mod::Indirect, reg, 0b101));
            enc.push_u32(mem.disp as u32);
        }

        // [disp32] needs the SIB no-base no-index form in 64-bit mode,
        // rm=101 alone would mean rip-relative.
        (None, None) => {
            enc.push(modrm(Mod::Indirect, reg, 0b100));
            enc.push(sib(Scale::X1, 0b100, 0b101));
            enc.push_u32(mem.disp as u32);
        }

        (Some(base), None) => {
            let mod_field = if mem.disp == 0 && !base.needs_displacement() {
                Mod::Indirect
            } else if mem.disp_fits_i8() {
                Mod::IndirectDisp8
            } else {
                Mod::IndirectDisp32
            };

            if base.needs_sib_as_base() {
                enc.push(modrm(mod_field, reg, 0b100));
                enc.push(sib(Scale::X1, 0b100, base.low_bits()));
            } else {
                enc.push(modrm(mod_field, reg, base.low_bits()));
            }
            push_disp(enc, mod_field, mem.disp);
        }

        (Some(base), Some(index)) => {
            debug_assert!(index != Gpr::Rsp, "rsp cannot be an index");
            let mod_field = if mem.disp == 0 && !base.needs_displacement() {
                Mod::Indirect
            } else if mem.disp_fits_i8() {
                Mod::IndirectDisp8
            } else {
                Mod::IndirectDisp32
            };
            enc.push(modrm(mod_field, reg, 0b100));
            enc.push(sib(mem.scale, index.low_bits(), base.low_bits()));
            push_disp(enc, mod_field, mem.disp);
        }

        (None, Some(index)) => {
            debug_assert!(index != Gpr::Rsp, "rsp cannot be an index");
            enc.push(modrm(Mod::Indirect, reg, 0b100));
            enc.push(sib(mem.scale, index.low_bits(), 0b101));
            enc.push_u32(mem.disp as u32);
        }
    }
}

#[inline]
fn push_disp(enc: &mut EncodedInst, mod_field: Mod, disp: i32) {
    match mod_field {
        Mod::IndirectDisp8 => enc.push(disp as i8 as u8),
        Mod::IndirectDisp32 => enc.push_u32(disp as u32),
        _ => {}
    }
}

// moves

#[inline]
pub fn encode_mov_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x89, dst, src, true)
}

/// MOV r64, [mem]
#[inline]
pub fn encode_mov_rm(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm(0x8B, dst, mem, true)
}

/// MOV [mem], r64
#[inline]
pub fn encode_mov_mr(mem: &MemOperand, src: Gpr) -> EncodedInst {
    encode_rm(0x89, src, mem, true)
}

/// MOV qword [mem], imm32 (sign-extended)
#[inline]
pub fn encode_mov_mi32(mem: &MemOperand, imm: i32) -> EncodedInst {
    let mut enc = encode_mem(0xC7, 0, mem, true);
    enc.mark_imm();
    enc.push_u32(imm as u32);
    enc
}

/// MOV byte [mem], imm8
#[inline]
pub fn encode_mov_mi8(mem: &MemOperand, imm: u8) -> EncodedInst {
    let mut enc = encode_mem(0xC6, 0, mem, false);
    enc.mark_imm();
    enc.push(imm);
    enc
}

/// MOV r64, imm32 (sign-extended, REX.W C7 /0)
#[inline]
pub fn encode_mov_ri32_sx(dst: Gpr, imm: i32) -> EncodedInst {
    encode_ri32(0xC7, 0, dst, imm, true)
}

/// MOV r64, imm64 (REX.W B8+r)
#[inline]
pub fn encode_mov_ri64(dst: Gpr, imm: u64) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(Rex::digit(true, dst).encode());
    enc.push(0xB8 + dst.low_bits());
    enc.mark_imm();
    enc.push_u64(imm);
    enc
}

#[inline]
pub fn encode_lea(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm(0x8D, dst, mem, true)
}

// arithmetic

#[inline]
pub fn encode_add_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x01, dst, src, true)
}

/// ADD r64, imm using the short form when the immediate fits.
#[inline]
pub fn encode_add_ri(dst: Gpr, imm: i32) -> EncodedInst {
    match i8::try_from(imm) {
        Ok(imm8) => encode_ri8(0x83, 0, dst, imm8, true),
        Err(_) => encode_ri32(0x81, 0, dst, imm, true),
    }
}

/// ADD r64, [mem]
#[inline]
pub fn encode_add_rm(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm(0x03, dst, mem, true)
}

#[inline]
pub fn encode_sub_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x29, dst, src, true)
}

#[inline]
pub fn encode_and_ri(dst: Gpr, imm: i32) -> EncodedInst {
    match i8::try_from(imm) {
        Ok(imm8) => encode_ri8(0x83, 4, dst, imm8, true),
        Err(_) => encode_ri32(0x81, 4, dst, imm, true),
    }
}

#[inline]
pub fn encode_neg(dst: Gpr) -> EncodedInst {
    encode_r_digit(0xF7, 3, dst, true)
}

/// NOT r64. Unlike NEG it leaves the flags alone.
#[inline]
pub fn encode_not(dst: Gpr) -> EncodedInst {
    encode_r_digit(0xF7, 2, dst, true)
}

#[inline]
pub fn encode_inc(dst: Gpr) -> EncodedInst {
    encode_r_digit(0xFF, 0, dst, true)
}

#[inline]
pub fn encode_dec(dst: Gpr) -> EncodedInst {
    encode_r_digit(0xFF, 1, dst, true)
}

/// INC qword [mem]
#[inline]
pub fn encode_inc_m(mem: &MemOperand) -> EncodedInst {
    encode_mem(0xFF, 0, mem, true)
}

#[inline]
pub fn encode_shl_ri(dst: Gpr, imm: u8) -> EncodedInst {
    encode_ri8(0xC1, 4, dst, imm as i8, true)
}

#[inline]
pub fn encode_shr_ri(dst: Gpr, imm: u8) -> EncodedInst {
    encode_ri8(0xC1, 5, dst, imm as i8, true)
}

// comparisons

#[inline]
pub fn encode_cmp_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x39, dst, src, true)
}

/// CMP r64, imm32, always in the four-byte form so the immediate can be
/// rewritten in place with any value.
#[inline]
pub fn encode_cmp_ri32(dst: Gpr, imm: i32) -> EncodedInst {
    encode_ri32(0x81, 7, dst, imm, true)
}

#[inline]
pub fn encode_test_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x85, dst, src, true)
}

#[inline]
pub fn encode_test_ri32(dst: Gpr, imm: i32) -> EncodedInst {
    encode_ri32(0xF7, 0, dst, imm, true)
}

// flags

/// LAHF: AH <- SF:ZF:0:AF:0:PF:1:CF
#[inline]
pub fn encode_lahf() -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x9F);
    enc
}

#[inline]
pub fn encode_sahf() -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x9E);
    enc
}

/// SETO al
#[inline]
pub fn encode_seto_al() -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x0F);
    enc.push(0x90);
    enc.push(modrm(Mod::Direct, 0, Gpr::Rax.low_bits()));
    enc
}

/// ADD al, imm8
#[inline]
pub fn encode_add_al_i8(imm: u8) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x04);
    enc.mark_imm();
    enc.push(imm);
    enc
}

// control flow

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x0,
    NoOverflow = 0x1,
    Below = 0x2,
    AboveEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NoSign = 0x9,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

#[inline]
pub fn encode_jmp_rel32(offset: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0xE9);
    enc.mark_imm();
    enc.push_u32(offset as u32);
    enc
}

#[inline]
pub fn encode_jcc_rel32(cond: Condition, offset: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x0F);
    enc.push(0x80 + cond as u8);
    enc.mark_imm();
    enc.push_u32(offset as u32);
    enc
}

/// JMP qword [mem]
#[inline]
pub fn encode_jmp_m(mem: &MemOperand) -> EncodedInst {
    encode_mem(0xFF, 4, mem, false)
}

/// `jmp qword [rip+0]` followed by the 8-byte target, reaching anywhere in
/// the address space without a scratch register.
#[inline]
pub fn encode_jmp_abs64(target: u64) -> EncodedInst {
    let mut enc = encode_jmp_m(&MemOperand::rip_relative(0));
    enc.mark_imm();
    enc.push_u64(target);
    enc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_forms() {
        assert_eq!(encode_mov_rr(Gpr::Rcx, Gpr::Rdx).as_slice(), &[0x48, 0x89, 0xD1]);
        assert_eq!(encode_neg(Gpr::Rcx).as_slice(), &[0x48, 0xF7, 0xD9]);
        assert_eq!(encode_add_ri(Gpr::Rdx, 8).as_slice(), &[0x48, 0x83, 0xC2, 0x08]);
        assert_eq!(encode_shr_ri(Gpr::Rbx, 16).as_slice(), &[0x48, 0xC1, 0xEB, 0x10]);
        assert_eq!(encode_inc(Gpr::R9).as_slice(), &[0x49, 0xFF, 0xC1]);
    }

    #[test]
    fn patchable_compare_keeps_imm32() {
        let enc = encode_cmp_ri32(Gpr::Rcx, 0x9000);
        assert_eq!(enc.as_slice(), &[0x48, 0x81, 0xF9, 0x00, 0x90, 0x00, 0x00]);
        assert_eq!(enc.imm_offset(), Some(3));

        // small values must not shrink to the imm8 form
        let small = encode_cmp_ri32(Gpr::Rcx, 4);
        assert_eq!(small.len(), 7);
    }

    #[test]
    fn gs_slot_uses_sib_absolute() {
        let enc = encode_mov_mr(&MemOperand::gs(0x48), Gpr::Rcx);
        assert_eq!(
            enc.as_slice(),
            &[0x65, 0x48, 0x89, 0x0C, 0x25, 0x48, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn memory_bases() {
        assert_eq!(
            encode_mov_rm(Gpr::Rax, &MemOperand::base(Gpr::Rsp)).as_slice(),
            &[0x48, 0x8B, 0x04, 0x24]
        );
        assert_eq!(
            encode_mov_rm(Gpr::Rax, &MemOperand::base(Gpr::Rbp)).as_slice(),
            &[0x48, 0x8B, 0x45, 0x00]
        );
        assert_eq!(
            encode_mov_mi8(&MemOperand::base(Gpr::R13), 0x55).as_slice(),
            &[0x41, 0xC6, 0x45, 0x00, 0x55]
        );
    }

    #[test]
    fn absolute_indirect_jump() {
        let enc = encode_jmp_abs64(0x1122_3344_5566_7788);
        assert_eq!(enc.len(), 14);
        assert_eq!(&enc.as_slice()[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(enc.imm_offset(), Some(6));
        assert_eq!(enc.as_slice()[6], 0x88);
    }

    #[test]
    fn flag_save_sequence() {
        assert_eq!(encode_seto_al().as_slice(), &[0x0F, 0x90, 0xC0]);
        assert_eq!(encode_add_al_i8(0x7F).as_slice(), &[0x04, 0x7F]);
    }
}
