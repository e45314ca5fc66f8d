//! Lowering steps to x86-64.
//!
//! Emitted code never touches the application stack: scratch state lives in
//! gs-relative slots and control returns through an indirect jump.

use super::step::{FragmentStep, SiteStep, SlowTarget, GROW_STATE, SHRINK_STATE};
use super::{Reloc, RelocTarget};
use crate::error::FatalError;
use crate::instr::ArgSource;
use stackadj_types::kind::FlagsLiveness;
use stackadj_types::layout::{
    tls_slot_disp, GRANULE_SHIFT, GRANULE_SIZE, SHADOW_BLOCK_SHIFT, SHADOW_BLOCK_SPAN, SLOT_ARG,
    SLOT_FASTPATH_HITS, SLOT_FLAGS, SLOT_RETADDR, SLOT_SHADOW_TABLE, SLOT_SPILL_RAX,
    SLOT_SPILL_RBX, SLOT_SPILL_RCX, SLOT_SPILL_RDX, SLOT_TAG,
};
use stackadj_types::shadow::ShadowState;
use stackadj_x64::encoder::*;
use stackadj_x64::{Assembler, Condition, Gpr, Label, MemOperand, Scale};

#[inline]
fn slot(i: usize) -> MemOperand {
    MemOperand::gs(tls_slot_disp(i))
}

// lahf/seto leave SF ZF AF PF CF in ah and OF in al
fn save_flags(asm: &mut Assembler) {
    asm.emit(encode_lahf());
    asm.emit(encode_seto_al());
    asm.emit(encode_mov_mr(&slot(SLOT_FLAGS), Gpr::Rax));
}

fn restore_flags(asm: &mut Assembler) {
    asm.emit(encode_mov_rm(Gpr::Rax, &slot(SLOT_FLAGS)));
    // al=1 overflows to 0x80, setting OF again
    asm.emit(encode_add_al_i8(0x7F));
    asm.emit(encode_sahf());
}

fn restore_work_regs(asm: &mut Assembler, flags: FlagsLiveness) {
    if flags.is_live() {
        restore_flags(asm);
    }
    asm.emit(encode_mov_rm(Gpr::Rax, &slot(SLOT_SPILL_RAX)));
    asm.emit(encode_mov_rm(Gpr::Rbx, &slot(SLOT_SPILL_RBX)));
}

struct FragmentLowerer<'a> {
    asm: &'a mut Assembler,
    slow: Label,
    slow_path: Option<Label>,
    trampoline: u64,
    threshold: i32,
    threshold_sites: Vec<usize>,
}

/// Lowers one shared fragment, returning the offsets of its threshold
/// immediates in emission order (+threshold, then -threshold).
pub(crate) fn lower_fragment(
    asm: &mut Assembler,
    steps: &[FragmentStep],
    slow_path: Option<Label>,
    trampoline: u64,
    threshold: i32,
) -> Result<Vec<usize>, FatalError> {
    let slow = asm.new_label();
    let mut lowerer = FragmentLowerer {
        asm,
        slow,
        slow_path,
        trampoline,
        threshold,
        threshold_sites: Vec::new(),
    };
    for step in steps {
        lowerer.step(*step)?;
    }
    Ok(lowerer.threshold_sites)
}

impl FragmentLowerer<'_> {
    fn step(&mut self, step: FragmentStep) -> Result<(), FatalError> {
        let asm = &mut *self.asm;
        match step {
            FragmentStep::Enter { flags } => {
                asm.emit(encode_mov_mr(&slot(SLOT_ARG), Gpr::Rcx));
                asm.emit(encode_mov_mr(&slot(SLOT_RETADDR), Gpr::Rdx));
                asm.emit(encode_mov_mr(&slot(SLOT_SPILL_RBX), Gpr::Rbx));
                asm.emit(encode_mov_mr(&slot(SLOT_SPILL_RAX), Gpr::Rax));
                if flags.is_live() {
                    save_flags(asm);
                }
            }
            FragmentStep::LoadSp { bias } => {
                if bias == 0 {
                    asm.emit(encode_mov_rr(Gpr::Rdx, Gpr::Rsp));
                } else {
                    asm.emit(encode_lea(Gpr::Rdx, &MemOperand::base_disp(Gpr::Rsp, bias)));
                }
            }
            FragmentStep::DeltaFromTarget => {
                asm.emit(encode_sub_rr(Gpr::Rcx, Gpr::Rdx));
            }
            FragmentStep::ThresholdCheck => {
                let above = asm.cmp_patchable(Gpr::Rcx, self.threshold)?;
                asm.jcc(Condition::Greater, self.slow)?;
                let below = asm.cmp_patchable(Gpr::Rcx, -self.threshold)?;
                asm.jcc(Condition::Less, self.slow)?;
                self.threshold_sites.push(above);
                self.threshold_sites.push(below);
            }
            FragmentStep::AlignmentCheck => {
                let mask = (GRANULE_SIZE - 1) as i32;
                asm.emit(encode_test_ri32(Gpr::Rcx, mask));
                asm.jcc(Condition::NotEqual, self.slow)?;
                asm.emit(encode_test_ri32(Gpr::Rdx, mask));
                asm.jcc(Condition::NotEqual, self.slow)?;
            }
            FragmentStep::WalkShadow => self.walk_shadow()?,
            FragmentStep::CountHit => {
                asm.emit(encode_inc_m(&slot(SLOT_FASTPATH_HITS)));
            }
            FragmentStep::Leave { flags } => {
                restore_work_regs(asm, flags);
                asm.emit(encode_jmp_m(&slot(SLOT_RETADDR)));
            }
            FragmentStep::SlowExit { tag, flags, target } => {
                asm.bind(self.slow)?;
                restore_work_regs(asm, flags);
                asm.store_imm32(&slot(SLOT_TAG), tag as i32)?;
                asm.emit(encode_mov_rm(Gpr::Rcx, &slot(SLOT_ARG)));
                asm.emit(encode_mov_rm(Gpr::Rdx, &slot(SLOT_RETADDR)));
                match target {
                    SlowTarget::SharedSlowPath => {
                        let entry = self.slow_path.ok_or(FatalError::MissingFragment)?;
                        asm.jmp(entry)?;
                    }
                    SlowTarget::CleanCall => {
                        asm.jmp_abs64(self.trampoline)?;
                    }
                }
            }
            FragmentStep::SlowEntry => {
                asm.emit(encode_mov_mr(&slot(SLOT_ARG), Gpr::Rcx));
                asm.emit(encode_mov_mr(&slot(SLOT_RETADDR), Gpr::Rdx));
            }
            FragmentStep::CleanCall => {
                asm.jmp_abs64(self.trampoline)?;
            }
        }
        Ok(())
    }

    /// rdx = sp, rcx = signed delta. Growth walks up from sp + delta, shrink
    /// from sp; either way rcx becomes a granule count.
    fn walk_shadow(&mut self) -> Result<(), FatalError> {
        let done = self.asm.new_label();
        let grow = self.asm.new_label();

        self.asm.emit(encode_test_rr(Gpr::Rcx, Gpr::Rcx));
        self.asm.jcc(Condition::Equal, done)?;
        self.asm.jcc(Condition::Sign, grow)?;

        self.asm.emit(encode_shr_ri(Gpr::Rcx, GRANULE_SHIFT as u8));
        self.walk_granules(SHRINK_STATE)?;
        self.asm.jmp(done)?;

        self.asm.bind(grow)?;
        self.asm.emit(encode_add_rr(Gpr::Rdx, Gpr::Rcx));
        self.asm.emit(encode_neg(Gpr::Rcx));
        self.asm.emit(encode_shr_ri(Gpr::Rcx, GRANULE_SHIFT as u8));
        self.walk_granules(GROW_STATE)?;

        self.asm.bind(done)?;
        Ok(())
    }

    // rdx cursor, rcx granules left, rbx cell pointer, rax scratch
    fn walk_granules(&mut self, state: ShadowState) -> Result<(), FatalError> {
        let asm = &mut *self.asm;
        let block = asm.new_label();
        let cell = asm.new_label();
        let end = asm.new_label();

        asm.bind(block)?;
        asm.emit(encode_mov_rr(Gpr::Rbx, Gpr::Rdx));
        asm.emit(encode_shr_ri(Gpr::Rbx, SHADOW_BLOCK_SHIFT));
        asm.emit(encode_shl_ri(Gpr::Rbx, 3));
        asm.emit(encode_add_rm(Gpr::Rbx, &slot(SLOT_SHADOW_TABLE)));
        asm.emit(encode_mov_rm(Gpr::Rbx, &MemOperand::base(Gpr::Rbx)));
        asm.emit(encode_test_rr(Gpr::Rbx, Gpr::Rbx));
        asm.jcc(Condition::Equal, self.slow)?;
        asm.emit(encode_mov_rr(Gpr::Rax, Gpr::Rdx));
        asm.emit(encode_and_ri(Gpr::Rax, (SHADOW_BLOCK_SPAN - 1) as i32));
        asm.emit(encode_shr_ri(Gpr::Rax, GRANULE_SHIFT as u8));
        asm.emit(encode_add_rr(Gpr::Rbx, Gpr::Rax));

        asm.bind(cell)?;
        asm.emit(encode_mov_mi8(&MemOperand::base(Gpr::Rbx), state.as_byte()));
        asm.emit(encode_inc(Gpr::Rbx));
        asm.emit(encode_add_ri(Gpr::Rdx, GRANULE_SIZE as i32));
        asm.emit(encode_dec(Gpr::Rcx));
        asm.jcc(Condition::Equal, end)?;
        // still inside the block?
        asm.emit(encode_test_ri32(Gpr::Rdx, (SHADOW_BLOCK_SPAN - 1) as i32));
        asm.jcc(Condition::NotEqual, cell)?;
        asm.jmp(block)?;

        asm.bind(end)?;
        Ok(())
    }
}

/// Lowers an inline site, returning the 8-byte holes to fill at link time.
pub(crate) fn lower_site(asm: &mut Assembler, steps: &[SiteStep]) -> Result<Vec<Reloc>, FatalError> {
    let mut relocs = Vec::new();
    for step in steps {
        match *step {
            SiteStep::Spill => {
                asm.emit(encode_mov_mr(&slot(SLOT_SPILL_RCX), Gpr::Rcx));
                asm.emit(encode_mov_mr(&slot(SLOT_SPILL_RDX), Gpr::Rdx));
            }
            SiteStep::LoadValue { src, negate } => {
                load_value(asm, src);
                if negate {
                    // -x == !x + 1, without touching the flags
                    asm.emit(encode_not(Gpr::Rcx));
                    asm.emit(encode_lea(Gpr::Rcx, &MemOperand::base_disp(Gpr::Rcx, 1)));
                }
            }
            SiteStep::ZeroFill { flags } => zero_fill(asm, flags)?,
            SiteStep::CallFragment(id) => {
                call_out(asm, RelocTarget::Fragment(id), &mut relocs)?;
            }
            SiteStep::CallSlowPath { tag } => {
                asm.store_imm32(&slot(SLOT_TAG), tag as i32)?;
                call_out(asm, RelocTarget::SlowPath, &mut relocs)?;
            }
            SiteStep::CleanCall { tag } => {
                asm.store_imm32(&slot(SLOT_TAG), tag as i32)?;
                asm.emit(encode_mov_mr(&slot(SLOT_ARG), Gpr::Rcx));
                let resume = asm.mov_imm64_hole(Gpr::Rdx, 0)?;
                asm.emit(encode_mov_mr(&slot(SLOT_RETADDR), Gpr::Rdx));
                let jump = asm.jmp_abs64(0)?;
                relocs.push(Reloc { at: jump, target: RelocTarget::CleanCall });
                relocs.push(Reloc { at: resume, target: RelocTarget::SiteResume(asm.offset()) });
            }
            SiteStep::Reload => {
                asm.emit(encode_mov_rm(Gpr::Rcx, &slot(SLOT_SPILL_RCX)));
                asm.emit(encode_mov_rm(Gpr::Rdx, &slot(SLOT_SPILL_RDX)));
            }
        }
    }
    Ok(relocs)
}

fn load_value(asm: &mut Assembler, src: ArgSource) {
    let inst = match src {
        ArgSource::Imm(i) => match i32::try_from(i) {
            Ok(imm) => encode_mov_ri32_sx(Gpr::Rcx, imm),
            Err(_) => encode_mov_ri64(Gpr::Rcx, i as u64),
        },
        ArgSource::Reg(Gpr::Rcx) => return,
        ArgSource::Reg(r) => encode_mov_rr(Gpr::Rcx, r),
        ArgSource::Load(m) => encode_mov_rm(Gpr::Rcx, &m.to_operand()),
        ArgSource::Address(m) => encode_lea(Gpr::Rcx, &m.to_operand()),
    };
    asm.emit(inst);
}

fn call_out(asm: &mut Assembler, target: RelocTarget, relocs: &mut Vec<Reloc>) -> Result<(), FatalError> {
    let resume = asm.mov_imm64_hole(Gpr::Rdx, 0)?;
    let jump = asm.jmp_abs64(0)?;
    relocs.push(Reloc { at: jump, target });
    relocs.push(Reloc { at: resume, target: RelocTarget::SiteResume(asm.offset()) });
    Ok(())
}

// zero [sp + rcx, sp) a word at a time, then bytes for the unaligned tail
fn zero_fill(asm: &mut Assembler, flags: FlagsLiveness) -> Result<(), FatalError> {
    let word = asm.new_label();
    let tail = asm.new_label();
    let done = asm.new_label();

    if flags.is_live() {
        asm.emit(encode_mov_mr(&slot(SLOT_SPILL_RAX), Gpr::Rax));
        save_flags(asm);
    }
    asm.emit(encode_test_rr(Gpr::Rcx, Gpr::Rcx));
    asm.jcc(Condition::NoSign, done)?;
    asm.emit(encode_lea(
        Gpr::Rdx,
        &MemOperand::base_index_disp(Gpr::Rsp, Gpr::Rcx, Scale::X1, 0),
    ));

    asm.bind(word)?;
    asm.emit(encode_lea(Gpr::Rcx, &MemOperand::base_disp(Gpr::Rdx, GRANULE_SIZE as i32)));
    asm.emit(encode_cmp_rr(Gpr::Rcx, Gpr::Rsp));
    asm.jcc(Condition::Above, tail)?;
    asm.emit(encode_mov_mi32(&MemOperand::base(Gpr::Rdx), 0));
    asm.emit(encode_mov_rr(Gpr::Rdx, Gpr::Rcx));
    asm.jmp(word)?;

    asm.bind(tail)?;
    asm.emit(encode_cmp_rr(Gpr::Rdx, Gpr::Rsp));
    asm.jcc(Condition::AboveEqual, done)?;
    asm.emit(encode_mov_mi8(&MemOperand::base(Gpr::Rdx), 0));
    asm.emit(encode_inc(Gpr::Rdx));
    asm.jmp(tail)?;

    asm.bind(done)?;
    if flags.is_live() {
        restore_flags(asm);
        asm.emit(encode_mov_rm(Gpr::Rax, &slot(SLOT_SPILL_RAX)));
    }
    Ok(())
}
