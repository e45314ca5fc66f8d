//! Executes sites and fragments against a [`ThreadContext`].
//!
//! This follows the lowered code step for step, reading the threshold
//! immediates out of the live code region, so a patched fragment behaves the
//! same here as on the machine.

use super::step::{FragmentStep, SiteStep, SlowTarget, GROW_STATE, SHRINK_STATE};
use super::{Fragment, FragmentTable, Site};
use crate::context::ThreadContext;
use crate::env::Env;
use crate::error::FatalError;
use crate::instr::ArgSource;
use stackadj_types::id::FragmentId;
use stackadj_types::kind::FlagsLiveness;
use stackadj_types::layout::{
    GRANULE_SHIFT, GRANULE_SIZE, SLOT_ARG, SLOT_FASTPATH_HITS, SLOT_FLAGS, SLOT_RETADDR,
    SLOT_SPILL_RAX, SLOT_SPILL_RBX, SLOT_SPILL_RCX, SLOT_SPILL_RDX, SLOT_TAG,
};
use stackadj_x64::Gpr;

/// The out-of-line handler behind the clean-call trampoline.
///
/// On entry the tag slot names the adjustment kind and the argument slot
/// holds the site's value.
pub trait SlowCallback {
    fn slow_callback(&self, ctx: &mut ThreadContext, env: &mut Env<'_>) -> Result<(), FatalError>;
}

/// How a site finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled by the site's own code.
    Inline,
    /// A shared fragment finished without leaving generated code.
    Fast,
    Slow,
}

enum Flow {
    Next,
    Slow,
    Done(Outcome),
}

pub struct Runner<'a> {
    pub table: &'a FragmentTable,
    pub slow: &'a dyn SlowCallback,
}

impl Runner<'_> {
    pub fn run_site(&self, site: &Site, ctx: &mut ThreadContext, env: &mut Env<'_>) -> Result<Outcome, FatalError> {
        let mut outcome = Outcome::Inline;
        for step in &site.steps {
            match *step {
                SiteStep::Spill => {
                    ctx.spill(Gpr::Rcx, SLOT_SPILL_RCX);
                    ctx.spill(Gpr::Rdx, SLOT_SPILL_RDX);
                }
                SiteStep::LoadValue { src, negate } => {
                    let value = load_value(src, ctx, env);
                    ctx.set(Gpr::Rcx, if negate { value.wrapping_neg() } else { value });
                }
                SiteStep::ZeroFill { .. } => {
                    let delta = ctx.get(Gpr::Rcx) as i64;
                    if delta < 0 {
                        let start = ctx.sp().wrapping_add(delta as u64);
                        env.memory.zero(start, delta.unsigned_abs());
                    }
                }
                SiteStep::CallFragment(id) => {
                    // no real resume address on the host
                    ctx.set(Gpr::Rdx, site.pc);
                    outcome = self.run_fragment(id, ctx, env)?;
                }
                SiteStep::CallSlowPath { tag } => {
                    ctx.set_slot(SLOT_TAG, tag);
                    ctx.set(Gpr::Rdx, site.pc);
                    let id = self.table.slow_path().ok_or(FatalError::MissingFragment)?;
                    outcome = self.run_fragment(id, ctx, env)?;
                }
                SiteStep::CleanCall { tag } => {
                    ctx.set_slot(SLOT_TAG, tag);
                    ctx.spill(Gpr::Rcx, SLOT_ARG);
                    ctx.set(Gpr::Rdx, site.pc);
                    ctx.spill(Gpr::Rdx, SLOT_RETADDR);
                    self.slow.slow_callback(ctx, env)?;
                    outcome = Outcome::Slow;
                }
                SiteStep::Reload => {
                    ctx.reload(Gpr::Rcx, SLOT_SPILL_RCX);
                    ctx.reload(Gpr::Rdx, SLOT_SPILL_RDX);
                }
            }
        }
        Ok(outcome)
    }

    pub fn run_fragment(&self, id: FragmentId, ctx: &mut ThreadContext, env: &mut Env<'_>) -> Result<Outcome, FatalError> {
        let frag = self.table.get(id);
        let mut pc = 0;
        while let Some(step) = frag.steps.get(pc) {
            match self.step(frag, *step, ctx, env)? {
                Flow::Next => pc += 1,
                Flow::Done(outcome) => return Ok(outcome),
                Flow::Slow => {
                    pc = frag
                        .steps
                        .iter()
                        .position(|s| matches!(s, FragmentStep::SlowExit { .. }))
                        .ok_or(FatalError::MissingFragment)?;
                }
            }
        }
        // every fragment ends in a jump
        Err(FatalError::MissingFragment)
    }

    fn step(
        &self,
        frag: &Fragment,
        step: FragmentStep,
        ctx: &mut ThreadContext,
        env: &mut Env<'_>,
    ) -> Result<Flow, FatalError> {
        match step {
            FragmentStep::Enter { flags } => {
                ctx.spill(Gpr::Rcx, SLOT_ARG);
                ctx.spill(Gpr::Rdx, SLOT_RETADDR);
                ctx.spill(Gpr::Rbx, SLOT_SPILL_RBX);
                ctx.spill(Gpr::Rax, SLOT_SPILL_RAX);
                if flags.is_live() {
                    ctx.set_slot(SLOT_FLAGS, ctx.flags);
                }
            }
            FragmentStep::LoadSp { bias } => {
                ctx.set(Gpr::Rdx, ctx.sp().wrapping_add(bias as i64 as u64));
            }
            FragmentStep::DeltaFromTarget => {
                ctx.set(Gpr::Rcx, ctx.get(Gpr::Rcx).wrapping_sub(ctx.get(Gpr::Rdx)));
            }
            FragmentStep::ThresholdCheck => {
                let (above, below) = match frag.threshold_sites[..] {
                    [above, below] => (above, below),
                    _ => {
                        return Err(FatalError::PatchSiteCount {
                            found: frag.threshold_sites.len(),
                            expected: 2,
                        })
                    }
                };
                let region = self.table.region();
                let delta = ctx.get(Gpr::Rcx) as i64;
                if delta > region.read_i32(above)? as i64 || delta < region.read_i32(below)? as i64 {
                    return Ok(Flow::Slow);
                }
            }
            FragmentStep::AlignmentCheck => {
                let mask = GRANULE_SIZE - 1;
                if ctx.get(Gpr::Rcx) & mask != 0 || ctx.get(Gpr::Rdx) & mask != 0 {
                    return Ok(Flow::Slow);
                }
            }
            FragmentStep::WalkShadow => {
                if !walk_shadow(ctx, env) {
                    return Ok(Flow::Slow);
                }
            }
            FragmentStep::CountHit => {
                ctx.set_slot(SLOT_FASTPATH_HITS, ctx.slot(SLOT_FASTPATH_HITS) + 1);
            }
            FragmentStep::Leave { flags } => {
                restore_work_regs(ctx, flags);
                return Ok(Flow::Done(Outcome::Fast));
            }
            FragmentStep::SlowExit { tag, flags, target } => {
                restore_work_regs(ctx, flags);
                ctx.set_slot(SLOT_TAG, tag);
                ctx.reload(Gpr::Rcx, SLOT_ARG);
                ctx.reload(Gpr::Rdx, SLOT_RETADDR);
                match target {
                    SlowTarget::SharedSlowPath => {
                        let id = self.table.slow_path().ok_or(FatalError::MissingFragment)?;
                        self.run_fragment(id, ctx, env)?;
                    }
                    SlowTarget::CleanCall => self.slow.slow_callback(ctx, env)?,
                }
                return Ok(Flow::Done(Outcome::Slow));
            }
            FragmentStep::SlowEntry => {
                ctx.spill(Gpr::Rcx, SLOT_ARG);
                ctx.spill(Gpr::Rdx, SLOT_RETADDR);
            }
            FragmentStep::CleanCall => {
                self.slow.slow_callback(ctx, env)?;
                return Ok(Flow::Done(Outcome::Slow));
            }
        }
        Ok(Flow::Next)
    }
}

fn load_value(src: ArgSource, ctx: &ThreadContext, env: &Env<'_>) -> u64 {
    match src {
        ArgSource::Imm(i) => i as u64,
        ArgSource::Reg(r) => ctx.get(r),
        ArgSource::Load(m) => env.memory.read_u64(m.effective_address(ctx)),
        ArgSource::Address(m) => m.effective_address(ctx),
    }
}

fn restore_work_regs(ctx: &mut ThreadContext, flags: FlagsLiveness) {
    if flags.is_live() {
        ctx.flags = ctx.slot(SLOT_FLAGS);
    }
    ctx.reload(Gpr::Rax, SLOT_SPILL_RAX);
    ctx.reload(Gpr::Rbx, SLOT_SPILL_RBX);
}

/// rdx = sp, rcx = signed delta. Returns false where the machine walk takes
/// the slow exit: a block with no storage yet.
fn walk_shadow(ctx: &mut ThreadContext, env: &mut Env<'_>) -> bool {
    let delta = ctx.get(Gpr::Rcx) as i64;
    if delta == 0 {
        return true;
    }
    let (mut cursor, state) = if delta > 0 {
        (ctx.get(Gpr::Rdx), SHRINK_STATE)
    } else {
        (ctx.get(Gpr::Rdx).wrapping_add(delta as u64), GROW_STATE)
    };
    let mut left = delta.unsigned_abs() >> GRANULE_SHIFT;
    let span = env.shadow.block_span();

    while left > 0 {
        let Some((mut cell, _)) = env.shadow.lookup(cursor) else {
            ctx.set(Gpr::Rdx, cursor);
            ctx.set(Gpr::Rcx, left);
            return false;
        };
        loop {
            env.shadow.store(cell, state);
            cell += 1;
            cursor = cursor.wrapping_add(GRANULE_SIZE);
            left -= 1;
            if left == 0 || cursor % span == 0 {
                break;
            }
        }
        ctx.set(Gpr::Rbx, cell);
    }
    ctx.set(Gpr::Rdx, cursor);
    ctx.set(Gpr::Rcx, 0);
    true
}
