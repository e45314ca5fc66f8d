//! The entry points the instrumentation framework calls.

use crate::classify::{classify, needs_instrumentation, site_operand, writes_sp};
use crate::codegen::run::{Outcome, Runner, SlowCallback};
use crate::codegen::{FragmentTable, Site};
use crate::context::ThreadContext;
use crate::env::{Env, ShadowMemory, World};
use crate::error::FatalError;
use crate::instr::Instr;
use crate::options::Options;
use crate::patch::CodePatcher;
use crate::stats::{Stats, StatsSnapshot};
use crate::swap::SwapState;
use crate::update::{self, RangeUpdate};
use log::{info, trace, warn};
use stackadj_types::id::{FragmentId, SiteId};
use stackadj_types::kind::AdjustmentKind;
use stackadj_types::layout::{RET_ADDR_SIZE, SLOT_ARG, SLOT_FASTPATH_HITS, SLOT_SHADOW_TABLE, SLOT_TAG};
use std::sync::atomic::{AtomicU32, Ordering};

pub struct StackTracker {
    pub(crate) options: Options,
    pub(crate) swap: SwapState,
    pub(crate) stats: Stats,
    fragments: FragmentTable,
    next_site: AtomicU32,
}

impl StackTracker {
    /// Builds the shared fragments. A threshold below the floor is raised to
    /// it before any code is emitted.
    pub fn new(mut options: Options, world: &dyn World) -> Result<Self, FatalError> {
        // emitted immediates and the swap check must start from one value
        let threshold = options.stack_swap_threshold.max(options.min_swap_threshold);
        options.stack_swap_threshold = threshold;
        let fragments = FragmentTable::build(&options, threshold, world.clean_call_trampoline())?;
        info!(
            "stack adjust tracking: {:?} mode, swap threshold {:#x}, floor {:#x}",
            options.mode, threshold, options.min_swap_threshold
        );
        Ok(Self {
            swap: SwapState::new(threshold, options.min_swap_threshold),
            stats: Stats::default(),
            fragments,
            next_site: AtomicU32::new(0),
            options,
        })
    }

    /// Adds a site for `instr` to `sites` if it needs one.
    pub fn instrument(&self, instr: &Instr, sites: &mut Vec<Site>) -> Result<bool, FatalError> {
        if !writes_sp(instr) || !needs_instrumentation(instr, self.options.mode) {
            return Ok(false);
        }
        let unclassified = || FatalError::Unclassified {
            pc: instr.pc,
            opcode: instr.opcode,
        };
        let kind = classify(instr.opcode, &instr.srcs);
        if kind == AdjustmentKind::NotApplicable {
            return Err(unclassified());
        }
        let src = site_operand(instr).ok_or_else(unclassified)?;
        let id = SiteId::from_raw(self.next_site.fetch_add(1, Ordering::Relaxed));
        let site = Site::build(id, instr, kind, src, &self.options, &self.fragments)?;
        trace!("site {:?} at {:#x}: {:?}, {} bytes", id, instr.pc, kind, site.code.len());
        sites.push(site);
        Ok(true)
    }

    /// Points a new thread's scratch slots at the shadow table.
    pub fn thread_init(&self, ctx: &mut ThreadContext, shadow: &dyn ShadowMemory) {
        ctx.set_slot(SLOT_SHADOW_TABLE, shadow.table_base().unwrap_or(0));
        ctx.set_slot(SLOT_FASTPATH_HITS, 0);
    }

    fn runner(&self) -> Runner<'_> {
        Runner {
            table: &self.fragments,
            slow: self,
        }
    }

    /// Runs a site before its instruction executes.
    pub fn run_site(&self, site: &Site, ctx: &mut ThreadContext, env: &mut Env<'_>) -> Result<Outcome, FatalError> {
        self.runner().run_site(site, ctx, env)
    }

    pub fn run_fragment(&self, id: FragmentId, ctx: &mut ThreadContext, env: &mut Env<'_>) -> Result<Outcome, FatalError> {
        self.runner().run_fragment(id, ctx, env)
    }

    /// The shared handler for one adjustment: swap check, then the shadow
    /// or zero-fill update. `sp` is the stack pointer before the instruction.
    pub fn handle_adjust(
        &self,
        kind: AdjustmentKind,
        value: u64,
        sp: u64,
        env: &mut Env<'_>,
    ) -> Result<RangeUpdate, FatalError> {
        let (base, delta) = match kind {
            AdjustmentKind::AbsoluteSet | AdjustmentKind::MaskAnd => {
                let new_sp = if kind == AdjustmentKind::MaskAnd { sp & value } else { value };
                let delta = new_sp.wrapping_sub(sp) as i64;
                if self.swap.exceeds(delta) {
                    let patcher = CodePatcher::new(&self.fragments, env.world, &self.stats);
                    let verdict = self.swap.check_swap(sp, new_sp, env.regions, &self.stats, &patcher)?;
                    if verdict.is_swap() {
                        return Ok(RangeUpdate::Unchanged);
                    }
                }
                (sp, delta)
            }
            AdjustmentKind::RelativeIncrease | AdjustmentKind::RelativeDecrease => (sp, value as i64),
            AdjustmentKind::PostPopImmediate => (sp.wrapping_add(RET_ADDR_SIZE), value as i64),
            AdjustmentKind::NotApplicable => return Err(FatalError::BadTag(kind.tag())),
        };
        if kind.is_relative() && self.swap.exceeds(delta) {
            warn!("relative stack adjustment {:#x} exceeds the swap threshold", delta);
        }
        let update = update::apply(self.options.mode, base, delta, &mut *env.shadow, &mut *env.memory);
        trace!("{:?} at sp {:#x}: {:?}", kind, sp, update);
        Ok(update)
    }

    /// A stack's size became known, e.g. at thread creation.
    pub fn on_stack_discovered(&self, size: u64, world: &dyn World) -> Result<bool, FatalError> {
        let patcher = CodePatcher::new(&self.fragments, world, &self.stats);
        self.swap.lower_for_stack_size(size, &patcher, &self.stats)
    }

    /// Folds the thread's fast-path hits into the totals.
    pub fn thread_exit(&self, ctx: &mut ThreadContext) {
        self.stats.add_fastpath_hits(ctx.slot(SLOT_FASTPATH_HITS));
        ctx.set_slot(SLOT_FASTPATH_HITS, 0);
        if self.options.statistics {
            info!("stack adjust statistics: {}", self.stats.snapshot().to_json());
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn threshold(&self) -> u64 {
        self.swap.threshold()
    }

    pub fn non_swaps(&self) -> u32 {
        self.swap.non_swaps()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn fragments(&self) -> &FragmentTable {
        &self.fragments
    }
}

impl SlowCallback for StackTracker {
    fn slow_callback(&self, ctx: &mut ThreadContext, env: &mut Env<'_>) -> Result<(), FatalError> {
        self.stats.slow_path_entered();
        let tag = ctx.slot(SLOT_TAG);
        let kind = AdjustmentKind::from_tag(tag).ok_or(FatalError::BadTag(tag))?;
        self.handle_adjust(kind, ctx.slot(SLOT_ARG), ctx.sp(), env)?;
        Ok(())
    }
}
