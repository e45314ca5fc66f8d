//! Generated code for stack adjustments.
//!
//! Each site gets a short inline sequence. Full-mode sites jump to one of
//! eight shared fragments, one per (flags liveness, kind); whatever those
//! cannot handle goes on to the shared slow path and from there to the slow
//! callback.

mod lower;
pub mod run;
pub mod step;

use crate::code_region::CodeRegion;
use crate::error::FatalError;
use crate::instr::{ArgSource, Instr};
use crate::options::Options;
use index_vec::IndexVec;
use stackadj_types::id::{FragmentId, SiteId};
use stackadj_types::kind::{AdjustmentKind, FlagsLiveness, SpecializationKey};
use stackadj_types::layout::RET_ADDR_SIZE;
use stackadj_x64::{imm, Assembler};
use std::collections::HashMap;
use step::{FragmentStep, SiteStep, SlowTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    Fragment(FragmentId),
    SlowPath,
    CleanCall,
    /// An offset within the site itself.
    SiteResume(usize),
}

/// An 8-byte absolute address to fill in once the site's location is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub at: usize,
    pub target: RelocTarget,
}

#[derive(Debug)]
pub struct Fragment {
    /// `None` for the shared slow path.
    pub key: Option<SpecializationKey>,
    pub steps: Vec<FragmentStep>,
    /// Offset in the code region.
    pub start: usize,
    pub len: usize,
    /// Offsets in the code region of the +threshold and -threshold immediates.
    pub threshold_sites: Vec<usize>,
}

impl Fragment {
    pub fn kind(&self) -> Option<AdjustmentKind> {
        self.key.map(|k| k.kind)
    }
}

fn fast_steps(key: SpecializationKey, target: SlowTarget) -> Vec<FragmentStep> {
    let flags = key.flags;
    let bias = if key.kind == AdjustmentKind::PostPopImmediate {
        RET_ADDR_SIZE as i32
    } else {
        0
    };
    let mut steps = vec![FragmentStep::Enter { flags }, FragmentStep::LoadSp { bias }];
    if key.kind == AdjustmentKind::AbsoluteSet {
        steps.push(FragmentStep::DeltaFromTarget);
        steps.push(FragmentStep::ThresholdCheck);
    }
    steps.extend([
        FragmentStep::AlignmentCheck,
        FragmentStep::WalkShadow,
        FragmentStep::CountHit,
        FragmentStep::Leave { flags },
        FragmentStep::SlowExit {
            tag: key.kind.tag(),
            flags,
            target,
        },
    ]);
    steps
}

/// Every shared fragment, in one executable region.
pub struct FragmentTable {
    region: CodeRegion,
    fragments: IndexVec<FragmentId, Fragment>,
    fast: HashMap<SpecializationKey, FragmentId>,
    slow_path: Option<FragmentId>,
}

impl FragmentTable {
    /// Emits the slow path (if shared) and, for full tracking with the fast
    /// path on, one fragment per specialization key.
    pub fn build(options: &Options, threshold: u64, trampoline: u64) -> Result<Self, FatalError> {
        let threshold = i32::try_from(threshold).map_err(|_| FatalError::ThresholdOverflow(threshold))?;
        let mut asm = Assembler::new();
        let mut fragments = IndexVec::new();

        let slow_label = if options.shared_slowpath {
            Some(asm.new_label())
        } else {
            None
        };
        let slow_path = match slow_label {
            Some(label) => {
                asm.bind(label)?;
                let steps = vec![FragmentStep::SlowEntry, FragmentStep::CleanCall];
                let start = asm.offset();
                lower::lower_fragment(&mut asm, &steps, None, trampoline, threshold)?;
                Some(fragments.push(Fragment {
                    key: None,
                    steps,
                    start,
                    len: asm.offset() - start,
                    threshold_sites: Vec::new(),
                }))
            }
            None => None,
        };

        let mut fast = HashMap::new();
        if options.esp_fastpath && options.shadows_stack() {
            let target = if slow_path.is_some() {
                SlowTarget::SharedSlowPath
            } else {
                SlowTarget::CleanCall
            };
            for key in SpecializationKey::all() {
                let steps = fast_steps(key, target);
                let start = asm.offset();
                let threshold_sites =
                    lower::lower_fragment(&mut asm, &steps, slow_label, trampoline, threshold)?;
                let id = fragments.push(Fragment {
                    key: Some(key),
                    steps,
                    start,
                    len: asm.offset() - start,
                    threshold_sites,
                });
                fast.insert(key, id);
            }
        }

        let code = asm.finish()?;
        let region = CodeRegion::new(&code)?;
        log::debug!(
            "emitted {} stack adjust fragments, {} bytes at {:#x}",
            fragments.len(),
            code.len(),
            region.base()
        );
        Ok(Self {
            region,
            fragments,
            fast,
            slow_path,
        })
    }

    pub fn fast(&self, key: SpecializationKey) -> Option<FragmentId> {
        self.fast.get(&key).copied()
    }

    pub fn slow_path(&self) -> Option<FragmentId> {
        self.slow_path
    }

    pub fn get(&self, id: FragmentId) -> &Fragment {
        &self.fragments[id]
    }

    pub fn address(&self, id: FragmentId) -> u64 {
        self.region.base() + self.fragments[id].start as u64
    }

    pub fn region(&self) -> &CodeRegion {
        &self.region
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Fragments carrying threshold immediates.
    pub fn absolute_fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments
            .iter()
            .filter(|f| f.kind() == Some(AdjustmentKind::AbsoluteSet))
    }
}

/// The inline code for one instruction.
#[derive(Debug, Clone)]
pub struct Site {
    pub id: SiteId,
    pub pc: u64,
    pub kind: AdjustmentKind,
    pub steps: Vec<SiteStep>,
    pub code: Vec<u8>,
    relocs: Vec<Reloc>,
}

impl Site {
    pub fn build(
        id: SiteId,
        instr: &Instr,
        kind: AdjustmentKind,
        src: ArgSource,
        options: &Options,
        table: &FragmentTable,
    ) -> Result<Self, FatalError> {
        let (src, negate) = match src {
            ArgSource::Imm(i) if kind == AdjustmentKind::RelativeDecrease => {
                (ArgSource::Imm(i.wrapping_neg()), false)
            }
            s => (s, kind == AdjustmentKind::RelativeDecrease),
        };
        let flags = FlagsLiveness::from_live(instr.flags_live);
        let key = SpecializationKey::new(flags, kind);

        let tail = if !options.shadows_stack() && kind.is_relative() {
            SiteStep::ZeroFill { flags }
        } else if let Some(id) = table.fast(key) {
            SiteStep::CallFragment(id)
        } else if table.slow_path().is_some() {
            SiteStep::CallSlowPath { tag: kind.tag() }
        } else {
            SiteStep::CleanCall { tag: kind.tag() }
        };
        let steps = vec![SiteStep::Spill, SiteStep::LoadValue { src, negate }, tail, SiteStep::Reload];

        let mut asm = Assembler::new();
        let relocs = lower::lower_site(&mut asm, &steps)?;
        let code = asm.finish()?;
        Ok(Self {
            id,
            pc: instr.pc,
            kind,
            steps,
            code,
            relocs,
        })
    }

    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    /// Fills in absolute addresses once the site is placed at `base`.
    pub fn link(&mut self, base: u64, table: &FragmentTable, trampoline: u64) -> Result<(), FatalError> {
        for reloc in &self.relocs {
            let addr = match reloc.target {
                RelocTarget::Fragment(id) => table.address(id),
                RelocTarget::SlowPath => {
                    table.address(table.slow_path().ok_or(FatalError::MissingFragment)?)
                }
                RelocTarget::CleanCall => trampoline,
                RelocTarget::SiteResume(off) => base + off as u64,
            };
            imm::write_u64(&mut self.code, reloc.at, addr)?;
        }
        Ok(())
    }
}
