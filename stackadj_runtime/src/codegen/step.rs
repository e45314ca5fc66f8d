//! Steps that make up sites and fragments.
//!
//! Every step has one machine lowering (`lower`) and one host execution
//! (`run`); the two must agree on which registers and slots each step reads
//! and writes.
//!
//! Register roles: rcx carries the value (target, delta or mask), rdx the
//! stack pointer and later the walk cursor, rbx the shadow cell pointer, rax
//! the flags and block offsets.

use crate::instr::ArgSource;
use stackadj_types::id::FragmentId;
use stackadj_types::kind::FlagsLiveness;
use stackadj_types::shadow::ShadowState;

/// One step of an inline site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStep {
    /// Spill rcx and rdx.
    Spill,
    /// rcx <- the application value, negated for decreasing kinds.
    LoadValue { src: ArgSource, negate: bool },
    /// Zero `[sp + rcx, sp)` when rcx is negative.
    ZeroFill { flags: FlagsLiveness },
    /// rdx <- resume address, then jump to a shared fragment.
    CallFragment(FragmentId),
    /// Store the tag and jump to the shared slow path.
    CallSlowPath { tag: u64 },
    /// Store the tag, value and resume address and enter the clean call directly.
    CleanCall { tag: u64 },
    /// Restore rcx and rdx.
    Reload,
}

/// Where a fragment's slow exit goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowTarget {
    SharedSlowPath,
    CleanCall,
}

/// One step of a shared fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStep {
    /// Save rcx and rdx as argument and return address, spill rbx and rax,
    /// capture the flags if live.
    Enter { flags: FlagsLiveness },
    /// rdx <- sp + bias
    LoadSp { bias: i32 },
    /// rcx <- rcx - rdx
    DeltaFromTarget,
    /// Leave for the slow path unless `-threshold <= rcx <= threshold`.
    /// Both bounds are patchable immediates.
    ThresholdCheck,
    /// Leave for the slow path unless rcx and rdx are granule-aligned.
    AlignmentCheck,
    /// Mark the range between rdx and rdx + rcx, block by block.
    WalkShadow,
    CountHit,
    /// Restore flags and spilled registers and return.
    Leave { flags: FlagsLiveness },
    /// Restore, store the tag, reload the original value and return
    /// address, and hand over to the slow path.
    SlowExit { tag: u64, flags: FlagsLiveness, target: SlowTarget },
    /// Entry of the shared slow path: save rcx and rdx.
    SlowEntry,
    /// Jump to the clean-call trampoline.
    CleanCall,
}

/// Shadow state written for growth and for shrink.
pub const GROW_STATE: ShadowState = ShadowState::Undefined;
pub const SHRINK_STATE: ShadowState = ShadowState::Unaddressable;
