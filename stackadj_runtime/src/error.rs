use crate::instr::Opcode;
use stackadj_x64::AsmError;
use thiserror::Error;

/// Conditions the tracker cannot continue from.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("slow path entered with tag {0}, which names no adjustment kind")]
    BadTag(u64),
    #[error("instruction at {pc:#x} ({opcode:?}) writes the stack pointer but has no adjustment kind")]
    Unclassified { pc: u64, opcode: Opcode },
    #[error("found {found} threshold patch sites in an absolute fragment, expected {expected}")]
    PatchSiteCount { found: usize, expected: usize },
    #[error("patch site at {at:#x} holds {found:#x}, expected {expected:#x}")]
    PatchMismatch { at: usize, expected: i32, found: i32 },
    #[error("threshold {0:#x} does not fit in a 32-bit immediate")]
    ThresholdOverflow(u64),
    #[error("could not map {size} bytes of code: errno {errno}")]
    CodeAlloc { size: usize, errno: i32 },
    #[error("could not change protection of the code region: errno {errno}")]
    CodeProtect { errno: i32 },
    #[error("could not suspend other threads to patch code")]
    SuspendFailed,
    #[error("no fragment to jump to for this site")]
    MissingFragment,
    #[error("encoding failed: {0}")]
    Asm(#[from] AsmError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not parse options: {0}")]
    Json(#[from] serde_json::Error),
    #[error("minimum swap threshold must be nonzero")]
    ZeroFloor,
    #[error("swap threshold {0:#x} is larger than a 32-bit immediate can hold")]
    ThresholdTooLarge(u64),
}
