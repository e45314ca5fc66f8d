//! x86-64 encoding for runtime-generated instrumentation.

pub mod assembler;
pub mod encoder;
pub mod imm;
pub mod registers;

pub use assembler::{Assembler, Label};
pub use encoder::{Condition, EncodedInst};
pub use registers::{Gpr, MemOperand, Scale, Segment};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AsmError {
    #[error("label {0} referenced but never bound")]
    UnboundLabel(usize),
    #[error("label {0} bound twice")]
    LabelRebound(usize),
    #[error("label {0} does not belong to this assembler")]
    UnknownLabel(usize),
    #[error("jump from {from:#x} to {to:#x} does not fit in rel32")]
    JumpOutOfRange { from: usize, to: usize },
    #[error("instruction at {at:#x} has no immediate field")]
    NoImmediate { at: usize },
    #[error("{width}-byte immediate at {at:#x} is outside {len} bytes of code")]
    ImmOutOfBounds { at: usize, width: usize, len: usize },
}
