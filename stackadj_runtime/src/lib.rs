//! Tracking of stack pointer adjustments for a memory checker.
//!
//! Every instruction that moves the stack pointer gets a site. At run time a
//! site keeps the shadow state of the stack in step with the pointer, tells
//! stack swaps apart from ordinary adjustments and adapts the swap threshold
//! as it learns about the program's stacks.

pub mod classify;
pub mod code_region;
pub mod codegen;
pub mod context;
pub mod env;
pub mod errant;
pub mod error;
pub mod instr;
pub mod options;
pub mod patch;
pub mod shadow_table;
pub mod stats;
pub mod swap;
pub mod tracker;
pub mod update;

pub use codegen::run::{Outcome, SlowCallback};
pub use codegen::{FragmentTable, Site};
pub use context::ThreadContext;
pub use env::{AppMemory, Env, RegionResolver, ShadowMemory, World};
pub use error::{ConfigError, FatalError};
pub use instr::{AppLoc, ArgSource, Instr, MemRef, Opcode, Operand};
pub use options::Options;
pub use shadow_table::ShadowTable;
pub use stats::StatsSnapshot;
pub use tracker::StackTracker;
