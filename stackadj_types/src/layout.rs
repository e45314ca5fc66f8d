//! SoT constants for stack adjustment tracking on x86-64

/// Bytes of stack covered by one shadow granule (one machine word).
pub const GRANULE_SIZE: u64 = 8;
pub const GRANULE_SHIFT: u32 = 3;

pub const PAGE_SIZE: u64 = 4096;

/// `ret imm16` pops this much before the immediate is released.
pub const RET_ADDR_SIZE: u64 = 8;

/// Application bytes covered by one block of the shadow lookup table.
pub const SHADOW_BLOCK_SPAN: u64 = 0x1_0000;
pub const SHADOW_BLOCK_SHIFT: u8 = 16;
pub const CELLS_PER_BLOCK: u64 = SHADOW_BLOCK_SPAN / GRANULE_SIZE;

// callstacks and other consumers reuse the threshold, so don't let it get too small
pub const MIN_SWAP_THRESHOLD: u64 = 2048;
pub const DEFAULT_SWAP_THRESHOLD: u64 = 0x9000;

/// Swap triggers that turn out to be intra-stack before the threshold grows.
pub const MAX_NUMBER_NON_SWAPS: u32 = 32;

// per-thread scratch slots, addressed gs-relative by generated code
pub const TLS_SLOT_BASE: i32 = 0x40;

pub const SLOT_SPILL_RAX: usize = 0;
pub const SLOT_SPILL_RBX: usize = 1;
pub const SLOT_SPILL_RCX: usize = 2;
pub const SLOT_SPILL_RDX: usize = 3;
/// Value handed to the shared code: delta, target or mask.
pub const SLOT_ARG: usize = 4;
/// Where shared code jumps back to when done.
pub const SLOT_RETADDR: usize = 5;
/// Adjustment kind of the site that entered the slow path.
pub const SLOT_TAG: usize = 6;
pub const SLOT_FLAGS: usize = 7;
pub const SLOT_FASTPATH_HITS: usize = 8;
/// Base of the top-level shadow table, indexed by `addr >> 16`.
pub const SLOT_SHADOW_TABLE: usize = 9;
pub const SLOT_COUNT: usize = 10;

pub const fn tls_slot_disp(slot: usize) -> i32 {
    TLS_SLOT_BASE + (slot as i32) * 8
}
