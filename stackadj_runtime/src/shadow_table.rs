//! A host-side two-level shadow table: one state byte per granule, in blocks
//! allocated on first write.

use crate::env::ShadowMemory;
use stackadj_types::layout::{CELLS_PER_BLOCK, GRANULE_SHIFT, SHADOW_BLOCK_SHIFT, SHADOW_BLOCK_SPAN};
use stackadj_types::shadow::ShadowState;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ShadowTable {
    blocks: HashMap<u64, Box<[u8]>>,
}

#[inline]
fn split(addr: u64) -> (u64, u64) {
    let block = addr >> SHADOW_BLOCK_SHIFT;
    let offset = (addr & (SHADOW_BLOCK_SPAN - 1)) >> GRANULE_SHIFT;
    (block, offset)
}

// cells are block << 32 | granule offset
#[inline]
fn cell_of(block: u64, offset: u64) -> u64 {
    (block << 32) | offset
}

impl ShadowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn block_mut(&mut self, block: u64) -> &mut [u8] {
        self.blocks.entry(block).or_insert_with(|| {
            vec![ShadowState::Unaddressable.as_byte(); CELLS_PER_BLOCK as usize].into_boxed_slice()
        })
    }
}

impl ShadowMemory for ShadowTable {
    fn set_range(&mut self, start: u64, end: u64, state: ShadowState) {
        if end <= start {
            return;
        }
        let first = start >> GRANULE_SHIFT;
        let last = (end - 1) >> GRANULE_SHIFT;
        let byte = state.as_byte();
        let mut granule = first;
        while granule <= last {
            let (block, offset) = split(granule << GRANULE_SHIFT);
            let run = (CELLS_PER_BLOCK - offset).min(last - granule + 1);
            let cells = self.block_mut(block);
            cells[offset as usize..(offset + run) as usize].fill(byte);
            granule += run;
        }
    }

    fn state_at(&self, addr: u64) -> ShadowState {
        let (block, offset) = split(addr);
        self.blocks
            .get(&block)
            .and_then(|cells| ShadowState::from_byte(cells[offset as usize]))
            .unwrap_or(ShadowState::Unaddressable)
    }

    fn lookup(&self, addr: u64) -> Option<(u64, u64)> {
        let (block, offset) = split(addr);
        self.blocks
            .contains_key(&block)
            .then(|| (cell_of(block, offset), offset))
    }

    fn store(&mut self, cell: u64, state: ShadowState) {
        let block = cell >> 32;
        let offset = (cell & 0xffff_ffff) as usize;
        if let Some(cells) = self.blocks.get_mut(&block) {
            if let Some(c) = cells.get_mut(offset) {
                *c = state.as_byte();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_memory_is_unaddressable() {
        let table = ShadowTable::new();
        assert_eq!(table.state_at(0x1234_5678), ShadowState::Unaddressable);
        assert_eq!(table.lookup(0x1234_5678), None);
    }

    #[test]
    fn range_across_blocks() {
        let mut table = ShadowTable::new();
        table.set_range(0x1_FFF0, 0x2_0010, ShadowState::Defined);
        assert_eq!(table.allocated_blocks(), 2);
        assert_eq!(table.state_at(0x1_FFE8), ShadowState::Unaddressable);
        assert_eq!(table.state_at(0x1_FFF8), ShadowState::Defined);
        assert_eq!(table.state_at(0x2_0008), ShadowState::Defined);
        assert_eq!(table.state_at(0x2_0010), ShadowState::Unaddressable);
    }

    #[test]
    fn partial_granule_marks_whole_granule() {
        let mut table = ShadowTable::new();
        table.set_range(0x1003, 0x1004, ShadowState::Undefined);
        assert_eq!(table.state_at(0x1000), ShadowState::Undefined);
        assert_eq!(table.state_at(0x1008), ShadowState::Unaddressable);
    }

    #[test]
    fn cells_step_within_block() {
        let mut table = ShadowTable::new();
        table.set_range(0x5000, 0x5001, ShadowState::Unaddressable);
        let (cell, offset) = table.lookup(0x5000).unwrap();
        assert_eq!(offset, 0x5000 >> 3);
        table.store(cell + 1, ShadowState::Undefined);
        assert_eq!(table.state_at(0x5008), ShadowState::Undefined);
        assert_eq!(table.lookup(0x5008).unwrap().0, cell + 1);
    }
}
