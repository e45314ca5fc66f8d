//! Shadow transitions for stack growth and shrink.

use crate::env::{AppMemory, ShadowMemory};
use stackadj_types::kind::TrackingMode;
use stackadj_types::layout::GRANULE_SIZE;
use stackadj_types::shadow::ShadowState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUpdate {
    Unchanged,
    Zeroed { start: u64, len: u64 },
    Marked { start: u64, end: u64, state: ShadowState },
}

/// Applies a change of `delta` to a stack pointer at `sp`.
///
/// Growth covers `[sp + delta, sp)` and shrink `[sp, sp + delta)`. Shrink
/// stops at the granule holding the new top of stack, so that granule stays
/// addressable even when the new stack pointer is unaligned.
pub fn apply(
    mode: TrackingMode,
    sp: u64,
    delta: i64,
    shadow: &mut dyn ShadowMemory,
    memory: &mut dyn AppMemory,
) -> RangeUpdate {
    if delta == 0 {
        return RangeUpdate::Unchanged;
    }
    let target = sp.wrapping_add(delta as u64);
    match mode {
        TrackingMode::Lightweight => {
            if delta > 0 {
                return RangeUpdate::Unchanged;
            }
            // new stack must not hold stale pointers for the leak scan
            let len = delta.unsigned_abs();
            memory.zero(target, len);
            RangeUpdate::Zeroed { start: target, len }
        }
        TrackingMode::Full => {
            let (start, end, state) = if delta > 0 {
                (sp, target & !(GRANULE_SIZE - 1), ShadowState::Unaddressable)
            } else {
                (target, sp, ShadowState::Undefined)
            };
            if end <= start {
                return RangeUpdate::Unchanged;
            }
            shadow.set_range(start, end, state);
            RangeUpdate::Marked { start, end, state }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow_table::ShadowTable;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Bytes(HashMap<u64, u8>);

    impl AppMemory for Bytes {
        fn read_u64(&self, _addr: u64) -> u64 {
            0
        }

        fn zero(&mut self, start: u64, len: u64) {
            for a in start..start + len {
                self.0.insert(a, 0);
            }
        }
    }

    #[test]
    fn growth_marks_undefined_below_sp() {
        let mut shadow = ShadowTable::new();
        let mut mem = Bytes::default();
        shadow.set_range(0x7000, 0x8000, ShadowState::Unaddressable);
        let up = apply(TrackingMode::Full, 0x8000, -0x20, &mut shadow, &mut mem);
        assert_eq!(
            up,
            RangeUpdate::Marked { start: 0x7FE0, end: 0x8000, state: ShadowState::Undefined }
        );
        assert_eq!(shadow.state_at(0x7FE0), ShadowState::Undefined);
        assert_eq!(shadow.state_at(0x7FF8), ShadowState::Undefined);
        assert_eq!(shadow.state_at(0x7FD8), ShadowState::Unaddressable);
        assert_eq!(shadow.state_at(0x8000), ShadowState::Unaddressable);
    }

    #[test]
    fn shrink_keeps_new_top_addressable() {
        let mut shadow = ShadowTable::new();
        let mut mem = Bytes::default();
        shadow.set_range(0x7000, 0x8000, ShadowState::Defined);
        apply(TrackingMode::Full, 0x7F00, 0x40, &mut shadow, &mut mem);
        assert_eq!(shadow.state_at(0x7F00), ShadowState::Unaddressable);
        assert_eq!(shadow.state_at(0x7F38), ShadowState::Unaddressable);
        assert_eq!(shadow.state_at(0x7F40), ShadowState::Defined);
    }

    #[test]
    fn unaligned_shrink_spares_the_new_top_granule() {
        let mut shadow = ShadowTable::new();
        let mut mem = Bytes::default();
        shadow.set_range(0x7000, 0x8000, ShadowState::Defined);

        // within one granule: nothing to mark
        assert_eq!(
            apply(TrackingMode::Full, 0x7F00, 4, &mut shadow, &mut mem),
            RangeUpdate::Unchanged
        );
        assert_eq!(shadow.state_at(0x7F04), ShadowState::Defined);

        let up = apply(TrackingMode::Full, 0x7F00, 0x14, &mut shadow, &mut mem);
        assert_eq!(
            up,
            RangeUpdate::Marked { start: 0x7F00, end: 0x7F10, state: ShadowState::Unaddressable }
        );
        assert_eq!(shadow.state_at(0x7F08), ShadowState::Unaddressable);
        assert_eq!(shadow.state_at(0x7F14), ShadowState::Defined);

        // an unaligned old sp gives up its own granule
        apply(TrackingMode::Full, 0x7F14, 0x0C, &mut shadow, &mut mem);
        assert_eq!(shadow.state_at(0x7F10), ShadowState::Unaddressable);
        assert_eq!(shadow.state_at(0x7F20), ShadowState::Defined);
    }

    #[test]
    fn lightweight_zeroes_growth_only() {
        let mut shadow = ShadowTable::new();
        let mut mem = Bytes::default();
        let up = apply(TrackingMode::Lightweight, 0x9000, -12, &mut shadow, &mut mem);
        assert_eq!(up, RangeUpdate::Zeroed { start: 0x8FF4, len: 12 });
        assert_eq!(mem.0.len(), 12);
        assert!(mem.0.contains_key(&0x8FF4) && !mem.0.contains_key(&0x9000));

        let up = apply(TrackingMode::Lightweight, 0x9000, 64, &mut shadow, &mut mem);
        assert_eq!(up, RangeUpdate::Unchanged);
        assert_eq!(mem.0.len(), 12);
    }

    #[test]
    fn zero_delta_is_noop() {
        let mut shadow = ShadowTable::new();
        let mut mem = Bytes::default();
        assert_eq!(
            apply(TrackingMode::Full, 0x9000, 0, &mut shadow, &mut mem),
            RangeUpdate::Unchanged
        );
        assert_eq!(shadow.allocated_blocks(), 0);
    }
}
