//! Telling stack swaps apart from large adjustments within one stack.

use crate::env::RegionResolver;
use crate::error::FatalError;
use crate::stats::Stats;
use log::{info, warn};
use parking_lot::Mutex;
use stackadj_types::layout::{MAX_NUMBER_NON_SWAPS, PAGE_SIZE};
use stackadj_types::region::RegionBounds;
use std::sync::atomic::{AtomicU64, Ordering};

/// Gets told when the threshold moves, before the new value is visible.
pub trait ThresholdSink {
    fn threshold_changed(&self, old: u64, new: u64) -> Result<(), FatalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapVerdict {
    /// Within the threshold; no region lookup was made.
    Ordinary,
    /// Large, but the new pointer is in the same region.
    IntraStack { bumped: bool },
    Swap { bounds: Option<RegionBounds> },
}

impl SwapVerdict {
    pub fn is_swap(&self) -> bool {
        matches!(self, SwapVerdict::Swap { .. })
    }
}

#[derive(Debug, Default)]
struct SwapControl {
    non_swaps: u32,
}

/// The swap threshold and its false-alarm counter.
///
/// The threshold is read without locking on every adjustment; all changes go
/// through the control lock.
#[derive(Debug)]
pub struct SwapState {
    threshold: AtomicU64,
    floor: u64,
    control: Mutex<SwapControl>,
}

impl SwapState {
    pub fn new(threshold: u64, floor: u64) -> Self {
        Self {
            threshold: AtomicU64::new(threshold.max(floor)),
            floor,
            control: Mutex::new(SwapControl::default()),
        }
    }

    #[inline]
    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Acquire)
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn non_swaps(&self) -> u32 {
        self.control.lock().non_swaps
    }

    #[inline]
    pub fn exceeds(&self, delta: i64) -> bool {
        let t = self.threshold() as i64;
        delta > t || delta < -t
    }

    /// Classifies a move of the stack pointer from `old_sp` to `new_sp`.
    pub fn check_swap(
        &self,
        old_sp: u64,
        new_sp: u64,
        regions: &dyn RegionResolver,
        stats: &Stats,
        sink: &dyn ThresholdSink,
    ) -> Result<SwapVerdict, FatalError> {
        let delta = new_sp.wrapping_sub(old_sp) as i64;
        if !self.exceeds(delta) {
            return Ok(SwapVerdict::Ordinary);
        }
        stats.swap_triggered();

        let bounds = match regions.lookup(old_sp) {
            Some((bounds, _)) if bounds.contains(new_sp) => {
                info!(
                    "stack adjust {:#x} => {:#x} stays inside {}, not a swap",
                    old_sp, new_sp, bounds
                );
                let bumped = self.note_non_swap(sink, stats)?;
                return Ok(SwapVerdict::IntraStack { bumped });
            }
            Some((bounds, _)) => Some(bounds),
            None => {
                warn!("cannot determine stack bounds for {:#x}", old_sp);
                None
            }
        };
        info!("stack swap {:#x} => {:#x}", old_sp, new_sp);
        stats.swap_found();
        Ok(SwapVerdict::Swap { bounds })
    }

    fn note_non_swap(&self, sink: &dyn ThresholdSink, stats: &Stats) -> Result<bool, FatalError> {
        let mut control = self.control.lock();
        control.non_swaps += 1;
        if control.non_swaps <= MAX_NUMBER_NON_SWAPS {
            return Ok(false);
        }
        let old = self.threshold();
        let new = old + PAGE_SIZE;
        self.store(old, new, sink)?;
        control.non_swaps = 0;
        stats.threshold_bumped();
        info!(
            "{} false stack swap alarms: raising threshold to {:#x}",
            MAX_NUMBER_NON_SWAPS + 1,
            new
        );
        Ok(true)
    }

    /// A stack smaller than the threshold drops it to the floor.
    pub fn lower_for_stack_size(
        &self,
        size: u64,
        sink: &dyn ThresholdSink,
        stats: &Stats,
    ) -> Result<bool, FatalError> {
        let _control = self.control.lock();
        let old = self.threshold();
        if size >= old || self.floor >= old {
            return Ok(false);
        }
        self.store(old, self.floor, sink)?;
        stats.threshold_was_lowered();
        info!(
            "stack of size {:#x} is below the swap threshold: lowering it to {:#x}",
            size, self.floor
        );
        Ok(true)
    }

    // caller holds the control lock
    fn store(&self, old: u64, new: u64, sink: &dyn ThresholdSink) -> Result<(), FatalError> {
        if new > i32::MAX as u64 {
            return Err(FatalError::ThresholdOverflow(new));
        }
        sink.threshold_changed(old, new)?;
        self.threshold.store(new, Ordering::Release);
        Ok(())
    }
}
