//! Stacks that live in heap blocks or mappings.
//!
//! A push onto memory the shadow already calls addressable means the tracked
//! top of stack is wrong. If the push lands in a known region that region is
//! taken to be the stack, and the page below the push becomes its new top.

use crate::env::Env;
use crate::error::FatalError;
use crate::instr::AppLoc;
use crate::patch::CodePatcher;
use crate::tracker::StackTracker;
use log::{error, warn};
use stackadj_types::layout::PAGE_SIZE;
use stackadj_types::shadow::ShadowState;

impl StackTracker {
    /// Called by the shadow engine when a push at `loc` writes `[start,
    /// start + size)` and that memory is already addressable. `addr` is the
    /// stack pointer after the push.
    pub fn handle_push_to_addressable(
        &self,
        loc: AppLoc,
        addr: u64,
        start: u64,
        size: u64,
        env: &mut Env<'_>,
    ) -> Result<bool, FatalError> {
        self.stats.push_addressable_seen();
        if !self.options.check_push {
            return Ok(false);
        }

        let (bounds, origin) = match env.regions.lookup(addr) {
            Some(found) => found,
            None => {
                error!(
                    "{}: push to {:#x}-{:#x} hits addressable memory outside any known stack",
                    loc,
                    start,
                    start.wrapping_add(size)
                );
                if self.options.pause_at_unaddressable {
                    env.world.wait_for_user("push to addressable memory with unknown bounds");
                }
                return Ok(false);
            }
        };

        warn!(
            "{}: stack at {:#x} is in {} {}, treating it as a stack",
            loc,
            addr,
            if origin.is_heap() { "heap block" } else { "mapping" },
            bounds
        );
        let lo = addr.saturating_sub(PAGE_SIZE).max(bounds.base);
        if lo < start {
            env.shadow.set_range(lo, start, ShadowState::Unaddressable);
        }
        if origin.is_heap() {
            self.stats.heap_stack_found();
        } else {
            self.stats.mmap_stack_found();
        }

        let patcher = CodePatcher::new(self.fragments(), env.world, &self.stats);
        self.swap.lower_for_stack_size(bounds.size, &patcher, &self.stats)?;
        Ok(true)
    }
}
