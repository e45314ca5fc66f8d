//! What the tracker needs from the rest of the checker.

use stackadj_types::layout::SHADOW_BLOCK_SPAN;
use stackadj_types::region::{RegionBounds, RegionOrigin};
use stackadj_types::shadow::ShadowState;

/// Finds the memory region an address belongs to.
pub trait RegionResolver {
    fn is_in_heap(&self, addr: u64) -> bool;
    /// Large heap allocations only.
    fn heap_lookup(&self, addr: u64) -> Option<RegionBounds>;
    fn anon_mapping_lookup(&self, addr: u64) -> Option<RegionBounds>;
    fn query_memory(&self, addr: u64) -> Option<RegionBounds>;

    /// Heap addresses are answered by the heap index alone; anything else
    /// tries the anonymous mappings, then the OS.
    fn lookup(&self, addr: u64) -> Option<(RegionBounds, RegionOrigin)> {
        if self.is_in_heap(addr) {
            return self.heap_lookup(addr).map(|b| (b, RegionOrigin::Heap));
        }
        self.anon_mapping_lookup(addr)
            .map(|b| (b, RegionOrigin::AnonMapping))
            .or_else(|| self.query_memory(addr).map(|b| (b, RegionOrigin::OsQuery)))
    }
}

/// Per-granule shadow state.
///
/// A cell names one granule's state byte. Granules that are adjacent within a
/// block have adjacent cells, so a walk may step a cell by one.
pub trait ShadowMemory {
    /// Marks every granule overlapping `[start, end)`.
    fn set_range(&mut self, start: u64, end: u64, state: ShadowState);
    fn state_at(&self, addr: u64) -> ShadowState;
    /// The cell for `addr` and its granule index within the block, or `None`
    /// if the block has no private storage yet.
    fn lookup(&self, addr: u64) -> Option<(u64, u64)>;
    fn store(&mut self, cell: u64, state: ShadowState);

    fn block_span(&self) -> u64 {
        SHADOW_BLOCK_SPAN
    }

    /// Address of the top-level table read by emitted code, if there is one.
    fn table_base(&self) -> Option<u64> {
        None
    }
}

pub trait AppMemory {
    fn read_u64(&self, addr: u64) -> u64;
    fn zero(&mut self, start: u64, len: u64);
}

/// The instrumentation framework.
pub trait World {
    /// Entry of the clean-call sequence that runs the slow callback and
    /// resumes through the return-address slot.
    fn clean_call_trampoline(&self) -> u64;
    /// Stops every other application thread. Returns false on failure.
    fn suspend_all(&self) -> bool;
    fn resume_all(&self);
    fn wait_for_user(&self, reason: &str);
}

/// The collaborators a single event needs.
pub struct Env<'a> {
    pub shadow: &'a mut dyn ShadowMemory,
    pub regions: &'a dyn RegionResolver,
    pub memory: &'a mut dyn AppMemory,
    pub world: &'a dyn World,
}
