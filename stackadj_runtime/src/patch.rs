//! Rewriting threshold immediates in live fragments.

use crate::codegen::FragmentTable;
use crate::env::World;
use crate::error::FatalError;
use crate::stats::Stats;
use crate::swap::ThresholdSink;
use log::{debug, warn};

const CACHE_LINE: usize = 64;

/// Patches the threshold compares of every absolute fragment.
pub struct CodePatcher<'a> {
    table: &'a FragmentTable,
    world: &'a dyn World,
    stats: &'a Stats,
}

fn imm32(value: u64) -> Result<i32, FatalError> {
    i32::try_from(value).map_err(|_| FatalError::ThresholdOverflow(value))
}

impl<'a> CodePatcher<'a> {
    pub fn new(table: &'a FragmentTable, world: &'a dyn World, stats: &'a Stats) -> Self {
        Self { table, world, stats }
    }

    /// Checks every site holds `old` (or `-old`) and collects the writes
    /// that replace it with `new`.
    fn plan(&self, old: i32, new: i32) -> Result<Vec<(usize, i32)>, FatalError> {
        let region = self.table.region();
        let mut writes = Vec::new();
        for frag in self.table.absolute_fragments() {
            if frag.threshold_sites.len() != 2 {
                return Err(FatalError::PatchSiteCount {
                    found: frag.threshold_sites.len(),
                    expected: 2,
                });
            }
            for (&at, (expected, value)) in frag.threshold_sites.iter().zip([(old, new), (-old, -new)]) {
                let found = region.read_i32(at)?;
                if found != expected {
                    return Err(FatalError::PatchMismatch { at, expected, found });
                }
                if at / CACHE_LINE != (at + 3) / CACHE_LINE {
                    // another thread could see a torn immediate
                    warn!("threshold immediate at {:#x} crosses a cache line", at);
                }
                writes.push((at, value));
            }
        }
        Ok(writes)
    }

    fn write_all(&self, writes: &[(usize, i32)]) -> Result<(), FatalError> {
        let region = self.table.region();
        region.make_writable()?;
        let written = writes.iter().try_for_each(|&(at, value)| region.write_i32(at, value));
        region.make_executable()?;
        written
    }
}

impl ThresholdSink for CodePatcher<'_> {
    fn threshold_changed(&self, old: u64, new: u64) -> Result<(), FatalError> {
        let writes = self.plan(imm32(old)?, imm32(new)?)?;
        if writes.is_empty() {
            debug!("no fragments hold the threshold, nothing to patch");
            return Ok(());
        }

        if !self.world.suspend_all() {
            return Err(FatalError::SuspendFailed);
        }
        let result = self.write_all(&writes);
        self.world.resume_all();
        result?;

        self.stats.patched();
        debug!(
            "patched {} threshold immediates: {:#x} => {:#x}",
            writes.len(),
            old,
            new
        );
        Ok(())
    }
}
