use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Event counters. Updates are relaxed; they are only read for reporting.
#[derive(Debug, Default)]
pub struct Stats {
    slow_path: AtomicU64,
    fastpath_hits: AtomicU64,
    swaps: AtomicU64,
    swap_triggers: AtomicU64,
    push_addressable: AtomicU64,
    push_addressable_heap: AtomicU64,
    push_addressable_mmap: AtomicU64,
    threshold_bumps: AtomicU64,
    threshold_lowered: AtomicU64,
    patches: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub slow_path: u64,
    pub fastpath_hits: u64,
    pub swaps: u64,
    pub swap_triggers: u64,
    pub push_addressable: u64,
    pub push_addressable_heap: u64,
    pub push_addressable_mmap: u64,
    pub threshold_bumps: u64,
    pub threshold_lowered: u64,
    pub patches: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl Stats {
            $(
                #[inline]
                pub fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                    fastpath_hits: self.fastpath_hits.load(Ordering::Relaxed),
                }
            }
        }
    };
}

counters! {
    slow_path_entered => slow_path,
    swap_found => swaps,
    swap_triggered => swap_triggers,
    push_addressable_seen => push_addressable,
    heap_stack_found => push_addressable_heap,
    mmap_stack_found => push_addressable_mmap,
    threshold_bumped => threshold_bumps,
    threshold_was_lowered => threshold_lowered,
    patched => patches,
}

impl Stats {
    pub fn add_fastpath_hits(&self, hits: u64) {
        self.fastpath_hits.fetch_add(hits, Ordering::Relaxed);
    }
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_serializes() {
        let stats = Stats::default();
        stats.swap_triggered();
        stats.swap_triggered();
        stats.swap_found();
        stats.add_fastpath_hits(5);
        let snap = stats.snapshot();
        assert_eq!(snap.swap_triggers, 2);
        assert_eq!(snap.swaps, 1);
        assert_eq!(snap.fastpath_hits, 5);
        assert!(snap.to_json().contains("\"swap_triggers\":2"));
    }
}
