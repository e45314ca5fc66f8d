use std::fmt;

/// A heap block or memory mapping that is believed to hold a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionBounds {
    pub base: u64,
    pub size: u64,
}

impl RegionBounds {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

impl fmt::Display for RegionBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.base, self.end())
    }
}

/// Which index answered a region lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOrigin {
    Heap,
    AnonMapping,
    OsQuery,
}

impl RegionOrigin {
    pub fn is_heap(self) -> bool {
        self == RegionOrigin::Heap
    }
}
