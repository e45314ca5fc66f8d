#![allow(dead_code)]

use stackadj_runtime::{
    AppMemory, Env, FatalError, Instr, Opcode, Operand, Outcome, RegionResolver, ShadowMemory,
    ShadowTable, Site, StackTracker, ThreadContext, World,
};
use stackadj_types::region::RegionBounds;
use stackadj_types::shadow::ShadowState;
use stackadj_x64::Gpr;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

pub const TRAMPOLINE: u64 = 0x7f00_0000_0000;

/// Application bytes; anything never written reads as zero.
#[derive(Default)]
pub struct SparseMemory(pub HashMap<u64, u8>);

impl SparseMemory {
    pub fn fill(&mut self, start: u64, len: u64, byte: u8) {
        for a in start..start + len {
            self.0.insert(a, byte);
        }
    }

    pub fn byte(&self, addr: u64) -> u8 {
        self.0.get(&addr).copied().unwrap_or(0)
    }
}

impl AppMemory for SparseMemory {
    fn read_u64(&self, addr: u64) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.byte(addr + i as u64);
        }
        u64::from_le_bytes(bytes)
    }

    fn zero(&mut self, start: u64, len: u64) {
        self.fill(start, len, 0);
    }
}

/// Heap blocks and mappings as plain intervals, counting every query.
#[derive(Default)]
pub struct Regions {
    pub heap: Vec<RegionBounds>,
    pub mappings: Vec<RegionBounds>,
    pub queries: Cell<u32>,
}

impl Regions {
    pub fn mapping(base: u64, size: u64) -> Self {
        Self {
            mappings: vec![RegionBounds::new(base, size)],
            ..Self::default()
        }
    }

    fn find(&self, list: &[RegionBounds], addr: u64) -> Option<RegionBounds> {
        self.queries.set(self.queries.get() + 1);
        list.iter().copied().find(|b| b.contains(addr))
    }
}

impl RegionResolver for Regions {
    fn is_in_heap(&self, addr: u64) -> bool {
        self.find(&self.heap, addr).is_some()
    }
    fn heap_lookup(&self, addr: u64) -> Option<RegionBounds> {
        self.find(&self.heap, addr)
    }
    fn anon_mapping_lookup(&self, addr: u64) -> Option<RegionBounds> {
        self.find(&self.mappings, addr)
    }
    fn query_memory(&self, _addr: u64) -> Option<RegionBounds> {
        self.queries.set(self.queries.get() + 1);
        None
    }
}

#[derive(Default)]
pub struct RecordingWorld {
    pub suspends: Cell<u32>,
    pub resumes: Cell<u32>,
    pub waits: RefCell<Vec<String>>,
}

impl World for RecordingWorld {
    fn clean_call_trampoline(&self) -> u64 {
        TRAMPOLINE
    }
    fn suspend_all(&self) -> bool {
        self.suspends.set(self.suspends.get() + 1);
        true
    }
    fn resume_all(&self) {
        self.resumes.set(self.resumes.get() + 1);
    }
    fn wait_for_user(&self, reason: &str) {
        self.waits.borrow_mut().push(reason.to_owned());
    }
}

/// One application thread and the world around it.
pub struct Harness {
    pub shadow: ShadowTable,
    pub memory: SparseMemory,
    pub regions: Regions,
    pub world: RecordingWorld,
    pub ctx: ThreadContext,
}

impl Harness {
    pub fn new(sp: u64) -> Self {
        Self {
            shadow: ShadowTable::new(),
            memory: SparseMemory::default(),
            regions: Regions::default(),
            world: RecordingWorld::default(),
            ctx: ThreadContext::new(sp),
        }
    }

    pub fn with_regions(mut self, regions: Regions) -> Self {
        self.regions = regions;
        self
    }

    pub fn split(&mut self) -> (&mut ThreadContext, Env<'_>) {
        let env = Env {
            shadow: &mut self.shadow,
            regions: &self.regions,
            memory: &mut self.memory,
            world: &self.world,
        };
        (&mut self.ctx, env)
    }

    pub fn run(&mut self, tracker: &StackTracker, site: &Site) -> Result<Outcome, FatalError> {
        let (ctx, mut env) = self.split();
        tracker.run_site(site, ctx, &mut env)
    }

    /// Instruments `instr`, runs its site, then moves the stack pointer to
    /// `new_sp` as the instruction itself would.
    pub fn exec(&mut self, tracker: &StackTracker, instr: &Instr, new_sp: u64) -> Outcome {
        let mut sites = Vec::new();
        assert!(tracker.instrument(instr, &mut sites).unwrap(), "{:?} not instrumented", instr);
        let outcome = self.run(tracker, &sites[0]).unwrap();
        self.ctx.set(Gpr::Rsp, new_sp);
        outcome
    }

    pub fn states(&self, start: u64, end: u64) -> Vec<ShadowState> {
        (start..end).step_by(8).map(|a| self.shadow.state_at(a)).collect()
    }
}

pub fn sp_instr(opcode: Opcode, src: Operand) -> Instr {
    Instr::new(0x40_1000, opcode, vec![Operand::Reg(Gpr::Rsp)], vec![src, Operand::Reg(Gpr::Rsp)])
}

pub fn sub_rsp(imm: i64) -> Instr {
    sp_instr(Opcode::Sub, Operand::Imm(imm))
}

pub fn add_rsp(imm: i64) -> Instr {
    sp_instr(Opcode::Add, Operand::Imm(imm))
}

pub fn mov_rsp(src: Gpr) -> Instr {
    Instr::new(0x40_2000, Opcode::Mov, vec![Operand::Reg(Gpr::Rsp)], vec![Operand::Reg(src)])
}
