use stackadj_types::layout::SLOT_COUNT;
use stackadj_x64::Gpr;

/// One thread's machine state as the instrumentation sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadContext {
    pub regs: [u64; 16],
    pub flags: u64,
    /// Private scratch slots; emitted code reaches them gs-relative.
    pub slots: [u64; SLOT_COUNT],
}

impl ThreadContext {
    pub fn new(sp: u64) -> Self {
        let mut ctx = Self {
            regs: [0; 16],
            flags: 0,
            slots: [0; SLOT_COUNT],
        };
        ctx.set(Gpr::Rsp, sp);
        ctx
    }

    #[inline]
    pub fn get(&self, reg: Gpr) -> u64 {
        self.regs[reg.index()]
    }

    #[inline]
    pub fn set(&mut self, reg: Gpr, value: u64) {
        self.regs[reg.index()] = value;
    }

    #[inline]
    pub fn sp(&self) -> u64 {
        self.get(Gpr::Rsp)
    }

    #[inline]
    pub fn slot(&self, slot: usize) -> u64 {
        self.slots[slot]
    }

    #[inline]
    pub fn set_slot(&mut self, slot: usize, value: u64) {
        self.slots[slot] = value;
    }

    /// Copies `reg` into `slot`.
    #[inline]
    pub fn spill(&mut self, reg: Gpr, slot: usize) {
        self.slots[slot] = self.get(reg);
    }

    #[inline]
    pub fn reload(&mut self, reg: Gpr, slot: usize) {
        self.set(reg, self.slots[slot]);
    }
}
