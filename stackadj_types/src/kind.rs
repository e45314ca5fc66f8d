use serde::{Deserialize, Serialize};

/// How an instruction moves the stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjustmentKind {
    /// mov, leave, lea, xchg: the new value is absolute
    AbsoluteSet,
    RelativeIncrease,
    RelativeDecrease,
    /// ret imm: positive, but only after the return address is popped
    PostPopImmediate,
    /// and with an alignment mask
    MaskAnd,
    NotApplicable,
}

impl AdjustmentKind {
    /// Kinds that get a shared out-of-line fragment.
    pub const SPECIALIZED: [AdjustmentKind; 4] = [
        AdjustmentKind::AbsoluteSet,
        AdjustmentKind::RelativeIncrease,
        AdjustmentKind::RelativeDecrease,
        AdjustmentKind::PostPopImmediate,
    ];

    pub fn is_specialized(self) -> bool {
        Self::SPECIALIZED.contains(&self)
    }

    pub fn is_relative(self) -> bool {
        matches!(
            self,
            AdjustmentKind::RelativeIncrease
                | AdjustmentKind::RelativeDecrease
                | AdjustmentKind::PostPopImmediate
        )
    }

    /// Whether a large delta of this kind may be a stack swap.
    pub fn may_swap(self) -> bool {
        matches!(self, AdjustmentKind::AbsoluteSet | AdjustmentKind::MaskAnd)
    }

    /// Value stored in the tag slot when a site enters the slow path. 0 is never a tag.
    pub const fn tag(self) -> u64 {
        match self {
            AdjustmentKind::AbsoluteSet => 1,
            AdjustmentKind::RelativeIncrease => 2,
            AdjustmentKind::RelativeDecrease => 3,
            AdjustmentKind::PostPopImmediate => 4,
            AdjustmentKind::MaskAnd => 5,
            AdjustmentKind::NotApplicable => 0,
        }
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(AdjustmentKind::AbsoluteSet),
            2 => Some(AdjustmentKind::RelativeIncrease),
            3 => Some(AdjustmentKind::RelativeDecrease),
            4 => Some(AdjustmentKind::PostPopImmediate),
            5 => Some(AdjustmentKind::MaskAnd),
            _ => None,
        }
    }
}

/// Whether the arithmetic flags hold application values across a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlagsLiveness {
    Dead,
    Live,
}

impl FlagsLiveness {
    pub const ALL: [FlagsLiveness; 2] = [FlagsLiveness::Dead, FlagsLiveness::Live];

    pub fn from_live(live: bool) -> Self {
        if live {
            FlagsLiveness::Live
        } else {
            FlagsLiveness::Dead
        }
    }

    pub fn is_live(self) -> bool {
        self == FlagsLiveness::Live
    }
}

/// Identifies one shared fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecializationKey {
    pub flags: FlagsLiveness,
    pub kind: AdjustmentKind,
}

impl SpecializationKey {
    pub fn new(flags: FlagsLiveness, kind: AdjustmentKind) -> Self {
        Self { flags, kind }
    }

    /// Every key that has a fragment, flags-major.
    pub fn all() -> impl Iterator<Item = SpecializationKey> {
        FlagsLiveness::ALL.iter().flat_map(|&flags| {
            AdjustmentKind::SPECIALIZED
                .iter()
                .map(move |&kind| SpecializationKey { flags, kind })
        })
    }
}

/// What the shadow model tracks for the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Addressability and definedness of every granule.
    Full,
    /// Leak detection only: new stack is zeroed, shrinking is ignored.
    Lightweight,
}
