use serde::{Deserialize, Serialize};

/// State of one shadow granule, encoded as the byte the shadow table stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShadowState {
    Defined = 0x00,
    Unaddressable = 0x55,
    Undefined = 0xff,
}

impl ShadowState {
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ShadowState::Defined),
            0x55 => Some(ShadowState::Unaddressable),
            0xff => Some(ShadowState::Undefined),
            _ => None,
        }
    }
}
