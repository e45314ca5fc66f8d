use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use stackadj_types::kind::TrackingMode;
use stackadj_types::layout::{DEFAULT_SWAP_THRESHOLD, MIN_SWAP_THRESHOLD};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Largest stack pointer change treated as an ordinary adjustment.
    pub stack_swap_threshold: u64,
    pub min_swap_threshold: u64,
    pub mode: TrackingMode,
    /// Use the shared generated fragments instead of always calling out.
    pub esp_fastpath: bool,
    /// Share one slow-path entry rather than inlining the clean call at every site.
    pub shared_slowpath: bool,
    /// React to pushes onto addressable memory by looking for a heap or mmap stack.
    pub check_push: bool,
    pub pause_at_unaddressable: bool,
    pub statistics: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stack_swap_threshold: DEFAULT_SWAP_THRESHOLD,
            min_swap_threshold: MIN_SWAP_THRESHOLD,
            mode: TrackingMode::Full,
            esp_fastpath: true,
            shared_slowpath: true,
            check_push: true,
            pause_at_unaddressable: false,
            statistics: false,
        }
    }
}

impl Options {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let opts: Options = serde_json::from_str(text)?;
        opts.validate()
    }

    /// Checks limits, raising a threshold that starts below the floor.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.min_swap_threshold == 0 {
            return Err(ConfigError::ZeroFloor);
        }
        if self.stack_swap_threshold < self.min_swap_threshold {
            log::warn!(
                "stack swap threshold {:#x} below minimum, using {:#x}",
                self.stack_swap_threshold,
                self.min_swap_threshold
            );
            self.stack_swap_threshold = self.min_swap_threshold;
        }
        if self.stack_swap_threshold > i32::MAX as u64 {
            return Err(ConfigError::ThresholdTooLarge(self.stack_swap_threshold));
        }
        Ok(self)
    }

    pub fn shadows_stack(&self) -> bool {
        self.mode == TrackingMode::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let opts = Options::from_json(r#"{"mode": "lightweight", "check_push": false}"#).unwrap();
        assert_eq!(opts.mode, TrackingMode::Lightweight);
        assert!(!opts.check_push);
        assert_eq!(opts.stack_swap_threshold, 0x9000);
        assert_eq!(opts.min_swap_threshold, 2048);
        assert!(opts.esp_fastpath);
    }

    #[test]
    fn threshold_raised_to_floor() {
        let opts = Options::from_json(r#"{"stack_swap_threshold": 100}"#).unwrap();
        assert_eq!(opts.stack_swap_threshold, 2048);
    }

    #[test]
    fn rejects_bad_limits() {
        assert!(matches!(
            Options::from_json(r#"{"min_swap_threshold": 0}"#),
            Err(ConfigError::ZeroFloor)
        ));
        assert!(matches!(
            Options::from_json(r#"{"stack_swap_threshold": 4294967296}"#),
            Err(ConfigError::ThresholdTooLarge(_))
        ));
        assert!(matches!(Options::from_json("{"), Err(ConfigError::Json(_))));
    }
}
