//! Alert policy for crash escalation.

use serde::{Deserialize, Serialize};

/// When the supervisor alerts relative to its crash threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPolicy {
    /// Alert exactly once, when the crash count equals the threshold.
    #[default]
    Once,
    /// Alert whenever the crash count is a positive multiple of the threshold.
    EveryMultiple,
}

impl AlertPolicy {
    /// Decide whether reaching `crash_count` should raise an alert.
    #[must_use]
    pub fn should_alert(self, crash_count: u64, threshold: u64) -> bool {
        if threshold == 0 || crash_count == 0 {
            return false;
        }
        match self {
            Self::Once => crash_count == threshold,
            Self::EveryMultiple => crash_count % threshold == 0,
        }
    }
}
