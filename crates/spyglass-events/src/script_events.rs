use serde::{Deserialize, Serialize};
use std::fmt;

/// Running state of a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScriptRunningState {
    /// Registered but never run
    NotStarted = 0,
    /// Body is being evaluated
    Running = 1,
    /// Evaluation completed with no value or a truthy value
    Finished = 2,
    /// Evaluation returned `false`, or a stop request was honored
    Stopped = 3,
    /// Evaluation raised an error
    Failed = 4,
    /// The watchdog saw no heartbeat within the script's timeout
    Frozen = 5,
}

impl ScriptRunningState {
    /// Decode a state previously stored with `as u8`
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NotStarted),
            1 => Some(Self::Running),
            2 => Some(Self::Finished),
            3 => Some(Self::Stopped),
            4 => Some(Self::Failed),
            5 => Some(Self::Frozen),
            _ => None,
        }
    }

    /// Whether the state ends a run (Frozen is advisory and does not)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ScriptRunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "Not started",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
            Self::Frozen => "Not responding",
        };
        f.write_str(label)
    }
}

/// Published on every state transition of a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptStateChanged {
    pub script_id: String,
    pub new_state: ScriptRunningState,
}

impl ScriptStateChanged {
    pub fn new(script_id: impl Into<String>, new_state: ScriptRunningState) -> Self {
        Self {
            script_id: script_id.into(),
            new_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_survives_u8_storage() {
        for state in [
            ScriptRunningState::NotStarted,
            ScriptRunningState::Running,
            ScriptRunningState::Frozen,
        ] {
            assert_eq!(ScriptRunningState::from_u8(state as u8), Some(state));
        }
        assert_eq!(ScriptRunningState::from_u8(42), None);
    }

    #[test]
    fn test_frozen_is_not_terminal() {
        assert!(!ScriptRunningState::Frozen.is_terminal());
        assert!(!ScriptRunningState::Running.is_terminal());
        assert!(ScriptRunningState::Failed.is_terminal());
        assert!(ScriptRunningState::Stopped.is_terminal());
    }

    #[test]
    fn test_display_labels() {
        assert_eq!(ScriptRunningState::Frozen.to_string(), "Not responding");
        assert_eq!(ScriptRunningState::NotStarted.to_string(), "Not started");
    }
}
