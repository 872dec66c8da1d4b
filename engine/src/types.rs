//! Shared enums used across the member registry, queue store, dispatcher
//! and lifecycle. Kept in one module because they're vocabulary, not
//! behavior — every other module imports from here rather than redefining
//! its own flavor of "strategy" or "device state".

use serde::{Deserialize, Serialize};

/// Dispatch policy, §3/§4.F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[serde(rename = "ringall")]
    RingAll,
    #[serde(rename = "leastrecent")]
    LeastRecent,
    #[serde(rename = "fewestcalls")]
    FewestCalls,
    Random,
    #[serde(rename = "rrmemory")]
    RoundRobinMemory,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RingAll
    }
}

/// Member device state, §3 (Member).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Unknown,
    NotInUse,
    InUse,
    Busy,
    Unavailable,
    Invalid,
    Ringing,
}

impl DeviceState {
    /// A member in this state is never chosen, per the Member invariant in §3.
    pub fn is_selectable(self) -> bool {
        !matches!(self, DeviceState::Invalid)
    }

    /// Maps a ring-failure cause to a device-state update, §4.F step 3.
    pub fn from_failure_cause(cause: &str) -> DeviceState {
        match cause {
            "busy" => DeviceState::Busy,
            "unregistered" => DeviceState::Unavailable,
            "no-such-driver" => DeviceState::Invalid,
            _ => DeviceState::Unknown,
        }
    }
}

/// `joinempty` / `leavewhenempty` policy, §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmptyPolicy {
    #[default]
    Off,
    Normal,
    Strict,
    Loose,
}

/// `announce-holdtime`, §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnnounceHoldtime {
    #[default]
    No,
    Yes,
    Once,
}

/// `eventwhencalled`, §6 and SPEC_FULL.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventWhenCalled {
    #[default]
    No,
    Yes,
    Vars,
}

/// `QUEUESTATUS` exit reasons, §4.G.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Timeout,
    Full,
    JoinEmpty,
    LeaveEmpty,
    JoinUnavail,
    LeaveUnavail,
    Continue,
    Unknown,
}

impl ExitReason {
    pub fn as_status(self) -> &'static str {
        match self {
            ExitReason::Timeout => "TIMEOUT",
            ExitReason::Full => "FULL",
            ExitReason::JoinEmpty => "JOINEMPTY",
            ExitReason::LeaveEmpty => "LEAVEEMPTY",
            ExitReason::JoinUnavail => "JOINUNAVAIL",
            ExitReason::LeaveUnavail => "LEAVEUNAVAIL",
            ExitReason::Continue => "CONTINUE",
            ExitReason::Unknown => "UNKNOWN",
        }
    }
}

/// Who ended a bridge, for `AgentComplete`'s terminator field, §4.I.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Caller,
    Agent,
    Transfer,
}
