//! Event/log emitter, §4.I.
//!
//! Grounded on `cli/src/nonosctl/logging.rs`'s `LogKind` enum + `log_event`
//! function shape: one enum of kinds, one function that stamps a time and
//! routes to a sink. The teacher signs/HMACs every line for an audit trail
//! this spec doesn't ask for (dropped); what's kept is rebuilt on
//! `tracing` so a real deployment can route these to whatever subscriber
//! it wants (structured JSON, a metrics pipeline, plain text) without this
//! crate choosing for it.

use std::collections::HashMap;

use crate::types::Terminator;

/// Management-bus event names, fixed for compatibility, §4.I.
#[derive(Debug, Clone)]
pub enum Event {
    Join { queue: String, uniqueid: String, position: usize },
    Leave { queue: String, uniqueid: String, count: usize },
    QueueMemberAdded { queue: String, iface: String },
    QueueMemberRemoved { queue: String, iface: String },
    QueueMemberPaused { queue: String, iface: String, paused: bool, reason: Option<String> },
    QueueMemberStatus { queue: String, iface: String, state: String },
    AgentCalled { queue: String, iface: String, uniqueid: String, vars: Option<HashMap<String, String>> },
    AgentConnect { queue: String, iface: String, uniqueid: String, holdtime_secs: u64 },
    AgentComplete { queue: String, iface: String, uniqueid: String, terminator: Terminator },
    QueueCallerAbandon { queue: String, uniqueid: String, position: usize, wait_secs: u64 },
}

/// Emits `event` to the management bus. A real deployment wires this
/// module's sink to whatever transport carries manager events; here it's
/// `tracing::info!`, matched against in tests with `tracing`'s
/// capture-to-string test subscribers or simply by calling the pure
/// formatting helpers below directly.
pub fn emit(event: &Event) {
    tracing::info!(target: "acdq::events", event = %describe(event));
}

fn describe(event: &Event) -> String {
    match event {
        Event::Join { queue, uniqueid, position } => {
            format!("Join queue={queue} uniqueid={uniqueid} position={position}")
        }
        Event::Leave { queue, uniqueid, count } => {
            format!("Leave queue={queue} uniqueid={uniqueid} count={count}")
        }
        Event::QueueMemberAdded { queue, iface } => {
            format!("QueueMemberAdded queue={queue} iface={iface}")
        }
        Event::QueueMemberRemoved { queue, iface } => {
            format!("QueueMemberRemoved queue={queue} iface={iface}")
        }
        Event::QueueMemberPaused { queue, iface, paused, reason } => {
            format!(
                "QueueMemberPaused queue={queue} iface={iface} paused={paused} reason={}",
                reason.as_deref().unwrap_or("-")
            )
        }
        Event::QueueMemberStatus { queue, iface, state } => {
            format!("QueueMemberStatus queue={queue} iface={iface} state={state}")
        }
        Event::AgentCalled { queue, iface, uniqueid, vars } => {
            format!(
                "AgentCalled queue={queue} iface={iface} uniqueid={uniqueid} vars={}",
                vars.as_ref().map(|v| v.len()).unwrap_or(0)
            )
        }
        Event::AgentConnect { queue, iface, uniqueid, holdtime_secs } => {
            format!("AgentConnect queue={queue} iface={iface} uniqueid={uniqueid} holdtime={holdtime_secs}")
        }
        Event::AgentComplete { queue, iface, uniqueid, terminator } => {
            format!("AgentComplete queue={queue} iface={iface} uniqueid={uniqueid} terminator={terminator:?}")
        }
        Event::QueueCallerAbandon { queue, uniqueid, position, wait_secs } => {
            format!("QueueCallerAbandon queue={queue} uniqueid={uniqueid} position={position} wait={wait_secs}")
        }
    }
}

/// Structured queue-log line kinds, §4.I. One pipe-separated record per
/// emission, written through `queue_log` (component J's surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLogEvent {
    EnterQueue,
    Abandon,
    ExitEmpty,
    ExitWithTimeout,
    ExitWithKey,
    RingNoAnswer,
    Connect,
    CompleteCaller,
    CompleteAgent,
    Transfer,
    AddMember,
    RemoveMember,
    Pause,
    Unpause,
}

impl QueueLogEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueLogEvent::EnterQueue => "ENTERQUEUE",
            QueueLogEvent::Abandon => "ABANDON",
            QueueLogEvent::ExitEmpty => "EXITEMPTY",
            QueueLogEvent::ExitWithTimeout => "EXITWITHTIMEOUT",
            QueueLogEvent::ExitWithKey => "EXITWITHKEY",
            QueueLogEvent::RingNoAnswer => "RINGNOANSWER",
            QueueLogEvent::Connect => "CONNECT",
            QueueLogEvent::CompleteCaller => "COMPLETECALLER",
            QueueLogEvent::CompleteAgent => "COMPLETEAGENT",
            QueueLogEvent::Transfer => "TRANSFER",
            QueueLogEvent::AddMember => "ADDMEMBER",
            QueueLogEvent::RemoveMember => "REMOVEMEMBER",
            QueueLogEvent::Pause => "PAUSE",
            QueueLogEvent::Unpause => "UNPAUSE",
        }
    }
}

/// Writes one pipe-separated queue-log line:
/// `timestamp|queue|uniqueid|agent|EVENT|params...`. The original engine
/// prefixes each line with an epoch-seconds column; this one uses an
/// RFC3339 stamp instead, the same format `logging.rs` stamped its own
/// audit lines with.
pub fn queue_log(queue: &str, uniqueid: &str, agent: &str, event: QueueLogEvent, params: &[&str]) {
    let timestamp = chrono::Utc::now().to_rfc3339();
    let line = if params.is_empty() {
        format!("{timestamp}|{queue}|{uniqueid}|{agent}|{}", event.as_str())
    } else {
        format!("{timestamp}|{queue}|{uniqueid}|{agent}|{}|{}", event.as_str(), params.join("|"))
    };
    tracing::info!(target: "acdq::queue_log", line = %line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_log_line_is_pipe_separated() {
        // Exercised for its formatting only; `tracing` output itself is
        // validated in the scenario tests via a capturing subscriber.
        let event = Event::Join { queue: "sales".into(), uniqueid: "u1".into(), position: 1 };
        assert_eq!(describe(&event), "Join queue=sales uniqueid=u1 position=1");
    }
}
