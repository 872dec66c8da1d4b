//! The channel/transport layer is an external collaborator (§1 — explicitly
//! out of scope). This module is the seam: a trait the dispatcher and
//! lifecycle modules call through, and the handful of small value types
//! that cross it. Production wiring plugs in a real media stack; tests use
//! the in-memory `mock` implementation below.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A half-duplex media endpoint, owned by the transport layer. The engine
/// only ever holds a cheap, cloneable handle to one.
pub trait Channel: Send + Sync + fmt::Debug {
    /// The `tech/location` this channel is bound to (caller channels don't
    /// necessarily have one that maps to a member; outgoing ring legs do).
    fn interface(&self) -> &str;
    fn unique_id(&self) -> &str;
}

/// Caller-id / ANI / inherited-variable bundle copied onto every outgoing
/// leg the dispatcher originates, §4.F step 3.
#[derive(Debug, Clone, Default)]
pub struct CallVars {
    pub caller_id: String,
    pub ani: String,
    pub rdnis: String,
    pub vars: HashMap<String, String>,
}

/// Observable transitions from an outgoing (ringing) channel, §4.F step 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegEvent {
    Answer,
    Busy,
    Congestion,
    Ringing,
    CallForward(String),
    FailedToCreate(String),
}

/// Observable transitions from the caller's own channel while waiting,
/// §4.F step 4 and §4.G.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerEvent {
    Hangup,
    StarDisconnect,
    ExitDigit(char),
    Idle,
}

/// Per-side feature flags handed to the bridge, §4.F step 5.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeFlags {
    pub caller_transfer: bool,
    pub agent_transfer: bool,
    pub record: bool,
    pub park: bool,
    pub caller_disconnect: bool,
    pub agent_disconnect: bool,
}

/// Who ends a bridge, fed back as `AgentComplete`'s terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeResult {
    EndedByCaller,
    EndedByAgent,
    Transferred,
}

/// The external collaborator itself. Every method may block the calling
/// thread (ringing, waiting, playing a prompt, bridging are all named
/// suspension points in §5) — that's expected; the engine never holds a
/// lock across a call into this trait.
pub trait Transport: Send + Sync {
    /// Requests a new outgoing channel toward `member_iface`, carrying the
    /// caller's native media formats and `vars`. Returns the new channel on
    /// success; `Err` maps to the failure-cause device-state update in
    /// §4.F step 3.
    fn originate(&self, member_iface: &str, vars: &CallVars) -> Result<Arc<dyn Channel>, String>;

    /// Blocks up to `timeout` for the next event on `leg`.
    fn wait_leg(&self, leg: &Arc<dyn Channel>, timeout: Duration) -> LegEvent;

    /// Polls the caller's channel without blocking past `timeout`.
    fn wait_caller(&self, caller: &Arc<dyn Channel>, timeout: Duration) -> CallerEvent;

    fn hangup(&self, channel: &Arc<dyn Channel>);

    /// Propagates ring indication to the caller once per leg that starts
    /// ringing, §4.F step 4, unless the caller suppressed it.
    fn indicate_ringing(&self, caller: &Arc<dyn Channel>);

    /// Issues a "play this prompt id" request — the engine never touches
    /// audio itself, per the Non-goals.
    fn play_prompt(&self, channel: &Arc<dyn Channel>, prompt_id: &str);

    /// Bridges the two legs with the given feature flags, blocking until
    /// the call ends.
    fn bridge(&self, caller: &Arc<dyn Channel>, agent: &Arc<dyn Channel>, flags: BridgeFlags) -> BridgeResult;
}

/// A deterministic in-memory transport for tests. Scripted per interface:
/// queue up the sequence of `LegEvent`s `originate`+`wait_leg` should
/// produce for that member.
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    pub struct MockChannel {
        pub iface: String,
        pub id: String,
    }

    impl Channel for MockChannel {
        fn interface(&self) -> &str {
            &self.iface
        }
        fn unique_id(&self) -> &str {
            &self.id
        }
    }

    pub struct MockTransport {
        scripts: Mutex<HashMap<String, Vec<LegEvent>>>,
        caller_scripts: Mutex<Vec<CallerEvent>>,
        pub bridged: Mutex<Vec<(String, String)>>,
        next_id: Mutex<u64>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                scripts: Mutex::new(HashMap::new()),
                caller_scripts: Mutex::new(Vec::new()),
                bridged: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
            }
        }

        pub fn script(&self, iface: &str, events: Vec<LegEvent>) {
            self.scripts.lock().unwrap().insert(iface.to_string(), events);
        }

        pub fn script_caller(&self, events: Vec<CallerEvent>) {
            *self.caller_scripts.lock().unwrap() = events;
        }

        fn alloc_id(&self) -> String {
            let mut n = self.next_id.lock().unwrap();
            *n += 1;
            format!("mock-{}", n)
        }
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for MockTransport {
        fn originate(&self, member_iface: &str, _vars: &CallVars) -> Result<Arc<dyn Channel>, String> {
            let has_script = self.scripts.lock().unwrap().contains_key(member_iface);
            if !has_script {
                return Err("no-such-driver".to_string());
            }
            Ok(Arc::new(MockChannel {
                iface: member_iface.to_string(),
                id: self.alloc_id(),
            }))
        }

        fn wait_leg(&self, leg: &Arc<dyn Channel>, _timeout: Duration) -> LegEvent {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(leg.interface()) {
                Some(events) if !events.is_empty() => events.remove(0),
                _ => LegEvent::Congestion,
            }
        }

        fn wait_caller(&self, _caller: &Arc<dyn Channel>, _timeout: Duration) -> CallerEvent {
            let mut events = self.caller_scripts.lock().unwrap();
            if events.is_empty() {
                CallerEvent::Idle
            } else {
                events.remove(0)
            }
        }

        fn hangup(&self, _channel: &Arc<dyn Channel>) {}

        fn indicate_ringing(&self, _caller: &Arc<dyn Channel>) {}

        fn play_prompt(&self, _channel: &Arc<dyn Channel>, _prompt_id: &str) {}

        fn bridge(&self, caller: &Arc<dyn Channel>, agent: &Arc<dyn Channel>, _flags: BridgeFlags) -> BridgeResult {
            self.bridged
                .lock()
                .unwrap()
                .push((caller.unique_id().to_string(), agent.unique_id().to_string()));
            BridgeResult::EndedByCaller
        }
    }
}
