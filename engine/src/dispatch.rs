//! Dispatcher, §4.F.
//!
//! Semantics (metric formulas, penalty banding, wrapup/ringinuse filters,
//! failure-cause device-state mapping) are grounded on
//! `original_source/apps/app_queue.c`'s `calc_metric`/`ring_one`/
//! `try_calling`; expressed here as a `Transport`-driven state walk in the
//! teacher's one-file-one-concern style.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;

use crate::events::{emit, queue_log, Event, QueueLogEvent};
use crate::member::Member;
use crate::queue::Queue;
use crate::store::QueueStore;
use crate::transport::{BridgeFlags, BridgeResult, CallVars, CallerEvent, Channel, LegEvent, Transport};
use crate::types::{DeviceState, Strategy, Terminator};

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Per-call options that shape one dispatch attempt, the typed
/// generalization of the dialplan `Queue()` application's option string,
/// §9 ("accept a typed options struct" at internal call sites; the legacy
/// string parser stays at the dialplan/CLI boundary).
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub allow_call_forward: bool,
    pub caller_disconnect: bool,
    pub suppress_ringing_indication: bool,
    pub bridge_flags: BridgeFlags,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Connected { iface: String, holdtime: Duration, terminator: Terminator },
    CallerHangup,
    CallerDisconnect,
    ExitDigit(char),
    RingNoAnswer,
}

struct Eligible {
    member: Arc<Member>,
    metric: i64,
}

/// Step 1 + step 2: snapshot members, score per strategy, apply the
/// penalty filter and the per-attempt eligibility filters.
fn eligible_members(queue: &Queue, max_penalty: u32, store: &QueueStore) -> Vec<Eligible> {
    let cfg = queue.with_config(|c| c.clone());
    let mut ordered: Vec<Arc<Member>> = queue.members.snapshot();
    ordered.sort_by(|a, b| a.iface.cmp(&b.iface));

    let rr_pos = queue.rr_pos();
    let now = SystemTime::now();
    let weight_aware = store.any_weighted();

    let mut out = Vec::new();
    for (idx, member) in ordered.iter().enumerate() {
        if max_penalty > 0 && member.penalty() > max_penalty {
            continue;
        }
        if !member.device_state().is_selectable() {
            continue;
        }
        if member.paused() {
            continue;
        }
        if let Some(last_call) = member.last_call() {
            if now.duration_since(last_call).unwrap_or_default() < cfg.wrapup {
                continue;
            }
        }
        if !cfg.ring_in_use {
            let state = member.device_state();
            if !matches!(state, DeviceState::NotInUse | DeviceState::Unknown) {
                continue;
            }
        }
        if weight_aware && blocked_by_higher_weight_queue(queue, &member.iface, cfg.weight, store) {
            tracing::debug!(target: "acdq::dispatch", iface = %member.iface, "Priority queue delaying dispatch for lower-weight queue");
            continue;
        }

        let metric = match cfg.strategy {
            Strategy::RingAll => 0,
            Strategy::RoundRobinMemory => {
                let pos = (idx + 1) as i64;
                if pos >= rr_pos as i64 {
                    pos
                } else {
                    1000 + pos
                }
            }
            Strategy::Random => rand::thread_rng().gen_range(0..1000),
            Strategy::FewestCalls => member.calls_taken() as i64,
            Strategy::LeastRecent => match member.last_call() {
                None => 0,
                Some(last) => 1_000_000 - now.duration_since(last).unwrap_or_default().as_secs() as i64,
            },
        };
        let metric = if cfg.strategy == Strategy::RingAll {
            metric
        } else {
            metric + member.penalty() as i64 * 1_000_000
        };
        out.push(Eligible { member: member.clone(), metric });
    }
    out
}

/// Weight-aware cross-queue precedence, §4.F step 2 / §9: a member shared
/// with another, higher-weight queue that currently has waiting callers
/// stays reserved for that queue.
fn blocked_by_higher_weight_queue(queue: &Queue, iface: &str, own_weight: u32, store: &QueueStore) -> bool {
    store
        .queues_with_member(iface)
        .iter()
        .any(|other| other.name != queue.name && other.weight() > own_weight && other.waiting_count() > 0)
}

/// Runs one full dispatch cycle for `entry` at the head of `queue`.
pub fn dispatch(
    queue: &Queue,
    entry_id: u64,
    caller: Arc<dyn Channel>,
    vars: &CallVars,
    store: &QueueStore,
    transport: &dyn Transport,
    opts: &DispatchOptions,
) -> DispatchOutcome {
    let cfg = queue.with_config(|c| c.clone());
    let max_penalty = queue.with_entry(entry_id, |e| e.max_penalty).unwrap_or(0);
    let candidates = eligible_members(queue, max_penalty, store);

    if candidates.is_empty() {
        return DispatchOutcome::RingNoAnswer;
    }

    let batch: Vec<Arc<Member>> = if cfg.strategy == Strategy::RingAll {
        candidates.into_iter().map(|c| c.member).collect()
    } else {
        let mut sorted = candidates;
        sorted.sort_by_key(|c| c.metric);
        sorted.into_iter().map(|c| c.member).collect()
    };

    let deadline = Instant::now() + cfg.ring_timeout;

    if cfg.strategy == Strategy::RingAll {
        ring_all(queue, entry_id, &batch, &caller, vars, transport, opts, deadline)
    } else {
        ring_sequential(queue, entry_id, &batch, &caller, vars, transport, opts, deadline)
    }
}

fn ring_all(
    queue: &Queue,
    entry_id: u64,
    batch: &[Arc<Member>],
    caller: &Arc<dyn Channel>,
    vars: &CallVars,
    transport: &dyn Transport,
    opts: &DispatchOptions,
    deadline: Instant,
) -> DispatchOutcome {
    let mut legs: Vec<(Arc<Member>, Arc<dyn Channel>)> = Vec::new();
    for member in batch {
        if queue.with_config(|c| c.member_delay) > Duration::ZERO {
            thread::sleep(queue.with_config(|c| c.member_delay));
        }
        match transport.originate(&member.iface, vars) {
            Ok(chan) => {
                emit(&Event::AgentCalled {
                    queue: queue.name.clone(),
                    iface: member.iface.clone(),
                    uniqueid: caller.unique_id().to_string(),
                    vars: called_vars(queue, vars),
                });
                legs.push((member.clone(), chan));
            }
            Err(cause) => {
                member.set_device_state(DeviceState::from_failure_cause(&cause));
            }
        }
    }

    if legs.is_empty() {
        return DispatchOutcome::RingNoAnswer;
    }

    multiplex(queue, entry_id, &legs, caller, transport, opts, deadline)
}

fn ring_sequential(
    queue: &Queue,
    entry_id: u64,
    batch: &[Arc<Member>],
    caller: &Arc<dyn Channel>,
    vars: &CallVars,
    transport: &dyn Transport,
    opts: &DispatchOptions,
    deadline: Instant,
) -> DispatchOutcome {
    for member in batch {
        if Instant::now() >= deadline {
            break;
        }
        if queue.with_config(|c| c.member_delay) > Duration::ZERO {
            thread::sleep(queue.with_config(|c| c.member_delay));
        }
        let chan = match transport.originate(&member.iface, vars) {
            Ok(c) => c,
            Err(cause) => {
                member.set_device_state(DeviceState::from_failure_cause(&cause));
                advance_rr(queue, member);
                continue;
            }
        };
        emit(&Event::AgentCalled {
            queue: queue.name.clone(),
            iface: member.iface.clone(),
            uniqueid: caller.unique_id().to_string(),
            vars: called_vars(queue, vars),
        });

        let legs = vec![(member.clone(), chan)];
        let per_cycle_deadline = if queue.with_config(|c| c.timeout_restart) {
            Instant::now() + queue.with_config(|c| c.ring_timeout)
        } else {
            deadline
        };
        match multiplex(queue, entry_id, &legs, caller, transport, opts, per_cycle_deadline.min(deadline)) {
            DispatchOutcome::RingNoAnswer => {
                advance_rr(queue, member);
                continue;
            }
            other => return other,
        }
    }
    DispatchOutcome::RingNoAnswer
}

fn advance_rr(queue: &Queue, member: &Arc<Member>) {
    if queue.with_config(|c| c.strategy) == Strategy::RoundRobinMemory {
        let ordered_pos = {
            let mut ifaces: Vec<String> = queue.members.snapshot().iter().map(|m| m.iface.clone()).collect();
            ifaces.sort();
            ifaces.iter().position(|i| i == &member.iface).map(|p| p + 1).unwrap_or(0) as u32
        };
        queue.set_rr_pos(ordered_pos % 1000);
    }
}

/// Step 4: multiplex the caller channel and every outgoing leg until one
/// answers, all fail, the caller hangs up/disconnects/exits, or the
/// deadline passes.
fn multiplex(
    queue: &Queue,
    entry_id: u64,
    legs: &[(Arc<Member>, Arc<dyn Channel>)],
    caller: &Arc<dyn Channel>,
    transport: &dyn Transport,
    opts: &DispatchOptions,
    deadline: Instant,
) -> DispatchOutcome {
    let mut remaining: Vec<(Arc<Member>, Arc<dyn Channel>)> = legs.to_vec();
    let mut rung_indicated = false;

    while Instant::now() < deadline && !remaining.is_empty() {
        match transport.wait_caller(caller, POLL_SLICE) {
            CallerEvent::Hangup => {
                hangup_all(transport, &remaining);
                return DispatchOutcome::CallerHangup;
            }
            CallerEvent::StarDisconnect if opts.caller_disconnect => {
                hangup_all(transport, &remaining);
                return DispatchOutcome::CallerDisconnect;
            }
            CallerEvent::ExitDigit(d) => {
                hangup_all(transport, &remaining);
                return DispatchOutcome::ExitDigit(d);
            }
            _ => {}
        }

        let mut still_ringing = Vec::new();
        for (member, chan) in remaining {
            match transport.wait_leg(&chan, POLL_SLICE) {
                LegEvent::Answer => {
                    hangup_all(transport, &still_ringing);
                    return finish_connected(queue, entry_id, member, chan, caller, transport, opts);
                }
                LegEvent::Busy => {
                    member.set_device_state(DeviceState::Busy);
                }
                LegEvent::Congestion => {}
                LegEvent::Ringing => {
                    if !rung_indicated && !opts.suppress_ringing_indication {
                        transport.indicate_ringing(caller);
                        rung_indicated = true;
                    }
                    still_ringing.push((member, chan));
                }
                LegEvent::CallForward(dest) => {
                    transport.hangup(&chan);
                    if opts.allow_call_forward {
                        if let Ok(fwd_chan) = transport.originate(&dest, &CallVars::default()) {
                            still_ringing.push((member, fwd_chan));
                        }
                    }
                    // Disallowed forwards count as no-answer: simply not
                    // re-queued into `still_ringing`.
                }
                LegEvent::FailedToCreate(cause) => {
                    member.set_device_state(DeviceState::from_failure_cause(&cause));
                }
            }
        }
        remaining = still_ringing;
    }

    hangup_all(transport, &remaining);
    if queue.with_config(|c| c.autopause) {
        for (member, _) in legs {
            member.set_paused(true, Some("Auto-Pause".to_string()));
        }
    }
    DispatchOutcome::RingNoAnswer
}

fn hangup_all(transport: &dyn Transport, legs: &[(Arc<Member>, Arc<dyn Channel>)]) {
    for (_, chan) in legs {
        transport.hangup(chan);
    }
}

/// Step 5: post-answer bookkeeping and the bridge itself.
fn finish_connected(
    queue: &Queue,
    entry_id: u64,
    member: Arc<Member>,
    agent_chan: Arc<dyn Channel>,
    caller: &Arc<dyn Channel>,
    transport: &dyn Transport,
    opts: &DispatchOptions,
) -> DispatchOutcome {
    let now = SystemTime::now();
    member.record_call(now);
    advance_rr_to_metric(queue, &member);

    let holdtime = queue.with_entry(entry_id, |e| e.waited()).unwrap_or(Duration::ZERO);

    emit(&Event::AgentConnect {
        queue: queue.name.clone(),
        iface: member.iface.clone(),
        uniqueid: caller.unique_id().to_string(),
        holdtime_secs: holdtime.as_secs(),
    });
    queue_log(&queue.name, caller.unique_id(), &member.iface, QueueLogEvent::Connect, &[]);

    let result = transport.bridge(caller, &agent_chan, opts.bridge_flags);
    let terminator = match result {
        BridgeResult::EndedByCaller => Terminator::Caller,
        BridgeResult::EndedByAgent => Terminator::Agent,
        BridgeResult::Transferred => Terminator::Transfer,
    };
    emit(&Event::AgentComplete {
        queue: queue.name.clone(),
        iface: member.iface.clone(),
        uniqueid: caller.unique_id().to_string(),
        terminator,
    });
    let log_event = match terminator {
        Terminator::Caller => QueueLogEvent::CompleteCaller,
        Terminator::Agent => QueueLogEvent::CompleteAgent,
        Terminator::Transfer => QueueLogEvent::Transfer,
    };
    queue_log(&queue.name, caller.unique_id(), &member.iface, log_event, &[]);

    DispatchOutcome::Connected { iface: member.iface.clone(), holdtime, terminator }
}

fn advance_rr_to_metric(queue: &Queue, member: &Arc<Member>) {
    if queue.with_config(|c| c.strategy) == Strategy::RoundRobinMemory {
        advance_rr(queue, member);
        queue.set_wrapped(false);
    }
}

fn called_vars(queue: &Queue, vars: &CallVars) -> Option<HashMap<String, String>> {
    match queue.with_config(|c| c.event_when_called) {
        crate::types::EventWhenCalled::Vars => Some(vars.vars.clone()),
        crate::types::EventWhenCalled::Yes => Some(HashMap::new()),
        crate::types::EventWhenCalled::No => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::queue::QueueConfig;
    use crate::transport::mock::MockTransport;

    fn caller() -> Arc<dyn Channel> {
        Arc::new(crate::transport::mock::MockChannel { iface: "caller".into(), id: "call-1".into() })
    }

    #[test]
    fn ring_all_dispatches_all_eligible_members_in_one_cycle() {
        let store = QueueStore::new(true);
        let mut cfg = QueueConfig::default();
        cfg.strategy = Strategy::RingAll;
        cfg.ring_timeout = Duration::from_millis(500);
        let queue = Queue::new("sales", cfg, false);
        queue.members.insert(Arc::new(Member::new("SIP/a", "Alice", 0)));
        queue.members.insert(Arc::new(Member::new("SIP/b", "Bob", 0)));

        let transport = MockTransport::new();
        transport.script("SIP/a", vec![LegEvent::Ringing, LegEvent::Answer]);
        transport.script("SIP/b", vec![LegEvent::Ringing, LegEvent::Busy]);

        let c = caller();
        let outcome = dispatch(&queue, 1, c, &CallVars::default(), &store, &transport, &DispatchOptions::default());
        match outcome {
            DispatchOutcome::Connected { iface, .. } => assert_eq!(iface, "SIP/a"),
            other => panic!("expected Connected, got {other:?}"),
        }
        assert_eq!(queue.members.find("SIP/b").unwrap().device_state(), DeviceState::Busy);
    }

    #[test]
    fn wrapup_blocks_ring() {
        let store = QueueStore::new(true);
        let mut cfg = QueueConfig::default();
        cfg.strategy = Strategy::RingAll;
        cfg.wrapup = Duration::from_secs(30);
        cfg.ring_timeout = Duration::from_millis(200);
        let queue = Queue::new("sales", cfg, false);
        let a = Arc::new(Member::new("SIP/a", "Alice", 0));
        a.record_call(SystemTime::now());
        queue.members.insert(a);

        let transport = MockTransport::new();
        let outcome = dispatch(&queue, 1, caller(), &CallVars::default(), &store, &transport, &DispatchOptions::default());
        assert!(matches!(outcome, DispatchOutcome::RingNoAnswer));
    }

    #[test]
    fn penalty_filter_excludes_higher_penalty_member() {
        let store = QueueStore::new(true);
        let mut cfg = QueueConfig::default();
        cfg.strategy = Strategy::RingAll;
        cfg.ring_timeout = Duration::from_millis(200);
        let queue = Queue::new("sales", cfg, false);
        queue.members.insert(Arc::new(Member::new("SIP/a", "Alice", 5)));
        let transport = MockTransport::new();
        transport.script("SIP/a", vec![LegEvent::Answer]);

        let e = Entry::new(caller(), 0, 1, String::new(), String::new(), None);
        let id = e.id;
        queue.join(e);
        let outcome = dispatch(&queue, id, caller(), &CallVars::default(), &store, &transport, &DispatchOptions::default());
        assert!(matches!(outcome, DispatchOutcome::RingNoAnswer));
    }

    #[test]
    fn caller_hangup_ends_cycle() {
        let store = QueueStore::new(true);
        let mut cfg = QueueConfig::default();
        cfg.strategy = Strategy::RingAll;
        cfg.ring_timeout = Duration::from_millis(500);
        let queue = Queue::new("sales", cfg, false);
        queue.members.insert(Arc::new(Member::new("SIP/a", "Alice", 0)));
        let transport = MockTransport::new();
        transport.script("SIP/a", vec![LegEvent::Ringing]);
        transport.script_caller(vec![CallerEvent::Hangup]);

        let outcome = dispatch(&queue, 1, caller(), &CallVars::default(), &store, &transport, &DispatchOptions::default());
        assert!(matches!(outcome, DispatchOutcome::CallerHangup));
    }
}
