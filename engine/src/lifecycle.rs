//! Entry lifecycle, §4.G.
//!
//! Replaces the original's `goto out` control flow with a typed state
//! machine (§9): one handler per state, each returning a `Transition` that
//! the driving loop in `run` dispatches on. Grounded on the teacher's own
//! one-arm-one-function `match` in `cli/src/main.rs`, scaled from a static
//! command dispatch to a state machine.

use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{self, DispatchOptions, DispatchOutcome};
use crate::entry::Entry;
use crate::events::{emit, queue_log, Event, QueueLogEvent};
use crate::queue::Queue;
use crate::store::QueueStore;
use crate::transport::{CallVars, Channel, CallerEvent, Transport};
use crate::types::{DeviceState, EmptyPolicy, ExitReason, Strategy};

const TURN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Joining,
    Waiting,
    Dispatching,
    Connected,
    Exited(ExitReason),
}

enum Transition {
    Next(State),
    Exit(ExitReason),
    Connected,
}

/// Outcome handed back to the caller of `run`, the `QUEUESTATUS` the
/// dialplan-facing boundary surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleResult {
    pub status: ExitReason,
    pub answered: bool,
    /// The digit the caller pressed to exit, if `status` is `Continue` via
    /// a DTMF exit rather than a successful connect.
    pub digit: Option<char>,
}

/// Runs one caller through join → (waiting ⇄ dispatching) → connected/exit.
/// Blocks the calling thread for the lifetime of the call, per §5 ("one
/// short-lived task per active caller lifecycle").
pub fn run(
    queue: Arc<Queue>,
    channel: Arc<dyn Channel>,
    vars: CallVars,
    priority: i32,
    max_penalty: u32,
    expire_after: Option<Duration>,
    store: &QueueStore,
    transport: &dyn Transport,
    opts: &DispatchOptions,
) -> LifecycleResult {
    let uniqueid = channel.unique_id().to_string();
    let mut state = State::Joining;
    let mut entry_id: Option<u64> = None;
    let mut digit: Option<char> = None;

    loop {
        let transition = match state {
            State::Joining => handle_joining(&queue, &channel, priority, max_penalty, expire_after, &uniqueid, &mut entry_id),
            State::Waiting => handle_waiting(&queue, entry_id.expect("entry exists once past Joining"), &channel, transport, &mut digit),
            State::Dispatching => handle_dispatching(&queue, entry_id.expect("entry exists once past Joining"), &channel, &vars, store, transport, opts, &mut digit),
            State::Connected => Transition::Exit(ExitReason::Continue),
            State::Exited(reason) => {
                return finish(&queue, entry_id, &uniqueid, reason, reason == ExitReason::Continue, digit);
            }
        };

        state = match transition {
            Transition::Next(s) => s,
            Transition::Exit(reason) => State::Exited(reason),
            Transition::Connected => State::Connected,
        };

        if matches!(state, State::Connected) {
            return finish(&queue, entry_id, &uniqueid, ExitReason::Continue, true, None);
        }
    }
}

fn finish(queue: &Queue, entry_id: Option<u64>, uniqueid: &str, reason: ExitReason, answered: bool, digit: Option<char>) -> LifecycleResult {
    if let Some(id) = entry_id {
        let (removed, now_dead_empty) = queue.leave(id);
        if removed.is_some() {
            emit(&Event::Leave { queue: queue.name.clone(), uniqueid: uniqueid.to_string(), count: queue.waiting_count() });
        }
        if now_dead_empty {
            tracing::debug!(target: "acdq::lifecycle", queue = %queue.name, "dead queue emptied on leave");
        }
    }
    if !answered && reason != ExitReason::Continue {
        log_exit(queue, uniqueid, reason);
    }
    if let Some(d) = digit {
        queue_log(&queue.name, uniqueid, "NONE", QueueLogEvent::ExitWithKey, &[&d.to_string()]);
    }
    LifecycleResult { status: reason, answered, digit }
}

fn log_exit(queue: &Queue, uniqueid: &str, reason: ExitReason) {
    let event = match reason {
        ExitReason::Timeout => Some(QueueLogEvent::ExitWithTimeout),
        ExitReason::JoinEmpty | ExitReason::LeaveEmpty | ExitReason::JoinUnavail | ExitReason::LeaveUnavail => {
            Some(QueueLogEvent::ExitEmpty)
        }
        ExitReason::Full | ExitReason::Continue | ExitReason::Unknown => None,
    };
    if let Some(ev) = event {
        queue_log(&queue.name, uniqueid, "NONE", ev, &[]);
    }
}

/// JOINING: reject on full/empty policy, otherwise insert and emit `Join`.
fn handle_joining(
    queue: &Queue,
    channel: &Arc<dyn Channel>,
    priority: i32,
    max_penalty: u32,
    expire_after: Option<Duration>,
    uniqueid: &str,
    entry_id: &mut Option<u64>,
) -> Transition {
    if queue.is_dead() {
        return Transition::Exit(ExitReason::Unknown);
    }
    if queue.is_full() {
        return Transition::Exit(ExitReason::Full);
    }
    if let Some(reason) = empty_policy_blocks(queue, queue.with_config(|c| c.join_empty), true) {
        return Transition::Exit(reason);
    }

    let entry = Entry::new(channel.clone(), priority, max_penalty, String::new(), String::new(), expire_after);
    let id = entry.id;
    let position = queue.join(entry);
    *entry_id = Some(id);
    emit(&Event::Join { queue: queue.name.clone(), uniqueid: uniqueid.to_string(), position });
    queue_log(&queue.name, uniqueid, "NONE", QueueLogEvent::EnterQueue, &[]);
    Transition::Next(State::Waiting)
}

/// WAITING: poll for expiry, caller hangup, empty-while-waiting, and
/// whether it's our turn (head, or within autofill's `available_count`).
fn handle_waiting(queue: &Queue, entry_id: u64, channel: &Arc<dyn Channel>, transport: &dyn Transport, digit: &mut Option<char>) -> Transition {
    let mut last_announce = std::time::Instant::now();
    loop {
        let expired = queue.with_entry(entry_id, |e| e.expired()).unwrap_or(true);
        if expired {
            return Transition::Exit(ExitReason::Timeout);
        }

        if let Some(reason) = empty_policy_blocks(queue, queue.with_config(|c| c.leave_empty), false) {
            return Transition::Exit(reason);
        }

        match transport.wait_caller(channel, TURN_POLL) {
            CallerEvent::Hangup => {
                let position = queue.position_of(entry_id).unwrap_or(0);
                let wait_secs = queue.with_entry(entry_id, |e| e.waited().as_secs()).unwrap_or(0);
                queue_log(&queue.name, channel.unique_id(), "NONE", QueueLogEvent::Abandon, &[]);
                queue.record_abandon();
                emit(&Event::QueueCallerAbandon {
                    queue: queue.name.clone(),
                    uniqueid: channel.unique_id().to_string(),
                    position,
                    wait_secs,
                });
                return Transition::Exit(ExitReason::Unknown);
            }
            CallerEvent::ExitDigit(d) => {
                *digit = Some(d);
                return Transition::Exit(ExitReason::Continue);
            }
            _ => {}
        }

        if is_our_turn(queue, entry_id) {
            return Transition::Next(State::Dispatching);
        }

        maybe_announce(queue, entry_id, channel, transport, &mut last_announce);
    }
}

/// Periodic/one-shot position-and-holdtime announcement while waiting, §6's
/// `announce-frequency` / `min-announce-frequency` / `announce-holdtime`.
/// `prompt_id` is a bare id; the transport layer owns the actual sound
/// selection and playback, per the Non-goals around audio.
fn maybe_announce(queue: &Queue, entry_id: u64, channel: &Arc<dyn Channel>, transport: &dyn Transport, last_announce: &mut std::time::Instant) {
    let cfg = queue.with_config(|c| c.clone());
    if cfg.announce_frequency.is_zero() {
        return;
    }
    if last_announce.elapsed() < cfg.announce_frequency.max(cfg.min_announce_frequency) {
        return;
    }
    *last_announce = std::time::Instant::now();

    if cfg.announce_position {
        if let Some(position) = queue.position_of(entry_id) {
            transport.play_prompt(channel, &format!("queue-youarenext-or-position:{position}"));
        }
    }
    if !matches!(cfg.announce_holdtime, crate::types::AnnounceHoldtime::No) {
        let avg = queue.counters().avg_holdtime.as_secs();
        if avg > 0 {
            transport.play_prompt(channel, &format!("queue-holdtime:{avg}"));
        }
    }
}

/// DISPATCHING: run one dispatch cycle; on no-answer, go back to waiting
/// unless exhausted; otherwise resolve to connected or an exit reason.
fn handle_dispatching(
    queue: &Queue,
    entry_id: u64,
    channel: &Arc<dyn Channel>,
    vars: &CallVars,
    store: &QueueStore,
    transport: &dyn Transport,
    opts: &DispatchOptions,
    digit: &mut Option<char>,
) -> Transition {
    match dispatch::dispatch(queue, entry_id, channel.clone(), vars, store, transport, opts) {
        DispatchOutcome::Connected { holdtime, .. } => {
            let sl = queue.with_config(|c| c.service_level);
            let within_sl = sl.is_zero() || holdtime <= sl;
            queue.record_completion(holdtime, within_sl);
            Transition::Connected
        }
        DispatchOutcome::CallerHangup => {
            let position = queue.position_of(entry_id).unwrap_or(0);
            let wait_secs = queue.with_entry(entry_id, |e| e.waited().as_secs()).unwrap_or(0);
            queue_log(&queue.name, channel.unique_id(), "NONE", QueueLogEvent::Abandon, &[]);
            queue.record_abandon();
            emit(&Event::QueueCallerAbandon {
                queue: queue.name.clone(),
                uniqueid: channel.unique_id().to_string(),
                position,
                wait_secs,
            });
            Transition::Exit(ExitReason::Unknown)
        }
        DispatchOutcome::CallerDisconnect => Transition::Exit(ExitReason::Continue),
        DispatchOutcome::ExitDigit(d) => {
            *digit = Some(d);
            Transition::Exit(ExitReason::Continue)
        }
        DispatchOutcome::RingNoAnswer => {
            queue_log(&queue.name, channel.unique_id(), "NONE", QueueLogEvent::RingNoAnswer, &[]);
            Transition::Next(State::Waiting)
        }
    }
}

/// `available_count` counts members Not-in-use/Unknown and not paused;
/// ring-all forces 1 regardless, §4.G / §9.
fn available_count(queue: &Queue) -> usize {
    if queue.with_config(|c| c.strategy) == Strategy::RingAll {
        return 1;
    }
    if !queue.with_config(|c| c.autofill) {
        return 1;
    }
    queue
        .members
        .snapshot()
        .iter()
        .filter(|m| !m.paused() && matches!(m.device_state(), DeviceState::NotInUse | DeviceState::Unknown))
        .count()
        .max(1)
}

fn is_our_turn(queue: &Queue, entry_id: u64) -> bool {
    let slots = available_count(queue);
    queue.head_ids(slots).contains(&entry_id)
}

/// Returns `Some(reason)` if the configured empty policy rejects this
/// entry given the queue's current staffing, else `None`. Shared by the
/// join-time (`JOINEMPTY`/`JOINUNAVAIL`) and waiting-time
/// (`LEAVEEMPTY`/`LEAVEUNAVAIL`) checks; `at_join` picks which pair of
/// `ExitReason`s applies.
fn empty_policy_blocks(queue: &Queue, policy: EmptyPolicy, at_join: bool) -> Option<ExitReason> {
    let (empty_reason, unavail_reason) = if at_join {
        (ExitReason::JoinEmpty, ExitReason::JoinUnavail)
    } else {
        (ExitReason::LeaveEmpty, ExitReason::LeaveUnavail)
    };
    match policy {
        EmptyPolicy::Off => None,
        EmptyPolicy::Normal => {
            if queue.members.is_empty() {
                Some(empty_reason)
            } else {
                None
            }
        }
        EmptyPolicy::Strict => {
            if no_member_reachable(queue) {
                Some(unavail_reason)
            } else {
                None
            }
        }
        EmptyPolicy::Loose => {
            if queue.members.is_empty() {
                Some(unavail_reason)
            } else {
                None
            }
        }
    }
}

fn no_member_reachable(queue: &Queue) -> bool {
    queue
        .members
        .snapshot()
        .iter()
        .all(|m| m.paused() || !m.device_state().is_selectable() || matches!(m.device_state(), DeviceState::Unavailable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Member;
    use crate::queue::QueueConfig;
    use crate::transport::mock::{MockChannel, MockTransport};

    fn caller(id: &str) -> Arc<dyn Channel> {
        Arc::new(MockChannel { iface: "caller".into(), id: id.into() })
    }

    #[test]
    fn full_queue_rejects_join() {
        let mut cfg = QueueConfig::default();
        cfg.maxlen = 1;
        let queue = Arc::new(Queue::new("sales", cfg, false));
        let blocker = Entry::new(caller("blocker"), 0, 0, String::new(), String::new(), None);
        queue.join(blocker);

        let store = QueueStore::new(true);
        let transport = MockTransport::new();
        let result = run(
            queue,
            caller("c1"),
            CallVars::default(),
            0,
            0,
            None,
            &store,
            &transport,
            &DispatchOptions::default(),
        );
        assert_eq!(result.status, ExitReason::Full);
        assert!(!result.answered);
    }

    #[test]
    fn strict_join_empty_blocks_when_no_member_reachable() {
        let mut cfg = QueueConfig::default();
        cfg.join_empty = EmptyPolicy::Strict;
        let queue = Arc::new(Queue::new("sales", cfg, false));
        let unavailable = Arc::new(Member::new("SIP/a", "Alice", 0));
        unavailable.set_device_state(DeviceState::Unavailable);
        queue.members.insert(unavailable);

        let store = QueueStore::new(true);
        let transport = MockTransport::new();
        let result = run(
            queue,
            caller("c1"),
            CallVars::default(),
            0,
            0,
            None,
            &store,
            &transport,
            &DispatchOptions::default(),
        );
        assert_eq!(result.status, ExitReason::JoinUnavail);
    }

    #[test]
    fn ring_all_answer_connects() {
        let mut cfg = QueueConfig::default();
        cfg.strategy = Strategy::RingAll;
        cfg.ring_timeout = Duration::from_millis(500);
        let queue = Arc::new(Queue::new("sales", cfg, false));
        queue.members.insert(Arc::new(Member::new("SIP/a", "Alice", 0)));

        let store = QueueStore::new(true);
        let transport = MockTransport::new();
        transport.script("SIP/a", vec![crate::transport::LegEvent::Answer]);

        let result = run(
            queue,
            caller("c1"),
            CallVars::default(),
            0,
            0,
            None,
            &store,
            &transport,
            &DispatchOptions::default(),
        );
        assert!(result.answered);
    }
}
