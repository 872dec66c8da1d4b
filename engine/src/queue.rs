//! The queue itself, §3. Holds its member registry, waiting list, counters
//! and runtime flags behind one lock (`inner`) plus the member registry's
//! own finer-grained lock nested inside it, matching the lock order in §5
//! (queue lock, then member-container internal lock).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::config::QueueSection;
use crate::entry::{Entry, EntryList};
use crate::member::MemberRegistry;
use crate::types::{AnnounceHoldtime, EmptyPolicy, EventWhenCalled, Strategy};

/// Config-derived, effectively-immutable-between-reloads settings. Swapped
/// wholesale on reload rather than field-by-field mutated, so a dispatch in
/// flight sees a consistent view either before or after the reload, never
/// a torn mix of old and new keys.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub strategy: Strategy,
    pub ring_timeout: Duration,
    pub retry_interval: Duration,
    pub wrapup: Duration,
    pub maxlen: usize,
    pub weight: u32,
    pub service_level: Duration,
    pub announce_frequency: Duration,
    pub min_announce_frequency: Duration,
    pub periodic_announce_frequency: Duration,
    pub announce_round_seconds: u32,
    pub announce_holdtime: AnnounceHoldtime,
    pub announce_position: bool,
    pub join_empty: EmptyPolicy,
    pub leave_empty: EmptyPolicy,
    pub ring_in_use: bool,
    pub autopause: bool,
    pub timeout_restart: bool,
    pub event_when_called: EventWhenCalled,
    pub event_member_status: bool,
    pub member_delay: Duration,
    pub mask_member_status: bool,
    pub autofill: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            strategy: Strategy::RingAll,
            ring_timeout: Duration::from_secs(15),
            retry_interval: Duration::from_secs(5),
            wrapup: Duration::from_secs(0),
            maxlen: 0,
            weight: 0,
            service_level: Duration::from_secs(0),
            announce_frequency: Duration::from_secs(0),
            min_announce_frequency: Duration::from_secs(0),
            periodic_announce_frequency: Duration::from_secs(0),
            announce_round_seconds: 0,
            announce_holdtime: AnnounceHoldtime::No,
            announce_position: false,
            join_empty: EmptyPolicy::Off,
            leave_empty: EmptyPolicy::Off,
            ring_in_use: true,
            autopause: false,
            timeout_restart: false,
            event_when_called: EventWhenCalled::No,
            event_member_status: false,
            member_delay: Duration::from_millis(0),
            mask_member_status: false,
            autofill: false,
        }
    }
}

impl From<&QueueSection> for QueueConfig {
    fn from(s: &QueueSection) -> Self {
        QueueConfig {
            strategy: s.strategy,
            ring_timeout: s.ring_timeout(),
            retry_interval: s.retry_interval(),
            wrapup: s.wrapup(),
            maxlen: s.maxlen,
            weight: s.weight,
            service_level: s.service_level(),
            announce_frequency: s.announce_frequency(),
            min_announce_frequency: s.min_announce_frequency(),
            periodic_announce_frequency: s.periodic_announce_frequency(),
            announce_round_seconds: s.validated_round_seconds().unwrap_or(0),
            announce_holdtime: s.announce_holdtime,
            announce_position: s.announce_position,
            join_empty: s.joinempty,
            leave_empty: s.leavewhenempty,
            ring_in_use: s.ringinuse,
            autopause: s.autopause,
            timeout_restart: s.timeoutrestart,
            event_when_called: s.eventwhencalled,
            event_member_status: s.eventmemberstatus,
            member_delay: s.member_delay(),
            mask_member_status: s.mask_member_status,
            autofill: false,
        }
    }
}

impl QueueConfig {
    /// `autofill` lives in `[general]`, not the per-queue section, so it's
    /// applied after the `From<&QueueSection>` conversion rather than
    /// inside it.
    pub fn with_autofill(mut self, autofill: bool) -> Self {
        self.autofill = autofill;
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueCounters {
    pub completed: u64,
    pub abandoned: u64,
    pub completed_in_sl: u64,
    /// Recursive exponential filter, coefficient 1/4, §3.
    pub avg_holdtime: Duration,
}

impl QueueCounters {
    pub fn update_holdtime(&mut self, sample: Duration) {
        if self.completed == 0 && self.avg_holdtime.is_zero() {
            self.avg_holdtime = sample;
            return;
        }
        let old = self.avg_holdtime.as_secs_f64();
        let new = sample.as_secs_f64();
        self.avg_holdtime = Duration::from_secs_f64(old + (new - old) / 4.0);
    }
}

struct QueueInner {
    config: QueueConfig,
    entries: EntryList,
    counters: QueueCounters,
    rr_pos: u32,
    wrapped: bool,
}

pub struct Queue {
    pub name: String,
    pub members: MemberRegistry,
    pub realtime: bool,
    dead: AtomicBool,
    found_during_reload: AtomicBool,
    /// Cached copy of `config.weight > 0`, read lock-free by the dispatcher
    /// to decide whether the weight-aware path is even worth taking.
    has_weight: AtomicU32,
    inner: Mutex<QueueInner>,
}

impl Queue {
    pub fn new(name: impl Into<String>, config: QueueConfig, realtime: bool) -> Self {
        let weight = config.weight;
        Queue {
            name: name.into(),
            members: MemberRegistry::new(),
            realtime,
            dead: AtomicBool::new(false),
            found_during_reload: AtomicBool::new(true),
            has_weight: AtomicU32::new(weight),
            inner: Mutex::new(QueueInner {
                config,
                entries: EntryList::new(),
                counters: QueueCounters::default(),
                rr_pos: 0,
                wrapped: false,
            }),
        }
    }

    pub fn weight(&self) -> u32 {
        self.has_weight.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub fn mark_alive(&self) {
        self.dead.store(false, Ordering::Release);
    }

    pub fn mark_found_during_reload(&self, found: bool) {
        self.found_during_reload.store(found, Ordering::Release);
    }

    pub fn found_during_reload(&self) -> bool {
        self.found_during_reload.load(Ordering::Acquire)
    }

    pub fn with_config<R>(&self, f: impl FnOnce(&QueueConfig) -> R) -> R {
        f(&self.inner.lock().expect("queue lock poisoned").config)
    }

    pub fn replace_config(&self, config: QueueConfig) {
        let weight = config.weight;
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        guard.config = config;
        drop(guard);
        self.has_weight.store(weight, Ordering::Relaxed);
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").entries.len()
    }

    pub fn is_full(&self) -> bool {
        let guard = self.inner.lock().expect("queue lock poisoned");
        guard.config.maxlen != 0 && guard.entries.len() >= guard.config.maxlen
    }

    /// Inserts `entry` in priority order. Returns the assigned position.
    pub fn join(&self, entry: Entry) -> usize {
        self.inner.lock().expect("queue lock poisoned").entries.insert(entry)
    }

    /// Removes the entry with `id`. Returns it along with whether the
    /// queue is now dead-and-empty (the caller unlinks from the store in
    /// that case, §4.D).
    pub fn leave(&self, id: u64) -> (Option<Entry>, bool) {
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        let removed = guard.entries.leave(id);
        let now_dead_empty = self.is_dead() && guard.entries.is_empty();
        (removed, now_dead_empty)
    }

    pub fn head_id(&self) -> Option<u64> {
        self.inner.lock().expect("queue lock poisoned").entries.head_id()
    }

    pub fn head_ids(&self, n: usize) -> Vec<u64> {
        self.inner.lock().expect("queue lock poisoned").entries.head_ids(n)
    }

    pub fn position_of(&self, id: u64) -> Option<usize> {
        self.inner.lock().expect("queue lock poisoned").entries.position_of(id)
    }

    pub fn expired_ids(&self) -> Vec<u64> {
        self.inner.lock().expect("queue lock poisoned").entries.expired_ids()
    }

    pub fn with_entry<R>(&self, id: u64, f: impl FnOnce(&crate::entry::Entry) -> R) -> Option<R> {
        self.inner.lock().expect("queue lock poisoned").entries.get(id).map(f)
    }

    pub fn with_entry_mut<R>(&self, id: u64, f: impl FnOnce(&mut crate::entry::Entry) -> R) -> Option<R> {
        self.inner.lock().expect("queue lock poisoned").entries.get_mut(id).map(f)
    }

    pub fn rr_pos(&self) -> u32 {
        self.inner.lock().expect("queue lock poisoned").rr_pos
    }

    pub fn set_rr_pos(&self, pos: u32) {
        self.inner.lock().expect("queue lock poisoned").rr_pos = pos;
    }

    pub fn wrapped(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").wrapped
    }

    pub fn set_wrapped(&self, wrapped: bool) {
        self.inner.lock().expect("queue lock poisoned").wrapped = wrapped;
    }

    pub fn counters(&self) -> QueueCounters {
        self.inner.lock().expect("queue lock poisoned").counters
    }

    pub fn record_completion(&self, holdtime: Duration, within_sl: bool) {
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        guard.counters.completed += 1;
        if within_sl {
            guard.counters.completed_in_sl += 1;
        }
        guard.counters.update_holdtime(holdtime);
    }

    pub fn record_abandon(&self) {
        self.inner.lock().expect("queue lock poisoned").counters.abandoned += 1;
    }

    /// Resets the completed/abandoned/holdtime counters. Used on reload
    /// when `keepstats` is not configured, §4.C.
    pub fn reset_counters(&self) {
        self.inner.lock().expect("queue lock poisoned").counters = QueueCounters::default();
    }

    pub fn now() -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::transport::mock::MockChannel;
    use std::sync::Arc;

    fn chan(id: &str) -> Arc<dyn crate::transport::Channel> {
        Arc::new(MockChannel { iface: "caller".into(), id: id.into() })
    }

    #[test]
    fn counter_law_holds_after_completions() {
        let q = Queue::new("sales", QueueConfig::default(), false);
        q.record_completion(Duration::from_secs(10), true);
        q.record_completion(Duration::from_secs(40), false);
        let c = q.counters();
        assert_eq!(c.completed, 2);
        assert!(c.completed_in_sl <= c.completed);
        assert_eq!(c.completed_in_sl, 1);
    }

    #[test]
    fn dead_queue_with_no_waiters_reports_empty() {
        let q = Queue::new("sales", QueueConfig::default(), false);
        let e = Entry::new(chan("a"), 0, 0, String::new(), String::new(), None);
        let id = e.id;
        q.join(e);
        q.mark_dead();
        let (_, now_dead_empty) = q.leave(id);
        assert!(now_dead_empty);
    }

    #[test]
    fn holdtime_filter_converges_toward_samples() {
        let mut counters = QueueCounters::default();
        for _ in 0..40 {
            counters.update_holdtime(Duration::from_secs(100));
        }
        assert!((counters.avg_holdtime.as_secs_f64() - 100.0).abs() < 1.0);
    }
}
