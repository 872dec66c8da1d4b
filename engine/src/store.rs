//! Queue store, §4.C.
//!
//! Same registry shape as `member.rs`/`iface_index.rs` (grounded on
//! `kernel/src/modules/registry.rs`), scaled up to own `Arc<Queue>` values
//! and to run the reload/hydration algorithms §4.C specifies. This is the
//! outermost lock in the order from §5: store → queue → member-container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::{FileConfig, MemberLine, QueueSection};
use crate::iface_index::InterfaceIndex;
use crate::member::Member;
use crate::queue::{Queue, QueueConfig};

/// The "external config source" collaborator for realtime queues, §4.C.
/// Per §9's open question, a missing row and a backend error are both
/// modeled as `None` — the spec preserves that conflation rather than
/// distinguishing them.
pub trait RealtimeSource: Send + Sync {
    fn load_queue(&self, name: &str) -> Option<QueueSection>;
    fn load_members(&self, name: &str) -> Vec<MemberLine>;
}

/// No realtime backend configured — every lookup misses.
pub struct NoRealtime;
impl RealtimeSource for NoRealtime {
    fn load_queue(&self, _name: &str) -> Option<QueueSection> {
        None
    }
    fn load_members(&self, _name: &str) -> Vec<MemberLine> {
        Vec::new()
    }
}

pub struct QueueStore {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    /// §9 design note: "Acquire the store lock around the whole dispatch
    /// build phase only if any queue has `weight > 0`... tracked by a
    /// single atomic counter incremented at config load". Counts queues
    /// with nonzero weight currently in the store.
    weighted_queues: AtomicUsize,
    keep_stats: bool,
}

fn key(name: &str) -> String {
    name.to_lowercase()
}

impl QueueStore {
    pub fn new(keep_stats: bool) -> Self {
        QueueStore {
            queues: RwLock::new(HashMap::new()),
            weighted_queues: AtomicUsize::new(0),
            keep_stats,
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().expect("store lock poisoned").get(&key(name)).cloned()
    }

    pub fn any_weighted(&self) -> bool {
        self.weighted_queues.load(Ordering::Acquire) > 0
    }

    /// All queues currently in the store, for weight-aware dispatch (§4.F
    /// step 2) and for administrative listing.
    pub fn snapshot(&self) -> Vec<Arc<Queue>> {
        self.queues.read().expect("store lock poisoned").values().cloned().collect()
    }

    fn insert_counting_weight(&self, name: String, queue: Arc<Queue>) {
        if queue.weight() > 0 {
            self.weighted_queues.fetch_add(1, Ordering::AcqRel);
        }
        self.queues.write().expect("store lock poisoned").insert(name, queue);
    }

    fn remove_counting_weight(&self, name: &str) -> Option<Arc<Queue>> {
        let removed = self.queues.write().expect("store lock poisoned").remove(name);
        if let Some(q) = &removed {
            if q.weight() > 0 {
                self.weighted_queues.fetch_sub(1, Ordering::AcqRel);
            }
        }
        removed
    }

    /// Adjusts the weighted-queue counter for a config swap on an existing
    /// queue, where `insert_counting_weight`/`remove_counting_weight` don't
    /// apply (the queue isn't being inserted or removed from the map).
    fn adjust_weight_transition(&self, old_weight: u32, new_weight: u32) {
        match (old_weight > 0, new_weight > 0) {
            (false, true) => {
                self.weighted_queues.fetch_add(1, Ordering::AcqRel);
            }
            (true, false) => {
                self.weighted_queues.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    /// Merges static config with a realtime row (if configured); static
    /// wins on conflict. Creates the queue if missing. Consults the
    /// realtime source *before* taking the store write lock, per §4.C's
    /// "to avoid blocking all queues on a slow backend".
    pub fn load_or_reload(
        &self,
        name: &str,
        static_section: Option<&QueueSection>,
        realtime: &dyn RealtimeSource,
        iface_index: &InterfaceIndex,
        autofill: bool,
    ) -> Arc<Queue> {
        if let Some(existing) = self.find(name) {
            if let Some(section) = static_section {
                warn_on_unknown_keys(name, section);
                let old_weight = existing.weight();
                existing.replace_config(QueueConfig::from(section).with_autofill(autofill));
                self.adjust_weight_transition(old_weight, existing.weight());
                apply_static_members(&existing, section, iface_index);
            } else if existing.realtime {
                refresh_realtime_members(&existing, realtime, iface_index);
            }
            return existing;
        }

        let (section_owned, is_realtime);
        let section: QueueSection = if let Some(s) = static_section {
            warn_on_unknown_keys(name, s);
            is_realtime = false;
            section_owned = s.clone();
            section_owned
        } else if let Some(rt) = realtime.load_queue(name) {
            is_realtime = true;
            section_owned = rt;
            section_owned
        } else {
            return Arc::new(Queue::new(name, QueueConfig::default(), false));
        };

        let queue = Arc::new(Queue::new(name, QueueConfig::from(&section).with_autofill(autofill), is_realtime));
        if is_realtime {
            for row in realtime.load_members(name) {
                let m = Arc::new(Member::new(row.iface.clone(), row.name.clone(), row.penalty));
                m.with_inner_mut(|i| i.realtime = true);
                queue.members.insert(m);
                iface_index.add(&row.iface);
            }
        } else {
            apply_static_members(&queue, &section, iface_index);
        }
        self.insert_counting_weight(key(name), queue.clone());
        queue
    }

    /// Full reload pass, §4.C: mark every non-realtime queue dead and every
    /// static member `delme`, re-parse config, clear the mark on
    /// survivors, unlink everything still unmarked at the end.
    pub fn reload_all(&self, file: &FileConfig, realtime: &dyn RealtimeSource, iface_index: &InterfaceIndex) {
        for q in self.snapshot() {
            if !q.realtime {
                q.mark_dead();
            }
            q.mark_found_during_reload(false);
        }

        for (name, section) in &file.queues {
            let queue = self.load_or_reload(name, Some(section), realtime, iface_index, file.general.autofill);
            queue.mark_alive();
            queue.mark_found_during_reload(true);
            if !self.keep_stats {
                queue.reset_counters();
            }
        }

        let doomed: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|q| !q.found_during_reload() && q.waiting_count() == 0)
            .map(|q| key(&q.name))
            .collect();
        for name in doomed {
            self.remove_counting_weight(&name);
        }
    }

    /// Every queue currently holding a member with this interface, for the
    /// device-state worker's fan-out, §4.E.
    pub fn queues_with_member(&self, iface: &str) -> Vec<Arc<Queue>> {
        self.snapshot().into_iter().filter(|q| q.members.contains(iface)).collect()
    }

    /// Unlinks a queue that's dead and has just become empty, §4.D.
    pub fn unlink_if_dead_and_empty(&self, name: &str) {
        if let Some(q) = self.find(name) {
            if q.is_dead() && q.waiting_count() == 0 {
                self.remove_counting_weight(&key(name));
            }
        }
    }
}

fn apply_static_members(queue: &Queue, section: &QueueSection, iface_index: &InterfaceIndex) {
    queue.members.mark_all_delme();
    for row in &section.member {
        if queue.members.contains(&row.iface) {
            queue.members.mark_survivor(&row.iface);
            continue;
        }
        queue.members.insert(Arc::new(Member::new(row.iface.clone(), row.name.clone(), row.penalty)));
        iface_index.add(&row.iface);
    }
    // Dynamically-added members (not present in the static section at all)
    // are never touched by `mark_all_delme` in the first place: that only
    // flags non-realtime members, and dynamic members are non-realtime
    // too, so a static reload would otherwise try to delete them. Survivor
    // marking above only covers rows present in `section.member`; dynamic
    // members are re-marked as survivors here so they ride through.
    for m in queue.members.snapshot() {
        if m.is_dynamic() {
            queue.members.mark_survivor(&m.iface);
        }
    }
    for iface in queue.members.sweep_delme() {
        iface_index.remove_if_unreferenced(&iface);
    }
}

fn refresh_realtime_members(queue: &Queue, realtime: &dyn RealtimeSource, iface_index: &InterfaceIndex) {
    queue.members.mark_all_dead_realtime();
    for row in realtime.load_members(&queue.name) {
        if queue.members.contains(&row.iface) {
            queue.members.mark_seen_in_snapshot(&row.iface);
            continue;
        }
        let m = Arc::new(Member::new(row.iface.clone(), row.name.clone(), row.penalty));
        m.with_inner_mut(|i| i.realtime = true);
        queue.members.insert(m);
        iface_index.add(&row.iface);
    }
    for iface in queue.members.sweep_dead() {
        iface_index.remove_if_unreferenced(&iface);
    }
}

/// Logs unknown static-queue keys detected by `config::parse`, §6. Realtime
/// queues never reach this path, so they tolerate unknown columns silently
/// as specced.
fn warn_on_unknown_keys(name: &str, section: &QueueSection) {
    if !section.unknown_keys.is_empty() {
        tracing::warn!(target: "acdq::store", queue = %name, keys = ?section.unknown_keys, "unknown config keys ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;

    #[test]
    fn reload_drops_queue_absent_from_new_config_when_empty() {
        let store = QueueStore::new(true);
        let iface_index = InterfaceIndex::new();
        let cfg1 = parse(
            r#"
            [sales]
            strategy = "ringall"
        "#,
        )
        .unwrap();
        store.reload_all(&cfg1, &NoRealtime, &iface_index);
        assert!(store.find("sales").is_some());

        let cfg2 = parse("").unwrap();
        store.reload_all(&cfg2, &NoRealtime, &iface_index);
        assert!(store.find("sales").is_none());
    }

    #[test]
    fn dead_queue_with_waiters_survives_reload() {
        let store = QueueStore::new(true);
        let iface_index = InterfaceIndex::new();
        let cfg1 = parse(
            r#"
            [sales]
            strategy = "ringall"
        "#,
        )
        .unwrap();
        store.reload_all(&cfg1, &NoRealtime, &iface_index);
        let q = store.find("sales").unwrap();
        let e = crate::entry::Entry::new(
            Arc::new(crate::transport::mock::MockChannel { iface: "caller".into(), id: "1".into() }),
            0,
            0,
            String::new(),
            String::new(),
            None,
        );
        q.join(e);

        let cfg2 = parse("").unwrap();
        store.reload_all(&cfg2, &NoRealtime, &iface_index);
        assert!(store.find("sales").is_some());
        assert!(store.find("sales").unwrap().is_dead());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let store = QueueStore::new(true);
        let iface_index = InterfaceIndex::new();
        let cfg = parse(
            r#"
            [Sales]
            strategy = "ringall"
        "#,
        )
        .unwrap();
        store.reload_all(&cfg, &NoRealtime, &iface_index);
        assert!(store.find("sales").is_some());
        assert!(store.find("SALES").is_some());
    }

    #[test]
    fn weight_counter_tracks_reload_transition() {
        let store = QueueStore::new(true);
        let iface_index = InterfaceIndex::new();
        let cfg1 = parse(
            r#"
            [sales]
            strategy = "ringall"
        "#,
        )
        .unwrap();
        store.reload_all(&cfg1, &NoRealtime, &iface_index);
        assert!(!store.any_weighted());

        let cfg2 = parse(
            r#"
            [sales]
            strategy = "ringall"
            weight = 5
        "#,
        )
        .unwrap();
        store.reload_all(&cfg2, &NoRealtime, &iface_index);
        assert!(store.any_weighted());

        store.reload_all(&cfg1, &NoRealtime, &iface_index);
        assert!(!store.any_weighted());
    }

    #[test]
    fn static_member_removal_drops_unreferenced_interface() {
        let store = QueueStore::new(true);
        let iface_index = InterfaceIndex::new();
        let cfg1 = parse(
            r#"
            [sales]
            strategy = "ringall"
            member = [{ iface = "SIP/a", penalty = 0, name = "Alice" }]
        "#,
        )
        .unwrap();
        store.reload_all(&cfg1, &NoRealtime, &iface_index);
        assert!(iface_index.is_referenced("SIP/a"));

        let cfg2 = parse(
            r#"
            [sales]
            strategy = "ringall"
        "#,
        )
        .unwrap();
        store.reload_all(&cfg2, &NoRealtime, &iface_index);
        assert!(!iface_index.is_referenced("SIP/a"));
    }
}
