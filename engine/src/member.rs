//! Per-queue member registry, §4.A.
//!
//! Grounded on `kernel/src/modules/registry.rs`'s
//! `RwLock<BTreeMap<Key, Meta>>` + register/unregister/list-by-clone shape,
//! generalized to a `HashMap` (the spec calls for a hash-indexed container)
//! and to `Arc<Member>` handles instead of whole-value clones, so a snapshot
//! taken by the dispatcher still observes mutations applied through the
//! registry after the snapshot was taken.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use crate::types::DeviceState;

/// Mutable member state, guarded by `Member::inner`. Interface string is
/// immutable for the member's lifetime and lives outside the lock so
/// lookups don't need to acquire it.
#[derive(Debug)]
pub struct MemberInner {
    pub name: String,
    pub penalty: u32,
    pub calls_taken: u64,
    pub last_call: Option<SystemTime>,
    pub dynamic: bool,
    pub realtime: bool,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub device_state: DeviceState,
    /// Not seen in the latest realtime snapshot; reload-pass transient.
    pub dead: bool,
    /// Marked for removal at the end of a reload pass.
    pub delme: bool,
}

#[derive(Debug)]
pub struct Member {
    /// `tech/location`, unique within the owning queue. The original
    /// engine hashes this by compressing the location portion to 5
    /// characters; a `std::collections::HashMap` already distributes
    /// arbitrary-length keys well, so no bespoke compression is carried
    /// over — equality stays the full, case-sensitive string per §4.A.
    pub iface: String,
    inner: Mutex<MemberInner>,
}

impl Member {
    pub fn new(iface: impl Into<String>, name: impl Into<String>, penalty: u32) -> Self {
        Member {
            iface: iface.into(),
            inner: Mutex::new(MemberInner {
                name: name.into(),
                penalty,
                calls_taken: 0,
                last_call: None,
                dynamic: false,
                realtime: false,
                paused: false,
                pause_reason: None,
                device_state: DeviceState::Unknown,
                dead: false,
                delme: false,
            }),
        }
    }

    pub fn with_inner<R>(&self, f: impl FnOnce(&MemberInner) -> R) -> R {
        f(&self.inner.lock().expect("member lock poisoned"))
    }

    pub fn with_inner_mut<R>(&self, f: impl FnOnce(&mut MemberInner) -> R) -> R {
        f(&mut self.inner.lock().expect("member lock poisoned"))
    }

    pub fn penalty(&self) -> u32 {
        self.with_inner(|i| i.penalty)
    }

    pub fn paused(&self) -> bool {
        self.with_inner(|i| i.paused)
    }

    pub fn device_state(&self) -> DeviceState {
        self.with_inner(|i| i.device_state)
    }

    pub fn set_device_state(&self, state: DeviceState) {
        self.with_inner_mut(|i| i.device_state = state);
    }

    pub fn set_paused(&self, paused: bool, reason: Option<String>) {
        self.with_inner_mut(|i| {
            i.paused = paused;
            i.pause_reason = reason;
        });
    }

    pub fn last_call(&self) -> Option<SystemTime> {
        self.with_inner(|i| i.last_call)
    }

    pub fn record_call(&self, at: SystemTime) {
        self.with_inner_mut(|i| {
            i.calls_taken += 1;
            i.last_call = Some(at);
        });
    }

    pub fn calls_taken(&self) -> u64 {
        self.with_inner(|i| i.calls_taken)
    }

    pub fn is_dynamic(&self) -> bool {
        self.with_inner(|i| i.dynamic)
    }
}

/// Per-queue set of members. Lookup, insert, unlink, snapshot-iterate.
#[derive(Debug, Default)]
pub struct MemberRegistry {
    members: RwLock<HashMap<String, Arc<Member>>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        MemberRegistry {
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn find(&self, iface: &str) -> Option<Arc<Member>> {
        self.members.read().expect("registry lock poisoned").get(iface).cloned()
    }

    pub fn contains(&self, iface: &str) -> bool {
        self.members.read().expect("registry lock poisoned").contains_key(iface)
    }

    /// Inserts a new member. Returns `false` without mutation if one with
    /// the same interface already exists (§7 `AlreadyExists`: no event, no
    /// log — the caller decides what to do with that).
    pub fn insert(&self, member: Arc<Member>) -> bool {
        let mut guard = self.members.write().expect("registry lock poisoned");
        if guard.contains_key(&member.iface) {
            return false;
        }
        guard.insert(member.iface.clone(), member);
        true
    }

    pub fn remove(&self, iface: &str) -> Option<Arc<Member>> {
        self.members.write().expect("registry lock poisoned").remove(iface)
    }

    pub fn len(&self) -> usize {
        self.members.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable snapshot of the members currently registered. Each element is
    /// a shared reference, so unlinking a member elsewhere during or after
    /// this call never invalidates a handle already handed out.
    pub fn snapshot(&self) -> Vec<Arc<Member>> {
        self.members
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Marks every static (non-realtime) member `delme`, the start of a
    /// reload pass, §4.C / §9 ("diff the incoming config snapshot against
    /// the current container").
    pub fn mark_all_delme(&self) {
        for m in self.snapshot() {
            m.with_inner_mut(|i| {
                if !i.realtime {
                    i.delme = true;
                }
            });
        }
    }

    /// Clears `delme` on a surviving member re-seen during a reload pass.
    pub fn mark_survivor(&self, iface: &str) {
        if let Some(m) = self.find(iface) {
            m.with_inner_mut(|i| i.delme = false);
        }
    }

    /// Marks every realtime member `dead`, the start of a realtime snapshot
    /// refresh: "not seen in latest realtime snapshot" transient bit, §3.
    pub fn mark_all_dead_realtime(&self) {
        for m in self.snapshot() {
            m.with_inner_mut(|i| {
                if i.realtime {
                    i.dead = true;
                }
            });
        }
    }

    pub fn mark_seen_in_snapshot(&self, iface: &str) {
        if let Some(m) = self.find(iface) {
            m.with_inner_mut(|i| i.dead = false);
        }
    }

    /// Removes every member still flagged `dead` after a realtime snapshot
    /// refresh.
    pub fn sweep_dead(&self) -> Vec<String> {
        let mut guard = self.members.write().expect("registry lock poisoned");
        let doomed: Vec<String> = guard
            .values()
            .filter(|m| m.with_inner(|i| i.dead))
            .map(|m| m.iface.clone())
            .collect();
        for iface in &doomed {
            guard.remove(iface);
        }
        doomed
    }

    /// Removes every member still flagged `delme` at the end of a reload
    /// pass. Returns the interfaces removed, so the caller can also drop
    /// them from the interface index.
    pub fn sweep_delme(&self) -> Vec<String> {
        let mut guard = self.members.write().expect("registry lock poisoned");
        let doomed: Vec<String> = guard
            .values()
            .filter(|m| m.with_inner(|i| i.delme))
            .map(|m| m.iface.clone())
            .collect();
        for iface in &doomed {
            guard.remove(iface);
        }
        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_duplicate_interface() {
        let reg = MemberRegistry::new();
        assert!(reg.insert(Arc::new(Member::new("SIP/a", "Alice", 0))));
        assert!(!reg.insert(Arc::new(Member::new("SIP/a", "Alice2", 0))));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn snapshot_survives_concurrent_unlink() {
        let reg = MemberRegistry::new();
        reg.insert(Arc::new(Member::new("SIP/a", "Alice", 0)));
        let snap = reg.snapshot();
        reg.remove("SIP/a");
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].iface, "SIP/a");
    }

    #[test]
    fn invalid_device_state_never_selectable() {
        let m = Member::new("SIP/a", "Alice", 0);
        m.set_device_state(DeviceState::Invalid);
        assert!(!m.device_state().is_selectable());
    }

    #[test]
    fn reload_sweep_removes_only_delme() {
        let reg = MemberRegistry::new();
        let a = Arc::new(Member::new("SIP/a", "Alice", 0));
        let b = Arc::new(Member::new("SIP/b", "Bob", 0));
        reg.insert(a.clone());
        reg.insert(b.clone());
        reg.mark_all_delme();
        reg.mark_survivor("SIP/a");
        let removed = reg.sweep_delme();
        assert_eq!(removed, vec!["SIP/b".to_string()]);
        assert!(reg.contains("SIP/a"));
        assert!(!reg.contains("SIP/b"));
    }
}
