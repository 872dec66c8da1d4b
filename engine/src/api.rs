//! External-call API, §4.J.
//!
//! The typed surface used by `ctl`, a management plane, and (conceptually)
//! the dialplan-application boundary outside this crate. Grounded on
//! `cli/src/main.rs`'s `Commands` → `nonosctl::*` free-function mapping:
//! one small function per operation, no hidden state beyond what's passed
//! in.

use std::sync::Arc;

use crate::events::{emit, queue_log, Event, QueueLogEvent};
use crate::iface_index::InterfaceIndex;
use crate::member::Member;
use crate::persistence::{self, PersistenceStore};
use crate::store::QueueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMemberStatus {
    Ok,
    Exists,
    NoQueue,
    Oom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMemberStatus {
    Ok,
    NotThere,
    NoQueue,
}

/// Adds a dynamic member to `queue_name`, §4.J / §6's `AddQueueMember`.
/// `persist` controls whether this call writes through to `persistence`
/// (replay calls this with `persist = false`, the "dump=false" path §4.H
/// describes, to avoid write amplification on startup).
pub fn add_member(
    store: &QueueStore,
    iface_index: &InterfaceIndex,
    persistence_store: Option<&dyn PersistenceStore>,
    queue_name: &str,
    iface: &str,
    name: &str,
    penalty: u32,
    paused: bool,
    persist: bool,
) -> AddMemberStatus {
    let Some(queue) = store.find(queue_name) else {
        return AddMemberStatus::NoQueue;
    };

    let member = Arc::new(Member::new(iface, name, penalty));
    member.with_inner_mut(|i| {
        i.dynamic = true;
        i.paused = paused;
    });

    if !queue.members.insert(member) {
        return AddMemberStatus::Exists;
    }
    iface_index.add(iface);

    emit(&Event::QueueMemberAdded { queue: queue.name.clone(), iface: iface.to_string() });
    queue_log(&queue.name, "NONE", iface, QueueLogEvent::AddMember, &[]);

    if persist {
        if let Some(ps) = persistence_store {
            if let Err(e) = persistence::persist_queue(ps, &queue) {
                tracing::error!(target: "acdq::api", queue = %queue.name, error = %e, "persistence write failed");
            }
        }
    }
    AddMemberStatus::Ok
}

/// Removes a member (dynamic or otherwise) from `queue_name`, §4.J / §6's
/// `RemoveQueueMember`.
pub fn remove_member(
    store: &QueueStore,
    iface_index: &InterfaceIndex,
    persistence_store: Option<&dyn PersistenceStore>,
    queue_name: &str,
    iface: &str,
) -> RemoveMemberStatus {
    let Some(queue) = store.find(queue_name) else {
        return RemoveMemberStatus::NoQueue;
    };

    match queue.members.remove(iface) {
        None => RemoveMemberStatus::NotThere,
        Some(member) => {
            iface_index.remove_if_unreferenced(iface);
            emit(&Event::QueueMemberRemoved { queue: queue.name.clone(), iface: iface.to_string() });
            queue_log(&queue.name, "NONE", iface, QueueLogEvent::RemoveMember, &[]);
            if member.is_dynamic() {
                if let Some(ps) = persistence_store {
                    if let Err(e) = persistence::persist_queue(ps, &queue) {
                        tracing::error!(target: "acdq::api", queue = %queue.name, error = %e, "persistence write failed");
                    }
                }
            }
            RemoveMemberStatus::Ok
        }
    }
}

/// Pauses/unpauses `iface` either in one named queue or, if `queue_name`
/// is `None`, everywhere it's a member. Returns the number of queues
/// affected, §4.J's `set_paused(queue_or_all, ...) → count`.
pub fn set_paused(
    store: &QueueStore,
    persistence_store: Option<&dyn PersistenceStore>,
    queue_name: Option<&str>,
    iface: &str,
    reason: Option<String>,
    paused: bool,
) -> usize {
    let queues = match queue_name {
        Some(name) => store.find(name).into_iter().collect::<Vec<_>>(),
        None => store.queues_with_member(iface),
    };

    let mut count = 0;
    for queue in queues {
        let Some(member) = queue.members.find(iface) else {
            continue;
        };
        member.set_paused(paused, reason.clone());
        count += 1;

        emit(&Event::QueueMemberPaused { queue: queue.name.clone(), iface: iface.to_string(), paused, reason: reason.clone() });
        let event = if paused { QueueLogEvent::Pause } else { QueueLogEvent::Unpause };
        let params: Vec<&str> = reason.as_deref().into_iter().collect();
        queue_log(&queue.name, "NONE", iface, event, &params);

        if member.is_dynamic() {
            if let Some(ps) = persistence_store {
                if let Err(e) = persistence::persist_queue(ps, &queue) {
                    tracing::error!(target: "acdq::api", queue = %queue.name, error = %e, "persistence write failed");
                }
            }
        }
    }
    count
}

pub fn waiting_count(store: &QueueStore, queue_name: &str) -> Option<usize> {
    store.find(queue_name).map(|q| q.waiting_count())
}

/// Count of members in `queue_name` currently selectable and idle
/// (Not-in-use/Unknown, not paused) — the same predicate `lifecycle`'s
/// autofill `available_count` uses, exposed here for management queries.
pub fn member_count_available(store: &QueueStore, queue_name: &str) -> Option<usize> {
    let queue = store.find(queue_name)?;
    Some(
        queue
            .members
            .snapshot()
            .iter()
            .filter(|m| {
                !m.paused() && matches!(m.device_state(), crate::types::DeviceState::NotInUse | crate::types::DeviceState::Unknown)
            })
            .count(),
    )
}

#[derive(Debug, Clone)]
pub struct MemberView {
    pub iface: String,
    pub name: String,
    pub penalty: u32,
    pub paused: bool,
    pub dynamic: bool,
    pub calls_taken: u64,
    pub device_state: crate::types::DeviceState,
}

pub fn member_list(store: &QueueStore, queue_name: &str) -> Option<Vec<MemberView>> {
    let queue = store.find(queue_name)?;
    Some(
        queue
            .members
            .snapshot()
            .iter()
            .map(|m| {
                m.with_inner(|i| MemberView {
                    iface: m.iface.clone(),
                    name: i.name.clone(),
                    penalty: i.penalty,
                    paused: i.paused,
                    dynamic: i.dynamic,
                    calls_taken: i.calls_taken,
                    device_state: i.device_state,
                })
            })
            .collect(),
    )
}

/// Snapshot of a queue's counters, for management reporting.
#[derive(Debug, Clone, Copy)]
pub struct VariablesSnapshot {
    pub waiting: usize,
    pub completed: u64,
    pub abandoned: u64,
    pub completed_in_sl: u64,
    pub avg_holdtime_secs: u64,
}

pub fn variables_snapshot(store: &QueueStore, queue_name: &str) -> Option<VariablesSnapshot> {
    let queue = store.find(queue_name)?;
    let counters = queue.counters();
    Some(VariablesSnapshot {
        waiting: queue.waiting_count(),
        completed: counters.completed,
        abandoned: counters.abandoned,
        completed_in_sl: counters.completed_in_sl,
        avg_holdtime_secs: counters.avg_holdtime.as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;
    use crate::store::NoRealtime;
    use crate::types::DeviceState;

    fn store_with_sales() -> (QueueStore, InterfaceIndex) {
        let store = QueueStore::new(true);
        let iface_index = InterfaceIndex::new();
        let cfg = parse(
            r#"
            [sales]
            strategy = "ringall"
        "#,
        )
        .unwrap();
        store.reload_all(&cfg, &NoRealtime, &iface_index);
        (store, iface_index)
    }

    #[test]
    fn add_member_rejects_unknown_queue() {
        let store = QueueStore::new(true);
        let iface_index = InterfaceIndex::new();
        let status = add_member(&store, &iface_index, None, "ghost", "SIP/a", "Alice", 0, false, false);
        assert_eq!(status, AddMemberStatus::NoQueue);
    }

    #[test]
    fn add_then_duplicate_add_reports_exists() {
        let (store, iface_index) = store_with_sales();
        assert_eq!(add_member(&store, &iface_index, None, "sales", "SIP/a", "Alice", 0, false, false), AddMemberStatus::Ok);
        assert_eq!(add_member(&store, &iface_index, None, "sales", "SIP/a", "Alice2", 0, false, false), AddMemberStatus::Exists);
        assert!(iface_index.is_referenced("SIP/a"));
    }

    #[test]
    fn remove_missing_member_reports_not_there() {
        let (store, iface_index) = store_with_sales();
        assert_eq!(remove_member(&store, &iface_index, None, "sales", "SIP/ghost"), RemoveMemberStatus::NotThere);
    }

    #[test]
    fn remove_member_drops_unreferenced_interface() {
        let (store, iface_index) = store_with_sales();
        add_member(&store, &iface_index, None, "sales", "SIP/a", "Alice", 0, false, false);
        assert!(iface_index.is_referenced("SIP/a"));
        assert_eq!(remove_member(&store, &iface_index, None, "sales", "SIP/a"), RemoveMemberStatus::Ok);
        assert!(!iface_index.is_referenced("SIP/a"));
    }

    #[test]
    fn pause_all_affects_every_queue_sharing_the_interface() {
        let store = QueueStore::new(true);
        let iface_index = InterfaceIndex::new();
        let cfg = parse(
            r#"
            [sales]
            strategy = "ringall"
            [support]
            strategy = "ringall"
        "#,
        )
        .unwrap();
        store.reload_all(&cfg, &NoRealtime, &iface_index);
        add_member(&store, &iface_index, None, "sales", "SIP/a", "Alice", 0, false, false);
        add_member(&store, &iface_index, None, "support", "SIP/a", "Alice", 0, false, false);

        let count = set_paused(&store, None, None, "SIP/a", Some("lunch".to_string()), true);
        assert_eq!(count, 2);
        assert!(store.find("sales").unwrap().members.find("SIP/a").unwrap().paused());
        assert!(store.find("support").unwrap().members.find("SIP/a").unwrap().paused());
    }

    #[test]
    fn member_count_available_excludes_paused_and_busy() {
        let (store, iface_index) = store_with_sales();
        add_member(&store, &iface_index, None, "sales", "SIP/a", "Alice", 0, false, false);
        add_member(&store, &iface_index, None, "sales", "SIP/b", "Bob", 0, true, false);
        let queue = store.find("sales").unwrap();
        queue.members.find("SIP/a").unwrap().set_device_state(DeviceState::Unknown);
        assert_eq!(member_count_available(&store, "sales"), Some(1));
    }
}
