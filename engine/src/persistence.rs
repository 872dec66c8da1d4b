//! Persistence, §4.H.
//!
//! Grounded on `cli/src/nonosctl/services.rs`/`users.rs`'s load/save
//! round trip: a `serde_json`-backed file keyed by a stable path, tolerant
//! of a missing file, overwritten wholesale on every write. Abstracted
//! behind `PersistenceStore` (§9's "external key-value store" collaborator)
//! so a real deployment can swap in whatever backend its management plane
//! already uses without touching `engine::api`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::member::Member;
use crate::queue::Queue;

const FAMILY: &str = "Queue/PersistentMembers";
const MAX_RECORD_BYTES: usize = 8192;

/// One dynamic member row in the persisted record, §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMember {
    pub iface: String,
    pub penalty: u32,
    pub paused: bool,
    pub name: String,
}

/// The key-value collaborator §9 calls for. `key` is `(family, queue_name)`
/// flattened to a single string by implementations; the trait itself stays
/// oblivious to that detail.
pub trait PersistenceStore: Send + Sync {
    fn save(&self, queue_name: &str, record: &str) -> Result<()>;
    fn delete(&self, queue_name: &str) -> Result<()>;
    /// Enumerates every persisted queue name and its raw record, for
    /// startup replay.
    fn load_all(&self) -> Result<HashMap<String, String>>;
}

/// JSON-file-backed default implementation: one file holding the whole
/// family as `{ queue_name: record }`, rewritten wholesale on every
/// mutation — the same shape as the teacher's `services.rs` registry file.
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|e| Error::Persistence(e.to_string()))?;
            if text.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&text).map_err(|e| Error::Persistence(e.to_string()))?
            }
        } else {
            HashMap::new()
        };
        Ok(JsonFileStore { path, cache: Mutex::new(cache) })
    }

    fn flush(&self, cache: &HashMap<String, String>) -> Result<()> {
        let text = serde_json::to_string_pretty(cache).map_err(|e| Error::Persistence(e.to_string()))?;
        fs::write(&self.path, text).map_err(|e| Error::Persistence(e.to_string()))
    }
}

impl PersistenceStore for JsonFileStore {
    fn save(&self, queue_name: &str, record: &str) -> Result<()> {
        let mut cache = self.cache.lock().expect("persistence cache lock poisoned");
        cache.insert(queue_name.to_string(), record.to_string());
        self.flush(&cache)
    }

    fn delete(&self, queue_name: &str) -> Result<()> {
        let mut cache = self.cache.lock().expect("persistence cache lock poisoned");
        cache.remove(queue_name);
        self.flush(&cache)
    }

    fn load_all(&self) -> Result<HashMap<String, String>> {
        Ok(self.cache.lock().expect("persistence cache lock poisoned").clone())
    }
}

/// Builds the `iface;penalty;paused;name` pipe-joined record for every
/// dynamic member currently in `queue`, §3 / §6, capped at
/// [`MAX_RECORD_BYTES`] with the excess dropped and a warning logged.
pub fn build_record(queue: &Queue) -> String {
    let rows: Vec<String> = queue
        .members
        .snapshot()
        .iter()
        .filter(|m| m.is_dynamic())
        .map(|m| m.with_inner(|i| format!("{};{};{};{}", m.iface, i.penalty, i.paused as u8, i.name)))
        .collect();

    let mut record = rows.join("|");
    if record.len() > MAX_RECORD_BYTES {
        tracing::warn!(target: "acdq::persistence", queue = %queue.name, len = record.len(), "persisted record exceeds 8KiB cap, truncating");
        record.truncate(MAX_RECORD_BYTES);
        if let Some(last_bar) = record.rfind('|') {
            record.truncate(last_bar);
        }
    }
    record
}

/// Writes (or deletes, if the record is now empty) `queue`'s dynamic
/// membership to `store`. Called after every add/remove/pause mutation on
/// a dynamic member, §4.H.
pub fn persist_queue(store: &dyn PersistenceStore, queue: &Queue) -> Result<()> {
    let record = build_record(queue);
    if record.is_empty() {
        store.delete(&queue.name)
    } else {
        store.save(&queue.name, &record)
    }
}

/// Parses a persisted record back into rows. Malformed entries (wrong
/// field count) are skipped; a record with `FAMILY` mismatched keys is the
/// caller's concern, not this parser's.
pub fn parse_record(record: &str) -> Vec<PersistedMember> {
    record
        .split('|')
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let fields: Vec<&str> = entry.split(';').collect();
            if fields.len() != 4 {
                return None;
            }
            Some(PersistedMember {
                iface: fields[0].to_string(),
                penalty: fields[1].parse().ok()?,
                paused: fields[2] == "1",
                name: fields[3].to_string(),
            })
        })
        .collect()
}

/// Re-applies every persisted dynamic member onto `queue` via the standard
/// insert path (not the add-member API, to skip its own `persist` write —
/// "dump=false" in §4.H's terms). A queue no longer present (static or
/// realtime) has its record dropped by the caller instead of replayed.
pub fn replay_into(queue: &Queue, members: &[PersistedMember]) {
    for row in members {
        if queue.members.contains(&row.iface) {
            continue;
        }
        let member = Member::new(row.iface.clone(), row.name.clone(), row.penalty);
        member.with_inner_mut(|i| {
            i.dynamic = true;
            i.paused = row.paused;
        });
        queue.members.insert(std::sync::Arc::new(member));
        crate::events::emit(&crate::events::Event::QueueMemberAdded { queue: queue.name.clone(), iface: row.iface.clone() });
    }
}

/// Default on-disk path for the persistence file, mirroring the teacher's
/// `services.rs` convention of a fixed filename under the working
/// directory (no XDG/dirs dependency, see DESIGN.md's dropped-crate list).
pub fn default_path() -> &'static Path {
    Path::new("acdq-members.json")
}

pub const FAMILY_NAME: &str = FAMILY;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use tempfile::tempdir;

    fn dynamic_member(iface: &str, penalty: u32, paused: bool, name: &str) -> std::sync::Arc<Member> {
        let m = Member::new(iface, name, penalty);
        m.with_inner_mut(|i| {
            i.dynamic = true;
            i.paused = paused;
        });
        std::sync::Arc::new(m)
    }

    #[test]
    fn build_record_only_includes_dynamic_members() {
        let queue = Queue::new("sales", QueueConfig::default(), false);
        queue.members.insert(std::sync::Arc::new(Member::new("SIP/static", "Stat", 0)));
        queue.members.insert(dynamic_member("SIP/dyn", 3, false, "Alice"));

        let record = build_record(&queue);
        assert_eq!(record, "SIP/dyn;3;0;Alice");
    }

    #[test]
    fn round_trip_through_json_file_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("members.json");
        let store = JsonFileStore::open(&path).unwrap();

        let queue = Queue::new("sales", QueueConfig::default(), false);
        queue.members.insert(dynamic_member("SIP/x", 3, false, "Alice"));
        persist_queue(&store, &queue).unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        let all = reopened.load_all().unwrap();
        let record = all.get("sales").unwrap();
        let parsed = parse_record(record);
        assert_eq!(parsed, vec![PersistedMember { iface: "SIP/x".into(), penalty: 3, paused: false, name: "Alice".into() }]);
    }

    #[test]
    fn removing_last_dynamic_member_deletes_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("members.json");
        let store = JsonFileStore::open(&path).unwrap();

        let queue = Queue::new("sales", QueueConfig::default(), false);
        let member = dynamic_member("SIP/x", 0, false, "Alice");
        queue.members.insert(member.clone());
        persist_queue(&store, &queue).unwrap();

        queue.members.remove("SIP/x");
        persist_queue(&store, &queue).unwrap();

        let all = store.load_all().unwrap();
        assert!(!all.contains_key("sales"));
    }

    #[test]
    fn replay_skips_members_already_present() {
        let queue = Queue::new("sales", QueueConfig::default(), false);
        queue.members.insert(std::sync::Arc::new(Member::new("SIP/x", "Already", 9)));
        replay_into(&queue, &[PersistedMember { iface: "SIP/x".into(), penalty: 0, paused: false, name: "Alice".into() }]);
        assert_eq!(queue.members.find("SIP/x").unwrap().penalty(), 9);
    }
}
