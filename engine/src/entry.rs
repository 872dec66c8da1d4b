//! Per-queue waiting list, §4.D.
//!
//! Not lock-guarded on its own: it lives inside `Queue`'s single "queue
//! lock" (see `queue.rs`), so every method here assumes exclusive access
//! already. A plain `Vec<Entry>` gives O(1) position reads and an O(n)
//! priority-ordered insert, which is exactly the §4.D algorithm ("scan from
//! head; place immediately after the last entry with priority ≥ its own").

use std::sync::{atomic::{AtomicU64, Ordering}, Arc};
use std::time::{Duration, Instant};

use crate::transport::Channel;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// A specific waiting caller within a specific queue, §3.
#[derive(Debug)]
pub struct Entry {
    pub id: u64,
    pub channel: Arc<dyn Channel>,
    pub priority: i32,
    /// 1-based, dense, maintained on every insert/leave.
    pub pos: usize,
    pub original_pos: usize,
    pub start: Instant,
    pub expire: Option<Instant>,
    /// `max_penalty > 0` rejects any member with a higher penalty, §4.F.
    pub max_penalty: u32,
    pub moh: String,
    pub announce: String,
    pub handled: bool,
    pub digits: String,
    pub valid_digits: bool,
}

impl Entry {
    pub fn new(channel: Arc<dyn Channel>, priority: i32, max_penalty: u32, moh: String, announce: String, expire_after: Option<Duration>) -> Self {
        let now = Instant::now();
        Entry {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            channel,
            priority,
            pos: 0,
            original_pos: 0,
            start: now,
            expire: expire_after.map(|d| now + d),
            max_penalty,
            moh,
            announce,
            handled: false,
            digits: String::new(),
            valid_digits: false,
        }
    }

    pub fn waited(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.expire.map(|e| Instant::now() >= e).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct EntryList {
    entries: Vec<Entry>,
}

impl EntryList {
    pub fn new() -> Self {
        EntryList::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts `entry` in priority order (non-increasing priority, then
    /// insertion time within equal priority), renumbering positions from 1.
    /// Returns the assigned position.
    pub fn insert(&mut self, mut entry: Entry) -> usize {
        let idx = self
            .entries
            .iter()
            .position(|e| e.priority < entry.priority)
            .unwrap_or(self.entries.len());
        entry.pos = idx + 1;
        entry.original_pos = entry.pos;
        self.entries.insert(idx, entry);
        self.renumber();
        idx + 1
    }

    /// Removes and returns the entry with the given id, renumbering the
    /// remainder. If the queue is dead and now empty, the caller (§4.D) is
    /// responsible for unlinking it from the store.
    pub fn leave(&mut self, id: u64) -> Option<Entry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(idx);
        self.renumber();
        Some(entry)
    }

    pub fn head_id(&self) -> Option<u64> {
        self.entries.first().map(|e| e.id)
    }

    pub fn position_of(&self, id: u64) -> Option<usize> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.pos)
    }

    pub fn get(&self, id: u64) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// The first `n` entries from head, for autofill's "first
    /// `available_count` entries may dispatch concurrently", §4.G.
    pub fn head_ids(&self, n: usize) -> Vec<u64> {
        self.entries.iter().take(n).map(|e| e.id).collect()
    }

    pub fn expired_ids(&self) -> Vec<u64> {
        self.entries.iter().filter(|e| e.expired()).map(|e| e.id).collect()
    }

    fn renumber(&mut self) {
        for (i, e) in self.entries.iter_mut().enumerate() {
            e.pos = i + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockChannel;

    fn chan(id: &str) -> Arc<dyn Channel> {
        Arc::new(MockChannel { iface: "caller".into(), id: id.into() })
    }

    #[test]
    fn position_invariant_holds_after_insert_and_leave() {
        let mut list = EntryList::new();
        let a = Entry::new(chan("a"), 0, 0, String::new(), String::new(), None);
        let b = Entry::new(chan("b"), 0, 0, String::new(), String::new(), None);
        let id_a = a.id;
        let id_b = b.id;
        list.insert(a);
        list.insert(b);
        for (k, e) in [(1, id_a), (2, id_b)] {
            assert_eq!(list.position_of(e), Some(k));
        }
        list.leave(id_a);
        assert_eq!(list.position_of(id_b), Some(1));
    }

    #[test]
    fn priority_ordering_places_higher_priority_first() {
        let mut list = EntryList::new();
        let x = Entry::new(chan("x"), 0, 0, String::new(), String::new(), None);
        let id_x = x.id;
        list.insert(x);
        let y = Entry::new(chan("y"), 5, 0, String::new(), String::new(), None);
        let id_y = y.id;
        list.insert(y);
        assert_eq!(list.position_of(id_y), Some(1));
        assert_eq!(list.position_of(id_x), Some(2));
        assert_eq!(list.head_id(), Some(id_y));
    }

    #[test]
    fn equal_priority_preserves_insertion_order() {
        let mut list = EntryList::new();
        let x = Entry::new(chan("x"), 3, 0, String::new(), String::new(), None);
        let id_x = x.id;
        list.insert(x);
        let y = Entry::new(chan("y"), 3, 0, String::new(), String::new(), None);
        let id_y = y.id;
        list.insert(y);
        assert_eq!(list.position_of(id_x), Some(1));
        assert_eq!(list.position_of(id_y), Some(2));
    }
}
