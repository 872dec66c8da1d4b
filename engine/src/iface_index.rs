//! Process-wide interface index, §4.B.
//!
//! Same registry shape as `member.rs`, reduced to a reference-counted set:
//! it only needs to answer "does any queue still care about this
//! interface", so the device-state worker can skip events nobody wants.
//! Independent lock, per §5 rule 4 — never acquired together with the
//! queue-store or a queue lock in a way that could deadlock against them.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct InterfaceIndex {
    /// interface -> reference count (number of queues holding a member
    /// with this interface).
    refs: RwLock<HashMap<String, usize>>,
}

impl InterfaceIndex {
    pub fn new() -> Self {
        InterfaceIndex::default()
    }

    pub fn add(&self, iface: &str) {
        let mut guard = self.refs.write().expect("iface index lock poisoned");
        *guard.entry(iface.to_string()).or_insert(0) += 1;
    }

    /// Decrements the refcount; removes the entry once it reaches zero.
    /// Returns `true` if the interface is now unreferenced by any queue.
    pub fn remove_if_unreferenced(&self, iface: &str) -> bool {
        let mut guard = self.refs.write().expect("iface index lock poisoned");
        match guard.get_mut(iface) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                guard.remove(iface);
                true
            }
            None => true,
        }
    }

    pub fn is_referenced(&self, iface: &str) -> bool {
        self.refs.read().expect("iface index lock poisoned").contains_key(iface)
    }

    pub fn len(&self) -> usize {
        self.refs.read().expect("iface index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
