//! Automatic call distribution queue and dispatch core.
//!
//! Layout mirrors the component table: each module below is one of the
//! lettered components, wired together by [`Engine`], the facade most
//! callers (the `ctl` binary, a dialplan-application boundary outside this
//! crate) actually hold.

pub mod api;
pub mod config;
pub mod device_state;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod events;
pub mod iface_index;
pub mod lifecycle;
pub mod member;
pub mod persistence;
pub mod queue;
pub mod store;
pub mod transport;
pub mod types;

use std::sync::Arc;

use config::FileConfig;
use device_state::{DeviceStateBus, DeviceStateWorker};
use iface_index::InterfaceIndex;
use persistence::PersistenceStore;
use store::{NoRealtime, QueueStore, RealtimeSource};

/// Bundles the store, interface index, and device-state worker that
/// together make up one running instance of the core, plus the optional
/// persistence backend. Owns the worker thread's lifetime: dropping an
/// `Engine` does not join it — callers that need a clean shutdown must
/// call [`Engine::shutdown`] explicitly, since `Drop` cannot block.
pub struct Engine {
    pub store: Arc<QueueStore>,
    pub iface_index: Arc<InterfaceIndex>,
    pub device_state: DeviceStateBus,
    pub persistence: Option<Arc<dyn PersistenceStore>>,
    worker: Option<DeviceStateWorker>,
}

impl Engine {
    /// Loads `config` into a fresh store, rebuilds the interface index from
    /// the result, and starts the device-state worker.
    pub fn start(config: &FileConfig, realtime: &dyn RealtimeSource) -> Self {
        let store = Arc::new(QueueStore::new(config.general.keepstats));
        let iface_index = Arc::new(InterfaceIndex::new());
        store.reload_all(config, realtime, &iface_index);
        Self::from_store(store, iface_index, None)
    }

    pub fn start_with_persistence(config: &FileConfig, realtime: &dyn RealtimeSource, persistence: Arc<dyn PersistenceStore>) -> Self {
        let store = Arc::new(QueueStore::new(config.general.keepstats));
        let iface_index = Arc::new(InterfaceIndex::new());
        store.reload_all(config, realtime, &iface_index);
        let mut engine = Self::from_store(store, iface_index, Some(persistence));
        engine.replay_persisted();
        engine
    }

    fn from_store(store: Arc<QueueStore>, iface_index: Arc<InterfaceIndex>, persistence: Option<Arc<dyn PersistenceStore>>) -> Self {
        let (worker, bus) = DeviceStateWorker::spawn(store.clone(), iface_index.clone());
        Engine { store, iface_index, device_state: bus, persistence, worker: Some(worker) }
    }

    /// Re-applies every persisted dynamic member across the whole family,
    /// §4.H. A record naming a queue absent from the store (static or
    /// realtime) is dropped rather than replayed.
    fn replay_persisted(&mut self) {
        let Some(store) = self.persistence.clone() else { return };
        let records = match store.load_all() {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(target: "acdq::engine", error = %e, "persistence load_all failed, skipping replay");
                return;
            }
        };
        for (queue_name, record) in records {
            match self.store.find(&queue_name) {
                Some(queue) => {
                    let members = persistence::parse_record(&record);
                    persistence::replay_into(&queue, &members);
                    for member in queue.members.snapshot() {
                        self.iface_index.add(&member.iface);
                    }
                }
                None => {
                    if let Err(e) = store.delete(&queue_name) {
                        tracing::warn!(target: "acdq::engine", queue = %queue_name, error = %e, "failed to drop orphan persistence record");
                    }
                }
            }
        }
    }

    /// Reloads static config, keeping realtime queues and live callers
    /// intact per §4.C's reload algorithm.
    pub fn reload(&self, config: &FileConfig, realtime: &dyn RealtimeSource) {
        self.store.reload_all(config, realtime, &self.iface_index);
    }

    /// Signals and joins the device-state worker thread.
    pub fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

/// No-op realtime source plus a bare, unpersisted engine — the shape most
/// tests and a minimal static-only deployment want.
pub fn start_static(config: &FileConfig) -> Engine {
    Engine::start(config, &NoRealtime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_starts_and_shuts_down_cleanly() {
        let cfg = config::parse(
            r#"
            [sales]
            strategy = "ringall"
            member = [{ iface = "SIP/a", penalty = 0, name = "Alice" }]
        "#,
        )
        .unwrap();
        let engine = start_static(&cfg);
        assert!(engine.store.find("sales").is_some());
        assert!(engine.iface_index.is_referenced("SIP/a"));
        engine.shutdown();
    }
}
