//! Device-state fan-out worker, §4.E.
//!
//! Shape grounded on `cli/src/nonosctl/daemon.rs`'s `start_daemon`
//! background-loop thread (one dedicated long-lived task, woken
//! periodically to reconcile state) and on
//! `cli/src/nonosctl/capsule_net.rs`'s producer/consumer channel pattern
//! (a `tokio::sync::mpsc` receiver drained in a loop) — generalized from
//! polling and from an async runtime to a `Mutex`+`Condvar` FIFO drained by
//! a plain OS thread, because §4.E's own words are "own mutex/condition
//! pair" and §5 rules out a cooperative/async model for the engine.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::events::{emit, Event};
use crate::iface_index::InterfaceIndex;
use crate::store::QueueStore;
use crate::types::DeviceState;

#[derive(Debug, Clone)]
struct Delta {
    iface: String,
    state: DeviceState,
}

struct Fifo {
    queue: Mutex<VecDeque<Delta>>,
    condvar: Condvar,
    stop: Mutex<bool>,
}

/// Producer-side handle: the transport layer's device-state bus calls
/// `push` from whatever thread observes the change.
pub struct DeviceStateBus {
    fifo: Arc<Fifo>,
}

impl DeviceStateBus {
    pub fn push(&self, iface: &str, state: DeviceState) {
        let mut q = self.fifo.queue.lock().expect("fifo lock poisoned");
        q.push_back(Delta { iface: iface.to_string(), state });
        self.fifo.condvar.notify_one();
    }
}

pub struct DeviceStateWorker {
    fifo: Arc<Fifo>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceStateWorker {
    /// Spawns the single dedicated consumer thread.
    pub fn spawn(store: Arc<QueueStore>, iface_index: Arc<InterfaceIndex>) -> (Self, DeviceStateBus) {
        let fifo = Arc::new(Fifo {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop: Mutex::new(false),
        });

        let worker_fifo = fifo.clone();
        let handle = thread::Builder::new()
            .name("acdq-device-state".to_string())
            .spawn(move || run(worker_fifo, store, iface_index))
            .expect("failed to spawn device-state worker");

        (
            DeviceStateWorker { fifo: fifo.clone(), handle: Some(handle) },
            DeviceStateBus { fifo },
        )
    }

    /// Sets the stop flag, wakes the consumer, and joins it.
    pub fn shutdown(mut self) {
        *self.fifo.stop.lock().expect("fifo lock poisoned") = true;
        self.fifo.condvar.notify_one();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn run(fifo: Arc<Fifo>, store: Arc<QueueStore>, iface_index: Arc<InterfaceIndex>) {
    loop {
        let delta = {
            let mut q = fifo.queue.lock().expect("fifo lock poisoned");
            while q.is_empty() {
                if *fifo.stop.lock().expect("fifo lock poisoned") {
                    return;
                }
                q = fifo.condvar.wait(q).expect("fifo lock poisoned");
            }
            match q.pop_front() {
                Some(d) => d,
                None => continue,
            }
        };

        if !iface_index.is_referenced(&delta.iface) {
            continue;
        }

        // Lock order: store (read-only snapshot) -> queue -> member
        // container, never the device-state FIFO lock while doing so
        // (already released above), per §5.
        for queue in store.queues_with_member(&delta.iface) {
            if let Some(member) = queue.members.find(&delta.iface) {
                member.set_device_state(delta.state);
                if !queue.with_config(|c| c.mask_member_status) {
                    emit(&Event::QueueMemberStatus {
                        queue: queue.name.clone(),
                        iface: delta.iface.clone(),
                        state: format!("{:?}", delta.state),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;
    use crate::store::NoRealtime;
    use std::time::Duration;

    #[test]
    fn delta_updates_member_state_across_queues() {
        let store = Arc::new(QueueStore::new(true));
        let cfg = parse(
            r#"
            [sales]
            strategy = "ringall"
            member = [{ iface = "SIP/a", penalty = 0, name = "Alice" }]
        "#,
        )
        .unwrap();
        let iface_index = Arc::new(InterfaceIndex::new());
        store.reload_all(&cfg, &NoRealtime, &iface_index);

        let (worker, bus) = DeviceStateWorker::spawn(store.clone(), iface_index);
        bus.push("SIP/a", DeviceState::InUse);

        // Give the worker thread a moment to drain; deterministic tests
        // would inject a completion channel, kept simple here since the
        // property under test is eventual application, not timing.
        thread::sleep(Duration::from_millis(50));
        worker.shutdown();

        let member = store.find("sales").unwrap().members.find("SIP/a").unwrap();
        assert_eq!(member.device_state(), DeviceState::InUse);
    }

    #[test]
    fn unreferenced_interface_is_skipped() {
        let store = Arc::new(QueueStore::new(true));
        let iface_index = Arc::new(InterfaceIndex::new());
        let (worker, bus) = DeviceStateWorker::spawn(store, iface_index);
        bus.push("SIP/ghost", DeviceState::Busy);
        thread::sleep(Duration::from_millis(20));
        worker.shutdown();
    }
}
