//! Peripheral registry: the set of known peripherals
//!
//! Owns every [`Peripheral`] seen this session. Entries are created on
//! first discovery and updated in place on connect/disconnect/bond events;
//! they are never removed. Two snapshots are published through `watch`
//! channels so observers never touch the underlying map:
//!
//! - discovered: every known peripheral, in first-discovery order
//! - connected: the subset currently flagged `connected`

use crate::transport::abstraction::{Peripheral, PeripheralId};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;

#[derive(Default)]
struct RegistryInner {
    /// Insertion order of first discovery
    order: Vec<PeripheralId>,
    peripherals: HashMap<PeripheralId, Peripheral>,
}

impl RegistryInner {
    fn insert(&mut self, peripheral: Peripheral) {
        if !self.peripherals.contains_key(&peripheral.id) {
            self.order.push(peripheral.id.clone());
        }
        self.peripherals.insert(peripheral.id.clone(), peripheral);
    }

    fn snapshot(&self) -> Vec<Peripheral> {
        self.order
            .iter()
            .filter_map(|id| self.peripherals.get(id).cloned())
            .collect()
    }

    fn connected_snapshot(&self) -> Vec<Peripheral> {
        self.order
            .iter()
            .filter_map(|id| self.peripherals.get(id))
            .filter(|p| p.connected)
            .cloned()
            .collect()
    }
}

pub struct PeripheralRegistry {
    inner: RwLock<RegistryInner>,
    discovered_tx: watch::Sender<Vec<Peripheral>>,
    connected_tx: watch::Sender<Vec<Peripheral>>,
}

impl Default for PeripheralRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        let (discovered_tx, _) = watch::channel(Vec::new());
        let (connected_tx, _) = watch::channel(Vec::new());
        Self {
            inner: RwLock::new(RegistryInner::default()),
            discovered_tx,
            connected_tx,
        }
    }

    /// Record an advertisement. Returns `true` if the peripheral was new.
    ///
    /// Repeat sightings are ignored, including their RSSI and name.
    pub fn discover(&self, peripheral: Peripheral) -> bool {
        let mut inner = self.inner.write();
        if inner.peripherals.contains_key(&peripheral.id) {
            return false;
        }
        debug!(peripheral = %peripheral.id, rssi = peripheral.rssi, "peripheral discovered");
        inner.insert(peripheral);
        let snapshot = inner.snapshot();
        drop(inner);
        self.discovered_tx.send_replace(snapshot);
        true
    }

    /// Flag `id` as connected. Returns `false` for unknown peripherals.
    pub fn mark_connected(&self, id: &PeripheralId) -> bool {
        self.set_connected(id, true)
    }

    /// Flag `id` as disconnected. Returns `false` for unknown peripherals.
    pub fn mark_disconnected(&self, id: &PeripheralId) -> bool {
        self.set_connected(id, false)
    }

    /// Update the bond flag in place. Returns `false` for unknown peripherals.
    pub fn mark_bonded(&self, id: &PeripheralId, bonded: bool) -> bool {
        let mut inner = self.inner.write();
        let Some(peripheral) = inner.peripherals.get_mut(id) else {
            return false;
        };
        peripheral.bonded = bonded;
        let snapshot = inner.snapshot();
        drop(inner);
        self.discovered_tx.send_replace(snapshot);
        true
    }

    /// Insert previously bonded peripherals as connected. Used once when
    /// the radio turns on; existing entries are overwritten.
    pub fn seed_from_bonded(&self, bonded: Vec<Peripheral>) {
        if bonded.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for mut peripheral in bonded {
            peripheral.connected = true;
            peripheral.bonded = true;
            inner.insert(peripheral);
        }
        let snapshot = inner.snapshot();
        let connected = inner.connected_snapshot();
        drop(inner);
        self.discovered_tx.send_replace(snapshot);
        self.connected_tx.send_replace(connected);
    }

    pub fn get(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.inner.read().peripherals.get(id).cloned()
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.inner.read().peripherals.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current discovered set
    pub fn discovered(&self) -> Vec<Peripheral> {
        self.discovered_tx.borrow().clone()
    }

    /// Current connected set
    pub fn connected(&self) -> Vec<Peripheral> {
        self.connected_tx.borrow().clone()
    }

    /// Observe discovered-set snapshots
    pub fn subscribe_discovered(&self) -> watch::Receiver<Vec<Peripheral>> {
        self.discovered_tx.subscribe()
    }

    /// Observe connected-set snapshots
    pub fn subscribe_connected(&self) -> watch::Receiver<Vec<Peripheral>> {
        self.connected_tx.subscribe()
    }

    fn set_connected(&self, id: &PeripheralId, connected: bool) -> bool {
        let mut inner = self.inner.write();
        let Some(peripheral) = inner.peripherals.get_mut(id) else {
            return false;
        };
        peripheral.connected = connected;
        let snapshot = inner.snapshot();
        let connected_set = inner.connected_snapshot();
        drop(inner);
        self.discovered_tx.send_replace(snapshot);
        self.connected_tx.send_replace(connected_set);
        true
    }
}
