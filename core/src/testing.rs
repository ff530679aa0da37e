//! In-process simulated GATT central
//!
//! [`FakeCentral`] implements [`GattCentral`] over a table of simulated
//! peripherals. Each peripheral serves a fixed consent frame on the consent
//! characteristic and records every write it receives. Failures can be
//! injected per operation, and transport events are pushed onto an attached
//! channel the same way a platform stack would.

use crate::consent::codec::{ConsentCodec, ProtocolError};
use crate::consent::types::ConsentRecord;
use crate::transport::abstraction::{
    GattCentral, Peripheral, PeripheralId, TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A peripheral served by [`FakeCentral`]
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub id: PeripheralId,
    pub name: String,
    pub rssi: i16,
    /// Bytes returned by a read of the consent characteristic
    pub frame: Vec<u8>,
}

impl SimulatedPeripheral {
    pub fn new(id: impl Into<PeripheralId>, name: impl Into<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
            frame: Vec::new(),
        }
    }

    /// Serve `record` as a read frame
    pub fn with_record(mut self, record: &ConsentRecord) -> Result<Self, ProtocolError> {
        self.frame = ConsentCodec::encode_record(record)?;
        Ok(self)
    }

    /// Serve raw bytes, e.g. a truncated frame
    pub fn with_frame(mut self, frame: Vec<u8>) -> Self {
        self.frame = frame;
        self
    }
}

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOperation {
    Scan,
    Connect,
    DiscoverServices,
    Read,
    Write,
    Disconnect,
    RemoveBond,
}

/// How the fake reports connection readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySignal {
    /// No ready events; callers fall back to a settle delay
    Unsupported,
    /// `PeripheralReady` follows every successful connect
    Emit,
    /// Readiness is advertised but never delivered
    Withhold,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub filters: Vec<Uuid>,
    pub duration: Duration,
    pub allow_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub peripheral: PeripheralId,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

struct FakeState {
    radio_available: bool,
    peripherals: HashMap<PeripheralId, SimulatedPeripheral>,
    advertise_order: Vec<PeripheralId>,
    connected: HashSet<PeripheralId>,
    bonded: Vec<PeripheralId>,
    failures: HashMap<FakeOperation, TransportError>,
    transient_failures: HashMap<FakeOperation, u32>,
    scans: Vec<ScanRequest>,
    stop_scans: usize,
    connects: Vec<PeripheralId>,
    reads: Vec<PeripheralId>,
    disconnects: Vec<PeripheralId>,
    writes: Vec<RecordedWrite>,
    ready: ReadySignal,
}

pub struct FakeCentral {
    state: Mutex<FakeState>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl Default for FakeCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCentral {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                radio_available: true,
                peripherals: HashMap::new(),
                advertise_order: Vec::new(),
                connected: HashSet::new(),
                bonded: Vec::new(),
                failures: HashMap::new(),
                transient_failures: HashMap::new(),
                scans: Vec::new(),
                stop_scans: 0,
                connects: Vec::new(),
                reads: Vec::new(),
                disconnects: Vec::new(),
                writes: Vec::new(),
                ready: ReadySignal::Unsupported,
            }),
            events: Mutex::new(None),
        }
    }

    /// Route transport events to `sender`
    pub fn attach_events(&self, sender: mpsc::Sender<TransportEvent>) {
        *self.events.lock() = Some(sender);
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let mut state = self.state.lock();
        if !state.peripherals.contains_key(&peripheral.id) {
            state.advertise_order.push(peripheral.id.clone());
        }
        state.peripherals.insert(peripheral.id.clone(), peripheral);
    }

    /// Mark a simulated peripheral as bonded with this host
    pub fn bond(&self, id: impl Into<PeripheralId>) {
        let id = id.into();
        let mut state = self.state.lock();
        if !state.bonded.contains(&id) {
            state.bonded.push(id);
        }
    }

    pub fn set_radio_available(&self, available: bool) {
        self.state.lock().radio_available = available;
    }

    pub fn set_ready_signal(&self, ready: ReadySignal) {
        self.state.lock().ready = ready;
    }

    /// Fail every call of `op` with `error` until cleared
    pub fn fail(&self, op: FakeOperation, error: TransportError) {
        self.state.lock().failures.insert(op, error);
    }

    pub fn clear_failure(&self, op: FakeOperation) {
        self.state.lock().failures.remove(&op);
    }

    /// Fail the next `count` scan starts with a retryable error
    pub fn fail_next_scans(&self, count: u32) {
        self.state
            .lock()
            .transient_failures
            .insert(FakeOperation::Scan, count);
    }

    /// Fail the next `count` connects with a retryable error
    pub fn fail_next_connects(&self, count: u32) {
        self.state
            .lock()
            .transient_failures
            .insert(FakeOperation::Connect, count);
    }

    /// Push an event as the platform stack would
    pub async fn emit(&self, event: TransportEvent) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// End the running discovery window
    pub async fn finish_scan(&self) {
        self.emit(TransportEvent::ScanStopped).await;
    }

    /// Drop the link from the peripheral side
    pub async fn drop_link(&self, id: impl Into<PeripheralId>) {
        let id = id.into();
        self.state.lock().connected.remove(&id);
        self.emit(TransportEvent::PeripheralDisconnected { id }).await;
    }

    pub fn scan_requests(&self) -> Vec<ScanRequest> {
        self.state.lock().scans.clone()
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.state.lock().stop_scans
    }

    pub fn connect_calls(&self) -> Vec<PeripheralId> {
        self.state.lock().connects.clone()
    }

    pub fn read_calls(&self) -> Vec<PeripheralId> {
        self.state.lock().reads.clone()
    }

    pub fn disconnect_calls(&self) -> Vec<PeripheralId> {
        self.state.lock().disconnects.clone()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    pub fn is_connected(&self, id: &PeripheralId) -> bool {
        self.state.lock().connected.contains(id)
    }

    pub fn is_bonded(&self, id: &PeripheralId) -> bool {
        self.state.lock().bonded.contains(id)
    }

    fn check(&self, op: FakeOperation) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(error) = state.failures.get(&op) {
            return Err(error.clone());
        }
        if let Some(remaining) = state.transient_failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(match op {
                    FakeOperation::Scan => TransportError::ScanFailed("simulated".into()),
                    _ => TransportError::ConnectFailed("simulated".into()),
                });
            }
        }
        Ok(())
    }

    fn require_connected(&self, id: &PeripheralId) -> Result<(), String> {
        if self.state.lock().connected.contains(id) {
            Ok(())
        } else {
            Err(format!("{} is not connected", id))
        }
    }
}

#[async_trait]
impl GattCentral for FakeCentral {
    async fn enable_radio(&self) -> Result<(), TransportError> {
        if self.state.lock().radio_available {
            Ok(())
        } else {
            Err(TransportError::RadioUnavailable)
        }
    }

    async fn start_scan(
        &self,
        service_filters: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<(), TransportError> {
        self.check(FakeOperation::Scan)?;
        let advertised: Vec<SimulatedPeripheral> = {
            let mut state = self.state.lock();
            state.scans.push(ScanRequest {
                filters: service_filters.to_vec(),
                duration,
                allow_duplicates,
            });
            state
                .advertise_order
                .iter()
                .filter_map(|id| state.peripherals.get(id).cloned())
                .collect()
        };
        for peripheral in advertised {
            self.emit(TransportEvent::PeripheralDiscovered {
                id: peripheral.id,
                name: peripheral.name,
                rssi: peripheral.rssi,
            })
            .await;
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state.lock().stop_scans += 1;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.state.lock().connects.push(id.clone());
        self.check(FakeOperation::Connect)?;
        let ready = {
            let mut state = self.state.lock();
            if !state.peripherals.contains_key(id) {
                return Err(TransportError::ConnectFailed(format!("{} out of range", id)));
            }
            state.connected.insert(id.clone());
            state.ready
        };
        self.emit(TransportEvent::PeripheralConnected { id: id.clone() })
            .await;
        if ready == ReadySignal::Emit {
            self.emit(TransportEvent::PeripheralReady { id: id.clone() })
                .await;
        }
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.check(FakeOperation::DiscoverServices)?;
        self.require_connected(id)
            .map_err(TransportError::ServiceDiscoveryFailed)
    }

    async fn read(
        &self,
        id: &PeripheralId,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        self.state.lock().reads.push(id.clone());
        self.check(FakeOperation::Read)?;
        self.require_connected(id).map_err(TransportError::ReadFailed)?;
        let state = self.state.lock();
        state
            .peripherals
            .get(id)
            .map(|p| p.frame.clone())
            .ok_or_else(|| TransportError::ReadFailed(format!("{} vanished", id)))
    }

    async fn write(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.check(FakeOperation::Write)?;
        self.require_connected(id).map_err(TransportError::WriteFailed)?;
        self.state.lock().writes.push(RecordedWrite {
            peripheral: id.clone(),
            service,
            characteristic,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.state.lock().disconnects.push(id.clone());
        self.check(FakeOperation::Disconnect)?;
        self.state.lock().connected.remove(id);
        self.emit(TransportEvent::PeripheralDisconnected { id: id.clone() })
            .await;
        Ok(())
    }

    async fn remove_bond(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.check(FakeOperation::RemoveBond)?;
        self.state.lock().bonded.retain(|b| b != id);
        Ok(())
    }

    async fn bonded_peripherals(&self) -> Result<Vec<Peripheral>, TransportError> {
        let state = self.state.lock();
        Ok(state
            .bonded
            .iter()
            .map(|id| {
                let name = state
                    .peripherals
                    .get(id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                let mut peripheral = Peripheral::discovered(id.clone(), name, 0);
                peripheral.bonded = true;
                peripheral
            })
            .collect())
    }

    fn signals_ready(&self) -> bool {
        self.state.lock().ready != ReadySignal::Unsupported
    }
}
