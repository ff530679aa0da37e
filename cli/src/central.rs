// Desktop GATT central over btleplug
//
// Maps the platform adapter onto the core transport contract. Adapter
// events are pumped into the core's event channel by a background task;
// peripherals are addressed by the string form of the btleplug id.

use adpc_core::{GattCentral, Peripheral, PeripheralId, RadioState, TransportError, TransportEvent};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Known = Arc<Mutex<HashMap<String, PlatformPeripheral>>>;

pub struct BtleCentral {
    adapter: Adapter,
    known: Known,
    events: mpsc::Sender<TransportEvent>,
    scan_timer: Mutex<Option<JoinHandle<()>>>,
    allow_duplicates: Arc<Mutex<bool>>,
}

impl BtleCentral {
    /// Open the first adapter and start pumping its events into `events`
    pub async fn open(events: mpsc::Sender<TransportEvent>) -> anyhow::Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no Bluetooth adapter found"))?;
        info!("using adapter {}", adapter.adapter_info().await?);

        let central = Arc::new(Self {
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
            events,
            scan_timer: Mutex::new(None),
            allow_duplicates: Arc::new(Mutex::new(true)),
        });
        central.spawn_event_pump().await?;

        // An adapter we could open is a powered radio as far as we can tell
        let _ = central
            .events
            .send(TransportEvent::RadioStateChanged(RadioState::On))
            .await;
        Ok(central)
    }

    async fn spawn_event_pump(&self) -> anyhow::Result<()> {
        let mut stream = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let events = self.events.clone();
        let allow_duplicates = self.allow_duplicates.clone();

        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let forwarded = match event {
                    CentralEvent::DeviceDiscovered(id) => {
                        discovered(&adapter, &known, &id.to_string(), id).await
                    }
                    CentralEvent::DeviceUpdated(id) if *allow_duplicates.lock() => {
                        discovered(&adapter, &known, &id.to_string(), id).await
                    }
                    CentralEvent::DeviceConnected(id) => Some(TransportEvent::PeripheralConnected {
                        id: PeripheralId::new(id.to_string()),
                    }),
                    CentralEvent::DeviceDisconnected(id) => {
                        Some(TransportEvent::PeripheralDisconnected {
                            id: PeripheralId::new(id.to_string()),
                        })
                    }
                    _ => None,
                };
                if let Some(event) = forwarded {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            }
            debug!("adapter event stream ended");
        });
        Ok(())
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<PlatformPeripheral, TransportError> {
        self.known
            .lock()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(id.to_string()))
    }
}

async fn discovered(
    adapter: &Adapter,
    known: &Known,
    key: &str,
    id: btleplug::platform::PeripheralId,
) -> Option<TransportEvent> {
    let peripheral = match adapter.peripheral(&id).await {
        Ok(p) => p,
        Err(e) => {
            debug!("peripheral {} vanished: {}", key, e);
            return None;
        }
    };
    let properties = peripheral.properties().await.ok().flatten();
    let name = properties
        .as_ref()
        .and_then(|p| p.local_name.clone())
        .unwrap_or_default();
    let rssi = properties.as_ref().and_then(|p| p.rssi).unwrap_or(0);
    known.lock().insert(key.to_string(), peripheral);
    Some(TransportEvent::PeripheralDiscovered {
        id: PeripheralId::new(key),
        name,
        rssi,
    })
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic && c.service_uuid == service)
}

#[async_trait]
impl GattCentral for BtleCentral {
    async fn enable_radio(&self) -> Result<(), TransportError> {
        // Desktop stacks cannot switch the radio; check the adapter answers
        self.adapter
            .adapter_info()
            .await
            .map(|_| ())
            .map_err(|_| TransportError::RadioUnavailable)
    }

    async fn start_scan(
        &self,
        service_filters: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<(), TransportError> {
        *self.allow_duplicates.lock() = allow_duplicates;
        self.adapter
            .start_scan(ScanFilter {
                services: service_filters.to_vec(),
            })
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))?;

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = adapter.stop_scan().await {
                warn!("stopping scan after window failed: {}", e);
            }
            let _ = events.send(TransportEvent::ScanStopped).await;
        });
        if let Some(previous) = self.scan_timer.lock().replace(timer) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let timer = self.scan_timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.peripheral(id)?
            .connect()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.peripheral(id)?
            .discover_services()
            .await
            .map_err(|e| TransportError::ServiceDiscoveryFailed(e.to_string()))
    }

    async fn read(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.peripheral(id)?;
        let target = find_characteristic(&peripheral, service, characteristic).ok_or_else(|| {
            TransportError::ReadFailed(format!("{} has no consent characteristic", id))
        })?;
        peripheral
            .read(&target)
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    async fn write(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let target = find_characteristic(&peripheral, service, characteristic).ok_or_else(|| {
            TransportError::WriteFailed(format!("{} has no consent characteristic", id))
        })?;
        peripheral
            .write(&target, data, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.peripheral(id)?
            .disconnect()
            .await
            .map_err(|e| TransportError::DisconnectFailed(e.to_string()))
    }

    async fn remove_bond(&self, id: &PeripheralId) -> Result<(), TransportError> {
        Err(TransportError::BondFailed(format!(
            "{}: unpair the device from the system Bluetooth settings",
            id
        )))
    }

    async fn bonded_peripherals(&self) -> Result<Vec<Peripheral>, TransportError> {
        // Closest desktop equivalent: links the system already holds
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::BondFailed(e.to_string()))?;

        let mut bonded = Vec::new();
        for peripheral in peripherals {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let key = peripheral.id().to_string();
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name)
                .unwrap_or_default();
            self.known.lock().insert(key.clone(), peripheral);
            bonded.push(Peripheral::discovered(key, name, 0));
        }
        Ok(bonded)
    }
}
