// Event dispatcher: the single consumer of transport events
//
// Platform stacks push `TransportEvent`s onto a bounded channel; this task
// applies them one at a time to the registry, scan controller and
// connection manager. A failing handler is logged and the loop goes on;
// only a closed channel ends it.
//
// Long transport calls (starting a scan) run on their own task so the loop
// keeps draining events the call itself may produce.

use crate::config::CentralConfig;
use crate::transport::abstraction::{GattCentral, Peripheral, RadioState, TransportEvent};
use crate::transport::ble::scanner::ScanController;
use crate::transport::manager::ConnectionManager;
use crate::transport::registry::PeripheralRegistry;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default depth of the transport event channel
pub const EVENT_CHANNEL_DEPTH: usize = 256;

/// Channel a platform stack pushes its events onto
pub fn event_channel() -> (
    mpsc::Sender<TransportEvent>,
    mpsc::Receiver<TransportEvent>,
) {
    mpsc::channel(EVENT_CHANNEL_DEPTH)
}

pub struct EventDispatcher {
    central: Arc<dyn GattCentral>,
    registry: Arc<PeripheralRegistry>,
    scanner: Arc<ScanController>,
    manager: Arc<ConnectionManager>,
    config: CentralConfig,
    radio: watch::Sender<RadioState>,
}

impl EventDispatcher {
    pub fn new(
        central: Arc<dyn GattCentral>,
        registry: Arc<PeripheralRegistry>,
        scanner: Arc<ScanController>,
        manager: Arc<ConnectionManager>,
        config: CentralConfig,
    ) -> Self {
        let (radio, _) = watch::channel(RadioState::Other);
        Self {
            central,
            registry,
            scanner,
            manager,
            config,
            radio,
        }
    }

    /// Observe the last reported radio state
    pub fn subscribe_radio(&self) -> watch::Receiver<RadioState> {
        self.radio.subscribe()
    }

    /// Consume events until every sender is gone
    pub async fn run(self, mut events: mpsc::Receiver<TransportEvent>) {
        info!("event dispatcher started");
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("event channel closed, dispatcher stopping");
    }

    pub fn spawn(self, events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Apply one event
    pub async fn handle(&self, event: TransportEvent) {
        debug!("transport event: {}", event);
        match event {
            TransportEvent::RadioStateChanged(state) => self.on_radio_state(state).await,
            TransportEvent::PeripheralDiscovered { id, name, rssi } => {
                if self.registry.discover(Peripheral::discovered(id.clone(), name, rssi)) {
                    info!(peripheral = %id, rssi, "new peripheral");
                }
            }
            TransportEvent::PeripheralConnected { id } => {
                // Marked connected by the manager once the consent is read
                debug!(peripheral = %id, "link up");
                self.manager.notify_link_up(&id);
            }
            TransportEvent::PeripheralReady { id } => self.manager.notify_ready(&id),
            TransportEvent::PeripheralDisconnected { id } => {
                self.manager.notify_disconnected(&id);
                if self.registry.mark_disconnected(&id) {
                    info!(peripheral = %id, "link down");
                }
            }
            TransportEvent::ScanStopped => self.scanner.on_scan_stopped(),
        }
    }

    async fn on_radio_state(&self, state: RadioState) {
        self.radio.send_replace(state);
        info!("radio is {}", state);
        match state {
            RadioState::On => {
                match self.central.bonded_peripherals().await {
                    Ok(bonded) => {
                        debug!(count = bonded.len(), "seeding bonded peripherals");
                        self.registry.seed_from_bonded(bonded);
                    }
                    Err(e) => warn!("could not list bonded peripherals: {}", e),
                }
                if self.config.scan_on_radio_on {
                    let scanner = self.scanner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = scanner.start_scan().await {
                            warn!("scan on radio-on failed: {}", e);
                        }
                    });
                }
            }
            RadioState::Off => self.scanner.reset(),
            RadioState::Other => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConsentLedger, MemoryStorage};
    use crate::testing::FakeCentral;
    use crate::transport::abstraction::PeripheralId;
    use crate::transport::ble::scanner::ScannerState;
    use crate::transport::inflight::InFlight;

    fn dispatcher(central: Arc<FakeCentral>) -> EventDispatcher {
        let config = CentralConfig {
            scan_on_radio_on: false,
            ..Default::default()
        };
        let registry = Arc::new(PeripheralRegistry::new());
        let scanner = Arc::new(ScanController::new(central.clone(), config.clone()));
        let ledger = ConsentLedger::spawn(Arc::new(MemoryStorage::new()), "@devicesConsents");
        let manager = Arc::new(ConnectionManager::new(
            central.clone(),
            registry.clone(),
            ledger,
            InFlight::new(),
            config.clone(),
        ));
        EventDispatcher::new(central, registry, scanner, manager, config)
    }

    #[tokio::test]
    async fn test_discovery_events_fill_registry() {
        let dispatcher = dispatcher(Arc::new(FakeCentral::new()));
        for rssi in [-40, -45, -50] {
            dispatcher
                .handle(TransportEvent::PeripheralDiscovered {
                    id: "P1".into(),
                    name: "Router".into(),
                    rssi,
                })
                .await;
        }
        let discovered = dispatcher.registry.discovered();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].rssi, -40);
    }

    #[tokio::test]
    async fn test_radio_on_seeds_bonded() {
        let central = Arc::new(FakeCentral::new());
        central.bond("B1");
        let dispatcher = dispatcher(central);
        let mut radio = dispatcher.subscribe_radio();

        dispatcher
            .handle(TransportEvent::RadioStateChanged(RadioState::On))
            .await;

        assert_eq!(*radio.borrow_and_update(), RadioState::On);
        let connected = dispatcher.registry.connected();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].id, PeripheralId::new("B1"));
    }

    #[tokio::test]
    async fn test_scan_stopped_and_radio_off_reset_scanner() {
        let dispatcher = dispatcher(Arc::new(FakeCentral::new()));

        dispatcher.scanner.start_scan().await.expect("start");
        dispatcher.handle(TransportEvent::ScanStopped).await;
        assert_eq!(dispatcher.scanner.state(), ScannerState::Idle);

        dispatcher.scanner.start_scan().await.expect("start");
        dispatcher
            .handle(TransportEvent::RadioStateChanged(RadioState::Off))
            .await;
        assert_eq!(dispatcher.scanner.state(), ScannerState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_event_clears_connected() {
        let dispatcher = dispatcher(Arc::new(FakeCentral::new()));
        dispatcher
            .registry
            .seed_from_bonded(vec![Peripheral::discovered("B1", "Speaker", 0)]);

        dispatcher
            .handle(TransportEvent::PeripheralDisconnected { id: "B1".into() })
            .await;
        assert!(dispatcher.registry.connected().is_empty());
        assert_eq!(dispatcher.registry.len(), 1);
    }
}
