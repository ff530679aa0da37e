// ADPC Core: consent central
#![allow(clippy::empty_line_after_doc_comments)]
//
// Discovers nearby peripherals, reads the data-processing consent each one
// discloses, and keeps the user's consent ledger in step with what was
// accepted or revoked on the device.

pub mod config;
pub mod consent;
pub mod dispatcher;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use config::{CentralConfig, ConfigError, DEFAULT_LEDGER_KEY};
pub use consent::{
    describe_consent, ConsentCodec, ConsentId, ConsentRecord, ConsentWriter, DeviceConsentEntry,
    ProtocolError, Summarizer,
};
pub use dispatcher::{event_channel, EventDispatcher};
pub use store::{
    ConsentLedger, DeviceRegistry, MemoryStorage, PersistenceError, RegisteredDevice,
    RemoveOutcome, SledStorage, StorageBackend, UpsertOutcome,
};
pub use transport::{
    ConnectOutcome, ConnectionManager, GattCentral, InFlight, Peripheral, PeripheralId,
    PeripheralRegistry, RadioState, RetryPolicy, ScanController, ScanStart, ScannerState,
    TransportError, TransportEvent,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Both halves of a revoke. The delete transmission and the ledger removal
/// are independent; either can succeed while the other fails, which leaves
/// device and ledger out of step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeOutcome {
    pub transmitted: Result<(), AdpcError>,
    pub removed: Result<RemoveOutcome, PersistenceError>,
}

impl RevokeOutcome {
    /// Delete sent and ledger updated
    pub fn is_complete(&self) -> bool {
        self.transmitted.is_ok() && self.removed.is_ok()
    }

    /// Exactly one half succeeded
    pub fn is_partial(&self) -> bool {
        self.transmitted.is_ok() != self.removed.is_ok()
    }
}

// ============================================================================
// CONSENT CENTRAL
// ============================================================================

/// Everything a front end needs: discovery, connections, consent commands
/// and the ledger, wired to one transport and one storage backend.
pub struct ConsentCentral {
    config: CentralConfig,
    registry: Arc<PeripheralRegistry>,
    scanner: Arc<ScanController>,
    manager: Arc<ConnectionManager>,
    writer: ConsentWriter,
    ledger: ConsentLedger,
    devices: DeviceRegistry,
    radio: watch::Receiver<RadioState>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConsentCentral {
    /// Validate `config`, start the ledger writer and the event dispatcher.
    /// Must be called inside a tokio runtime.
    pub fn start(
        central: Arc<dyn GattCentral>,
        backend: Arc<dyn StorageBackend>,
        config: CentralConfig,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Self, AdpcError> {
        config.validate()?;

        let registry = Arc::new(PeripheralRegistry::new());
        let inflight = InFlight::new();
        let ledger = ConsentLedger::spawn(backend.clone(), config.storage_key.clone());
        let scanner = Arc::new(ScanController::new(central.clone(), config.clone()));
        let manager = Arc::new(ConnectionManager::new(
            central.clone(),
            registry.clone(),
            ledger.clone(),
            inflight.clone(),
            config.clone(),
        ));
        let writer = ConsentWriter::new(central.clone(), inflight);

        let dispatcher = EventDispatcher::new(
            central,
            registry.clone(),
            scanner.clone(),
            manager.clone(),
            config.clone(),
        );
        let radio = dispatcher.subscribe_radio();
        let handle = dispatcher.spawn(events);

        info!(storage_key = %config.storage_key, "consent central started");
        Ok(Self {
            config,
            registry,
            scanner,
            manager,
            writer,
            ledger,
            devices: DeviceRegistry::new(backend),
            radio,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    pub fn radio_state(&self) -> RadioState {
        *self.radio.borrow()
    }

    pub fn subscribe_radio(&self) -> watch::Receiver<RadioState> {
        self.radio.clone()
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    pub async fn scan(&self) -> Result<ScanStart, AdpcError> {
        Ok(self.scanner.start_scan().await?)
    }

    pub async fn stop_scan(&self) -> Result<(), AdpcError> {
        Ok(self.scanner.stop_scan().await?)
    }

    pub fn scanner_state(&self) -> ScannerState {
        self.scanner.state()
    }

    pub fn registry(&self) -> &PeripheralRegistry {
        &self.registry
    }

    pub fn discovered(&self) -> Vec<Peripheral> {
        self.registry.discovered()
    }

    pub fn connected(&self) -> Vec<Peripheral> {
        self.registry.connected()
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    pub async fn connect(&self, id: &PeripheralId) -> Result<ConnectOutcome, AdpcError> {
        self.manager.connect(id).await
    }

    pub async fn disconnect(&self, id: &PeripheralId) -> Result<(), AdpcError> {
        self.manager.disconnect(id).await
    }

    pub async fn forget(&self, id: &PeripheralId) -> Result<(), AdpcError> {
        self.manager.forget(id).await
    }

    // ------------------------------------------------------------------
    // Consent commands
    // ------------------------------------------------------------------

    pub async fn give_consent(
        &self,
        peripheral: &PeripheralId,
        consent: &ConsentId,
    ) -> Result<(), AdpcError> {
        self.writer.give_consent(peripheral, consent).await
    }

    pub async fn give_consents(
        &self,
        peripheral: &PeripheralId,
        consents: &[ConsentId],
    ) -> Result<(), AdpcError> {
        self.writer.give_consents(peripheral, consents).await
    }

    /// Transmit a delete command only; the ledger is left alone
    pub async fn delete_consent(
        &self,
        peripheral: &PeripheralId,
        consent: &ConsentId,
    ) -> Result<(), AdpcError> {
        self.writer.delete_consent(peripheral, consent).await
    }

    /// Send the delete command, then drop the consent from the ledger.
    ///
    /// A consent id without a short code fails up front and touches
    /// neither side. Past that point both halves are always attempted and
    /// reported separately.
    pub async fn revoke_consent(
        &self,
        peripheral: &PeripheralId,
        consent: &ConsentId,
    ) -> Result<RevokeOutcome, AdpcError> {
        ConsentCodec::encode_delete(consent)?;

        let transmitted = self.writer.delete_consent(peripheral, consent).await;
        let removed = self.ledger.remove(peripheral.as_str(), consent.as_str()).await;

        let outcome = RevokeOutcome {
            transmitted,
            removed,
        };
        if outcome.is_partial() {
            warn!(
                peripheral = %peripheral,
                consent = %consent,
                "revoke only half applied, device and ledger disagree"
            );
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Ledger and registrations
    // ------------------------------------------------------------------

    pub fn ledger(&self) -> &ConsentLedger {
        &self.ledger
    }

    pub fn consents(&self) -> Vec<DeviceConsentEntry> {
        self.ledger.list()
    }

    pub fn search_consents(&self, query: &str) -> Vec<DeviceConsentEntry> {
        self.ledger.search(query)
    }

    pub fn query_consent(&self, peripheral: &str, consent: &str) -> Option<ConsentRecord> {
        self.ledger.query(peripheral, consent)
    }

    pub fn register_device(&self, device: RegisteredDevice) -> Result<(), AdpcError> {
        Ok(self.devices.register(device)?)
    }

    pub fn registered_devices(&self) -> Vec<RegisteredDevice> {
        self.devices.list()
    }

    /// Stop the dispatcher and drain the ledger writer
    pub async fn shutdown(self) {
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            handle.abort();
            let _ = handle.await;
        }
        if let Err(e) = self.scanner.stop_scan().await {
            warn!("stop scan on shutdown failed: {}", e);
        }
        self.ledger.close().await;
        info!("consent central stopped");
    }
}
