//! Connection manager: connect, read the consent frame, store it
//!
//! A connect runs the whole post-connect sequence before the peripheral is
//! reported as connected:
//!
//! 1. transport connect (retried per policy)
//! 2. wait until the link is usable: a `PeripheralReady` event when the
//!    stack can signal one, otherwise a fixed settle delay
//! 3. service discovery
//! 4. exactly one read of the consent characteristic
//! 5. decode, then upsert into the ledger
//!
//! If any step fails the link is torn down on a best-effort basis, the
//! peripheral stays disconnected and the ledger is untouched.

use crate::config::CentralConfig;
use crate::consent::codec::{ConsentCodec, ProtocolError};
use crate::consent::types::ConsentRecord;
use crate::store::{ConsentLedger, UpsertOutcome};
use crate::transport::abstraction::{GattCentral, Peripheral, PeripheralId, TransportError};
use crate::transport::ble::gatt::GattTarget;
use crate::transport::inflight::InFlight;
use crate::transport::registry::PeripheralRegistry;
use crate::AdpcError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What a successful connect produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub peripheral: Peripheral,
    pub record: ConsentRecord,
    pub stored: UpsertOutcome,
}

pub struct ConnectionManager {
    central: Arc<dyn GattCentral>,
    registry: Arc<PeripheralRegistry>,
    ledger: ConsentLedger,
    inflight: InFlight,
    config: CentralConfig,
    ready_waiters: Mutex<HashMap<PeripheralId, ReadyWaiter>>,
}

/// A connect waiting for `PeripheralReady`. Only a waiter whose link came
/// up can be cancelled by a disconnect; earlier disconnect events belong
/// to a previous link.
struct ReadyWaiter {
    tx: oneshot::Sender<()>,
    link_up: bool,
}

impl ConnectionManager {
    pub fn new(
        central: Arc<dyn GattCentral>,
        registry: Arc<PeripheralRegistry>,
        ledger: ConsentLedger,
        inflight: InFlight,
        config: CentralConfig,
    ) -> Self {
        Self {
            central,
            registry,
            ledger,
            inflight,
            config,
            ready_waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to a known peripheral, read its consent and store it
    pub async fn connect(&self, id: &PeripheralId) -> Result<ConnectOutcome, AdpcError> {
        let peripheral = self
            .registry
            .get(id)
            .ok_or_else(|| TransportError::UnknownPeripheral(id.to_string()))?;
        let _guard = self.inflight.acquire(id)?;

        // Register before connecting so an early ready event is not missed
        let ready = self
            .central
            .signals_ready()
            .then(|| self.register_ready_waiter(id));

        info!(peripheral = %id, "connecting");
        if let Err(e) = self
            .config
            .retry
            .run("connect", || self.central.connect(id))
            .await
        {
            self.ready_waiters.lock().remove(id);
            warn!(peripheral = %id, "connect failed: {}", e);
            return Err(e.into());
        }

        match self.read_and_store(&peripheral, ready).await {
            Ok(outcome) => {
                self.registry.mark_connected(id);
                info!(
                    peripheral = %id,
                    consent = %outcome.record.id,
                    "connected and consent read"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(peripheral = %id, "post-connect sequence failed: {}", e);
                self.ready_waiters.lock().remove(id);
                if let Err(disconnect_err) = self.central.disconnect(id).await {
                    debug!(peripheral = %id, "cleanup disconnect failed: {}", disconnect_err);
                }
                self.registry.mark_disconnected(id);
                Err(e)
            }
        }
    }

    /// Tear down the link. Stored consents are kept.
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<(), AdpcError> {
        if !self.registry.contains(id) {
            return Err(TransportError::UnknownPeripheral(id.to_string()).into());
        }
        let _guard = self.inflight.acquire(id)?;

        self.central.disconnect(id).await?;
        self.registry.mark_disconnected(id);
        info!(peripheral = %id, "disconnected");
        Ok(())
    }

    /// Disconnect and remove the bond with the host
    pub async fn forget(&self, id: &PeripheralId) -> Result<(), AdpcError> {
        if !self.registry.contains(id) {
            return Err(TransportError::UnknownPeripheral(id.to_string()).into());
        }
        let _guard = self.inflight.acquire(id)?;

        if let Err(e) = self.central.disconnect(id).await {
            debug!(peripheral = %id, "disconnect before unbond failed: {}", e);
        }
        self.registry.mark_disconnected(id);
        self.central.remove_bond(id).await?;
        self.registry.mark_bonded(id, false);
        info!(peripheral = %id, "bond removed");
        Ok(())
    }

    /// Deliver a `PeripheralReady` event to a pending connect
    pub fn notify_ready(&self, id: &PeripheralId) {
        if let Some(waiter) = self.ready_waiters.lock().remove(id) {
            let _ = waiter.tx.send(());
        } else {
            debug!(peripheral = %id, "ready event with no pending connect");
        }
    }

    /// Record that the link of a pending connect is up
    pub fn notify_link_up(&self, id: &PeripheralId) {
        if let Some(waiter) = self.ready_waiters.lock().get_mut(id) {
            waiter.link_up = true;
        }
    }

    /// Fail a pending ready wait because its link dropped
    pub fn notify_disconnected(&self, id: &PeripheralId) {
        let mut waiters = self.ready_waiters.lock();
        match waiters.get(id) {
            // Dropping the sender wakes the waiter with an error
            Some(waiter) if waiter.link_up => {
                waiters.remove(id);
            }
            Some(_) => debug!(peripheral = %id, "disconnect from a previous link ignored"),
            None => {}
        }
    }

    fn register_ready_waiter(&self, id: &PeripheralId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.ready_waiters
            .lock()
            .insert(id.clone(), ReadyWaiter { tx, link_up: false });
        rx
    }

    async fn wait_until_ready(
        &self,
        id: &PeripheralId,
        ready: Option<oneshot::Receiver<()>>,
    ) -> Result<(), TransportError> {
        match ready {
            Some(rx) => match tokio::time::timeout(self.config.ready_timeout(), rx).await {
                Ok(Ok(())) => {
                    debug!(peripheral = %id, "peripheral ready");
                    Ok(())
                }
                Ok(Err(_)) => Err(TransportError::ConnectFailed(format!(
                    "{} dropped before becoming ready",
                    id
                ))),
                Err(_) => Err(TransportError::ReadyTimeout(id.to_string())),
            },
            None => {
                tokio::time::sleep(self.config.settle_delay()).await;
                Ok(())
            }
        }
    }

    async fn read_and_store(
        &self,
        peripheral: &Peripheral,
        ready: Option<oneshot::Receiver<()>>,
    ) -> Result<ConnectOutcome, AdpcError> {
        let id = &peripheral.id;
        self.wait_until_ready(id, ready).await?;
        self.central.discover_services(id).await?;

        let target = GattTarget::CONSENT;
        let frame = self
            .central
            .read(id, target.service, target.characteristic)
            .await?;
        debug!(peripheral = %id, bytes = frame.len(), "consent frame read");

        let record = ConsentCodec::decode_record(&frame);
        if record.id.is_empty() {
            return Err(ProtocolError::MissingConsentId.into());
        }

        let device_name = peripheral.display_name();
        let stored = self
            .ledger
            .upsert(id.as_str(), device_name, record.clone())
            .await?;

        let mut peripheral = peripheral.clone();
        peripheral.connected = true;
        Ok(ConnectOutcome {
            peripheral,
            record,
            stored,
        })
    }
}
