// Consent writer: acceptance and delete commands to a peripheral
//
// Commands are single writes with response to the consent characteristic.
// The link-level acknowledgement is the only completion signal; peripherals
// send no application-level reply. A delete does not touch the local
// ledger, callers pair it with `ConsentLedger::remove` themselves.

use super::codec::{ConsentCodec, ProtocolError};
use super::types::ConsentId;
use crate::transport::abstraction::{GattCentral, PeripheralId};
use crate::transport::ble::gatt::{ConsentCommand, GattWriteRequest};
use crate::transport::inflight::InFlight;
use crate::AdpcError;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ConsentWriter {
    central: Arc<dyn GattCentral>,
    inflight: InFlight,
}

impl ConsentWriter {
    pub fn new(central: Arc<dyn GattCentral>, inflight: InFlight) -> Self {
        Self { central, inflight }
    }

    /// Accept a single consent
    pub async fn give_consent(
        &self,
        peripheral: &PeripheralId,
        consent: &ConsentId,
    ) -> Result<(), AdpcError> {
        self.give_consents(peripheral, std::slice::from_ref(consent))
            .await
    }

    /// Accept several consents in one frame
    pub async fn give_consents(
        &self,
        peripheral: &PeripheralId,
        consents: &[ConsentId],
    ) -> Result<(), AdpcError> {
        let data = ConsentCodec::encode_acceptance(consents)?;
        let request = GattWriteRequest::new(ConsentCommand::Accept, data)?;
        self.send(peripheral, request).await?;
        info!(peripheral = %peripheral, count = consents.len(), "consent acceptance sent");
        Ok(())
    }

    /// Ask the peripheral to drop a consent. Fails before transmitting
    /// anything if the id carries no short code.
    pub async fn delete_consent(
        &self,
        peripheral: &PeripheralId,
        consent: &ConsentId,
    ) -> Result<(), AdpcError> {
        let data = ConsentCodec::encode_delete(consent).map_err(|e| {
            if let ProtocolError::MissingShortCode(_) = e {
                warn!(peripheral = %peripheral, consent = %consent, "delete rejected: no short code");
            }
            e
        })?;
        let request = GattWriteRequest::new(ConsentCommand::Delete, data)?;
        self.send(peripheral, request).await?;
        info!(peripheral = %peripheral, consent = %consent, "delete request sent");
        Ok(())
    }

    async fn send(
        &self,
        peripheral: &PeripheralId,
        request: GattWriteRequest,
    ) -> Result<(), AdpcError> {
        let _guard = self.inflight.acquire(peripheral)?;
        self.central
            .write(
                peripheral,
                request.target.service,
                request.target.characteristic,
                &request.data,
            )
            .await
            .map_err(|e| {
                warn!(peripheral = %peripheral, command = ?request.command, "write failed: {}", e);
                AdpcError::from(e)
            })
    }
}
