/// GATT addressing and write-request validation for the consent service
///
/// Every peripheral exposes the same service with a single characteristic:
/// reading it yields a consent frame, writing it delivers a command
/// (acceptance list or delete). Commands are single unfragmented writes, so
/// they must fit in one characteristic value.

use crate::consent::codec::ProtocolError;
use crate::transport::abstraction::{CONSENT_CHARACTERISTIC_UUID, CONSENT_SERVICE_UUID};
use uuid::Uuid;

/// Maximum GATT characteristic value size (ATT protocol limit)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// Service/characteristic pair addressed by a GATT operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl GattTarget {
    /// The consent characteristic, fixed for the whole ecosystem
    pub const CONSENT: GattTarget = GattTarget {
        service: CONSENT_SERVICE_UUID,
        characteristic: CONSENT_CHARACTERISTIC_UUID,
    };
}

/// Kind of command carried by a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentCommand {
    Accept,
    Delete,
}

/// A validated write to the consent characteristic
#[derive(Debug, Clone)]
pub struct GattWriteRequest {
    pub target: GattTarget,
    pub command: ConsentCommand,
    pub data: Vec<u8>,
}

impl GattWriteRequest {
    /// Create a new write request
    pub fn new(command: ConsentCommand, data: Vec<u8>) -> Result<Self, ProtocolError> {
        if data.len() > MAX_CHARACTERISTIC_SIZE {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }
        Ok(Self {
            target: GattTarget::CONSENT,
            command,
            data,
        })
    }
}
