//! Transport abstraction layer for the consent central
//!
//! Defines the GATT-style central contract that platform Bluetooth stacks
//! implement, plus the events they push to the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Consent service UUID shared by every peripheral in the ecosystem
pub const CONSENT_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Consent characteristic UUID (read: consent frame, write: commands)
pub const CONSENT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Opaque platform identifier of a peripheral (MAC address, CoreBluetooth UUID, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A discoverable, connectable peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub id: PeripheralId,
    pub name: String,
    /// Signal strength in dBm at first sighting
    pub rssi: i16,
    pub connected: bool,
    pub bonded: bool,
}

impl Peripheral {
    /// A freshly advertised peripheral
    pub fn discovered(id: impl Into<PeripheralId>, name: impl Into<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
            connected: false,
            bonded: false,
        }
    }

    /// Name to show and persist; advertisements without a name fall back
    /// to a placeholder.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            UNKNOWN_DEVICE_NAME
        } else {
            &self.name
        }
    }
}

/// Placeholder for peripherals that advertise no name
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Host radio state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    On,
    Off,
    /// Resetting, unauthorized, unsupported, ...
    Other,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::On => write!(f, "on"),
            RadioState::Off => write!(f, "off"),
            RadioState::Other => write!(f, "other"),
        }
    }
}

/// Events from the platform Bluetooth stack to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Radio was switched on/off
    RadioStateChanged(RadioState),
    /// An advertisement was received (repeats allowed)
    PeripheralDiscovered {
        id: PeripheralId,
        name: String,
        rssi: i16,
    },
    /// Link-level connection established
    PeripheralConnected { id: PeripheralId },
    /// Connection is ready for GATT operations
    PeripheralReady { id: PeripheralId },
    /// Link dropped (remote or local)
    PeripheralDisconnected { id: PeripheralId },
    /// Discovery window elapsed or was stopped
    ScanStopped,
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::RadioStateChanged(state) => write!(f, "RadioStateChanged({})", state),
            TransportEvent::PeripheralDiscovered { id, name, rssi } => {
                write!(f, "PeripheralDiscovered {{ id: {}, name: {:?}, rssi: {} }}", id, name, rssi)
            }
            TransportEvent::PeripheralConnected { id } => {
                write!(f, "PeripheralConnected {{ id: {} }}", id)
            }
            TransportEvent::PeripheralReady { id } => write!(f, "PeripheralReady {{ id: {} }}", id),
            TransportEvent::PeripheralDisconnected { id } => {
                write!(f, "PeripheralDisconnected {{ id: {} }}", id)
            }
            TransportEvent::ScanStopped => write!(f, "ScanStopped"),
        }
    }
}

/// Errors for transport operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth radio unavailable")]
    RadioUnavailable,
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("Bond operation failed: {0}")]
    BondFailed(String),
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),
    #[error("Operation already in flight for {0}")]
    Busy(String),
    #[error("Peripheral {0} never became ready")]
    ReadyTimeout(String),
    #[error("Transport event channel closed")]
    EventChannelClosed,
}

impl TransportError {
    /// Whether a bounded retry may help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ScanFailed(_) | TransportError::ConnectFailed(_)
        )
    }
}

/// GATT central contract implemented by each platform Bluetooth stack.
///
/// Operations on one peripheral are serialized by the stack itself; the
/// core never issues two overlapping operations for the same id.
#[async_trait]
pub trait GattCentral: Send + Sync {
    /// Ask the host to switch the radio on
    async fn enable_radio(&self) -> Result<(), TransportError>;

    /// Begin a time-boxed discovery window. The stack emits
    /// `PeripheralDiscovered` per advertisement and `ScanStopped` at the end.
    async fn start_scan(
        &self,
        service_filters: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<(), TransportError>;

    /// Stop the current discovery window early
    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError>;

    async fn discover_services(&self, id: &PeripheralId) -> Result<(), TransportError>;

    async fn read(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    /// Write with response; `Ok` is the link-level acknowledgement
    async fn write(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError>;

    async fn remove_bond(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Peripherals previously bonded with this host
    async fn bonded_peripherals(&self) -> Result<Vec<Peripheral>, TransportError>;

    /// Whether the stack emits `PeripheralReady` after a connection.
    /// Stacks that don't are given a fixed settle delay instead.
    fn signals_ready(&self) -> bool {
        false
    }
}
