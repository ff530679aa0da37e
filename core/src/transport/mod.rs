// Transport module: GATT central contract, discovery and connections

pub mod abstraction;
pub mod ble;
pub mod inflight;
pub mod manager;
pub mod registry;
pub mod retry;

pub use abstraction::{
    GattCentral, Peripheral, PeripheralId, RadioState, TransportError, TransportEvent,
    CONSENT_CHARACTERISTIC_UUID, CONSENT_SERVICE_UUID,
};
pub use ble::{ScanController, ScanStart, ScannerState};
pub use inflight::InFlight;
pub use manager::{ConnectOutcome, ConnectionManager};
pub use registry::PeripheralRegistry;
pub use retry::RetryPolicy;
