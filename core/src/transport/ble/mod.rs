/// BLE central pieces that sit on top of the transport contract
///
/// - **scanner**: discovery window state machine
/// - **gatt**: consent service addressing and write-request validation

pub mod gatt;
pub mod scanner;

pub use gatt::{ConsentCommand, GattTarget, GattWriteRequest, MAX_CHARACTERISTIC_SIZE};
pub use scanner::{ScanController, ScanStart, ScannerState};
