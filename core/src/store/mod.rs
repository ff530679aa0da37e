// Store module: consent ledger and device registrations

pub mod backend;
pub mod ledger;
pub mod registrations;

use thiserror::Error;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use ledger::{ConsentLedger, CORRUPT_BACKUP_SUFFIX, LedgerDocument, RemoveOutcome, UpsertOutcome};
pub use registrations::{DeviceRegistry, RegisteredDevice, REGISTRATIONS_KEY};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Stored document unparsable: {0}")]
    Corrupt(String),
    #[error("Ledger writer has stopped")]
    WriterStopped,
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),
}
