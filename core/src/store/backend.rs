// Key/value storage abstraction for the consent documents

use super::PersistenceError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Byte-oriented store; each document lives under a single key
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn remove(&self, key: &[u8]) -> Result<(), PersistenceError>;
    fn flush(&self) -> Result<(), PersistenceError>;
}

/// In-memory storage for tests and ephemeral runs
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), PersistenceError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let db = sled::open(path).map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError> {
        self.db
            .insert(key, value)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError> {
        let value = self
            .db
            .get(key)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), PersistenceError> {
        self.db
            .remove(key)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), PersistenceError> {
        self.db
            .flush()
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }
}
