// Per-peripheral busy flags
//
// A connect, disconnect or command write holds the flag for its peripheral
// until the guard drops; a second operation on the same id is rejected
// instead of interleaving with the first.

use super::abstraction::{PeripheralId, TransportError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct InFlight {
    busy: Arc<Mutex<HashSet<PeripheralId>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`, or fail with `Busy` if another operation holds it
    pub fn acquire(&self, id: &PeripheralId) -> Result<InFlightGuard, TransportError> {
        let mut busy = self.busy.lock();
        if !busy.insert(id.clone()) {
            return Err(TransportError::Busy(id.to_string()));
        }
        Ok(InFlightGuard {
            busy: self.busy.clone(),
            id: id.clone(),
        })
    }

    pub fn is_busy(&self, id: &PeripheralId) -> bool {
        self.busy.lock().contains(id)
    }
}

pub struct InFlightGuard {
    busy: Arc<Mutex<HashSet<PeripheralId>>>,
    id: PeripheralId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.id);
    }
}
