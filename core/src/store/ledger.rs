//! Consent ledger: persisted consents keyed by peripheral
//!
//! The whole ledger is one JSON document (an array of
//! [`DeviceConsentEntry`]) under a single storage key. Mutations are
//! load-modify-rewrite of that document, so they are funnelled through one
//! writer task: callers send commands over an `mpsc` queue and await the
//! outcome on a `oneshot`. Reads go straight to the backend and always
//! re-parse the stored document.
//!
//! Reads treat a document that cannot be read or parsed as an empty
//! ledger. Mutations never do: a backend read error fails the mutation
//! with nothing written, and an unparsable document is copied to a backup
//! key before a fresh one replaces it.

use super::backend::StorageBackend;
use super::PersistenceError;
use crate::consent::types::{ConsentRecord, DeviceConsentEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Depth of the mutation queue
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Appended to the ledger key to name the copy of an unparsable document
pub const CORRUPT_BACKUP_SUFFIX: &str = ".corrupt";

/// Result of [`LedgerDocument::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First consent for this peripheral; a new entry was appended
    CreatedEntry,
    /// Consent appended to an existing entry
    Appended,
    /// A consent with the same id was already stored; nothing changed
    Duplicate,
}

/// Result of [`LedgerDocument::remove`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Consent removed, other consents remain
    Removed,
    /// Last consent removed, the whole entry is gone
    EntryRemoved,
    /// No such peripheral or consent
    NotFound,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, UpsertOutcome::Duplicate)
    }
}

impl RemoveOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, RemoveOutcome::NotFound)
    }
}

/// In-memory form of the ledger document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerDocument {
    entries: Vec<DeviceConsentEntry>,
}

impl LedgerDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<DeviceConsentEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[DeviceConsentEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DeviceConsentEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, peripheral_id: &str) -> Option<&DeviceConsentEntry> {
        self.entries
            .iter()
            .find(|e| e.peripheral_id == peripheral_id)
    }

    pub fn find(&self, peripheral_id: &str, consent_id: &str) -> Option<&ConsentRecord> {
        self.entry(peripheral_id)?.consent(consent_id)
    }

    /// Insert `record` under `peripheral_id`. An existing consent with the
    /// same id is left as is, including its fields.
    pub fn upsert(
        &mut self,
        peripheral_id: &str,
        device_name: &str,
        record: ConsentRecord,
    ) -> UpsertOutcome {
        match self
            .entries
            .iter_mut()
            .find(|e| e.peripheral_id == peripheral_id)
        {
            None => {
                let mut entry = DeviceConsentEntry::new(peripheral_id, device_name);
                entry.consents.push(record);
                self.entries.push(entry);
                UpsertOutcome::CreatedEntry
            }
            Some(entry) if entry.consents.iter().any(|c| c.id == record.id) => {
                UpsertOutcome::Duplicate
            }
            Some(entry) => {
                entry.consents.push(record);
                UpsertOutcome::Appended
            }
        }
    }

    /// Drop `consent_id` from `peripheral_id`; an entry left without
    /// consents is removed entirely.
    pub fn remove(&mut self, peripheral_id: &str, consent_id: &str) -> RemoveOutcome {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.peripheral_id == peripheral_id)
        else {
            return RemoveOutcome::NotFound;
        };

        let entry = &mut self.entries[pos];
        let before = entry.consents.len();
        entry.consents.retain(|c| c.id != *consent_id);
        if entry.consents.len() == before {
            return RemoveOutcome::NotFound;
        }
        if entry.consents.is_empty() {
            self.entries.remove(pos);
            RemoveOutcome::EntryRemoved
        } else {
            RemoveOutcome::Removed
        }
    }

    /// Case-insensitive filter. A device whose name matches keeps every
    /// consent; otherwise only matching consents are kept and devices left
    /// with none are dropped. An empty query returns everything.
    pub fn search(&self, query: &str) -> Vec<DeviceConsentEntry> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.entries.clone();
        }
        self.entries
            .iter()
            .filter_map(|entry| {
                if entry.device_name.to_lowercase().contains(&query) {
                    return Some(entry.clone());
                }
                let consents: Vec<ConsentRecord> = entry
                    .consents
                    .iter()
                    .filter(|c| c.matches(&query))
                    .cloned()
                    .collect();
                if consents.is_empty() {
                    None
                } else {
                    Some(DeviceConsentEntry {
                        consents,
                        ..entry.clone()
                    })
                }
            })
            .collect()
    }

    /// Load the document stored under `key`. A missing document is an
    /// empty ledger; backend and parse failures are returned.
    pub fn try_load(backend: &dyn StorageBackend, key: &str) -> Result<Self, PersistenceError> {
        match backend.get(key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PersistenceError::Corrupt(e.to_string())),
            None => Ok(Self::new()),
        }
    }

    /// Load for reading; missing, unreadable or unparsable documents yield
    /// an empty ledger.
    pub fn load(backend: &dyn StorageBackend, key: &str) -> Self {
        Self::try_load(backend, key).unwrap_or_else(|e| {
            warn!("consent ledger unavailable, reading as empty: {}", e);
            Self::new()
        })
    }

    /// Rewrite the whole document under `key`. An empty ledger is stored
    /// as no document.
    pub fn save(&self, backend: &dyn StorageBackend, key: &str) -> Result<(), PersistenceError> {
        if self.is_empty() {
            backend.remove(key.as_bytes())?;
        } else {
            let bytes = serde_json::to_vec(self)
                .map_err(|e| PersistenceError::Serialize(e.to_string()))?;
            backend.put(key.as_bytes(), &bytes)?;
        }
        backend.flush()
    }
}

/// Load the document a mutation will rewrite
fn load_for_write(
    backend: &dyn StorageBackend,
    key: &str,
) -> Result<LedgerDocument, PersistenceError> {
    match LedgerDocument::try_load(backend, key) {
        Err(PersistenceError::Corrupt(reason)) => {
            let backup = format!("{}{}", key, CORRUPT_BACKUP_SUFFIX);
            let bytes = backend.get(key.as_bytes())?.unwrap_or_default();
            backend.put(backup.as_bytes(), &bytes)?;
            backend.flush()?;
            warn!(backup = %backup, "consent ledger unparsable ({}), moved aside", reason);
            Ok(LedgerDocument::new())
        }
        other => other,
    }
}

/// Load, apply `mutation` and persist when it changed something
fn apply<T: Copy>(
    backend: &dyn StorageBackend,
    key: &str,
    mutation: impl FnOnce(&mut LedgerDocument) -> T,
    changed: impl Fn(T) -> bool,
) -> Result<T, PersistenceError> {
    let mut document = load_for_write(backend, key)?;
    let outcome = mutation(&mut document);
    if changed(outcome) {
        document.save(backend, key)?;
    }
    Ok(outcome)
}

enum LedgerCommand {
    Upsert {
        peripheral_id: String,
        device_name: String,
        record: ConsentRecord,
        reply: oneshot::Sender<Result<UpsertOutcome, PersistenceError>>,
    },
    Remove {
        peripheral_id: String,
        consent_id: String,
        reply: oneshot::Sender<Result<RemoveOutcome, PersistenceError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the persisted ledger. Cheap to clone; all clones share the
/// same writer task.
#[derive(Clone)]
pub struct ConsentLedger {
    backend: Arc<dyn StorageBackend>,
    key: Arc<str>,
    commands: mpsc::Sender<LedgerCommand>,
}

impl ConsentLedger {
    /// Start the writer task on the current tokio runtime
    pub fn spawn(backend: Arc<dyn StorageBackend>, key: impl Into<String>) -> Self {
        let key: Arc<str> = Arc::from(key.into());
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(run_writer(backend.clone(), key.clone(), rx));
        Self {
            backend,
            key,
            commands,
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.key
    }

    /// Store `record` for `peripheral_id` unless a consent with the same id
    /// is already there.
    pub async fn upsert(
        &self,
        peripheral_id: &str,
        device_name: &str,
        record: ConsentRecord,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::Upsert {
            peripheral_id: peripheral_id.to_string(),
            device_name: device_name.to_string(),
            record,
            reply,
        })
        .await?;
        rx.await.map_err(|_| PersistenceError::WriterStopped)?
    }

    /// Remove one consent. Does not transmit anything to the peripheral.
    pub async fn remove(
        &self,
        peripheral_id: &str,
        consent_id: &str,
    ) -> Result<RemoveOutcome, PersistenceError> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::Remove {
            peripheral_id: peripheral_id.to_string(),
            consent_id: consent_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| PersistenceError::WriterStopped)?
    }

    /// Look up one consent, re-reading the stored document
    pub fn query(&self, peripheral_id: &str, consent_id: &str) -> Option<ConsentRecord> {
        self.document().find(peripheral_id, consent_id).cloned()
    }

    pub fn entry(&self, peripheral_id: &str) -> Option<DeviceConsentEntry> {
        self.document().entry(peripheral_id).cloned()
    }

    pub fn list(&self) -> Vec<DeviceConsentEntry> {
        self.document().into_entries()
    }

    pub fn search(&self, query: &str) -> Vec<DeviceConsentEntry> {
        self.document().search(query)
    }

    /// Current stored document
    pub fn document(&self) -> LedgerDocument {
        LedgerDocument::load(self.backend.as_ref(), &self.key)
    }

    /// Stop the writer after it drains queued commands. Other clones of
    /// this handle get `WriterStopped` afterwards.
    pub async fn close(self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(LedgerCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: LedgerCommand) -> Result<(), PersistenceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PersistenceError::WriterStopped)
    }
}

async fn run_writer(
    backend: Arc<dyn StorageBackend>,
    key: Arc<str>,
    mut rx: mpsc::Receiver<LedgerCommand>,
) {
    debug!(key = %key, "ledger writer started");
    let mut shutdown = None;

    while let Some(command) = rx.recv().await {
        match command {
            LedgerCommand::Upsert {
                peripheral_id,
                device_name,
                record,
                reply,
            } => {
                let consent_id = record.id.clone();
                let result = apply(
                    backend.as_ref(),
                    &key,
                    |document| document.upsert(&peripheral_id, &device_name, record),
                    UpsertOutcome::changed,
                );
                match &result {
                    Ok(UpsertOutcome::Duplicate) => {
                        debug!(peripheral = %peripheral_id, consent = %consent_id, "consent already stored")
                    }
                    Ok(_) => {
                        info!(peripheral = %peripheral_id, consent = %consent_id, "consent stored")
                    }
                    Err(e) => warn!(peripheral = %peripheral_id, "failed to persist consent: {}", e),
                }
                let _ = reply.send(result);
            }
            LedgerCommand::Remove {
                peripheral_id,
                consent_id,
                reply,
            } => {
                let result = apply(
                    backend.as_ref(),
                    &key,
                    |document| document.remove(&peripheral_id, &consent_id),
                    RemoveOutcome::changed,
                );
                match &result {
                    Ok(RemoveOutcome::NotFound) => {
                        debug!(peripheral = %peripheral_id, consent = %consent_id, "nothing to remove")
                    }
                    Ok(_) => {
                        info!(peripheral = %peripheral_id, consent = %consent_id, "consent removed")
                    }
                    Err(e) => warn!(peripheral = %peripheral_id, "failed to persist removal: {}", e),
                }
                let _ = reply.send(result);
            }
            LedgerCommand::Shutdown { reply } => {
                shutdown = Some(reply);
                break;
            }
        }
    }

    drop(rx);
    if let Err(e) = backend.flush() {
        warn!("ledger flush on shutdown failed: {}", e);
    }
    drop(backend);
    debug!("ledger writer stopped");
    if let Some(reply) = shutdown {
        let _ = reply.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::types::ConsentId;
    use crate::store::backend::MemoryStorage;

    const KEY: &str = "@devicesConsents";

    fn record(id: &str) -> ConsentRecord {
        ConsentRecord {
            id: ConsentId::new(id),
            summary: format!("summary of {}", id),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_creates_then_appends() {
        let mut doc = LedgerDocument::new();
        assert_eq!(doc.upsert("P1", "Router", record("q1")), UpsertOutcome::CreatedEntry);
        assert_eq!(doc.upsert("P1", "Router", record("q2")), UpsertOutcome::Appended);
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.entry("P1").map(|e| e.consents.len()), Some(2));
    }

    #[test]
    fn test_upsert_duplicate_keeps_original_fields() {
        let mut doc = LedgerDocument::new();
        doc.upsert("P1", "Router", record("q1"));

        let mut changed = record("q1");
        changed.summary = "different".to_string();
        assert_eq!(doc.upsert("P1", "Router", changed), UpsertOutcome::Duplicate);

        let entry = doc.entry("P1").expect("entry");
        assert_eq!(entry.consents.len(), 1);
        assert_eq!(entry.consents[0].summary, "summary of q1");
    }

    #[test]
    fn test_remove_last_consent_drops_entry() {
        let mut doc = LedgerDocument::new();
        doc.upsert("P1", "Router", record("q1"));
        doc.upsert("P2", "Lamp", record("q1"));

        assert_eq!(doc.remove("P1", "q1"), RemoveOutcome::EntryRemoved);
        assert!(doc.entry("P1").is_none());
        assert!(doc.entry("P2").is_some());
    }

    #[test]
    fn test_remove_keeps_other_consents_and_name() {
        let mut doc = LedgerDocument::new();
        doc.upsert("P1", "Router", record("q1"));
        doc.upsert("P1", "Router", record("q2"));
        doc.upsert("P1", "Router", record("q3"));

        assert_eq!(doc.remove("P1", "q2"), RemoveOutcome::Removed);
        let entry = doc.entry("P1").expect("entry");
        assert_eq!(entry.device_name, "Router");
        let ids: Vec<&str> = entry.consents.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q3"]);
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let mut doc = LedgerDocument::new();
        doc.upsert("P1", "Router", record("q1"));
        assert_eq!(doc.remove("P1", "q9"), RemoveOutcome::NotFound);
        assert_eq!(doc.remove("P9", "q1"), RemoveOutcome::NotFound);
        assert_eq!(doc.entry("P1").map(|e| e.consents.len()), Some(1));
    }

    #[test]
    fn test_search_by_device_name_keeps_all_consents() {
        let mut doc = LedgerDocument::new();
        doc.upsert("P1", "Kitchen Camera", record("q1"));
        doc.upsert("P1", "Kitchen Camera", record("q2"));
        doc.upsert("P2", "Router", record("q3"));

        let result = doc.search("KITCHEN");
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].consents.len(), 2);
    }

    #[test]
    fn test_search_by_consent_field_filters_consents() {
        let mut doc = LedgerDocument::new();
        let mut located = record("q1");
        located.location = "Server in Frankfurt".to_string();
        doc.upsert("P1", "Router", located);
        doc.upsert("P1", "Router", record("q2"));
        doc.upsert("P2", "Lamp", record("q3"));

        let result = doc.search("frankfurt");
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].peripheral_id, "P1");
        assert_eq!(result[0].consents.len(), 1);
        assert_eq!(result[0].consents[0].id, "q1");

        assert_eq!(doc.search("  ").len(), 2);
        assert!(doc.search("nothing like this").is_empty());
    }

    #[test]
    fn test_document_json_layout() {
        let mut doc = LedgerDocument::new();
        doc.upsert("P1", "Router", record("q1"));
        let json: serde_json::Value = serde_json::to_value(&doc).expect("serialize");

        let entry = &json[0];
        assert_eq!(entry["peripheralId"], "P1");
        assert_eq!(entry["deviceName"], "Router");
        assert_eq!(entry["consents"][0]["id"], "q1");
        assert!(entry["consents"][0].get("dataCategory").is_some());
        assert!(entry["consents"][0].get("legalBases").is_some());
    }

    #[test]
    fn test_unparsable_document_loads_empty() {
        let storage = MemoryStorage::new();
        storage.put(KEY.as_bytes(), b"{not json").expect("put");
        assert!(LedgerDocument::load(&storage, KEY).is_empty());
    }

    /// Memory storage whose next `failing_reads` gets fail
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        failing_reads: std::sync::atomic::AtomicUsize,
    }

    impl FlakyStorage {
        fn fail_reads(&self, count: usize) {
            self.failing_reads
                .store(count, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl StorageBackend for FlakyStorage {
        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError> {
            self.inner.put(key, value)
        }

        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError> {
            use std::sync::atomic::Ordering;
            let left = self.failing_reads.load(Ordering::SeqCst);
            if left > 0 {
                self.failing_reads.store(left - 1, Ordering::SeqCst);
                return Err(PersistenceError::Backend("read timed out".to_string()));
            }
            self.inner.get(key)
        }

        fn remove(&self, key: &[u8]) -> Result<(), PersistenceError> {
            self.inner.remove(key)
        }

        fn flush(&self) -> Result<(), PersistenceError> {
            self.inner.flush()
        }
    }

    #[test]
    fn test_try_load_reports_failures() {
        let storage = FlakyStorage::default();
        assert!(LedgerDocument::try_load(&storage, KEY).expect("missing").is_empty());

        storage.fail_reads(1);
        assert!(matches!(
            LedgerDocument::try_load(&storage, KEY),
            Err(PersistenceError::Backend(_))
        ));

        storage.put(KEY.as_bytes(), b"{not json").expect("put");
        assert!(matches!(
            LedgerDocument::try_load(&storage, KEY),
            Err(PersistenceError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_mutation_during_read_error_keeps_ledger() {
        let storage = Arc::new(FlakyStorage::default());
        let ledger = ConsentLedger::spawn(storage.clone(), KEY);
        for id in ["q1", "q2", "q3"] {
            ledger.upsert("P1", "Router", record(id)).await.expect("upsert");
        }
        ledger.upsert("P2", "Lamp", record("q9")).await.expect("upsert");

        storage.fail_reads(1);
        let result = ledger.upsert("P3", "Camera", record("q5")).await;
        assert!(matches!(result, Err(PersistenceError::Backend(_))));

        storage.fail_reads(1);
        let result = ledger.remove("P1", "q1").await;
        assert!(matches!(result, Err(PersistenceError::Backend(_))));

        let entries = ledger.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(ledger.entry("P1").map(|e| e.consents.len()), Some(3));
        assert!(ledger.entry("P3").is_none());

        // The next mutation goes through normally
        ledger.upsert("P3", "Camera", record("q5")).await.expect("upsert");
        assert_eq!(ledger.list().len(), 3);
    }

    #[tokio::test]
    async fn test_unparsable_document_is_backed_up_before_rewrite() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put(KEY.as_bytes(), b"{not json").expect("put");
        let ledger = ConsentLedger::spawn(storage.clone(), KEY);

        ledger.upsert("P1", "Router", record("q1")).await.expect("upsert");

        let backup = format!("{}{}", KEY, CORRUPT_BACKUP_SUFFIX);
        assert_eq!(
            storage.get(backup.as_bytes()).expect("get"),
            Some(b"{not json".to_vec())
        );
        assert_eq!(ledger.list().len(), 1);
    }

    #[tokio::test]
    async fn test_writer_persists_mutations() {
        let storage = Arc::new(MemoryStorage::new());
        let ledger = ConsentLedger::spawn(storage.clone(), KEY);

        let outcome = ledger.upsert("P1", "Router", record("q1")).await.expect("upsert");
        assert_eq!(outcome, UpsertOutcome::CreatedEntry);
        assert_eq!(ledger.query("P1", "q1").map(|r| r.summary), Some("summary of q1".into()));
        assert!(storage.get(KEY.as_bytes()).expect("get").is_some());

        let outcome = ledger.remove("P1", "q1").await.expect("remove");
        assert_eq!(outcome, RemoveOutcome::EntryRemoved);
        assert!(ledger.list().is_empty());
        assert!(storage.get(KEY.as_bytes()).expect("get").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_are_not_lost() {
        let storage = Arc::new(MemoryStorage::new());
        let ledger = ConsentLedger::spawn(storage, KEY);

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .upsert("P1", "Router", record(&format!("q{}", i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("upsert");
        }

        assert_eq!(ledger.entry("P1").map(|e| e.consents.len()), Some(20));
    }

    #[tokio::test]
    async fn test_closed_writer_reports_stopped() {
        let ledger = ConsentLedger::spawn(Arc::new(MemoryStorage::new()), KEY);
        let other = ledger.clone();
        ledger.close().await;

        assert_eq!(
            other.upsert("P1", "Router", record("q1")).await,
            Err(PersistenceError::WriterStopped)
        );
    }
}
